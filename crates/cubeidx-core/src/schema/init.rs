//! Create or upgrade the base schema.
//!
//! The version marker is read inside the same transaction that applies the
//! revisions, so when two initializers race the loser either waits for the
//! winner and then takes the update path, or fails with a transient error.

use super::{check_core_tables, check_revision, schema_version};
use crate::catalog;
use crate::context::IndexContext;
use crate::error::{Error, Result, is_busy};
use crate::lock::LockCoordinator;

const MARKER_TABLE: &str = "schema_meta";
const GRANT_TABLE: &str = "role_grant";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOptions {
    /// Insert the bundled metadata types that are not present yet.
    pub with_default_types: bool,
    /// Seed roles and grant the configured user admin.
    pub with_permissions: bool,
    /// Create backend extension tables (S3 storage).
    pub with_extension_tables: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            with_default_types: true,
            with_permissions: true,
            with_extension_tables: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    /// `true` when this call created the base schema.
    pub created: bool,
    /// Revision the schema is at afterwards.
    pub revision: u32,
    pub default_types_added: Vec<String>,
    pub extension_tables: bool,
}

/// Create the base schema if absent, otherwise apply pending revisions.
///
/// Schema changes commit before the permission step runs, so a failing grant
/// leaves the schema in place and surfaces as [`Error::Permission`].
pub fn initialize(
    ctx: &mut IndexContext,
    opts: &InitOptions,
    locks: &mut LockCoordinator,
) -> Result<InitOutcome> {
    let backend = ctx.backend.as_ref();
    if opts.with_extension_tables && !backend.supports_extension_tables() {
        return Err(Error::Unsupported {
            backend: backend.name(),
            capability: "extension tables",
        });
    }
    if opts.with_permissions && !backend.supports_permissions() {
        return Err(Error::Unsupported {
            backend: backend.name(),
            capability: "permission grants",
        });
    }

    let outcome = locks
        .with_optional_lock(&mut ctx.conn, MARKER_TABLE, |tx| {
            let existing = schema_version(tx)?;
            let from = match existing {
                Some(version) => {
                    check_revision(version)?;
                    check_core_tables(tx)?;
                    log::info!("schema found at revision {}", version);
                    version
                }
                None => {
                    log::info!("no schema found, creating revision {}", super::latest_revision());
                    0
                }
            };
            let revision = backend.create_base(tx, from)?;

            let default_types_added = if opts.with_default_types {
                catalog::seed_default_types(tx)?
            } else {
                Vec::new()
            };
            if opts.with_extension_tables {
                backend.create_extension(tx)?;
            }

            Ok(InitOutcome {
                created: existing.is_none(),
                revision,
                default_types_added,
                extension_tables: opts.with_extension_tables,
            })
        })
        .map_err(|e| match e {
            Error::Sql(ref source) if is_busy(source) => Error::schema_transient(format!(
                "another process is initialising the schema: {}",
                source
            )),
            other => other,
        })?;

    if opts.with_permissions {
        let username = ctx.config.db_username.as_deref();
        locks
            .with_optional_lock(&mut ctx.conn, GRANT_TABLE, |tx| {
                backend.grant_permissions(tx, username)
            })
            .map_err(|e| match e {
                Error::Permission(_) => e,
                other => Error::Permission(other.to_string()),
            })?;
        log::info!("permissions granted");
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DriverKind};
    use crate::context::OpenMode;
    use crate::schema::backend::{S3_TABLES, SchemaBackend};
    use crate::schema::{MIGRATIONS, latest_revision, table_exists};
    use rusqlite::{Connection, TransactionBehavior};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config_at(dir: &TempDir) -> Config {
        Config {
            db_database: dir.path().join("init.db").to_string_lossy().into_owned(),
            db_username: Some("alice".to_string()),
            ..Config::default()
        }
    }

    fn open(dir: &TempDir) -> IndexContext {
        IndexContext::connect(config_at(dir), OpenMode::Create).unwrap()
    }

    fn ddl_snapshot(conn: &Connection) -> Vec<(String, String, Option<String>)> {
        conn.prepare("SELECT type, name, sql FROM sqlite_master ORDER BY type, name")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn first_call_creates_then_updates() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open(&dir);
        let mut locks = LockCoordinator::new(true);
        let opts = InitOptions::default();

        let first = initialize(&mut ctx, &opts, &mut locks).unwrap();
        assert!(first.created);
        assert_eq!(first.revision, latest_revision());
        assert_eq!(first.default_types_added, vec!["eo", "telemetry"]);

        let second = initialize(&mut ctx, &opts, &mut locks).unwrap();
        assert!(!second.created);
        assert!(second.default_types_added.is_empty());
        let snapshot = ddl_snapshot(&ctx.conn);

        let third = initialize(&mut ctx, &opts, &mut locks).unwrap();
        assert!(!third.created);
        assert_eq!(ddl_snapshot(&ctx.conn), snapshot);
    }

    #[test]
    fn without_default_types_catalog_stays_empty() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open(&dir);
        let opts = InitOptions {
            with_default_types: false,
            ..InitOptions::default()
        };
        initialize(&mut ctx, &opts, &mut LockCoordinator::new(true)).unwrap();
        let types: i64 = ctx
            .conn
            .query_row("SELECT COUNT(*) FROM metadata_type", [], |row| row.get(0))
            .unwrap();
        assert_eq!(types, 0);
    }

    #[test]
    fn update_path_seeds_missing_default_types() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open(&dir);
        let mut locks = LockCoordinator::new(true);
        let bare = InitOptions {
            with_default_types: false,
            ..InitOptions::default()
        };
        initialize(&mut ctx, &bare, &mut locks).unwrap();
        let outcome = initialize(&mut ctx, &InitOptions::default(), &mut locks).unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.default_types_added.len(), 2);
    }

    #[test]
    fn extension_tables_require_capability() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open(&dir);
        let opts = InitOptions {
            with_extension_tables: true,
            ..InitOptions::default()
        };
        let err = initialize(&mut ctx, &opts, &mut LockCoordinator::new(true)).unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported {
                backend: "default",
                capability: "extension tables"
            }
        ));
        // Rejected before any DDL.
        assert!(!table_exists(&ctx.conn, "schema_meta").unwrap());
    }

    #[test]
    fn s3_backend_creates_extension_tables() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            driver: DriverKind::S3aio,
            ..config_at(&dir)
        };
        let mut ctx = IndexContext::connect(config, OpenMode::Create).unwrap();
        let opts = InitOptions {
            with_extension_tables: true,
            ..InitOptions::default()
        };
        let outcome = initialize(&mut ctx, &opts, &mut LockCoordinator::new(false)).unwrap();
        assert!(outcome.extension_tables);
        for table in S3_TABLES {
            assert!(table_exists(&ctx.conn, table).unwrap());
        }
    }

    struct DenyingBackend;

    impl SchemaBackend for DenyingBackend {
        fn name(&self) -> &'static str {
            "denying"
        }

        fn supports_permissions(&self) -> bool {
            true
        }

        fn grant_permissions(&self, _conn: &Connection, _username: Option<&str>) -> Result<()> {
            Err(Error::Permission("role table is read-only".to_string()))
        }
    }

    #[test]
    fn permission_failure_keeps_schema() {
        let dir = TempDir::new().unwrap();
        let mut ctx = IndexContext::connect_with_backend(
            config_at(&dir),
            OpenMode::Create,
            Box::new(DenyingBackend),
        )
        .unwrap();
        let err = initialize(&mut ctx, &InitOptions::default(), &mut LockCoordinator::new(true))
            .unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
        assert_eq!(schema_version(&ctx.conn).unwrap(), Some(latest_revision()));

        // The retry takes the update path.
        let opts = InitOptions {
            with_permissions: false,
            ..InitOptions::default()
        };
        let outcome = initialize(&mut ctx, &opts, &mut LockCoordinator::new(true)).unwrap();
        assert!(!outcome.created);
    }

    #[test]
    fn revision_one_database_is_upgraded() {
        let dir = TempDir::new().unwrap();
        {
            let conn = Connection::open(dir.path().join("init.db")).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_meta (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
                );",
            )
            .unwrap();
            conn.execute_batch(MIGRATIONS[0].sql).unwrap();
            conn.execute("INSERT INTO schema_meta (version) VALUES (1)", [])
                .unwrap();
        }
        let mut ctx = open(&dir);
        let outcome =
            initialize(&mut ctx, &InitOptions::default(), &mut LockCoordinator::new(true))
                .unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.revision, latest_revision());
    }

    #[test]
    fn corrupt_schema_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open(&dir);
        let mut locks = LockCoordinator::new(true);
        initialize(&mut ctx, &InitOptions::default(), &mut locks).unwrap();
        ctx.conn.execute_batch("DROP TABLE role_member;").unwrap();
        let err = initialize(&mut ctx, &InitOptions::default(), &mut locks).unwrap_err();
        assert!(matches!(err, Error::Schema { transient: false, .. }));
    }

    /// Hold a write transaction that creates the schema until `release` fires.
    fn racing_winner(
        path: std::path::PathBuf,
        started: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut conn = Connection::open(path).unwrap();
            conn.pragma_update(None, "journal_mode", "wal").unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Exclusive)
                .unwrap();
            crate::schema::apply_migrations(&tx, 0).unwrap();
            started.send(()).unwrap();
            release.recv().unwrap();
            tx.commit().unwrap();
        })
    }

    #[test]
    fn locked_race_loser_takes_update_path() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open(&dir);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let winner = racing_winner(dir.path().join("init.db"), started_tx, release_rx);
        started_rx.recv().unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            release_tx.send(()).unwrap();
        });
        // Blocks on the exclusive lock until the winner commits.
        let outcome =
            initialize(&mut ctx, &InitOptions::default(), &mut LockCoordinator::new(true))
                .unwrap();
        assert!(!outcome.created);
        releaser.join().unwrap();
        winner.join().unwrap();
    }

    #[test]
    fn unlocked_race_loser_gets_transient_error() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            busy_timeout_secs: 0,
            ..config_at(&dir)
        };
        let mut ctx = IndexContext::connect(config, OpenMode::Create).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let winner = racing_winner(dir.path().join("init.db"), started_tx, release_rx);
        started_rx.recv().unwrap();

        let err = initialize(&mut ctx, &InitOptions::default(), &mut LockCoordinator::new(false))
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");

        release_tx.send(()).unwrap();
        winner.join().unwrap();
        let outcome =
            initialize(&mut ctx, &InitOptions::default(), &mut LockCoordinator::new(false))
                .unwrap();
        assert!(!outcome.created);
    }
}
