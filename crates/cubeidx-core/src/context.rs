//! The per-run context threaded through every component.
//!
//! One `IndexContext` is built per invocation: it owns the database connection,
//! the selected schema backend, and the resolved config. Nothing is cached in
//! globals, so two contexts over different databases never interfere.

use crate::config::{Config, DriverKind};
use crate::error::{Error, Result};
use crate::schema::backend::{S3IndexBackend, SchemaBackend, SqliteBackend};
use rusqlite::{Connection, OpenFlags};
use std::time::Duration;

/// Whether opening may create the database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the file if it does not exist (used by `system init`).
    Create,
    /// Fail with a connection error if the file is missing.
    Existing,
}

pub struct IndexContext {
    pub conn: Connection,
    pub config: Config,
    pub(crate) backend: Box<dyn SchemaBackend>,
}

impl IndexContext {
    /// Connect using the backend named by `config.driver`.
    pub fn connect(config: Config, mode: OpenMode) -> Result<Self> {
        let backend: Box<dyn SchemaBackend> = match config.driver {
            DriverKind::Default => Box::new(SqliteBackend),
            DriverKind::S3aio => Box::new(S3IndexBackend::default()),
        };
        Self::connect_with_backend(config, mode, backend)
    }

    /// Connect with an explicitly chosen backend.
    pub fn connect_with_backend(
        config: Config,
        mode: OpenMode,
        backend: Box<dyn SchemaBackend>,
    ) -> Result<Self> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if mode == OpenMode::Create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        let conn = Connection::open_with_flags(&config.db_database, flags)
            .and_then(|conn| {
                configure(&conn, config.busy_timeout_secs)?;
                Ok(conn)
            })
            .map_err(|source| Error::Connection {
                target: config.target(),
                source,
            })?;

        log::debug!(
            "connected to {} (backend: {})",
            config.target(),
            backend.name()
        );
        Ok(Self {
            conn,
            config,
            backend,
        })
    }

    pub fn backend(&self) -> &dyn SchemaBackend {
        self.backend.as_ref()
    }

    /// Username recorded by the permission step and looked up by `check`.
    pub fn username(&self) -> Option<&str> {
        self.config.db_username.as_deref()
    }
}

fn configure(conn: &Connection, busy_timeout_secs: u64) -> rusqlite::Result<()> {
    // WAL keeps readers on their snapshot while maintenance writes.
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "foreign_keys", "on")?;
    conn.busy_timeout(Duration::from_secs(busy_timeout_secs))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_at(dir: &TempDir, name: &str) -> Config {
        Config {
            db_database: dir.path().join(name).to_string_lossy().into_owned(),
            db_username: Some("tester".to_string()),
            ..Config::default()
        }
    }

    #[test]
    fn create_mode_makes_new_file() {
        let dir = TempDir::new().unwrap();
        let config = config_at(&dir, "new.db");
        let ctx = IndexContext::connect(config, OpenMode::Create).unwrap();
        assert!(dir.path().join("new.db").exists());
        assert_eq!(ctx.backend().name(), "default");
        assert_eq!(ctx.username(), Some("tester"));
    }

    #[test]
    fn existing_mode_reports_connection_error() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            db_port: Some(5432),
            ..config_at(&dir, "missing.db")
        };
        let err = IndexContext::connect(config, OpenMode::Existing)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connection { .. }));
        let msg = err.to_string();
        assert!(msg.contains("localhost:5432"));
        assert!(msg.contains("missing.db"));
        assert!(!dir.path().join("missing.db").exists());
    }

    #[test]
    fn wal_and_foreign_keys_enabled() {
        let dir = TempDir::new().unwrap();
        let ctx = IndexContext::connect(config_at(&dir, "p.db"), OpenMode::Create).unwrap();
        let mode: String = ctx
            .conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i32 = ctx
            .conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn s3_driver_selects_extension_backend() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            driver: DriverKind::S3aio,
            ..config_at(&dir, "s3.db")
        };
        let ctx = IndexContext::connect(config, OpenMode::Create).unwrap();
        assert!(ctx.backend().supports_extension_tables());
    }
}
