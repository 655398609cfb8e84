//! Schema backends and their capabilities.
//!
//! The initializer asks a backend what it can do instead of relying on a
//! subclass per storage driver. Every backend creates the base schema; the
//! extension tables and role grants are optional capabilities.

use crate::error::{Error, Result};
use crate::schema;
use rusqlite::Connection;

/// Role hierarchy seeded by the permission step, least privileged first.
/// Each role also inherits the grants of the roles before it.
pub const ROLES: &[(&str, &str)] = &[
    ("user", "Read-only access to datasets, types, and views"),
    ("ingest", "Add and archive datasets"),
    ("manage", "Add and redefine metadata types and fields"),
    ("admin", "Full control, including schema maintenance"),
];

/// Privileges introduced at each level of [`ROLES`].
const ROLE_GRANTS: &[(&str, &[(&str, &str)])] = &[
    (
        "user",
        &[
            ("SELECT", "dataset"),
            ("SELECT", "metadata_type"),
            ("SELECT", "metadata_field"),
            ("SELECT", "field_index"),
            ("SELECT", "dv_*"),
        ],
    ),
    ("ingest", &[("INSERT", "dataset"), ("UPDATE", "dataset")]),
    (
        "manage",
        &[
            ("INSERT", "metadata_type"),
            ("INSERT", "metadata_field"),
            ("UPDATE", "metadata_field"),
        ],
    ),
    ("admin", &[("ALL", "*")]),
];

/// Role granted to the user who runs the permission step.
pub const INITIALISER_ROLE: &str = "admin";

pub trait SchemaBackend {
    /// Short name used in logs and `Unsupported` errors.
    fn name(&self) -> &'static str;

    /// Bring the base schema from revision `from` (0 = absent) to the latest.
    fn create_base(&self, conn: &Connection, from: u32) -> Result<u32> {
        schema::apply_migrations(conn, from)
    }

    fn supports_extension_tables(&self) -> bool {
        false
    }

    /// Create any missing extension tables.
    fn create_extension(&self, _conn: &Connection) -> Result<()> {
        Err(Error::Unsupported {
            backend: self.name(),
            capability: "extension tables",
        })
    }

    fn supports_permissions(&self) -> bool {
        false
    }

    /// Seed roles and grants, and make `username` (if known) an admin.
    fn grant_permissions(&self, _conn: &Connection, _username: Option<&str>) -> Result<()> {
        Err(Error::Unsupported {
            backend: self.name(),
            capability: "permission grants",
        })
    }
}

/// The standard backend: base schema plus role grants.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteBackend;

impl SchemaBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "default"
    }

    fn supports_permissions(&self) -> bool {
        true
    }

    fn grant_permissions(&self, conn: &Connection, username: Option<&str>) -> Result<()> {
        seed_roles(conn).map_err(|e| Error::Permission(e.to_string()))?;
        match username {
            Some(user) => {
                conn.execute(
                    "INSERT OR IGNORE INTO role_member (username, role) VALUES (?1, ?2)",
                    [user, INITIALISER_ROLE],
                )
                .map_err(|e| Error::Permission(format!("granting {} to {}: {}", INITIALISER_ROLE, user, e)))?;
            }
            None => log::warn!("no database username configured; roles seeded without members"),
        }
        Ok(())
    }
}

fn seed_roles(conn: &Connection) -> rusqlite::Result<()> {
    for (role, description) in ROLES {
        conn.execute(
            "INSERT OR IGNORE INTO role (name, description) VALUES (?1, ?2)",
            [role, description],
        )?;
    }
    // Each role receives its own grants plus everything below it.
    let mut inherited: Vec<(&str, &str)> = Vec::new();
    for (role, grants) in ROLE_GRANTS {
        inherited.extend_from_slice(grants);
        for (privilege, object) in &inherited {
            conn.execute(
                "INSERT OR IGNORE INTO role_grant (role, privilege, object) VALUES (?1, ?2, ?3)",
                [role, privilege, object],
            )?;
        }
    }
    Ok(())
}

/// Storage extension tables for datasets held in S3 chunked arrays.
const S3_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS s3_dataset (
        id          INTEGER PRIMARY KEY,
        base_name   TEXT    NOT NULL,
        band        TEXT    NOT NULL,
        bucket      TEXT    NOT NULL,
        macro_shape TEXT    NOT NULL,
        chunk_size  TEXT    NOT NULL,
        numpy_type  TEXT    NOT NULL,
        dimensions  TEXT    NOT NULL,
        regular_dims TEXT   NOT NULL,
        regular_index TEXT,
        irregular_index TEXT,
        UNIQUE (base_name, band)
    );

    CREATE TABLE IF NOT EXISTS s3_dataset_chunk (
        id            INTEGER PRIMARY KEY,
        s3_dataset_id INTEGER NOT NULL REFERENCES s3_dataset(id),
        s3_key        TEXT    NOT NULL,
        chunk_id      TEXT    NOT NULL,
        compression_scheme TEXT,
        micro_shape   TEXT    NOT NULL,
        index_min     TEXT    NOT NULL,
        index_max     TEXT    NOT NULL,
        UNIQUE (s3_dataset_id, chunk_id)
    );

    CREATE TABLE IF NOT EXISTS s3_dataset_mapping (
        id            INTEGER PRIMARY KEY,
        dataset_ref   TEXT    NOT NULL REFERENCES dataset(id),
        band          TEXT    NOT NULL,
        s3_dataset_id INTEGER NOT NULL REFERENCES s3_dataset(id),
        UNIQUE (dataset_ref, band)
    );
";

/// Names of the tables [`S3IndexBackend`] creates.
pub const S3_TABLES: &[&str] = &["s3_dataset", "s3_dataset_chunk", "s3_dataset_mapping"];

/// The standard backend extended with S3 chunk-storage tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct S3IndexBackend {
    base: SqliteBackend,
}

impl SchemaBackend for S3IndexBackend {
    fn name(&self) -> &'static str {
        "s3aio"
    }

    fn create_base(&self, conn: &Connection, from: u32) -> Result<u32> {
        self.base.create_base(conn, from)
    }

    fn supports_extension_tables(&self) -> bool {
        true
    }

    fn create_extension(&self, conn: &Connection) -> Result<()> {
        log::info!("creating S3 extension tables");
        conn.execute_batch(S3_TABLES_SQL)?;
        Ok(())
    }

    fn supports_permissions(&self) -> bool {
        self.base.supports_permissions()
    }

    fn grant_permissions(&self, conn: &Connection, username: Option<&str>) -> Result<()> {
        self.base.grant_permissions(conn, username)
    }
}
