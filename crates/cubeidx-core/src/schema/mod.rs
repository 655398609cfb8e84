//! Base schema: revisions, the version marker, and initialization.
//!
//! Revisions are append-only. Never edit an existing entry, only add new ones
//! at the end, and every revision after the first must be additive (new
//! tables or columns) so that older databases can be brought forward in place.

pub mod backend;
pub mod init;

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension};

/// A single schema revision. Applied in order and recorded in `schema_meta`.
pub(crate) struct Migration {
    pub(crate) version: u32,
    pub(crate) sql: &'static str,
}

/// Append-only revision list.
pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: "
            CREATE TABLE metadata_type (
                id    INTEGER PRIMARY KEY,
                name  TEXT    NOT NULL UNIQUE,
                added TEXT    NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE metadata_field (
                id               INTEGER PRIMARY KEY,
                metadata_type_id INTEGER NOT NULL REFERENCES metadata_type(id),
                name             TEXT    NOT NULL,
                offset_path      TEXT    NOT NULL,
                value_type       TEXT    NOT NULL,
                indexable        INTEGER NOT NULL DEFAULT 1,
                definition_hash  TEXT    NOT NULL,
                position         INTEGER NOT NULL,
                UNIQUE (metadata_type_id, name)
            );

            CREATE TABLE field_index (
                field_id        INTEGER PRIMARY KEY REFERENCES metadata_field(id),
                index_name      TEXT    NOT NULL UNIQUE,
                definition_hash TEXT    NOT NULL,
                state           TEXT    NOT NULL
                                CHECK (state IN ('building', 'valid', 'stale', 'failed')),
                updated_at      TEXT    NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE dataset (
                id               TEXT    PRIMARY KEY,
                metadata_type_id INTEGER NOT NULL REFERENCES metadata_type(id),
                metadata         TEXT    NOT NULL CHECK (json_valid(metadata)),
                added            TEXT    NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX ix_dataset_metadata_type ON dataset(metadata_type_id);

            CREATE TABLE role (
                name        TEXT PRIMARY KEY,
                description TEXT NOT NULL
            );

            CREATE TABLE role_grant (
                role      TEXT NOT NULL REFERENCES role(name),
                privilege TEXT NOT NULL,
                object    TEXT NOT NULL,
                PRIMARY KEY (role, privilege, object)
            );

            CREATE TABLE role_member (
                username TEXT NOT NULL,
                role     TEXT NOT NULL REFERENCES role(name),
                PRIMARY KEY (username, role)
            );
        ",
    },
    Migration {
        version: 2,
        sql: "
            ALTER TABLE metadata_type ADD COLUMN description TEXT;
            ALTER TABLE dataset ADD COLUMN archived TEXT;
        ",
    },
];

/// Tables every initialised database must contain.
pub const CORE_TABLES: &[&str] = &[
    "metadata_type",
    "metadata_field",
    "field_index",
    "dataset",
    "role",
    "role_grant",
    "role_member",
];

/// Revision this build of cubeidx expects.
pub fn latest_revision() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Read the version marker. `None` means the base schema was never created.
pub fn schema_version(conn: &Connection) -> Result<Option<u32>> {
    if !table_exists(conn, "schema_meta")? {
        return Ok(None);
    }
    let version: Option<u32> = conn
        .query_row("SELECT MAX(version) FROM schema_meta", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version)
}

/// Fail unless the schema exists, is complete, and is at the latest revision.
pub fn ensure_initialised(conn: &Connection) -> Result<u32> {
    let Some(version) = schema_version(conn)? else {
        return Err(Error::SchemaNotInitialized);
    };
    check_revision(version)?;
    check_core_tables(conn)?;
    if version < latest_revision() {
        return Err(Error::schema(format!(
            "schema is at revision {} but {} is required (run `cubeidx system init` to upgrade)",
            version,
            latest_revision()
        )));
    }
    Ok(version)
}

pub(crate) fn check_revision(version: u32) -> Result<()> {
    if version > latest_revision() {
        return Err(Error::schema(format!(
            "database is at revision {} which is newer than this tool (revision {})",
            version,
            latest_revision()
        )));
    }
    Ok(())
}

/// A marker without the tables it describes means the schema is corrupt.
pub(crate) fn check_core_tables(conn: &Connection) -> Result<()> {
    let mut missing = Vec::new();
    for table in CORE_TABLES {
        if !table_exists(conn, table)? {
            missing.push(*table);
        }
    }
    if !missing.is_empty() {
        return Err(Error::schema(format!(
            "schema marker present but core tables are missing: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Apply all revisions newer than `from`. Returns the revision reached.
pub(crate) fn apply_migrations(conn: &Connection, from: u32) -> Result<u32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_meta (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let mut reached = from;
    for m in MIGRATIONS {
        if m.version > from {
            log::info!("applying schema revision {}", m.version);
            conn.execute_batch(m.sql)?;
            conn.execute("INSERT INTO schema_meta (version) VALUES (?1)", [m.version])?;
            reached = m.version;
        }
    }
    Ok(reached)
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    object_exists(conn, "table", name)
}

/// Whether `sqlite_master` holds an object of `kind` named `name`.
pub(crate) fn object_exists(conn: &Connection, kind: &str, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
        [kind, name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
