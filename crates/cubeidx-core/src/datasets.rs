//! Base dataset records.
//!
//! Records are the rows field indexes and views are built over. Archiving is a
//! soft delete: the record leaves every partial field index but stays visible
//! in its type's view with `archived` set.

use crate::context::IndexContext;
use crate::error::{Error, Result};
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

/// Insert a record of metadata type `type_name`.
pub fn add_dataset(ctx: &IndexContext, type_name: &str, id: &str, metadata: &Value) -> Result<()> {
    if !metadata.is_object() {
        return Err(Error::Catalog(format!(
            "dataset {} metadata must be a JSON object",
            id
        )));
    }
    let type_id: i64 = ctx
        .conn
        .query_row(
            "SELECT id FROM metadata_type WHERE name = ?1",
            [type_name],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::Catalog(format!("unknown metadata type '{}'", type_name)))?;

    ctx.conn.execute(
        "INSERT INTO dataset (id, metadata_type_id, metadata) VALUES (?1, ?2, ?3)",
        params![id, type_id, metadata.to_string()],
    )?;
    log::debug!("added dataset {} ({})", id, type_name);
    Ok(())
}

/// Mark a record archived. Returns `false` if it was unknown or already archived.
pub fn archive_dataset(ctx: &IndexContext, id: &str) -> Result<bool> {
    let changed = ctx.conn.execute(
        "UPDATE dataset SET archived = datetime('now') WHERE id = ?1 AND archived IS NULL",
        [id],
    )?;
    if changed > 0 {
        log::debug!("archived dataset {}", id);
    }
    Ok(changed > 0)
}
