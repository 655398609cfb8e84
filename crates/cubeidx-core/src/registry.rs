//! Registry of physical field indexes and their build state.
//!
//! One `field_index` row per indexable field records the hash the index was
//! built from and where its build got to. A row alone is never trusted:
//! [`observe`] combines it with the index's presence in `sqlite_master` to
//! decide what the index actually is right now.

use crate::catalog::{Field, MetadataType};
use crate::error::{Error, Result};
use crate::schema::object_exists;
use rusqlite::{Connection, OptionalExtension, params};
use std::fmt;

/// Lifecycle of a field index. `Absent` is never stored: it is the lack of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Absent,
    Building,
    Valid,
    Stale,
    Failed,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Building => "building",
            Self::Valid => "valid",
            Self::Stale => "stale",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "building" => Ok(Self::Building),
            "valid" => Ok(Self::Valid),
            "stale" => Ok(Self::Stale),
            "failed" => Ok(Self::Failed),
            other => Err(Error::schema(format!("unknown field index state '{}'", other))),
        }
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded `field_index` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIndex {
    pub field_id: i64,
    pub index_name: String,
    pub definition_hash: String,
    pub state: IndexState,
}

/// What an index really is, after checking the row against the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    /// No row. `orphan` is set when a physical index exists anyway.
    Absent { orphan: bool },
    /// Row left in `building` or `failed` by an interrupted run.
    Interrupted(FieldIndex),
    /// Row claims the index exists but the physical index is gone.
    Vanished(FieldIndex),
    /// Built from an older definition than the field's current one.
    Stale(FieldIndex),
    /// Built from the current definition. The row may still read `stale` if
    /// the field was redefined and then changed back.
    Valid(FieldIndex),
}

impl Observed {
    pub fn state(&self) -> IndexState {
        match self {
            Self::Absent { .. } | Self::Vanished(_) => IndexState::Absent,
            Self::Interrupted(row) => row.state,
            Self::Stale(_) => IndexState::Stale,
            Self::Valid(_) => IndexState::Valid,
        }
    }
}

/// Physical name of the index backing `field`.
///
/// Names never contain `__` or end in `_`, so the double separator keeps
/// `a_b.c` and `a.b_c` apart.
pub fn index_name(ty: &MetadataType, field: &Field) -> String {
    format!("dix_{}__{}", ty.name, field.name)
}

pub fn lookup(conn: &Connection, field_id: i64) -> Result<Option<FieldIndex>> {
    let row: Option<(i64, String, String, String)> = conn
        .query_row(
            "SELECT field_id, index_name, definition_hash, state FROM field_index
             WHERE field_id = ?1",
            [field_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    row.map(|(field_id, index_name, definition_hash, state)| {
        Ok(FieldIndex {
            field_id,
            index_name,
            definition_hash,
            state: IndexState::parse(&state)?,
        })
    })
    .transpose()
}

/// Every recorded field index, ordered by field.
pub fn all(conn: &Connection) -> Result<Vec<FieldIndex>> {
    let mut stmt = conn.prepare(
        "SELECT field_id, index_name, definition_hash, state FROM field_index ORDER BY field_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (field_id, index_name, definition_hash, state) = row?;
        out.push(FieldIndex {
            field_id,
            index_name,
            definition_hash,
            state: IndexState::parse(&state)?,
        });
    }
    Ok(out)
}

pub fn physical_exists(conn: &Connection, index_name: &str) -> Result<bool> {
    object_exists(conn, "index", index_name)
}

/// Derive the current state of `field`'s index from its row and the database.
pub fn observe(conn: &Connection, ty: &MetadataType, field: &Field) -> Result<Observed> {
    let name = index_name(ty, field);
    let physical = physical_exists(conn, &name)?;
    let Some(row) = lookup(conn, field.id)? else {
        return Ok(Observed::Absent { orphan: physical });
    };
    let state = row.state;
    let observed = match state {
        IndexState::Building | IndexState::Failed => Observed::Interrupted(row),
        _ if !physical => Observed::Vanished(row),
        _ if row.definition_hash != field.definition_hash => Observed::Stale(row),
        _ => Observed::Valid(row),
    };
    Ok(observed)
}

/// Insert or replace the row for a field.
pub fn record(
    conn: &Connection,
    field_id: i64,
    index_name: &str,
    definition_hash: &str,
    state: IndexState,
) -> Result<()> {
    if state == IndexState::Absent {
        return forget(conn, field_id);
    }
    conn.execute(
        "INSERT INTO field_index (field_id, index_name, definition_hash, state)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(field_id) DO UPDATE SET
             index_name = excluded.index_name,
             definition_hash = excluded.definition_hash,
             state = excluded.state,
             updated_at = datetime('now')",
        params![field_id, index_name, definition_hash, state.as_str()],
    )?;
    log::debug!("field index {} -> {}", index_name, state);
    Ok(())
}

/// Change only the state of an existing row.
pub fn set_state(conn: &Connection, field_id: i64, state: IndexState) -> Result<()> {
    if state == IndexState::Absent {
        return forget(conn, field_id);
    }
    conn.execute(
        "UPDATE field_index SET state = ?1, updated_at = datetime('now') WHERE field_id = ?2",
        params![state.as_str(), field_id],
    )?;
    Ok(())
}

/// Delete the row, leaving the field without a recorded index.
pub fn forget(conn: &Connection, field_id: i64) -> Result<()> {
    conn.execute("DELETE FROM field_index WHERE field_id = ?1", [field_id])?;
    Ok(())
}
