//! Physical index creation and removal.
//!
//! With table locking allowed, a build is one exclusive transaction that moves
//! the registry row to `building`, replaces the index, and marks it `valid`.
//! Without locking, the same work happens in three short transactions so the
//! write lock is only held while the index itself is built. A crash between
//! them leaves the row in `building`, which the next pass detects.
//!
//! Any failed or cancelled build is cleaned up before returning: the physical
//! index is dropped and the row deleted, leaving the field `absent`.

use crate::catalog::{Field, MetadataType};
use crate::error::{Error, Result, is_interrupted};
use crate::lock::LockCoordinator;
use crate::registry::{self, IndexState};
use crate::watchdog::Watchdog;
use rusqlite::Connection;
use std::time::{Duration, Instant};

/// Table every field index is built on.
pub const INDEXED_TABLE: &str = "dataset";

const REGISTRY_TABLE: &str = "field_index";

/// DDL for the partial expression index backing `field`.
pub fn create_index_sql(ty: &MetadataType, field: &Field) -> String {
    format!(
        "CREATE INDEX \"{}\" ON {} ({}) WHERE metadata_type_id = {} AND archived IS NULL",
        registry::index_name(ty, field),
        INDEXED_TABLE,
        field.expression(),
        ty.id
    )
}

fn drop_index_sql(index_name: &str) -> String {
    format!("DROP INDEX IF EXISTS \"{}\"", index_name)
}

/// Why a build did not finish.
enum BuildFailure {
    Cancelled,
    Failed(Error),
}

pub struct IndexBuilder<'a> {
    locks: &'a mut LockCoordinator,
    timeout: Option<Duration>,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(locks: &'a mut LockCoordinator, timeout: Option<Duration>) -> Self {
        Self { locks, timeout }
    }

    /// Build (or rebuild) the index for `field`.
    ///
    /// On failure the index is left `absent` and an `IndexBuild` error names it.
    pub fn build(&mut self, conn: &mut Connection, ty: &MetadataType, field: &Field) -> Result<()> {
        let name = registry::index_name(ty, field);
        let deadline = self.timeout.map(|t| Instant::now() + t);
        log::info!("building index {} for {}.{}", name, ty.name, field.name);

        let outcome = if self.locks.allows_table_lock() {
            self.build_locked(conn, ty, field, deadline)
        } else {
            self.build_unlocked(conn, ty, field, deadline)
        };

        match outcome {
            Ok(()) => {
                log::info!("index {} is valid", name);
                Ok(())
            }
            Err(failure) => {
                let reason = match &failure {
                    BuildFailure::Cancelled => match self.timeout {
                        Some(t) => format!("cancelled after {:?}", t),
                        None => "cancelled".to_string(),
                    },
                    BuildFailure::Failed(e) => e.to_string(),
                };
                log::warn!("index {} failed: {}", name, reason);
                self.discard(conn, field.id, &name).map_err(|cleanup| {
                    Error::IndexBuild {
                        index: name.clone(),
                        field: format!("{}.{}", ty.name, field.name),
                        reason: format!("{}; cleanup also failed: {}", reason, cleanup),
                    }
                })?;
                Err(Error::IndexBuild {
                    index: name,
                    field: format!("{}.{}", ty.name, field.name),
                    reason,
                })
            }
        }
    }

    fn build_locked(
        &mut self,
        conn: &mut Connection,
        ty: &MetadataType,
        field: &Field,
        deadline: Option<Instant>,
    ) -> std::result::Result<(), BuildFailure> {
        let name = registry::index_name(ty, field);
        let sql = create_index_sql(ty, field);
        let mut cancelled = false;
        let result = self.locks.with_optional_lock(conn, INDEXED_TABLE, |tx| {
            registry::record(tx, field.id, &name, &field.definition_hash, IndexState::Building)?;
            tx.execute_batch(&drop_index_sql(&name))?;
            match run_guarded(tx, &sql, deadline) {
                Err(BuildFailure::Cancelled) => {
                    cancelled = true;
                    return Err(Error::IndexBuild {
                        index: name.clone(),
                        field: field.name.clone(),
                        reason: "cancelled".to_string(),
                    });
                }
                Err(BuildFailure::Failed(e)) => return Err(e),
                Ok(()) => {}
            }
            registry::record(tx, field.id, &name, &field.definition_hash, IndexState::Valid)
        });
        match result {
            Ok(()) => Ok(()),
            Err(_) if cancelled => Err(BuildFailure::Cancelled),
            Err(e) => Err(BuildFailure::Failed(e)),
        }
    }

    fn build_unlocked(
        &mut self,
        conn: &mut Connection,
        ty: &MetadataType,
        field: &Field,
        deadline: Option<Instant>,
    ) -> std::result::Result<(), BuildFailure> {
        let name = registry::index_name(ty, field);
        let sql = create_index_sql(ty, field);

        self.locks
            .with_optional_lock(conn, REGISTRY_TABLE, |tx| {
                registry::record(tx, field.id, &name, &field.definition_hash, IndexState::Building)
            })
            .map_err(BuildFailure::Failed)?;

        let mut cancelled = false;
        let built = self.locks.with_optional_lock(conn, INDEXED_TABLE, |tx| {
            tx.execute_batch(&drop_index_sql(&name))?;
            run_guarded(tx, &sql, deadline).map_err(|failure| match failure {
                BuildFailure::Cancelled => {
                    cancelled = true;
                    Error::IndexBuild {
                        index: name.clone(),
                        field: field.name.clone(),
                        reason: "cancelled".to_string(),
                    }
                }
                BuildFailure::Failed(e) => e,
            })
        });
        match built {
            Ok(()) => {}
            Err(_) if cancelled => return Err(BuildFailure::Cancelled),
            Err(e) => return Err(BuildFailure::Failed(e)),
        }

        self.locks
            .with_optional_lock(conn, REGISTRY_TABLE, |tx| {
                registry::set_state(tx, field.id, IndexState::Valid)
            })
            .map_err(BuildFailure::Failed)
    }

    /// Move a field's index through `failed` to `absent`.
    pub fn discard(&mut self, conn: &mut Connection, field_id: i64, index_name: &str) -> Result<()> {
        self.locks.with_optional_lock(conn, INDEXED_TABLE, |tx| {
            if registry::lookup(tx, field_id)?.is_some() {
                registry::set_state(tx, field_id, IndexState::Failed)?;
            }
            tx.execute_batch(&drop_index_sql(index_name))?;
            registry::forget(tx, field_id)
        })?;
        log::info!("index {} discarded", index_name);
        Ok(())
    }

    /// Record that an index no longer matches its field definition.
    pub fn mark_stale(&mut self, conn: &mut Connection, field_id: i64) -> Result<()> {
        self.locks.with_optional_lock(conn, REGISTRY_TABLE, |tx| {
            registry::set_state(tx, field_id, IndexState::Stale)
        })
    }

    /// Record that a stale index matches its field definition again.
    pub fn mark_valid(&mut self, conn: &mut Connection, field_id: i64) -> Result<()> {
        self.locks.with_optional_lock(conn, REGISTRY_TABLE, |tx| {
            registry::set_state(tx, field_id, IndexState::Valid)
        })
    }

    /// Drop a physical index that has no registry row.
    pub fn drop_orphan(&mut self, conn: &mut Connection, index_name: &str) -> Result<()> {
        log::info!("dropping orphaned index {}", index_name);
        self.locks.with_optional_lock(conn, INDEXED_TABLE, |tx| {
            tx.execute_batch(&drop_index_sql(index_name))?;
            Ok(())
        })
    }
}

/// Run `sql`, cancelling it if `deadline` passes first.
fn run_guarded(
    conn: &Connection,
    sql: &str,
    deadline: Option<Instant>,
) -> std::result::Result<(), BuildFailure> {
    let watchdog = match deadline {
        Some(at) => {
            let remaining = at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BuildFailure::Cancelled);
            }
            Some(Watchdog::arm(conn.get_interrupt_handle(), remaining))
        }
        None => None,
    };

    log::debug!("{}", sql);
    let result = conn.execute_batch(sql);
    let fired = watchdog.as_ref().is_some_and(Watchdog::fired);
    drop(watchdog);

    match result {
        Ok(()) => Ok(()),
        Err(e) if fired || is_interrupted(&e) => Err(BuildFailure::Cancelled),
        Err(e) => Err(BuildFailure::Failed(e.into())),
    }
}
