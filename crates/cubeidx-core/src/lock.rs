//! Lock coordination for schema and index mutations.
//!
//! Every mutating operation runs through [`LockCoordinator::with_optional_lock`].
//! With table locking allowed, the operation runs inside an exclusive
//! transaction that blocks other writers until it ends. Without it, the
//! operation runs in an ordinary deferred transaction and an advisory is
//! recorded so the caller can report that it ran without exclusivity.

use crate::error::Result;
use rusqlite::{Connection, TransactionBehavior};
use std::fmt;

/// Signal that an operation proceeded without exclusivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    Unlocked { table: String },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocked { table } => write!(
                f,
                "{} was modified without an exclusive lock; concurrent writers may observe intermediate state",
                table
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct LockCoordinator {
    allow_table_lock: bool,
    advisories: Vec<Advisory>,
}

impl LockCoordinator {
    pub fn new(allow_table_lock: bool) -> Self {
        Self {
            allow_table_lock,
            advisories: Vec::new(),
        }
    }

    pub fn allows_table_lock(&self) -> bool {
        self.allow_table_lock
    }

    /// Run `f` under the configured locking policy.
    ///
    /// The transaction commits only if `f` succeeds. On error or unwind the
    /// transaction guard rolls back, which also releases any lock it held.
    pub fn with_optional_lock<T>(
        &mut self,
        conn: &mut Connection,
        table: &str,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let behavior = if self.allow_table_lock {
            log::debug!("acquiring exclusive lock for {}", table);
            TransactionBehavior::Exclusive
        } else {
            self.advise(Advisory::Unlocked {
                table: table.to_string(),
            });
            TransactionBehavior::Deferred
        };

        let tx = conn.transaction_with_behavior(behavior)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Advisories recorded so far, one per table.
    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }

    pub fn take_advisories(&mut self) -> Vec<Advisory> {
        std::mem::take(&mut self.advisories)
    }

    fn advise(&mut self, advisory: Advisory) {
        if self.advisories.contains(&advisory) {
            return;
        }
        log::warn!("{}", advisory);
        self.advisories.push(advisory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use rusqlite::ErrorCode;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_pair() -> (Connection, Connection, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock.db");
        let a = Connection::open(&path).unwrap();
        a.pragma_update(None, "journal_mode", "wal").unwrap();
        a.execute_batch("CREATE TABLE t (x INTEGER);").unwrap();
        let b = Connection::open(&path).unwrap();
        b.busy_timeout(Duration::from_millis(50)).unwrap();
        (a, b, dir)
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn locked_mode_commits_and_records_no_advisory() {
        let (mut a, _b, _dir) = open_pair();
        let mut locks = LockCoordinator::new(true);
        locks
            .with_optional_lock(&mut a, "t", |tx| {
                tx.execute("INSERT INTO t VALUES (1)", [])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(count(&a), 1);
        assert!(locks.advisories().is_empty());
    }

    #[test]
    fn locked_mode_blocks_other_writers() {
        let (mut a, b, _dir) = open_pair();
        let mut locks = LockCoordinator::new(true);
        locks
            .with_optional_lock(&mut a, "t", |_| {
                let err = b.execute("INSERT INTO t VALUES (2)", []).unwrap_err();
                assert_eq!(err.sqlite_error_code(), Some(ErrorCode::DatabaseBusy));
                Ok(())
            })
            .unwrap();
        // Lock released after the closure: the other connection can write again.
        b.execute("INSERT INTO t VALUES (3)", []).unwrap();
    }

    #[test]
    fn error_rolls_back_and_releases() {
        let (mut a, b, _dir) = open_pair();
        let mut locks = LockCoordinator::new(true);
        let result: Result<()> = locks.with_optional_lock(&mut a, "t", |tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])?;
            Err(Error::Catalog("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(count(&a), 0);
        b.execute("INSERT INTO t VALUES (2)", []).unwrap();
    }

    #[test]
    fn panic_rolls_back_and_releases() {
        let (mut a, b, _dir) = open_pair();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut locks = LockCoordinator::new(true);
            let _: Result<()> = locks.with_optional_lock(&mut a, "t", |tx| {
                tx.execute("INSERT INTO t VALUES (1)", []).unwrap();
                panic!("cancelled");
            });
        }));
        assert!(outcome.is_err());
        b.execute("INSERT INTO t VALUES (2)", []).unwrap();
        assert_eq!(count(&b), 1);
    }

    #[test]
    fn unlocked_mode_records_one_advisory_per_table() {
        let (mut a, _b, _dir) = open_pair();
        let mut locks = LockCoordinator::new(false);
        for _ in 0..3 {
            locks
                .with_optional_lock(&mut a, "t", |tx| {
                    tx.execute("INSERT INTO t VALUES (1)", [])?;
                    Ok(())
                })
                .unwrap();
        }
        locks
            .with_optional_lock(&mut a, "other", |_| Ok(()))
            .unwrap();
        assert_eq!(count(&a), 3);
        assert_eq!(
            locks.take_advisories(),
            vec![
                Advisory::Unlocked {
                    table: "t".to_string()
                },
                Advisory::Unlocked {
                    table: "other".to_string()
                },
            ]
        );
        assert!(locks.advisories().is_empty());
    }

    #[test]
    fn advisory_message_names_table() {
        let advisory = Advisory::Unlocked {
            table: "dataset".to_string(),
        };
        assert!(advisory.to_string().starts_with("dataset was modified"));
    }
}
