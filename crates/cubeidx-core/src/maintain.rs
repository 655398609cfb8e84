//! Reconcile field indexes and views against the catalog.
//!
//! A pass walks every indexable field, derives the observed state of its
//! index, and builds, rebuilds, or leaves it as the options dictate. Failures
//! are isolated per entity and collected in the [`MaintenanceReport`]; views are
//! rebuilt after every index has been dealt with, whatever happened to them.

use crate::builder::IndexBuilder;
use crate::catalog::{Field, FieldCatalog, MetadataType};
use crate::context::IndexContext;
use crate::error::{Error, Result};
use crate::lock::{Advisory, LockCoordinator};
use crate::registry::{self, IndexState, Observed};
use crate::schema::ensure_initialised;
use crate::views;
use rusqlite::Connection;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintainOptions {
    /// Rebuild indexes whose definition changed instead of leaving them stale.
    pub rebuild_indexes: bool,
    /// Recreate every view. Implied by `rebuild_indexes`.
    pub rebuild_views: bool,
    /// Cancel any single index build that runs longer than this.
    pub build_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Something was left stale or failed; see the report's lists.
    PartialSuccess,
    /// Index builds were attempted and none of them succeeded.
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub created: usize,
    pub rebuilt: usize,
    pub skipped: usize,
    pub left_stale: usize,
    pub failed: usize,
    /// Index builds started, whether or not they finished.
    pub attempted: usize,
    /// Indexes found `building` or `failed` from an earlier, interrupted run.
    pub recovered: usize,
    /// Indexes removed because their field is no longer indexable.
    pub dropped: usize,
    /// `type.field` of every index left stale.
    pub stale: Vec<String>,
    /// Failed entity (`type.field`, index, or view name) and the reason.
    pub failures: Vec<(String, String)>,
    pub views_rebuilt: Vec<String>,
    pub advisories: Vec<Advisory>,
}

impl MaintenanceReport {
    pub fn outcome(&self) -> Outcome {
        if self.attempted > 0 && self.created + self.rebuilt == 0 {
            Outcome::Failed
        } else if self.stale.is_empty() && self.failures.is_empty() {
            Outcome::Success
        } else {
            Outcome::PartialSuccess
        }
    }
}

impl fmt::Display for MaintenanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "indexes: {} created, {} rebuilt, {} skipped, {} left stale, {} failed",
            self.created, self.rebuilt, self.skipped, self.left_stale, self.failed
        )?;
        if self.recovered > 0 {
            write!(f, ", {} recovered", self.recovered)?;
        }
        if self.dropped > 0 {
            write!(f, ", {} dropped", self.dropped)?;
        }
        write!(f, "; views: {} rebuilt", self.views_rebuilt.len())
    }
}

/// What happened to one field's index.
enum Step {
    Skipped,
    LeftStale,
    Created,
    Rebuilt,
}

/// Bring every indexable field's index in line with the catalog.
///
/// Per-field failures never stop the pass: they are counted and listed in the
/// report. Only failing to read the registry itself is an error.
pub fn reconcile(
    conn: &mut Connection,
    catalog: &FieldCatalog,
    locks: &mut LockCoordinator,
    opts: &MaintainOptions,
) -> Result<MaintenanceReport> {
    let mut report = MaintenanceReport::default();
    let mut builder = IndexBuilder::new(locks, opts.build_timeout);

    for (ty, field) in catalog.indexable_fields() {
        let entity = format!("{}.{}", ty.name, field.name);
        match reconcile_field(conn, &mut builder, ty, field, opts, &mut report) {
            Ok(Step::Skipped) => report.skipped += 1,
            Ok(Step::LeftStale) => {
                log::warn!("index for {} is stale; run with rebuild to refresh it", entity);
                report.left_stale += 1;
                report.stale.push(entity);
            }
            Ok(Step::Created) => {
                report.attempted += 1;
                report.created += 1;
            }
            Ok(Step::Rebuilt) => {
                report.attempted += 1;
                report.rebuilt += 1;
            }
            Err(e) => {
                if matches!(e, Error::IndexBuild { .. }) {
                    report.attempted += 1;
                }
                log::warn!("{}: {}", entity, e);
                report.failed += 1;
                report.failures.push((entity, e.to_string()));
            }
        }
    }

    let indexable: HashSet<i64> = catalog.indexable_fields().map(|(_, f)| f.id).collect();
    for row in registry::all(conn)? {
        if indexable.contains(&row.field_id) {
            continue;
        }
        log::info!("dropping {}: field is no longer indexable", row.index_name);
        match builder.discard(conn, row.field_id, &row.index_name) {
            Ok(()) => report.dropped += 1,
            Err(e) => {
                log::warn!("could not drop {}: {}", row.index_name, e);
                report.failed += 1;
                report.failures.push((row.index_name, e.to_string()));
            }
        }
    }

    Ok(report)
}

fn reconcile_field(
    conn: &mut Connection,
    builder: &mut IndexBuilder<'_>,
    ty: &MetadataType,
    field: &Field,
    opts: &MaintainOptions,
    report: &mut MaintenanceReport,
) -> Result<Step> {
    let name = registry::index_name(ty, field);
    let cleanup_failed = |e: Error| Error::IndexBuild {
        index: name.clone(),
        field: format!("{}.{}", ty.name, field.name),
        reason: format!("cleanup before build failed: {}", e),
    };

    let rebuild = match registry::observe(conn, ty, field)? {
        Observed::Valid(row) => {
            if row.state == IndexState::Stale {
                log::info!("index {} matches its definition again", row.index_name);
                builder.mark_valid(conn, row.field_id)?;
            }
            return Ok(Step::Skipped);
        }
        Observed::Absent { orphan } => {
            if orphan {
                builder.drop_orphan(conn, &name).map_err(cleanup_failed)?;
            }
            false
        }
        Observed::Interrupted(row) => {
            log::warn!(
                "index {} was left {} by an interrupted run; rebuilding",
                row.index_name,
                row.state
            );
            report.recovered += 1;
            builder
                .discard(conn, row.field_id, &row.index_name)
                .map_err(cleanup_failed)?;
            false
        }
        Observed::Vanished(row) => {
            log::warn!("index {} is recorded but missing; rebuilding", row.index_name);
            builder
                .discard(conn, row.field_id, &row.index_name)
                .map_err(cleanup_failed)?;
            false
        }
        Observed::Stale(row) => {
            if !opts.rebuild_indexes {
                if row.state != IndexState::Stale {
                    builder.mark_stale(conn, row.field_id)?;
                }
                return Ok(Step::LeftStale);
            }
            true
        }
    };

    builder.build(conn, ty, field)?;
    Ok(if rebuild { Step::Rebuilt } else { Step::Created })
}

/// Run a full maintenance pass: indexes first, then views if requested.
///
/// Index and view failures end up in the report, never in the `Err` arm; check
/// [`MaintenanceReport::outcome`].
pub fn maintain(
    ctx: &mut IndexContext,
    opts: &MaintainOptions,
    locks: &mut LockCoordinator,
) -> Result<MaintenanceReport> {
    ensure_initialised(&ctx.conn)?;
    let catalog = FieldCatalog::load(&ctx.conn)?;
    log::info!(
        "checking indexes for {} metadata types (rebuild: {})",
        catalog.len(),
        opts.rebuild_indexes
    );

    let mut report = reconcile(&mut ctx.conn, &catalog, locks, opts)?;

    if opts.rebuild_views || opts.rebuild_indexes {
        let rebuilt = views::rebuild_views(&mut ctx.conn, &catalog, locks);
        report.views_rebuilt = rebuilt.rebuilt;
        report.failures.extend(rebuilt.failures);
    }
    report.advisories = locks.advisories().to_vec();
    log::info!("{}", report);
    Ok(report)
}
