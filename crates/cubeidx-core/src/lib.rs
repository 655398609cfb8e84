//! cubeidx-core: schema initialization and dynamic index/view maintenance
//!
//! Provisions the base schema of a metadata-indexing database and keeps the
//! per-field expression indexes and per-type views in step with a
//! user-extensible field catalog.
//!
//! # Quick Start
//!
//! ```no_run
//! use cubeidx_core::{
//!     IndexContext, InitOptions, LoadedConfig, LockCoordinator, MaintainOptions, OpenMode,
//! };
//!
//! fn main() -> cubeidx_core::Result<()> {
//!     let loaded = LoadedConfig::load(&[])?;
//!     let mut ctx = IndexContext::connect(loaded.config, OpenMode::Create)?;
//!     let mut locks = LockCoordinator::new(false);
//!
//!     let init = cubeidx_core::initialize(&mut ctx, &InitOptions::default(), &mut locks)?;
//!     println!("{}", if init.created { "Created." } else { "Updated." });
//!
//!     let report = cubeidx_core::maintain(&mut ctx, &MaintainOptions::default(), &mut locks)?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod catalog;
pub mod config;
pub mod context;
pub mod datasets;
pub mod error;
pub mod lock;
pub mod maintain;
pub mod registry;
pub mod schema;
pub mod users;
pub mod views;
pub mod watchdog;

pub use catalog::{FieldCatalog, FieldDef, MetadataTypeDef, ValueType};
pub use config::{Config, DriverKind, LoadedConfig};
pub use context::{IndexContext, OpenMode};
pub use error::{DbTarget, Error, Result};
pub use lock::{Advisory, LockCoordinator};
pub use maintain::{MaintainOptions, MaintenanceReport, Outcome, maintain};
pub use registry::IndexState;
pub use schema::backend::{S3IndexBackend, SchemaBackend, SqliteBackend};
pub use schema::init::{InitOptions, InitOutcome, initialize};

/// Returns cubeidx-core's package version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
