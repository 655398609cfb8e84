//! CLI argument parsing with clap.
//!
//! Paired `--flag` / `--no-flag` options override each other, so the last one
//! given wins; the accessor methods resolve each pair against its default.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// cubeidx - provision and maintain a metadata-indexing database
#[derive(Parser, Debug)]
#[command(name = "cubeidx", version, about = "Provision and maintain a metadata-indexing database")]
pub struct Cli {
    /// Additional config file, read after the default locations (repeatable)
    #[arg(long = "config", short = 'C', value_name = "FILE", global = true, action = ArgAction::Append)]
    pub config: Vec<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Database-level operations
    System {
        #[command(subcommand)]
        command: SystemCommand,
    },
    /// Manage metadata types
    Metadata {
        #[command(subcommand)]
        command: MetadataCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum SystemCommand {
    /// Create or upgrade the schema, then check indexes and views
    Init(InitArgs),
    /// Show configuration and test the database connection
    Check,
}

#[derive(Subcommand, Debug)]
pub enum MetadataCommand {
    /// Add metadata types from TOML documents
    Add(MetadataArgs),
    /// Add new fields and redefine changed fields of existing types
    Update(MetadataArgs),
    /// List metadata types, their fields, and index states
    List,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Add the bundled metadata types (default)
    #[arg(long = "default-types", overrides_with = "no_default_types")]
    pub default_types: bool,
    /// Do not add the bundled metadata types
    #[arg(long = "no-default-types", overrides_with = "default_types")]
    pub no_default_types: bool,

    /// Seed roles and grant the configured user admin (default)
    #[arg(long = "init-users", overrides_with = "no_init_users")]
    pub init_users: bool,
    /// Skip the role and grant step
    #[arg(long = "no-init-users", overrides_with = "init_users")]
    pub no_init_users: bool,

    /// Recreate dynamic views (default)
    #[arg(long = "recreate-views", overrides_with = "no_recreate_views")]
    pub recreate_views: bool,
    /// Leave existing views alone unless --rebuild is given
    #[arg(long = "no-recreate-views", overrides_with = "recreate_views")]
    pub no_recreate_views: bool,

    /// Rebuild stale indexes (and views)
    #[arg(long = "rebuild", overrides_with = "no_rebuild")]
    pub rebuild: bool,
    /// Leave stale indexes in place (default)
    #[arg(long = "no-rebuild", overrides_with = "rebuild")]
    pub no_rebuild: bool,

    /// Allow exclusive table locks, blocking other writers during changes
    #[arg(long = "lock-table", overrides_with = "no_lock_table")]
    pub lock_table: bool,
    /// Never take exclusive locks (default)
    #[arg(long = "no-lock-table", overrides_with = "lock_table")]
    pub no_lock_table: bool,

    /// Create the S3 storage extension tables (selects the s3aio driver)
    #[arg(short = 's', long = "create-s3-tables")]
    pub create_s3_tables: bool,

    /// Cancel any single index build running longer than this
    #[arg(long = "build-timeout", value_name = "SECS")]
    pub build_timeout: Option<u64>,
}

/// Resolve a `--flag` / `--no-flag` pair. `overrides_with` clears the earlier one.
fn flag(yes: bool, no: bool, default: bool) -> bool {
    match (yes, no) {
        (true, _) => true,
        (_, true) => false,
        _ => default,
    }
}

impl InitArgs {
    pub fn with_default_types(&self) -> bool {
        flag(self.default_types, self.no_default_types, true)
    }

    pub fn with_users(&self) -> bool {
        flag(self.init_users, self.no_init_users, true)
    }

    pub fn rebuild_indexes(&self) -> bool {
        flag(self.rebuild, self.no_rebuild, false)
    }

    /// Rebuilding indexes always recreates views as well.
    pub fn rebuild_views(&self) -> bool {
        flag(self.recreate_views, self.no_recreate_views, true) || self.rebuild_indexes()
    }

    pub fn allow_table_lock(&self) -> bool {
        flag(self.lock_table, self.no_lock_table, false)
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout.map(Duration::from_secs)
    }
}

#[derive(Args, Debug)]
pub struct MetadataArgs {
    /// Metadata type documents
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,

    /// Allow exclusive table locks while indexes are built
    #[arg(long = "allow-exclusive-lock")]
    pub allow_exclusive_lock: bool,
}
