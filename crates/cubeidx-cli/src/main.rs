// cubeidx-cli: command-line frontend for cubeidx-core
// Argument parsing, logging setup, and user-facing output

mod cli;

use clap::Parser;
use cli::{Cli, Command, InitArgs, MetadataArgs, MetadataCommand, SystemCommand};
use cubeidx_core::catalog::{self, FieldCatalog, MetadataTypeDef};
use cubeidx_core::schema::ensure_initialised;
use cubeidx_core::{
    DriverKind, Error, IndexContext, InitOptions, LoadedConfig, LockCoordinator, MaintainOptions,
    MaintenanceReport, OpenMode, Outcome, Result, initialize, maintain, registry, users,
};
use std::fs;
use std::path::Path;
use std::process::ExitCode;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn print_report(report: &MaintenanceReport) {
    println!("{}", report);
    for entity in &report.stale {
        println!("Stale:\t{}", entity);
    }
    for (entity, reason) in &report.failures {
        println!("Failed:\t{}\t{}", entity, reason);
    }
    for advisory in &report.advisories {
        println!("Note:\t{}", advisory);
    }
    match report.outcome() {
        Outcome::Success => {}
        Outcome::PartialSuccess => {
            println!("Completed with warnings: some indexes or views are stale or failed.")
        }
        Outcome::Failed => println!("Failed: none of the attempted index builds succeeded."),
    }
}

/// Returns `false` when the maintenance pass failed outright.
fn system_init(loaded: LoadedConfig, args: &InitArgs) -> Result<bool> {
    let mut config = loaded.config;
    if args.create_s3_tables {
        config.driver = DriverKind::S3aio;
    }
    let mut ctx = IndexContext::connect(config, OpenMode::Create)?;
    let mut locks = LockCoordinator::new(args.allow_table_lock());

    println!("Initialising database...");
    let opts = InitOptions {
        with_default_types: args.with_default_types(),
        with_permissions: args.with_users(),
        with_extension_tables: args.create_s3_tables,
    };
    let outcome = initialize(&mut ctx, &opts, &mut locks)?;
    println!("{}", if outcome.created { "Created." } else { "Updated." });
    for name in &outcome.default_types_added {
        println!("Added default type \"{}\"", name);
    }

    println!("Checking indexes/views.");
    let opts = MaintainOptions {
        rebuild_indexes: args.rebuild_indexes(),
        rebuild_views: args.rebuild_views(),
        build_timeout: args.build_timeout(),
    };
    let report = maintain(&mut ctx, &opts, &mut locks)?;
    print_report(&report);
    println!("Done.");
    Ok(report.outcome() != Outcome::Failed)
}

/// Print configuration and test the database connection. Returns whether it is reachable.
fn system_check(loaded: LoadedConfig) -> bool {
    let config = loaded.config;
    println!("Version:\t{}", cubeidx_core::version());
    if loaded.files_loaded.is_empty() {
        println!("Config files:\t(none, using defaults)");
    } else {
        let files: Vec<String> = loaded
            .files_loaded
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        println!("Config files:\t{}", files.join(", "));
    }
    match config.db_port {
        Some(port) => println!("Host:\t{}:{}", config.hostname(), port),
        None => println!("Host:\t{}", config.hostname()),
    }
    println!("Database:\t{}", config.db_database);
    println!("User:\t{}", config.db_username.as_deref().unwrap_or("(unknown)"));
    println!("Driver:\t{}", config.driver.as_str());
    println!();

    let ctx = match IndexContext::connect(config, OpenMode::Existing) {
        Ok(ctx) => ctx,
        Err(e) => {
            println!("Valid connection:\tNO");
            eprintln!("{}", e);
            return false;
        }
    };
    println!("Valid connection:\tYES");

    let Some(username) = ctx.username() else {
        return true;
    };
    match ensure_initialised(&ctx.conn).and_then(|_| users::roles_for(&ctx.conn, username)) {
        Ok(roles) if roles.is_empty() => println!("You have no roles"),
        Ok(roles) => println!("You have {} privileges.", roles.join(", ")),
        Err(e) => println!("Roles:\tunavailable ({})", e),
    }
    true
}

fn read_definition(path: &Path) -> Result<MetadataTypeDef> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Catalog(format!("failed to read {}: {}", path.display(), e)))?;
    let def = MetadataTypeDef::from_toml(&content)?;
    log::debug!("read metadata type {} from {}", def.name, path.display());
    Ok(def)
}

/// Apply each document with `apply`, then bring indexes and views up to date.
fn metadata_apply(
    loaded: LoadedConfig,
    args: &MetadataArgs,
    rebuild_indexes: bool,
    apply: impl Fn(&rusqlite::Connection, &MetadataTypeDef) -> Result<String>,
) -> Result<bool> {
    let mut ctx = IndexContext::connect(loaded.config, OpenMode::Existing)?;
    ensure_initialised(&ctx.conn)?;
    let mut locks = LockCoordinator::new(args.allow_exclusive_lock);

    let mut all_ok = true;
    for path in &args.files {
        let result = read_definition(path).and_then(|def| {
            locks.with_optional_lock(&mut ctx.conn, "metadata_type", |tx| apply(tx, &def))
        });
        match result {
            Ok(message) => println!("{}", message),
            Err(e) => {
                all_ok = false;
                eprintln!("{}: {}", path.display(), e);
            }
        }
    }

    let opts = MaintainOptions {
        rebuild_indexes,
        rebuild_views: true,
        build_timeout: None,
    };
    let report = maintain(&mut ctx, &opts, &mut locks)?;
    print_report(&report);
    Ok(all_ok && report.outcome() != Outcome::Failed)
}

fn metadata_list(loaded: LoadedConfig) -> Result<()> {
    let ctx = IndexContext::connect(loaded.config, OpenMode::Existing)?;
    ensure_initialised(&ctx.conn)?;
    let catalog = FieldCatalog::load(&ctx.conn)?;
    for ty in catalog.types() {
        println!("{}\t{}", ty.name, ty.description.as_deref().unwrap_or(""));
        for field in ty.fields.values() {
            let state = if field.indexable {
                registry::observe(&ctx.conn, ty, field)?.state().to_string()
            } else {
                "not indexed".to_string()
            };
            println!(
                "    {}\t{}\t{}\t{}",
                field.name,
                field.value_type.as_str(),
                field.offset.join("."),
                state
            );
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<bool> {
    let loaded = LoadedConfig::load(&cli.config)?;
    match cli.command {
        Command::System { command } => match command {
            SystemCommand::Init(args) => system_init(loaded, &args),
            SystemCommand::Check => Ok(system_check(loaded)),
        },
        Command::Metadata { command } => match command {
            MetadataCommand::Add(args) => metadata_apply(loaded, &args, false, |tx, def| {
                catalog::add_metadata_type(tx, def)?;
                Ok(format!("Added \"{}\"", def.name))
            }),
            MetadataCommand::Update(args) => metadata_apply(loaded, &args, true, |tx, def| {
                let update = catalog::update_metadata_type(tx, def)?;
                Ok(if update.is_noop() {
                    format!("No changes detected for metadata type \"{}\"", def.name)
                } else {
                    format!("Updated \"{}\"", def.name)
                })
            }),
            MetadataCommand::List => metadata_list(loaded).map(|()| true),
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
