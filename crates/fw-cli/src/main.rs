use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fw_cli::commands::{activity, fills, repair, replay, run, sessions, status};
use fw_cli::{Cli, Commands, Config};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(fw_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = fw_db::Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    // Logs go to stderr so command output stays pipeable.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let mut stdout = std::io::stdout().lock();
    match &cli.command {
        Some(Commands::Run { url }) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            run::run(&config, fw_db::SqliteStore::new(db), url.as_deref())?;
        }
        Some(Commands::Replay { input, json }) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            replay::run(
                &mut stdout,
                &config,
                fw_db::SqliteStore::new(db),
                input,
                *json,
            )?;
        }
        Some(Commands::Repair { dry_run, json }) => {
            let (mut db, config) = open_database(cli.config.as_deref())?;
            repair::run(
                &mut stdout,
                &mut db,
                &config.policy,
                chrono::Utc::now(),
                *dry_run,
                *json,
            )?;
        }
        Some(Commands::Sessions {
            plate,
            status,
            since,
            json,
        }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            sessions::run(
                &mut stdout,
                &db,
                plate.as_deref(),
                status.as_deref(),
                since.as_deref(),
                *json,
            )?;
        }
        Some(Commands::Fills {
            plate,
            since,
            merge_gap_mins,
            json,
        }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            fills::run(
                &mut stdout,
                &db,
                plate.as_deref(),
                since.as_deref(),
                *merge_gap_mins,
                *json,
            )?;
        }
        Some(Commands::Activity { plate, limit, json }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            activity::run(&mut stdout, &db, plate.as_deref(), *limit, *json)?;
        }
        Some(Commands::Status { json }) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            status::run(&mut stdout, &db, &config.database_path, *json)?;
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
