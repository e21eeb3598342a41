//! oxide-stepwise CLI
//!
//! Command-line tool for applying versioned migration files.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use oxide_stepwise::file::format_version;
use oxide_stepwise::prelude::*;

/// Exit code used when a second interrupt forces the process to stop.
const FORCE_QUIT_CODE: i32 = 5;

/// Versioned, file based database migrations.
#[derive(Parser)]
#[command(name = "oxide-stepwise")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL; the scheme selects the driver.
    #[arg(short, long, env = "DATABASE_URL")]
    url: String,

    /// Migrations directory.
    #[arg(short, long, env = "MIGRATIONS_PATH", default_value = ".")]
    path: PathBuf,

    /// Migration identity, for independent version tracks in one database.
    #[arg(long, env = "MIGRATION_ID", default_value = "")]
    id: String,

    /// Stop immediately on Ctrl-C instead of finishing the current migration.
    #[arg(long)]
    non_graceful: bool,

    /// Print progress events as JSON lines.
    #[arg(long)]
    json: bool,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new pair of empty migration files.
    Create {
        /// Migration name; spaces become underscores.
        name: String,
    },

    /// Apply all pending migrations.
    Up,

    /// Roll back all applied migrations.
    Down,

    /// Down followed by Up.
    Reset,

    /// Roll back the most recent migration, then apply it again.
    Redo,

    /// Apply (+n) or roll back (-n) migrations.
    Migrate {
        /// Relative number of migrations.
        #[arg(allow_hyphen_values = true)]
        n: i64,
    },

    /// Migrate to an exact version.
    Goto {
        /// Target version (0 rolls back everything).
        version: u64,
    },

    /// Show the current migration version.
    Version,

    /// List applied versions (SQLite only).
    History,
}

/// One progress event, as printed with `--json`.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Record<'a> {
    File {
        #[serde(flatten)]
        file: &'a MigrationFile,
    },
    Error {
        message: String,
    },
    Text {
        message: &'a str,
    },
}

/// Prints every event of `pipe`; returns whether no error was seen.
async fn write_pipe(mut pipe: PipeReceiver, json: bool) -> anyhow::Result<bool> {
    let mut ok = true;
    while let Some(event) = pipe.recv().await {
        if event.is_failure() {
            ok = false;
        }

        if json {
            let record = match &event {
                Event::File(file) => Record::File { file },
                Event::Error(err) => Record::Error {
                    message: err.to_string(),
                },
                Event::Text(text) => Record::Text { message: text },
            };
            println!("{}", serde_json::to_string(&record)?);
            continue;
        }

        match event {
            Event::File(file) => {
                let marker = match file.direction {
                    Direction::Up => '>',
                    Direction::Down => '<',
                };
                println!("{marker} {}", file.file_name);
            }
            Event::Error(err) => eprintln!("{err}\n"),
            Event::Text(text) => println!("{text}"),
        }
    }
    Ok(ok)
}

/// Exits on the second Ctrl-C; the migrator itself handles the first one.
fn spawn_force_quit() {
    tokio::spawn(async {
        let mut received = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            received += 1;
            if received > 1 {
                eprintln!("Forced quit.");
                std::process::exit(FORCE_QUIT_CODE);
            }
            eprintln!("Hit Ctrl-C again to force quit.");
        }
    });
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let interrupts = if cli.non_graceful {
        InterruptMode::NonGraceful
    } else {
        InterruptMode::Graceful
    };
    let migrator = Migrator::new(cli.url.clone())
        .id(cli.id.clone())
        .path(cli.path.clone())
        .interrupts(interrupts);

    let operation = match cli.command {
        Commands::Create { name } => {
            let pair = migrator.create(&name).await?;
            println!(
                "Version {} migration files created in {}:",
                pair.version,
                cli.path.display()
            );
            println!("{}", pair.up.file_name);
            println!("{}", pair.down.file_name);
            return Ok(true);
        }
        Commands::Version => {
            println!("{}", migrator.version().await?);
            return Ok(true);
        }
        Commands::History => {
            let mut driver = SqliteDriver::new();
            driver.initialize(&ConnectionConfig::new(cli.url.clone())).await?;
            let history = driver.history(&cli.id).await;
            driver.close().await?;
            let history = history?;

            if history.is_empty() {
                info!("No migrations have been applied yet.");
            } else {
                println!("\nApplied versions:");
                println!("{:-<60}", "");
                for applied in &history {
                    println!(
                        " [X] {} ({})",
                        format_version(applied.version),
                        applied.applied_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!();
            }
            return Ok(true);
        }
        Commands::Up => Operation::Up,
        Commands::Down => Operation::Down,
        Commands::Reset => Operation::Reset,
        Commands::Redo => Operation::Redo,
        Commands::Migrate { n } => Operation::Migrate(n),
        Commands::Goto { version } => Operation::Goto(version),
    };

    if !cli.non_graceful {
        spawn_force_quit();
    }

    let started = Instant::now();
    let ok = write_pipe(migrator.stream(operation), cli.json).await?;

    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 60.0 {
        eprintln!("\n{:.4} minutes", elapsed / 60.0);
    } else {
        eprintln!("\n{elapsed:.4} seconds");
    }
    Ok(ok)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if run(cli).await? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
