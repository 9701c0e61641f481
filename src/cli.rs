use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::db::ledger::VersionLedger;
use crate::db::migrate::{MigrationReport, Migrator};
use crate::db::schema::LATEST_VERSION;
use crate::db::Database;
use crate::error::AniTrackError;
use crate::metadata::{JsonFileProvider, MetadataProvider, NoMetadata};

#[derive(Parser)]
#[command(
    name = "anitrack",
    version,
    about = "AniTrack: personal anime tracking with versioned schema migrations"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Migrate the database to the latest schema version (default if no command specified)
    Migrate {
        /// Database file path (default: per-user data directory)
        #[arg(long = "db-path", short = 'd')]
        db_path: Option<PathBuf>,

        /// Abort a transition on the first row-level migration failure
        #[arg(long = "strict", default_value_t = false)]
        strict: bool,

        /// JSON file with canned series metadata used to enrich data migrations
        #[arg(long = "metadata", short = 'm')]
        metadata: Option<PathBuf>,
    },

    /// Show the schema version ledger and pending transitions
    Status {
        /// Database file path (default: per-user data directory)
        #[arg(long = "db-path", short = 'd')]
        db_path: Option<PathBuf>,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), AniTrackError> {
        let args = Cli::parse();

        // Default to Migrate if no command specified
        match args.command.unwrap_or(Command::Migrate {
            db_path: None,
            strict: false,
            metadata: None,
        }) {
            Command::Migrate {
                db_path,
                strict,
                metadata,
            } => Self::migrate(db_path, strict, metadata),
            Command::Status { db_path } => Self::status(db_path),
        }
    }

    fn migrate(
        db_path: Option<PathBuf>,
        strict_flag: bool,
        metadata: Option<PathBuf>,
    ) -> Result<(), AniTrackError> {
        let config = Config::get();
        let strict = strict_flag || config.migration.strict;
        let db = Database::open(&db_path.unwrap_or_else(|| config.db_path()))?;

        let provider: Box<dyn MetadataProvider> = match metadata {
            Some(path) => Box::new(JsonFileProvider::load(&path)?),
            None => Box::new(NoMetadata),
        };

        let mut migrator = Migrator::new(&db, strict, provider.as_ref());
        match migrator.run_to_latest() {
            Ok(report) => {
                Self::print_report(&report);
                println!("Database is at schema version {LATEST_VERSION}.");
                Ok(())
            }
            Err(err) => {
                // Surface the failing version pair and row-level errors verbatim
                if let AniTrackError::RowMigration { from, to, errors } = &err {
                    eprintln!(
                        "Transition v{from} -> v{to} failed on {} row(s):",
                        errors.len()
                    );
                    for row_error in errors {
                        eprintln!("  {row_error}");
                    }
                }
                Err(err)
            }
        }
    }

    fn print_report(report: &MigrationReport) {
        if report.applied.is_empty() {
            println!("Nothing to do: every transition is already applied.");
            return;
        }
        for transition in &report.applied {
            match transition.from {
                Some(from) => println!(
                    "Applied v{} -> v{}: {} row(s) migrated, {} failed",
                    from, transition.to, transition.migrated, transition.failed
                ),
                None => println!("Created schema v{}", transition.to),
            }
            for row_error in &transition.errors {
                println!("  {row_error}");
            }
        }
    }

    fn status(db_path: Option<PathBuf>) -> Result<(), AniTrackError> {
        let config = Config::get();
        let db = Database::open(&db_path.unwrap_or_else(|| config.db_path()))?;
        let conn = db.conn();

        match VersionLedger::current_version(conn)? {
            None => println!("Database is uninitialized: no schema version recorded."),
            Some(version) => {
                println!("Current schema version: {version} (latest: {LATEST_VERSION})");
                for entry in VersionLedger::history(conn)? {
                    println!(
                        "  v{}  {}  {}",
                        entry.version,
                        entry.applied_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.description
                    );
                }
                if version < LATEST_VERSION {
                    println!(
                        "{} transition(s) pending. Run 'anitrack migrate'.",
                        LATEST_VERSION - version
                    );
                }
            }
        }
        Ok(())
    }
}
