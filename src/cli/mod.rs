//! # CLI Module
//!
//! This module provides the command-line interface for the Turnstile
//! admission gateway.
//!
//! ## Commands
//!
//! ### Server Operations
//! - `start`: Launch the gateway server
//!
//! ### Environment
//! - `validate-env`: Validate the environment and print the findings
//! - `env-example`: Print a commented example `.env` file
//!
//! ### Bucket Management
//! - `list-buckets`: Display all persisted admission buckets
//! - `reset-bucket`: Delete the persisted bucket for one identity
//!
//! ### Database
//! - `migrate`: Show migration status and apply pending migrations
//!
//! ## Usage Example
//!
//! ```bash
//! # Inspect the environment before deploying
//! turnstile validate-env
//!
//! # Run the gateway
//! TURNSTILE_UPSTREAM_URL=http://localhost:8080 turnstile start
//!
//! # Clear one caller's quota
//! turnstile reset-bucket --identity 1.1.1.1
//! ```

use crate::database::{DatabaseManager, queries};
use crate::env::{self, generate_env_example, print_validation_results, validate_environment};
use crate::logging::init_tracing;
use crate::server;
use chrono::DateTime;
use clap::{Parser, Subcommand};

///////////////////////////////////////////////////////////////////////////////
//****                        Private Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

#[derive(Parser)]
#[command(name = "turnstile")]
#[command(about = "The Turnstile admission gateway CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the admission gateway server
    #[command(name = "start")]
    Start,
    /// Validate environment variables and print the findings
    #[command(name = "validate-env")]
    ValidateEnv,
    /// Print a commented example .env file
    #[command(name = "env-example")]
    EnvExample,
    /// List all persisted admission buckets
    #[command(name = "list-buckets")]
    ListBuckets,
    /// Delete the persisted bucket for one identity
    #[command(name = "reset-bucket")]
    ResetBucket {
        #[arg(long)]
        identity: String,
    },
    /// Show migration status and apply pending migrations
    #[command(name = "migrate")]
    Migrate,
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Parse and execute the CLI command.
pub async fn run() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let default_filter = std::env::var("TURNSTILE_LOG_LEVEL")
                .unwrap_or_else(|_| "turnstile=info,tower_http=debug".to_string());
            init_tracing(&default_filter);

            let config = env::get_config();
            let db_manager = match DatabaseManager::connect_with_file_creation(&config.database_url)
                .await
            {
                Ok(manager) => manager,
                Err(err) => {
                    eprintln!("Failed to open database {}: {}", config.database_url, err);
                    std::process::exit(1);
                }
            };
            if let Err(err) = db_manager.initialize().await {
                eprintln!("Failed to initialize database: {}", err);
                std::process::exit(1);
            }

            server::start_server(db_manager.pool().clone(), config).await;
        }
        Commands::ValidateEnv => {
            let result = validate_environment();
            let failed = result.is_err();
            print_validation_results(&result);
            if failed {
                std::process::exit(1);
            }
        }
        Commands::EnvExample => {
            println!("{}", generate_env_example());
        }
        Commands::ListBuckets => {
            let db_manager = connect_or_exit().await;
            match queries::fetch_all_buckets(db_manager.pool()).await {
                Ok(buckets) => {
                    println!(
                        "\n{:<40} | {:<8} | {:<24}",
                        "Identity", "Count", "Window Started"
                    );
                    println!("{:-<78}", "");
                    for bucket in &buckets {
                        println!(
                            "{:<40} | {:<8} | {:<24}",
                            bucket.identity,
                            bucket.count,
                            format_window_start(bucket.window_start_ms)
                        );
                    }
                    let total = queries::count_buckets(db_manager.pool())
                        .await
                        .unwrap_or(buckets.len() as i64);
                    println!("\n{} bucket(s)", total);
                }
                Err(err) => {
                    eprintln!("Failed to list buckets: {}", err);
                    std::process::exit(1);
                }
            }
        }
        Commands::ResetBucket { identity } => {
            let db_manager = connect_or_exit().await;
            match queries::delete_bucket(db_manager.pool(), &identity).await {
                Ok(true) => println!("Removed bucket: {}", identity),
                Ok(false) => println!("No bucket found for: {}", identity),
                Err(err) => {
                    eprintln!("Failed to reset bucket: {}", err);
                    std::process::exit(1);
                }
            }
        }
        Commands::Migrate => {
            let db_manager = connect_or_exit().await;
            match db_manager.migration_status().await {
                Ok((applied, pending)) => {
                    println!("Applied migrations: {:?}", applied);
                    println!("Pending migrations: {:?}", pending);
                }
                Err(err) => {
                    eprintln!("Failed to read migration status: {}", err);
                    std::process::exit(1);
                }
            }
            if let Err(err) = db_manager.apply_pending_migrations().await {
                eprintln!("Failed to apply migrations: {}", err);
                std::process::exit(1);
            }
            println!("All pending migrations applied.");
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                       Private Functions                           ****//
///////////////////////////////////////////////////////////////////////////////

async fn connect_or_exit() -> DatabaseManager {
    let database_url = env::database_url();
    match DatabaseManager::connect_with_file_creation(&database_url).await {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("Failed to open database {}: {}", database_url, err);
            std::process::exit(1);
        }
    }
}

fn format_window_start(window_start_ms: i64) -> String {
    DateTime::from_timestamp_millis(window_start_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| format!("{} ms", window_start_ms))
}
