mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use commands::migrate;

#[derive(Parser)]
#[command(name = "terrace")]
#[command(about = "SQL migration runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database migration management
    #[command(visible_alias = "m")]
    Migrate {
        #[command(subcommand)]
        migrate_command: MigrateCommands,

        /// Environment whose connection configuration to use
        #[arg(long, short = 'e', global = true, default_value = "development")]
        environment: String,

        /// Path to the configuration file
        #[arg(long, short = 'c', global = true, default_value = "terrace.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Create a new timestamped migration file
    #[command(visible_alias = "c")]
    Create {
        /// Migration name
        name: String,
    },

    /// Apply the next pending migration
    #[command(visible_alias = "u")]
    Up,

    /// Apply all pending migrations as one batch
    #[command(visible_alias = "l")]
    Latest,

    /// Rollback the most recent batch of migrations
    #[command(visible_alias = "r")]
    Rollback {
        /// Revert every applied migration, across all batches
        #[arg(long, short = 'a')]
        all: bool,
    },

    /// Show applied and pending migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate {
            migrate_command,
            environment,
            config,
        } => match migrate_command {
            MigrateCommands::Create { name } => {
                migrate::create(&config, &name)?;
            }
            MigrateCommands::Up => {
                migrate::up(&config, &environment).await?;
            }
            MigrateCommands::Latest => {
                migrate::latest(&config, &environment).await?;
            }
            MigrateCommands::Rollback { all } => {
                migrate::rollback(&config, &environment, all).await?;
            }
            MigrateCommands::Status { json } => {
                migrate::status(&config, &environment, json).await?;
            }
        },
    }

    Ok(())
}
