//! dlsync CLI - resumable downloads from the command line
//!
//! Every invocation opens the task database, runs what it was asked to and
//! exits. Jobs only live as long as the process; interrupted downloads are
//! picked up again with `dlsync resume`.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// dlsync - resumable download manager
#[derive(Parser)]
#[command(name = "dlsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory holding the task database and config.json
    #[arg(long, env = "DLSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Log engine activity to stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more URLs
    Add {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Destination directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List tasks
    List {
        /// Filter by state
        #[arg(short, long)]
        status: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show task info
    Info {
        /// Task ID or a unique prefix of it
        id: String,
    },

    /// Continue a paused, failed or interrupted task
    Resume {
        /// Task ID or a unique prefix of it
        id: String,
    },

    /// Delete a task and its files
    Delete {
        /// Task ID or a unique prefix of it
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "dlsync_core=debug,dlsync=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("dlsync"))
            .unwrap_or_else(|| PathBuf::from(".dlsync"))
    });

    // These never touch the task database
    match cli.command {
        Commands::Config { action } => {
            return commands::config_action(&data_dir, action, cli.output).await;
        }
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "dlsync", &mut std::io::stdout());
            return Ok(());
        }
        _ => {}
    }

    let config = dlsync_core::config::load_config(&data_dir).await?;
    let service = dlsync_core::DownloadService::builder(config).build().await?;

    let result = match cli.command {
        Commands::Add { urls, output } => {
            commands::add_downloads(&service, urls, output, cli.output).await
        }

        Commands::List { status, all } => {
            commands::list_tasks(&service, status, all, cli.output).await
        }

        Commands::Info { id } => commands::show_info(&service, &id, cli.output).await,

        Commands::Resume { id } => commands::resume_task(&service, &id, cli.output).await,

        Commands::Delete { id, yes } => {
            commands::delete_task(&service, &id, yes, cli.output).await
        }

        Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
    };

    service.shutdown().await?;
    result
}
