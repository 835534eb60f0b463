//! Main CLI application structure

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use super::output::{Output, OutputFormat};
use super::{backend_cmd, check_cmd, file_cmd};
use crate::storage::Config;
use crate::workspace::Workspace;

#[derive(Parser)]
#[command(name = "dataprov")]
#[command(author, version, about = "Multi-backend file storage with a local cache")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format (defaults to the global config, then text)
    #[arg(long, short = 'f', global = true)]
    pub format: Option<OutputFormat>,

    /// Enable debug logging on stderr
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new dataprov workspace
    Init {
        /// Path to initialize (defaults to current directory)
        #[arg(default_value = ".")]
        path: String,
    },

    /// Inspect configured backends
    #[command(subcommand)]
    Backend(backend_cmd::BackendCommands),

    /// Register, transfer and manage files
    #[command(subcommand)]
    File(file_cmd::FileCommands),

    /// Report (and optionally repair) drift on a backend
    Check {
        /// Backend name or id
        backend: String,

        /// Apply the suggested repair to every issue found
        #[arg(long)]
        repair: bool,

        /// Run again every SECS seconds until interrupted
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },
}

/// Installs the stderr log subscriber. `RUST_LOG` wins unless `--verbose`.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,dataprov=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Main entry point for the CLI
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let format = match cli.format {
        Some(format) => format,
        None => Config::load_global()
            .map(|global| global.default_format.into())
            .unwrap_or_default(),
    };
    let output = Output::new(format, cli.verbose);

    match cli.command {
        Commands::Init { path } => {
            output.verbose_ctx("init", &format!("Initializing workspace at: {}", path));
            let workspace = Workspace::init(&path)?;
            output.done(&format!(
                "Initialized dataprov workspace at {}",
                workspace.root().display()
            ));
        }

        Commands::Backend(cmd) => backend_cmd::run(cmd, &output)?,
        Commands::File(cmd) => file_cmd::run(cmd, &output)?,

        Commands::Check {
            backend,
            repair,
            every,
        } => check_cmd::run(&output, &backend, repair, every)?,
    }

    Ok(())
}
