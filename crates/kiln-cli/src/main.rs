#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]

mod commands;
mod logging;

use clap::Parser;
use kiln_core::Mode;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about = "Static-asset bundler with a live-updating dev server", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Build the project once and write the output directory
    Build {
        /// Build mode: development or production
        #[arg(long, default_value = "production", value_parser = parse_mode)]
        mode: Mode,

        /// Output directory (overrides `outputDir` in kiln.json)
        #[arg(long, value_name = "DIR")]
        dist: Option<PathBuf>,

        /// Config file (defaults to ./kiln.json when present)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Serve the project from memory and push live updates on change
    Dev {
        /// Port to listen on (overrides `server.port`)
        #[arg(long)]
        port: Option<u16>,

        /// Host to bind to (overrides `server.host`)
        #[arg(long)]
        host: Option<String>,

        /// Open the browser once the server is up
        #[arg(long)]
        open: bool,

        /// Build mode; only development is served
        #[arg(long, default_value = "development", value_parser = parse_mode)]
        mode: Mode,

        /// Config file (defaults to ./kiln.json when present)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

fn parse_mode(s: &str) -> std::result::Result<Mode, String> {
    Mode::parse(s).ok_or_else(|| format!("unknown mode '{s}' (expected development or production)"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    logging::init(cli.verbose, cli.json);

    match cli.command {
        Commands::Build { mode, dist, config } => commands::build::run(
            commands::build::BuildAction {
                cwd,
                mode,
                dist,
                config,
            },
            cli.json,
        ),
        Commands::Dev {
            port,
            host,
            open,
            mode,
            config,
        } => {
            let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
            runtime.block_on(commands::dev::run(commands::dev::DevAction {
                cwd,
                port,
                host,
                open,
                mode,
                config,
            }))
        }
        Commands::Version => {
            commands::version::run(cli.json);
            Ok(())
        }
    }
}
