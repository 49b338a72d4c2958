use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::debug;

/// Dynamic plugin host
#[derive(Parser, Debug)]
#[command(name = "plughost")]
#[command(about = "Load, inspect and run plugins in a managed host runtime")]
#[command(version)]
pub struct Args {
    /// Verbose output (debug level logging)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet output (error level logging only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Debug output (trace level logging)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log format: text or json
    #[arg(long, value_name = "FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Log file path for file output
    #[arg(long, value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// Log level for file output (independent of console level)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_file_level: Option<String>,

    /// Configuration file path
    #[arg(long, value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Configuration section consulted before all others
    #[arg(long, value_name = "SECTION", global = true)]
    pub config_name: Option<String>,

    /// Disable coloured output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show the descriptor of a plugin artifact without instantiating it
    Inspect {
        #[arg(value_name = "ARTIFACT")]
        artifact: PathBuf,
    },
    /// List loadable plugin artifacts in a directory
    Discover {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,
    },
    /// Load, initialize and run plugins until interrupted or the hold time elapses
    Run {
        #[arg(value_name = "ARTIFACT", required = true)]
        artifacts: Vec<PathBuf>,
        /// Milliseconds to keep plugins running before shutdown (default: until Ctrl-C)
        #[arg(long, value_name = "MS")]
        hold_ms: Option<u64>,
        /// Watch artifacts and reload plugins that declare hot-reload support
        #[arg(short, long)]
        watch: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Args {
    let args = Args::parse();
    debug!("Parsed CLI arguments: {:?}", args);
    args
}

/// Validate CLI argument combinations
pub fn validate_args(args: &Args) -> Result<()> {
    let log_flags_count = [args.verbose, args.quiet, args.debug]
        .iter()
        .filter(|&&flag| flag)
        .count();
    if log_flags_count > 1 {
        return Err(anyhow::anyhow!(
            "Conflicting log level flags: only one of --verbose, --quiet, or --debug may be specified"
        ));
    }

    if let Some(format) = &args.log_format {
        format
            .parse::<crate::logging::LogFormat>()
            .map_err(anyhow::Error::msg)?;
    }

    if let Some(level) = &args.log_file_level {
        crate::logging::parse_log_level(level)?;
        if args.log_file.is_none() {
            return Err(anyhow::anyhow!("--log-file-level requires --log-file to be specified"));
        }
    }

    if let Command::Run { hold_ms: Some(0), .. } = args.command {
        return Err(anyhow::anyhow!("--hold-ms must be greater than zero"));
    }

    Ok(())
}
