//! Application wiring for the operator binary

pub mod execution;

use anyhow::Result;
use log::{debug, LevelFilter};

use crate::{cli, config, logging};

pub use execution::{discover, inspect, run_plugins};

pub fn load_configuration(args: &cli::Args) -> Result<config::ConfigManager> {
    let mut manager = match &args.config_file {
        Some(config_file) => {
            debug!("Loading configuration from explicit file: {}", config_file.display());
            config::ConfigManager::load_from_file(config_file.clone())?
        }
        None => config::ConfigManager::load()?,
    };

    if let Some(section_name) = &args.config_name {
        manager.select_section(section_name.clone());
    }
    Ok(manager)
}

/// Merge the `[logging]` section with command line flags; flags win
pub fn configure_logging(args: &cli::Args, config: &config::ConfigManager) -> Result<logging::LogConfig> {
    let mut log_config = logging::LogConfig::from_config(config)?;

    if args.debug {
        log_config.console_level = LevelFilter::Trace;
    } else if args.verbose {
        log_config.console_level = LevelFilter::Debug;
    } else if args.quiet {
        log_config.console_level = LevelFilter::Error;
    }

    if let Some(format) = &args.log_format {
        log_config.format = format.parse().map_err(anyhow::Error::msg)?;
    }

    if let Some(path) = &args.log_file {
        log_config.destination = logging::LogDestination::Both(path.clone());
        log_config.file_level = Some(match &args.log_file_level {
            Some(level) => logging::parse_log_level(level)?,
            None => log_config.file_level.unwrap_or(log_config.console_level),
        });
    }

    Ok(log_config)
}
