use std::process;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error};

use plughost::{app, cli, display, logging, manager::PluginManager};

fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Panic: {}", panic_info);
        process::exit(101);
    }));

    if let Err(e) = run() {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = cli::parse_args();
    cli::validate_args(&args)?;

    let config_manager = app::load_configuration(&args)?;
    logging::init_logger(app::configure_logging(&args, &config_manager)?)?;

    let host_config = config_manager.host_config()?;
    debug!("Host configuration: {:?}", host_config);
    let colours = display::ColourManager::from_args(args.no_color);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("plughost-worker")
        .build()?;

    runtime.block_on(async {
        let manager = PluginManager::new(host_config);
        match &args.command {
            cli::Command::Inspect { artifact } => app::inspect(&manager, artifact, &colours, args.json),
            cli::Command::Discover { dir, recursive } => {
                app::discover(&manager, dir, *recursive, &colours, args.json).await
            }
            cli::Command::Run {
                artifacts,
                hold_ms,
                watch,
            } => {
                let hold = hold_ms.map(Duration::from_millis);
                app::run_plugins(&manager, artifacts, hold, *watch, &colours, args.json).await
            }
        }
    })
}
