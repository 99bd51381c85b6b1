mod cli;
mod clock;
mod config;
mod error;
mod orchestrator;
mod session;
mod store;
mod transport;

use cli::Cli;
use config::{Config, CONFIG};
use directories::ProjectDirs;
use error::ScanError;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming};
use log::{error, info};

fn main() {
    if let Err(err) = run() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), ScanError> {
    let project_dirs = ProjectDirs::from("", "", "websentinel")
        .ok_or_else(|| ScanError::Error("Could not determine project directories".into()))?;

    let config = CONFIG.get_or_init(|| Config::load_config(&project_dirs));

    // Dropping the handle stops logging
    let _logger = setup_logging(&project_dirs, config)?;
    info!(
        "websentinel {} starting, args: {:?}",
        env!("CARGO_PKG_VERSION"),
        std::env::args_os().collect::<Vec<_>>()
    );

    Cli::handle_command_line(&project_dirs, config)
}

fn setup_logging(project_dirs: &ProjectDirs, config: &Config) -> Result<LoggerHandle, ScanError> {
    let log_dir = project_dirs.data_local_dir().join("logs");

    let handle = Logger::try_with_str(config.log_spec())?
        .log_to_file(
            FileSpec::default()
                .directory(log_dir)
                .basename("websentinel"),
        )
        .rotate(
            Criterion::Size(10 * 1024 * 1024),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(5),
        )
        .format(flexi_logger::detailed_format)
        .start()?;

    Ok(handle)
}
