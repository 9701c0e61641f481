mod cli;
mod config;
mod db;
mod error;
mod metadata;
mod utils;

use cli::Cli;
use config::Config;
use log::{debug, error};

fn main() {
    let config = Config::get();

    // The handle must stay alive for the life of the process
    let _logger = match flexi_logger::Logger::try_with_str(config.log_spec())
        .and_then(|logger| logger.start())
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    debug!(
        "Command-line args: {:?}",
        std::env::args_os().collect::<Vec<_>>()
    );

    if let Err(err) = Cli::handle_command_line() {
        error!("{err}");
        eprintln!("{err}");
        std::process::exit(1);
    }
}
