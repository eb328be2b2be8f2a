use clap::Parser;

use sfs3::config::args::Command;
use sfs3::{CliArgs, Config};

mod cli;
mod tracing;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // `version` needs no configuration at all.
    if matches!(args.command, Command::Version) {
        println!("sfs3 {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let command = args.command.clone();
    let config = load_config_exit_if_err(args);

    tracing::init_tracing(&config);
    ::tracing::trace!("config = {config:?}");

    let exit_code = cli::run(config, command).await;
    std::process::exit(exit_code);
}

fn load_config_exit_if_err(args: CliArgs) -> Config {
    match Config::try_from(args) {
        Ok(config) => config,
        Err(error_message) => {
            clap::Error::raw(clap::error::ErrorKind::ValueValidation, error_message).exit()
        }
    }
}
