// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

mod cli;
mod daemon;
mod logger;
mod subcommand;

use cli::{cli_error_and_die, load_config, Cli, EXIT_CONFIG};

use async_std::task;
use structopt::StructOpt;

fn main() {
    let Cli { opts, cmd } = Cli::from_args();

    let config = match load_config(&opts) {
        Ok(config) => config,
        Err(e) => cli_error_and_die(&format!("invalid configuration: {e}"), EXIT_CONFIG),
    };

    logger::setup_logger(&config.logging);

    match cmd {
        Some(command) => {
            if let Err(e) = subcommand::process(command, config) {
                cli_error_and_die(&e.to_string(), 1);
            }
        }
        None => {
            let code = task::block_on(daemon::start(config));
            std::process::exit(code);
        }
    }
}
