// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

mod config;

pub use config::{load_config, resolve_cluster_secret, resolve_gossip_key, Config, LoggingConfig};

use structopt::StructOpt;

/// Exit codes of the daemon entry point.
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_IDENTITY: i32 = 3;
pub const EXIT_ADMISSION: i32 = 4;
pub const EXIT_CONSENSUS: i32 = 5;
pub const EXIT_OVERLAY: i32 = 6;

/// CLI structure generated when interacting with the grove binary.
#[derive(StructOpt)]
#[structopt(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
pub struct Cli {
    #[structopt(flatten)]
    pub opts: CliOpts,
    #[structopt(subcommand)]
    pub cmd: Option<Subcommand>,
}

#[derive(StructOpt)]
pub enum Subcommand {
    #[structopt(name = "id", about = "Print this node's identity")]
    Id,

    #[structopt(name = "token", about = "Issue a join proof for diagnostics")]
    Token,

    #[structopt(name = "config", about = "Dump the effective configuration")]
    Config,
}

/// CLI options
#[derive(StructOpt, Debug)]
pub struct CliOpts {
    #[structopt(short, long, help = "A toml file containing relevant configurations")]
    pub config: Option<String>,
    #[structopt(long, help = "Override the data directory")]
    pub data_dir: Option<String>,
}

/// Print an error message and exit with the given code.
pub fn cli_error_and_die(msg: &str, code: i32) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(code);
}

/// Blocks until ctrl-c is received.
pub async fn block_until_sigint() {
    let (ctrlc_send, ctrlc_recv) = flume::bounded(1);
    ctrlc::set_handler(move || {
        let _ = ctrlc_send.send(());
    })
    .expect("Error setting Ctrl-C handler");
    let _ = ctrlc_recv.recv_async().await;
}
