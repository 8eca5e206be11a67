// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::cli::LoggingConfig;
use log::LevelFilter;
use std::str::FromStr;

/// Configure the global logger from the `logging` section. `RUST_LOG`
/// still applies on top for targeted debugging.
pub fn setup_logger(logging: &LoggingConfig) {
    let mut logger_builder = pretty_env_logger::formatted_timed_builder();

    let level = LevelFilter::from_str(&logging.level).unwrap_or(LevelFilter::Info);
    logger_builder.filter(None, level);

    // The swarm internals are chatty below warn.
    logger_builder.filter(Some("libp2p_gossipsub"), LevelFilter::Warn);
    logger_builder.filter(Some("libp2p_swarm"), LevelFilter::Warn);
    logger_builder.filter(Some("libp2p_tcp"), LevelFilter::Warn);
    logger_builder.filter(Some("yamux"), LevelFilter::Warn);

    if let Ok(spec) = std::env::var("RUST_LOG") {
        logger_builder.parse_filters(&spec);
    }

    if let Err(e) = logger_builder.try_init() {
        eprintln!("Warning: could not initialize logger: {e}");
    }
}
