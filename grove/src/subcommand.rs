// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::cli::{resolve_cluster_secret, Config, Subcommand};
use grove_identity::Identity;

/// Process CLI subcommands.
pub(super) fn process(command: Subcommand, config: Config) -> anyhow::Result<()> {
    match command {
        Subcommand::Id => {
            let identity = Identity::init(config.data_dir())?;
            println!("node_id:    {}", identity.node_id());
            println!("tunnel_pub: {}", identity.tunnel_public());
            println!("created_at: {}", identity.created_at().to_rfc3339());
            Ok(())
        }
        Subcommand::Token => {
            let identity = Identity::init(config.data_dir())?;
            let secret = resolve_cluster_secret(&config)?;
            println!(
                "{}",
                grove_admission::issue_join_proof(&secret, identity.node_id())
            );
            Ok(())
        }
        Subcommand::Config => {
            println!("{}", toml::to_string(&config)?);
            Ok(())
        }
    }
}
