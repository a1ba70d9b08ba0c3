// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sub agent daemon.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use slog::info;
use sub_agent::{Config, SubState};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
struct Args {
    #[clap(long)]
    config_file: Utf8PathBuf,

    /// Override the configured listen address.
    #[clap(long)]
    listen_address: Option<String>,

    /// Reject Fetch, Update and Cleanup before any work.
    #[clap(long)]
    read_only: bool,

    /// Debugging aid: exit the process on any fetch failure.
    #[clap(long)]
    exit_on_fetch_failure: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config_file_contents = std::fs::read_to_string(&args.config_file)
        .with_context(|| format!("read config file {:?}", args.config_file))?;
    let mut config: Config = toml::from_str(&config_file_contents)
        .with_context(|| format!("parse config file {:?}", args.config_file))?;
    if let Some(listen_address) = args.listen_address {
        config.listen_address = listen_address;
    }
    config.read_only |= args.read_only;
    config.exit_on_fetch_failure |= args.exit_on_fetch_failure;

    let log = config.log.to_logger("subd");
    info!(log, "starting";
        "root_dir" => config.root_dir.as_str(),
        "data_dir" => config.data_dir.as_str(),
        "listen_address" => &config.listen_address,
        "read_only" => config.read_only);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir))?;
    let listen_address = config.listen_address.clone();
    let (state, rescan_rx) =
        SubState::new(config, &log).await.context("initializing agent state")?;
    tokio::spawn(sub_agent::scanner::run_scanner(Arc::clone(&state), rescan_rx));

    let mut server = srpc::Server::new(log.clone());
    sub_agent::rpcd::register(&mut server, &state);
    let listener = TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("binding {}", listen_address))?;
    Arc::new(server).serve(listener).await.context("serving")?;
    Ok(())
}
