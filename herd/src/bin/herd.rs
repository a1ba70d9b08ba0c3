// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The herd daemon: watches the machine database, schedules convergence
//! cycles against every sub and exports the admin RPC surface.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use herd::{Config, Herd};
use slog::{info, o};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
struct Args {
    #[clap(long)]
    config_file: Utf8PathBuf,

    /// Override the configured admin listen address.
    #[clap(long)]
    listen_address: Option<String>,
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

    let log = config.log.to_logger("herd");
    info!(log, "starting";
        "image_server" => &config.image_server_address,
        "mdb_file" => config.mdb_file.as_str(),
        "listen_address" => &config.listen_address);

    let mdb_file = config.mdb_file.clone();
    let listen_address = config.listen_address.clone();
    let herd = Arc::new(Herd::new(config, &log));

    tokio::spawn(herd::mdb::run_watcher(
        Arc::clone(&herd),
        mdb_file,
        log.new(o!("component" => "mdb-watcher")),
    ));
    tokio::spawn(herd::scheduler::run_scheduler(Arc::clone(&herd)));

    let mut server = srpc::Server::new(log.clone());
    herd::rpcd::register(&mut server, &herd);
    let listener = TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("binding {}", listen_address))?;
    Arc::new(server).serve(listener).await.context("serving")?;
    Ok(())
}
