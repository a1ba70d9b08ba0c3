// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable serving images and their objects from one listener. The
//! object service is colocated so that adding an image can verify its
//! content is already uploaded.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use image_server::{Config, ImageStore};
use object_store::ObjectStore;
use slog::info;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
struct Args {
    #[clap(long)]
    config_file: Utf8PathBuf,

    /// Override the configured listen address.
    #[clap(long)]
    listen_address: Option<String>,

    /// Serving images requires no privilege; refuse root unless asked.
    #[clap(long)]
    allow_privileged: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    // SAFETY: getuid cannot fail and touches no memory.
    if unsafe { libc::getuid() } == 0 && !args.allow_privileged {
        anyhow::bail!(
            "refusing to run as root; pass --allow-privileged to override"
        );
    }
    let config_file_contents = std::fs::read_to_string(&args.config_file)
        .with_context(|| format!("read config file {:?}", args.config_file))?;
    let mut config: Config = toml::from_str(&config_file_contents)
        .with_context(|| format!("parse config file {:?}", args.config_file))?;
    if let Some(listen_address) = args.listen_address {
        config.listen_address = listen_address;
    }

    let log = config.log.to_logger("image-server");
    info!(log, "starting";
        "image_dir" => config.image_dir.as_str(),
        "object_dir" => config.object_dir.as_str(),
        "listen_address" => &config.listen_address);

    let objects = Arc::new(
        ObjectStore::open(&config.object_dir, &log)
            .await
            .context("opening object store")?,
    );
    let images = Arc::new(
        ImageStore::open(&config.image_dir, &log)
            .await
            .context("opening image store")?,
    );

    let mut server = srpc::Server::new(log.clone());
    object_store::rpcd::register(&mut server, &objects, &log);
    image_server::rpcd::register(&mut server, &images, &objects, &log);

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("binding {}", config.listen_address))?;
    Arc::new(server).serve(listener).await.context("serving")?;
    Ok(())
}
