// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator tool for the herd's admin RPC surface.

use clap::Parser;
use herd_common::cli::{dispatch, Subcommand};
use herd_protocol::dominator::{
    DisableUpdatesRequest, DisableUpdatesResponse, EnableUpdatesRequest,
    EnableUpdatesResponse, ListSubsRequest, ListSubsResponse, PollSubRequest,
    PollSubResponse, DISABLE_UPDATES, ENABLE_UPDATES, LIST_SUBS, POLL_SUB,
};

#[derive(Parser, Debug)]
struct Args {
    #[clap(long, default_value = "localhost:6970")]
    herd_address: String,

    /// Subcommand and its arguments.
    #[clap(trailing_var_arg = true)]
    command: Vec<String>,
}

struct Context {
    runtime: tokio::runtime::Runtime,
    address: String,
}

const COMMANDS: &[Subcommand<Context>] = &[
    Subcommand {
        name: "disable-updates",
        args: "<reason>",
        min_args: 1,
        max_args: 1,
        handler: disable_updates,
    },
    Subcommand {
        name: "enable-updates",
        args: "",
        min_args: 0,
        max_args: 0,
        handler: enable_updates,
    },
    Subcommand {
        name: "poll-sub",
        args: "<hostname>",
        min_args: 1,
        max_args: 1,
        handler: poll_sub,
    },
    Subcommand {
        name: "list-subs",
        args: "",
        min_args: 0,
        max_args: 0,
        handler: list_subs,
    },
];

fn main() {
    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("herdctl: failed to start runtime: {}", err);
            std::process::exit(1);
        }
    };
    let mut context = Context { runtime, address: args.herd_address };
    dispatch("herdctl", COMMANDS, &mut context, &args.command)
}

fn disable_updates(context: &mut Context, args: &[String]) -> anyhow::Result<()> {
    let reason = args[0].clone();
    let address = context.address.clone();
    context.runtime.block_on(async move {
        let mut client = srpc::Client::dial(&address).await?;
        let _: DisableUpdatesResponse = client
            .request_reply(DISABLE_UPDATES, &DisableUpdatesRequest { reason })
            .await?;
        Ok(())
    })
}

fn enable_updates(context: &mut Context, _args: &[String]) -> anyhow::Result<()> {
    let address = context.address.clone();
    context.runtime.block_on(async move {
        let mut client = srpc::Client::dial(&address).await?;
        let _: EnableUpdatesResponse =
            client.request_reply(ENABLE_UPDATES, &EnableUpdatesRequest {}).await?;
        Ok(())
    })
}

fn poll_sub(context: &mut Context, args: &[String]) -> anyhow::Result<()> {
    let hostname = args[0].clone();
    let address = context.address.clone();
    context.runtime.block_on(async move {
        let mut client = srpc::Client::dial(&address).await?;
        let _: PollSubResponse =
            client.request_reply(POLL_SUB, &PollSubRequest { hostname }).await?;
        Ok(())
    })
}

fn list_subs(context: &mut Context, _args: &[String]) -> anyhow::Result<()> {
    let address = context.address.clone();
    let response: ListSubsResponse = context.runtime.block_on(async move {
        let mut client = srpc::Client::dial(&address).await?;
        client
            .request_reply(LIST_SUBS, &ListSubsRequest {})
            .await
            .map_err(anyhow::Error::from)
    })?;
    for sub in response.subs {
        println!(
            "{}\t{}\t{}\t{}",
            sub.hostname, sub.status, sub.required_image, sub.last_note
        );
    }
    Ok(())
}
