// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subcommand dispatch for the admin tools.
//!
//! Every tool shares one grammar: `<tool> [common-flags] <subcommand>
//! [args]`. An unknown subcommand or an argument count outside the
//! declared bounds exits 2. After a handler returns successfully the
//! dispatcher exits 3; handlers that want a different exit code terminate
//! the process themselves before returning.

use std::process::exit;

pub struct Subcommand<C> {
    pub name: &'static str,
    /// Argument placeholders shown in the usage message, e.g. `"<hostname>"`.
    pub args: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub handler: fn(&mut C, &[String]) -> anyhow::Result<()>,
}

fn print_usage<C>(tool: &str, commands: &[Subcommand<C>]) {
    eprintln!("Usage: {} [flags...] <subcommand> [args...]", tool);
    eprintln!("Subcommands:");
    for command in commands {
        eprintln!("  {} {}", command.name, command.args);
    }
}

pub fn dispatch<C>(tool: &str, commands: &[Subcommand<C>], context: &mut C, args: &[String]) -> ! {
    let Some(name) = args.first() else {
        print_usage(tool, commands);
        exit(2);
    };
    let Some(command) = commands.iter().find(|command| command.name == name) else {
        eprintln!("{}: unknown subcommand: {}", tool, name);
        print_usage(tool, commands);
        exit(2);
    };
    let rest = &args[1..];
    if rest.len() < command.min_args || rest.len() > command.max_args {
        eprintln!("{}: wrong number of arguments for: {}", tool, name);
        print_usage(tool, commands);
        exit(2);
    }
    match (command.handler)(context, rest) {
        Ok(()) => exit(3),
        Err(error) => {
            eprintln!("{}: {}: {:#}", tool, name, error);
            exit(1);
        }
    }
}
