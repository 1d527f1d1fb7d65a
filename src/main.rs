//! Mock load for mqtt brokers. Spawns n clients against a broker and either
//!
//! - publishes a fixed number of fixed size messages, spread round robin over
//!   the clients, as fast as the broker acks them, or
//! - subscribes every client to a topic and measures how fast messages come in
//!
//! and reports the throughput.

#[macro_use]
extern crate log;

use std::env;

use clap::Parser;
use log::LevelFilter;

use crate::cli::Cli;

mod bench;
mod cli;
mod common;
mod link;
mod report;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.debug());

    match cli {
        Cli::Pub(config) => bench::start(config.into()),
        Cli::Sub(config) => bench::start(config.into()),
    }
}

/// `info` by default, `debug` with `--debug`. `RUST_LOG` still refines both.
fn init_logger(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(level);
    if let Ok(filters) = env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.init();
}
