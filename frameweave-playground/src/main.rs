// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Demonstration driver for the frameweave framework.
//!
//! One binary plays both roles: `--eq-server` builds a sort-last demo
//! configuration, auto-launches a render process (this same binary with
//! `--eq-client`) and drives a fixed number of frames through the
//! cluster. The launched client connects back, maps the config session
//! and executes the dispatched draw tasks on headless windows.

use std::env;
use std::io::stderr;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_glog::Glog;
use tracing_glog::GlogFields;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use frameweave::client::{Client, ClientOptions};

mod demo;

#[derive(Parser, Debug)]
#[command(about = "frameweave demonstration: distributed sort-last rendering")]
struct Args {
    /// Run as the cluster server, driving the demo configuration
    #[arg(long = "eq-server")]
    server: bool,

    /// Configuration file; the demo ignores it and builds its
    /// configuration in code
    #[arg(long = "eq-config")]
    config: Option<PathBuf>,

    /// Run as an auto-launched render client;
    /// ARGS = listenerAddress#requestID
    #[arg(long = "eq-client", value_name = "ARGS")]
    client: Option<String>,

    /// Number of frames the server renders before exiting
    #[arg(long, default_value_t = 60)]
    frames: u32,
}

/// `EQ_LOG_LEVEL` selects the base level, `EQ_LOG_TOPICS` adds
/// per-module directives
fn init_logging() {
    let fmt = tracing_subscriber::fmt::Layer::default()
        .with_ansi(stderr().is_terminal())
        .with_writer(std::io::stderr)
        .event_format(Glog::default().with_timer(tracing_glog::LocalTime::default()))
        .fmt_fields(GlogFields::default());

    let level = env::var("EQ_LOG_LEVEL").unwrap_or_else(|_| "info".into());
    let mut filter = EnvFilter::new(level);
    if let Ok(topics) = env::var("EQ_LOG_TOPICS") {
        for topic in topics.split(',').filter(|t| !t.is_empty()) {
            if let Ok(directive) = topic.parse() {
                filter = filter.add_directive(directive);
            }
        }
    }

    let subscriber = Registry::default().with(filter).with(fmt);
    tracing::subscriber::set_global_default(subscriber).expect("to set global subscriber");
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    if let Some(client_args) = args.client {
        // auto-launched render process: dial back and serve tasks
        let options = ClientOptions::from_client_args(client_args);
        return match Client::run(options, Arc::new(demo::DemoFactory)).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!("Render client failed: {err}");
                ExitCode::FAILURE
            }
        };
    }

    if args.server {
        if let Some(config) = &args.config {
            tracing::warn!(
                "Ignoring {}: the demo builds its configuration in code",
                config.display()
            );
        }
        return match demo::run_server(args.frames).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!("Server failed: {err}");
                ExitCode::FAILURE
            }
        };
    }

    eprintln!("Nothing to do: pass --eq-server or --eq-client ARGS");
    ExitCode::FAILURE
}
