// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! shoveld: relays messages between AMQP brokers, from a source queue to a
//! sink exchange, with confirm-gated acknowledgment.

use clap::Parser;
use shoveld::{config, worker, worker::RelayWorker};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(version, about)]
struct CliArgs {
    /// Paths to shovel configuration files, one YAML document per shovel
    #[arg(required = true)]
    config: Vec<PathBuf>,

    /// Number of runtime worker threads
    #[arg(long, default_value_t = default_threads())]
    threads: usize,
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Uses `RUST_LOG` for filtering, defaulting to `info` level.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}

fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(args))
}

async fn run(args: CliArgs) -> ExitCode {
    let shovels = match config::load_shovels(&args.config) {
        Ok(shovels) => shovels,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut workers = vec![];

    for shovel in shovels {
        info!(
            shovel = %shovel.name,
            concurrency = shovel.concurrency,
            "initializing shovel"
        );

        let shovel = Arc::new(shovel);
        for _ in 0..shovel.concurrency {
            let worker = RelayWorker::new(shovel.clone());
            workers.push(tokio::spawn(worker.run()));
        }
    }

    // The first worker to fail fatally takes the process down with it.
    match worker::wait_for_workers(workers).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "shovel worker failed");
            ExitCode::FAILURE
        }
    }
}
