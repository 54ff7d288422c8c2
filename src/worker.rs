// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Relay Worker and Reconnection Supervisor
//!
//! A `RelayWorker` is one concurrency slot of a shovel. It owns a dedicated
//! source connection/channel pair and sink connection/channel pair, installs
//! the topology, and runs the relay pipeline under a reconnection loop.
//!
//! The loop alternates between two states: disconnected (connecting and
//! installing topology, with capped exponential backoff between attempts) and
//! connected (relaying until the pipeline reports an error). Transport errors
//! tear both connections down and go back to disconnected; fatal errors
//! (misconfigured topology) propagate to the harness and end the process.

use crate::{channel::new_amqp_channel, config::ShovelConfig, errors::AmqpError, relay, topology};
use futures_util::{stream::FuturesUnordered, StreamExt};
use lapin::{Channel, Connection};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const MAX_RECONNECT_DELAY_SECS: u64 = 30;

/// One relay instance of a shovel. Several workers may share the same
/// configuration record; each owns its connections exclusively.
pub struct RelayWorker {
    shovel: Arc<ShovelConfig>,
}

struct BrokerLinks {
    source_connection: Connection,
    source_channel: Channel,
    sink_connection: Connection,
    sink_channel: Channel,
}

impl BrokerLinks {
    async fn close(self) {
        // The connections may already be gone; teardown is best effort.
        let _ = self.source_connection.close(200, "shovel teardown").await;
        let _ = self.sink_connection.close(200, "shovel teardown").await;
    }
}

impl RelayWorker {
    pub fn new(shovel: Arc<ShovelConfig>) -> RelayWorker {
        RelayWorker { shovel }
    }

    /// Runs the worker until a fatal error occurs. Transient failures are
    /// retried indefinitely with backoff; this is the permanent steady state
    /// of the instance.
    pub async fn run(self) -> Result<(), AmqpError> {
        let mut attempt: u32 = 0;

        loop {
            match self.connect().await {
                Ok(links) => {
                    attempt = 0;
                    info!(shovel = %self.shovel.name, "connected, relaying");

                    let result =
                        relay::run(&self.shovel, &links.source_channel, &links.sink_channel).await;
                    links.close().await;

                    match result {
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => {
                            warn!(
                                shovel = %self.shovel.name,
                                error = err.to_string(),
                                "relay interrupted, reconnecting"
                            );
                        }
                        Ok(()) => {
                            warn!(shovel = %self.shovel.name, "relay ended, reconnecting");
                        }
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(
                        shovel = %self.shovel.name,
                        error = err.to_string(),
                        "connection attempt failed"
                    );
                }
            }

            attempt = attempt.saturating_add(1);
            tokio::time::sleep(reconnect_delay(attempt)).await;
        }
    }

    /// Opens both connection/channel pairs and installs the topology,
    /// tearing down whatever was opened on failure.
    async fn connect(&self) -> Result<BrokerLinks, AmqpError> {
        let source_name = format!("{}-source", self.shovel.name);
        let (source_connection, source_channel) =
            new_amqp_channel(&self.shovel.source.amqp, &source_name).await?;

        let sink_name = format!("{}-sink", self.shovel.name);
        let (sink_connection, sink_channel) =
            match new_amqp_channel(&self.shovel.sink.amqp, &sink_name).await {
                Ok(pair) => pair,
                Err(err) => {
                    let _ = source_connection.close(200, "shovel teardown").await;
                    return Err(err);
                }
            };

        let links = BrokerLinks {
            source_connection,
            source_channel,
            sink_connection,
            sink_channel,
        };

        if let Err(err) =
            topology::install(&links.source_channel, &links.sink_channel, &self.shovel).await
        {
            links.close().await;
            return Err(err);
        }

        Ok(links)
    }
}

/// Waits on a set of spawned relay workers, ending on the first failure.
///
/// A worker only returns on a fatal error, so the first result that is not a
/// clean exit ends the whole process: the remaining workers are aborted and
/// the error is handed to the caller for a non-zero exit. Waiting on all
/// workers instead would leave the process running with a dead shovel.
pub async fn wait_for_workers(
    workers: Vec<JoinHandle<Result<(), AmqpError>>>,
) -> Result<(), AmqpError> {
    let abort_handles: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
    let mut running: FuturesUnordered<_> = workers.into_iter().collect();

    while let Some(joined) = running.next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(err) => {
                error!(error = err.to_string(), "shovel worker panicked");
                AmqpError::InternalError {}
            }
        };

        for handle in &abort_handles {
            handle.abort();
        }
        return Err(failure);
    }

    Ok(())
}

/// Capped exponential backoff for reconnection attempts: 1s doubling up to
/// 30s. `attempt` starts at 1.
fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(5);
    Duration::from_secs((1u64 << exp).min(MAX_RECONNECT_DELAY_SECS))
}
