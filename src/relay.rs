// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Relay Pipeline
//!
//! This module implements the consume→publish→confirm→acknowledge pipeline of
//! one relay instance. Messages are consumed from the source queue with manual
//! acknowledgment, republished to the sink exchange with their metadata
//! preserved verbatim, and only acknowledged at the source once the sink
//! broker has positively confirmed the publish.
//!
//! Pending publishes flow through a bounded channel sized to the source
//! prefetch window; the publish path reserves a slot before publishing and
//! blocks when the window is full. A spawned listener drains the channel in
//! publish order (publisher confirms arrive in that order on a single
//! channel), acking positively confirmed deliveries and requeueing rejected
//! ones at the source.

use crate::{config::ShovelConfig, errors::AmqpError};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions,
    },
    publisher_confirm::{Confirmation, PublisherConfirm},
    types::FieldTable,
    Channel, Consumer,
};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Acknowledgment surface of the source channel, as seen by the confirmation
/// listener.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait SourceAcker: Send + Sync {
    /// Acknowledges a delivery by tag.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Negatively acknowledges a delivery by tag, requeueing it for a future
    /// redelivery attempt.
    async fn nack_requeue(&self, delivery_tag: u64) -> Result<(), AmqpError>;
}

#[async_trait]
impl SourceAcker for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError {})
            }
            _ => Ok(()),
        }
    }

    async fn nack_requeue(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError {})
            }
            _ => Ok(()),
        }
    }
}

/// A publish sent to the sink whose confirmation has not been drained yet.
pub(crate) struct PendingPublish<F> {
    pub(crate) delivery_tag: u64,
    pub(crate) confirm: F,
}

/// Builds the bounded pending-publish channel. Capacity equals the source
/// prefetch so the number of unconfirmed sink publishes never exceeds the
/// number of deliveries the source broker is willing to have outstanding.
fn pending_channel<F>(
    prefetch: u16,
) -> (
    mpsc::Sender<PendingPublish<F>>,
    mpsc::Receiver<PendingPublish<F>>,
) {
    // tokio rejects a zero capacity; validated configs normalize zero to the
    // default prefetch, but the constructor must hold up for raw ones too.
    mpsc::channel(prefetch.max(1) as usize)
}

/// Routing key and properties for republishing a delivery: the key resolves
/// against the sink override, the properties are forwarded untouched.
fn publish_payload<'d>(
    shovel: &'d ShovelConfig,
    delivery: &'d lapin::message::Delivery,
) -> (&'d str, &'d lapin::BasicProperties) {
    (
        shovel.resolve_routing_key(delivery.routing_key.as_str()),
        &delivery.properties,
    )
}

/// Runs the relay pipeline on an already-initialized channel pair. Always
/// returns an error describing why relaying stopped; the reconnection
/// supervisor decides whether it is retryable.
pub(crate) async fn run(
    shovel: &ShovelConfig,
    source: &Channel,
    sink: &Channel,
) -> Result<(), AmqpError> {
    let mut consumer = match source
        .basic_consume(
            &shovel.source.queue,
            &shovel.name,
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to create the consumer");
            Err(AmqpError::ConsumerDeclarationError(shovel.name.clone()))
        }
        Ok(c) => Ok(c),
    }?;

    if let Err(err) = sink.confirm_select(ConfirmSelectOptions::default()).await {
        error!(error = err.to_string(), "error to enable publisher confirms");
        return Err(AmqpError::ConfirmSelectError {});
    }

    let (tx, rx) = pending_channel(shovel.source.prefetch);
    let mut listener = tokio::spawn(confirm_listener(rx, source.clone()));

    let halt = race_pipeline(
        pump(shovel, source, sink, &mut consumer, &tx),
        &mut listener,
    )
    .await;

    match halt {
        PipelineHalt::Listener(result) => {
            // In-doubt deliveries stay unacked; the broker redelivers them
            // after reconnection.
            result.and(Err(AmqpError::ConfirmError {}))
        }
        PipelineHalt::Pump(outcome) => {
            drop(tx);

            match listener.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if outcome.is_ok() {
                        return Err(err);
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "confirmation listener failed");
                }
            }

            outcome.and(Err(AmqpError::StreamClosedError {}))
        }
    }
}

/// Which half of the pipeline stopped first.
enum PipelineHalt {
    Pump(Result<(), AmqpError>),
    Listener(Result<(), AmqpError>),
}

/// Races the publish loop against the confirmation listener so that a
/// listener failure ends the relay attempt even while the source is idle.
async fn race_pipeline<P>(
    pump: P,
    listener: &mut tokio::task::JoinHandle<Result<(), AmqpError>>,
) -> PipelineHalt
where
    P: Future<Output = Result<(), AmqpError>>,
{
    tokio::select! {
        outcome = pump => PipelineHalt::Pump(outcome),
        joined = listener => PipelineHalt::Listener(match joined {
            Ok(result) => result,
            Err(err) => {
                error!(error = err.to_string(), "confirmation listener failed");
                Err(AmqpError::ConfirmError {})
            }
        }),
    }
}

/// Main loop: pull the next delivery, reserve a pending slot (the
/// backpressure gate), republish to the sink, hand the confirmation to the
/// listener.
async fn pump(
    shovel: &ShovelConfig,
    source: &Channel,
    sink: &Channel,
    consumer: &mut Consumer,
    pending: &mpsc::Sender<PendingPublish<PublisherConfirm>>,
) -> Result<(), AmqpError> {
    while let Some(result) = consumer.next().await {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), "error consuming message");
                return Err(AmqpError::ConsumerError(err.to_string()));
            }
        };

        let (routing_key, properties) = publish_payload(shovel, &delivery);

        let Ok(slot) = pending.reserve().await else {
            // Listener dropped the receiver after a failed ack/nack.
            return Err(AmqpError::ConfirmError {});
        };

        match sink
            .basic_publish(
                &shovel.sink.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &delivery.data,
                properties.clone(),
            )
            .await
        {
            Ok(confirm) => {
                debug!(
                    tag = delivery.delivery_tag,
                    routing_key, "message relayed to sink"
                );
                slot.send(PendingPublish {
                    delivery_tag: delivery.delivery_tag,
                    confirm,
                });
            }
            Err(err) => {
                drop(slot);
                error!(error = err.to_string(), "error publishing message");
                if let Err(nack_err) =
                    SourceAcker::nack_requeue(source, delivery.delivery_tag).await
                {
                    // Channel is likely dead; the broker redelivers unacked
                    // messages after reconnection.
                    warn!(error = nack_err.to_string(), "failed to requeue delivery");
                }
                return Err(AmqpError::PublishingError {});
            }
        }
    }

    Ok(())
}

/// Drains publisher confirmations in publish order and resolves each against
/// the source: ack on a positive confirmation, nack-with-requeue on a
/// negative one.
async fn confirm_listener<F, A>(
    mut pending: mpsc::Receiver<PendingPublish<F>>,
    acker: A,
) -> Result<(), AmqpError>
where
    F: Future<Output = lapin::Result<Confirmation>> + Send,
    A: SourceAcker,
{
    while let Some(publish) = pending.recv().await {
        match publish.confirm.await {
            Ok(Confirmation::Ack(_)) | Ok(Confirmation::NotRequested) => {
                acker.ack(publish.delivery_tag).await?;
            }
            Ok(Confirmation::Nack(_)) => {
                warn!(
                    tag = publish.delivery_tag,
                    "sink rejected publish, requeueing at source"
                );
                acker.nack_requeue(publish.delivery_tag).await?;
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "error waiting for publisher confirmation"
                );
                // Best effort: if the channel is already gone the broker
                // redelivers the unacked message after reconnection.
                let _ = acker.nack_requeue(publish.delivery_tag).await;
                return Err(AmqpError::ConfirmError {});
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future;
    use mockall::{predicate::eq, Sequence};

    fn ack_confirm() -> future::Ready<lapin::Result<Confirmation>> {
        future::ready(Ok(Confirmation::Ack(None)))
    }

    fn nack_confirm() -> future::Ready<lapin::Result<Confirmation>> {
        future::ready(Ok(Confirmation::Nack(None)))
    }

    #[tokio::test]
    async fn test_confirmations_resolved_in_publish_order() {
        let mut acker = MockSourceAcker::new();
        let mut seq = Sequence::new();
        acker
            .expect_ack()
            .with(eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        acker
            .expect_nack_requeue()
            .with(eq(2))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        acker
            .expect_ack()
            .with(eq(3))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let (tx, rx) = pending_channel(10);
        for (delivery_tag, confirm) in [(1, ack_confirm()), (2, nack_confirm()), (3, ack_confirm())]
        {
            tx.send(PendingPublish {
                delivery_tag,
                confirm,
            })
            .await
            .unwrap();
        }
        drop(tx);

        confirm_listener(rx, acker).await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_stops_after_failed_ack() {
        let mut acker = MockSourceAcker::new();
        acker
            .expect_ack()
            .with(eq(1))
            .times(1)
            .returning(|_| Err(AmqpError::AckMessageError {}));

        let (tx, rx) = pending_channel(10);
        tx.send(PendingPublish {
            delivery_tag: 1,
            confirm: ack_confirm(),
        })
        .await
        .unwrap();
        tx.send(PendingPublish {
            delivery_tag: 2,
            confirm: ack_confirm(),
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(
            confirm_listener(rx, acker).await,
            Err(AmqpError::AckMessageError {})
        );
    }

    #[tokio::test]
    async fn test_confirm_transport_error_requeues_and_fails() {
        let mut acker = MockSourceAcker::new();
        acker
            .expect_nack_requeue()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(()));

        let (tx, rx) = pending_channel(10);
        tx.send(PendingPublish {
            delivery_tag: 7,
            confirm: future::ready(Err(lapin::Error::ChannelsLimitReached)),
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(
            confirm_listener(rx, acker).await,
            Err(AmqpError::ConfirmError {})
        );
    }

    #[tokio::test]
    async fn test_pending_channel_bounds_unconfirmed_publishes() {
        let (tx, _rx) = pending_channel::<future::Pending<lapin::Result<Confirmation>>>(2);

        let first = tx.try_reserve().unwrap();
        let second = tx.try_reserve().unwrap();

        // The third publish must block until a confirmation drains.
        assert!(matches!(
            tx.try_reserve(),
            Err(mpsc::error::TrySendError::Full(()))
        ));

        drop(first);
        drop(second);
        assert!(tx.try_reserve().is_ok());
    }

    #[test]
    fn test_zero_prefetch_still_yields_a_slot() {
        let (tx, _rx) = pending_channel::<future::Pending<lapin::Result<Confirmation>>>(0);
        assert!(tx.try_reserve().is_ok());
    }

    #[tokio::test]
    async fn test_listener_failure_ends_relay_while_source_idle() {
        let mut listener =
            tokio::spawn(async { Err::<(), _>(AmqpError::AckMessageError {}) });

        // The publish loop never yields a delivery; the listener failure must
        // still end the relay attempt.
        let halt = race_pipeline(
            std::future::pending::<Result<(), AmqpError>>(),
            &mut listener,
        )
        .await;

        assert!(matches!(
            halt,
            PipelineHalt::Listener(Err(AmqpError::AckMessageError {}))
        ));
    }

    #[tokio::test]
    async fn test_stream_end_wins_while_listener_healthy() {
        let acker = MockSourceAcker::new();
        let (tx, rx) = pending_channel::<future::Ready<lapin::Result<Confirmation>>>(1);
        let mut listener = tokio::spawn(confirm_listener(rx, acker));

        let halt = race_pipeline(
            async {
                drop(tx);
                Ok(())
            },
            &mut listener,
        )
        .await;

        assert!(matches!(halt, PipelineHalt::Pump(Ok(()))));
        assert_eq!(listener.await.unwrap(), Ok(()));
    }

    #[test]
    fn test_publish_forwards_metadata_untouched() {
        use lapin::types::{AMQPValue, LongString, ShortString};
        use std::collections::BTreeMap;

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from("x-origin"),
            AMQPValue::LongString(LongString::from("billing")),
        );

        let properties = lapin::BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_content_encoding(ShortString::from("identity"))
            .with_delivery_mode(2)
            .with_priority(5)
            .with_correlation_id(ShortString::from("corr-1"))
            .with_reply_to(ShortString::from("replies"))
            .with_expiration(ShortString::from("60000"))
            .with_message_id(ShortString::from("msg-1"))
            .with_timestamp(1_700_000_000)
            .with_kind(ShortString::from("order"))
            .with_user_id(ShortString::from("guest"))
            .with_app_id(ShortString::from("billing"))
            .with_headers(FieldTable::from(headers));

        let delivery = lapin::message::Delivery {
            delivery_tag: 1,
            exchange: ShortString::from("orders"),
            routing_key: ShortString::from("order.created"),
            redelivered: false,
            properties: properties.clone(),
            data: b"payload".to_vec(),
            acker: lapin::acker::Acker::default(),
        };

        let mut shovel = ShovelConfig::default();
        shovel.sink.exchange = "outbound".to_owned();

        let (routing_key, forwarded) = publish_payload(&shovel, &delivery);
        assert_eq!(routing_key, "order.created");
        assert_eq!(forwarded, &properties);

        shovel.sink.routing_key = "relayed".to_owned();
        let (routing_key, forwarded) = publish_payload(&shovel, &delivery);
        assert_eq!(routing_key, "relayed");
        assert_eq!(forwarded, &properties);
    }
}
