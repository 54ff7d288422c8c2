// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the broker topology a shovel relies on: the durable
//! source queue with its bindings and prefetch window, and the durable sink
//! exchange. Installation runs once per (re)connection, before the relay
//! pipeline starts.
//!
//! Failures here are fatal: they happen after a connection already succeeded,
//! so they indicate a misconfigured broker rather than a transient outage and
//! are not retried by the reconnection supervisor.

use crate::{config::ShovelConfig, errors::AmqpError};
use lapin::{
    options::{BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// Installs the full topology for one shovel: source queue, bindings and QoS
/// on the source channel, sink exchange on the sink channel.
pub async fn install(
    source: &Channel,
    sink: &Channel,
    shovel: &ShovelConfig,
) -> Result<(), AmqpError> {
    validate_bindings(shovel)?;
    install_source(source, shovel).await?;
    install_sink(sink, shovel).await
}

/// Requires every declared binding to carry both an exchange and a routing
/// key, naming the shovel on violation.
fn validate_bindings(shovel: &ShovelConfig) -> Result<(), AmqpError> {
    for binding in &shovel.source.bindings {
        if binding.exchange.is_empty() {
            return Err(AmqpError::InvalidBindingError(
                shovel.name.clone(),
                "exchange missing".to_owned(),
            ));
        }
        if binding.routing_key.is_empty() {
            return Err(AmqpError::InvalidBindingError(
                shovel.name.clone(),
                "routing key missing".to_owned(),
            ));
        }
    }

    Ok(())
}

async fn install_source(channel: &Channel, shovel: &ShovelConfig) -> Result<(), AmqpError> {
    let queue = &shovel.source.queue;
    debug!("declaring source queue: {}", queue);

    match channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = queue,
                "error to declare the queue"
            );
            Err(AmqpError::DeclareQueueError(queue.to_owned()))
        }
        _ => Ok(()),
    }?;

    for binding in &shovel.source.bindings {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, binding.exchange, binding.routing_key
        );

        match channel
            .queue_bind(
                queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindQueueError(
                    queue.to_owned(),
                    binding.exchange.to_owned(),
                ))
            }
            _ => Ok(()),
        }?;
    }

    match channel
        .basic_qos(shovel.source.prefetch, BasicQosOptions { global: true })
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to configure qos");
            Err(AmqpError::QoSDeclarationError(
                shovel.source.prefetch.to_string(),
            ))
        }
        _ => Ok(()),
    }
}

async fn install_sink(channel: &Channel, shovel: &ShovelConfig) -> Result<(), AmqpError> {
    let exchange = &shovel.sink.exchange;
    debug!("declaring sink exchange: {}", exchange);

    match channel
        .exchange_declare(
            exchange,
            shovel.sink.exchange_kind.into(),
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = exchange,
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(exchange.to_owned()))
        }
        _ => {
            debug!("exchange: {} was declared", exchange);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShovelBinding;

    fn shovel_with_bindings(bindings: Vec<ShovelBinding>) -> ShovelConfig {
        let mut shovel = ShovelConfig {
            name: "orders".to_owned(),
            ..ShovelConfig::default()
        };
        shovel.source.queue = "inbound".to_owned();
        shovel.source.bindings = bindings;
        shovel.sink.exchange = "outbound".to_owned();
        shovel
    }

    #[test]
    fn test_complete_bindings_accepted() {
        let shovel = shovel_with_bindings(vec![ShovelBinding {
            exchange: "orders".to_owned(),
            routing_key: "order.*".to_owned(),
        }]);

        assert!(validate_bindings(&shovel).is_ok());
    }

    #[test]
    fn test_binding_without_exchange_names_shovel() {
        let shovel = shovel_with_bindings(vec![ShovelBinding {
            exchange: String::new(),
            routing_key: "order.*".to_owned(),
        }]);

        let err = validate_bindings(&shovel).unwrap_err();
        assert_eq!(
            err,
            AmqpError::InvalidBindingError("orders".to_owned(), "exchange missing".to_owned())
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_binding_without_routing_key_names_shovel() {
        let shovel = shovel_with_bindings(vec![ShovelBinding {
            exchange: "orders".to_owned(),
            routing_key: String::new(),
        }]);

        let err = validate_bindings(&shovel).unwrap_err();
        assert_eq!(
            err,
            AmqpError::InvalidBindingError("orders".to_owned(), "routing key missing".to_owned())
        );
    }
}
