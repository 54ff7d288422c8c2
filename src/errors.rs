// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Shovel Daemon
//!
//! This module provides the error types used across the shovel engine.
//! `AmqpError` covers broker interactions (connection, channel, topology and
//! message handling), and `ConfigError` covers loading and validating shovel
//! configuration documents.
//!
//! The reconnection supervisor uses [`AmqpError::is_fatal`] to decide between
//! retrying with a fresh connection and terminating the process: topology
//! failures after a successful connection indicate a misconfigured broker and
//! are never retried, while transport failures are.

use std::path::PathBuf;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// A source binding missing its exchange or routing key
    #[error("invalid source binding for shovel `{0}`: {1}")]
    InvalidBindingError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error enabling publisher-confirm mode on the sink channel
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error waiting for a publisher confirmation
    #[error("failure to receive publisher confirmation")]
    ConfirmError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The source consumer stream was closed by the broker
    #[error("source consumer stream closed")]
    StreamClosedError,
}

impl AmqpError {
    /// Whether this error indicates broker misconfiguration rather than a
    /// transient transport failure. Fatal errors terminate the process;
    /// everything else is handled by tearing down and reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindQueueError(_, _)
                | AmqpError::InvalidBindingError(_, _)
                | AmqpError::QoSDeclarationError(_)
        )
    }
}

/// Represents errors that can occur while loading shovel configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error reading a configuration file from disk
    #[error("failure to read config file `{}`: {source}", path.display())]
    ReadFileError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Error parsing a configuration document
    #[error("failure to parse config file `{}`: {source}", path.display())]
    ParseError {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// A shovel with a negative concurrency value
    #[error("negative concurrency not allowed for shovel `{0}`")]
    NegativeConcurrencyError(String),

    /// A shovel missing its source queue name
    #[error("source queue missing for shovel `{0}`")]
    MissingQueueError(String),

    /// A shovel missing its sink exchange name
    #[error("sink exchange missing for shovel `{0}`")]
    MissingExchangeError(String),
}
