// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels for the
//! relay workers. Each worker opens its own connection/channel pair per
//! endpoint; pairs are never shared between workers since a lapin channel must
//! not be driven by more than one relay instance.

use crate::{config::AmqpHost, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use tracing::{debug, error};

/// Creates a new AMQP connection and channel against the given endpoint.
///
/// `connection_name` identifies the owning shovel in the broker's connection
/// listing.
pub async fn new_amqp_channel(
    host: &AmqpHost,
    connection_name: &str,
) -> Result<(Connection, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    let conn = match Connection::connect(&host.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}
