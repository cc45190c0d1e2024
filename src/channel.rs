// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Supervision
//!
//! This module establishes the connection to RabbitMQ with retry and backoff and
//! hands out channels on it. A channel or a connection may close at any time;
//! `ConnectionSupervisor::channel` notices it on the next call, reconnects when
//! needed, opens a new channel and installs the topology again before returning.

use crate::{
    errors::AmqpError,
    retry::{retry, RetryPolicy},
    topology::{AmqpTopology, Topology},
};
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Reply code sent when closing a channel or a connection on purpose
const AMQP_REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ, retrying according to `policy`.
///
/// On exhaustion the returned `ConnectionError` carries the number of attempts
/// made and the last underlying cause.
///
/// # Parameters
/// * `uri` - AMQP URI of the broker
/// * `connection_name` - Name shown for the connection in the management UI
/// * `policy` - Maximum attempts and backoff between them
///
/// # Returns
/// The established connection
pub async fn connect(
    uri: &str,
    connection_name: &str,
    policy: &RetryPolicy,
) -> Result<Connection, AmqpError> {
    let result = retry(policy, "amqp connect", |attempt| {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        async move {
            debug!(attempt, "creating amqp connection...");
            Connection::connect(uri, options).await
        }
    })
    .await;

    match result {
        Ok(done) => {
            info!(attempts = done.attempts, "amqp connected");
            Ok(done.value)
        }
        Err(exhausted) => {
            error!(
                error = exhausted.last_error.to_string(),
                attempts = exhausted.attempts,
                "failure to connect"
            );
            Err(AmqpError::ConnectionError {
                attempts: exhausted.attempts,
                cause: exhausted.last_error.to_string(),
            })
        }
    }
}

/// Opens a channel on `conn`, switching it to confirm mode when requested.
///
/// # Parameters
/// * `conn` - An open connection
/// * `confirms` - Enable publisher confirms on the new channel
///
/// # Returns
/// The new channel, or `ChannelError`
pub async fn open_channel(conn: &Connection, confirms: bool) -> Result<Channel, AmqpError> {
    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => c,
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            return Err(AmqpError::ChannelError(err.to_string()));
        }
    };

    if confirms {
        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            error!(error = err.to_string(), "error to enable publisher confirms");
            return Err(AmqpError::ChannelError(err.to_string()));
        }
    }

    debug!(id = channel.id(), "channel created");
    Ok(channel)
}

/// Connection and channel settings of a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub uri: String,
    pub connection_name: String,
    pub retry: RetryPolicy,
    /// Put every channel in publisher-confirm mode
    pub confirms: bool,
}

/// Owns the broker connection and the channel used by one role.
///
/// The channel slot is guarded by an async mutex so concurrent callers that find
/// it closed recreate it only once.
pub struct ConnectionSupervisor {
    options: SupervisorOptions,
    topology: AmqpTopology,
    connection: Mutex<Option<Arc<Connection>>>,
    channel: Mutex<Option<Arc<Channel>>>,
}

impl ConnectionSupervisor {
    /// Creates a supervisor without touching the network.
    pub fn new(options: SupervisorOptions, topology: AmqpTopology) -> Self {
        Self {
            options,
            topology,
            connection: Mutex::new(None),
            channel: Mutex::new(None),
        }
    }

    /// Creates a supervisor and opens its first channel.
    ///
    /// Fails with `ConnectionError` once the retry policy is exhausted.
    ///
    /// # Parameters
    /// * `options` - Broker URI, connection name, retry policy and confirm mode
    /// * `topology` - Exchanges, queues and bindings declared on every new channel
    ///
    /// # Returns
    /// The supervisor, shared by the publisher or dispatcher of the role
    pub async fn start(
        options: SupervisorOptions,
        topology: AmqpTopology,
    ) -> Result<Arc<Self>, AmqpError> {
        let supervisor = Arc::new(Self::new(options, topology));
        supervisor.channel().await?;
        Ok(supervisor)
    }

    pub fn topology(&self) -> &AmqpTopology {
        &self.topology
    }

    /// Returns an open channel, recreating it (and the connection) if needed.
    ///
    /// Every new channel gets the whole topology declared on it before it is
    /// handed out.
    ///
    /// # Returns
    /// A shared handle on the open channel
    pub async fn channel(&self) -> Result<Arc<Channel>, AmqpError> {
        let mut slot = self.channel.lock().await;

        if let Some(channel) = slot.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            warn!(id = channel.id(), "channel closed, reopening");
        }

        let conn = self.connection().await?;
        let channel = open_channel(&conn, self.options.confirms).await?;
        self.topology.install(&channel).await?;

        let channel = Arc::new(channel);
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Drops the current channel so the next call to `channel` opens a new one.
    pub async fn invalidate(&self) {
        if self.channel.lock().await.take().is_some() {
            debug!("channel discarded");
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        let mut slot = self.connection.lock().await;

        if let Some(conn) = slot.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
            warn!("connection lost, reconnecting");
        }

        let conn = Arc::new(
            connect(
                &self.options.uri,
                &self.options.connection_name,
                &self.options.retry,
            )
            .await?,
        );
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Closes the channel, then the connection.
    pub async fn close(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            if channel.status().connected() {
                if let Err(err) = channel.close(AMQP_REPLY_SUCCESS, "shutdown").await {
                    warn!(error = err.to_string(), "error closing channel");
                }
            }
        }

        if let Some(conn) = self.connection.lock().await.take() {
            if conn.status().connected() {
                if let Err(err) = conn.close(AMQP_REPLY_SUCCESS, "shutdown").await {
                    warn!(error = err.to_string(), "error closing connection");
                }
            }
        }

        info!("amqp connection closed");
    }
}
