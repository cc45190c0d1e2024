// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and creating RabbitMQ topology components.
//! The topology includes exchanges, queues, and the bindings between them.
//!
//! Topology is not assumed to survive a reconnect: `AmqpTopology` owns its
//! definitions and is installed again on every channel the connection
//! supervisor opens. Declarations are idempotent on the broker side.
//!
//! The log pipeline's own layout lives at the bottom of this module:
//! - `producer_topology`: everything a producer publishes into
//! - `error_worker_topology`: the shared error queue and its dead-letter sink
//! - `info_subscriber_topology`: one private queue per subscriber on the fanout exchange

use crate::{
    dead_letter::DeadLetterRoute,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// Direct exchange receiving error logs
pub const ERROR_EXCHANGE: &str = "logs.error.exchange";
/// Durable queue shared by all competing error workers
pub const ERROR_QUEUE: &str = "logs.error.q";
/// Routing key binding the error queue to the error exchange
pub const ERROR_ROUTING_KEY: &str = "logs.error";
/// Exchange receiving error logs rejected by the workers
pub const ERROR_DLX_EXCHANGE: &str = "logs.error.dlx.exchange";
/// Queue holding dead-lettered error logs for inspection
pub const ERROR_DLQ: &str = "logs.error.dlq";
/// Fanout exchange broadcasting info logs
pub const INFO_EXCHANGE: &str = "logs.info.exchange";
/// Prefix of the per-subscriber info queues
pub const INFO_QUEUE_PREFIX: &str = "logs.info.q.";

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Installs the topology on the given channel.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self, channel: &Channel) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
///
/// This struct maintains collections of exchanges, queues, and bindings,
/// and provides methods to install them to a RabbitMQ server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    /// Creates an empty topology.
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues_binding
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    async fn install(&self, channel: &Channel) -> Result<(), AmqpError> {
        self.install_exchange(channel).await?;
        self.install_queue(channel).await?;
        self.binding_queues(channel).await
    }
}

impl AmqpTopology {
    /// Creates all exchanges defined in the topology.
    async fn install_exchange(&self, channel: &Channel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            match channel
                .exchange_declare(
                    &exch.name,
                    (&exch.kind).into(),
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: exch.durable,
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
                        name = %exch.name,
                        "error to declare the exchange"
                    );
                    Err(AmqpError::DeclareExchangeError(exch.name.clone()))
                }
                _ => Ok(()),
            }?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    /// Creates all queues defined in the topology, with their dead-letter arguments.
    async fn install_queue(&self, channel: &Channel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            match channel
                .queue_declare(
                    &def.name,
                    QueueDeclareOptions {
                        passive: false,
                        durable: def.durable,
                        exclusive: false,
                        auto_delete: false,
                        nowait: false,
                    },
                    def.arguments(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                    Err(AmqpError::DeclareQueueError(def.name.clone()))
                }
                _ => {
                    debug!("queue: {} was created", def.name);
                    Ok(())
                }
            }?;
        }

        Ok(())
    }

    /// Sets up queue-to-exchange bindings.
    async fn binding_queues(&self, channel: &Channel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            match channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

/// Name of the private info queue owned by `service`.
pub fn info_queue_name(service: &str) -> String {
    format!("{INFO_QUEUE_PREFIX}{service}")
}

/// The error exchange, the shared error queue and its dead-letter route.
///
/// `message_ttl_ms` optionally dead-letters messages left unconsumed for too long.
pub fn error_worker_topology(message_ttl_ms: Option<i32>) -> AmqpTopology {
    let dead_letter = DeadLetterRoute::new(ERROR_DLX_EXCHANGE, ERROR_DLQ);

    let mut queue = dead_letter.protect(QueueDefinition::new(ERROR_QUEUE).durable());
    if let Some(ttl) = message_ttl_ms {
        queue = queue.ttl(ttl);
    }

    dead_letter
        .topology()
        .exchange(ExchangeDefinition::new(ERROR_EXCHANGE).direct().durable())
        .queue(queue)
        .queue_binding(
            QueueBinding::new(ERROR_QUEUE)
                .exchange(ERROR_EXCHANGE)
                .routing_key(ERROR_ROUTING_KEY),
        )
}

/// Everything a producer publishes into.
///
/// The error queue is declared here too so confirmed error logs are stored even
/// before the first worker starts.
pub fn producer_topology(message_ttl_ms: Option<i32>) -> AmqpTopology {
    error_worker_topology(message_ttl_ms)
        .exchange(ExchangeDefinition::new(INFO_EXCHANGE).fanout().durable())
}

/// The fanout exchange and the private queue of one subscriber.
///
/// Each subscriber binds its own queue, so every subscriber receives its own
/// copy of every info log.
pub fn info_subscriber_topology(service: &str) -> AmqpTopology {
    let queue = info_queue_name(service);

    AmqpTopology::new()
        .exchange(ExchangeDefinition::new(INFO_EXCHANGE).fanout().durable())
        .queue(QueueDefinition::new(&queue).durable())
        .queue_binding(QueueBinding::new(&queue).exchange(INFO_EXCHANGE))
}
