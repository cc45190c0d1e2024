// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ queues and their bindings,
//! including the dead-letter arguments that route rejected messages to a
//! dead-letter exchange.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Queue argument naming the exchange rejected messages are republished to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument overriding the routing key of dead-lettered messages
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument for the per-message time-to-live
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// It supports durability, message TTL and dead-lettering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is non-durable and has no arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// Messages that exceed this TTL are dead-lettered if a dead-letter
    /// exchange is configured, dropped otherwise.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Routes messages rejected without requeue (or expired) to `exchange`,
    /// republished with `routing_key`.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    /// Builds the `x-*` arguments sent with `queue.declare`.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::<ShortString, AMQPValue>::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        FieldTable::from(args)
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
