// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! This module provides integration with OpenTelemetry for distributed tracing.
//! It includes utilities for propagating trace context through RabbitMQ message headers,
//! extracting context from incoming messages, and creating trace spans for message processing.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
///
/// This struct implements the OpenTelemetry `Injector` and `Extractor` traits,
/// so the trace of a log message follows it from the producer to its consumers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    /// Creates a new RabbitMQTracePropagator.
    ///
    /// # Parameters
    /// * `headers` - The AMQP headers to read from or write to
    ///
    /// # Returns
    /// A new RabbitMQTracePropagator instance
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Sets a trace context key-value pair in RabbitMQ message headers.
    ///
    /// Keys are stored lowercased.
    ///
    /// # Parameters
    /// * `key` - The header key
    /// * `value` - The header value
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Gets a trace context value from RabbitMQ message headers.
    ///
    /// # Parameters
    /// * `key` - The header key to retrieve
    ///
    /// # Returns
    /// The header value as a string slice, or None if missing or not a UTF-8 long string
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    /// Gets all keys in the RabbitMQ message headers.
    ///
    /// # Returns
    /// A vector of header keys as string slices
    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the trace context of `ctx` into `headers` using the global propagator.
///
/// # Parameters
/// * `ctx` - Context of the publishing operation
/// * `headers` - Headers of the outgoing message
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Creates a new OpenTelemetry span for processing one delivery.
///
/// The parent context is extracted from the message headers, so the span joins
/// the trace started by the publisher.
///
/// # Parameters
/// * `props` - Properties of the delivery, headers included
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(
            &mut props.headers().clone().unwrap_or_default().inner().clone(),
        ))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
