// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reliable Message Publisher
//!
//! This module publishes log messages with retry, backoff and publisher
//! confirms. Error logs go to the durable direct exchange as persistent
//! messages and only count as published once the broker confirms them. Info
//! logs go to the fanout exchange on a best-effort basis.
//!
//! The broker side is behind the `PublishChannel` trait so the retry behavior
//! can be exercised without a broker.

use crate::{
    channel::ConnectionSupervisor,
    errors::AmqpError,
    message::{LogKind, LogMessage, JSON_CONTENT_TYPE},
    otel,
    retry::{retry_if, RetryPolicy},
    topology::{ERROR_EXCHANGE, ERROR_ROUTING_KEY, INFO_EXCHANGE},
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// AMQP delivery mode of messages stored on disk by the broker
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// Default time to wait for a publisher confirm
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and how a message of a given kind is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exchange: &'static str,
    pub routing_key: &'static str,
    pub persistent: bool,
    /// Wait for a positive publisher confirm before reporting success
    pub confirm: bool,
}

impl Route {
    pub fn for_kind(kind: LogKind) -> Route {
        match kind {
            LogKind::Error => Route {
                exchange: ERROR_EXCHANGE,
                routing_key: ERROR_ROUTING_KEY,
                persistent: true,
                confirm: true,
            },
            LogKind::Info => Route {
                exchange: INFO_EXCHANGE,
                routing_key: "",
                persistent: false,
                confirm: false,
            },
        }
    }
}

/// Result of a publish that did not fail fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Number of attempts made, the successful one included
    pub attempts: u32,
    /// False when a best-effort message was dropped after exhausting its retries
    pub delivered: bool,
}

/// A single attempt at handing a payload to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PublishChannel: Send + Sync {
    /// Publishes `payload` once on `route`.
    ///
    /// # Parameters
    /// * `route` - Exchange, routing key and confirm mode of the message
    /// * `payload` - Encoded message body
    /// * `properties` - AMQP properties, trace headers included
    ///
    /// # Returns
    /// `Ok(())` once the broker took the message, and confirmed it when the route asks for it
    async fn send(
        &self,
        route: &Route,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;
}

/// `PublishChannel` over a supervised lapin channel.
///
/// The supervisor reopens the channel and re-declares the topology whenever a
/// previous attempt left it closed.
pub struct AmqpPublishChannel {
    supervisor: Arc<ConnectionSupervisor>,
    confirm_timeout: Duration,
    send_lock: Mutex<()>,
}

impl AmqpPublishChannel {
    /// Creates a new publish channel.
    ///
    /// # Parameters
    /// * `supervisor` - Supervisor handing out the confirm-mode channel
    /// * `confirm_timeout` - Maximum time to wait for a publisher confirm
    ///
    /// # Returns
    /// A new `AmqpPublishChannel` instance
    pub fn new(supervisor: Arc<ConnectionSupervisor>, confirm_timeout: Duration) -> Self {
        Self {
            supervisor,
            confirm_timeout,
            send_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl PublishChannel for AmqpPublishChannel {
    async fn send(
        &self,
        route: &Route,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let channel = self.supervisor.channel().await?;

        // Frames go out one publish at a time; confirms are awaited outside the lock.
        let confirm = {
            let _guard = self.send_lock.lock().await;
            channel
                .basic_publish(
                    route.exchange,
                    route.routing_key,
                    BasicPublishOptions {
                        immediate: false,
                        mandatory: false,
                    },
                    payload,
                    properties,
                )
                .await
        };

        let confirm = match confirm {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(AmqpError::PublishingError(err.to_string()));
            }
        };

        if !route.confirm {
            tokio::spawn(async move {
                let _ = confirm.await;
            });
            return Ok(());
        }

        match tokio::time::timeout(self.confirm_timeout, confirm).await {
            Err(_) => Err(AmqpError::ConfirmTimeout),
            Ok(Err(err)) => {
                error!(error = err.to_string(), "error waiting for publisher confirm");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(Ok(confirmation)) if confirmation.is_nack() => Err(AmqpError::NegativeConfirm),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

/// Publishes log messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, msg: &LogMessage) -> Result<PublishReceipt, AmqpError>;
}

/// Publisher retrying every message according to a retry policy.
///
/// Each call is independent: concurrent publishes retry on their own schedule.
pub struct ReliablePublisher<C> {
    channel: C,
    policy: RetryPolicy,
}

impl<C: PublishChannel> ReliablePublisher<C> {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `channel` - Channel used for every attempt
    /// * `policy` - Retry policy applied to each message
    ///
    /// # Returns
    /// A new `ReliablePublisher` instance
    pub fn new(channel: C, policy: RetryPolicy) -> Self {
        Self { channel, policy }
    }

    fn properties(ctx: &Context, msg: &LogMessage, route: &Route) -> BasicProperties {
        let mut headers = BTreeMap::new();
        otel::inject(ctx, &mut headers);

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(msg.kind().as_str()))
            .with_message_id(ShortString::from(msg.id.as_str()))
            .with_headers(FieldTable::from(headers));

        if route.persistent {
            properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        } else {
            properties
        }
    }
}

#[async_trait]
impl<C: PublishChannel> Publisher for ReliablePublisher<C> {
    /// Publishes `msg` to the exchange of its kind.
    ///
    /// Error logs that exhaust their retries return `PublishFailed`; info logs
    /// are dropped with a warning instead. Fatal errors are not retried and are
    /// returned as they are for both kinds.
    ///
    /// # Parameters
    /// * `ctx` - Trace context injected into the message headers
    /// * `msg` - The log message to publish
    ///
    /// # Returns
    /// A `PublishReceipt`, or the error that lost the message
    async fn publish(&self, ctx: &Context, msg: &LogMessage) -> Result<PublishReceipt, AmqpError> {
        let route = Route::for_kind(msg.kind());
        let payload = msg.encode()?;
        let properties = Self::properties(ctx, msg, &route);

        let retryable = |err: &AmqpError| !err.is_fatal();
        let result = retry_if(&self.policy, "publish", retryable, |attempt| {
            let properties = properties.clone();
            let route = &route;
            let payload = &payload;
            async move {
                debug!(id = %msg.id, attempt, exchange = route.exchange, "publishing");
                self.channel.send(route, payload, properties).await
            }
        })
        .await;

        match result {
            Ok(done) => {
                info!(
                    id = %msg.id,
                    kind = %msg.kind(),
                    service = %msg.service,
                    attempts = done.attempts,
                    "message published"
                );
                Ok(PublishReceipt {
                    attempts: done.attempts,
                    delivered: true,
                })
            }
            Err(exhausted) if exhausted.last_error.is_fatal() => {
                error!(
                    id = %msg.id,
                    error = exhausted.last_error.to_string(),
                    "fatal error publishing message"
                );
                Err(exhausted.last_error)
            }
            Err(exhausted) if route.confirm => {
                error!(
                    id = %msg.id,
                    attempts = exhausted.attempts,
                    error = exhausted.last_error.to_string(),
                    "giving up on confirmed message, it is lost"
                );
                Err(AmqpError::PublishFailed {
                    id: msg.id.clone(),
                    attempts: exhausted.attempts,
                })
            }
            Err(exhausted) => {
                warn!(
                    id = %msg.id,
                    attempts = exhausted.attempts,
                    error = exhausted.last_error.to_string(),
                    "dropping best-effort message"
                );
                Ok(PublishReceipt {
                    attempts: exhausted.attempts,
                    delivered: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::Severity, retry::Backoff};
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc as StdArc,
    };

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Backoff::Linear {
                base: Duration::from_millis(1),
            },
        )
    }

    fn failing_then_ok(failures: u32) -> (MockPublishChannel, StdArc<AtomicU32>) {
        let calls = StdArc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut channel = MockPublishChannel::new();
        channel.expect_send().returning(move |_, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < failures {
                Err(AmqpError::ConfirmTimeout)
            } else {
                Ok(())
            }
        });

        (channel, calls)
    }

    #[tokio::test]
    async fn delivers_after_transient_failures() {
        let (channel, calls) = failing_then_ok(3);
        let publisher = ReliablePublisher::new(channel, policy(5));
        let msg = LogMessage::error("auth", "DB timeout", Severity::High);

        let receipt = publisher.publish(&Context::new(), &msg).await.unwrap();

        assert_eq!(
            receipt,
            PublishReceipt {
                attempts: 4,
                delivered: true
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn confirmed_message_fails_after_max_retries() {
        let (channel, calls) = failing_then_ok(u32::MAX);
        let publisher = ReliablePublisher::new(channel, policy(5));
        let msg = LogMessage::error("auth", "DB timeout", Severity::Low);

        let err = publisher.publish(&Context::new(), &msg).await.unwrap_err();

        assert_eq!(
            err,
            AmqpError::PublishFailed {
                id: msg.id.clone(),
                attempts: 5
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn best_effort_message_is_dropped_after_max_retries() {
        let (channel, calls) = failing_then_ok(u32::MAX);
        let publisher = ReliablePublisher::new(channel, policy(3));
        let msg = LogMessage::info("api", "GET /api/health 200", 5);

        let receipt = publisher.publish(&Context::new(), &msg).await.unwrap();

        assert_eq!(
            receipt,
            PublishReceipt {
                attempts: 3,
                delivered: false
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_connection_error_is_not_retried() {
        let messages = [
            LogMessage::error("auth", "DB timeout", Severity::High),
            LogMessage::info("api", "GET /api/health 200", 5),
        ];

        for msg in messages {
            let mut channel = MockPublishChannel::new();
            channel.expect_send().times(1).returning(|_, _, _| {
                Err(AmqpError::ConnectionError {
                    attempts: 5,
                    cause: "connection refused".to_owned(),
                })
            });

            let publisher = ReliablePublisher::new(channel, policy(5));
            let result = publisher.publish(&Context::new(), &msg).await;

            assert_eq!(
                result,
                Err(AmqpError::ConnectionError {
                    attempts: 5,
                    cause: "connection refused".to_owned(),
                })
            );
        }
    }

    #[tokio::test]
    async fn error_logs_are_persistent_and_confirmed() {
        let mut channel = MockPublishChannel::new();
        channel
            .expect_send()
            .withf(|route, payload, properties| {
                route.exchange == ERROR_EXCHANGE
                    && route.routing_key == ERROR_ROUTING_KEY
                    && route.confirm
                    && properties.delivery_mode() == &Some(PERSISTENT_DELIVERY_MODE)
                    && properties.kind() == &Some(ShortString::from("error"))
                    && LogMessage::decode(payload).is_ok()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let publisher = ReliablePublisher::new(channel, policy(5));
        let msg = LogMessage::error("auth", "DB timeout", Severity::Critical);
        publisher.publish(&Context::new(), &msg).await.unwrap();
    }

    #[tokio::test]
    async fn info_logs_go_to_the_fanout_exchange_unconfirmed() {
        let mut channel = MockPublishChannel::new();
        channel
            .expect_send()
            .withf(|route, _, properties| {
                route.exchange == INFO_EXCHANGE
                    && !route.confirm
                    && properties.delivery_mode().is_none()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let publisher = ReliablePublisher::new(channel, policy(5));
        let msg = LogMessage::info("api", "POST /api/users 201", 87);
        publisher.publish(&Context::new(), &msg).await.unwrap();
    }

    #[tokio::test]
    async fn published_payload_decodes_to_the_same_message() {
        let sent = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let sink = sent.clone();

        let mut channel = MockPublishChannel::new();
        channel.expect_send().returning(move |_, payload, properties| {
            let decoded = LogMessage::decode(payload).unwrap();
            assert_eq!(
                properties.message_id().as_ref().map(|id| id.to_string()),
                Some(decoded.id)
            );
            sink.lock().unwrap().push(payload.to_vec());
            Ok(())
        });

        let publisher = ReliablePublisher::new(channel, policy(1));
        let error = LogMessage::error("cache", "Internal server error", Severity::Medium);
        let info = LogMessage::info("cache", "GET /api/orders 200", 301);
        publisher.publish(&Context::new(), &error).await.unwrap();
        publisher.publish(&Context::new(), &info).await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(LogMessage::decode(&sent[0]).unwrap(), error);
        assert_eq!(LogMessage::decode(&sent[1]).unwrap(), info);
    }
}
