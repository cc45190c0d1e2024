// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Ack-Driven Message Consumer
//!
//! This module decides what happens to a single delivery. A message is
//! acknowledged only after its effect ran and its id was recorded as processed.
//! Redelivered duplicates are acknowledged without running the effect again,
//! malformed payloads are rejected without requeue, and failures are requeued
//! until the redelivery ceiling, then dead-lettered.

use crate::{
    errors::AmqpError,
    handler::LogHandler,
    idempotency::IdempotencyStore,
    message::{LogKind, LogMessage},
    otel,
};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
    types::AMQPValue,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Header set by the broker on quorum queues, counting previous deliveries
pub const AMQP_HEADERS_X_DELIVERY_COUNT: &str = "x-delivery-count";
/// Default number of processing attempts before a message is dead-lettered
pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;
/// How long a failure is remembered when the message does not come back
pub const DEFAULT_LEDGER_TTL: Duration = Duration::from_secs(600);
/// Minimum time between two scans for stale failures
const LEDGER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// What processing one delivery resulted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Duplicate,
    Malformed(String),
    /// Failed, will be delivered again
    Retry { attempts: u32 },
    /// Failed for the last time, handed to the dead-letter exchange
    DeadLettered { attempts: u32 },
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    Reject,
}

impl Outcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Outcome::Processed | Outcome::Duplicate => Disposition::Ack,
            Outcome::Retry { .. } => Disposition::Requeue,
            Outcome::Malformed(_) | Outcome::DeadLettered { .. } => Disposition::Reject,
        }
    }
}

struct LedgerEntry {
    attempts: u32,
    last_seen: Instant,
}

/// Failed attempts per message id seen by this consumer.
///
/// Messages that were redelivered elsewhere, expired or were purged never come
/// back to clear their entry, so entries untouched for `ttl` are dropped.
struct Ledger {
    entries: HashMap<String, LedgerEntry>,
    ttl: Duration,
    last_prune: Instant,
}

impl Ledger {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            last_prune: Instant::now(),
        }
    }

    fn record(&mut self, id: &str, at_least: u32) -> u32 {
        let now = Instant::now();
        if now.duration_since(self.last_prune) >= LEDGER_PRUNE_INTERVAL {
            let ttl = self.ttl;
            self.entries
                .retain(|_, entry| now.duration_since(entry.last_seen) < ttl);
            self.last_prune = now;
        }

        let entry = self.entries.entry(id.to_owned()).or_insert(LedgerEntry {
            attempts: 0,
            last_seen: now,
        });
        if now.duration_since(entry.last_seen) >= self.ttl {
            entry.attempts = 0;
        }
        entry.attempts = entry.attempts.saturating_add(1).max(at_least);
        entry.last_seen = now;
        entry.attempts
    }

    fn remove(&mut self, id: &str) {
        self.entries.remove(id);
    }
}

/// Processes deliveries of one kind of log message.
pub struct MessageConsumer {
    expects: LogKind,
    store: Arc<dyn IdempotencyStore>,
    handler: Arc<dyn LogHandler>,
    max_attempts: u32,
    ledger: Mutex<Ledger>,
}

impl MessageConsumer {
    pub fn new(
        expects: LogKind,
        store: Arc<dyn IdempotencyStore>,
        handler: Arc<dyn LogHandler>,
        max_attempts: u32,
    ) -> Self {
        Self {
            expects,
            store,
            handler,
            max_attempts: max_attempts.max(1),
            ledger: Mutex::new(Ledger::new(DEFAULT_LEDGER_TTL)),
        }
    }

    /// Sets how long a failure is remembered for a message that does not come back.
    pub fn with_ledger_ttl(self, ttl: Duration) -> Self {
        Self {
            ledger: Mutex::new(Ledger::new(ttl)),
            ..self
        }
    }

    /// Runs the processing steps for one delivery and returns how it must be settled.
    ///
    /// `delivery_count` is the broker's count of previous deliveries, when known.
    pub async fn on_message(
        &self,
        ctx: &Context,
        data: &[u8],
        delivery_count: Option<u32>,
    ) -> Outcome {
        let msg = match LogMessage::decode(data) {
            Ok(m) => m,
            Err(err) => {
                warn!(error = err.to_string(), "rejecting malformed message");
                return Outcome::Malformed(err.to_string());
            }
        };

        if msg.kind() != self.expects {
            warn!(id = %msg.id, kind = %msg.kind(), "rejecting message of unexpected kind");
            return Outcome::Malformed(format!("unexpected {} message", msg.kind()));
        }

        match self.store.is_processed(&msg.id).await {
            Ok(true) => {
                info!(id = %msg.id, "duplicate message, skipping");
                self.forget(&msg.id);
                return Outcome::Duplicate;
            }
            Ok(false) => {}
            Err(err) => return self.failed(&msg, err, delivery_count),
        }

        if let Err(err) = self.handler.exec(ctx, &msg).await {
            return self.failed(&msg, err, delivery_count);
        }

        if let Err(err) = self.store.mark_processed(&msg.id).await {
            return self.failed(&msg, err, delivery_count);
        }

        self.forget(&msg.id);
        debug!(id = %msg.id, "message successfully processed");
        Outcome::Processed
    }

    fn failed(&self, msg: &LogMessage, err: AmqpError, delivery_count: Option<u32>) -> Outcome {
        let attempts = self.record_failure(&msg.id, delivery_count);

        if attempts < self.max_attempts {
            warn!(
                id = %msg.id,
                attempts,
                error = err.to_string(),
                "error handling message, requeuing for later"
            );
            return Outcome::Retry { attempts };
        }

        error!(
            id = %msg.id,
            attempts,
            error = err.to_string(),
            "too many attempts, sending to dead-letter exchange"
        );
        self.forget(&msg.id);
        Outcome::DeadLettered { attempts }
    }

    fn record_failure(&self, id: &str, delivery_count: Option<u32>) -> u32 {
        let from_broker = delivery_count.map_or(0, |count| count.saturating_add(1));
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(id, from_broker)
    }

    fn forget(&self, id: &str) {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

/// Processes a delivery inside a consumer span and settles it with the broker.
///
/// Settling is serialized through `ack_lock`.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    consumer: &MessageConsumer,
    ack_lock: &tokio::sync::Mutex<()>,
) -> Result<Outcome, AmqpError> {
    let delivery_count = extract_delivery_count(&delivery.properties);
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, "consume log message");

    debug!(
        exchange = delivery.exchange.as_str(),
        tag = delivery.delivery_tag,
        "received"
    );

    let outcome = consumer.on_message(&ctx, &delivery.data, delivery_count).await;

    let settled = {
        let _guard = ack_lock.lock().await;
        settle(delivery, outcome.disposition()).await
    };

    match (&settled, &outcome) {
        (Err(err), _) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
        (Ok(()), Outcome::Processed | Outcome::Duplicate) => span.set_status(Status::Ok),
        (Ok(()), _) => span.set_status(Status::Error {
            description: Cow::from(format!("{outcome:?}")),
        }),
    }

    settled.map(|_| outcome)
}

async fn settle(delivery: &Delivery, disposition: Disposition) -> Result<(), AmqpError> {
    match disposition {
        Disposition::Ack => {
            if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
                error!(error = err.to_string(), "error whiling ack msg");
                return Err(AmqpError::AckMessageError);
            }
        }
        Disposition::Requeue | Disposition::Reject => {
            if let Err(err) = delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: disposition == Disposition::Requeue,
                })
                .await
            {
                error!(error = err.to_string(), "error whiling nack msg");
                return Err(AmqpError::NackMessageError);
            }
        }
    }

    Ok(())
}

/// Reads the broker's delivery count from the message headers.
pub fn extract_delivery_count(props: &AMQPProperties) -> Option<u32> {
    let headers = props.headers().as_ref()?;

    match headers.inner().get(AMQP_HEADERS_X_DELIVERY_COUNT)? {
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::MockLogHandler,
        idempotency::{InMemoryIdempotencyStore, MockIdempotencyStore},
        message::Severity,
    };
    use lapin::{
        types::{FieldTable, ShortString},
        BasicProperties,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing_handler() -> MockLogHandler {
        let mut handler = MockLogHandler::new();
        handler
            .expect_exec()
            .returning(|_, msg| Err(AmqpError::ProcessingFailure(msg.id.clone())));
        handler
    }

    fn error_consumer(store: Arc<dyn IdempotencyStore>, handler: MockLogHandler) -> MessageConsumer {
        MessageConsumer::new(
            LogKind::Error,
            store,
            Arc::new(handler),
            DEFAULT_MAX_REDELIVERIES,
        )
    }

    #[tokio::test]
    async fn redelivered_message_runs_the_effect_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut handler = MockLogHandler::new();
        handler.expect_exec().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let consumer = error_consumer(Arc::new(InMemoryIdempotencyStore::default()), handler);
        let mut msg = LogMessage::error("auth", "DB timeout", Severity::High);
        msg.id = "E-1".to_owned();
        let data = msg.encode().unwrap();

        let ctx = Context::new();
        assert_eq!(consumer.on_message(&ctx, &data, None).await, Outcome::Processed);
        assert_eq!(consumer.on_message(&ctx, &data, Some(1)).await, Outcome::Duplicate);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected_without_requeue() {
        let consumer = error_consumer(
            Arc::new(MockIdempotencyStore::new()),
            MockLogHandler::new(),
        );
        let ctx = Context::new();

        let payloads: [&[u8]; 4] = [b"", b"   ", b"not json", br#"{"id":"E-1"}"#];
        for data in payloads {
            let outcome = consumer.on_message(&ctx, data, None).await;
            assert!(matches!(outcome, Outcome::Malformed(_)), "{data:?}");
            assert_eq!(outcome.disposition(), Disposition::Reject);
        }
    }

    #[tokio::test]
    async fn message_of_the_other_kind_is_rejected() {
        let consumer = error_consumer(
            Arc::new(MockIdempotencyStore::new()),
            MockLogHandler::new(),
        );
        let data = LogMessage::info("api", "GET /api/health 200", 3)
            .encode()
            .unwrap();

        let outcome = consumer.on_message(&Context::new(), &data, None).await;
        assert!(matches!(outcome, Outcome::Malformed(_)));
    }

    #[tokio::test]
    async fn failures_are_requeued_until_the_ceiling() {
        let consumer = error_consumer(
            Arc::new(InMemoryIdempotencyStore::default()),
            failing_handler(),
        );
        let data = LogMessage::error("auth", "Unhandled exception", Severity::Low)
            .encode()
            .unwrap();
        let ctx = Context::new();

        let first = consumer.on_message(&ctx, &data, None).await;
        let second = consumer.on_message(&ctx, &data, None).await;
        let third = consumer.on_message(&ctx, &data, None).await;

        assert_eq!(first, Outcome::Retry { attempts: 1 });
        assert_eq!(first.disposition(), Disposition::Requeue);
        assert_eq!(second, Outcome::Retry { attempts: 2 });
        assert_eq!(third, Outcome::DeadLettered { attempts: 3 });
        assert_eq!(third.disposition(), Disposition::Reject);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_failures_are_pruned_from_the_ledger() {
        let consumer = error_consumer(
            Arc::new(InMemoryIdempotencyStore::default()),
            failing_handler(),
        );
        let ctx = Context::new();

        for _ in 0..1000 {
            let data = LogMessage::error("web", "DB timeout", Severity::Low)
                .encode()
                .unwrap();
            consumer.on_message(&ctx, &data, None).await;
        }
        assert_eq!(consumer.ledger.lock().unwrap().entries.len(), 1000);

        tokio::time::advance(DEFAULT_LEDGER_TTL + Duration::from_secs(1)).await;
        let data = LogMessage::error("web", "DB timeout", Severity::Low)
            .encode()
            .unwrap();
        consumer.on_message(&ctx, &data, None).await;

        assert_eq!(consumer.ledger.lock().unwrap().entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_within_the_ledger_ttl_keep_counting() {
        let consumer = MessageConsumer::new(
            LogKind::Error,
            Arc::new(InMemoryIdempotencyStore::default()),
            Arc::new(failing_handler()),
            5,
        )
        .with_ledger_ttl(Duration::from_secs(60));
        let data = LogMessage::error("auth", "Null reference", Severity::Medium)
            .encode()
            .unwrap();
        let ctx = Context::new();

        assert_eq!(
            consumer.on_message(&ctx, &data, None).await,
            Outcome::Retry { attempts: 1 }
        );
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            consumer.on_message(&ctx, &data, None).await,
            Outcome::Retry { attempts: 2 }
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            consumer.on_message(&ctx, &data, None).await,
            Outcome::Retry { attempts: 1 }
        );
    }

    #[tokio::test]
    async fn broker_delivery_count_is_honored_by_a_fresh_consumer() {
        let consumer = error_consumer(
            Arc::new(InMemoryIdempotencyStore::default()),
            failing_handler(),
        );
        let data = LogMessage::error("auth", "Unhandled exception", Severity::Low)
            .encode()
            .unwrap();

        let outcome = consumer.on_message(&Context::new(), &data, Some(2)).await;
        assert_eq!(outcome, Outcome::DeadLettered { attempts: 3 });
    }

    #[tokio::test]
    async fn store_failure_counts_as_a_failed_attempt() {
        let mut store = MockIdempotencyStore::new();
        store
            .expect_is_processed()
            .returning(|_| Err(AmqpError::IdempotencyStoreError("down".to_owned())));

        let consumer = error_consumer(Arc::new(store), MockLogHandler::new());
        let data = LogMessage::error("auth", "DB timeout", Severity::Medium)
            .encode()
            .unwrap();

        let outcome = consumer.on_message(&Context::new(), &data, None).await;
        assert_eq!(outcome, Outcome::Retry { attempts: 1 });
    }

    #[tokio::test]
    async fn effect_is_not_marked_when_it_fails() {
        let mut store = MockIdempotencyStore::new();
        store.expect_is_processed().returning(|_| Ok(false));
        store.expect_mark_processed().never();

        let consumer = error_consumer(Arc::new(store), failing_handler());
        let data = LogMessage::error("auth", "DB timeout", Severity::Critical)
            .encode()
            .unwrap();

        let outcome = consumer.on_message(&Context::new(), &data, None).await;
        assert_eq!(outcome, Outcome::Retry { attempts: 1 });
    }

    #[test]
    fn delivery_count_is_read_from_headers() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DELIVERY_COUNT),
            AMQPValue::LongLongInt(2),
        );
        let props = BasicProperties::default().with_headers(headers);
        assert_eq!(extract_delivery_count(&props), Some(2));

        assert_eq!(extract_delivery_count(&BasicProperties::default()), None);
    }
}
