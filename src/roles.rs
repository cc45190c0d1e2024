// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Process Roles
//!
//! Wiring of the three processes of the pipeline:
//! - the producer publishes a batch of sample logs and exits
//! - the error worker competes with other workers on the shared error queue
//! - an info subscriber consumes its own copy of every info log

use crate::{
    channel::{ConnectionSupervisor, SupervisorOptions},
    config::Settings,
    consumer::MessageConsumer,
    dispatcher::RabbitMQDispatcher,
    errors::AmqpError,
    handler::{ErrorLogHandler, InfoLogHandler},
    message::{LogKind, LogMessage, Severity},
    publisher::{AmqpPublishChannel, Publisher, ReliablePublisher},
    topology::{
        error_worker_topology, info_queue_name, info_subscriber_topology, producer_topology,
        AmqpTopology, ERROR_QUEUE,
    },
};
use futures_util::{stream::FuturesUnordered, StreamExt};
use opentelemetry::Context;
use std::{future::Future, sync::Arc};
use tracing::{error, info, warn};

const SAMPLE_SERVICES: [&str; 5] = ["auth", "web", "api", "database", "cache"];
const SAMPLE_ERRORS: [&str; 4] = [
    "DB timeout",
    "Connection refused",
    "Null reference",
    "Unhandled exception",
];
const SAMPLE_REQUESTS: [&str; 4] = [
    "GET /api/orders 200",
    "POST /api/users 201",
    "PATCH /api/products 200",
    "DELETE /api/cart 204",
];
const SAMPLE_SEVERITIES: [Severity; 4] = [
    Severity::Low,
    Severity::Medium,
    Severity::High,
    Severity::Critical,
];

/// Deterministic sample log, alternating between error and info logs.
pub fn sample_message(i: usize) -> LogMessage {
    let service = SAMPLE_SERVICES[i % SAMPLE_SERVICES.len()];

    if i % 2 == 0 {
        LogMessage::error(
            service,
            SAMPLE_ERRORS[(i / 2) % SAMPLE_ERRORS.len()],
            SAMPLE_SEVERITIES[(i / 2) % SAMPLE_SEVERITIES.len()],
        )
    } else {
        let latency_ms = 5 + (i as u32).wrapping_mul(37) % 500;
        LogMessage::info(
            service,
            SAMPLE_REQUESTS[(i / 2) % SAMPLE_REQUESTS.len()],
            latency_ms,
        )
    }
}

/// Completes on Ctrl-C, or on SIGTERM on unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
                }
                return;
            }
            Err(err) => warn!(error = err.to_string(), "failure to register SIGTERM handler"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = err.to_string(), "failure to listen for Ctrl-C");
    }
    info!("Ctrl-C received, shutting down");
}

fn supervisor_options(settings: &Settings, role: &str, confirms: bool) -> SupervisorOptions {
    SupervisorOptions {
        uri: settings.rabbitmq.uri(),
        connection_name: format!("{}-{role}", settings.app.name),
        retry: settings.rabbitmq.connect_retry,
        confirms,
    }
}

async fn start(
    settings: &Settings,
    role: &str,
    confirms: bool,
    topology: AmqpTopology,
) -> Result<Arc<ConnectionSupervisor>, AmqpError> {
    ConnectionSupervisor::start(supervisor_options(settings, role, confirms), topology).await
}

/// Counts of a published batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub delivered: usize,
    /// Best-effort messages dropped after exhausting their retries
    pub dropped: usize,
    /// Confirmed messages that could not be published
    pub failed: usize,
}

/// Publishes `messages` concurrently.
///
/// Stops at the first fatal error, leaving the remaining publishes unfinished.
pub async fn publish_batch<P: Publisher>(
    publisher: &P,
    ctx: &Context,
    messages: &[LogMessage],
) -> Result<BatchReport, AmqpError> {
    let mut pending: FuturesUnordered<_> = messages
        .iter()
        .map(|msg| publisher.publish(ctx, msg))
        .collect();

    let mut report = BatchReport::default();
    while let Some(result) = pending.next().await {
        match result {
            Ok(receipt) if receipt.delivered => report.delivered += 1,
            Ok(_) => report.dropped += 1,
            Err(err) if err.is_fatal() => return Err(err),
            Err(_) => report.failed += 1,
        }
    }
    Ok(report)
}

/// Publishes `PRODUCER_MESSAGE_COUNT` sample logs concurrently, then closes the connection.
///
/// Confirmed logs that could not be published are reported but do not fail the run.
/// A fatal error, such as a connection that cannot be re-established, stops the
/// run and is returned.
pub async fn run_producer(settings: &Settings) -> Result<(), AmqpError> {
    let supervisor = start(
        settings,
        "producer",
        true,
        producer_topology(settings.consumer.error_queue_message_ttl_ms),
    )
    .await?;

    let publisher = ReliablePublisher::new(
        AmqpPublishChannel::new(supervisor.clone(), settings.publisher.confirm_timeout),
        settings.publisher.retry,
    );

    let messages: Vec<LogMessage> = (0..settings.app.producer_message_count)
        .map(sample_message)
        .collect();

    let result = publish_batch(&publisher, &Context::current(), &messages).await;
    supervisor.close().await;

    match result {
        Ok(report) if report.failed > 0 => {
            error!(
                delivered = report.delivered,
                dropped = report.dropped,
                failed = report.failed,
                "producer finished with lost messages"
            );
            Ok(())
        }
        Ok(report) => {
            info!(
                delivered = report.delivered,
                dropped = report.dropped,
                "producer finished"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = err.to_string(), "producer stopped");
            Err(err)
        }
    }
}

/// Processes error logs from the shared queue until `shutdown` completes.
pub async fn run_error_worker<F>(settings: &Settings, shutdown: F) -> Result<(), AmqpError>
where
    F: Future<Output = ()>,
{
    let worker_id = &settings.app.worker_id;
    let store = settings.idempotency.build_store().await?;

    let supervisor = start(
        settings,
        &format!("error-worker-{worker_id}"),
        false,
        error_worker_topology(settings.consumer.error_queue_message_ttl_ms),
    )
    .await?;

    let consumer = MessageConsumer::new(
        LogKind::Error,
        store,
        Arc::new(ErrorLogHandler::new(worker_id, settings.app.processing_unit)),
        settings.consumer.max_redeliveries,
    )
    .with_ledger_ttl(settings.consumer.failure_ledger_ttl);

    info!(worker = %worker_id, "error worker started");
    RabbitMQDispatcher::new(
        supervisor,
        ERROR_QUEUE,
        &format!("error-worker-{worker_id}"),
        settings.consumer.prefetch_count,
        consumer,
    )
    .consume_until(shutdown)
    .await
}

/// Feeds the info logs of the private queue of `service` to its dashboard until
/// `shutdown` completes.
pub async fn run_info_subscriber<F>(
    settings: &Settings,
    service: &str,
    shutdown: F,
) -> Result<(), AmqpError>
where
    F: Future<Output = ()>,
{
    if service.trim().is_empty() {
        return Err(AmqpError::ConfigError(
            "info subscriber needs a service name".to_owned(),
        ));
    }

    let store = settings.idempotency.build_store().await?;
    let supervisor = start(
        settings,
        &format!("info-subscriber-{service}"),
        false,
        info_subscriber_topology(service),
    )
    .await?;

    let consumer = MessageConsumer::new(
        LogKind::Info,
        store,
        Arc::new(InfoLogHandler::new(service)),
        settings.consumer.max_redeliveries,
    )
    .with_ledger_ttl(settings.consumer.failure_ledger_ttl);

    info!(subscriber = %service, "info subscriber started");
    RabbitMQDispatcher::new(
        supervisor,
        &info_queue_name(service),
        &format!("info-subscriber-{service}"),
        settings.consumer.prefetch_count,
        consumer,
    )
    .consume_until(shutdown)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        publisher::MockPublishChannel,
        retry::{Backoff, RetryPolicy},
    };
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Backoff::Linear {
                base: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn batch_counts_delivered_dropped_and_failed() {
        let mut channel = MockPublishChannel::new();
        channel.expect_send().returning(|route, payload, _| {
            let msg = LogMessage::decode(payload).unwrap();
            match (route.confirm, msg.service.as_str()) {
                (_, "auth") => Ok(()),
                (true, _) => Err(AmqpError::NegativeConfirm),
                (false, _) => Err(AmqpError::PublishingError("closed".to_owned())),
            }
        });
        let publisher = ReliablePublisher::new(channel, policy(2));

        let messages = vec![
            LogMessage::error("auth", "DB timeout", Severity::Low),
            LogMessage::error("web", "DB timeout", Severity::Low),
            LogMessage::info("api", "GET /api/orders 200", 12),
        ];
        let report = publish_batch(&publisher, &Context::new(), &messages)
            .await
            .unwrap();

        assert_eq!(
            report,
            BatchReport {
                delivered: 1,
                dropped: 1,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn batch_stops_on_a_fatal_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut channel = MockPublishChannel::new();
        channel.expect_send().returning(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AmqpError::ConnectionError {
                attempts: 5,
                cause: "connection refused".to_owned(),
            })
        });
        let publisher = ReliablePublisher::new(channel, policy(5));

        let messages: Vec<LogMessage> = (0..4).map(sample_message).collect();
        let result = publish_batch(&publisher, &Context::new(), &messages).await;

        assert!(matches!(
            result,
            Err(AmqpError::ConnectionError { attempts: 5, .. })
        ));
        assert!(calls.load(Ordering::SeqCst) <= messages.len() as u32);
    }

    #[test]
    fn samples_alternate_between_kinds() {
        let kinds: Vec<LogKind> = (0..4).map(|i| sample_message(i).kind()).collect();
        assert_eq!(
            kinds,
            vec![LogKind::Error, LogKind::Info, LogKind::Error, LogKind::Info]
        );
    }

    #[test]
    fn samples_have_distinct_ids() {
        let a = sample_message(0);
        let b = sample_message(0);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("E-"));
        assert!(sample_message(1).id.starts_with("I-"));
    }

    #[test]
    fn sample_severities_cycle() {
        let severities: Vec<_> = (0..8)
            .step_by(2)
            .filter_map(|i| sample_message(i).severity())
            .collect();
        assert_eq!(severities, SAMPLE_SEVERITIES.to_vec());
    }
}
