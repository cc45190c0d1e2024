// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module runs the consumption loop of a queue. Deliveries are read from
//! the lapin consumer stream and processed concurrently, each in its own task,
//! with at most `prefetch` tasks in flight. When the stream ends or fails the
//! dispatcher asks the supervisor for a new channel, which re-declares the
//! topology, and subscribes again.
//!
//! Shutdown is driven by a single future: once it completes the dispatcher
//! cancels its subscription, waits for in-flight deliveries to settle and closes
//! the channel and connection.

use crate::{
    channel::ConnectionSupervisor,
    consumer::{consume, MessageConsumer},
    errors::AmqpError,
};
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Consumer,
};
use opentelemetry::global;
use std::{fmt::Display, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

/// Delay before subscribing again after a non-fatal subscription failure
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Why `DeliveryPool::run` stopped reading its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStop {
    Shutdown,
    Failed(String),
    Ended,
}

/// Runs the work of each stream item in its own task, at most `limit` at a time.
pub struct DeliveryPool {
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl DeliveryPool {
    pub fn new(limit: u16) -> Self {
        DeliveryPool {
            permits: Arc::new(Semaphore::new(usize::from(limit.max(1)))),
            tasks: JoinSet::new(),
        }
    }

    /// Number of spawned tasks not yet joined.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Reads `stream` and spawns `handle(item)` for every item until the stream
    /// fails or ends, or `shutdown` completes.
    ///
    /// A permit is taken before the next item is read, so no item is pulled
    /// from the stream while the pool is full.
    ///
    /// # Parameters
    /// * `stream` - Source of items, such as a lapin consumer
    /// * `shutdown` - Future completing when intake must stop
    /// * `handle` - Builds the work of one item
    ///
    /// # Returns
    /// Why the intake stopped. Spawned tasks are left running, see `drain`
    pub async fn run<S, T, E, Sh, F, Fut>(
        &mut self,
        stream: &mut S,
        shutdown: &mut Sh,
        mut handle: F,
    ) -> StreamStop
    where
        S: Stream<Item = Result<T, E>> + Unpin,
        E: Display,
        Sh: Future<Output = ()> + Unpin,
        F: FnMut(T) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            self.reap();

            let permit = tokio::select! {
                _ = &mut *shutdown => return StreamStop::Shutdown,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(err) => return StreamStop::Failed(err.to_string()),
                },
            };

            let next = tokio::select! {
                _ = &mut *shutdown => return StreamStop::Shutdown,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(item)) => {
                    let work = handle(item);
                    self.tasks.spawn(async move {
                        let _permit = permit;
                        work.await;
                    });
                }
                Some(Err(err)) => return StreamStop::Failed(err.to_string()),
                None => return StreamStop::Ended,
            }
        }
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(err) = joined {
                error!(error = err.to_string(), "delivery task failed");
            }
        }
    }

    /// Waits for every spawned task to finish.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = err.to_string(), "delivery task failed");
            }
        }
    }
}

/// Consumes one queue until shutdown.
pub struct RabbitMQDispatcher {
    supervisor: Arc<ConnectionSupervisor>,
    queue: String,
    consumer_tag: String,
    prefetch: u16,
    consumer: Arc<MessageConsumer>,
}

impl RabbitMQDispatcher {
    /// Creates a new dispatcher.
    ///
    /// # Parameters
    /// * `supervisor` - Supervisor handing out the consuming channel
    /// * `queue` - Name of the queue to consume
    /// * `consumer_tag` - Tag identifying this consumer on the broker
    /// * `prefetch` - Unacknowledged deliveries allowed, also the task limit
    /// * `consumer` - Processing of a single delivery
    ///
    /// # Returns
    /// A new `RabbitMQDispatcher` instance
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
        consumer: MessageConsumer,
    ) -> Self {
        RabbitMQDispatcher {
            supervisor,
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            prefetch: prefetch.max(1),
            consumer: Arc::new(consumer),
        }
    }

    async fn subscribe(&self) -> Result<(Arc<Channel>, Consumer), AmqpError> {
        let channel = self.supervisor.channel().await?;

        if let Err(err) = channel
            .basic_qos(self.prefetch, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }

        let consumer = match channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        info!(
            queue = %self.queue,
            prefetch = self.prefetch,
            "waiting for messages"
        );
        Ok((channel, consumer))
    }

    /// Consumes the queue until `shutdown` completes.
    ///
    /// # Parameters
    /// * `shutdown` - Future completing when the process must stop
    ///
    /// # Returns
    /// `Ok(())` after a graceful shutdown, or an error only when the broker
    /// cannot be reached anymore
    pub async fn consume_until<F>(&self, shutdown: F) -> Result<(), AmqpError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let ack_lock = Arc::new(Mutex::new(()));
        let mut pool = DeliveryPool::new(self.prefetch);

        'subscription: loop {
            let (channel, mut stream) = match self.subscribe().await {
                Ok(subscribed) => subscribed,
                Err(err) if err.is_fatal() => {
                    pool.drain().await;
                    return Err(err);
                }
                Err(err) => {
                    warn!(error = err.to_string(), "subscription failed, retrying");
                    self.supervisor.invalidate().await;
                    tokio::select! {
                        _ = &mut shutdown => break 'subscription,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue 'subscription,
                    }
                }
            };

            let stop = pool
                .run(&mut stream, &mut shutdown, |delivery| {
                    let consumer = self.consumer.clone();
                    let ack_lock = ack_lock.clone();
                    async move {
                        let tracer = global::tracer("amqp consumer");
                        match consume(&tracer, &delivery, &consumer, &ack_lock).await {
                            Ok(outcome) => debug!(?outcome, "delivery settled"),
                            Err(err) => error!(error = err.to_string(), "error consume msg"),
                        }
                    }
                })
                .await;

            match stop {
                StreamStop::Shutdown => {
                    if let Err(err) = channel
                        .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                        .await
                    {
                        warn!(error = err.to_string(), "error cancelling the consumer");
                    }
                    break 'subscription;
                }
                StreamStop::Failed(err) => {
                    error!(error = %err, "consumer stream failed, resubscribing");
                    self.supervisor.invalidate().await;
                }
                StreamStop::Ended => {
                    warn!("consumer stream ended, resubscribing");
                    self.supervisor.invalidate().await;
                }
            }
        }

        info!(in_flight = pool.in_flight(), "shutting down, draining deliveries");
        pool.drain().await;
        self.supervisor.close().await;
        Ok(())
    }
}
