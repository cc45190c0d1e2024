// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The processing effect applied to a consumed log message. The consumer owns
//! acknowledgement and deduplication; a handler only reports whether the effect
//! succeeded.

use crate::{
    errors::AmqpError,
    message::{LogDetail, LogMessage},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::time::Duration;
use tracing::info;

/// Processing effect for one kind of log message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogHandler: Send + Sync {
    /// Applies the effect. An error makes the consumer retry or dead-letter the message.
    async fn exec(&self, ctx: &Context, msg: &LogMessage) -> Result<(), AmqpError>;
}

/// Simulates error triage: the higher the severity, the longer it takes.
pub struct ErrorLogHandler {
    worker_id: String,
    unit: Duration,
}

impl ErrorLogHandler {
    /// `unit` is the processing time of a LOW severity error.
    pub fn new(worker_id: &str, unit: Duration) -> Self {
        Self {
            worker_id: worker_id.to_owned(),
            unit,
        }
    }
}

#[async_trait]
impl LogHandler for ErrorLogHandler {
    async fn exec(&self, _ctx: &Context, msg: &LogMessage) -> Result<(), AmqpError> {
        let Some(severity) = msg.severity() else {
            return Err(AmqpError::ProcessingFailure(msg.id.clone()));
        };

        tokio::time::sleep(severity.processing_time(self.unit)).await;

        info!(
            worker = %self.worker_id,
            id = %msg.id,
            service = %msg.service,
            severity = ?severity,
            "error log processed"
        );
        Ok(())
    }
}

/// Feeds info logs to a dashboard; completes immediately.
pub struct InfoLogHandler {
    subscriber: String,
}

impl InfoLogHandler {
    pub fn new(subscriber: &str) -> Self {
        Self {
            subscriber: subscriber.to_owned(),
        }
    }
}

#[async_trait]
impl LogHandler for InfoLogHandler {
    async fn exec(&self, _ctx: &Context, msg: &LogMessage) -> Result<(), AmqpError> {
        let LogDetail::Info { latency_ms } = msg.detail else {
            return Err(AmqpError::ProcessingFailure(msg.id.clone()));
        };

        info!(
            subscriber = %self.subscriber,
            id = %msg.id,
            service = %msg.service,
            latency_ms,
            "dashboard updated"
        );
        Ok(())
    }
}
