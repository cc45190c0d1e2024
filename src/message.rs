// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Messages
//!
//! The unit of work moved through the pipeline. On the wire a message is a JSON
//! object with the fields `id`, `service`, `message`, `severity` or `latencyMs`,
//! and `timestamp`. Whether `severity` or `latencyMs` is present decides the
//! message kind, which in turn decides routing and retry policy.

use crate::errors::AmqpError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

/// Content type set on every published message
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// The two kinds of log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    Error,
    Info,
}

impl LogKind {
    /// Value written to the AMQP `type` property.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Error => "error",
            LogKind::Info => "info",
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self {
            LogKind::Error => "E",
            LogKind::Info => "I",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an error log. Higher severities take longer to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Simulated processing time, expressed in multiples of `unit`.
    pub fn processing_time(&self, unit: Duration) -> Duration {
        let factor = match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 4,
            Severity::Critical => 6,
        };
        unit.saturating_mul(factor)
    }
}

/// Kind-specific payload fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogDetail {
    Error { severity: Severity },
    Info {
        #[serde(rename = "latencyMs")]
        latency_ms: u32,
    },
}

/// A log message as produced, published and consumed.
///
/// `id` is assigned once by the producer and is the only deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub id: String,
    pub service: String,
    pub message: String,
    #[serde(flatten)]
    pub detail: LogDetail,
    pub timestamp: DateTime<Utc>,
}

impl LogMessage {
    /// Creates an error log with a fresh identifier.
    pub fn error(service: &str, message: &str, severity: Severity) -> Self {
        Self::new(service, message, LogDetail::Error { severity })
    }

    /// Creates an info log with a fresh identifier.
    pub fn info(service: &str, message: &str, latency_ms: u32) -> Self {
        Self::new(service, message, LogDetail::Info { latency_ms })
    }

    fn new(service: &str, message: &str, detail: LogDetail) -> Self {
        let kind = match detail {
            LogDetail::Error { .. } => LogKind::Error,
            LogDetail::Info { .. } => LogKind::Info,
        };

        Self {
            id: format!("{}-{}", kind.id_prefix(), Uuid::new_v4()),
            service: service.to_owned(),
            message: message.to_owned(),
            detail,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> LogKind {
        match self.detail {
            LogDetail::Error { .. } => LogKind::Error,
            LogDetail::Info { .. } => LogKind::Info,
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self.detail {
            LogDetail::Error { severity } => Some(severity),
            LogDetail::Info { .. } => None,
        }
    }

    /// Serializes the message into its UTF-8 JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
    }

    /// Parses a wire payload. Empty or unparseable payloads are malformed.
    pub fn decode(data: &[u8]) -> Result<LogMessage, AmqpError> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Err(AmqpError::MalformedMessage("empty payload".to_owned()));
        }

        let msg: LogMessage = serde_json::from_slice(data)
            .map_err(|err| AmqpError::MalformedMessage(err.to_string()))?;

        if msg.id.trim().is_empty() {
            return Err(AmqpError::MalformedMessage("missing message id".to_owned()));
        }

        Ok(msg)
    }
}
