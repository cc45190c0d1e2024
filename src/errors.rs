// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Log Delivery Pipeline
//!
//! This module provides the error taxonomy shared by the connection supervisor,
//! the publisher, the consumer and the idempotency stores. The `AmqpError` enum
//! distinguishes fatal conditions (connection exhaustion, confirmed publish
//! exhaustion) from local ones that only decide how a delivery is settled.

use thiserror::Error;

/// Represents errors that can occur while delivering log messages through RabbitMQ.
///
/// Broker failures are logged at the site where they happen and mapped to one of
/// these variants, so the payloads carry strings instead of the underlying errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The broker could not be reached after every configured attempt
    #[error("failure to connect after {attempts} attempts: {cause}")]
    ConnectionError { attempts: u32, cause: String },

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// A single publish attempt failed before reaching the broker
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker did not confirm a publish in time
    #[error("publisher confirm timed out")]
    ConfirmTimeout,

    /// The broker explicitly refused a publish
    #[error("publisher confirm was negative")]
    NegativeConfirm,

    /// Every attempt to publish a confirmed message failed
    #[error("failure to publish message `{id}` after {attempts} attempts")]
    PublishFailed { id: String, attempts: u32 },

    /// Error encoding a message payload
    #[error("failure to encode payload: {0}")]
    SerializePayloadError(String),

    /// The payload could not be decoded into a log message
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The processing effect failed for a well-formed message
    #[error("failure to process message `{0}`")]
    ProcessingFailure(String),

    /// The idempotency store could not answer or record
    #[error("idempotency store failure: {0}")]
    IdempotencyStoreError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl AmqpError {
    /// Whether the error should stop the process instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError { .. } | AmqpError::ConfigError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_and_config_errors_are_fatal() {
        let connect = AmqpError::ConnectionError {
            attempts: 5,
            cause: "refused".to_owned(),
        };
        assert!(connect.is_fatal());
        assert!(AmqpError::ConfigError("bad".to_owned()).is_fatal());

        let publish = AmqpError::PublishFailed {
            id: "E-1".to_owned(),
            attempts: 5,
        };
        assert!(!publish.is_fatal());
        assert!(!AmqpError::MalformedMessage("empty".to_owned()).is_fatal());
    }

    #[test]
    fn connection_error_names_the_last_cause() {
        let err = AmqpError::ConnectionError {
            attempts: 3,
            cause: "connection refused".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "failure to connect after 3 attempts: connection refused"
        );
    }
}
