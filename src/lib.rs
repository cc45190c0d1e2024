// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable, idempotent, at-least-once delivery of log messages over RabbitMQ.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod idempotency;
pub mod logging;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod roles;
pub mod topology;
