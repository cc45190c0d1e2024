// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Idempotency Store
//!
//! Records the identifiers of messages whose processing completed, so a
//! redelivered message can be acknowledged without running its effect again.
//!
//! Two backends implement `IdempotencyStore`:
//! - `InMemoryIdempotencyStore`: process-local, only correct with a single
//!   consumer replica per queue
//! - `RedisIdempotencyStore`: shared by every replica competing on a queue

use crate::errors::AmqpError;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use redis::aio::MultiplexedConnection;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// How long a processed message is remembered by default
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
/// Minimum time between two sweeps triggered by `mark_processed`
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Prefix of the Redis keys holding processed message ids
pub const REDIS_KEY_PREFIX: &str = "processed_msg:";

/// Lookup and record of processed message identifiers.
///
/// Implementations are shared between concurrently running handlers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether a live record exists for `id`.
    async fn is_processed(&self, id: &str) -> Result<bool, AmqpError>;

    /// Records `id` as processed now, replacing any previous record.
    async fn mark_processed(&self, id: &str) -> Result<(), AmqpError>;
}

struct Records {
    entries: HashMap<String, DateTime<Utc>>,
    last_sweep: DateTime<Utc>,
}

/// Process-local store bounded by a TTL sweep.
///
/// Lookups treat expired records as absent, so the sweep only reclaims memory
/// and never changes an answer.
pub struct InMemoryIdempotencyStore {
    ttl: TimeDelta,
    sweep_interval: TimeDelta,
    records: RwLock<Records>,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_sweep_interval(ttl, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            sweep_interval: TimeDelta::from_std(sweep_interval).unwrap_or(TimeDelta::MAX),
            records: RwLock::new(Records {
                entries: HashMap::new(),
                last_sweep: Utc::now(),
            }),
        }
    }

    fn is_live(&self, processed_at: &DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(*processed_at) <= self.ttl
    }

    /// Records `id` as processed at `processed_at`.
    pub fn record_at(&self, id: &str, processed_at: DateTime<Utc>) {
        let now = Utc::now();
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.entries.insert(id.to_owned(), processed_at);

        if now.signed_duration_since(records.last_sweep) >= self.sweep_interval {
            self.sweep_locked(&mut records, now);
        }
    }

    /// Removes every expired record and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        self.sweep_locked(&mut records, Utc::now())
    }

    fn sweep_locked(&self, records: &mut Records, now: DateTime<Utc>) -> usize {
        let before = records.entries.len();
        records
            .entries
            .retain(|_, processed_at| self.is_live(processed_at, now));
        records.last_sweep = now;

        let removed = before - records.entries.len();
        if removed > 0 {
            debug!(removed, "expired idempotency records swept");
        }
        removed
    }

    /// Number of records held, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweeps the store on a periodic timer until the returned task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_processed(&self, id: &str) -> Result<bool, AmqpError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .entries
            .get(id)
            .is_some_and(|processed_at| self.is_live(processed_at, Utc::now())))
    }

    async fn mark_processed(&self, id: &str) -> Result<(), AmqpError> {
        self.record_at(id, Utc::now());
        Ok(())
    }
}

/// Store shared by every consumer replica, backed by Redis keys with a TTL.
pub struct RedisIdempotencyStore {
    conn: MultiplexedConnection,
    ttl_secs: u64,
}

impl RedisIdempotencyStore {
    /// Connects to Redis at `url`.
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, AmqpError> {
        let client = match redis::Client::open(url) {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "invalid redis url");
                return Err(AmqpError::IdempotencyStoreError(err.to_string()));
            }
        };

        let conn = match client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect to redis");
                return Err(AmqpError::IdempotencyStoreError(err.to_string()));
            }
        };

        debug!("redis idempotency store connected");
        Ok(Self {
            conn,
            ttl_secs: ttl.as_secs().max(1),
        })
    }

    fn key(id: &str) -> String {
        format!("{REDIS_KEY_PREFIX}{id}")
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn is_processed(&self, id: &str) -> Result<bool, AmqpError> {
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), id, "failure to check idempotency key");
                AmqpError::IdempotencyStoreError(err.to_string())
            })?;

        Ok(exists > 0)
    }

    async fn mark_processed(&self, id: &str) -> Result<(), AmqpError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::key(id))
            .arg(1)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), id, "failure to record idempotency key");
                AmqpError::IdempotencyStoreError(err.to_string())
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marks_and_finds_processed_ids() {
        let store = InMemoryIdempotencyStore::default();

        assert!(!store.is_processed("E-1").await.unwrap());
        store.mark_processed("E-1").await.unwrap();
        assert!(store.is_processed("E-1").await.unwrap());
        assert!(!store.is_processed("E-2").await.unwrap());
    }

    #[tokio::test]
    async fn marking_twice_keeps_a_single_record() {
        let store = InMemoryIdempotencyStore::default();

        store.mark_processed("E-1").await.unwrap();
        store.mark_processed("E-1").await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn record_older_than_ttl_is_not_processed() {
        let ttl = Duration::from_secs(3600);
        let store = InMemoryIdempotencyStore::new(ttl);

        let expired_at = Utc::now() - TimeDelta::from_std(ttl).unwrap() - TimeDelta::seconds(1);
        store.record_at("E-1", expired_at);

        assert!(!store.is_processed("E-1").await.unwrap());

        store.mark_processed("E-1").await.unwrap();
        assert!(store.is_processed("E-1").await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_records() {
        let ttl = Duration::from_secs(60);
        let store = InMemoryIdempotencyStore::new(ttl);

        store.record_at("old", Utc::now() - TimeDelta::seconds(61));
        store.record_at("fresh", Utc::now());

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.is_processed("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn marking_sweeps_once_the_interval_elapsed() {
        let store = InMemoryIdempotencyStore::with_sweep_interval(
            Duration::from_secs(60),
            Duration::ZERO,
        );

        store.record_at("old", Utc::now() - TimeDelta::seconds(120));
        store.mark_processed("new").await.unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.is_processed("new").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_records_on_its_schedule() {
        let store = Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(60)));
        store.record_at("old", Utc::now() - TimeDelta::seconds(120));

        let sweeper = store.clone().spawn_sweeper(Duration::from_secs(30));
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.len(), 0);

        sweeper.abort();
    }

    #[tokio::test]
    async fn concurrent_handlers_share_the_store() {
        let store = Arc::new(InMemoryIdempotencyStore::default());

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.mark_processed(&format!("E-{i}")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.len(), 16);
        for i in 0..16 {
            assert!(store.is_processed(&format!("E-{i}")).await.unwrap());
        }
    }

    #[tokio::test]
    async fn unreachable_redis_is_a_store_error() {
        let result = RedisIdempotencyStore::connect("redis://127.0.0.1:1", DEFAULT_TTL).await;
        assert!(matches!(result, Err(AmqpError::IdempotencyStoreError(_))));
    }
}
