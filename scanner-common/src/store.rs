//! A small key-value wrapper for the address history and the auto-forward policy flag.
//! The store is treated as eventually consistent: nothing here is transactional.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::timeout;
use tracing::warn;

use crate::registry::EntrySnapshot;

// Both commands are single key lookups, anything slower is treated as unavailable.
const REDIS_TIMEOUT_MILLISECS: u64 = 500;

pub const AUTO_FORWARD_KEY: &str = "scanner:auto_forward";
pub const HISTORY_KEY: &str = "scanner:history";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("timed out waiting for the store")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait Client {
    async fn get(&self, k: String) -> Result<Option<String>, StoreError>;
    async fn set(&self, k: String, v: String) -> Result<(), StoreError>;
}

pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub fn new(addr: String) -> Result<RedisClient, StoreError> {
        let client = redis::Client::open(addr)?;

        Ok(RedisClient { client })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<Option<String>, StoreError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.get(k);
        let fut: Result<Option<String>, redis::RedisError> =
            timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await?;

        Ok(fut?)
    }

    async fn set(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.set(k, v);
        let fut: Result<(), redis::RedisError> =
            timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await?;

        Ok(fut?)
    }
}

/// Keeps everything in process memory. Used when no redis is configured, and in tests.
#[derive(Default)]
pub struct MemoryClient {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Client for MemoryClient {
    async fn get(&self, k: String) -> Result<Option<String>, StoreError> {
        let values = self
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        Ok(values.get(&k).cloned())
    }

    async fn set(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut values = self
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(values.insert(k, v));

        Ok(())
    }
}

/// One verified address as persisted in the history list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub address: String,
    pub name: Option<String>,
    pub platform: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen_at: OffsetDateTime,
    pub dispatched: bool,
}

impl From<&EntrySnapshot> for HistoryRecord {
    fn from(snapshot: &EntrySnapshot) -> Self {
        let verification = snapshot.verification.clone().unwrap_or_default();

        Self {
            address: snapshot.address.to_string(),
            name: verification.name,
            platform: verification.platform,
            first_seen_at: snapshot.first_seen_at,
            dispatched: snapshot.dispatched,
        }
    }
}

/// Read the auto-forward flag, falling back to `default` when it is unset,
/// unreadable, or the store is unavailable.
pub async fn load_auto_forward(client: &(dyn Client + Send + Sync), default: bool) -> bool {
    match client.get(AUTO_FORWARD_KEY.to_owned()).await {
        Ok(Some(value)) => match value.trim().parse::<bool>() {
            Ok(flag) => flag,
            Err(_) => {
                warn!("ignoring unparseable auto forward flag: {}", value);
                default
            }
        },
        Ok(None) => default,
        Err(e) => {
            warn!("failed to read auto forward flag: {}", e);
            default
        }
    }
}

pub async fn load_history(
    client: &(dyn Client + Send + Sync),
) -> Result<Vec<HistoryRecord>, StoreError> {
    match client.get(HISTORY_KEY.to_owned()).await? {
        Some(serialized) => Ok(serde_json::from_str(&serialized)?),
        None => Ok(Vec::new()),
    }
}

/// Put `record` at the front of the history, replacing any older record for the same
/// address, and keep at most `limit` records.
pub async fn record_history(
    client: &(dyn Client + Send + Sync),
    record: HistoryRecord,
    limit: usize,
) -> Result<(), StoreError> {
    let mut history = match load_history(client).await {
        Ok(history) => history,
        Err(StoreError::Serialization(e)) => {
            warn!("discarding corrupted history: {}", e);
            Vec::new()
        }
        Err(e) => return Err(e),
    };

    history.retain(|existing| existing.address != record.address);
    history.insert(0, record);
    history.truncate(limit);

    client
        .set(HISTORY_KEY.to_owned(), serde_json::to_string(&history)?)
        .await
}
