//! Replay Store (spec §4.A): durable key→marker map keyed by (org, channel).

use crate::envelope::ReplayMarker;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Redis op timeout (§5).
const REDIS_OP_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ReplayStore: Send + Sync {
    async fn get(&self, org: &str, channel: &str) -> Result<Option<ReplayMarker>, ReplayStoreError>;
    async fn set(&self, org: &str, channel: &str, marker: ReplayMarker) -> Result<(), ReplayStoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed stored marker: {0}")]
    Malformed(String),
}

/// No durability: `get` always misses, `set` is a no-op (§4.A backend 1).
pub struct NullReplayStore;

#[async_trait]
impl ReplayStore for NullReplayStore {
    async fn get(&self, _org: &str, _channel: &str) -> Result<Option<ReplayMarker>, ReplayStoreError> {
        Ok(None)
    }

    async fn set(&self, _org: &str, _channel: &str, _marker: ReplayMarker) -> Result<(), ReplayStoreError> {
        Ok(())
    }
}

/// Redis-backed store addressed by URL, with a key prefix (§4.A backend 2).
pub struct RedisReplayStore {
    manager: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisReplayStore {
    pub async fn connect(address: &str, key_prefix: impl Into<String>) -> Result<Self, ReplayStoreError> {
        let client = redis::Client::open(address)?;
        let manager = client.get_connection_manager().await?;
        Ok(RedisReplayStore {
            manager,
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, org: &str, channel: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, org, channel)
    }
}

#[async_trait]
impl ReplayStore for RedisReplayStore {
    async fn get(&self, org: &str, channel: &str) -> Result<Option<ReplayMarker>, ReplayStoreError> {
        let key = self.key(org, channel);
        let mut conn = self.manager.clone();
        let raw: Option<String> = tokio::time::timeout(REDIS_OP_TIMEOUT, redis::AsyncCommands::get(&mut conn, &key))
            .await
            .map_err(|_| ReplayStoreError::Timeout(REDIS_OP_TIMEOUT))??;
        match raw {
            None => Ok(None),
            Some(s) => {
                let marker: ReplayMarker = serde_json::from_str(&s)
                    .map_err(|e| ReplayStoreError::Malformed(e.to_string()))?;
                Ok(Some(marker))
            }
        }
    }

    async fn set(&self, org: &str, channel: &str, marker: ReplayMarker) -> Result<(), ReplayStoreError> {
        let key = self.key(org, channel);
        let value = serde_json::to_string(&marker)
            .map_err(|e| ReplayStoreError::Malformed(e.to_string()))?;
        let mut conn = self.manager.clone();
        tokio::time::timeout(REDIS_OP_TIMEOUT, redis::AsyncCommands::set::<_, _, ()>(&mut conn, &key, value))
            .await
            .map_err(|_| ReplayStoreError::Timeout(REDIS_OP_TIMEOUT))??;
        Ok(())
    }
}

/// Wraps any [`ReplayStore`] and applies the `ignore_replay_storage_errors`
/// policy (§4.A, §7): on error, either swallow (log + treat as miss/no-op)
/// or propagate as a fatal [`ReplayStoreError`].
pub struct PolicyReplayStore<S: ReplayStore> {
    inner: S,
    ignore_errors: bool,
}

impl<S: ReplayStore> PolicyReplayStore<S> {
    pub fn new(inner: S, ignore_errors: bool) -> Self {
        PolicyReplayStore { inner, ignore_errors }
    }
}

#[async_trait]
impl<S: ReplayStore> ReplayStore for PolicyReplayStore<S> {
    async fn get(&self, org: &str, channel: &str) -> Result<Option<ReplayMarker>, ReplayStoreError> {
        match self.inner.get(org, channel).await {
            Ok(v) => Ok(v),
            Err(e) if self.ignore_errors => {
                warn!(error = %e, org, channel, "replay store get failed, ignoring");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn set(&self, org: &str, channel: &str, marker: ReplayMarker) -> Result<(), ReplayStoreError> {
        match self.inner.set(org, channel, marker).await {
            Ok(()) => Ok(()),
            Err(e) if self.ignore_errors => {
                warn!(error = %e, org, channel, "replay store set failed, ignoring");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_store_always_misses() {
        let store = NullReplayStore;
        assert!(store.get("org", "ch").await.unwrap().is_none());
        store
            .set("org", "ch", ReplayMarker { replay_id: 1, created_date: "x".into() })
            .await
            .unwrap();
        assert!(store.get("org", "ch").await.unwrap().is_none());
    }

    struct AlwaysFails;

    #[async_trait]
    impl ReplayStore for AlwaysFails {
        async fn get(&self, _org: &str, _channel: &str) -> Result<Option<ReplayMarker>, ReplayStoreError> {
            Err(ReplayStoreError::Timeout(Duration::from_secs(5)))
        }
        async fn set(&self, _org: &str, _channel: &str, _marker: ReplayMarker) -> Result<(), ReplayStoreError> {
            Err(ReplayStoreError::Timeout(Duration::from_secs(5)))
        }
    }

    #[tokio::test]
    async fn policy_store_swallows_errors_when_configured() {
        let store = PolicyReplayStore::new(AlwaysFails, true);
        assert!(store.get("org", "ch").await.unwrap().is_none());
        assert!(store
            .set("org", "ch", ReplayMarker { replay_id: 1, created_date: "x".into() })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn policy_store_propagates_errors_by_default() {
        let store = PolicyReplayStore::new(AlwaysFails, false);
        assert!(store.get("org", "ch").await.is_err());
    }
}
