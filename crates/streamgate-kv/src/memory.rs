//! In-memory `RoleStore`, used for tests and single-process local runs —
//! the `streamgate-kv` analogue of the teacher's `TestNats`.

use crate::role_store::RoleStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Claim {
    holder: String,
    expires_at: Instant,
}

impl Claim {
    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// A process-local `RoleStore` backed by a mutex-guarded map.
///
/// Not durable across restarts and not shared across processes — fine for
/// tests and single-node deployments, a documented extension point for a
/// real shared backend otherwise.
#[derive(Default)]
pub struct InMemoryRoleStore {
    claims: Mutex<HashMap<String, Claim>>,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoleStore for InMemoryRoleStore {
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut claims = self.claims.lock().await;
        let vacant = match claims.get(key) {
            Some(existing) => !existing.is_live() || existing.holder == holder,
            None => true,
        };
        if vacant {
            claims.insert(
                key.to_string(),
                Claim {
                    holder: holder.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }
        Ok(vacant)
    }

    async fn refresh(&self, key: &str, holder: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut claims = self.claims.lock().await;
        match claims.get_mut(key) {
            Some(existing) if existing.is_live() && existing.holder == holder => {
                existing.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder: &str) -> anyhow::Result<bool> {
        let mut claims = self.claims.lock().await;
        match claims.get(key) {
            Some(existing) if existing.holder == holder => {
                claims.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder_of(&self, key: &str) -> anyhow::Result<Option<String>> {
        let claims = self.claims.lock().await;
        Ok(claims
            .get(key)
            .filter(|c| c.is_live())
            .map(|c| c.holder.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_exclusive_between_distinct_holders() {
        let store = InMemoryRoleStore::new();
        assert!(store.acquire("role/a", "h1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.acquire("role/a", "h2", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_claim_can_be_reacquired_by_another_holder() {
        let store = InMemoryRoleStore::new();
        assert!(store
            .acquire("role/a", "h1", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.acquire("role/a", "h2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.holder_of("role/a").await.unwrap(), Some("h2".into()));
    }

    #[tokio::test]
    async fn release_is_conditional_on_current_holder() {
        let store = InMemoryRoleStore::new();
        store.acquire("role/a", "h1", Duration::from_secs(5)).await.unwrap();
        assert!(!store.release("role/a", "h2").await.unwrap());
        assert!(store.release("role/a", "h1").await.unwrap());
        assert_eq!(store.holder_of("role/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn refresh_requires_current_holder() {
        let store = InMemoryRoleStore::new();
        store.acquire("role/a", "h1", Duration::from_millis(20)).await.unwrap();
        assert!(!store.refresh("role/a", "h2", Duration::from_secs(5)).await.unwrap());
        assert!(store.refresh("role/a", "h1", Duration::from_secs(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.holder_of("role/a").await.unwrap(), Some("h1".into()));
    }
}
