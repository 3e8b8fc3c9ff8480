//! In-process lock provider
//!
//! Clones share one lock table, so several engines in the same process
//! exclude each other. Useful for tests and single-process embedding.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use super::{LockProvider, LockState};
use crate::error::LockResult;

#[derive(Debug, Clone, Default)]
pub struct MemoryLockProvider {
    locks: Arc<DashMap<String, LockState>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of a key
    pub fn holder(&self, key: &str) -> Option<LockState> {
        self.locks.get(key).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn try_acquire(&self, key: &str) -> LockResult<Option<LockState>> {
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(vacant) => {
                let state = LockState::new(key);
                vacant.insert(state.clone());
                Ok(Some(state))
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> LockResult<bool> {
        Ok(self
            .locks
            .remove_if(key, |_, state| state.owner_token == token)
            .is_some())
    }

    async fn is_locked(&self, key: &str) -> LockResult<bool> {
        Ok(self.locks.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_until_released_by_owner() {
        let provider = MemoryLockProvider::new();
        let shared = provider.clone();

        let state = provider.try_acquire("migrations").await.unwrap().unwrap();
        assert!(shared.try_acquire("migrations").await.unwrap().is_none());
        assert!(shared.is_locked("migrations").await.unwrap());
        assert!(shared.try_acquire("other").await.unwrap().is_some());

        assert!(!shared.release("migrations", "not-the-owner").await.unwrap());
        assert!(provider.is_locked("migrations").await.unwrap());

        assert!(provider
            .release("migrations", &state.owner_token)
            .await
            .unwrap());
        assert!(!provider.is_locked("migrations").await.unwrap());
        assert!(provider.holder("migrations").is_none());
    }
}
