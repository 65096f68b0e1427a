//! Persistence and cross-instance locking seams.
//!
//! Several independent execution contexts (tabs, windows, processes) may
//! share one persisted session; these traits abstract the shared key-value
//! store and the named mutual-exclusion lock serializing mutations to it.
//! In-process implementations are provided for single-instance hosts and
//! tests; multi-instance hosts supply backends over their platform's shared
//! storage and locking primitives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::AuthError;

/// Persisted key-value store shared by all session manager instances.
///
/// Values are JSON strings; the manager owns the schema of every key.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the value stored at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, AuthError>;

    /// Store `value` at `key`, replacing any prior value.
    async fn put(&self, key: &str, value: String) -> Result<(), AuthError>;

    /// Remove `key` if present.
    async fn remove(&self, key: &str) -> Result<(), AuthError>;
}

/// Opaque held-lock token. Dropping it releases the lock, so release is
/// guaranteed on every exit path.
pub trait LockGuard: Send {}

impl LockGuard for tokio::sync::OwnedMutexGuard<()> {}

/// Named mutual-exclusion lock effective across every execution context
/// sharing the [`StateStore`].
///
/// Acquisition order across instances is unspecified; first-come-first-served
/// is acceptable.
#[async_trait]
pub trait SessionLock: Send + Sync {
    /// Acquire the lock named `name`, waiting until it is free. Held until
    /// the returned guard drops.
    async fn acquire(&self, name: &str) -> Result<Box<dyn LockGuard>, AuthError>;
}

/// In-memory [`StateStore`] for tests and single-instance hosts.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        Ok(self.map().get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), AuthError> {
        self.map().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AuthError> {
        self.map().remove(key);
        Ok(())
    }
}

/// In-process [`SessionLock`] backed by per-name async mutexes.
///
/// Only serializes contexts inside one process; multi-instance hosts need a
/// lock that reaches across their instances.
#[derive(Debug, Default, Clone)]
pub struct LocalLock {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LocalLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionLock for LocalLock {
    async fn acquire(&self, name: &str) -> Result<Box<dyn LockGuard>, AuthError> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            locks.entry(name.to_string()).or_default().clone()
        };
        Ok(Box::new(mutex.lock_owned().await))
    }
}
