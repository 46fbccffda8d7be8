use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::DeviceKey;

pub type KeyGuard = OwnedMutexGuard<()>;

/// One async mutex per device key.
///
/// Connects, reconnects and teardowns for the same device run one at a time;
/// different devices never wait on each other.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<DeviceKey, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &DeviceKey) -> KeyGuard {
        let lock = Arc::clone(&self.locks.entry(key.clone()).or_default());
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
