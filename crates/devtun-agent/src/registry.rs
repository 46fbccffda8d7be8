//! Live sessions and the device key / cloud id mapping
//!
//! Both live behind one lock so a reader never sees a session without its
//! identity entry or the other way round.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::session::DeviceSession;
use crate::types::{CloudDeviceId, DeviceKey};

/// Bidirectional device key <-> cloud id map, one entry per side
#[derive(Debug, Default)]
pub struct IdentityMap {
    by_key: HashMap<DeviceKey, CloudDeviceId>,
    by_cloud_id: HashMap<CloudDeviceId, DeviceKey>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key <-> cloud_id`, dropping whatever either side mapped to before
    pub fn insert(&mut self, key: DeviceKey, cloud_id: CloudDeviceId) {
        if let Some(old_id) = self.by_key.remove(&key) {
            self.by_cloud_id.remove(&old_id);
        }
        if let Some(old_key) = self.by_cloud_id.remove(&cloud_id) {
            self.by_key.remove(&old_key);
        }
        self.by_cloud_id.insert(cloud_id.clone(), key.clone());
        self.by_key.insert(key, cloud_id);
    }

    pub fn remove_key(&mut self, key: &DeviceKey) -> Option<CloudDeviceId> {
        let cloud_id = self.by_key.remove(key)?;
        self.by_cloud_id.remove(&cloud_id);
        Some(cloud_id)
    }

    pub fn cloud_id(&self, key: &DeviceKey) -> Option<&CloudDeviceId> {
        self.by_key.get(key)
    }

    pub fn device_key(&self, cloud_id: &CloudDeviceId) -> Option<&DeviceKey> {
        self.by_cloud_id.get(cloud_id)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<DeviceKey, Arc<DeviceSession>>,
    identities: IdentityMap,
}

/// Registry of live device sessions
#[derive(Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under its key with a freshly assigned token.
    ///
    /// Returns the stored session and every session it displaced: the
    /// previous session for the same key, and the session of any other key
    /// that was registered under the same cloud id. The caller closes those.
    ///
    /// The caller holds only the lock of `session`'s key. Evicting another
    /// key's session therefore runs outside that key's lock; whatever the
    /// other key is doing at the time only ever acts on its sessions through
    /// their tokens, so a late `remove` or `is_current` check on the evicted
    /// session is a no-op, and its accept loop finds the key unregistered and
    /// does not reconnect.
    pub fn insert(
        &self,
        mut session: DeviceSession,
        cloud_id: CloudDeviceId,
    ) -> (Arc<DeviceSession>, Vec<Arc<DeviceSession>>) {
        let mut state = self.state.write();
        session.assign_token();
        let key = session.key().clone();
        let session = Arc::new(session);
        let mut superseded = Vec::new();

        let other_key = state
            .identities
            .device_key(&cloud_id)
            .filter(|other| **other != key)
            .cloned();
        if let Some(other_key) = other_key {
            tracing::info!(
                "Cloud device {} moved from {} to {}",
                cloud_id,
                other_key,
                key
            );
            if let Some(stale) = state.sessions.remove(&other_key) {
                superseded.push(stale);
            }
        }

        if let Some(previous) = state.sessions.insert(key.clone(), session.clone()) {
            superseded.push(previous);
        }
        state.identities.insert(key, cloud_id);

        (session, superseded)
    }

    /// Remove `session` if it is still the registered one for its key.
    ///
    /// Returns false, changing nothing, when the key is absent or holds a
    /// different registration.
    pub fn remove(&self, session: &DeviceSession) -> bool {
        let mut state = self.state.write();
        let is_current = state
            .sessions
            .get(session.key())
            .is_some_and(|current| current.token() == session.token());
        if !is_current {
            return false;
        }
        state.sessions.remove(session.key());
        state.identities.remove_key(session.key());
        true
    }

    /// Whether `session` is the registration currently stored for its key
    pub fn is_current(&self, session: &DeviceSession) -> bool {
        self.state
            .read()
            .sessions
            .get(session.key())
            .is_some_and(|current| current.token() == session.token())
    }

    pub fn get(&self, key: &DeviceKey) -> Option<Arc<DeviceSession>> {
        self.state.read().sessions.get(key).cloned()
    }

    pub fn has(&self, key: &DeviceKey) -> bool {
        self.state.read().sessions.contains_key(key)
    }

    pub fn cloud_id(&self, key: &DeviceKey) -> Option<CloudDeviceId> {
        self.state.read().identities.cloud_id(key).cloned()
    }

    /// Route from a cloud id back to the local device
    pub fn device_key(&self, cloud_id: &CloudDeviceId) -> Option<DeviceKey> {
        self.state.read().identities.device_key(cloud_id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<DeviceSession>> {
        self.state.read().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().sessions.is_empty()
    }
}
