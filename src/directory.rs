//! Controller directory.
//!
//! One entry per management controller the domain currently knows about.
//! Entries move through three states: active (answering probes), inactive
//! (missed too many probes, kept so a quick return is cheap), and reaped
//! (removed from the map entirely by the discovery scheduler).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::repository::Repository;
use crate::types::{Address, DeviceId, IdentitySignature, RepositoryKind};

/// One known management controller.
#[derive(Debug)]
pub struct Controller {
    address: Address,
    identity: DeviceId,
    active: AtomicBool,
    sensor_records: RwLock<Repository>,
    event_log: RwLock<Repository>,
}

impl Controller {
    pub(crate) fn new(address: Address, identity: DeviceId) -> Self {
        Self {
            address,
            identity,
            active: AtomicBool::new(true),
            sensor_records: RwLock::new(Repository::new(RepositoryKind::SensorRecords)),
            event_log: RwLock::new(Repository::new(RepositoryKind::EventLog)),
        }
    }

    /// Where this controller answers.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Identity reported by the controller at discovery time.
    pub fn identity(&self) -> &DeviceId {
        &self.identity
    }

    /// Stable fields of the identity, used to tell a reboot of the same
    /// controller apart from a replacement at the same address.
    pub fn signature(&self) -> IdentitySignature {
        self.identity.signature()
    }

    /// True while the controller answers probes.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// The sensor-record repository mirror.
    pub fn sensor_records(&self) -> &RwLock<Repository> {
        &self.sensor_records
    }

    /// The event-log repository mirror.
    pub fn event_log(&self) -> &RwLock<Repository> {
        &self.event_log
    }

    /// The mirror for `kind`.
    pub fn repository(&self, kind: RepositoryKind) -> &RwLock<Repository> {
        match kind {
            RepositoryKind::SensorRecords => &self.sensor_records,
            RepositoryKind::EventLog => &self.event_log,
        }
    }
}

/// Map of known controllers, keyed by bus target address.
///
/// The discovery scheduler is the only writer; readers get cheap clones
/// of the `Arc` entries and can keep them across removal.
#[derive(Debug, Default)]
pub struct Directory {
    controllers: RwLock<HashMap<u8, Arc<Controller>>>,
}

impl Directory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Look up a controller by its bus target address.
    pub fn get(&self, target: u8) -> Option<Arc<Controller>> {
        self.read_map().get(&target).cloned()
    }

    /// All controllers currently in the directory, active or not.
    pub fn controllers(&self) -> Vec<Arc<Controller>> {
        self.read_map().values().cloned().collect()
    }

    /// Bus target addresses currently in the directory.
    pub fn targets(&self) -> Vec<u8> {
        self.read_map().keys().copied().collect()
    }

    /// Number of entries, active or not.
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    /// True when no controllers are known.
    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    pub(crate) fn insert(&self, target: u8, controller: Arc<Controller>) {
        self.write_map().insert(target, controller);
    }

    /// Remove an entry only if it has already been marked inactive.
    /// Active entries never go straight to removed.
    pub(crate) fn reap_inactive(&self, target: u8) -> Option<Arc<Controller>> {
        let mut map = self.write_map();
        if map.get(&target).is_some_and(|c| !c.is_active()) {
            map.remove(&target)
        } else {
            None
        }
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u8, Arc<Controller>>> {
        self.controllers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u8, Arc<Controller>>> {
        self.controllers.write().unwrap_or_else(|e| e.into_inner())
    }
}
