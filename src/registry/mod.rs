//! Object registry.
//!
//! Maps identifiers to tagged records `(kind, role, state)`. The table is split
//! into shards, each behind its own lock, so lookups on different identifiers
//! never contend. Registration and release take the shard's write lock and
//! therefore serialize against each other for the same identifier.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{Error, ObjectId, ObjectKind, PeerId, Result};

const SHARD_COUNT: usize = 32;

/// Whether this node forwards operations or holds the real resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Proxy,
    Backing,
}

/// Kind-specific state. The variant is the kind tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectState {
    ComputeNode { address: String },
    Device { node: ObjectId, name: String },
    Context { devices: Vec<ObjectId> },
    CommandQueue { context: ObjectId, device: ObjectId },
    Buffer { context: ObjectId, flags: u64, size: u64 },
    Program { context: ObjectId },
    Kernel { program: ObjectId, name: String },
    Event { context: ObjectId, user: bool },
}

impl ObjectState {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectState::ComputeNode { .. } => ObjectKind::ComputeNode,
            ObjectState::Device { .. } => ObjectKind::Device,
            ObjectState::Context { .. } => ObjectKind::Context,
            ObjectState::CommandQueue { .. } => ObjectKind::CommandQueue,
            ObjectState::Buffer { .. } => ObjectKind::Buffer,
            ObjectState::Program { .. } => ObjectKind::Program,
            ObjectState::Kernel { .. } => ObjectKind::Kernel,
            ObjectState::Event { .. } => ObjectKind::Event,
        }
    }

    /// Context an object belongs to, if it has one.
    pub fn context(&self) -> Option<ObjectId> {
        match self {
            ObjectState::CommandQueue { context, .. }
            | ObjectState::Buffer { context, .. }
            | ObjectState::Program { context }
            | ObjectState::Event { context, .. } => Some(*context),
            _ => None,
        }
    }
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub id: ObjectId,
    pub role: Role,
    pub state: ObjectState,
    /// Compute nodes hosting the backing objects of a proxy.
    pub hosts: Vec<ObjectId>,
    /// Connection a backing object was created over.
    pub origin: Option<PeerId>,
}

impl RemoteObject {
    pub fn proxy(id: ObjectId, state: ObjectState, hosts: Vec<ObjectId>) -> Self {
        Self {
            id,
            role: Role::Proxy,
            state,
            hosts,
            origin: None,
        }
    }

    pub fn backing(id: ObjectId, state: ObjectState, origin: Option<PeerId>) -> Self {
        Self {
            id,
            role: Role::Backing,
            state,
            hosts: Vec::new(),
            origin,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.state.kind()
    }
}

/// Kind-specific cleanup run when a record leaves the registry.
pub trait Teardown: Send + Sync {
    fn teardown(&self, object: &RemoteObject);
}

type Shard = RwLock<HashMap<ObjectId, Arc<RemoteObject>>>;

/// Thread-safe, sharded identifier directory.
pub struct Registry {
    shards: Box<[Shard]>,
    teardown: Option<Arc<dyn Teardown>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("objects", &self.len())
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            teardown: None,
        }
    }

    /// Registry whose releases run `teardown`.
    pub fn with_teardown(teardown: Arc<dyn Teardown>) -> Self {
        Self {
            teardown: Some(teardown),
            ..Self::new()
        }
    }

    fn shard(&self, id: ObjectId) -> &Shard {
        // Fibonacci hashing spreads sequential counters across shards.
        let hash = id.as_u64().wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.shards[(hash >> 59) as usize % self.shards.len()]
    }

    fn read(&self, id: ObjectId) -> RwLockReadGuard<'_, HashMap<ObjectId, Arc<RemoteObject>>> {
        // A poisoned shard only means another thread panicked mid-insert;
        // the map itself is still consistent.
        self.shard(id).read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, id: ObjectId) -> RwLockWriteGuard<'_, HashMap<ObjectId, Arc<RemoteObject>>> {
        self.shard(id).write().unwrap_or_else(|e| e.into_inner())
    }

    /// Associate a record with its identifier.
    pub fn register(&self, object: RemoteObject) -> Result<Arc<RemoteObject>> {
        let id = object.id;
        if id.is_null() {
            return Err(Error::validation("cannot register the null identifier"));
        }
        let mut shard = self.write(id);
        if shard.contains_key(&id) {
            return Err(Error::Duplicate(id));
        }
        let object = Arc::new(object);
        shard.insert(id, object.clone());
        tracing::debug!(id = %id, kind = %object.kind(), role = ?object.role, "registered object");
        Ok(object)
    }

    /// Resolve an identifier. `None` means the object was never known or has
    /// already been released.
    pub fn lookup(&self, id: ObjectId) -> Option<Arc<RemoteObject>> {
        self.read(id).get(&id).cloned()
    }

    /// Resolve an identifier that must name an object of `kind`.
    pub fn lookup_kind(&self, id: ObjectId, kind: ObjectKind) -> Result<Arc<RemoteObject>> {
        match self.lookup(id) {
            Some(object) if object.kind() == kind => Ok(object),
            _ => Err(Error::invalid_object(id, kind)),
        }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.read(id).contains_key(&id)
    }

    /// Remove a record and run its teardown. Returns `None` if it was already
    /// gone.
    pub fn release(&self, id: ObjectId) -> Option<Arc<RemoteObject>> {
        let removed = self.write(id).remove(&id);
        if let Some(object) = &removed {
            // Teardown runs outside the shard lock.
            if let Some(teardown) = &self.teardown {
                teardown.teardown(object);
            }
            tracing::debug!(id = %id, kind = %object.kind(), "released object");
        }
        removed
    }

    /// Backing records created over one connection.
    pub fn records_from(&self, peer: PeerId) -> Vec<Arc<RemoteObject>> {
        self.collect(|object| object.origin == Some(peer))
    }

    fn collect(&self, filter: impl Fn(&RemoteObject) -> bool) -> Vec<Arc<RemoteObject>> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read().unwrap_or_else(|e| e.into_inner());
            out.extend(shard.values().filter(|o| filter(o)).cloned());
        }
        out.sort_by_key(|o| o.id);
        out
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn context(id: u64) -> RemoteObject {
        RemoteObject::backing(
            ObjectId::from_raw(id),
            ObjectState::Context {
                devices: vec![ObjectId::from_raw(7)],
            },
            None,
        )
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(ObjectId, ObjectKind)>>);

    impl Teardown for Recorder {
        fn teardown(&self, object: &RemoteObject) {
            self.0.lock().unwrap().push((object.id, object.kind()));
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        registry.register(context(100)).unwrap();

        let found = registry.lookup(ObjectId::from_raw(100)).unwrap();
        assert_eq!(found.kind(), ObjectKind::Context);
        assert_eq!(found.role, Role::Backing);
        assert!(registry.lookup(ObjectId::from_raw(101)).is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = Registry::new();
        registry.register(context(100)).unwrap();
        let err = registry.register(context(100)).unwrap_err();
        assert!(matches!(err, Error::Duplicate(id) if id.as_u64() == 100));
    }

    #[test]
    fn test_null_id_rejected() {
        let registry = Registry::new();
        assert!(registry.register(context(0)).is_err());
    }

    #[test]
    fn test_lookup_kind_mismatch_is_invalid_object() {
        let registry = Registry::new();
        registry.register(context(100)).unwrap();
        let err = registry
            .lookup_kind(ObjectId::from_raw(100), ObjectKind::Kernel)
            .unwrap_err();
        assert_eq!(err.to_status_code(), crate::types::status::INVALID_KERNEL);
    }

    #[test]
    fn test_release_runs_teardown_once() {
        let recorder = Arc::new(Recorder::default());
        let registry = Registry::with_teardown(recorder.clone());
        registry.register(context(100)).unwrap();

        assert!(registry.release(ObjectId::from_raw(100)).is_some());
        assert!(registry.release(ObjectId::from_raw(100)).is_none());
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![(ObjectId::from_raw(100), ObjectKind::Context)]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_released_id_can_be_looked_up_as_missing() {
        let registry = Registry::new();
        registry.register(context(999)).unwrap();
        registry.release(ObjectId::from_raw(999));
        assert!(registry
            .lookup_kind(ObjectId::from_raw(999), ObjectKind::Context)
            .is_err());
    }

    #[test]
    fn test_records_from_peer() {
        let registry = Registry::new();
        let peer = PeerId::new();
        let mut owned = context(1);
        owned.origin = Some(peer);
        registry.register(owned).unwrap();
        registry.register(context(2)).unwrap();

        let mine = registry.records_from(peer);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id.as_u64(), 1);
    }

    #[test]
    fn test_concurrent_registration_spreads_over_shards() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 1..=250u64 {
                        registry.register(context(t * 1000 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 1000);
    }
}
