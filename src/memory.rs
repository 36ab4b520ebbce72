//! In-process auth provider and document store.
//!
//! Used by tests, demos and benchmarks in place of a real backend. Records
//! live in collections keyed by id (so collection snapshots come out ordered
//! by id) and documents are addressed `collection/id`.
//!
//! With [`DeliveryMode::Deferred`] the store queues snapshots instead of
//! delivering them, and [`MemoryStore::flush`] delivers the backlog later.
//! This reproduces snapshots that are still in flight when a listener is
//! cancelled.

use crate::error::{Result, SyncError};
use crate::identity::ProviderConfig;
use crate::remote::{AuthProvider, IdentityCallback, RemoteStore, SnapshotCallback, StoreClient};
use crate::subscription::Registration;
use crate::types::{Identity, RawRecord, RecordData, Snapshot, Target};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};

/// When snapshots reach listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Delivered before the triggering call returns.
    #[default]
    Immediate,
    /// Queued until [`MemoryStore::flush`].
    Deferred,
}

type Delivery = (SnapshotCallback, Result<Snapshot>);

struct Listener {
    target: Target,
    callback: SnapshotCallback,
}

#[derive(Default)]
struct StoreState {
    collections: BTreeMap<String, BTreeMap<String, RecordData>>,
    listeners: BTreeMap<u64, Listener>,
    queue: VecDeque<Delivery>,
    mode: DeliveryMode,
    next_id: u64,
    listens: usize,
    cancels: usize,
}

impl StoreState {
    fn snapshot(&self, target: &Target) -> Result<Snapshot> {
        match target {
            Target::Collection(path) => {
                let records = self
                    .collections
                    .get(path)
                    .map(|docs| {
                        docs.iter()
                            .map(|(id, data)| RawRecord::new(id.clone(), data.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Snapshot::Collection(records))
            }
            Target::Document(path) => {
                let (collection, id) = split_document_path(path)?;
                let record = self
                    .collections
                    .get(collection)
                    .and_then(|docs| docs.get(id))
                    .map(|data| RawRecord::new(id, data.clone()));
                Ok(Snapshot::Document(record))
            }
        }
    }

    /// Snapshots for every listener affected by a write to `collection/id`.
    fn affected(&self, collection: &str, doc_path: &str) -> Vec<Delivery> {
        self.listeners
            .values()
            .filter(|listener| match &listener.target {
                Target::Collection(path) => path == collection,
                Target::Document(path) => path == doc_path,
            })
            .filter_map(|listener| {
                self.snapshot(&listener.target)
                    .ok()
                    .map(|snapshot| (Arc::clone(&listener.callback), Ok(snapshot)))
            })
            .collect()
    }

    /// Queue deliveries in deferred mode; otherwise hand them back for immediate dispatch.
    fn route(&mut self, deliveries: Vec<Delivery>) -> Vec<Delivery> {
        match self.mode {
            DeliveryMode::Immediate => deliveries,
            DeliveryMode::Deferred => {
                self.queue.extend(deliveries);
                Vec::new()
            }
        }
    }
}

fn split_document_path(path: &str) -> Result<(&str, &str)> {
    match path.rsplit_once('/') {
        Some((collection, id)) if !collection.is_empty() && !id.is_empty() => Ok((collection, id)),
        _ => Err(SyncError::InvalidPath(format!(
            "document path must be collection/id: {path}"
        ))),
    }
}

/// Invoke callbacks with no store lock held.
fn dispatch(deliveries: Vec<Delivery>) {
    for (callback, delivery) in deliveries {
        callback(delivery);
    }
}

/// In-memory document store with live queries.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: DeliveryMode) -> Self {
        let store = Self::default();
        store.state.lock().mode = mode;
        store
    }

    pub fn set_mode(&self, mode: DeliveryMode) {
        self.state.lock().mode = mode;
    }

    /// Create or replace the document at `collection/id`.
    pub fn set(&self, doc_path: &str, value: serde_json::Value) -> Result<()> {
        let (collection, id) = split_document_path(doc_path)?;
        let data = match value {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(SyncError::decode(id, format!("expected an object, got {other}")));
            }
        };

        let deliveries = {
            let mut state = self.state.lock();
            state
                .collections
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string(), data);
            let affected = state.affected(collection, doc_path);
            state.route(affected)
        };
        dispatch(deliveries);
        Ok(())
    }

    /// Delete the document at `collection/id`. Returns whether it existed.
    pub fn remove(&self, doc_path: &str) -> Result<bool> {
        let (collection, id) = split_document_path(doc_path)?;

        let (existed, deliveries) = {
            let mut state = self.state.lock();
            let existed = state
                .collections
                .get_mut(collection)
                .and_then(|docs| docs.remove(id))
                .is_some();
            let deliveries = if existed {
                let affected = state.affected(collection, doc_path);
                state.route(affected)
            } else {
                Vec::new()
            };
            (existed, deliveries)
        };
        dispatch(deliveries);
        Ok(existed)
    }

    /// Report a delivery error to every listener watching exactly `path`.
    ///
    /// Errors are terminal, so those listeners are removed.
    pub fn fail(&self, path: &str, message: &str) {
        let deliveries = {
            let mut state = self.state.lock();
            let failed: Vec<u64> = state
                .listeners
                .iter()
                .filter(|(_, listener)| listener.target.path() == path)
                .map(|(id, _)| *id)
                .collect();
            let deliveries: Vec<Delivery> = failed
                .iter()
                .filter_map(|id| state.listeners.remove(id))
                .map(|listener| {
                    let err = SyncError::Delivery {
                        path: path.to_string(),
                        message: message.to_string(),
                    };
                    (listener.callback, Err(err))
                })
                .collect();
            state.route(deliveries)
        };
        dispatch(deliveries);
    }

    /// Deliver queued snapshots. Returns how many were delivered.
    pub fn flush(&self) -> usize {
        let deliveries: Vec<Delivery> = self.state.lock().queue.drain(..).collect();
        let count = deliveries.len();
        dispatch(deliveries);
        count
    }

    /// Number of queued deliveries.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Total listeners ever registered.
    pub fn listen_count(&self) -> usize {
        self.state.lock().listens
    }

    /// Total listener cancellations.
    pub fn cancel_count(&self) -> usize {
        self.state.lock().cancels
    }

    /// Targets currently being watched, in registration order.
    pub fn watched(&self) -> Vec<Target> {
        self.state
            .lock()
            .listeners
            .values()
            .map(|listener| listener.target.clone())
            .collect()
    }
}

impl RemoteStore for MemoryStore {
    fn listen(&self, target: &Target, callback: SnapshotCallback) -> Result<Box<dyn Registration>> {
        let (id, deliveries) = {
            let mut state = self.state.lock();
            let initial = state.snapshot(target)?;
            let id = state.next_id;
            state.next_id += 1;
            state.listens += 1;
            state.listeners.insert(
                id,
                Listener {
                    target: target.clone(),
                    callback: Arc::clone(&callback),
                },
            );
            let deliveries = state.route(vec![(callback, Ok(initial))]);
            (id, deliveries)
        };
        dispatch(deliveries);

        Ok(Box::new(StoreRegistration {
            id,
            state: Arc::downgrade(&self.state),
        }))
    }
}

struct StoreRegistration {
    id: u64,
    state: Weak<Mutex<StoreState>>,
}

impl Registration for StoreRegistration {
    fn cancel(self: Box<Self>) {
        if let Some(state) = self.state.upgrade() {
            let mut state = state.lock();
            state.listeners.remove(&self.id);
            state.cancels += 1;
        }
    }
}

#[derive(Default)]
struct AuthState {
    current: Option<Identity>,
    listeners: BTreeMap<u64, IdentityCallback>,
    next_id: u64,
}

/// In-memory auth provider backed by a [`MemoryStore`].
#[derive(Clone, Default)]
pub struct MemoryAuth {
    store: MemoryStore,
    state: Arc<Mutex<AuthState>>,
    init_failure: Option<String>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: MemoryStore) -> Self {
        Self {
            store,
            ..Default::default()
        }
    }

    /// A provider whose initialization always fails.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            init_failure: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn sign_in(&self, id: impl Into<String>) {
        self.notify(Some(Identity::new(id)));
    }

    pub fn sign_out(&self) {
        self.notify(None);
    }

    pub fn current(&self) -> Option<Identity> {
        self.state.lock().current.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    fn notify(&self, identity: Option<Identity>) {
        let callbacks: Vec<IdentityCallback> = {
            let mut state = self.state.lock();
            state.current = identity.clone();
            state.listeners.values().cloned().collect()
        };
        for callback in callbacks {
            callback(identity.clone());
        }
    }
}

impl AuthProvider for MemoryAuth {
    fn initialize(&self, config: &ProviderConfig) -> Result<StoreClient> {
        if let Some(message) = &self.init_failure {
            return Err(SyncError::ProviderInit(message.clone()));
        }
        tracing::debug!(app = %config.app_name, "memory auth initialized");
        Ok(StoreClient::new(Arc::new(self.store.clone())))
    }

    fn on_identity_change(
        &self,
        _client: &StoreClient,
        callback: IdentityCallback,
    ) -> Result<Box<dyn Registration>> {
        let (id, current) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.insert(id, Arc::clone(&callback));
            (id, state.current.clone())
        };
        // Listeners learn the current identity on registration.
        callback(current);

        Ok(Box::new(AuthRegistration {
            id,
            state: Arc::downgrade(&self.state),
        }))
    }
}

struct AuthRegistration {
    id: u64,
    state: Weak<Mutex<AuthState>>,
}

impl Registration for AuthRegistration {
    fn cancel(self: Box<Self>) {
        if let Some(state) = self.state.upgrade() {
            state.lock().listeners.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recording() -> (SnapshotCallback, Arc<Mutex<Vec<Result<Snapshot>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: SnapshotCallback = Arc::new(move |delivery: Result<Snapshot>| sink.lock().push(delivery));
        (callback, seen)
    }

    #[test]
    fn test_collection_ordered_by_id() {
        let store = MemoryStore::new();
        store.set("items/b", json!({"v": 2})).unwrap();
        store.set("items/a", json!({"v": 1})).unwrap();

        let (callback, seen) = recording();
        let _reg = store
            .listen(&Target::Collection("items".into()), callback)
            .unwrap();

        let seen = seen.lock();
        let Ok(Snapshot::Collection(records)) = &seen[0] else {
            panic!("expected collection snapshot, got {:?}", seen[0]);
        };
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_document_listener_sees_only_its_document() {
        let store = MemoryStore::new();
        let (callback, seen) = recording();
        let _reg = store
            .listen(&Target::Document("users/u1".into()), callback)
            .unwrap();

        store.set("users/u2", json!({"name": "other"})).unwrap();
        store.set("users/u1", json!({"name": "me"})).unwrap();
        store.remove("users/u1").unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], Ok(Snapshot::Document(None)));
        assert!(matches!(&seen[1], Ok(Snapshot::Document(Some(r))) if r.data["name"] == "me"));
        assert_eq!(seen[2], Ok(Snapshot::Document(None)));
    }

    #[test]
    fn test_deferred_mode_queues_until_flush() {
        let store = MemoryStore::with_mode(DeliveryMode::Deferred);
        let (callback, seen) = recording();
        let _reg = store
            .listen(&Target::Collection("items".into()), callback)
            .unwrap();
        store.set("items/a", json!({})).unwrap();

        assert_eq!(seen.lock().len(), 0);
        assert_eq!(store.pending(), 2);
        assert_eq!(store.flush(), 2);
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_cancel_and_fail() {
        let store = MemoryStore::new();
        let (callback, seen) = recording();
        let reg = store
            .listen(&Target::Collection("items".into()), callback)
            .unwrap();
        assert_eq!(store.listener_count(), 1);

        store.fail("items", "permission denied");
        assert_eq!(store.listener_count(), 0);
        assert!(matches!(seen.lock().last(), Some(Err(SyncError::Delivery { .. }))));

        reg.cancel();
        assert_eq!(store.cancel_count(), 1);
    }

    #[test]
    fn test_invalid_paths() {
        let store = MemoryStore::new();
        assert!(matches!(store.set("items", json!({})), Err(SyncError::InvalidPath(_))));
        let (callback, _) = recording();
        assert!(store
            .listen(&Target::Document("/x".into()), callback)
            .is_err());
        assert!(store.set("items/a", json!(3)).is_err());
    }

    #[test]
    fn test_auth_notifies_current_on_registration() {
        let auth = MemoryAuth::new();
        auth.sign_in("alice");
        let client = auth.initialize(&ProviderConfig::default()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reg = auth
            .on_identity_change(
                &client,
                Arc::new(move |identity: Option<Identity>| sink.lock().push(identity)),
            )
            .unwrap();
        auth.sign_out();
        reg.cancel();
        auth.sign_in("bob");

        assert_eq!(*seen.lock(), vec![Some(Identity::new("alice")), None]);
        assert_eq!(auth.listener_count(), 0);
    }
}
