//! Boundary with the external collaborators: the auth provider and the
//! remote document store.
//!
//! Only the interface lives here. Transports, query languages and sign-in
//! flows belong to the implementations (see [`crate::memory`] for the
//! in-process one).

use crate::error::{Result, SyncError};
use crate::identity::ProviderConfig;
use crate::subscription::{Registration, Subscription};
use crate::types::{Identity, Snapshot, SubscriptionId, Target};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback receiving snapshots (or a terminal delivery error) from the store.
pub type SnapshotCallback = Arc<dyn Fn(Result<Snapshot>) + Send + Sync>;

/// Callback receiving identity changes from the auth provider.
pub type IdentityCallback = Arc<dyn Fn(Option<Identity>) + Send + Sync>;

/// A remote store able to run live queries.
pub trait RemoteStore: Send + Sync {
    /// Register a live query. Snapshots are pushed to `callback` in emission
    /// order until the returned registration is cancelled.
    fn listen(&self, target: &Target, callback: SnapshotCallback) -> Result<Box<dyn Registration>>;
}

/// An authentication provider.
pub trait AuthProvider {
    /// Connect to the provider and obtain the store client.
    fn initialize(&self, config: &ProviderConfig) -> Result<StoreClient>;

    /// Register an identity listener. `None` means signed out.
    fn on_identity_change(
        &self,
        client: &StoreClient,
        callback: IdentityCallback,
    ) -> Result<Box<dyn Registration>>;
}

/// Shared handle to the remote store connection.
///
/// Clones refer to the same connection; [`StoreClient::same_as`] compares
/// by identity, never by contents.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn RemoteStore>,
    next_id: Arc<AtomicU64>,
}

impl StoreClient {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Reference to every record of a collection.
    pub fn collection(&self, path: impl Into<String>) -> Reference {
        Reference {
            client: self.clone(),
            target: Target::Collection(path.into()),
        }
    }

    /// Reference to one document, addressed `collection/id`.
    pub fn document(&self, path: impl Into<String>) -> Reference {
        Reference {
            client: self.clone(),
            target: Target::Document(path.into()),
        }
    }

    /// Whether both handles refer to the same connection.
    pub fn same_as(&self, other: &StoreClient) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.store) as *const (),
            Arc::as_ptr(&other.store) as *const (),
        )
    }

    fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreClient({:p})", Arc::as_ptr(&self.store) as *const ())
    }
}

/// Description of what to watch. Deriving one never opens a subscription.
#[derive(Clone, Debug)]
pub struct Reference {
    client: StoreClient,
    target: Target,
}

impl Reference {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    /// Open a live subscription.
    ///
    /// `callback` only ever sees deliveries for a live subscription. A
    /// delivery error releases the subscription before it is forwarded, and
    /// nothing is delivered after that. Releasing the returned handle waits
    /// for a delivery already running on another thread.
    pub fn on_snapshot<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(Result<Snapshot>) + Send + Sync + 'static,
    {
        let id = self.client.next_subscription_id();
        let subscription = Subscription::pending(id, format!("{:?}", self.target));
        let guard = subscription.guard();
        let path = self.target.path().to_string();

        let filtered: SnapshotCallback = Arc::new(move |delivery: Result<Snapshot>| {
            let delivered = guard.deliver(|| match delivery {
                Ok(snapshot) => callback(Ok(snapshot)),
                Err(err) => {
                    if guard.terminate() {
                        tracing::error!(subscription = %guard.id(), path = %path, error = %err, "subscription failed");
                        callback(Err(err));
                    }
                }
            });
            if !delivered {
                tracing::warn!(subscription = %guard.id(), path = %path, "dropping delivery for released subscription");
            }
        });

        let registration = self
            .client
            .store
            .listen(&self.target, filtered)
            .map_err(|e| match e {
                SyncError::ListenFailed(msg) => SyncError::ListenFailed(msg),
                other => SyncError::ListenFailed(other.to_string()),
            })?;
        subscription.attach(registration);

        tracing::debug!(subscription = %id, reference = ?self.target, "opened subscription");
        Ok(subscription)
    }
}
