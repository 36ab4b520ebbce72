//! # Authenticated live-query sync
//!
//! Keeps in-process state synchronized with a remote document store, scoped
//! by the current authentication identity.
//!
//! ## Core Concepts
//!
//! - **Identity context**: the current identity and store client, published
//!   by [`IdentityProvider`] on every auth change
//! - **Live queries**: [`LiveQuery`] holds at most one live subscription and
//!   re-derives it whenever the identity or client changes
//! - **Projections**: [`ProjectionStore`] decodes, tags and orders snapshots
//!   and broadcasts the latest value to any number of readers
//!
//! ## Example
//!
//! ```ignore
//! use authsync::{IdentityProvider, MemoryAuth, ProjectionStore, ProviderConfig};
//!
//! let auth = MemoryAuth::new();
//! let provider = IdentityProvider::start(&auth, &ProviderConfig::default());
//!
//! let orders = ProjectionStore::<Vec<serde_json::Value>>::collection(|client, identity| {
//!     client.collection(format!("users/{}/orders", identity.map(|i| i.id.as_str()).unwrap_or("")))
//! })
//! .include_ids(true)
//! .mount(&provider);
//!
//! auth.sign_in("alice");
//! let reader = orders.reader();
//! println!("{:?}", reader.current());
//! ```

pub mod broadcast;
pub mod error;
pub mod identity;
pub mod live;
pub mod memory;
pub mod projection;
pub mod remote;
pub mod subscription;
pub mod types;

// Re-exports
pub use broadcast::{Channel, ChannelConfig, ChannelEvent, DropReason, ObserverId, Reader};
pub use error::{Result, SyncError};
pub use identity::{IdentityContext, IdentityProvider, ProviderConfig};
pub use live::{DetachReason, IdentityRequirement, LiveEvent, LiveQuery, ReferenceFactory};
pub use memory::{DeliveryMode, MemoryAuth, MemoryStore};
pub use projection::{
    serde_decoder, CollectionBuilder, DecodeFailurePolicy, Decoder, DocumentBuilder,
    ProjectionState, ProjectionStore, Reorder,
};
pub use remote::{AuthProvider, IdentityCallback, Reference, RemoteStore, SnapshotCallback, StoreClient};
pub use subscription::{DeliveryGuard, Registration, Subscription};
pub use types::*;
