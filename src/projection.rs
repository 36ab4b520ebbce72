//! Typed projection stores.
//!
//! A [`ProjectionStore`] wraps a [`LiveQuery`] and turns each raw snapshot
//! into a typed value: records are decoded, optionally given their
//! identifier, optionally reordered, and the result is published wholesale
//! on a broadcast channel. Readers therefore only ever see complete views.
//!
//! The store is the scope of the value: readers are obtained from it, and
//! dropping it releases the subscription and closes the channel.
//!
//! Decode failures follow [`DecodeFailurePolicy`]. The default rejects the
//! whole snapshot, leaving the previously published value in place.

use crate::broadcast::{Channel, ChannelConfig, Reader};
use crate::error::{Result, SyncError};
use crate::identity::{IdentityContext, IdentityProvider};
use crate::live::{DetachReason, EventHandler, IdentityRequirement, LiveEvent, LiveQuery, ReferenceFactory};
use crate::remote::{Reference, StoreClient};
use crate::types::{Identity, RawRecord, RecordData, Snapshot, SubscriptionId};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::sync::Arc;

/// Turns a record payload into the exposed type.
pub type Decoder<T> = Arc<dyn Fn(RecordData) -> Result<T> + Send + Sync>;

/// Reorders a full decoded collection.
pub type Reorder<T> = Arc<dyn Fn(Vec<T>) -> Vec<T> + Send + Sync>;

type Materializer<V> = Box<dyn Fn(Snapshot) -> Result<V> + Send + Sync>;

/// What to do when one record of a snapshot fails to decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DecodeFailurePolicy {
    /// Discard the whole snapshot and keep the previous value.
    #[default]
    RejectSnapshot,
    /// Drop only the failing record.
    SkipRecord,
}

/// Lifecycle of a projection store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectionState {
    /// Exposing the default value, never subscribed.
    Uninitialized,
    /// Subscribed, waiting for the first snapshot of this subscription.
    Subscribed,
    /// At least one snapshot has been published.
    Updated,
    /// No live subscription (signed out, failed, or torn down).
    Unsubscribed,
}

/// Decode a payload with serde.
pub fn serde_decoder<T: DeserializeOwned>() -> Decoder<T> {
    Arc::new(|data: RecordData| {
        serde_json::from_value::<T>(serde_json::Value::Object(data))
            .map_err(|e| SyncError::decode("", e))
    })
}

/// Attach the record id to a decode error.
fn for_record(err: SyncError, id: &str) -> SyncError {
    match err {
        SyncError::Decode { message, .. } => SyncError::decode(id, message),
        other => SyncError::decode(id, other),
    }
}

struct Shared<V> {
    channel: Arc<Channel<V>>,
    default_value: V,
    requirement: IdentityRequirement,
    materialize: Materializer<V>,
    state: Mutex<ProjectionState>,
    last_error: Mutex<Option<SyncError>>,
}

impl<V: Clone + Send + Sync + 'static> Shared<V> {
    fn handle(&self, event: LiveEvent) {
        match event {
            LiveEvent::Snapshot(snapshot) => match (self.materialize)(snapshot) {
                Ok(value) => {
                    if let Err(err) = self.channel.publish(value) {
                        tracing::debug!(error = %err, "snapshot after store closed");
                        return;
                    }
                    *self.state.lock() = ProjectionState::Updated;
                    *self.last_error.lock() = None;
                }
                Err(err) => {
                    tracing::error!(error = %err, "rejecting snapshot");
                    *self.last_error.lock() = Some(err);
                }
            },
            LiveEvent::Failed(err) => {
                *self.state.lock() = ProjectionState::Unsubscribed;
                *self.last_error.lock() = Some(err);
            }
            LiveEvent::Detached(reason) => {
                *self.state.lock() = ProjectionState::Unsubscribed;
                if reason == DetachReason::IdentityLost && self.requirement.is_required() {
                    if let Err(err) = self.channel.publish(self.default_value.clone()) {
                        tracing::debug!(error = %err, "reset after store closed");
                    }
                }
            }
        }
    }
}

/// Exposes the latest projected value of a live query.
pub struct ProjectionStore<V: Clone + Send + Sync + 'static> {
    live: LiveQuery,
    shared: Arc<Shared<V>>,
}

impl<V: Clone + Send + Sync + 'static> ProjectionStore<V> {
    fn mount(
        factory: ReferenceFactory,
        requirement: IdentityRequirement,
        default_value: V,
        channel_config: ChannelConfig,
        materialize: Materializer<V>,
        identity: &Arc<Channel<IdentityContext>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            channel: Channel::with_config(default_value.clone(), channel_config),
            default_value,
            requirement,
            materialize,
            state: Mutex::new(ProjectionState::Uninitialized),
            last_error: Mutex::new(None),
        });

        let sink = Arc::clone(&shared);
        let handler: EventHandler = Arc::new(move |event: LiveEvent| sink.handle(event));
        let live = LiveQuery::from_parts(factory, requirement, handler).follow(identity);

        Self { live, shared }
    }

    /// The latest published value.
    pub fn value(&self) -> Arc<V> {
        self.shared.channel.current()
    }

    /// A read-only view for one consumer.
    pub fn reader(&self) -> Reader<V> {
        self.shared.channel.reader()
    }

    /// The value exposed before any snapshot arrives.
    pub fn default_value(&self) -> &V {
        &self.shared.default_value
    }

    pub fn state(&self) -> ProjectionState {
        let state = *self.shared.state.lock();
        match state {
            ProjectionState::Uninitialized | ProjectionState::Unsubscribed
                if self.live.is_subscribed() =>
            {
                ProjectionState::Subscribed
            }
            other => other,
        }
    }

    /// The most recent decode or delivery error, cleared by the next good snapshot.
    pub fn last_error(&self) -> Option<SyncError> {
        self.shared.last_error.lock().clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.live.is_subscribed()
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.live.subscription_id()
    }

    /// Number of values published so far, resets included.
    pub fn version(&self) -> u64 {
        self.shared.channel.version()
    }
}

impl<T: Clone + Send + Sync + 'static> ProjectionStore<Vec<T>> {
    /// Project a collection, decoding records with serde.
    pub fn collection<F>(factory: F) -> CollectionBuilder<T>
    where
        T: DeserializeOwned,
        F: Fn(&StoreClient, Option<&Identity>) -> Reference + Send + Sync + 'static,
    {
        CollectionBuilder::new(Arc::new(factory), serde_decoder())
    }

    /// Project a collection with a custom decoder.
    pub fn collection_decoded<F, D>(factory: F, decode: D) -> CollectionBuilder<T>
    where
        F: Fn(&StoreClient, Option<&Identity>) -> Reference + Send + Sync + 'static,
        D: Fn(RecordData) -> Result<T> + Send + Sync + 'static,
    {
        CollectionBuilder::new(Arc::new(factory), Arc::new(decode))
    }
}

impl<T: Clone + Send + Sync + 'static> ProjectionStore<T> {
    /// Project a single document, decoding it with serde.
    pub fn document<F>(factory: F, default_value: T) -> DocumentBuilder<T>
    where
        T: DeserializeOwned,
        F: Fn(&StoreClient, Option<&Identity>) -> Reference + Send + Sync + 'static,
    {
        DocumentBuilder::new(Arc::new(factory), default_value, serde_decoder())
    }

    /// Project a single document with a custom decoder.
    pub fn document_decoded<F, D>(factory: F, default_value: T, decode: D) -> DocumentBuilder<T>
    where
        F: Fn(&StoreClient, Option<&Identity>) -> Reference + Send + Sync + 'static,
        D: Fn(RecordData) -> Result<T> + Send + Sync + 'static,
    {
        DocumentBuilder::new(Arc::new(factory), default_value, Arc::new(decode))
    }
}

impl<V: Clone + Send + Sync + 'static> Drop for ProjectionStore<V> {
    fn drop(&mut self) {
        self.live.release();
        self.shared.channel.close();
    }
}

/// Builder for collection projections.
pub struct CollectionBuilder<T> {
    factory: ReferenceFactory,
    decode: Decoder<T>,
    default_value: Vec<T>,
    requirement: IdentityRequirement,
    include_ids: bool,
    reorder: Option<Reorder<T>>,
    policy: DecodeFailurePolicy,
    channel: ChannelConfig,
}

impl<T: Clone + Send + Sync + 'static> CollectionBuilder<T> {
    fn new(factory: ReferenceFactory, decode: Decoder<T>) -> Self {
        Self {
            factory,
            decode,
            default_value: Vec::new(),
            requirement: IdentityRequirement::Required,
            include_ids: false,
            reorder: None,
            policy: DecodeFailurePolicy::default(),
            channel: ChannelConfig::default(),
        }
    }

    pub fn default_value(mut self, value: Vec<T>) -> Self {
        self.default_value = value;
        self
    }

    pub fn requires_identity(mut self, required: bool) -> Self {
        self.requirement = IdentityRequirement::from_flag(required);
        self
    }

    /// Expose each record's identifier under [`crate::types::ID_FIELD`].
    pub fn include_ids(mut self, include: bool) -> Self {
        self.include_ids = include;
        self
    }

    pub fn decode<D>(mut self, decode: D) -> Self
    where
        D: Fn(RecordData) -> Result<T> + Send + Sync + 'static,
    {
        self.decode = Arc::new(decode);
        self
    }

    /// Apply `reorder` to the whole decoded collection after every update.
    pub fn reorder<R>(mut self, reorder: R) -> Self
    where
        R: Fn(Vec<T>) -> Vec<T> + Send + Sync + 'static,
    {
        self.reorder = Some(Arc::new(reorder));
        self
    }

    /// Sort the decoded collection with a comparator (stable).
    pub fn sort_by<C>(self, compare: C) -> Self
    where
        C: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        self.reorder(move |mut values: Vec<T>| {
            values.sort_by(&compare);
            values
        })
    }

    pub fn decode_failure_policy(mut self, policy: DecodeFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel = config;
        self
    }

    /// Start projecting, following `provider`'s identity.
    pub fn mount(self, provider: &IdentityProvider) -> ProjectionStore<Vec<T>> {
        self.mount_channel(provider.channel())
    }

    pub fn mount_channel(self, identity: &Arc<Channel<IdentityContext>>) -> ProjectionStore<Vec<T>> {
        let decode = self.decode;
        let reorder = self.reorder;
        let include_ids = self.include_ids;
        let policy = self.policy;

        let materialize: Materializer<Vec<T>> = Box::new(move |snapshot: Snapshot| {
            let records = match snapshot {
                Snapshot::Collection(records) => records,
                other => {
                    return Err(SyncError::ShapeMismatch {
                        expected: "collection",
                        got: other.kind(),
                    })
                }
            };
            let values = decode_all(records, include_ids, &decode, policy)?;
            Ok(match &reorder {
                Some(reorder) => reorder(values),
                None => values,
            })
        });

        ProjectionStore::mount(
            self.factory,
            self.requirement,
            self.default_value,
            self.channel,
            materialize,
            identity,
        )
    }
}

fn decode_all<T>(
    records: Vec<RawRecord>,
    include_ids: bool,
    decode: &Decoder<T>,
    policy: DecodeFailurePolicy,
) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(records.len());
    for record in records {
        let data = if include_ids {
            record.data_with_id()
        } else {
            record.data
        };
        match decode(data) {
            Ok(value) => values.push(value),
            Err(err) => {
                let err = for_record(err, &record.id);
                match policy {
                    DecodeFailurePolicy::RejectSnapshot => return Err(err),
                    DecodeFailurePolicy::SkipRecord => {
                        tracing::warn!(record = %record.id, error = %err, "skipping undecodable record");
                    }
                }
            }
        }
    }
    Ok(values)
}

/// Builder for document projections.
pub struct DocumentBuilder<T> {
    factory: ReferenceFactory,
    decode: Decoder<T>,
    default_value: T,
    requirement: IdentityRequirement,
    channel: ChannelConfig,
}

impl<T: Clone + Send + Sync + 'static> DocumentBuilder<T> {
    fn new(factory: ReferenceFactory, default_value: T, decode: Decoder<T>) -> Self {
        Self {
            factory,
            decode,
            default_value,
            requirement: IdentityRequirement::Required,
            channel: ChannelConfig::default(),
        }
    }

    pub fn requires_identity(mut self, required: bool) -> Self {
        self.requirement = IdentityRequirement::from_flag(required);
        self
    }

    pub fn decode<D>(mut self, decode: D) -> Self
    where
        D: Fn(RecordData) -> Result<T> + Send + Sync + 'static,
    {
        self.decode = Arc::new(decode);
        self
    }

    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel = config;
        self
    }

    pub fn mount(self, provider: &IdentityProvider) -> ProjectionStore<T> {
        self.mount_channel(provider.channel())
    }

    pub fn mount_channel(self, identity: &Arc<Channel<IdentityContext>>) -> ProjectionStore<T> {
        let decode = self.decode;
        let absent = self.default_value.clone();

        let materialize: Materializer<T> = Box::new(move |snapshot: Snapshot| match snapshot {
            Snapshot::Document(Some(record)) => {
                let RawRecord { id, data } = record;
                decode(data).map_err(|err| for_record(err, &id))
            }
            Snapshot::Document(None) => Ok(absent.clone()),
            other => Err(SyncError::ShapeMismatch {
                expected: "document",
                got: other.kind(),
            }),
        });

        ProjectionStore::mount(
            self.factory,
            self.requirement,
            self.default_value,
            self.channel,
            materialize,
            identity,
        )
    }
}
