//! Subscription lifecycle management.
//!
//! A [`LiveQuery`] keeps at most one live subscription, derived from the
//! current store client and (optionally) identity. Whenever those inputs
//! change it releases the old subscription before opening a new one, so a
//! snapshot from a superseded subscription can never reach the owner.
//!
//! Inputs are compared by identity (`Arc::ptr_eq`), not by contents: a
//! re-published identity with the same id still counts as a transition.
//!
//! # Example
//!
//! ```ignore
//! let orders = LiveQuery::attach(
//!     provider.channel(),
//!     |client, identity| client.collection(format!("users/{}/orders", identity.map(|i| i.id.as_str()).unwrap_or_default())),
//!     IdentityRequirement::Required,
//!     |event| match event {
//!         LiveEvent::Snapshot(snapshot) => println!("{} records", snapshot.len()),
//!         LiveEvent::Failed(err) => eprintln!("{err}"),
//!         LiveEvent::Detached(reason) => println!("detached: {reason:?}"),
//!     },
//! );
//! ```

use crate::broadcast::{Channel, ObserverId};
use crate::error::SyncError;
use crate::identity::IdentityContext;
use crate::remote::{Reference, StoreClient};
use crate::subscription::Subscription;
use crate::types::{Identity, Snapshot, SubscriptionId};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Derives what to watch from the client and current identity.
///
/// Must not open a subscription itself.
pub type ReferenceFactory = Arc<dyn Fn(&StoreClient, Option<&Identity>) -> Reference + Send + Sync>;

/// Receives everything a live query delivers to its owner.
pub type EventHandler = Arc<dyn Fn(LiveEvent) + Send + Sync>;

/// Whether subscribing depends on an authenticated identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityRequirement {
    /// Identity-scoped: no subscription while signed out, resubscribe on identity change.
    Required,
    /// Public: subscribe as soon as a client exists, whatever the identity.
    Ignored,
}

impl IdentityRequirement {
    pub fn from_flag(requires_identity: bool) -> Self {
        if requires_identity {
            IdentityRequirement::Required
        } else {
            IdentityRequirement::Ignored
        }
    }

    pub fn is_required(self) -> bool {
        self == IdentityRequirement::Required
    }
}

/// Events delivered to the owner of a live query.
#[derive(Clone, Debug, PartialEq)]
pub enum LiveEvent {
    /// A snapshot from the current subscription.
    Snapshot(Snapshot),
    /// The subscription failed and has been released. It is not reopened
    /// until the inputs change again.
    Failed(SyncError),
    /// The subscription was released without a replacement being implied.
    Detached(DetachReason),
}

/// Why a live query let go of its subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetachReason {
    /// A required identity went away (sign-out).
    IdentityLost,
    /// The store client went away.
    ClientLost,
    /// Inputs changed; a fresh subscription follows if preconditions hold.
    InputsChanged,
    /// The owner tore the live query down.
    Released,
}

/// The inputs a live query reacts to.
#[derive(Clone, Default)]
struct Inputs {
    client: Option<StoreClient>,
    identity: Option<Arc<Identity>>,
}

impl Inputs {
    /// Only the inputs the requirement makes relevant.
    fn relevant(context: &IdentityContext, requirement: IdentityRequirement) -> Self {
        Self {
            client: context.client.clone(),
            identity: if requirement.is_required() {
                context.identity.clone()
            } else {
                None
            },
        }
    }

    fn same_as(&self, other: &Inputs) -> bool {
        let same_client = match (&self.client, &other.client) {
            (Some(a), Some(b)) => a.same_as(b),
            (None, None) => true,
            _ => false,
        };
        let same_identity = match (&self.identity, &other.identity) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_client && same_identity
    }
}

#[derive(Default)]
struct LiveState {
    /// Inputs of the last reconcile; `None` before the first one.
    inputs: Option<Inputs>,
    active: Option<Subscription>,
    opened: usize,
    closed: bool,
}

struct Core {
    factory: ReferenceFactory,
    requirement: IdentityRequirement,
    handler: EventHandler,
    state: Mutex<LiveState>,
}

impl Core {
    fn reconcile(&self, context: &IdentityContext) -> bool {
        let next = Inputs::relevant(context, self.requirement);
        let mut state = self.state.lock();

        if state.closed {
            return false;
        }
        if let Some(previous) = &state.inputs {
            if previous.same_as(&next) {
                return false;
            }
        }

        let previous = state.inputs.replace(next.clone()).unwrap_or_default();
        let had_active = state.active.as_ref().is_some_and(Subscription::is_live);

        // Release strictly before anything new is opened.
        if let Some(active) = state.active.take() {
            active.release();
        }

        let reason = if self.requirement.is_required()
            && previous.identity.is_some()
            && next.identity.is_none()
        {
            Some(DetachReason::IdentityLost)
        } else if previous.client.is_some() && next.client.is_none() {
            Some(DetachReason::ClientLost)
        } else if had_active {
            Some(DetachReason::InputsChanged)
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::debug!(?reason, "live query detached");
            (self.handler)(LiveEvent::Detached(reason));
        }

        let Some(client) = next.client.as_ref() else {
            return false;
        };
        if self.requirement.is_required() && next.identity.is_none() {
            return false;
        }

        let reference = (self.factory)(client, next.identity.as_deref());
        let handler = Arc::clone(&self.handler);
        match reference.on_snapshot(move |delivery| match delivery {
            Ok(snapshot) => handler(LiveEvent::Snapshot(snapshot)),
            Err(err) => handler(LiveEvent::Failed(err)),
        }) {
            Ok(subscription) => {
                tracing::debug!(
                    subscription = %subscription.id(),
                    reference = ?reference.target(),
                    identity = ?next.identity,
                    "live query subscribed"
                );
                state.active = Some(subscription);
                state.opened += 1;
                true
            }
            Err(err) => {
                tracing::error!(reference = ?reference.target(), error = %err, "live query could not subscribe");
                (self.handler)(LiveEvent::Failed(err));
                false
            }
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(active) = state.active.take() {
            let was_live = active.is_live();
            active.release();
            if was_live {
                (self.handler)(LiveEvent::Detached(DetachReason::Released));
            }
        }
    }
}

/// Manages exactly one live subscription at a time.
///
/// Snapshot handlers run synchronously on the delivering thread and must not
/// call back into the same `LiveQuery`.
pub struct LiveQuery {
    core: Arc<Core>,
    observer: Option<(Weak<Channel<IdentityContext>>, ObserverId)>,
}

impl LiveQuery {
    /// Create a live query driven by explicit [`LiveQuery::reconcile`] calls.
    pub fn new<F, H>(factory: F, requirement: IdentityRequirement, handler: H) -> Self
    where
        F: Fn(&StoreClient, Option<&Identity>) -> Reference + Send + Sync + 'static,
        H: Fn(LiveEvent) + Send + Sync + 'static,
    {
        Self::from_parts(Arc::new(factory), requirement, Arc::new(handler))
    }

    pub(crate) fn from_parts(
        factory: ReferenceFactory,
        requirement: IdentityRequirement,
        handler: EventHandler,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                factory,
                requirement,
                handler,
                state: Mutex::new(LiveState::default()),
            }),
            observer: None,
        }
    }

    /// Create a live query that follows an identity channel.
    ///
    /// Reconciles against the current context right away and again on every
    /// publish.
    pub fn attach<F, H>(
        identity: &Arc<Channel<IdentityContext>>,
        factory: F,
        requirement: IdentityRequirement,
        handler: H,
    ) -> Self
    where
        F: Fn(&StoreClient, Option<&Identity>) -> Reference + Send + Sync + 'static,
        H: Fn(LiveEvent) + Send + Sync + 'static,
    {
        Self::new(factory, requirement, handler).follow(identity)
    }

    pub(crate) fn follow(mut self, identity: &Arc<Channel<IdentityContext>>) -> Self {
        let weak = Arc::downgrade(&self.core);
        let id = identity.observe(move |context: &Arc<IdentityContext>| {
            if let Some(core) = weak.upgrade() {
                core.reconcile(context);
            }
        });
        self.observer = Some((Arc::downgrade(identity), id));
        self.core.reconcile(&identity.current());
        self
    }

    /// Bring the subscription in line with `context`.
    ///
    /// Does nothing when the relevant inputs are unchanged. Returns whether a
    /// new subscription was opened.
    pub fn reconcile(&self, context: &IdentityContext) -> bool {
        self.core.reconcile(context)
    }

    /// Whether a live subscription is currently held.
    pub fn is_subscribed(&self) -> bool {
        self.core
            .state
            .lock()
            .active
            .as_ref()
            .is_some_and(Subscription::is_live)
    }

    /// Identifier of the live subscription, if any.
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.core
            .state
            .lock()
            .active
            .as_ref()
            .filter(|subscription| subscription.is_live())
            .map(Subscription::id)
    }

    /// How many subscriptions this live query has opened so far.
    pub fn opened_count(&self) -> usize {
        self.core.state.lock().opened
    }

    pub fn requirement(&self) -> IdentityRequirement {
        self.core.requirement
    }

    /// Tear down: release the subscription and stop following the identity.
    pub fn release(&mut self) {
        if let Some((channel, id)) = self.observer.take() {
            if let Some(channel) = channel.upgrade() {
                channel.unobserve(id);
            }
        }
        self.core.release();
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.release();
    }
}
