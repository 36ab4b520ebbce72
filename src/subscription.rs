//! Subscription handles for live registrations.
//!
//! A [`Subscription`] owns exactly one registration with an external
//! collaborator (a store listener or an identity listener). Its single
//! operation, [`Subscription::release`], is idempotent. Deliveries are
//! filtered through a [`DeliveryGuard`] so callbacks that race a release are
//! dropped instead of reaching the owner. A release that races a running
//! delivery waits for it to finish, so once `release()` returns the owner
//! sees nothing more from that subscription, whichever thread delivers.

use crate::types::SubscriptionId;
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A registration held by an external collaborator.
///
/// Cancelling must stop future callback invocations for this registration.
pub trait Registration: Send {
    fn cancel(self: Box<Self>);
}

struct Inner {
    id: SubscriptionId,
    label: String,
    live: AtomicBool,
    /// Held for the whole of a delivery. Reentrant so a delivery may end its own subscription.
    delivery: ReentrantMutex<()>,
    registration: Mutex<Option<Box<dyn Registration>>>,
}

impl Inner {
    /// Returns true if this call performed the release.
    fn release(&self) -> bool {
        let was_live = {
            let _delivering = self.delivery.lock();
            self.live.swap(false, Ordering::SeqCst)
        };
        // Take outside the cancel call so a collaborator that re-enters us cannot deadlock.
        let registration = self.registration.lock().take();
        if let Some(registration) = registration {
            registration.cancel();
        }
        if was_live {
            tracing::debug!(subscription = %self.id, watching = %self.label, "released subscription");
        }
        was_live
    }
}

/// Handle to one active registration.
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    /// Create a live handle whose registration is attached later.
    ///
    /// The guard is handed to the collaborator before the registration exists,
    /// so deliveries made while registering are already accepted.
    pub(crate) fn pending(id: SubscriptionId, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                label: label.into(),
                live: AtomicBool::new(true),
                delivery: ReentrantMutex::new(()),
                registration: Mutex::new(None),
            }),
        }
    }

    /// Attach the collaborator's registration.
    ///
    /// If the subscription was terminated while registering, the registration
    /// is cancelled immediately.
    pub(crate) fn attach(&self, registration: Box<dyn Registration>) {
        let mut slot = self.inner.registration.lock();
        if self.inner.live.load(Ordering::SeqCst) {
            *slot = Some(registration);
        } else {
            drop(slot);
            registration.cancel();
        }
    }

    pub(crate) fn guard(&self) -> DeliveryGuard {
        DeliveryGuard {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    /// Whether the subscription has not been released.
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Release the registration. Safe to call any number of times.
    pub fn release(&self) {
        self.inner.release();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("target", &self.inner.label)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Delivery-side view of a subscription.
///
/// Held by callbacks; never keeps the subscription alive.
#[derive(Clone)]
pub struct DeliveryGuard {
    id: SubscriptionId,
    inner: Weak<Inner>,
}

impl DeliveryGuard {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Whether deliveries for this subscription should still be accepted.
    pub fn is_live(&self) -> bool {
        self.inner
            .upgrade()
            .map(|inner| inner.live.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Run `deliver` if the subscription is still live. Returns whether it ran.
    ///
    /// A concurrent release blocks until `deliver` returns.
    pub fn deliver<F>(&self, deliver: F) -> bool
    where
        F: FnOnce(),
    {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let _delivering = inner.delivery.lock();
        if !inner.live.load(Ordering::SeqCst) {
            return false;
        }
        deliver();
        true
    }

    /// Force-release from the delivery side (terminal delivery error).
    ///
    /// Returns true if this call ended the subscription.
    pub fn terminate(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.release(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting(Arc<AtomicUsize>);

    impl Registration for Counting {
        fn cancel(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_is_idempotent() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let sub = Subscription::pending(SubscriptionId(1), "test");
        sub.attach(Box::new(Counting(Arc::clone(&cancels))));

        sub.release();
        sub.release();
        drop(sub);

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_follows_release() {
        let sub = Subscription::pending(SubscriptionId(2), "test");
        let guard = sub.guard();
        assert!(guard.is_live());

        sub.release();
        assert!(!guard.is_live());
    }

    #[test]
    fn test_guard_dead_after_drop() {
        let sub = Subscription::pending(SubscriptionId(3), "test");
        let guard = sub.guard();
        drop(sub);
        assert!(!guard.is_live());
        assert!(!guard.terminate());
    }

    #[test]
    fn test_deliver_skipped_after_release() {
        let sub = Subscription::pending(SubscriptionId(5), "test");
        let guard = sub.guard();

        assert!(guard.deliver(|| {}));
        sub.release();
        assert!(!guard.deliver(|| panic!("delivered after release")));
    }

    #[test]
    fn test_terminate_inside_delivery() {
        let sub = Subscription::pending(SubscriptionId(6), "test");
        let guard = sub.guard();

        let mut ended = false;
        assert!(guard.deliver(|| ended = guard.terminate()));
        assert!(ended);
        assert!(!sub.is_live());
    }

    #[test]
    fn test_release_waits_for_running_delivery() {
        let sub = Subscription::pending(SubscriptionId(7), "test");
        let guard = sub.guard();
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let finished = Arc::new(AtomicBool::new(false));

        let done = Arc::clone(&finished);
        let worker = std::thread::spawn(move || {
            guard.deliver(|| {
                entered_tx.send(()).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(50));
                done.store(true, Ordering::SeqCst);
            })
        });

        entered_rx.recv().unwrap();
        sub.release();
        assert!(finished.load(Ordering::SeqCst));
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_attach_after_terminate_cancels_immediately() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let sub = Subscription::pending(SubscriptionId(4), "test");
        let guard = sub.guard();

        assert!(guard.terminate());
        sub.attach(Box::new(Counting(Arc::clone(&cancels))));

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(!sub.is_live());
    }
}
