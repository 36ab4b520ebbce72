//! Latest-value broadcast channels.
//!
//! A [`Channel`] has one writer and any number of readers. Every publish
//! replaces the exposed value wholesale, so all readers see the same
//! `Arc<T>` and never a partial update. Two kinds of dependents exist:
//!
//! - observers, invoked synchronously on every publish (used by components
//!   that must react in order, such as live queries following the identity)
//! - readers, which pull the latest value and get change notifications on a
//!   bounded feed; a reader whose feed overflows is dropped from the feed
//!   but can still read the latest value

use crate::error::{Result, SyncError};
use crossbeam_channel::{bounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a broadcast channel.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Max buffered change notifications per reader before it is dropped.
    /// Default: 64. Zero is raised to 1.
    pub buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { buffer_size: 64 }
    }
}

/// Notifications sent to readers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A new value was published.
    Updated { version: u64 },
    /// The reader will receive no further notifications.
    Dropped { reason: DropReason },
}

/// Why a reader stopped receiving notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Notification buffer overflowed (slow reader).
    BufferOverflow,
    /// The channel's owner went away.
    Closed,
}

/// Identifier of a registered observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer<T> = Arc<dyn Fn(&Arc<T>) + Send + Sync>;

struct Latest<T> {
    value: Arc<T>,
    version: u64,
}

/// Single-writer, many-reader broadcast of the latest value.
pub struct Channel<T> {
    latest: RwLock<Latest<T>>,
    feeds: RwLock<HashMap<u64, Sender<ChannelEvent>>>,
    observers: RwLock<Vec<(ObserverId, Observer<T>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    config: ChannelConfig,
}

impl<T: Send + Sync + 'static> Channel<T> {
    /// Create a channel exposing `initial` at version 0.
    pub fn new(initial: T) -> Arc<Self> {
        Self::with_config(initial, ChannelConfig::default())
    }

    pub fn with_config(initial: T, mut config: ChannelConfig) -> Arc<Self> {
        if config.buffer_size == 0 {
            tracing::warn!("channel buffer_size 0 raised to 1");
            config.buffer_size = 1;
        }
        Arc::new(Self {
            latest: RwLock::new(Latest {
                value: Arc::new(initial),
                version: 0,
            }),
            feeds: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Replace the exposed value and notify dependents. Returns the new version.
    pub fn publish(&self, value: T) -> Result<u64> {
        if self.is_closed() {
            return Err(SyncError::ChannelClosed);
        }

        let (value, version) = {
            let mut latest = self.latest.write();
            latest.value = Arc::new(value);
            latest.version += 1;
            (Arc::clone(&latest.value), latest.version)
        };

        self.notify_readers(ChannelEvent::Updated { version });

        // Snapshot the list so an observer may register or unregister others.
        let observers: Vec<Observer<T>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(&value);
        }

        Ok(version)
    }

    /// The latest published value.
    pub fn current(&self) -> Arc<T> {
        Arc::clone(&self.latest.read().value)
    }

    pub fn version(&self) -> u64 {
        self.latest.read().version
    }

    /// Create a reader with its own notification feed.
    pub fn reader(self: &Arc<Self>) -> Reader<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(self.config.buffer_size);
        if self.is_closed() {
            let _ = sender.try_send(ChannelEvent::Dropped {
                reason: DropReason::Closed,
            });
        } else {
            self.feeds.write().insert(id, sender);
        }
        Reader {
            id,
            channel: Arc::clone(self),
            receiver,
        }
    }

    /// Register a synchronous observer, invoked after every publish.
    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    pub fn unobserve(&self, id: ObserverId) {
        self.observers.write().retain(|(observer_id, _)| *observer_id != id);
    }

    /// Close the channel. Readers keep the last value and get a `Dropped` notification.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let feeds: Vec<Sender<ChannelEvent>> =
            self.feeds.write().drain().map(|(_, sender)| sender).collect();
        for sender in feeds {
            let _ = sender.try_send(ChannelEvent::Dropped {
                reason: DropReason::Closed,
            });
        }
        self.observers.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of readers still receiving notifications.
    pub fn reader_count(&self) -> usize {
        self.feeds.read().len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Send to every feed, dropping readers that cannot keep up.
    fn notify_readers(&self, event: ChannelEvent) {
        let mut to_remove = Vec::new();

        {
            let feeds = self.feeds.read();
            for (id, sender) in feeds.iter() {
                if sender.try_send(event).is_err() {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut feeds = self.feeds.write();
            for id in to_remove {
                if let Some(sender) = feeds.remove(&id) {
                    tracing::warn!(reader = id, "dropping slow reader");
                    // Buffer is full, so this usually fails; the reader still sees the channel disconnect.
                    let _ = sender.try_send(ChannelEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }

    fn remove_reader(&self, id: u64) {
        self.feeds.write().remove(&id);
    }
}

/// Read side of a [`Channel`].
pub struct Reader<T: Send + Sync + 'static> {
    id: u64,
    channel: Arc<Channel<T>>,
    receiver: Receiver<ChannelEvent>,
}

impl<T: Send + Sync + 'static> Reader<T> {
    /// The latest published value.
    pub fn current(&self) -> Arc<T> {
        self.channel.current()
    }

    pub fn version(&self) -> u64 {
        self.channel.version()
    }

    /// Whether a value newer than `version` has been published.
    pub fn changed_since(&self, version: u64) -> bool {
        self.channel.version() > version
    }

    /// Receive the next notification (blocking).
    pub fn recv(&self) -> std::result::Result<ChannelEvent, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<ChannelEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<ChannelEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Whether the owning channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

impl<T: Send + Sync + 'static> Clone for Reader<T> {
    /// A clone gets its own feed starting from now.
    fn clone(&self) -> Self {
        self.channel.reader()
    }
}

impl<T: Send + Sync + 'static> Drop for Reader<T> {
    fn drop(&mut self) {
        self.channel.remove_reader(self.id);
    }
}
