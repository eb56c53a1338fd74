//! Observer contracts.
//!
//! An [`Observer`] is told that a source moved on. It is not told the new
//! value; the observer pulls it later if it still cares. A
//! [`CollectionObserver`] additionally receives item-level deltas so it can
//! patch its own state instead of rescanning.

use std::fmt;

use smallvec::SmallVec;

use super::subscriber::{NodeId, SubscriberList};
use crate::config;
use crate::version::Version;

/// A push notification: `source` has moved past what observers last read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub source: NodeId,
    pub version: Version,
}

/// A registered callback target notified on source changes.
///
/// Implementations run on the notifying thread while the source holds its
/// publish lock. They must not write to the source they observe.
pub trait Observer: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Tell every live observer in `observers` about `notification`.
pub(crate) fn deliver<O>(observers: &SubscriberList<O>, notification: Notification)
where
    O: Observer + ?Sized + 'static,
{
    let trace = config::current().trace_notifications;
    for observer in observers.snapshot() {
        if trace {
            tracing::trace!(
                source = %notification.source,
                version = %notification.version,
                "notifying observer"
            );
        }
        observer.notify(notification);
    }
}

/// Observer backed by a closure.
pub struct CallbackObserver {
    id: NodeId,
    /// The callback to invoke when a source changes.
    ///
    /// Boxed so that different callers can attach different behavior.
    callback: Box<dyn Fn(Notification) + Send + Sync>,
}

impl CallbackObserver {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        Self {
            id: NodeId::new(),
            callback: Box::new(callback),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl Observer for CallbackObserver {
    fn notify(&self, notification: Notification) {
        (self.callback)(notification);
    }
}

impl fmt::Debug for CallbackObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackObserver").field("id", &self.id).finish()
    }
}

/// The version step a delta batch moves its source through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub source: NodeId,
    pub previous: Version,
    pub version: Version,
}

/// One item-level edit.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta<T> {
    Added { index: usize, item: T },
    Removed { index: usize, item: T },
    Replaced { index: usize, old: T, new: T },
}

impl<T> Delta<T> {
    pub fn index(&self) -> usize {
        match self {
            Self::Added { index, .. } | Self::Removed { index, .. } | Self::Replaced { index, .. } => {
                *index
            }
        }
    }
}

/// Every delta published by one version bump, in application order.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaBatch<T> {
    change: Change,
    deltas: SmallVec<[Delta<T>; 4]>,
}

impl<T> DeltaBatch<T> {
    pub fn new(change: Change, deltas: SmallVec<[Delta<T>; 4]>) -> Self {
        Self { change, deltas }
    }

    pub fn change(&self) -> Change {
        self.change
    }

    pub fn deltas(&self) -> &[Delta<T>] {
        &self.deltas
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

/// Observer of item-level collection changes.
///
/// [`Observer::notify`] still arrives when the collection changed wholesale
/// and the observer has to re-read it.
pub trait CollectionObserver<T>: Observer {
    fn on_added(&self, change: Change, index: usize, item: &T);

    fn on_removed(&self, change: Change, index: usize, item: &T);

    fn on_replaced(&self, change: Change, index: usize, old: &T, new: &T);

    /// Receive every delta of one version bump.
    ///
    /// The default dispatches each delta to the callbacks above. Operators
    /// override it to apply the whole batch under one update.
    fn on_batch(&self, batch: &DeltaBatch<T>) {
        let change = batch.change();
        for delta in batch.deltas() {
            match delta {
                Delta::Added { index, item } => self.on_added(change, *index, item),
                Delta::Removed { index, item } => self.on_removed(change, *index, item),
                Delta::Replaced { index, old, new } => self.on_replaced(change, *index, old, new),
            }
        }
    }
}
