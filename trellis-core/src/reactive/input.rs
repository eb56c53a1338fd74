//! Input Implementation
//!
//! Inputs are the leaves of the graph: values set from outside. An
//! [`Input`] is mutable; a [`Constant`] never changes and is therefore never
//! tracked as a dependency.
//!
//! # How Inputs Work
//!
//! 1. When an input is read through a collector, the evaluating node
//!    subscribes to it and records the version it saw.
//!
//! 2. When the input is set to a value its comparer judges different, the
//!    version moves forward by one and every observer is notified.
//!
//! 3. Setting an equal value does nothing: no version bump, no
//!    notification.
//!
//! # Thread Safety
//!
//! The snapshot sits behind a `RwLock`; the version is mirrored in an atomic
//! so dependents can check staleness without locking. Writers are serialized
//! by a publish lock, which also keeps notifications in version order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};

use super::cancel::CancellationToken;
use super::collector::Collector;
use super::observer::{deliver, Notification, Observer};
use super::source::{self, AsyncSource, ReactiveSource, Source};
use super::subscriber::{NodeId, SubscriberList, Subscription};
use crate::compare::{Comparer, Value, ValueComparer};
use crate::error::Result;
use crate::version::{SideValues, Version, VersionedValue};

struct InputInner<T> {
    id: NodeId,
    snapshot: RwLock<VersionedValue<T>>,
    version: AtomicU64,
    comparer: Box<dyn Comparer<T>>,
    observers: SubscriberList<dyn Observer>,
    publish: Mutex<()>,
}

impl<T: Value> InputInner<T> {
    fn read(this: &Arc<Self>, collector: Option<&Collector>) -> Result<VersionedValue<T>> {
        let ticket = collector.map(|cx| cx.begin_read(this)).transpose()?;
        let snapshot = this.snapshot.read().clone();
        if let (Some(cx), Some(ticket)) = (collector, ticket) {
            cx.finish_read(ticket, snapshot.version(), snapshot.side_values());
        }
        Ok(snapshot)
    }
}

impl<T: Value> ReactiveSource for InputInner<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn version(&self) -> Version {
        Version::new(self.version.load(Ordering::Acquire))
    }

    fn is_immutable(&self) -> bool {
        false
    }

    fn add_observer(&self, observer: Weak<dyn Observer>) -> Option<Subscription> {
        Some(self.observers.subscribe(observer))
    }
}

/// A mutable leaf value.
///
/// Cloning an input yields another handle to the same node.
///
/// # Example
///
/// ```rust,ignore
/// let count = Input::new(0);
///
/// assert_eq!(count.get_untracked(), 0);
///
/// // Bumps the version and notifies observers.
/// count.set(5);
/// ```
pub struct Input<T: Value> {
    inner: Arc<InputInner<T>>,
}

impl<T: Value> Input<T> {
    /// Create an input at [`Version::INITIAL`], compared with
    /// [`Value::same`].
    pub fn new(value: T) -> Self {
        Self::with_comparer(value, ValueComparer)
    }

    pub fn with_comparer<C>(value: T, comparer: C) -> Self
    where
        C: Comparer<T>,
    {
        Self {
            inner: Arc::new(InputInner {
                id: NodeId::new(),
                snapshot: RwLock::new(VersionedValue::new(value, Version::INITIAL)),
                version: AtomicU64::new(Version::INITIAL.get()),
                comparer: Box::new(comparer),
                observers: SubscriberList::new(),
                publish: Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Set a new value. Returns the version the input is at afterwards.
    pub fn set(&self, value: T) -> Version {
        self.set_with_side_values(value, SideValues::empty())
    }

    /// Set a new value together with its side values.
    ///
    /// If the value is judged equal to the current one, only the side values
    /// are replaced; the version stays and nobody is notified.
    pub fn set_with_side_values(&self, value: T, side_values: SideValues) -> Version {
        let _publish = self.inner.publish.lock();

        let version = {
            let mut snapshot = self.inner.snapshot.write();
            if self.inner.comparer.equals(snapshot.value(), &value) {
                let current = snapshot.version();
                *snapshot = VersionedValue::new(value, current).with_side_values(side_values);
                return current;
            }

            let version = snapshot.version().next();
            *snapshot = VersionedValue::new(value, version).with_side_values(side_values);
            self.inner.version.store(version.get(), Ordering::Release);
            version
        };

        tracing::trace!(input = %self.inner.id, %version, "input changed");
        deliver(
            &self.inner.observers,
            Notification {
                source: self.inner.id,
                version,
            },
        );
        version
    }

    /// Update the value using a function of the current one.
    pub fn update<F>(&self, f: F) -> Version
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(self.inner.snapshot.read().value());
        self.set(next)
    }

    /// Current value, without recording a dependency.
    pub fn get_untracked(&self) -> T {
        self.inner.snapshot.read().value().clone()
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    /// Non-owning handle to this node.
    pub fn downgrade(&self) -> Weak<dyn ReactiveSource> {
        let weak: Weak<InputInner<T>> = Arc::downgrade(&self.inner);
        weak
    }
}

impl<T: Value> Clone for Input<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Value> ReactiveSource for Input<T> {
    fn id(&self) -> NodeId {
        self.inner.id
    }

    fn version(&self) -> Version {
        self.inner.version()
    }

    fn is_immutable(&self) -> bool {
        false
    }

    fn add_observer(&self, observer: Weak<dyn Observer>) -> Option<Subscription> {
        self.inner.add_observer(observer)
    }
}

impl<T: Value> Source<T> for Input<T> {
    fn get_value(&self, collector: Option<&Collector>) -> Result<VersionedValue<T>> {
        InputInner::read(&self.inner, collector)
    }
}

impl<T: Value> AsyncSource<T> for Input<T> {
    fn get_value_async<'a>(
        &'a self,
        collector: Option<&'a Collector>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<VersionedValue<T>>> {
        source::ready(self, collector, cancel)
    }
}

impl<T: Value + fmt::Debug> fmt::Debug for Input<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Input")
            .field("id", &self.inner.id)
            .field("snapshot", &*self.inner.snapshot.read())
            .field("observer_count", &self.observer_count())
            .finish()
    }
}

struct ConstantInner<T> {
    id: NodeId,
    snapshot: VersionedValue<T>,
}

impl<T: Value> ReactiveSource for ConstantInner<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn version(&self) -> Version {
        self.snapshot.version()
    }

    fn is_immutable(&self) -> bool {
        true
    }

    fn add_observer(&self, _observer: Weak<dyn Observer>) -> Option<Subscription> {
        None
    }
}

/// A leaf that never changes.
///
/// Reading a constant folds its side values into the reader but never
/// registers a dependency, which lets a derived node that only reads
/// constants prove itself immutable.
pub struct Constant<T: Value> {
    inner: Arc<ConstantInner<T>>,
}

impl<T: Value> Constant<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(ConstantInner {
                id: NodeId::new(),
                snapshot: VersionedValue::new(value, Version::INITIAL),
            }),
        }
    }

    pub fn with_side_values(self, side_values: SideValues) -> Self {
        let snapshot = self.inner.snapshot.clone().with_side_values(side_values);
        Self {
            inner: Arc::new(ConstantInner {
                id: self.inner.id,
                snapshot,
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn get(&self) -> &T {
        self.inner.snapshot.value()
    }

    pub fn downgrade(&self) -> Weak<dyn ReactiveSource> {
        let weak: Weak<ConstantInner<T>> = Arc::downgrade(&self.inner);
        weak
    }
}

impl<T: Value> Clone for Constant<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Value> ReactiveSource for Constant<T> {
    fn id(&self) -> NodeId {
        self.inner.id
    }

    fn version(&self) -> Version {
        self.inner.version()
    }

    fn is_immutable(&self) -> bool {
        true
    }

    fn add_observer(&self, _observer: Weak<dyn Observer>) -> Option<Subscription> {
        None
    }
}

impl<T: Value> Source<T> for Constant<T> {
    fn get_value(&self, collector: Option<&Collector>) -> Result<VersionedValue<T>> {
        if let Some(cx) = collector {
            cx.record(&self.inner, self.inner.snapshot.version(), self.inner.snapshot.side_values())?;
        }
        Ok(self.inner.snapshot.clone())
    }
}

impl<T: Value> AsyncSource<T> for Constant<T> {
    fn get_value_async<'a>(
        &'a self,
        collector: Option<&'a Collector>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<VersionedValue<T>>> {
        source::ready(self, collector, cancel)
    }
}

impl<T: Value + fmt::Debug> fmt::Debug for Constant<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constant")
            .field("id", &self.inner.id)
            .field("value", self.get())
            .finish()
    }
}
