//! Collection nodes.
//!
//! Collection-shaped nodes publish an `Arc<Vec<T>>` like any other source,
//! and additionally item-level [`Delta`](super::Delta) batches to observers
//! registered through
//! [`CollectionSource::add_collection_observer`](super::CollectionSource::add_collection_observer).
//!
//! - [`InputList`]: a mutable leaf list
//! - [`MapCollection`]: projects every item
//! - [`FilterCollection`]: keeps items matching a predicate
//!
//! A derived collection follows the same push/pull hybrid as a scalar node.
//! When its upstream publishes a delta batch and somebody observes this
//! node's own deltas, the batch is translated and applied under one
//! [`UpdateToken`](super::UpdateToken). Otherwise the node is just
//! invalidated and recomputes in full on the next read.

mod filter;
mod list;
mod map;

pub use filter::FilterCollection;
pub use list::InputList;
pub use map::MapCollection;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::collector::Collector;
use super::context::EvaluationGuard;
use super::dependency::DependencyList;
use super::observer::{deliver, Change, CollectionObserver, DeltaBatch, Notification, Observer};
use super::source::ReactiveSource;
use super::state::{Epoch, Staleness};
use super::subscriber::{NodeId, SubscriberList, Subscription};
use super::update::UpdateToken;
use crate::compare::Value;
use crate::config;
use crate::error::Result;
use crate::version::{SideValues, Version, VersionedValue};

/// Snapshot of a collection: the items behind a shared pointer.
pub type Items<T> = Arc<Vec<T>>;

pub(crate) struct CollectionState<T> {
    /// None until a derived collection first evaluates.
    pub(crate) items: Option<Items<T>>,
    pub(crate) side_values: SideValues,
}

/// Bookkeeping shared by every collection node.
///
/// Lock order is `publish` before `state`. Deliveries happen with `publish`
/// held and `state` released.
pub(crate) struct CollectionCore<T: Value> {
    id: NodeId,
    derived: bool,
    publish: Mutex<()>,
    state: Mutex<CollectionState<T>>,
    version: AtomicU64,
    staleness: Staleness,
    dependencies: RwLock<DependencyList>,
    observers: SubscriberList<dyn Observer>,
    delta_observers: SubscriberList<dyn CollectionObserver<T>>,
    evaluations: AtomicUsize,
}

/// How a delta batch relates to what a node last read from its upstream.
pub(crate) enum Continuity {
    /// The batch starts where the node left off; the recorded version moved.
    Advanced,
    /// The node already read the batch's result.
    Seen,
    /// Versions were skipped, or the upstream is not tracked.
    Gap,
}

impl<T: Value> CollectionCore<T> {
    pub(crate) fn leaf(items: Vec<T>) -> Self {
        Self::with_state(false, Some(Arc::new(items)), Staleness::clean())
    }

    pub(crate) fn derived() -> Self {
        Self::with_state(true, None, Staleness::new())
    }

    fn with_state(derived: bool, items: Option<Items<T>>, staleness: Staleness) -> Self {
        Self {
            id: NodeId::new(),
            derived,
            publish: Mutex::new(()),
            state: Mutex::new(CollectionState {
                items,
                side_values: SideValues::empty(),
            }),
            version: AtomicU64::new(Version::INITIAL.get()),
            staleness,
            dependencies: RwLock::new(DependencyList::new()),
            observers: SubscriberList::new(),
            delta_observers: SubscriberList::new(),
            evaluations: AtomicUsize::new(0),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn is_derived(&self) -> bool {
        self.derived
    }

    pub(crate) fn version(&self) -> Version {
        Version::new(self.version.load(Ordering::Acquire))
    }

    pub(crate) fn store_version(&self, version: Version) {
        self.version.store(version.get(), Ordering::Release);
    }

    pub(crate) fn subscribe(&self, observer: Weak<dyn Observer>) -> Subscription {
        self.observers.subscribe(observer)
    }

    pub(crate) fn subscribe_deltas(&self, observer: Weak<dyn CollectionObserver<T>>) -> Subscription {
        self.delta_observers.subscribe(observer)
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn delta_observer_count(&self) -> usize {
        self.delta_observers.len()
    }

    pub(crate) fn evaluation_count(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.staleness.is_flagged() || self.dependencies.read().is_dirty()
    }

    /// Current items, ignoring staleness.
    pub(crate) fn items(&self) -> Option<Items<T>> {
        self.state.lock().items.clone()
    }

    /// The cached snapshot, if it is valid.
    pub(crate) fn snapshot(&self) -> Option<VersionedValue<Items<T>>> {
        if self.is_dirty() {
            return None;
        }
        let state = self.state.lock();
        let items = state.items.clone()?;
        Some(VersionedValue::new(items, self.version()).with_side_values(state.side_values.clone()))
    }

    /// Lock the node for an edit.
    pub(crate) fn begin_update(&self) -> UpdateToken<'_, T> {
        let publish = self.publish.lock();
        let state = self.state.lock();
        UpdateToken::new(self, publish, state)
    }

    /// Lock the node for an incremental update, if it should take one.
    ///
    /// Incremental work only pays off when somebody observes this node's
    /// deltas and the cache is valid. `None` also when an evaluation of this
    /// node is in progress: the caller must invalidate instead.
    pub(crate) fn begin_incremental(&self) -> Option<UpdateToken<'_, T>> {
        if self.delta_observers.is_empty() {
            return None;
        }
        let publish = self.publish.try_lock()?;
        let state = self.state.lock();
        if state.items.is_none() || self.staleness.is_flagged() {
            return None;
        }
        Some(UpdateToken::new(self, publish, state))
    }

    /// Move the recorded upstream version through `change`.
    pub(crate) fn advance(&self, change: Change) -> Continuity {
        let dependencies = self.dependencies.read();
        if dependencies.advance(change.source, change.previous, change.version) {
            return Continuity::Advanced;
        }
        match dependencies.version_of(change.source) {
            Some(recorded) if recorded >= change.version => Continuity::Seen,
            _ => Continuity::Gap,
        }
    }

    /// Mark the node dirty and tell every observer, deltas or not.
    pub(crate) fn invalidate(&self) {
        if !self.derived || !self.staleness.invalidate() {
            return;
        }
        tracing::trace!(node = %self.id, "invalidating collection");
        let notification = Notification {
            source: self.id,
            version: self.version(),
        };
        deliver(&self.delta_observers, notification);
        deliver(&self.observers, notification);
    }

    pub(crate) fn deliver_batch(&self, batch: &DeltaBatch<T>) {
        let change = batch.change();
        let trace = config::current().trace_notifications;
        for observer in self.delta_observers.snapshot() {
            if trace {
                tracing::trace!(source = %change.source, version = %change.version, "delivering delta batch");
            }
            observer.on_batch(batch);
        }
        deliver(
            &self.observers,
            Notification {
                source: change.source,
                version: change.version,
            },
        );
    }

    /// Publish a full recomputation. Called with the publish lock held.
    pub(crate) fn publish_full(
        &self,
        epoch: Epoch,
        items: Vec<T>,
        side_values: SideValues,
        dependencies: DependencyList,
    ) -> VersionedValue<Items<T>> {
        let (snapshot, previous) = {
            let mut state = self.state.lock();
            let previous = self.version();
            let unchanged = state.items.as_ref().is_some_and(|current| {
                current.len() == items.len() && current.iter().zip(&items).all(|(a, b)| a.same(b))
            });

            let version = if unchanged { previous } else { previous.next() };
            if !unchanged {
                state.items = Some(Arc::new(items));
            }
            state.side_values = side_values;
            self.store_version(version);

            let items = state.items.clone().unwrap_or_default();
            let snapshot =
                VersionedValue::new(items, version).with_side_values(state.side_values.clone());
            (snapshot, previous)
        };

        drop(std::mem::replace(&mut *self.dependencies.write(), dependencies));
        self.staleness.mark_clean(epoch);
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            node = %self.id,
            from = %previous,
            to = %snapshot.version(),
            len = snapshot.value().len(),
            "recomputed collection"
        );
        snapshot
    }
}

/// A node built on a [`CollectionCore`].
pub(crate) trait CollectionNode<T: Value>: ReactiveSource + Sized + 'static {
    fn core(&self) -> &CollectionCore<T>;

    /// Recompute in full. Called with the publish lock held.
    fn recompute(&self, epoch: Epoch) -> Result<VersionedValue<Items<T>>>;
}

/// Serve a read of `node`, recording it into `collector`.
pub(crate) fn read<T, N>(node: &Arc<N>, collector: Option<&Collector>) -> Result<VersionedValue<Items<T>>>
where
    T: Value,
    N: CollectionNode<T>,
{
    let ticket = collector.map(|cx| cx.begin_read(node)).transpose()?;
    let core = node.core();
    core.staleness.begin_read();

    let snapshot = current(node.as_ref())?;
    if let (Some(cx), Some(ticket)) = (collector, ticket) {
        cx.finish_read(ticket, snapshot.version(), snapshot.side_values());
    }
    Ok(snapshot)
}

fn current<T, N>(node: &N) -> Result<VersionedValue<Items<T>>>
where
    T: Value,
    N: CollectionNode<T>,
{
    let core = node.core();
    if let Some(snapshot) = core.snapshot() {
        return Ok(snapshot);
    }

    let _guard = EvaluationGuard::enter(core.id)?;
    let _publish = core.publish.lock();
    if let Some(snapshot) = core.snapshot() {
        return Ok(snapshot);
    }

    let epoch = core.staleness.begin_evaluation();
    node.recompute(epoch)
}

/// Implement the public source traits for a collection handle wrapping an
/// `Arc` of a [`CollectionNode`].
macro_rules! collection_handle {
    ($handle:ident, $node:ident, <$($param:ident),+>, $item:ident) => {
        impl<$($param: $crate::compare::Value),+> ::std::clone::Clone for $handle<$($param),+> {
            fn clone(&self) -> Self {
                Self {
                    inner: ::std::sync::Arc::clone(&self.inner),
                }
            }
        }

        impl<$($param: $crate::compare::Value),+> $crate::reactive::ReactiveSource for $node<$($param),+> {
            fn id(&self) -> $crate::reactive::NodeId {
                self.core.id()
            }

            fn version(&self) -> $crate::version::Version {
                self.core.version()
            }

            fn is_immutable(&self) -> bool {
                false
            }

            fn add_observer(
                &self,
                observer: ::std::sync::Weak<dyn $crate::reactive::Observer>,
            ) -> ::std::option::Option<$crate::reactive::Subscription> {
                Some(self.core.subscribe(observer))
            }
        }

        impl<$($param: $crate::compare::Value),+> $crate::reactive::ReactiveSource for $handle<$($param),+> {
            fn id(&self) -> $crate::reactive::NodeId {
                self.inner.core.id()
            }

            fn version(&self) -> $crate::version::Version {
                self.inner.core.version()
            }

            fn is_immutable(&self) -> bool {
                false
            }

            fn add_observer(
                &self,
                observer: ::std::sync::Weak<dyn $crate::reactive::Observer>,
            ) -> ::std::option::Option<$crate::reactive::Subscription> {
                Some(self.inner.core.subscribe(observer))
            }
        }

        impl<$($param: $crate::compare::Value),+>
            $crate::reactive::Source<$crate::reactive::Items<$item>> for $handle<$($param),+>
        {
            fn get_value(
                &self,
                collector: ::std::option::Option<&$crate::reactive::Collector>,
            ) -> $crate::error::Result<$crate::version::VersionedValue<$crate::reactive::Items<$item>>> {
                $crate::reactive::collection::read(&self.inner, collector)
            }
        }

        impl<$($param: $crate::compare::Value),+>
            $crate::reactive::AsyncSource<$crate::reactive::Items<$item>> for $handle<$($param),+>
        {
            fn get_value_async<'a>(
                &'a self,
                collector: ::std::option::Option<&'a $crate::reactive::Collector>,
                cancel: &'a $crate::reactive::CancellationToken,
            ) -> ::futures_util::future::BoxFuture<
                'a,
                $crate::error::Result<$crate::version::VersionedValue<$crate::reactive::Items<$item>>>,
            > {
                $crate::reactive::source::ready(self, collector, cancel)
            }
        }

        impl<$($param: $crate::compare::Value),+> $crate::reactive::CollectionSource<$item>
            for $handle<$($param),+>
        {
            fn add_collection_observer(
                &self,
                observer: ::std::sync::Weak<dyn $crate::reactive::CollectionObserver<$item>>,
            ) -> ::std::option::Option<$crate::reactive::Subscription> {
                Some(self.inner.core.subscribe_deltas(observer))
            }

            fn weak_source(&self) -> ::std::sync::Weak<dyn $crate::reactive::ReactiveSource> {
                let weak: ::std::sync::Weak<$node<$($param),+>> = ::std::sync::Arc::downgrade(&self.inner);
                weak
            }
        }
    };
}

pub(crate) use collection_handle;
