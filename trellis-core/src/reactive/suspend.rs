//! Suspending derived nodes.
//!
//! [`AsyncDerived`] has the same contract as [`Derived`](super::Derived),
//! but its derivation is a future and may await other suspending sources.
//! Concurrent requests on one node are serialized by a single-permit
//! semaphore: the first caller to find the node dirty recomputes, everyone
//! who arrives meanwhile waits for the permit and then finds the fresh
//! snapshot (the dirty check runs again after the permit is acquired).
//!
//! Each derivation future runs inside a task-local record of the suspending
//! evaluations enclosing it, so a derivation that reads its own node without
//! going through its collector still fails with a cycle.
//!
//! Cancellation is cooperative. A request whose token is cancelled returns
//! [`Error::Cancelled`]; if it was the one recomputing, the derivation future
//! is dropped and nothing is published. The permit is released on every
//! exit path because it is a guard.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::debug;

use super::cancel::CancellationToken;
use super::collector::{Collected, Collector};
use super::context::{self, Wait};
use super::dependency::DependencyList;
use super::observer::{deliver, Notification, Observer};
use super::source::{AsyncSource, ReactiveSource};
use super::state::{Epoch, NodeState, Staleness};
use super::subscriber::{NodeId, SubscriberList, Subscription};
use crate::compare::{Comparer, Value, ValueComparer};
use crate::error::{Error, Result};
use crate::version::{Version, VersionedValue};

type AsyncDerivation<T> =
    Box<dyn Fn(Collector, CancellationToken) -> BoxFuture<'static, Result<T>> + Send + Sync>;

struct AsyncInner<T> {
    id: NodeId,
    this: Weak<AsyncInner<T>>,
    compute: AsyncDerivation<T>,
    comparer: Box<dyn Comparer<T>>,
    cache: RwLock<Option<VersionedValue<T>>>,
    version: AtomicU64,
    dependencies: RwLock<DependencyList>,
    staleness: Staleness,
    immutable: AtomicBool,
    evaluations: AtomicUsize,
    observers: SubscriberList<dyn Observer>,
    permit: Semaphore,
}

impl<T: Value> AsyncInner<T> {
    async fn read(
        this: &Arc<Self>,
        collector: Option<&Collector>,
        cancel: &CancellationToken,
    ) -> Result<VersionedValue<T>> {
        cancel.check()?;
        let ticket = collector.map(|cx| cx.begin_read(this)).transpose()?;
        this.staleness.begin_read();

        let snapshot = this.current(collector, cancel).await?;
        if let (Some(cx), Some(ticket)) = (collector, ticket) {
            cx.finish_read(ticket, snapshot.version(), snapshot.side_values());
        }
        Ok(snapshot)
    }

    fn is_dirty(&self) -> bool {
        self.staleness.is_flagged() || self.dependencies.read().is_dirty()
    }

    fn clean_snapshot(&self) -> Option<VersionedValue<T>> {
        if self.is_dirty() {
            return None;
        }
        self.cache.read().clone()
    }

    async fn current(
        &self,
        parent: Option<&Collector>,
        cancel: &CancellationToken,
    ) -> Result<VersionedValue<T>> {
        if let Some(snapshot) = self.clean_snapshot() {
            return Ok(snapshot);
        }

        // Untracked reads never reach the collector's ancestor check.
        let path = context::async_path();
        if path.contains(&self.id) {
            return Err(Error::Cycle { node: self.id });
        }

        let _permit = match self.permit.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                let _wait = path
                    .last()
                    .map(|&reader| Wait::register(reader, self.id))
                    .transpose()?;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    permit = self.permit.acquire() => permit.map_err(|_| Error::Cancelled)?,
                }
            }
        };

        if let Some(snapshot) = self.clean_snapshot() {
            return Ok(snapshot);
        }

        let epoch = self.staleness.begin_evaluation();
        let cx = Collector::new(self.id, self.this.clone(), parent);
        let derivation =
            context::scope_async(path, self.id, (self.compute)(cx.clone(), cancel.clone()));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = derivation => result,
        };

        // Dropping the collector on failure drops every subscription this run
        // made; the node keeps its previous snapshot and dependencies.
        let value = result?;
        let collected = cx.finish()?;
        Ok(self.publish(epoch, value, collected))
    }

    fn publish(&self, epoch: Epoch, value: T, collected: Collected) -> VersionedValue<T> {
        let Collected {
            dependencies,
            side_values,
        } = collected;

        let (snapshot, previous) = {
            let mut cache = self.cache.write();
            let previous = cache.as_ref().map(|s| s.version());
            let snapshot = match cache.as_ref() {
                Some(prev) if self.comparer.equals(prev.value(), &value) => {
                    VersionedValue::new(prev.value().clone(), prev.version())
                        .with_side_values(side_values)
                }
                _ => VersionedValue::new(value, previous.unwrap_or(Version::INITIAL).next())
                    .with_side_values(side_values),
            };
            *cache = Some(snapshot.clone());
            self.version.store(snapshot.version().get(), Ordering::Release);
            (snapshot, previous)
        };

        let proven_immutable = dependencies.is_empty();
        drop(std::mem::replace(
            &mut *self.dependencies.write(),
            dependencies,
        ));
        if proven_immutable {
            self.dependencies.read().disable();
            self.immutable.store(true, Ordering::Release);
        }

        self.staleness.mark_clean(epoch);
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        debug!(
            node = %self.id,
            from = %previous.unwrap_or(Version::INITIAL),
            to = %snapshot.version(),
            "recomputed suspending node"
        );
        snapshot
    }
}

impl<T: Value> ReactiveSource for AsyncInner<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn version(&self) -> Version {
        Version::new(self.version.load(Ordering::Acquire))
    }

    fn is_immutable(&self) -> bool {
        self.immutable.load(Ordering::Acquire)
    }

    fn add_observer(&self, observer: Weak<dyn Observer>) -> Option<Subscription> {
        if self.is_immutable() {
            return None;
        }
        Some(self.observers.subscribe(observer))
    }
}

impl<T: Value> Observer for AsyncInner<T> {
    fn notify(&self, notification: Notification) {
        if self.is_immutable() || !self.staleness.invalidate() {
            return;
        }
        tracing::trace!(node = %self.id, cause = %notification.source, "forwarding invalidation");
        deliver(
            &self.observers,
            Notification {
                source: self.id,
                version: self.version(),
            },
        );
    }
}

/// A derived value whose derivation may suspend.
///
/// The derivation receives its own [`Collector`] and the request's
/// [`CancellationToken`] by value, so the future it returns can be `'static`.
///
/// # Example
///
/// ```rust,ignore
/// let input = Input::new(1);
/// let remote = {
///     let input = input.clone();
///     AsyncDerived::new(move |cx, cancel| {
///         let input = input.clone();
///         async move {
///             let value = cx.get_async(&input, &cancel).await?;
///             Ok(fetch(value).await)
///         }
///     })
/// };
///
/// let value = remote.get(&CancellationToken::new()).await?;
/// ```
pub struct AsyncDerived<T: Value> {
    inner: Arc<AsyncInner<T>>,
}

impl<T: Value> AsyncDerived<T> {
    pub fn new<F, Fut>(compute: F) -> Self
    where
        F: Fn(Collector, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::with_comparer(compute, ValueComparer)
    }

    pub fn with_comparer<F, Fut, C>(compute: F, comparer: C) -> Self
    where
        F: Fn(Collector, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        C: Comparer<T>,
    {
        let compute: AsyncDerivation<T> = Box::new(move |cx, cancel| compute(cx, cancel).boxed());
        let inner = Arc::new_cyclic(|this| AsyncInner {
            id: NodeId::new(),
            this: this.clone(),
            compute,
            comparer: Box::new(comparer),
            cache: RwLock::new(None),
            version: AtomicU64::new(Version::INITIAL.get()),
            dependencies: RwLock::new(DependencyList::new()),
            staleness: Staleness::new(),
            immutable: AtomicBool::new(false),
            evaluations: AtomicUsize::new(0),
            observers: SubscriberList::new(),
            permit: Semaphore::new(1),
        });
        Self { inner }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Current value, recomputing if necessary. Not tracked.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<T> {
        let snapshot = AsyncInner::read(&self.inner, None, cancel).await?;
        Ok(snapshot.into_value())
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.is_dirty()
    }

    pub fn state(&self) -> NodeState {
        if self.is_dirty() {
            NodeState::Dirty
        } else {
            NodeState::Clean
        }
    }

    pub fn has_value(&self) -> bool {
        self.inner.cache.read().is_some()
    }

    /// Number of successful evaluations so far.
    pub fn evaluation_count(&self) -> usize {
        self.inner.evaluations.load(Ordering::Relaxed)
    }

    pub fn dependency_count(&self) -> usize {
        self.inner.dependencies.read().len()
    }

    pub fn depends_on(&self, source: NodeId) -> bool {
        self.inner.dependencies.read().contains(source)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    pub fn downgrade(&self) -> Weak<dyn ReactiveSource> {
        let weak: Weak<AsyncInner<T>> = Arc::downgrade(&self.inner);
        weak
    }
}

impl<T: Value> Clone for AsyncDerived<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Value> ReactiveSource for AsyncDerived<T> {
    fn id(&self) -> NodeId {
        self.inner.id
    }

    fn version(&self) -> Version {
        self.inner.version()
    }

    fn is_immutable(&self) -> bool {
        self.inner.is_immutable()
    }

    fn add_observer(&self, observer: Weak<dyn Observer>) -> Option<Subscription> {
        self.inner.add_observer(observer)
    }
}

impl<T: Value> AsyncSource<T> for AsyncDerived<T> {
    fn get_value_async<'a>(
        &'a self,
        collector: Option<&'a Collector>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<VersionedValue<T>>> {
        AsyncInner::read(&self.inner, collector, cancel).boxed()
    }
}

impl<T: Value> fmt::Debug for AsyncDerived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncDerived")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .field("state", &self.state())
            .field("has_value", &self.has_value())
            .finish()
    }
}
