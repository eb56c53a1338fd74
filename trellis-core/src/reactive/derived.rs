//! Derived Implementation
//!
//! A [`Derived`] is a cached value computed from other sources. It
//! re-evaluates only when something it read has changed, and only when
//! somebody asks for its value.
//!
//! # How Derived Nodes Work
//!
//! 1. On first access, the node runs its derivation under a fresh
//!    [`Collector`] and caches the result at version 1.
//!
//! 2. Every source the derivation read is subscribed to. When one of them
//!    changes, the node is marked dirty and tells its own observers.
//!
//! 3. On the next access, a dirty node re-runs its derivation. The result is
//!    compared with the cached one; the version only moves if they differ.
//!
//! 4. The dependencies of the new run replace the old ones, so a source the
//!    derivation stopped reading is unsubscribed from.
//!
//! # Why This Matters
//!
//! This "lazy" approach avoids unnecessary recomputation:
//!
//! - An input changes
//! - 10 derived nodes depend on it
//! - All 10 are told they are dirty
//! - Only the ones actually read will recompute
//!
//! # Thread Safety
//!
//! Derived nodes are thread-safe. Evaluations of one node are serialized by
//! its evaluation lock, and the derivation is called with that lock held.
//! Reads of a clean node never take it. An evaluation that would block on a
//! node which is, transitively, blocked on it fails with a cycle instead.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::cancel::CancellationToken;
use super::collector::{Collected, Collector};
use super::context::{EvaluationGuard, Wait};
use super::dependency::DependencyList;
use super::observer::{deliver, Notification, Observer};
use super::source::{self, AsyncSource, ReactiveSource, Source};
use super::state::{Epoch, NodeState, Staleness};
use super::subscriber::{NodeId, SubscriberList, Subscription};
use crate::compare::{Comparer, Value, ValueComparer};
use crate::error::Result;
use crate::version::{Version, VersionedValue};

type Derivation<T> = Box<dyn Fn(&Collector) -> Result<T> + Send + Sync>;

struct DerivedInner<T> {
    id: NodeId,
    this: Weak<DerivedInner<T>>,
    compute: Derivation<T>,
    comparer: Box<dyn Comparer<T>>,

    /// Last published snapshot (None if never computed).
    cache: RwLock<Option<VersionedValue<T>>>,
    version: AtomicU64,

    /// Sources read by the last successful evaluation.
    dependencies: RwLock<DependencyList>,
    staleness: Staleness,
    immutable: AtomicBool,
    evaluations: AtomicUsize,

    observers: SubscriberList<dyn Observer>,
    evaluation: Mutex<()>,
}

impl<T: Value> DerivedInner<T> {
    fn read(this: &Arc<Self>, collector: Option<&Collector>) -> Result<VersionedValue<T>> {
        let ticket = collector.map(|cx| cx.begin_read(this)).transpose()?;
        this.staleness.begin_read();

        let snapshot = this.current(collector)?;
        if let (Some(cx), Some(ticket)) = (collector, ticket) {
            cx.finish_read(ticket, snapshot.version(), snapshot.side_values());
        }
        Ok(snapshot)
    }

    fn clean_snapshot(&self) -> Option<VersionedValue<T>> {
        if self.is_dirty() {
            return None;
        }
        self.cache.read().clone()
    }

    fn current(&self, parent: Option<&Collector>) -> Result<VersionedValue<T>> {
        if let Some(snapshot) = self.clean_snapshot() {
            return Ok(snapshot);
        }

        // Enter before locking: re-entering from our own derivation must
        // fail instead of deadlocking.
        let reader = EvaluationGuard::current();
        let _guard = EvaluationGuard::enter(self.id)?;
        let _evaluation = match self.evaluation.try_lock() {
            Some(evaluation) => evaluation,
            None => {
                let _wait = reader
                    .map(|reader| Wait::register(reader, self.id))
                    .transpose()?;
                self.evaluation.lock()
            }
        };

        // Someone else may have evaluated while we waited.
        if let Some(snapshot) = self.clean_snapshot() {
            return Ok(snapshot);
        }

        let epoch = self.staleness.begin_evaluation();
        let cx = Collector::new(self.id, self.this.clone(), parent);
        let result = (self.compute)(&cx);
        let collected = cx.finish()?;

        // On error the new dependencies are dropped and everything else is
        // left as it was: still dirty, still subscribed to the old sources.
        let value = result?;
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
                _ => {
                    let version = previous.unwrap_or(Version::INITIAL).next();
                    VersionedValue::new(value, version).with_side_values(side_values)
                }
            };
            *cache = Some(snapshot.clone());
            self.version.store(snapshot.version().get(), Ordering::Release);
            (snapshot, previous)
        };

        let proven_immutable = dependencies.is_empty();
        let stale = std::mem::replace(&mut *self.dependencies.write(), dependencies);
        drop(stale);

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
            immutable = proven_immutable,
            "recomputed derived node"
        );
        snapshot
    }

    fn is_dirty(&self) -> bool {
        self.staleness.is_flagged() || self.dependencies.read().is_dirty()
    }
}

impl<T: Value> ReactiveSource for DerivedInner<T> {
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

impl<T: Value> Observer for DerivedInner<T> {
    fn notify(&self, notification: Notification) {
        if self.is_immutable() {
            return;
        }
        if self.staleness.invalidate() {
            tracing::trace!(
                node = %self.id,
                cause = %notification.source,
                "forwarding invalidation"
            );
            deliver(
                &self.observers,
                Notification {
                    source: self.id,
                    version: self.version(),
                },
            );
        }
    }
}

/// A cached derived value that recomputes only when its dependencies change.
///
/// Cloning yields another handle to the same node.
///
/// # Example
///
/// ```rust,ignore
/// let base = Input::new(2);
/// let squared = {
///     let base = base.clone();
///     Derived::new(move |cx| {
///         let value = cx.get(&base)?;
///         Ok(value * value)
///     })
/// };
///
/// assert_eq!(squared.get()?, 4);
/// ```
pub struct Derived<T: Value> {
    inner: Arc<DerivedInner<T>>,
}

impl<T: Value> Derived<T> {
    /// Create a derived node compared with [`Value::same`].
    ///
    /// The derivation is not run immediately. It runs on first access.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn(&Collector) -> Result<T> + Send + Sync + 'static,
    {
        Self::with_comparer(compute, ValueComparer)
    }

    pub fn with_comparer<F, C>(compute: F, comparer: C) -> Self
    where
        F: Fn(&Collector) -> Result<T> + Send + Sync + 'static,
        C: Comparer<T>,
    {
        let inner = Arc::new_cyclic(|this| DerivedInner {
            id: NodeId::new(),
            this: this.clone(),
            compute: Box::new(compute),
            comparer: Box::new(comparer),
            cache: RwLock::new(None),
            version: AtomicU64::new(Version::INITIAL.get()),
            dependencies: RwLock::new(DependencyList::new()),
            staleness: Staleness::new(),
            immutable: AtomicBool::new(false),
            evaluations: AtomicUsize::new(0),
            observers: SubscriberList::new(),
            evaluation: Mutex::new(()),
        });
        Self { inner }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Current value, recomputing if necessary. Not tracked.
    pub fn get(&self) -> Result<T> {
        self.get_value(None).map(VersionedValue::into_value)
    }

    /// Whether the next read will recompute.
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

    /// Check if the node has a cached value.
    pub fn has_value(&self) -> bool {
        self.inner.cache.read().is_some()
    }

    /// Number of successful evaluations so far.
    pub fn evaluation_count(&self) -> usize {
        self.inner.evaluations.load(Ordering::Relaxed)
    }

    /// Number of sources read by the last successful evaluation.
    pub fn dependency_count(&self) -> usize {
        self.inner.dependencies.read().len()
    }

    pub fn depends_on(&self, source: NodeId) -> bool {
        self.inner.dependencies.read().contains(source)
    }

    /// Get the number of observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    pub fn downgrade(&self) -> Weak<dyn ReactiveSource> {
        let weak: Weak<DerivedInner<T>> = Arc::downgrade(&self.inner);
        weak
    }
}

impl<T: Value> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Value> ReactiveSource for Derived<T> {
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

impl<T: Value> Source<T> for Derived<T> {
    fn get_value(&self, collector: Option<&Collector>) -> Result<VersionedValue<T>> {
        DerivedInner::read(&self.inner, collector)
    }
}

impl<T: Value> AsyncSource<T> for Derived<T> {
    fn get_value_async<'a>(
        &'a self,
        collector: Option<&'a Collector>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<VersionedValue<T>>> {
        source::ready(self, collector, cancel)
    }
}

impl<T: Value> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derived")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .field("state", &self.state())
            .field("has_value", &self.has_value())
            .field("dependency_count", &self.dependency_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reactive::{Constant, Input};
    use crate::version::Diagnostic;
    use std::sync::atomic::AtomicI32;

    fn counted<F>(calls: &Arc<AtomicI32>, f: F) -> impl Fn(&Collector) -> Result<i32>
    where
        F: Fn(&Collector) -> Result<i32>,
    {
        let calls = calls.clone();
        move |cx| {
            calls.fetch_add(1, Ordering::SeqCst);
            f(cx)
        }
    }

    #[test]
    fn computes_on_first_access() {
        let calls = Arc::new(AtomicI32::new(0));
        let derived = Derived::new(counted(&calls, |_| Ok(42)));

        // Not computed yet
        assert!(!derived.has_value());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let snapshot = derived.get_value(None).unwrap();
        assert_eq!(*snapshot.value(), 42);
        assert_eq!(snapshot.version(), Version::new(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(derived.has_value());
    }

    #[test]
    fn caches_value_when_clean() {
        let input = Input::new(1);
        let calls = Arc::new(AtomicI32::new(0));
        let derived = {
            let input = input.clone();
            Derived::new(counted(&calls, move |cx| cx.get(&input)))
        };

        assert_eq!(derived.get().unwrap(), 1);
        assert_eq!(derived.get().unwrap(), 1);
        assert_eq!(derived.get().unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(derived.state(), NodeState::Clean);
    }

    #[test]
    fn recomputes_after_input_change() {
        let input = Input::new(1);
        let derived = {
            let input = input.clone();
            Derived::new(move |cx| Ok(cx.get(&input)? + 1))
        };

        assert_eq!(derived.get().unwrap(), 2);
        input.set(10);
        assert!(derived.is_dirty());
        assert_eq!(derived.get().unwrap(), 11);
        assert_eq!(derived.version(), Version::new(2));
    }

    #[test]
    fn equal_result_keeps_version() {
        let input = Input::new(3);
        let calls = Arc::new(AtomicI32::new(0));
        let parity = {
            let input = input.clone();
            Derived::new(counted(&calls, move |cx| Ok(cx.get(&input)? % 2)))
        };

        assert_eq!(parity.get_value(None).unwrap().version(), Version::new(1));
        input.set(5);
        let snapshot = parity.get_value(None).unwrap();
        assert_eq!(*snapshot.value(), 1);
        assert_eq!(snapshot.version(), Version::new(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn downstream_of_equal_result_reruns_at_same_version() {
        let input = Input::new(3);
        let parity = {
            let input = input.clone();
            Derived::new(move |cx| {
                let value = cx.get(&input)?;
                cx.report(Diagnostic::info(format!("from {value}")));
                Ok(value % 2)
            })
        };
        let calls = Arc::new(AtomicI32::new(0));
        let top = {
            let parity = parity.clone();
            Derived::new(counted(&calls, move |cx| Ok(cx.get(&parity)? + 100)))
        };

        assert_eq!(top.get().unwrap(), 101);
        input.set(5);

        let snapshot = top.get_value(None).unwrap();
        assert_eq!(parity.version(), Version::new(1));
        assert_eq!(snapshot.version(), Version::new(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(&*snapshot.side_values().diagnostics()[0].message, "from 5");
    }

    #[test]
    fn failed_derivation_stays_dirty() {
        let input = Input::new(0);
        let derived = {
            let input = input.clone();
            Derived::new(move |cx| {
                let value = cx.get(&input)?;
                if value < 0 {
                    return Err(Error::compute("negative"));
                }
                Ok(value)
            })
        };

        assert_eq!(derived.get().unwrap(), 0);
        input.set(-1);
        assert!(matches!(derived.get(), Err(Error::Compute(_))));
        assert!(derived.is_dirty());
        assert_eq!(derived.version(), Version::new(1));
        assert!(derived.depends_on(input.id()));

        input.set(4);
        assert_eq!(derived.get().unwrap(), 4);
        assert_eq!(derived.version(), Version::new(2));
    }

    #[test]
    fn invalidation_reaches_downstream_once() {
        let input = Input::new(1);
        let middle = {
            let input = input.clone();
            Derived::new(move |cx| Ok(cx.get(&input)? * 2))
        };
        let top = {
            let middle = middle.clone();
            Derived::new(move |cx| Ok(cx.get(&middle)? + 1))
        };

        assert_eq!(top.get().unwrap(), 3);
        assert_eq!(middle.observer_count(), 1);

        input.set(2);
        input.set(3);
        assert!(middle.is_dirty());
        assert!(top.is_dirty());
        assert_eq!(top.get().unwrap(), 7);
        assert_eq!(top.evaluation_count(), 2);
    }

    #[test]
    fn reading_only_constants_proves_immutability() {
        let constant = Constant::new(20);
        let derived = {
            let constant = constant.clone();
            Derived::new(move |cx| Ok(cx.get(&constant)? + 1))
        };

        assert!(!derived.is_immutable());
        assert_eq!(derived.get().unwrap(), 21);
        assert!(derived.is_immutable());
        assert_eq!(derived.dependency_count(), 0);
    }

    #[test]
    fn self_read_is_a_cycle() {
        let slot: Arc<Mutex<Option<Derived<i32>>>> = Arc::new(Mutex::new(None));
        let derived = {
            let slot = slot.clone();
            Derived::new(move |_| {
                let me = slot.lock().clone();
                match me {
                    Some(me) => me.get(),
                    None => Ok(0),
                }
            })
        };
        *slot.lock() = Some(derived.clone());

        assert!(matches!(
            derived.get(),
            Err(Error::Cycle { node }) if node == derived.id()
        ));
        assert!(derived.is_dirty());
        slot.lock().take();
    }
}
