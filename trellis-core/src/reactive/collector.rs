//! Collector Token
//!
//! A [`Collector`] is handed to a derivation while it runs. Every source read
//! through it is recorded as a dependency of the evaluating node, the node is
//! subscribed to it, and the source's side values are folded into the
//! node's own.
//!
//! # Read protocol
//!
//! A read happens in two steps. [`begin_read`](Collector::begin_read)
//! subscribes the evaluating node to the source before the value is looked
//! at, so an invalidation racing with the read cannot be missed.
//! [`finish_read`](Collector::finish_read) then records the version that was
//! actually served. Sources implement this protocol in their `get_value`;
//! derivations just call [`get`](Collector::get).

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::cancel::CancellationToken;
use super::dependency::DependencyList;
use super::observer::Observer;
use super::source::{AsyncSource, ReactiveSource, Source};
use super::subscriber::{NodeId, Subscription};
use crate::error::{report_defect, Defect, Error, Result};
use crate::version::{Diagnostic, SideValues, Version};

struct CollectorInner {
    node: NodeId,
    /// Nodes currently evaluating on this chain, outermost first, ending
    /// with `node`.
    path: SmallVec<[NodeId; 8]>,
    observer: Weak<dyn Observer>,
    dependencies: DependencyList,
    side_values: Mutex<SideValues>,
}

/// Ambient context of one evaluation.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

/// A read between [`Collector::begin_read`] and [`Collector::finish_read`].
#[must_use]
pub struct ReadTicket {
    source: Weak<dyn ReactiveSource>,
    source_id: NodeId,
    subscription: Option<Subscription>,
    already_tracked: bool,
}

/// What an evaluation read, once it is over.
pub(crate) struct Collected {
    pub(crate) dependencies: DependencyList,
    pub(crate) side_values: SideValues,
}

impl Collector {
    pub(crate) fn new(
        node: NodeId,
        observer: Weak<dyn Observer>,
        parent: Option<&Collector>,
    ) -> Self {
        let mut path = parent
            .map(|parent| parent.inner.path.clone())
            .unwrap_or_default();
        path.push(node);

        Self {
            inner: Arc::new(CollectorInner {
                node,
                path,
                observer,
                dependencies: DependencyList::new(),
                side_values: Mutex::new(SideValues::empty()),
            }),
        }
    }

    /// The node this collector records for.
    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    /// Whether `node` is evaluating somewhere up this collector's chain.
    pub fn is_evaluating(&self, node: NodeId) -> bool {
        self.inner.path.contains(&node)
    }

    /// Start a read of `source`: subscribe the evaluating node to it.
    ///
    /// Fails with [`Error::Cycle`] if `source` is one of the nodes currently
    /// evaluating on this chain.
    pub fn begin_read<S>(&self, source: &Arc<S>) -> Result<ReadTicket>
    where
        S: ReactiveSource + 'static,
    {
        let source_id = source.id();
        if self.is_evaluating(source_id) {
            return Err(Error::Cycle { node: source_id });
        }

        let weak: Weak<dyn ReactiveSource> = Arc::downgrade(source) as Weak<dyn ReactiveSource>;
        let already_tracked = self.inner.dependencies.contains(source_id);
        let subscription = if already_tracked || source.is_immutable() {
            None
        } else {
            source.add_observer(self.inner.observer.clone())
        };

        Ok(ReadTicket {
            source: weak,
            source_id,
            subscription,
            already_tracked,
        })
    }

    /// Complete a read: record the version served and fold in its side
    /// values.
    pub fn finish_read(&self, ticket: ReadTicket, version: Version, side_values: &SideValues) {
        if !side_values.is_empty() {
            let mut accumulated = self.inner.side_values.lock();
            *accumulated = accumulated.combine(side_values);
        }

        let ReadTicket {
            source,
            source_id,
            subscription,
            already_tracked,
        } = ticket;

        // A derived source can prove itself immutable while being read.
        let proven_immutable = source
            .upgrade()
            .is_some_and(|source| source.is_immutable());

        if already_tracked {
            self.inner.dependencies.check_existing(source_id, version);
        } else if subscription.is_some() && !proven_immutable {
            self.inner
                .dependencies
                .add_subscribed(source, source_id, version, subscription);
        }
    }

    /// Record an instantaneous read.
    pub fn record<S>(&self, source: &Arc<S>, version: Version, side_values: &SideValues) -> Result<()>
    where
        S: ReactiveSource + 'static,
    {
        let ticket = self.begin_read(source)?;
        self.finish_read(ticket, version, side_values);
        Ok(())
    }

    /// Read a blocking source and track it.
    pub fn get<T, S>(&self, source: &S) -> Result<T>
    where
        S: Source<T> + ?Sized,
    {
        source.get_value(Some(self)).map(|snapshot| snapshot.into_value())
    }

    /// Read a suspending source and track it.
    pub async fn get_async<T, S>(&self, source: &S, cancel: &CancellationToken) -> Result<T>
    where
        S: AsyncSource<T> + ?Sized,
    {
        let snapshot = source.get_value_async(Some(self), cancel).await?;
        Ok(snapshot.into_value())
    }

    /// Attach a diagnostic to the value being computed.
    pub fn report(&self, diagnostic: Diagnostic) {
        let mut accumulated = self.inner.side_values.lock();
        *accumulated = accumulated.combine(&diagnostic.into());
    }

    /// Number of dependencies recorded so far.
    pub fn dependency_count(&self) -> usize {
        self.inner.dependencies.len()
    }

    /// Reclaim what the evaluation recorded.
    ///
    /// Every clone handed to the derivation must be gone by now.
    pub(crate) fn finish(self) -> Result<Collected> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => Ok(Collected {
                dependencies: inner.dependencies,
                side_values: inner.side_values.into_inner(),
            }),
            Err(inner) => {
                let defect = Defect::CollectorEscaped { node: inner.node };
                report_defect(defect);
                Err(Error::Defect(defect))
            }
        }
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("node", &self.inner.node)
            .field("depth", &self.inner.path.len())
            .field("dependencies", &self.inner.dependencies.len())
            .finish()
    }
}
