//! Per-item projection.

use std::fmt;
use std::sync::{Arc, Weak};

use super::{collection_handle, CollectionCore, CollectionNode, Continuity, Items};
use crate::compare::Value;
use crate::error::Result;
use crate::reactive::dependency::DependencyList;
use crate::reactive::observer::{Change, CollectionObserver, Delta, DeltaBatch, Notification, Observer};
use crate::reactive::source::{CollectionSource, ReactiveSource, Source};
use crate::reactive::state::Epoch;
use crate::reactive::subscriber::NodeId;
use crate::version::VersionedValue;

type Projection<T, U> = Box<dyn Fn(&T) -> U + Send + Sync>;

struct MapInner<T: Value, U: Value> {
    this: Weak<MapInner<T, U>>,
    upstream: Arc<dyn CollectionSource<T>>,
    project: Projection<T, U>,
    core: CollectionCore<U>,
}

impl<T: Value, U: Value> CollectionNode<U> for MapInner<T, U> {
    fn core(&self) -> &CollectionCore<U> {
        &self.core
    }

    fn recompute(&self, epoch: Epoch) -> Result<VersionedValue<Items<U>>> {
        let dependencies = DependencyList::new();
        let observer: Weak<dyn CollectionObserver<T>> = self.this.clone();

        // Subscribe before reading so no batch slips in between.
        let subscription = self.upstream.add_collection_observer(observer);
        let source = self.upstream.get_value(None)?;
        if subscription.is_some() {
            dependencies.add_subscribed(
                self.upstream.weak_source(),
                self.upstream.id(),
                source.version(),
                subscription,
            );
        }

        let items = source.value().iter().map(|item| (self.project)(item)).collect();
        Ok(self
            .core
            .publish_full(epoch, items, source.side_values().clone(), dependencies))
    }
}

impl<T: Value, U: Value> Observer for MapInner<T, U> {
    fn notify(&self, _notification: Notification) {
        self.core.invalidate();
    }
}

impl<T: Value, U: Value> CollectionObserver<T> for MapInner<T, U> {
    fn on_added(&self, change: Change, index: usize, item: &T) {
        self.on_batch(&DeltaBatch::new(
            change,
            [Delta::Added {
                index,
                item: item.clone(),
            }]
            .into_iter()
            .collect(),
        ));
    }

    fn on_removed(&self, change: Change, index: usize, item: &T) {
        self.on_batch(&DeltaBatch::new(
            change,
            [Delta::Removed {
                index,
                item: item.clone(),
            }]
            .into_iter()
            .collect(),
        ));
    }

    fn on_replaced(&self, change: Change, index: usize, old: &T, new: &T) {
        self.on_batch(&DeltaBatch::new(
            change,
            [Delta::Replaced {
                index,
                old: old.clone(),
                new: new.clone(),
            }]
            .into_iter()
            .collect(),
        ));
    }

    fn on_batch(&self, batch: &DeltaBatch<T>) {
        let Some(mut token) = self.core.begin_incremental() else {
            self.core.invalidate();
            return;
        };

        match self.core.advance(batch.change()) {
            Continuity::Advanced => {}
            Continuity::Seen => return token.release(),
            // Dropping the token invalidates.
            Continuity::Gap => return,
        }

        for delta in batch.deltas() {
            let applied = match delta {
                Delta::Added { index, item } => token.insert(*index, (self.project)(item)),
                Delta::Removed { index, .. } => token.remove(*index).map(drop),
                Delta::Replaced { index, new, .. } => {
                    token.replace(*index, (self.project)(new)).map(drop)
                }
            };
            if applied.is_err() {
                return;
            }
        }
        token.commit();
    }
}

/// A collection holding `project(item)` for every upstream item, in order.
///
/// While the node's own deltas are observed, upstream deltas are projected
/// one by one instead of re-projecting the whole collection.
pub struct MapCollection<T: Value, U: Value> {
    inner: Arc<MapInner<T, U>>,
}

impl<T: Value, U: Value> MapCollection<T, U> {
    pub fn new<S, F>(upstream: &S, project: F) -> Self
    where
        S: CollectionSource<T> + Clone + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let upstream: Arc<dyn CollectionSource<T>> = Arc::new(upstream.clone());
        let inner = Arc::new_cyclic(|this| MapInner {
            this: this.clone(),
            upstream,
            project: Box::new(project),
            core: CollectionCore::derived(),
        });
        Self { inner }
    }

    pub fn id(&self) -> NodeId {
        self.inner.core.id()
    }

    /// Current items, recomputing if necessary. Not tracked.
    pub fn items(&self) -> Result<Items<U>> {
        self.get_value(None).map(VersionedValue::into_value)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.core.is_dirty()
    }

    /// Number of full recomputations so far.
    pub fn evaluation_count(&self) -> usize {
        self.inner.core.evaluation_count()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.core.observer_count()
    }

    pub fn delta_observer_count(&self) -> usize {
        self.inner.core.delta_observer_count()
    }
}

collection_handle!(MapCollection, MapInner, <T, U>, U);

impl<T: Value, U: Value> fmt::Debug for MapCollection<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapCollection")
            .field("id", &self.inner.core.id())
            .field("upstream", &self.inner.upstream.id())
            .field("version", &self.inner.core.version())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
