//! Predicate filter.
//!
//! The node remembers, for every upstream item, whether it was kept. That is
//! enough to translate an upstream index into an output index: it is the
//! number of kept items before it.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{collection_handle, CollectionCore, CollectionNode, Continuity, Items};
use crate::compare::Value;
use crate::error::{Error, Result};
use crate::reactive::dependency::DependencyList;
use crate::reactive::observer::{Change, CollectionObserver, Delta, DeltaBatch, Notification, Observer};
use crate::reactive::source::{CollectionSource, ReactiveSource, Source};
use crate::reactive::state::Epoch;
use crate::reactive::subscriber::NodeId;
use crate::reactive::update::UpdateToken;
use crate::version::VersionedValue;

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct FilterInner<T: Value> {
    this: Weak<FilterInner<T>>,
    upstream: Arc<dyn CollectionSource<T>>,
    predicate: Predicate<T>,
    /// One flag per upstream item. Only touched with the publish lock held.
    kept: Mutex<Vec<bool>>,
    core: CollectionCore<T>,
}

fn output_index(kept: &[bool], index: usize) -> usize {
    kept[..index].iter().filter(|kept| **kept).count()
}

impl<T: Value> FilterInner<T> {
    fn apply(&self, token: &mut UpdateToken<'_, T>, kept: &mut Vec<bool>, delta: &Delta<T>) -> Result<()> {
        let len = kept.len();
        let out_of_bounds = |index: usize| Error::OutOfBounds { index, len };

        match delta {
            Delta::Added { index, item } => {
                if *index > len {
                    return Err(out_of_bounds(*index));
                }
                let keep = (self.predicate)(item);
                let at = output_index(kept, *index);
                kept.insert(*index, keep);
                if keep {
                    token.insert(at, item.clone())?;
                }
            }
            Delta::Removed { index, .. } => {
                if *index >= len {
                    return Err(out_of_bounds(*index));
                }
                let at = output_index(kept, *index);
                if kept.remove(*index) {
                    token.remove(at)?;
                }
            }
            Delta::Replaced { index, new, .. } => {
                if *index >= len {
                    return Err(out_of_bounds(*index));
                }
                let at = output_index(kept, *index);
                let keep = (self.predicate)(new);
                match (kept[*index], keep) {
                    (true, true) => {
                        token.replace(at, new.clone())?;
                    }
                    (true, false) => {
                        token.remove(at)?;
                    }
                    (false, true) => token.insert(at, new.clone())?,
                    (false, false) => {}
                }
                kept[*index] = keep;
            }
        }
        Ok(())
    }
}

impl<T: Value> CollectionNode<T> for FilterInner<T> {
    fn core(&self) -> &CollectionCore<T> {
        &self.core
    }

    fn recompute(&self, epoch: Epoch) -> Result<VersionedValue<Items<T>>> {
        let dependencies = DependencyList::new();
        let observer: Weak<dyn CollectionObserver<T>> = self.this.clone();

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

        let mut kept = self.kept.lock();
        kept.clear();
        let mut items = Vec::new();
        for item in source.value().iter() {
            let keep = (self.predicate)(item);
            kept.push(keep);
            if keep {
                items.push(item.clone());
            }
        }
        drop(kept);

        Ok(self
            .core
            .publish_full(epoch, items, source.side_values().clone(), dependencies))
    }
}

impl<T: Value> Observer for FilterInner<T> {
    fn notify(&self, _notification: Notification) {
        self.core.invalidate();
    }
}

impl<T: Value> CollectionObserver<T> for FilterInner<T> {
    fn on_added(&self, change: Change, index: usize, item: &T) {
        let delta = Delta::Added {
            index,
            item: item.clone(),
        };
        self.on_batch(&DeltaBatch::new(change, [delta].into_iter().collect()));
    }

    fn on_removed(&self, change: Change, index: usize, item: &T) {
        let delta = Delta::Removed {
            index,
            item: item.clone(),
        };
        self.on_batch(&DeltaBatch::new(change, [delta].into_iter().collect()));
    }

    fn on_replaced(&self, change: Change, index: usize, old: &T, new: &T) {
        let delta = Delta::Replaced {
            index,
            old: old.clone(),
            new: new.clone(),
        };
        self.on_batch(&DeltaBatch::new(change, [delta].into_iter().collect()));
    }

    fn on_batch(&self, batch: &DeltaBatch<T>) {
        let Some(mut token) = self.core.begin_incremental() else {
            self.core.invalidate();
            return;
        };

        match self.core.advance(batch.change()) {
            Continuity::Advanced => {}
            Continuity::Seen => return token.release(),
            Continuity::Gap => return,
        }

        let mut kept = self.kept.lock();
        for delta in batch.deltas() {
            if let Err(error) = self.apply(&mut token, &mut kept, delta) {
                tracing::debug!(node = %self.core.id(), %error, "delta did not apply, invalidating");
                return;
            }
        }
        drop(kept);
        token.commit();
    }
}

/// A collection holding the upstream items that match a predicate, in order.
pub struct FilterCollection<T: Value> {
    inner: Arc<FilterInner<T>>,
}

impl<T: Value> FilterCollection<T> {
    pub fn new<S, F>(upstream: &S, predicate: F) -> Self
    where
        S: CollectionSource<T> + Clone + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let upstream: Arc<dyn CollectionSource<T>> = Arc::new(upstream.clone());
        let inner = Arc::new_cyclic(|this| FilterInner {
            this: this.clone(),
            upstream,
            predicate: Box::new(predicate),
            kept: Mutex::new(Vec::new()),
            core: CollectionCore::derived(),
        });
        Self { inner }
    }

    pub fn id(&self) -> NodeId {
        self.inner.core.id()
    }

    /// Current items, recomputing if necessary. Not tracked.
    pub fn items(&self) -> Result<Items<T>> {
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

collection_handle!(FilterCollection, FilterInner, <T>, T);

impl<T: Value> fmt::Debug for FilterCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterCollection")
            .field("id", &self.inner.core.id())
            .field("upstream", &self.inner.upstream.id())
            .field("version", &self.inner.core.version())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
