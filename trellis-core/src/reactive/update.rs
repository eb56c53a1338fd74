//! Incremental Update Token
//!
//! An [`UpdateToken`] batches item-level edits to a collection node into a
//! single version bump. It is obtained by locking the node's publish lock,
//! so while it is held nobody else can recompute or publish that node.
//!
//! Committing applies every edit as one new snapshot and delivers one
//! [`DeltaBatch`] to the node's delta observers. Dropping the token without
//! committing discards the edits; a derived collection is then invalidated
//! so the next read recomputes it from scratch.
//!
//! The token borrows lock guards and is not `Send`. It must not be held
//! across an `.await`.

use std::fmt;
use std::mem;

use parking_lot::MutexGuard;
use smallvec::SmallVec;

use super::collection::{CollectionCore, CollectionState};
use super::observer::{Change, Delta, DeltaBatch};
use crate::compare::Value;
use crate::error::{Error, Result};
use crate::version::Version;

/// Scoped batch of edits to one collection node.
#[must_use = "dropping an update token discards its edits"]
pub struct UpdateToken<'a, T: Value> {
    core: &'a CollectionCore<T>,
    _publish: MutexGuard<'a, ()>,
    state: Option<MutexGuard<'a, CollectionState<T>>>,
    triggered_by: Version,
    working: Option<Vec<T>>,
    deltas: SmallVec<[Delta<T>; 4]>,
    finished: bool,
}

impl<'a, T: Value> UpdateToken<'a, T> {
    pub(crate) fn new(
        core: &'a CollectionCore<T>,
        publish: MutexGuard<'a, ()>,
        state: MutexGuard<'a, CollectionState<T>>,
    ) -> Self {
        Self {
            core,
            _publish: publish,
            triggered_by: core.version(),
            state: Some(state),
            working: None,
            deltas: SmallVec::new(),
            finished: false,
        }
    }

    /// Version of the node when the token was taken.
    pub fn triggered_by(&self) -> Version {
        self.triggered_by
    }

    /// Items as they will be published, pending edits included.
    pub fn items(&self) -> &[T] {
        if let Some(working) = &self.working {
            return working;
        }
        self.state
            .as_ref()
            .and_then(|state| state.items.as_deref())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Edits recorded so far.
    pub fn deltas(&self) -> &[Delta<T>] {
        &self.deltas
    }

    pub fn push(&mut self, item: T) {
        let index = self.len();
        self.working().push(item.clone());
        self.deltas.push(Delta::Added { index, item });
    }

    pub fn insert(&mut self, index: usize, item: T) -> Result<()> {
        let len = self.len();
        if index > len {
            return Err(Error::OutOfBounds { index, len });
        }
        self.working().insert(index, item.clone());
        self.deltas.push(Delta::Added { index, item });
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<T> {
        let len = self.len();
        if index >= len {
            return Err(Error::OutOfBounds { index, len });
        }
        let item = self.working().remove(index);
        self.deltas.push(Delta::Removed {
            index,
            item: item.clone(),
        });
        Ok(item)
    }

    /// Remove the last item, if any.
    pub fn pop(&mut self) -> Option<T> {
        let index = self.len().checked_sub(1)?;
        let item = self.working().remove(index);
        self.deltas.push(Delta::Removed {
            index,
            item: item.clone(),
        });
        Some(item)
    }

    /// Replace the item at `index`, returning the previous one.
    ///
    /// Replacing an item with one judged the same records nothing.
    pub fn replace(&mut self, index: usize, item: T) -> Result<T> {
        let len = self.len();
        if index >= len {
            return Err(Error::OutOfBounds { index, len });
        }
        Ok(self.overwrite(index, item))
    }

    /// [`replace`](Self::replace) for an index the caller knows is in range.
    pub(crate) fn overwrite(&mut self, index: usize, item: T) -> T {
        debug_assert!(index < self.len());
        if self.items()[index].same(&item) {
            return item;
        }
        let old = mem::replace(&mut self.working()[index], item.clone());
        self.deltas.push(Delta::Replaced {
            index,
            old: old.clone(),
            new: item,
        });
        old
    }

    /// Publish the edits as one version and one delta batch.
    ///
    /// Returns the version the node is at afterwards. A token without edits
    /// publishes nothing.
    pub fn commit(mut self) -> Version {
        self.finished = true;
        let Some(mut state) = self.state.take() else {
            return self.triggered_by;
        };
        if self.deltas.is_empty() {
            return self.core.version();
        }

        let previous = self.core.version();
        let version = previous.next();
        let items = self.working.take().unwrap_or_default();
        state.items = Some(items.into());
        self.core.store_version(version);
        drop(state);

        let batch = DeltaBatch::new(
            Change {
                source: self.core.id(),
                previous,
                version,
            },
            mem::take(&mut self.deltas),
        );
        tracing::trace!(
            node = %self.core.id(),
            %version,
            deltas = batch.len(),
            "committed incremental update"
        );
        self.core.deliver_batch(&batch);
        version
    }

    /// Give the token up without publishing or invalidating.
    pub(crate) fn release(mut self) {
        self.finished = true;
    }

    fn working(&mut self) -> &mut Vec<T> {
        let state = &self.state;
        self.working.get_or_insert_with(|| {
            state
                .as_ref()
                .and_then(|state| state.items.as_deref())
                .cloned()
                .unwrap_or_default()
        })
    }
}

impl<T: Value> Drop for UpdateToken<'_, T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        drop(self.state.take());
        if !self.deltas.is_empty() || self.core.is_derived() {
            tracing::debug!(
                node = %self.core.id(),
                discarded = self.deltas.len(),
                "update token dropped without commit"
            );
        }
        if self.core.is_derived() {
            self.core.invalidate();
        }
    }
}

impl<T: Value> fmt::Debug for UpdateToken<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateToken")
            .field("node", &self.core.id())
            .field("triggered_by", &self.triggered_by)
            .field("pending", &self.deltas.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::reactive::{Delta, InputList, ReactiveSource};
    use crate::version::Version;

    #[test]
    fn edits_apply_in_order() {
        let list = InputList::new(vec![1, 2, 3]);
        let mut token = list.begin_update();

        token.push(4);
        token.insert(0, 0).unwrap();
        assert_eq!(token.remove(2).unwrap(), 2);
        assert_eq!(token.replace(0, 10).unwrap(), 0);

        assert_eq!(token.items(), &[10, 1, 3, 4]);
        assert_eq!(token.deltas().len(), 4);
        assert_eq!(token.triggered_by(), Version::INITIAL);
        assert_eq!(token.commit(), Version::new(1));

        assert_eq!(*list.items(), vec![10, 1, 3, 4]);
    }

    #[test]
    fn out_of_bounds_edits_are_rejected() {
        let list = InputList::new(vec![1]);
        let mut token = list.begin_update();

        assert!(matches!(
            token.insert(5, 0),
            Err(Error::OutOfBounds { index: 5, len: 1 })
        ));
        assert!(token.remove(1).is_err());
        assert!(token.deltas().is_empty());
    }

    #[test]
    fn replacing_with_same_item_records_nothing() {
        let list = InputList::new(vec![7]);
        let mut token = list.begin_update();

        assert_eq!(token.replace(0, 7).unwrap(), 7);
        assert!(token.deltas().is_empty());
        assert_eq!(token.commit(), Version::INITIAL);
    }

    #[test]
    fn pop_removes_from_the_end() {
        let list = InputList::new(vec![1, 2]);
        let mut token = list.begin_update();

        assert_eq!(token.pop(), Some(2));
        assert_eq!(token.pop(), Some(1));
        assert_eq!(token.pop(), None);
        assert!(matches!(token.deltas()[1], Delta::Removed { index: 0, item: 1 }));
        assert_eq!(token.commit(), Version::new(1));
        assert!(list.is_empty());
    }

    #[test]
    fn dropping_discards_edits() {
        let list = InputList::new(vec![1, 2]);
        {
            let mut token = list.begin_update();
            token.push(3);
            assert!(matches!(token.deltas()[0], Delta::Added { index: 2, item: 3 }));
        }
        assert_eq!(*list.items(), vec![1, 2]);
        assert_eq!(list.version(), Version::INITIAL);
    }
}
