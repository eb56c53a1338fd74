//! Mutable leaf collection.

use std::fmt;
use std::sync::{Arc, Weak};

use super::{collection_handle, CollectionCore, CollectionNode, Items};
use crate::compare::Value;
use crate::error::Result;
use crate::reactive::source::ReactiveSource;
use crate::reactive::state::Epoch;
use crate::reactive::update::UpdateToken;
use crate::version::{Version, VersionedValue};

struct ListInner<T: Value> {
    core: CollectionCore<T>,
}

impl<T: Value> CollectionNode<T> for ListInner<T> {
    fn core(&self) -> &CollectionCore<T> {
        &self.core
    }

    fn recompute(&self, _epoch: Epoch) -> Result<VersionedValue<Items<T>>> {
        // A leaf is never stale.
        let items = self.core.items().unwrap_or_default();
        Ok(VersionedValue::new(items, self.core.version()))
    }
}

/// A list edited from outside the graph.
///
/// Every edit publishes one version and one delta batch. Use
/// [`edit`](InputList::edit) to group several edits under one version.
///
/// # Example
///
/// ```rust,ignore
/// let list = InputList::new(vec![1, 2, 3]);
/// list.push(4);
/// list.edit(|token| {
///     token.remove(0)?;
///     token.push(5);
///     Ok(())
/// })?;
/// assert_eq!(*list.items(), vec![2, 3, 4, 5]);
/// ```
pub struct InputList<T: Value> {
    inner: Arc<ListInner<T>>,
}

impl<T: Value> InputList<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            inner: Arc::new(ListInner {
                core: CollectionCore::leaf(items),
            }),
        }
    }

    /// Current items, without recording a dependency.
    pub fn items(&self) -> Items<T> {
        self.inner.core.items().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn push(&self, item: T) -> Version {
        let mut token = self.begin_update();
        token.push(item);
        token.commit()
    }

    pub fn insert(&self, index: usize, item: T) -> Result<Version> {
        let mut token = self.begin_update();
        token.insert(index, item)?;
        Ok(token.commit())
    }

    /// Remove the item at `index` and return it.
    pub fn remove(&self, index: usize) -> Result<T> {
        let mut token = self.begin_update();
        let item = token.remove(index)?;
        token.commit();
        Ok(item)
    }

    /// Replace the item at `index` and return the previous one.
    pub fn replace(&self, index: usize, item: T) -> Result<T> {
        let mut token = self.begin_update();
        let old = token.replace(index, item)?;
        token.commit();
        Ok(old)
    }

    /// Replace the whole list, publishing the smallest positional diff.
    pub fn set_all(&self, items: Vec<T>) -> Version {
        let mut token = self.begin_update();
        let common = token.len().min(items.len());
        let mut items = items.into_iter();

        for (index, item) in items.by_ref().take(common).enumerate() {
            token.overwrite(index, item);
        }
        while token.len() > common {
            token.pop();
        }
        for item in items {
            token.push(item);
        }
        token.commit()
    }

    /// Apply several edits as one version.
    ///
    /// If `edits` fails, nothing is published. The list stays locked while
    /// `edits` runs, so it must read the list through the token, never
    /// through `items` or `get_value`.
    pub fn edit<F>(&self, edits: F) -> Result<Version>
    where
        F: FnOnce(&mut UpdateToken<'_, T>) -> Result<()>,
    {
        let mut token = self.begin_update();
        edits(&mut token)?;
        Ok(token.commit())
    }

    /// Lock the list for a batch of edits.
    ///
    /// Until the token is committed or dropped, reading this list from the
    /// same thread blocks forever. Use [`UpdateToken::items`] instead.
    pub fn begin_update(&self) -> UpdateToken<'_, T> {
        self.inner.core.begin_update()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.core.observer_count()
    }

    pub fn delta_observer_count(&self) -> usize {
        self.inner.core.delta_observer_count()
    }

    pub fn downgrade(&self) -> Weak<dyn ReactiveSource> {
        let weak: Weak<ListInner<T>> = Arc::downgrade(&self.inner);
        weak
    }
}

collection_handle!(InputList, ListInner, <T>, T);

impl<T: Value + fmt::Debug> fmt::Debug for InputList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputList")
            .field("id", &self.inner.core.id())
            .field("version", &self.inner.core.version())
            .field("items", &self.items())
            .finish()
    }
}
