//! Reactive Source contract.
//!
//! Every node exposes the untyped [`ReactiveSource`] surface used for
//! bookkeeping (identity, version, push registration) and one of the typed
//! pull surfaces: [`Source`] for the blocking profile, [`AsyncSource`] for
//! the suspending one, and [`CollectionSource`] for collection-shaped nodes
//! that also publish item-level deltas.

use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;

use super::cancel::CancellationToken;
use super::collector::Collector;
use super::observer::{CollectionObserver, Observer};
use super::subscriber::{NodeId, Subscription};
use crate::error::Result;
use crate::version::{Version, VersionedValue};

/// The bookkeeping surface shared by every node.
pub trait ReactiveSource: Send + Sync {
    fn id(&self) -> NodeId;

    /// Current version. Safe to read concurrently with writers.
    fn version(&self) -> Version;

    /// True only once the source is proven never to change again.
    fn is_immutable(&self) -> bool;

    /// Register for push notifications.
    ///
    /// Returns `None` for an immutable source; the caller should never
    /// revisit it.
    fn add_observer(&self, observer: Weak<dyn Observer>) -> Option<Subscription>;
}

/// Blocking pull surface.
pub trait Source<T>: ReactiveSource {
    /// Current snapshot, recomputing first if the node is dirty.
    ///
    /// With a collector, the read is recorded as a dependency of the node
    /// that collector belongs to.
    fn get_value(&self, collector: Option<&Collector>) -> Result<VersionedValue<T>>;
}

/// Suspending pull surface.
pub trait AsyncSource<T>: ReactiveSource {
    fn get_value_async<'a>(
        &'a self,
        collector: Option<&'a Collector>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<VersionedValue<T>>>;
}

/// Collection-shaped source publishing item deltas.
pub trait CollectionSource<T>: Source<Arc<Vec<T>>> {
    fn add_collection_observer(
        &self,
        observer: Weak<dyn CollectionObserver<T>>,
    ) -> Option<Subscription>;

    /// Non-owning handle to the underlying node, for dependency lists.
    fn weak_source(&self) -> Weak<dyn ReactiveSource>;
}

/// Serve a suspending request from a blocking source.
pub(crate) fn ready<'a, T, S>(
    source: &'a S,
    collector: Option<&'a Collector>,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<VersionedValue<T>>>
where
    T: Send + 'a,
    S: Source<T> + ?Sized,
{
    Box::pin(async move {
        cancel.check()?;
        source.get_value(collector)
    })
}

impl<S: ReactiveSource + ?Sized> ReactiveSource for Arc<S> {
    fn id(&self) -> NodeId {
        (**self).id()
    }

    fn version(&self) -> Version {
        (**self).version()
    }

    fn is_immutable(&self) -> bool {
        (**self).is_immutable()
    }

    fn add_observer(&self, observer: Weak<dyn Observer>) -> Option<Subscription> {
        (**self).add_observer(observer)
    }
}

impl<T, S: Source<T> + ?Sized> Source<T> for Arc<S> {
    fn get_value(&self, collector: Option<&Collector>) -> Result<VersionedValue<T>> {
        (**self).get_value(collector)
    }
}

impl<T, S: AsyncSource<T> + ?Sized> AsyncSource<T> for Arc<S> {
    fn get_value_async<'a>(
        &'a self,
        collector: Option<&'a Collector>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<VersionedValue<T>>> {
        (**self).get_value_async(collector, cancel)
    }
}
