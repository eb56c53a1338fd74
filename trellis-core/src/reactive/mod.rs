//! Reactive Primitives
//!
//! This module implements the reactive graph: versioned sources, derived
//! nodes, and the dependency bookkeeping that connects them.
//!
//! # Concepts
//!
//! ## Sources
//!
//! A source is anything that can be read and observed. Every source has a
//! monotonically increasing [`Version`](crate::Version) that moves whenever
//! its observable value changes. [`Input`] is the mutable leaf; [`Constant`]
//! never changes and is never subscribed to.
//!
//! ## Derived nodes
//!
//! A [`Derived`] caches the result of a derivation. While the derivation
//! runs it reads other sources through a [`Collector`], which records each
//! read together with the version it saw and subscribes the node to the
//! source. A successful evaluation replaces the old dependency list with the
//! new one, so sources that are no longer read are unsubscribed.
//!
//! [`AsyncDerived`] is the suspending variant. Concurrent readers of a dirty
//! node share one evaluation, and a reader can give up through a
//! [`CancellationToken`] without corrupting the node.
//!
//! ## Collections
//!
//! [`InputList`], [`MapCollection`] and [`FilterCollection`] publish a list
//! snapshot plus item-level deltas, so chains of operators can be patched in
//! place instead of recomputed.
//!
//! # Implementation Notes
//!
//! Invalidation is pushed: when a source moves, every observer is marked
//! dirty, transitively. Values are pulled: a dirty node only recomputes when
//! it is read. A dirty node always re-runs its derivation, even if every
//! source it read kept its version, so that it picks up their current side
//! values. What stops the ripple is the comparer: a result judged equal
//! keeps the node's version, and nodes reading it see no change.

mod cancel;
mod collection;
mod collector;
mod context;
mod dependency;
mod derived;
mod input;
mod observer;
mod source;
mod state;
mod subscriber;
mod suspend;
mod update;

pub use cancel::CancellationToken;
pub use collection::{FilterCollection, InputList, Items, MapCollection};
pub use collector::{Collector, ReadTicket};
pub use context::EvaluationGuard;
pub use dependency::{Dependency, DependencyList};
pub use derived::Derived;
pub use input::{Constant, Input};
pub use observer::{
    CallbackObserver, Change, CollectionObserver, Delta, DeltaBatch, Notification, Observer,
};
pub use source::{AsyncSource, CollectionSource, ReactiveSource, Source};
pub use state::NodeState;
pub use subscriber::{NodeId, SubscriberList, Subscription};
pub use suspend::AsyncDerived;
pub use update::UpdateToken;
