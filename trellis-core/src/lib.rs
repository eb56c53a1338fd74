//! Trellis Core
//!
//! This crate provides an incremental, push/pull hybrid reactive computation
//! engine. It implements:
//!
//! - Versioned, observable sources (inputs, constants, collections)
//! - Memoized derived nodes with a blocking evaluation path
//! - Suspending derived nodes with single-flight coordination and
//!   cooperative cancellation
//! - Collection operators that propagate item-level deltas
//!
//! Invalidation is pushed eagerly from a changed input to every node that
//! transitively read it. Recomputation is pulled lazily: a node only runs its
//! derivation when somebody asks for its value.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `version`: Versions, snapshots and side values
//! - `compare`: Pluggable equality used to decide whether a version bumps
//! - `reactive`: Sources, observers, dependency tracking and operators
//! - `config`: Runtime configuration
//! - `error`: Error types
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::reactive::{Derived, Input, Source};
//!
//! let count = Input::new(1);
//!
//! let doubled = {
//!     let count = count.clone();
//!     Derived::new(move |cx| Ok(cx.get(&count)? * 2))
//! };
//!
//! assert_eq!(doubled.get_value(None)?.into_value(), 2);
//!
//! count.set(5);
//! assert!(doubled.is_dirty());
//! assert_eq!(doubled.get_value(None)?.into_value(), 10);
//! ```

pub mod compare;
pub mod config;
pub mod error;
pub mod reactive;
pub mod version;

pub use compare::{Comparer, Identity, Structural, Value, ValueComparer};
pub use error::{Defect, Error, Result};
pub use version::{Diagnostic, Severity, SideValues, Version, VersionedValue};
