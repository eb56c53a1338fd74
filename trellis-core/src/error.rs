//! Error types for the reactive engine.
//!
//! Two kinds of failure exist. Ordinary errors (a derivation failed, a
//! request was cancelled, a node read itself) are returned as [`Error`].
//! Defects are bugs in the code driving the graph; they are reported through
//! [`report_defect`], which asserts in debug builds and otherwise follows the
//! configured [`DefectPolicy`](crate::config::DefectPolicy).

use std::fmt;

use thiserror::Error;

use crate::config::{self, DefectPolicy};
use crate::reactive::NodeId;
use crate::version::Version;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by value requests.
#[derive(Debug, Error)]
pub enum Error {
    /// The node was asked for its value while it was already evaluating.
    #[error("cycle detected: node {node} was read during its own evaluation")]
    Cycle { node: NodeId },

    /// The request was cancelled through its cancellation token.
    #[error("evaluation cancelled")]
    Cancelled,

    /// A collection edit addressed an index past the end.
    #[error("index {index} out of bounds for collection of length {len}")]
    OutOfBounds { index: usize, len: usize },

    /// The derivation function failed.
    #[error("derivation failed: {0}")]
    Compute(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A defect was detected and the evaluation could not continue.
    #[error("reactive graph defect: {0}")]
    Defect(Defect),
}

impl Error {
    /// Wrap an arbitrary error raised by a derivation function.
    pub fn compute<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Compute(error.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Programming errors in graph bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Defect {
    /// A source was read twice within one evaluation at different versions.
    VersionMismatch {
        source: NodeId,
        recorded: Version,
        observed: Version,
    },

    /// A dependency was added to a list that was disabled after the node
    /// proved immutable.
    AddAfterDisable { source: NodeId },

    /// A collector outlived the evaluation that created it.
    CollectorEscaped { node: NodeId },
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionMismatch {
                source,
                recorded,
                observed,
            } => write!(
                f,
                "source {source} re-read at version {observed} after being recorded at {recorded}"
            ),
            Self::AddAfterDisable { source } => {
                write!(f, "dependency on {source} added to a disabled list")
            }
            Self::CollectorEscaped { node } => {
                write!(f, "collector for node {node} outlived its evaluation")
            }
        }
    }
}

/// Report a defect.
///
/// Debug builds always panic. Release builds either panic or log and carry
/// on, depending on [`config::current`]. The caller is expected to ignore the
/// offending operation when this returns.
#[track_caller]
pub(crate) fn report_defect(defect: Defect) {
    debug_assert!(false, "reactive graph defect: {defect}");

    match config::current().defect_policy {
        DefectPolicy::Panic => panic!("reactive graph defect: {defect}"),
        DefectPolicy::Log => tracing::error!(%defect, "reactive graph defect ignored"),
    }
}
