//! Evaluation Context
//!
//! Tracks which evaluations are running, so that a derivation that reads its
//! own node, directly or through other nodes, is reported as a cycle instead
//! of deadlocking on the node's lock.
//!
//! # Implementation
//!
//! Blocking evaluations use a thread-local stack of node ids. Entering an
//! evaluation pushes the node; the returned guard pops it when dropped, even
//! if the derivation panics. Nested evaluations (a derived node reading
//! another derived node) simply stack.
//!
//! The suspending profile cannot use a thread-local, since a task may resume
//! on another thread. Its stack is a task-local scoped around each
//! derivation future instead (see [`scope_async`]).
//!
//! Both stacks only see one thread or task. A cycle entered from two ends at
//! once (thread 1 evaluating A then reading B, thread 2 evaluating B then
//! reading A) is caught by the wait graph: before an evaluation blocks on
//! another node's lock it records the edge in a process-wide map, and refuses
//! to block if the node it waits for is already waiting, transitively, for
//! it. Only contended acquisitions touch the map.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::OnceLock;

use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};

use super::subscriber::NodeId;
use crate::error::{Error, Result};

type Path = SmallVec<[NodeId; 8]>;

thread_local! {
    static EVALUATING: RefCell<Path> = RefCell::new(SmallVec::new());
}

tokio::task_local! {
    static EVALUATING_ASYNC: Path;
}

/// Guard that pops the evaluation when dropped.
pub struct EvaluationGuard {
    node: NodeId,
}

impl EvaluationGuard {
    /// Enter the evaluation of `node` on this thread.
    ///
    /// Fails with [`Error::Cycle`] if `node` is already being evaluated
    /// further up the stack.
    pub fn enter(node: NodeId) -> Result<Self> {
        EVALUATING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&node) {
                return Err(Error::Cycle { node });
            }
            stack.push(node);
            Ok(Self { node })
        })
    }

    /// Check if any evaluation is active on this thread.
    pub fn is_active() -> bool {
        EVALUATING.with(|stack| !stack.borrow().is_empty())
    }

    /// The innermost evaluation on this thread, if any.
    pub fn current() -> Option<NodeId> {
        EVALUATING.with(|stack| stack.borrow().last().copied())
    }
}

impl Drop for EvaluationGuard {
    fn drop(&mut self) {
        EVALUATING.with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Guards are dropped in reverse order of creation.
            if let Some(node) = popped {
                debug_assert_eq!(
                    node, self.node,
                    "EvaluationGuard mismatch: expected {}, got {}",
                    self.node, node
                );
            }
        });
    }
}

/// Suspending evaluations enclosing the current task, outermost first.
pub(crate) fn async_path() -> Path {
    EVALUATING_ASYNC
        .try_with(|path| path.clone())
        .unwrap_or_default()
}

/// Run `future` as the evaluation of `node`, nested in `path`.
pub(crate) fn scope_async<F: Future>(
    mut path: Path,
    node: NodeId,
    future: F,
) -> impl Future<Output = F::Output> {
    path.push(node);
    EVALUATING_ASYNC.scope(path, future)
}

/// For each evaluating node, the nodes whose locks it is blocked on.
///
/// A suspending derivation can wait on several nodes at once.
#[derive(Default)]
struct WaitGraph {
    waits: HashMap<NodeId, SmallVec<[NodeId; 2]>>,
}

impl WaitGraph {
    fn global() -> &'static Mutex<WaitGraph> {
        static GRAPH: OnceLock<Mutex<WaitGraph>> = OnceLock::new();
        GRAPH.get_or_init(|| Mutex::new(WaitGraph::default()))
    }

    /// Whether `from` is blocked, through any chain of waits, on `to`.
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut pending: Path = smallvec![from];
        let mut seen: Path = SmallVec::new();
        while let Some(node) = pending.pop() {
            if node == to {
                return true;
            }
            if seen.contains(&node) {
                continue;
            }
            seen.push(node);
            if let Some(next) = self.waits.get(&node) {
                pending.extend(next.iter().copied());
            }
        }
        false
    }
}

/// An evaluation blocked on another node's lock.
///
/// The edge stays in the wait graph until the guard is dropped, which must
/// happen once the lock is acquired or the wait is abandoned.
#[must_use]
pub(crate) struct Wait {
    waiter: NodeId,
    target: NodeId,
}

impl Wait {
    /// Record that the evaluation of `waiter` is about to block on `target`.
    ///
    /// Fails with [`Error::Cycle`] if `target` is itself waiting on `waiter`,
    /// in which case neither could ever proceed.
    pub(crate) fn register(waiter: NodeId, target: NodeId) -> Result<Self> {
        let mut graph = WaitGraph::global().lock();
        if graph.reaches(target, waiter) {
            tracing::debug!(node = %target, waiter = %waiter, "cycle across evaluations");
            return Err(Error::Cycle { node: target });
        }
        graph.waits.entry(waiter).or_default().push(target);
        Ok(Self { waiter, target })
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        let mut graph = WaitGraph::global().lock();
        if let Some(targets) = graph.waits.get_mut(&self.waiter) {
            if let Some(position) = targets.iter().position(|t| *t == self.target) {
                targets.swap_remove(position);
            }
            if targets.is_empty() {
                graph.waits.remove(&self.waiter);
            }
        }
    }
}
