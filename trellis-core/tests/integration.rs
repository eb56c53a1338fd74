//! Integration Tests for the Reactive Graph
//!
//! These tests drive inputs, derived nodes and collections together through
//! the public API only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use trellis_core::config::{DefectPolicy, RuntimeConfig, DEFECT_POLICY_ENV};
use trellis_core::reactive::{
    AsyncDerived, CallbackObserver, CancellationToken, Change, CollectionObserver, CollectionSource,
    Constant, Delta, DeltaBatch, Derived, FilterCollection, Input, InputList, MapCollection,
    NodeState, Notification, Observer, ReactiveSource, Source,
};
use trellis_core::{Diagnostic, Error, Version};

fn double(source: &Input<i32>, calls: &Arc<AtomicUsize>) -> Derived<i32> {
    let source = source.clone();
    let calls = calls.clone();
    Derived::new(move |cx| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(cx.get(&source)? * 2)
    })
}

/// The walkthrough: equal writes are invisible, real writes dirty the node.
#[test]
fn double_of_input_walkthrough() {
    let s = Input::new(1);
    assert_eq!(s.version(), Version::INITIAL);

    let calls = Arc::new(AtomicUsize::new(0));
    let n = double(&s, &calls);

    let first = n.get_value(None).unwrap();
    assert_eq!((*first.value(), first.version()), (2, Version::new(1)));

    s.set(1);
    assert!(!n.is_dirty());
    let same = n.get_value(None).unwrap();
    assert_eq!((*same.value(), same.version()), (2, Version::new(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    s.set(5);
    assert!(n.is_dirty());
    let changed = n.get_value(None).unwrap();
    assert_eq!((*changed.value(), changed.version()), (10, Version::new(2)));
}

/// Reading a clean node any number of times never re-runs the derivation.
#[test]
fn repeated_reads_are_idempotent() {
    let s = Input::new(3);
    let calls = Arc::new(AtomicUsize::new(0));
    let n = double(&s, &calls);

    let snapshots: Vec<_> = (0..5).map(|_| n.get_value(None).unwrap()).collect();
    assert!(snapshots
        .windows(2)
        .all(|pair| pair[0].version() == pair[1].version() && pair[0].value() == pair[1].value()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Invalidation reaches every transitive dependent, and only those.
#[test]
fn dirtiness_follows_the_changed_branch() {
    let x = Input::new(1);
    let y = Input::new(10);
    let x_calls = Arc::new(AtomicUsize::new(0));
    let y_calls = Arc::new(AtomicUsize::new(0));
    let dx = double(&x, &x_calls);
    let dy = double(&y, &y_calls);
    let total = {
        let (dx, dy) = (dx.clone(), dy.clone());
        Derived::new(move |cx| Ok(cx.get(&dx)? + cx.get(&dy)?))
    };

    assert_eq!(total.get().unwrap(), 22);

    x.set(2);
    assert_eq!(dx.state(), NodeState::Dirty);
    assert_eq!(total.state(), NodeState::Dirty);
    assert_eq!(dy.state(), NodeState::Clean);

    assert_eq!(total.get().unwrap(), 24);
    assert_eq!(x_calls.load(Ordering::SeqCst), 2);
    assert_eq!(y_calls.load(Ordering::SeqCst), 1);
}

/// A source the derivation stopped reading loses its subscription.
#[test]
fn unread_sources_are_pruned() {
    let use_a = Input::new(true);
    let a = Input::new(1);
    let b = Input::new(2);
    let pick = {
        let (use_a, a, b) = (use_a.clone(), a.clone(), b.clone());
        Derived::new(move |cx| if cx.get(&use_a)? { cx.get(&a) } else { cx.get(&b) })
    };

    assert_eq!(pick.get().unwrap(), 1);
    assert_eq!(a.observer_count(), 1);
    assert_eq!(b.observer_count(), 0);

    use_a.set(false);
    assert_eq!(pick.get().unwrap(), 2);
    assert_eq!(a.observer_count(), 0);
    assert_eq!(b.observer_count(), 1);
    assert!(!pick.depends_on(a.id()));

    // Writes to the pruned source no longer reach the node.
    a.set(100);
    assert!(!pick.is_dirty());
}

/// Versions never move backwards and move exactly once per real change.
#[test]
fn versions_are_monotonic() {
    let s = Input::new(0);
    let calls = Arc::new(AtomicUsize::new(0));
    let n = double(&s, &calls);

    let mut seen = vec![n.get_value(None).unwrap().version()];
    for value in [0, 1, 1, 2, 2, 2, 3] {
        s.set(value);
        seen.push(n.get_value(None).unwrap().version());
    }

    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(seen.last().copied(), Some(Version::new(4)));
}

/// Observers added from outside the graph are told about each change.
#[test]
fn external_observer_sees_forwarded_invalidations() {
    let s = Input::new(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let n = double(&s, &calls);

    let notified = Arc::new(Mutex::new(Vec::new()));
    let observer = {
        let notified = notified.clone();
        Arc::new(CallbackObserver::new(move |notification: Notification| {
            notified.lock().push(notification.source);
        }))
    };
    let _subscription = n
        .add_observer(Arc::downgrade(&observer) as Weak<dyn Observer>)
        .unwrap();

    n.get().unwrap();
    s.set(2);
    // Already dirty and not read since: not forwarded again.
    s.set(3);
    assert_eq!(*notified.lock(), vec![n.id()]);

    n.get().unwrap();
    s.set(4);
    assert_eq!(notified.lock().len(), 2);
}

/// Diagnostics travel with the values that produced them.
#[test]
fn side_values_accumulate_along_the_chain() {
    let s = Input::new(1);
    let n = {
        let s = s.clone();
        Derived::new(move |cx| {
            let value = cx.get(&s)?;
            if value > 3 {
                cx.report(Diagnostic::warning("large"));
            }
            Ok(value)
        })
    };

    assert!(n.get_value(None).unwrap().side_values().is_empty());

    s.set_with_side_values(5, Diagnostic::info("from input").into());
    let snapshot = n.get_value(None).unwrap();
    assert_eq!(snapshot.side_values().diagnostics().len(), 2);
    assert!(!snapshot.side_values().has_errors());
}

/// A node that only reads constants is proven immutable, transitively.
#[test]
fn constants_prove_immutability() {
    let base = Constant::new(4);
    let squared = {
        let base = base.clone();
        Derived::new(move |cx| {
            let value = cx.get(&base)?;
            Ok(value * value)
        })
    };
    let plus_one = {
        let squared = squared.clone();
        Derived::new(move |cx| Ok(cx.get(&squared)? + 1))
    };

    assert_eq!(plus_one.get().unwrap(), 17);
    assert!(squared.is_immutable());
    assert!(plus_one.is_immutable());
    assert_eq!(plus_one.dependency_count(), 0);
    assert_eq!(squared.observer_count(), 0);
}

/// A failing derivation publishes nothing and is retried on the next read.
#[test]
fn failure_is_retried() {
    let divisor = Input::new(2);
    let quotient = {
        let divisor = divisor.clone();
        Derived::new(move |cx| {
            let d = cx.get(&divisor)?;
            if d == 0 {
                return Err(Error::compute("division by zero"));
            }
            Ok(100 / d)
        })
    };

    assert_eq!(quotient.get().unwrap(), 50);
    divisor.set(0);
    assert!(matches!(quotient.get(), Err(Error::Compute(_))));
    assert!(matches!(quotient.get(), Err(Error::Compute(_))));
    assert!(quotient.is_dirty());
    assert_eq!(quotient.version(), Version::new(1));

    divisor.set(4);
    assert_eq!(quotient.get().unwrap(), 25);
    assert_eq!(quotient.version(), Version::new(2));
}

/// A node reading itself fails with a cycle instead of deadlocking.
#[test]
fn blocking_cycle_is_reported() {
    let slot: Arc<Mutex<Option<Derived<i32>>>> = Arc::new(Mutex::new(None));
    let looped = {
        let slot = slot.clone();
        Derived::new(move |cx| {
            let me = slot.lock().clone();
            match me {
                Some(me) => Ok(cx.get(&me)? + 1),
                None => Ok(0),
            }
        })
    };
    *slot.lock() = Some(looped.clone());

    let err = looped.get().unwrap_err();
    assert!(matches!(err, Error::Cycle { node } if node == looped.id()));
    assert!(!looped.has_value());
    slot.lock().take();
}

/// Two threads entering a two-node loop from opposite ends both fail.
#[test]
fn cycle_entered_from_two_threads_is_reported() {
    let started = Arc::new(Barrier::new(2));
    let entered = Arc::new(AtomicUsize::new(0));
    let a_slot: Arc<Mutex<Option<Derived<i32>>>> = Arc::new(Mutex::new(None));
    let b_slot: Arc<Mutex<Option<Derived<i32>>>> = Arc::new(Mutex::new(None));

    // Each node reads the other, after both first runs have started.
    let reading = |other: &Arc<Mutex<Option<Derived<i32>>>>| {
        let other = other.clone();
        let started = started.clone();
        let entered = entered.clone();
        Derived::new(move |cx| {
            if entered.fetch_add(1, Ordering::SeqCst) < 2 {
                started.wait();
            }
            let other = other.lock().clone();
            match other {
                Some(other) => Ok(cx.get(&other)? + 1),
                None => Ok(0),
            }
        })
    };
    let a = reading(&b_slot);
    let b = reading(&a_slot);
    *a_slot.lock() = Some(a.clone());
    *b_slot.lock() = Some(b.clone());

    let from_a = {
        let a = a.clone();
        std::thread::spawn(move || a.get())
    };
    let from_b = {
        let b = b.clone();
        std::thread::spawn(move || b.get())
    };

    assert!(matches!(from_a.join().unwrap(), Err(Error::Cycle { .. })));
    assert!(matches!(from_b.join().unwrap(), Err(Error::Cycle { .. })));
    assert!(!a.has_value());
    assert!(!b.has_value());
    a_slot.lock().take();
    b_slot.lock().take();
}

fn slow_double(source: &Input<i32>, calls: &Arc<AtomicUsize>, delay: Duration) -> AsyncDerived<i32> {
    let source = source.clone();
    let calls = calls.clone();
    AsyncDerived::new(move |cx, cancel| {
        let source = source.clone();
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(cx.get_async(&source, &cancel).await? * 2)
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_async_requests_share_one_evaluation() {
    let s = Input::new(21);
    let calls = Arc::new(AtomicUsize::new(0));
    let node = slow_double(&s, &calls, Duration::from_millis(30));

    let requests: Vec<_> = (0..16)
        .map(|_| {
            let node = node.clone();
            tokio::spawn(async move { node.get(&CancellationToken::new()).await })
        })
        .collect();
    for request in requests {
        assert_eq!(request.await.unwrap().unwrap(), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(node.version(), Version::new(1));

    s.set(1);
    let requests: Vec<_> = (0..4)
        .map(|_| {
            let node = node.clone();
            tokio::spawn(async move { node.get(&CancellationToken::new()).await })
        })
        .collect();
    for request in requests {
        assert_eq!(request.await.unwrap().unwrap(), 2);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_request_leaves_node_untouched() {
    let s = Input::new(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let node = slow_double(&s, &calls, Duration::from_millis(50));

    let cancel = CancellationToken::new();
    let timed_out = tokio::time::timeout(Duration::from_millis(5), node.get(&cancel)).await;
    assert!(timed_out.is_err());

    assert!(!node.has_value());
    assert!(node.is_dirty());
    assert_eq!(node.version(), Version::INITIAL);
    assert_eq!(node.dependency_count(), 0);

    // The permit went back with the dropped future.
    assert_eq!(node.get(&CancellationToken::new()).await.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_recompute_keeps_previous_snapshot() {
    let s = Input::new(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let node = slow_double(&s, &calls, Duration::from_millis(50));
    assert_eq!(node.get(&CancellationToken::new()).await.unwrap(), 2);

    s.set(2);
    let cancel = CancellationToken::new();
    let pending = {
        let (node, cancel) = (node.clone(), cancel.clone());
        tokio::spawn(async move { node.get(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(node.version(), Version::new(1));
    assert!(node.is_dirty());
    assert!(node.depends_on(s.id()));

    assert_eq!(node.get(&CancellationToken::new()).await.unwrap(), 4);
    assert_eq!(node.version(), Version::new(2));
}

#[tokio::test]
async fn async_cycle_is_reported() {
    let slot: Arc<Mutex<Option<AsyncDerived<i32>>>> = Arc::new(Mutex::new(None));
    let looped = {
        let slot = slot.clone();
        AsyncDerived::new(move |cx, cancel| {
            let me = slot.lock().clone();
            async move {
                match me {
                    Some(me) => Ok(cx.get_async(&me, &cancel).await? + 1),
                    None => Ok(0),
                }
            }
        })
    };
    *slot.lock() = Some(looped.clone());

    let err = looped.get(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Cycle { node } if node == looped.id()));
    slot.lock().take();
}

/// Reading its own node without the collector is still a cycle.
#[tokio::test]
async fn untracked_async_self_read_is_reported() {
    let slot: Arc<Mutex<Option<AsyncDerived<i32>>>> = Arc::new(Mutex::new(None));
    let looped = {
        let slot = slot.clone();
        AsyncDerived::new(move |_, cancel| {
            let me = slot.lock().clone();
            async move {
                match me {
                    Some(me) => Ok(me.get(&cancel).await? + 1),
                    None => Ok(0),
                }
            }
        })
    };
    *slot.lock() = Some(looped.clone());

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        looped.get(&CancellationToken::new()),
    )
    .await
    .expect("self read must not wait on its own evaluation");
    assert!(matches!(result, Err(Error::Cycle { node }) if node == looped.id()));
    assert!(looped.is_dirty());
    slot.lock().take();
}

#[tokio::test]
async fn async_nodes_read_blocking_nodes() {
    let s = Input::new(3);
    let calls = Arc::new(AtomicUsize::new(0));
    let doubled = double(&s, &calls);
    let plus_one = {
        let doubled = doubled.clone();
        AsyncDerived::new(move |cx, cancel| {
            let doubled = doubled.clone();
            async move { Ok(cx.get_async(&doubled, &cancel).await? + 1) }
        })
    };

    let cancel = CancellationToken::new();
    assert_eq!(plus_one.get(&cancel).await.unwrap(), 7);
    s.set(4);
    assert!(plus_one.is_dirty());
    assert_eq!(plus_one.get(&cancel).await.unwrap(), 9);
}

#[derive(Default)]
struct Batches {
    batches: Mutex<Vec<Vec<Delta<i32>>>>,
    resets: AtomicUsize,
}

impl Observer for Batches {
    fn notify(&self, _: Notification) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

impl CollectionObserver<i32> for Batches {
    fn on_added(&self, _: Change, _: usize, _: &i32) {}
    fn on_removed(&self, _: Change, _: usize, _: &i32) {}
    fn on_replaced(&self, _: Change, _: usize, _: &i32, _: &i32) {}

    fn on_batch(&self, batch: &DeltaBatch<i32>) {
        self.batches.lock().push(batch.deltas().to_vec());
    }
}

/// Several edits made under one token come out as one version and one batch.
#[test]
fn grouped_edits_collapse_into_one_version() {
    let list = InputList::new(vec![1, 2, 3]);
    let tripled = MapCollection::new(&list, |x: &i32| x * 3);
    let batches = Arc::new(Batches::default());
    let _subscription = tripled
        .add_collection_observer(Arc::downgrade(&batches) as Weak<dyn CollectionObserver<i32>>)
        .unwrap();
    let total = {
        let tripled = tripled.clone();
        Derived::new(move |cx| Ok(cx.get(&tripled)?.iter().sum::<i32>()))
    };
    assert_eq!(total.get().unwrap(), 18);

    let version = list
        .edit(|token| {
            token.remove(0)?;
            token.push(4);
            token.replace(0, 5)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(version, Version::new(1));

    assert_eq!(*tripled.items().unwrap(), vec![15, 9, 12]);
    assert_eq!(tripled.version(), Version::new(2));
    assert_eq!(tripled.evaluation_count(), 1);
    assert_eq!(
        *batches.batches.lock(),
        vec![vec![
            Delta::Removed { index: 0, item: 3 },
            Delta::Added { index: 2, item: 12 },
            Delta::Replaced {
                index: 0,
                old: 6,
                new: 15
            },
        ]]
    );
    assert_eq!(batches.resets.load(Ordering::SeqCst), 0);
    assert_eq!(total.get().unwrap(), 36);
}

/// Filtered output indices account for the items the predicate dropped.
#[test]
fn filter_translates_indices_through_a_chain() {
    let list = InputList::new(vec![1, 2, 3, 4, 5]);
    let odd = FilterCollection::new(&list, |x: &i32| x % 2 == 1);
    let negated = MapCollection::new(&odd, |x: &i32| -x);
    let batches = Arc::new(Batches::default());
    let _subscription = negated
        .add_collection_observer(Arc::downgrade(&batches) as Weak<dyn CollectionObserver<i32>>)
        .unwrap();

    assert_eq!(*negated.items().unwrap(), vec![-1, -3, -5]);

    // Positional diff: 2->7, 3->4, 4->5, then the trailing 5 is removed.
    list.set_all(vec![1, 7, 4, 5]);
    assert_eq!(*odd.items().unwrap(), vec![1, 7, 5]);
    assert_eq!(*negated.items().unwrap(), vec![-1, -7, -5]);
    assert_eq!(odd.evaluation_count(), 1);
    assert_eq!(negated.evaluation_count(), 1);
    assert_eq!(
        *batches.batches.lock(),
        vec![vec![
            Delta::Added { index: 1, item: -7 },
            Delta::Removed { index: 2, item: -3 },
            Delta::Added { index: 2, item: -5 },
            Delta::Removed { index: 3, item: -5 },
        ]]
    );
}

/// Without delta observers a collection just goes dirty and recomputes.
#[test]
fn unobserved_collections_recompute_lazily() {
    let list = InputList::new(vec![5, 6]);
    let kept = FilterCollection::new(&list, |x: &i32| *x > 5);

    assert_eq!(*kept.items().unwrap(), vec![6]);
    list.push(7);
    assert!(kept.is_dirty());
    assert_eq!(*kept.items().unwrap(), vec![6, 7]);
    assert_eq!(kept.evaluation_count(), 2);
}

#[test]
fn config_parses_from_json_and_lookup() {
    let config = RuntimeConfig::from_json_str(r#"{"trace_notifications": true}"#).unwrap();
    assert!(config.trace_notifications);
    assert_eq!(config.defect_policy, DefectPolicy::Log);

    let config = RuntimeConfig::from_lookup(|key| (key == DEFECT_POLICY_ENV).then(|| "panic".into()))
        .unwrap();
    assert_eq!(config.defect_policy, DefectPolicy::Panic);
}
