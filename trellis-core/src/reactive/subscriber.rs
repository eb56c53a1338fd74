//! Subscriber bookkeeping for the reactive system.
//!
//! Every source keeps a [`SubscriberList`] of the observers that asked to
//! be told about changes. The list never owns an observer: each entry holds a
//! `Weak` reference, and the observer side holds a [`Subscription`] that
//! revokes the entry when dropped.
//!
//! # Implementation
//!
//! The list is a singly linked chain of slots. New slots are pushed at the
//! head with a compare-and-swap, so many dependents on many threads can
//! subscribe without a shared lock. Revoked slots are not unlinked; they are
//! marked free and reused by the next subscriber. Slots are only released
//! when the list itself is dropped, which makes traversal safe without any
//! reclamation scheme.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Unique identifier for a node in the reactive graph.
///
/// Each source or derived node gets a unique ID when created. The ID is used
/// to de-duplicate dependencies and to detect cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Occupant<O: ?Sized> {
    generation: u64,
    observer: Weak<O>,
}

struct Slot<O: ?Sized> {
    /// Written once before the slot is published, never changed after.
    next: AtomicPtr<Slot<O>>,
    occupied: AtomicBool,
    occupant: Mutex<Option<Occupant<O>>>,
}

impl<O: ?Sized> Slot<O> {
    fn release(&self, generation: u64) {
        let mut occupant = self.occupant.lock();
        if occupant.as_ref().map(|o| o.generation) == Some(generation) {
            *occupant = None;
            self.occupied.store(false, Ordering::Release);
        }
    }
}

trait Revoke: Send + Sync {
    fn revoke(&self, generation: u64);
    fn is_held(&self, generation: u64) -> bool;
}

impl<O: ?Sized + Send + Sync> Revoke for Slot<O> {
    fn revoke(&self, generation: u64) {
        self.release(generation);
    }

    fn is_held(&self, generation: u64) -> bool {
        self.occupant.lock().as_ref().map(|o| o.generation) == Some(generation)
    }
}

/// A revocable registration of an observer on a source.
///
/// Dropping the subscription unsubscribes. A subscription may outlive the
/// source it was taken on; revoking it then does nothing.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    slot: Arc<dyn Revoke>,
    generation: u64,
}

impl Subscription {
    /// Whether the registration is still in place.
    pub fn is_active(&self) -> bool {
        self.slot.is_held(self.generation)
    }

    /// Unsubscribe now. Same as dropping.
    pub fn revoke(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.revoke(self.generation);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("generation", &self.generation)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Lock-free list of weakly held observers.
pub struct SubscriberList<O: ?Sized + Send + Sync + 'static> {
    head: AtomicPtr<Slot<O>>,
    generations: AtomicU64,
    _owns: PhantomData<Arc<Slot<O>>>,
}

impl<O: ?Sized + Send + Sync + 'static> SubscriberList<O> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            generations: AtomicU64::new(0),
            _owns: PhantomData,
        }
    }

    /// Register an observer.
    pub fn subscribe(&self, observer: Weak<O>) -> Subscription {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        // Reuse a revoked slot if there is one.
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: published slots stay alive until the list is dropped,
            // and we hold `&self`.
            let slot = unsafe { &*cursor };
            if slot
                .occupied
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                *slot.occupant.lock() = Some(Occupant {
                    generation,
                    observer,
                });
                // SAFETY: the list owns one strong count for `cursor`; we add
                // another one for the subscription.
                let slot: Arc<Slot<O>> = unsafe {
                    Arc::increment_strong_count(cursor);
                    Arc::from_raw(cursor)
                };
                return Subscription { slot, generation };
            }
            cursor = slot.next.load(Ordering::Acquire);
        }

        let slot = Arc::new(Slot {
            next: AtomicPtr::new(ptr::null_mut()),
            occupied: AtomicBool::new(true),
            occupant: Mutex::new(Some(Occupant {
                generation,
                observer,
            })),
        });
        let handle = Arc::clone(&slot);
        let raw = Arc::into_raw(slot) as *mut Slot<O>;

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `raw` is not yet published, we are its only writer.
            unsafe { (*raw).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        Subscription {
            slot: handle,
            generation,
        }
    }

    /// Upgrade every live observer.
    ///
    /// Entries whose observer was dropped without revoking are freed on the
    /// way.
    pub fn snapshot(&self) -> SmallVec<[Arc<O>; 4]> {
        let mut live = SmallVec::new();
        self.for_each_slot(|slot| {
            if !slot.occupied.load(Ordering::Acquire) {
                return;
            }
            let mut occupant = slot.occupant.lock();
            let upgraded = occupant.as_ref().map(|o| o.observer.upgrade());
            match upgraded {
                Some(Some(observer)) => live.push(observer),
                Some(None) => {
                    tracing::warn!("skipping observer dropped without unsubscribing");
                    *occupant = None;
                    slot.occupied.store(false, Ordering::Release);
                }
                None => {}
            }
        });
        live
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.for_each_slot(|slot| {
            if slot.occupied.load(Ordering::Acquire) {
                count += 1;
            }
        });
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of allocated slots, occupied or not.
    pub fn capacity(&self) -> usize {
        let mut count = 0;
        self.for_each_slot(|_| count += 1);
        count
    }

    fn for_each_slot(&self, mut f: impl FnMut(&Slot<O>)) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: see `subscribe`.
            let slot = unsafe { &*cursor };
            f(slot);
            cursor = slot.next.load(Ordering::Acquire);
        }
    }
}

impl<O: ?Sized + Send + Sync + 'static> Default for SubscriberList<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: ?Sized + Send + Sync + 'static> Drop for SubscriberList<O> {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // SAFETY: every published slot carries one strong count owned by
            // the list. `&mut self` rules out concurrent traversal.
            let slot = unsafe { Arc::from_raw(cursor) };
            cursor = slot.next.load(Ordering::Acquire);
        }
    }
}

impl<O: ?Sized + Send + Sync + 'static> fmt::Debug for SubscriberList<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberList")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
