//! Dependency List
//!
//! Records which upstream sources the most recent evaluation of a node
//! actually read, at which version, together with the subscription that
//! keeps the node informed about each of them.
//!
//! The list is a value owned by exactly one node. While an evaluation runs,
//! reads may be recorded from several threads at once (a suspending
//! derivation can fan out), so [`add`](DependencyList::add) only needs `&self`
//! and appends with a compare-and-swap on the head pointer. Removing entries
//! needs `&mut self`, which is what makes traversal from `&self` safe.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Weak;

use smallvec::SmallVec;

use super::observer::Observer;
use super::source::ReactiveSource;
use super::subscriber::{NodeId, Subscription};
use crate::error::{report_defect, Defect};
use crate::version::Version;

/// One source read by the last evaluation.
pub struct Dependency {
    source: Weak<dyn ReactiveSource>,
    source_id: NodeId,
    version_at_read: AtomicU64,
    _subscription: Option<Subscription>,
}

impl Dependency {
    pub fn source_id(&self) -> NodeId {
        self.source_id
    }

    pub fn version_at_read(&self) -> Version {
        Version::new(self.version_at_read.load(Ordering::Acquire))
    }

    /// Whether the source has moved past the recorded version.
    ///
    /// A source that no longer exists can never change again.
    pub fn is_stale(&self) -> bool {
        self.source
            .upgrade()
            .map_or(false, |source| source.version() > self.version_at_read())
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("source", &self.source_id)
            .field("version_at_read", &self.version_at_read())
            .finish()
    }
}

struct Entry {
    dependency: Dependency,
    /// Written once before the entry is published.
    next: *mut Entry,
}

/// A node's record of sources read during its last evaluation.
pub struct DependencyList {
    head: AtomicPtr<Entry>,
    len: AtomicUsize,
    disabled: AtomicBool,
    _owns: PhantomData<Box<Entry>>,
}

// SAFETY: entries are only reachable through the list, only freed through
// `&mut self`, and their contents are `Send + Sync`.
unsafe impl Send for DependencyList {}
unsafe impl Sync for DependencyList {}

impl DependencyList {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            disabled: AtomicBool::new(false),
            _owns: PhantomData,
        }
    }

    /// Record a read of `source` at `version_at_read` and subscribe
    /// `observer` to it.
    ///
    /// Returns `true` if a new entry was appended. Nothing is recorded if the
    /// source is gone, already tracked, or immutable.
    pub fn add(
        &self,
        source: Weak<dyn ReactiveSource>,
        version_at_read: Version,
        observer: &Weak<dyn Observer>,
    ) -> bool {
        let Some(strong) = source.upgrade() else {
            return false;
        };
        let source_id = strong.id();

        if self.reject_disabled(source_id) || self.check_existing(source_id, version_at_read) {
            return false;
        }

        let subscription = strong.add_observer(observer.clone());
        if subscription.is_none() {
            // Immutable: never revisit.
            return false;
        }
        drop(strong);

        self.add_subscribed(source, source_id, version_at_read, subscription)
    }

    /// Record a read whose subscription the caller already made.
    pub fn add_subscribed(
        &self,
        source: Weak<dyn ReactiveSource>,
        source_id: NodeId,
        version_at_read: Version,
        subscription: Option<Subscription>,
    ) -> bool {
        if self.reject_disabled(source_id) {
            return false;
        }

        let entry = Box::into_raw(Box::new(Entry {
            dependency: Dependency {
                source,
                source_id,
                version_at_read: AtomicU64::new(version_at_read.get()),
                _subscription: subscription,
            },
            next: ptr::null_mut(),
        }));

        let mut seen = ptr::null_mut();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if self.scan_for(head, seen, source_id, version_at_read) {
                // Another thread recorded the same source first.
                // SAFETY: `entry` was never published.
                drop(unsafe { Box::from_raw(entry) });
                return false;
            }
            seen = head;

            // SAFETY: `entry` is not yet published, we are its only writer.
            unsafe { (*entry).next = head };
            match self
                .head
                .compare_exchange_weak(head, entry, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// If `source` is already tracked, check the re-read version. Returns
    /// whether the source was found.
    pub fn check_existing(&self, source: NodeId, version: Version) -> bool {
        let head = self.head.load(Ordering::Acquire);
        self.scan_for(head, ptr::null_mut(), source, version)
    }

    /// Drop every subscription and empty the list.
    pub fn clear(&mut self) {
        let mut cursor = std::mem::replace(self.head.get_mut(), ptr::null_mut());
        while !cursor.is_null() {
            // SAFETY: `&mut self` guarantees no traversal is in progress and
            // every entry was allocated by `add_subscribed`.
            let entry = unsafe { Box::from_raw(cursor) };
            cursor = entry.next;
        }
        *self.len.get_mut() = 0;
    }

    /// Whether any tracked source has moved past the version it was read at.
    pub fn is_dirty(&self) -> bool {
        let mut dirty = false;
        self.for_each(|dependency| dirty = dirty || dependency.is_stale());
        dirty
    }

    /// Move the recorded version of `source` from `from` to `to`.
    ///
    /// Used after a delta batch covering exactly that step has been applied.
    /// Returns `false` if the source is not tracked or was recorded at a
    /// different version.
    pub fn advance(&self, source: NodeId, from: Version, to: Version) -> bool {
        let mut advanced = false;
        self.for_each(|dependency| {
            if dependency.source_id == source {
                advanced = dependency
                    .version_at_read
                    .compare_exchange(from.get(), to.get(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
            }
        });
        advanced
    }

    /// Version `source` was recorded at, if it is tracked.
    pub fn version_of(&self, source: NodeId) -> Option<Version> {
        let mut version = None;
        self.for_each(|dependency| {
            if dependency.source_id == source {
                version = Some(dependency.version_at_read());
            }
        });
        version
    }

    /// Permanently refuse new entries. Used once a node proved immutable.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, source: NodeId) -> bool {
        let mut found = false;
        self.for_each(|dependency| found = found || dependency.source_id == source);
        found
    }

    /// Tracked source ids, most recently added first.
    pub fn sources(&self) -> SmallVec<[NodeId; 8]> {
        let mut ids = SmallVec::new();
        self.for_each(|dependency| ids.push(dependency.source_id));
        ids
    }

    fn reject_disabled(&self, source: NodeId) -> bool {
        if self.is_disabled() {
            report_defect(Defect::AddAfterDisable { source });
            return true;
        }
        false
    }

    /// Walk from `from` until `until`, looking for `source`. A hit at a
    /// different version is a defect: the first recorded version is kept.
    fn scan_for(&self, from: *mut Entry, until: *mut Entry, source: NodeId, version: Version) -> bool {
        let mut cursor = from;
        while !cursor.is_null() && cursor != until {
            // SAFETY: published entries live until `clear` or drop, both of
            // which need `&mut self`.
            let entry = unsafe { &*cursor };
            if entry.dependency.source_id == source {
                let recorded = entry.dependency.version_at_read();
                if recorded != version {
                    report_defect(Defect::VersionMismatch {
                        source,
                        recorded,
                        observed: version,
                    });
                }
                return true;
            }
            cursor = entry.next;
        }
        false
    }

    fn for_each(&self, mut f: impl FnMut(&Dependency)) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: see `scan_for`.
            let entry = unsafe { &*cursor };
            f(&entry.dependency);
            cursor = entry.next;
        }
    }
}

impl Default for DependencyList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DependencyList {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for DependencyList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        self.for_each(|dependency| {
            list.entry(dependency);
        });
        list.finish()
    }
}
