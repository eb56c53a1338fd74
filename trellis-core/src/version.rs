//! Versions and Snapshots
//!
//! Every node carries a [`Version`]: a counter that moves forward by exactly
//! one whenever the node's value changes. Readers receive immutable
//! [`VersionedValue`] snapshots pairing a value with the version it was
//! published at and the [`SideValues`] accumulated along the way.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

/// Monotonic per-node version. `0` means "never evaluated".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    pub const INITIAL: Version = Version(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }

    /// The version following this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A message produced alongside a computed value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: Arc<str>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<Arc<str>>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<Arc<str>>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn warning(message: impl Into<Arc<str>>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<Arc<str>>) -> Self {
        Self::new(Severity::Error, message)
    }
}

/// Auxiliary data accumulated across a dependency chain.
///
/// [`combine`](Self::combine) is associative and the empty value is its
/// identity. Combining keeps the first occurrence of each diagnostic, so a
/// diagnostic reached through two paths of a diamond is reported once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideValues {
    diagnostics: Option<Arc<[Diagnostic]>>,
}

impl SideValues {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_none()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.diagnostics.as_deref().unwrap_or(&[])
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics()
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn combine(&self, other: &Self) -> Self {
        match (&self.diagnostics, &other.diagnostics) {
            (None, _) => other.clone(),
            (_, None) => self.clone(),
            (Some(left), Some(right)) if Arc::ptr_eq(left, right) => self.clone(),
            (Some(left), Some(right)) => left.iter().chain(right.iter()).cloned().collect(),
        }
    }
}

impl From<Diagnostic> for SideValues {
    fn from(diagnostic: Diagnostic) -> Self {
        Self {
            diagnostics: Some(Arc::from(vec![diagnostic])),
        }
    }
}

impl FromIterator<Diagnostic> for SideValues {
    fn from_iter<I: IntoIterator<Item = Diagnostic>>(iter: I) -> Self {
        let mut unique: SmallVec<[Diagnostic; 4]> = SmallVec::new();
        for diagnostic in iter {
            if !unique.contains(&diagnostic) {
                unique.push(diagnostic);
            }
        }

        if unique.is_empty() {
            Self::empty()
        } else {
            Self {
                diagnostics: Some(unique.into_iter().collect()),
            }
        }
    }
}

/// An immutable snapshot of a node's value.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue<T> {
    value: T,
    version: Version,
    side_values: SideValues,
}

impl<T> VersionedValue<T> {
    pub fn new(value: T, version: Version) -> Self {
        Self {
            value,
            version,
            side_values: SideValues::empty(),
        }
    }

    pub fn with_side_values(mut self, side_values: SideValues) -> Self {
        self.side_values = side_values;
        self
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn side_values(&self) -> &SideValues {
        &self.side_values
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn into_parts(self) -> (T, Version, SideValues) {
        (self.value, self.version, self.side_values)
    }

    /// Transform the value, keeping version and side values.
    pub fn map<U, F>(self, f: F) -> VersionedValue<U>
    where
        F: FnOnce(T) -> U,
    {
        VersionedValue {
            value: f(self.value),
            version: self.version,
            side_values: self.side_values,
        }
    }
}
