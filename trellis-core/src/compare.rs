//! Equality Comparers
//!
//! A node bumps its version only when its freshly computed value is judged
//! unequal to the previous one. The judgement is pluggable.
//!
//! The default is [`Value::same`]: structural for plain data (integers,
//! strings, tuples, vectors, options) and identity for shared references
//! (`Arc<T>` compares by pointer). Derived values held behind an `Arc` are
//! therefore nominal unless the caller opts into [`Structural`].

use std::sync::Arc;

/// Decides whether two values of a node are the same.
pub trait Comparer<T: ?Sized>: Send + Sync + 'static {
    fn equals(&self, a: &T, b: &T) -> bool;
}

impl<T, F> Comparer<T> for F
where
    T: ?Sized,
    F: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    fn equals(&self, a: &T, b: &T) -> bool {
        self(a, b)
    }
}

/// Compares with `PartialEq`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Structural;

impl<T: PartialEq + ?Sized> Comparer<T> for Structural {
    fn equals(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

/// Compares shared references by address.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl<T: ?Sized + 'static> Comparer<Arc<T>> for Identity {
    fn equals(&self, a: &Arc<T>, b: &Arc<T>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

/// Compares with [`Value::same`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueComparer;

impl<T: Value> Comparer<T> for ValueComparer {
    fn equals(&self, a: &T, b: &T) -> bool {
        a.same(b)
    }
}

/// A type that can live in a node, with its default notion of sameness.
pub trait Value: Clone + Send + Sync + 'static {
    fn same(&self, other: &Self) -> bool;
}

macro_rules! structural_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Value for $ty {
                fn same(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

structural_value!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
);

impl<T: ?Sized + Send + Sync + 'static> Value for Arc<T> {
    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

impl<T: Value> Value for Option<T> {
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.same(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: Value> Value for Vec<T> {
    fn same(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(a, b)| a.same(b))
    }
}

impl<T: Value, E: Value> Value for Result<T, E> {
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Ok(a), Ok(b)) => a.same(b),
            (Err(a), Err(b)) => a.same(b),
            _ => false,
        }
    }
}

impl<A: Value, B: Value> Value for (A, B) {
    fn same(&self, other: &Self) -> bool {
        self.0.same(&other.0) && self.1.same(&other.1)
    }
}

impl<A: Value, B: Value, C: Value> Value for (A, B, C) {
    fn same(&self, other: &Self) -> bool {
        self.0.same(&other.0) && self.1.same(&other.1) && self.2.same(&other.2)
    }
}
