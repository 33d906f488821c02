//! Cached slot wrapper distinguishing "computed as empty" from "never computed".

use serde::{Deserialize, Serialize};

/// A cached slot.
///
/// `Empty` records that the loader produced no value and that this fact is
/// worth caching. A key that was never computed is represented by the
/// surrounding `Option<ValueBox<V>>` being `None`, never by `Empty`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueBox<V> {
    Present(V),
    Empty,
}

impl<V> ValueBox<V> {
    pub fn present(value: V) -> Self {
        Self::Present(value)
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn as_ref(&self) -> ValueBox<&V> {
        match self {
            Self::Present(v) => ValueBox::Present(v),
            Self::Empty => ValueBox::Empty,
        }
    }

    pub fn into_option(self) -> Option<V> {
        match self {
            Self::Present(v) => Some(v),
            Self::Empty => None,
        }
    }
}

impl<V> From<Option<V>> for ValueBox<V> {
    fn from(value: Option<V>) -> Self {
        match value {
            Some(v) => Self::Present(v),
            None => Self::Empty,
        }
    }
}

impl<V> From<ValueBox<V>> for Option<V> {
    fn from(value: ValueBox<V>) -> Self {
        value.into_option()
    }
}
