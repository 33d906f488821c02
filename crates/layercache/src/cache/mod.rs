//! Cache tiers and the layering composite.
//!
//! ```text
//! caller ──▶ LayeringCache ──▶ LocalTier   (moka, per process)
//!                         └──▶ RemoteTier  (distributed store, shared)
//! ```
//!
//! All three implement [`Cache`]; the composite delegates to the leaves.

mod layering;
mod local;
mod remote;

pub use layering::LayeringCache;
pub use local::LocalTier;
pub use remote::{PutOutcome, RemoteTier};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CacheResult;
use crate::value::ValueBox;

/// Bounds every cached value type must satisfy.
pub trait CacheValue:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
}

impl<T> CacheValue for T where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
}

/// Common operations of every cache level.
///
/// `get` returns `None` for a key that was never computed and
/// `Some(ValueBox::Empty)` for a key whose computed result was empty.
#[async_trait]
pub trait Cache<V: CacheValue>: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> CacheResult<Option<ValueBox<V>>>;

    async fn put(&self, key: &str, value: ValueBox<V>) -> CacheResult<()>;

    async fn evict(&self, key: &str) -> CacheResult<()>;

    async fn clear(&self) -> CacheResult<()>;
}
