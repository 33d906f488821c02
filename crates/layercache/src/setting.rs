//! Per-cache tier settings.
//!
//! A [`LayeringCacheSetting`] is immutable once a cache is built from it. Its
//! [`fingerprint`](LayeringCacheSetting::fingerprint) disambiguates caches that
//! share a logical name but are configured differently.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// How the local tier measures entry age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExpireMode {
    /// Expire a fixed time after the entry was written.
    #[default]
    Write,
    /// Expire a fixed time after the entry was last read or written.
    Access,
}

/// What a cache does when the loader fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorPolicy {
    /// Return the loader's error to the caller; nothing is cached.
    #[default]
    Propagate,
    /// Swallow the error and cache an empty value in the remote tier.
    CacheEmpty,
    /// Swallow the error and return empty without caching anything.
    ReturnEmpty,
}

/// Local (L1) tier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalTierSetting {
    pub initial_capacity: usize,
    pub max_capacity: u64,
    pub expire_mode: ExpireMode,
    pub expire_time: Duration,
}

impl LocalTierSetting {
    pub fn new(expire_time: Duration) -> Self {
        Self {
            initial_capacity: 16,
            max_capacity: 10_000,
            expire_mode: ExpireMode::Write,
            expire_time,
        }
    }

    pub fn with_capacity(mut self, initial: usize, max: u64) -> Self {
        self.initial_capacity = initial;
        self.max_capacity = max;
        self
    }

    pub fn with_expire_mode(mut self, mode: ExpireMode) -> Self {
        self.expire_mode = mode;
        self
    }
}

/// Remote (L2) tier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTierSetting {
    /// TTL of present values.
    pub expiration: Duration,
    /// Whether empty results are cached at all.
    pub allow_empty: bool,
    /// Base TTL of empty results; defaults to `expiration`.
    pub empty_expiration: Option<Duration>,
    /// Multiplier applied to the empty-result TTL.
    pub magnification: u32,
    /// Remaining TTL at or below which a read triggers refresh-ahead.
    pub preload_time: Option<Duration>,
    /// Whether refresh-ahead re-runs the loader (`true`) or only extends the TTL.
    pub force_refresh: bool,
}

impl RemoteTierSetting {
    pub fn new(expiration: Duration) -> Self {
        Self {
            expiration,
            allow_empty: true,
            empty_expiration: None,
            magnification: 1,
            preload_time: None,
            force_refresh: false,
        }
    }

    pub fn with_allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    pub fn with_empty_expiration(mut self, ttl: Duration) -> Self {
        self.empty_expiration = Some(ttl);
        self
    }

    pub fn with_magnification(mut self, magnification: u32) -> Self {
        self.magnification = magnification;
        self
    }

    pub fn with_preload(mut self, preload_time: Duration, force_refresh: bool) -> Self {
        self.preload_time = Some(preload_time);
        self.force_refresh = force_refresh;
        self
    }

    /// TTL used when storing an empty value.
    pub fn empty_ttl(&self) -> Duration {
        self.empty_expiration
            .unwrap_or(self.expiration)
            .saturating_mul(self.magnification.max(1))
    }
}

/// Load coordination: the per-key lock and the loader deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSetting {
    pub lock_lease: Duration,
    pub lock_wait: Duration,
    pub load_timeout: Option<Duration>,
    pub error_policy: LoadErrorPolicy,
}

impl Default for LoadSetting {
    fn default() -> Self {
        Self {
            lock_lease: Duration::from_secs(10),
            lock_wait: Duration::from_millis(500),
            load_timeout: None,
            error_policy: LoadErrorPolicy::Propagate,
        }
    }
}

/// Immutable configuration of one layering cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayeringCacheSetting {
    /// Free-form description shown alongside stats records.
    pub description: String,
    pub local_enabled: bool,
    pub local: LocalTierSetting,
    pub remote: RemoteTierSetting,
    pub load: LoadSetting,
}

impl LayeringCacheSetting {
    pub fn new(local: LocalTierSetting, remote: RemoteTierSetting) -> Self {
        Self {
            description: String::new(),
            local_enabled: true,
            local,
            remote,
            load: LoadSetting::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_local_enabled(mut self, enabled: bool) -> Self {
        self.local_enabled = enabled;
        self
    }

    pub fn with_lock(mut self, lease: Duration, wait: Duration) -> Self {
        self.load.lock_lease = lease;
        self.load.lock_wait = wait;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load.load_timeout = Some(timeout);
        self
    }

    pub fn with_error_policy(mut self, policy: LoadErrorPolicy) -> Self {
        self.load.error_policy = policy;
        self
    }

    /// `"{local expire ms}-{remote expiration ms}"`.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}-{}",
            self.local.expire_time.as_millis(),
            self.remote.expiration.as_millis()
        )
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.local.expire_time.is_zero() {
            return Err(CacheError::config("local.expire_time must be > 0"));
        }
        if self.local.max_capacity == 0 {
            return Err(CacheError::config("local.max_capacity must be > 0"));
        }
        if self.remote.expiration.is_zero() {
            return Err(CacheError::config("remote.expiration must be > 0"));
        }
        if self.remote.magnification == 0 {
            return Err(CacheError::config("remote.magnification must be >= 1"));
        }
        if let Some(preload) = self.remote.preload_time {
            if preload >= self.remote.expiration {
                return Err(CacheError::config(
                    "remote.preload_time must be shorter than remote.expiration",
                ));
            }
        }
        if self.load.lock_lease.is_zero() {
            return Err(CacheError::config("load.lock_lease must be > 0"));
        }
        Ok(())
    }
}
