//! Runtime-tunable settings.
//!
//! A small set of reserved keys is persisted in the store's `settings`
//! table and may be changed through the admin API without a restart. The
//! current values live behind an `ArcSwap`, so hot-path readers take a
//! lock-free snapshot.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const KEY_PERIODIC_SYNC_INTERVAL_HOURS: &str = "periodicSyncIntervalHours";
pub const KEY_CHAT_MAX_RETRIES: &str = "chatMaxRetries";
pub const KEY_INITIAL_PENALTY_MS: &str = "dispatcher_initial_penalty_ms";
pub const KEY_MAX_PENALTY_MS: &str = "dispatcher_max_penalty_ms";
pub const KEY_RESYNC_THRESHOLD: &str = "dispatcher_resync_threshold";
pub const KEY_RATE_LIMIT_MAX: &str = "rateLimitMax";
pub const KEY_RATE_LIMIT_WINDOW: &str = "rateLimitWindow";

pub const RESERVED_KEYS: &[&str] = &[
    KEY_PERIODIC_SYNC_INTERVAL_HOURS,
    KEY_CHAT_MAX_RETRIES,
    KEY_INITIAL_PENALTY_MS,
    KEY_MAX_PENALTY_MS,
    KEY_RESYNC_THRESHOLD,
    KEY_RATE_LIMIT_MAX,
    KEY_RATE_LIMIT_WINDOW,
];

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Unknown setting: {key}")]
    UnknownKey { key: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// One consistent view of every tunable.
#[derive(Debug, Clone)]
pub struct SettingsValues {
    pub periodic_sync_interval: Duration,
    pub chat_max_retries: u32,
    pub initial_penalty: Duration,
    pub max_penalty: Duration,
    pub resync_threshold: u32,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
}

impl Default for SettingsValues {
    fn default() -> Self {
        Self {
            periodic_sync_interval: Duration::from_secs(3600),
            chat_max_retries: 3,
            initial_penalty: Duration::from_secs(30 * 60),
            max_penalty: Duration::from_secs(4 * 60 * 60),
            resync_threshold: 3,
            rate_limit_max: 60,
            rate_limit_window: Duration::from_secs(60),
        }
    }
}

impl SettingsValues {
    /// Apply one persisted `key=value` pair on top of this view.
    fn apply(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
            value.trim().parse().map_err(|_| SettingsError::InvalidValue {
                key: key.to_string(),
                reason: format!("'{value}' is not a valid number"),
            })
        }
        fn positive(key: &str, n: u64) -> Result<u64, SettingsError> {
            if n == 0 {
                Err(SettingsError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than zero".into(),
                })
            } else {
                Ok(n)
            }
        }

        match key {
            KEY_PERIODIC_SYNC_INTERVAL_HOURS => {
                let hours = positive(key, parse(key, value)?)?;
                self.periodic_sync_interval = Duration::from_secs(hours * 3600);
            }
            KEY_CHAT_MAX_RETRIES => {
                self.chat_max_retries = positive(key, parse(key, value)?)? as u32;
            }
            KEY_INITIAL_PENALTY_MS => {
                self.initial_penalty = Duration::from_millis(positive(key, parse(key, value)?)?);
            }
            KEY_MAX_PENALTY_MS => {
                self.max_penalty = Duration::from_millis(positive(key, parse(key, value)?)?);
            }
            KEY_RESYNC_THRESHOLD => {
                self.resync_threshold = positive(key, parse(key, value)?)? as u32;
            }
            KEY_RATE_LIMIT_MAX => {
                self.rate_limit_max = positive(key, parse(key, value)?)? as u32;
            }
            KEY_RATE_LIMIT_WINDOW => {
                let secs = positive(key, parse(key, value)?)?;
                self.rate_limit_window = Duration::from_secs(secs);
            }
            other => {
                return Err(SettingsError::UnknownKey {
                    key: other.to_string(),
                })
            }
        }

        if self.initial_penalty > self.max_penalty {
            return Err(SettingsError::InvalidValue {
                key: key.to_string(),
                reason: "initial penalty exceeds max penalty".into(),
            });
        }
        Ok(())
    }
}

/// Shared, swap-on-write settings handle.
pub struct RuntimeSettings {
    inner: ArcSwap<SettingsValues>,
}

impl RuntimeSettings {
    pub fn new(defaults: SettingsValues) -> Self {
        Self {
            inner: ArcSwap::from_pointee(defaults),
        }
    }

    /// Build from defaults overlaid with persisted rows. Rows that fail
    /// validation are skipped with a warning so one bad row cannot keep
    /// the gateway from booting.
    pub fn load(defaults: SettingsValues, persisted: &HashMap<String, String>) -> Self {
        let mut values = defaults;
        for key in RESERVED_KEYS {
            if let Some(raw) = persisted.get(*key) {
                if let Err(e) = values.apply(key, raw) {
                    tracing::warn!(key, error = %e, "ignoring invalid persisted setting");
                }
            }
        }
        Self::new(values)
    }

    /// Validate and apply one change. The caller persists the row after
    /// this succeeds.
    pub fn update(&self, key: &str, value: &str) -> Result<SettingsValues, SettingsError> {
        let mut next = (**self.inner.load()).clone();
        next.apply(key, value)?;
        self.inner.store(Arc::new(next.clone()));
        Ok(next)
    }

    pub fn current(&self) -> Arc<SettingsValues> {
        self.inner.load_full()
    }
}
