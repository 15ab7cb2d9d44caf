//! Limiter configuration.
//!
//! Windows are expressed in seconds (`f64`) so configs read naturally from
//! JSON; the accessors convert them to [`Duration`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::Priority;
use crate::error::{Error, Result};

/// Commands per window the hub tolerates by default.
pub const DEFAULT_RATE_LIMIT: u32 = 5;
/// Default shared window, in seconds.
pub const DEFAULT_RATE_WINDOW_SECS: f64 = 3.0;
/// Polling grants guaranteed per floor window.
pub const MIN_POLLING_CALLS: u32 = 3;
/// Polling floor window, in seconds.
pub const POLLING_FLOOR_WINDOW_SECS: f64 = 60.0;

pub const ENV_RATE_LIMIT: &str = "HUBGATE_RATE_LIMIT";
pub const ENV_RATE_WINDOW: &str = "HUBGATE_RATE_WINDOW";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Capacity of the shared bucket.
    pub default_rate_limit: u32,
    /// Refill period of the shared bucket, in seconds.
    pub default_time_window: f64,
    /// Policies keyed by priority. Priorities not listed are unconfigured.
    #[serde(default)]
    pub per_priority: BTreeMap<Priority, PriorityPolicy>,
}

/// Per-priority overrides. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityPolicy {
    /// Grants guaranteed per floor window while the queue is non-empty.
    pub min_calls: Option<u32>,
    /// Floor window in seconds; defaults to the shared window.
    pub floor_window: Option<f64>,
    /// Capacity of a private bucket used instead of the shared one.
    pub rate_limit: Option<u32>,
    /// Window of the private bucket in seconds.
    pub rate_window: Option<f64>,
    /// Only the freshest pending request survives.
    pub latest_only: bool,
    /// Admit without consuming any token.
    pub unmetered: bool,
}

impl PriorityPolicy {
    pub fn floor(mut self, min_calls: u32, window_secs: f64) -> Self {
        self.min_calls = Some(min_calls);
        self.floor_window = Some(window_secs);
        self
    }

    pub fn private_bucket(mut self, rate_limit: u32, window_secs: f64) -> Self {
        self.rate_limit = Some(rate_limit);
        self.rate_window = Some(window_secs);
        self
    }

    pub fn latest_only(mut self) -> Self {
        self.latest_only = true;
        self
    }

    pub fn unmetered(mut self) -> Self {
        self.unmetered = true;
        self
    }
}

/// Bucket selection resolved from a [`PriorityPolicy`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum BucketSpec {
    Shared,
    Private { capacity: u32, window: Duration },
    Unmetered,
}

/// Floor policy resolved from a [`PriorityPolicy`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FloorSpec {
    pub(crate) min_calls: u32,
    pub(crate) window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_rate_limit: DEFAULT_RATE_LIMIT,
            default_time_window: DEFAULT_RATE_WINDOW_SECS,
            per_priority: BTreeMap::new(),
        }
    }
}

impl LimiterConfig {
    pub fn new(default_rate_limit: u32, default_time_window: f64) -> Self {
        Self {
            default_rate_limit,
            default_time_window,
            per_priority: BTreeMap::new(),
        }
    }

    /// Event traffic first; polling is latest-only with a starvation floor.
    pub fn hub_defaults() -> Self {
        Self::default()
            .with_priority(Priority::EVENT, PriorityPolicy::default())
            .with_priority(
                Priority::POLLING,
                PriorityPolicy::default()
                    .floor(MIN_POLLING_CALLS, POLLING_FLOOR_WINDOW_SECS)
                    .latest_only(),
            )
    }

    /// Hub defaults with `HUBGATE_RATE_LIMIT` / `HUBGATE_RATE_WINDOW` applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::hub_defaults();

        if let Ok(value) = std::env::var(ENV_RATE_LIMIT) {
            config.default_rate_limit = value.trim().parse().map_err(|_| Error::InvalidEnv {
                var: ENV_RATE_LIMIT,
                value: value.clone(),
            })?;
        }

        if let Ok(value) = std::env::var(ENV_RATE_WINDOW) {
            config.default_time_window =
                value.trim().parse().map_err(|_| Error::InvalidEnv {
                    var: ENV_RATE_WINDOW,
                    value: value.clone(),
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_priority(mut self, priority: Priority, policy: PriorityPolicy) -> Self {
        self.per_priority.insert(priority, policy);
        self
    }

    pub fn time_window(&self) -> Duration {
        Duration::from_secs_f64(self.default_time_window)
    }

    pub fn validate(&self) -> Result<()> {
        check_capacity("shared", self.default_rate_limit)?;
        check_window("shared", self.default_time_window)?;
        for &priority in self.per_priority.keys() {
            self.bucket_for(priority)?;
            self.floor_for(priority)?;
        }
        Ok(())
    }

    pub(crate) fn bucket_for(&self, priority: Priority) -> Result<BucketSpec> {
        let Some(policy) = self.per_priority.get(&priority) else {
            return Ok(BucketSpec::Shared);
        };
        if policy.unmetered {
            return Ok(BucketSpec::Unmetered);
        }
        if policy.rate_limit.is_none() && policy.rate_window.is_none() {
            return Ok(BucketSpec::Shared);
        }

        let scope = priority.to_string();
        let capacity = policy.rate_limit.unwrap_or(self.default_rate_limit);
        let window = policy.rate_window.unwrap_or(self.default_time_window);
        check_capacity(&scope, capacity)?;
        check_window(&scope, window)?;
        Ok(BucketSpec::Private {
            capacity,
            window: Duration::from_secs_f64(window),
        })
    }

    pub(crate) fn floor_for(&self, priority: Priority) -> Result<Option<FloorSpec>> {
        let Some(policy) = self.per_priority.get(&priority) else {
            return Ok(None);
        };
        match (policy.min_calls, policy.floor_window) {
            (None, None) | (Some(0), _) => Ok(None),
            (None, Some(_)) => Err(Error::InvalidFloor {
                priority,
                reason: "floor_window requires min_calls",
            }),
            (Some(min_calls), window) => {
                let window = window.unwrap_or(self.default_time_window);
                check_window(&priority.to_string(), window)?;
                Ok(Some(FloorSpec {
                    min_calls,
                    window: Duration::from_secs_f64(window),
                }))
            }
        }
    }

    pub(crate) fn latest_only(&self, priority: Priority) -> bool {
        self.per_priority
            .get(&priority)
            .is_some_and(|policy| policy.latest_only)
    }
}

fn check_capacity(scope: &str, capacity: u32) -> Result<()> {
    if capacity == 0 {
        return Err(Error::InvalidCapacity {
            scope: scope.to_string(),
            capacity,
        });
    }
    Ok(())
}

fn check_window(scope: &str, seconds: f64) -> Result<()> {
    // Duration::from_secs_f64 panics on overflow; cap at a century.
    if !seconds.is_finite() || seconds <= 0.0 || seconds > 3_153_600_000.0 {
        return Err(Error::InvalidWindow {
            scope: scope.to_string(),
            seconds,
        });
    }
    Ok(())
}
