use std::sync::Arc;

use hubgate_async::{AsyncLimiter, Limiter, LimiterConfig, Priority, PriorityPolicy, Result};

use crate::{AdmissionLayer, PriorityExtractor};

/// Builder for an [`AdmissionLayer`].
///
/// Starts from the hub defaults: five calls per three seconds, with polling
/// guaranteed three calls a minute and collapsed to the latest request.
pub struct HubGate {
    config: LimiterConfig,
}

impl Default for HubGate {
    fn default() -> Self {
        Self {
            config: LimiterConfig::hub_defaults(),
        }
    }
}

impl HubGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an explicit configuration instead of the hub defaults.
    pub fn from_config(config: LimiterConfig) -> Self {
        Self { config }
    }

    /// Sets the shared bucket capacity.
    pub fn with_rate_limit(mut self, rate_limit: u32) -> Self {
        self.config.default_rate_limit = rate_limit;
        self
    }

    /// Sets the shared refill window, in seconds.
    pub fn with_time_window(mut self, seconds: f64) -> Self {
        self.config.default_time_window = seconds;
        self
    }

    /// Sets the policy of one priority, replacing any earlier one.
    pub fn with_priority(mut self, priority: Priority, policy: PriorityPolicy) -> Self {
        self.config = self.config.with_priority(priority, policy);
        self
    }

    /// Validates the configuration, starts the limiter and wraps it in a layer.
    ///
    /// `extractor` maps `&Request` to the request's [`Priority`]; the request
    /// type is inferred from it.
    pub fn build<Request, P>(self, extractor: P) -> Result<AdmissionLayer<Request, P>>
    where
        P: PriorityExtractor<Request>,
    {
        let limiter = AsyncLimiter::new(Arc::new(Limiter::new(self.config)?));
        Ok(AdmissionLayer::new(limiter, extractor))
    }
}
