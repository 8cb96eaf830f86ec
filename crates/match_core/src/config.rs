//! Matching configuration.
//!
//! Defaults are usable as-is. [`MatchingConfig::load`] layers an optional TOML
//! file and `MATCH__*` environment variables on top, e.g.
//! `MATCH__SEARCH_RADIUS_KM=5` or `MATCH__RETRY_BACKOFF__BASE_MS=500`.

use std::path::Path;

use h3o::Resolution;
use serde::{Deserialize, Serialize};

use crate::error::{MatchError, Result};

const ENV_PREFIX: &str = "MATCH";

/// Where a request goes after a failed round.
///
/// `Front` favours the rider who already waited; `Back` keeps strict FIFO
/// fairness against newer arrivals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOrdering {
    #[default]
    Front,
    Back,
}

/// Delay before re-matching a request that found no reservable driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 2_000,
            max_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    /// `base · 2^(attempt-1)`, capped at `max_ms`. Attempt numbers start at 1.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_ms)
    }
}

/// Ledger write retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceRetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for PersistenceRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 20,
            max_delay_ms: 1_000,
        }
    }
}

impl PersistenceRetryConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_ms: self.base_delay_ms,
            max_ms: self.max_delay_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// K: candidates considered per matching round.
    pub candidate_breadth: usize,
    /// R: search radius around the pickup.
    pub search_radius_km: f64,
    /// Failed rounds tolerated before a request expires as exhausted.
    pub retry_limit: u32,
    /// Time a driver has to accept or reject a proposal.
    pub decision_window_ms: u64,
    /// Requests older than this are expired instead of matched.
    pub max_wait_ms: u64,
    pub retry_ordering: RetryOrdering,
    pub retry_backoff: BackoffConfig,
    pub persistence_retry: PersistenceRetryConfig,
    /// H3 resolution of the geospatial index (0..=15).
    pub h3_resolution: u8,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            candidate_breadth: 8,
            search_radius_km: 5.0,
            retry_limit: 5,
            decision_window_ms: 15_000,
            max_wait_ms: 10 * 60 * 1000,
            retry_ordering: RetryOrdering::Front,
            retry_backoff: BackoffConfig::default(),
            persistence_retry: PersistenceRetryConfig::default(),
            h3_resolution: 9,
        }
    }
}

impl MatchingConfig {
    /// Defaults, overridden by an optional TOML file, overridden by `MATCH__*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).map_err(config_error)?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let loaded: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.candidate_breadth == 0 {
            return Err(MatchError::Invalid("candidate_breadth must be at least 1".into()));
        }
        if !self.search_radius_km.is_finite() || self.search_radius_km <= 0.0 {
            return Err(MatchError::Invalid(format!(
                "search_radius_km must be positive, got {}",
                self.search_radius_km
            )));
        }
        if self.decision_window_ms == 0 {
            return Err(MatchError::Invalid("decision_window_ms must be non-zero".into()));
        }
        if self.persistence_retry.max_attempts == 0 {
            return Err(MatchError::Invalid(
                "persistence_retry.max_attempts must be at least 1".into(),
            ));
        }
        self.resolution()?;
        Ok(())
    }

    pub fn resolution(&self) -> Result<Resolution> {
        Resolution::try_from(self.h3_resolution).map_err(|err| {
            MatchError::Invalid(format!("h3_resolution {}: {err}", self.h3_resolution))
        })
    }

    pub fn with_candidate_breadth(mut self, k: usize) -> Self {
        self.candidate_breadth = k;
        self
    }

    pub fn with_search_radius_km(mut self, radius_km: f64) -> Self {
        self.search_radius_km = radius_km;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_decision_window_ms(mut self, window_ms: u64) -> Self {
        self.decision_window_ms = window_ms;
        self
    }

    pub fn with_max_wait_ms(mut self, max_wait_ms: u64) -> Self {
        self.max_wait_ms = max_wait_ms;
        self
    }

    pub fn with_retry_ordering(mut self, ordering: RetryOrdering) -> Self {
        self.retry_ordering = ordering;
        self
    }

    pub fn with_retry_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.retry_backoff = BackoffConfig { base_ms, max_ms };
        self
    }

    pub fn with_persistence_retry(mut self, retry: PersistenceRetryConfig) -> Self {
        self.persistence_retry = retry;
        self
    }

    pub fn with_h3_resolution(mut self, resolution: u8) -> Self {
        self.h3_resolution = resolution;
        self
    }
}

fn config_error(err: config::ConfigError) -> MatchError {
    MatchError::Invalid(format!("configuration: {err}"))
}
