//! Engine configuration.
//!
//! Defaults, presets and environment overlay. Weights are data, not code:
//! deployments retune them through config or `MAGPIE_WEIGHT_<HASH_TYPE>`
//! without touching the scorer.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{Evaluator, HashType, VantagePolicy};
use crate::{Error, Result};

/// Prefix of every environment variable read by `from_env`
pub const ENV_PREFIX: &str = "MAGPIE_";

// =============================================================================
// WEIGHTS
// =============================================================================

/// Per-hash-type fusion weights
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashWeights(BTreeMap<HashType, f64>);

impl Default for HashWeights {
    fn default() -> Self {
        Self(HashType::ALL.iter().map(|&t| (t, t.default_weight())).collect())
    }
}

impl HashWeights {
    /// Weights with no entries (every type weighs zero)
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    #[inline]
    pub fn get(&self, hash_type: HashType) -> f64 {
        self.0.get(&hash_type).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, hash_type: HashType, weight: f64) {
        self.0.insert(hash_type, weight);
    }

    pub fn as_map(&self) -> &BTreeMap<HashType, f64> {
        &self.0
    }

    /// Copy with request overrides applied; types not overridden keep their weight
    pub fn with_overrides(&self, overrides: &BTreeMap<HashType, f64>) -> Self {
        let mut merged = self.0.clone();
        merged.extend(overrides.iter().map(|(&t, &w)| (t, w)));
        Self(merged)
    }

    /// Weights must be finite and non-negative
    pub fn validate(&self) -> Result<()> {
        for (hash_type, &w) in &self.0 {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::InvalidParameter(format!(
                    "weight for {} must be finite and >= 0, got {}",
                    hash_type, w
                )));
            }
        }
        Ok(())
    }
}

impl From<BTreeMap<HashType, f64>> for HashWeights {
    fn from(map: BTreeMap<HashType, f64>) -> Self {
        Self(map)
    }
}

// =============================================================================
// ENGINE CONFIG
// =============================================================================

/// Engine configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a built index stays fresh
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    /// Bound on one data-source fetch during a rebuild
    #[serde(with = "duration_secs")]
    pub fetch_timeout: Duration,
    /// Bound on waiting for a peer's in-flight rebuild
    #[serde(with = "duration_secs")]
    pub build_wait_timeout: Duration,
    /// Threshold used when a query gives none
    pub default_threshold: f64,
    /// Limit used when a query gives none
    pub default_limit: usize,
    /// Hard cap on results per query
    pub max_limit: usize,
    /// Cap on candidates scanned by the linear fallback
    pub max_linear_candidates: usize,
    /// Default fusion weights
    pub weights: HashWeights,
    /// VP-tree vantage selection
    pub vantage_policy: VantagePolicy,
    /// Hamming evaluator used by trees and the fallback
    pub evaluator: Evaluator,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300), // 5 minutes
            fetch_timeout: Duration::from_secs(30),
            build_wait_timeout: Duration::from_secs(60),
            default_threshold: 0.85,
            default_limit: 10,
            max_limit: 100,
            max_linear_candidates: 1000,
            weights: HashWeights::default(),
            vantage_policy: VantagePolicy::default(),
            evaluator: Evaluator::default(),
        }
    }
}

impl EngineConfig {
    /// Production configuration: longer-lived indexes, patient waiters
    pub fn production() -> Self {
        Self {
            cache_ttl: Duration::from_secs(900), // 15 minutes
            fetch_timeout: Duration::from_secs(60),
            build_wait_timeout: Duration::from_secs(120),
            ..Default::default()
        }
    }

    /// Testing configuration: short timeouts, reproducible trees
    pub fn testing() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(5),
            build_wait_timeout: Duration::from_secs(5),
            vantage_policy: VantagePolicy::Seeded { seed: 42 },
            ..Default::default()
        }
    }

    /// Defaults overlaid with `MAGPIE_*` environment variables.
    ///
    /// Unparsable values keep the default and log a warning.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| env::var(key).ok())
    }

    /// Overlay values from any key lookup (env, a map in tests, ...)
    pub fn overlay<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(secs) = parse_or_warn::<f64>(&get, "CACHE_TTL_SECS") {
            self.cache_ttl = secs_to_duration(secs).unwrap_or(self.cache_ttl);
        }
        if let Some(secs) = parse_or_warn::<f64>(&get, "FETCH_TIMEOUT_SECS") {
            self.fetch_timeout = secs_to_duration(secs).unwrap_or(self.fetch_timeout);
        }
        if let Some(secs) = parse_or_warn::<f64>(&get, "BUILD_WAIT_TIMEOUT_SECS") {
            self.build_wait_timeout = secs_to_duration(secs).unwrap_or(self.build_wait_timeout);
        }
        if let Some(v) = parse_or_warn(&get, "DEFAULT_THRESHOLD") {
            self.default_threshold = v;
        }
        if let Some(v) = parse_or_warn(&get, "DEFAULT_LIMIT") {
            self.default_limit = v;
        }
        if let Some(v) = parse_or_warn(&get, "MAX_LIMIT") {
            self.max_limit = v;
        }
        if let Some(v) = parse_or_warn(&get, "MAX_LINEAR_CANDIDATES") {
            self.max_linear_candidates = v;
        }
        for hash_type in HashType::ALL {
            let key = format!("WEIGHT_{}", hash_type.env_suffix());
            if let Some(w) = parse_or_warn(&get, &key) {
                self.weights.set(hash_type, w);
            }
        }
        if let Some(raw) = get("VANTAGE_POLICY") {
            match VantagePolicy::parse(&raw) {
                Some(policy) => self.vantage_policy = policy,
                None => warn!(key = "VANTAGE_POLICY", value = %raw, "ignoring unparsable config value"),
            }
        }
        if let Some(raw) = get("EVALUATOR") {
            match Evaluator::parse(&raw) {
                Some(evaluator) => self.evaluator = evaluator,
                None => warn!(key = "EVALUATOR", value = %raw, "ignoring unparsable config value"),
            }
        }
        self
    }

    /// Load from JSON (missing fields take defaults)
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_threshold) {
            return Err(Error::Config(format!(
                "default_threshold must be within [0, 1], got {}",
                self.default_threshold
            )));
        }
        if self.max_limit == 0 {
            return Err(Error::Config("max_limit must be at least 1".into()));
        }
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            return Err(Error::Config(format!(
                "default_limit must be within [1, {}], got {}",
                self.max_limit, self.default_limit
            )));
        }
        if self.cache_ttl.is_zero() {
            return Err(Error::Config("cache_ttl must be positive".into()));
        }
        if self.fetch_timeout.is_zero() || self.build_wait_timeout.is_zero() {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        self.weights
            .validate()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Effective limit for a requested one
    #[inline]
    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_limit).min(self.max_limit)
    }
}

fn parse_or_warn<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = get(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key = name, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}

fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Durations as (fractional) seconds on the wire
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
