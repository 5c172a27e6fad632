//! Candidate validators
//!
//! Both validators check the cache before touching the provider; a hit
//! short-circuits network I/O. Land validation fails open on provider errors,
//! urban validation raises and leaves the decision to the caller.

pub mod land;
pub mod urban;

pub use land::{LandRejection, LandSuitabilityValidator, LandValidation};
pub use urban::{UrbanSuitabilityValidator, UrbanValidation};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by concurrent validation calls
#[derive(Debug, Default)]
pub struct ValidatorStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    provider_calls: AtomicU64,
    provider_failures: AtomicU64,
    cache_write_failures: AtomicU64,
}

impl ValidatorStats {
    pub(crate) fn hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn provider_call(&self) {
        self.provider_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn provider_failure(&self) {
        self.provider_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_write_failure(&self) {
        self.cache_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ValidatorStatsSnapshot {
        ValidatorStatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
            cache_write_failures: self.cache_write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Records into the validator's lifetime counters and, when given, a run's own
#[derive(Clone, Copy)]
pub(crate) struct Tally<'a> {
    lifetime: &'a ValidatorStats,
    run: Option<&'a ValidatorStats>,
}

impl<'a> Tally<'a> {
    pub(crate) fn new(lifetime: &'a ValidatorStats, run: Option<&'a ValidatorStats>) -> Self {
        Self { lifetime, run }
    }

    fn each(&self, f: impl Fn(&ValidatorStats)) {
        f(self.lifetime);
        if let Some(run) = self.run {
            f(run);
        }
    }

    pub(crate) fn hit(&self) {
        self.each(ValidatorStats::hit);
    }

    pub(crate) fn miss(&self) {
        self.each(ValidatorStats::miss);
    }

    pub(crate) fn provider_call(&self) {
        self.each(ValidatorStats::provider_call);
    }

    pub(crate) fn provider_failure(&self) {
        self.each(ValidatorStats::provider_failure);
    }

    pub(crate) fn cache_write_failure(&self) {
        self.each(ValidatorStats::cache_write_failure);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatorStatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Logical provider requests (retries not counted)
    pub provider_calls: u64,
    pub provider_failures: u64,
    pub cache_write_failures: u64,
}

impl ValidatorStatsSnapshot {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            cache_hits: self.cache_hits + other.cache_hits,
            cache_misses: self.cache_misses + other.cache_misses,
            provider_calls: self.provider_calls + other.provider_calls,
            provider_failures: self.provider_failures + other.provider_failures,
            cache_write_failures: self.cache_write_failures + other.cache_write_failures,
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_feeds_lifetime_and_run_counters() {
        let lifetime = ValidatorStats::default();
        lifetime.miss();

        let run = ValidatorStats::default();
        let tally = Tally::new(&lifetime, Some(&run));
        tally.hit();
        tally.hit();
        tally.miss();
        Tally::new(&lifetime, None).provider_call();

        let run = run.snapshot();
        assert_eq!(run.cache_hits, 2);
        assert_eq!(run.cache_misses, 1);
        assert_eq!(run.provider_calls, 0);
        assert!((run.hit_rate() - 2.0 / 3.0).abs() < 1e-12);

        let lifetime = lifetime.snapshot();
        assert_eq!(lifetime.cache_misses, 2);
        assert_eq!(lifetime.provider_calls, 1);
        assert_eq!(ValidatorStatsSnapshot::default().hit_rate(), 0.0);
    }
}
