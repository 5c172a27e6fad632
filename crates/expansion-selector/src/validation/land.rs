//! Land suitability
//!
//! A point must sit inside the country's land polygon and at least the
//! coastline buffer away from its edge (an inward buffer of the polygon).
//! Water bodies and mapped coastlines inside the polygon count as edges too.
//! Without polygon data the country's bounding box is used instead.

use super::{Tally, ValidatorStats};
use crate::cache::{cache_key, CacheStore, KeyedLocks};
use crate::config::ExpansionConfig;
use crate::country::in_country_bounds;
use crate::geo::GeoPoint;
use crate::provider::{FeatureClass, FeatureProvider, FeatureResponse};
use crate::rate_limit::ProviderGate;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const CACHE_NAMESPACE: &str = "land";

/// Minimum query radius so nearby water is seen even with a tiny buffer
const MIN_QUERY_RADIUS_M: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandRejection {
    OutsideCountry,
    InWater,
    TooCloseToCoast,
}

impl LandRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutsideCountry => "outside_country",
            Self::InWater => "in_water",
            Self::TooCloseToCoast => "too_close_to_coast",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandValidation {
    pub is_on_land: bool,
    pub is_in_country: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_to_coast_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<LandRejection>,
    /// Provider failed and the point was let through unchecked
    #[serde(default)]
    pub fell_back: bool,
}

impl LandValidation {
    pub fn is_valid(&self) -> bool {
        self.is_on_land && self.is_in_country && self.rejection_reason.is_none()
    }

    fn fail_open() -> Self {
        Self {
            is_on_land: true,
            is_in_country: true,
            distance_to_coast_m: None,
            rejection_reason: None,
            fell_back: true,
        }
    }

    fn outside_country() -> Self {
        Self {
            is_on_land: false,
            is_in_country: false,
            distance_to_coast_m: None,
            rejection_reason: Some(LandRejection::OutsideCountry),
            fell_back: false,
        }
    }
}

pub struct LandSuitabilityValidator {
    provider: Arc<dyn FeatureProvider>,
    cache: Arc<dyn CacheStore<LandValidation>>,
    in_flight: KeyedLocks,
    gate: ProviderGate,
    country_code: String,
    coastline_buffer_m: f64,
    ttl: Duration,
    stats: ValidatorStats,
}

impl LandSuitabilityValidator {
    pub fn new(
        provider: Arc<dyn FeatureProvider>,
        cache: Arc<dyn CacheStore<LandValidation>>,
        config: &ExpansionConfig,
    ) -> Self {
        let gate = ProviderGate::new(provider.name(), config.provider_requests_per_minute, config.retry);
        Self {
            provider,
            cache,
            in_flight: KeyedLocks::new(),
            gate,
            country_code: config.country_code.clone(),
            coastline_buffer_m: config.coastline_buffer_m,
            ttl: Duration::days(config.land_cache_ttl_days),
            stats: ValidatorStats::default(),
        }
    }

    pub fn stats(&self) -> &ValidatorStats {
        &self.stats
    }

    /// Validate a coordinate. Never fails: provider errors fail open.
    pub async fn validate(&self, lat: f64, lng: f64) -> LandValidation {
        self.check(lat, lng, Tally::new(&self.stats, None)).await
    }

    /// As `validate`, also counting into `run`
    pub async fn validate_counting(&self, lat: f64, lng: f64, run: &ValidatorStats) -> LandValidation {
        self.check(lat, lng, Tally::new(&self.stats, Some(run))).await
    }

    async fn check(&self, lat: f64, lng: f64, tally: Tally<'_>) -> LandValidation {
        let p = GeoPoint::new(lat, lng);
        let key = cache_key(CACHE_NAMESPACE, p);

        if let Some(entry) = self.cache.get(&key) {
            tally.hit();
            return entry.value;
        }
        // One provider call per key; waiters pick up the filled entry
        let _filling = self.in_flight.lock(&key).await;
        if let Some(entry) = self.cache.get(&key) {
            tally.hit();
            return entry.value;
        }
        tally.miss();

        let radius_m = self.coastline_buffer_m.max(MIN_QUERY_RADIUS_M);
        tally.provider_call();
        let response = match self.gate.call(|| self.provider.query(lat, lng, radius_m)).await {
            Ok(response) => response,
            Err(e) => {
                tally.provider_failure();
                warn!(lat, lng, error = %e, "land provider failed; treating point as valid");
                return LandValidation::fail_open();
            }
        };

        let result = self.classify(p, &response);
        debug!(lat, lng, valid = result.is_valid(), reason = ?result.rejection_reason, "land validation");

        let raw = serde_json::to_value(&response).unwrap_or(serde_json::Value::Null);
        if let Err(e) = self.cache.put(&key, result.clone(), raw, self.ttl) {
            tally.cache_write_failure();
            warn!(error = %e, "land cache write failed");
        }
        result
    }

    /// Verdict for a point given the provider's features around it
    pub fn classify(&self, p: GeoPoint, response: &FeatureResponse) -> LandValidation {
        let buffer_km = self.coastline_buffer_m / 1000.0;

        let land: Vec<_> = response
            .of_class(FeatureClass::Land)
            .flat_map(|f| f.geometry.polygons())
            .collect();

        let mut coast_km = f64::INFINITY;
        if land.is_empty() {
            if in_country_bounds(&self.country_code, p) == Some(false) {
                return LandValidation::outside_country();
            }
        } else {
            let Some(containing) = land.iter().find(|poly| poly.contains(p)) else {
                return LandValidation::outside_country();
            };
            coast_km = containing.boundary_distance_km(p);
        }

        if response.of_class(FeatureClass::Water).any(|f| f.geometry.contains(p)) {
            return LandValidation {
                is_on_land: false,
                is_in_country: true,
                distance_to_coast_m: Some(0.0),
                rejection_reason: Some(LandRejection::InWater),
                fell_back: false,
            };
        }

        coast_km = response
            .features
            .iter()
            .filter(|f| matches!(f.class, FeatureClass::Water | FeatureClass::Coastline))
            .map(|f| f.geometry.edge_distance_km(p))
            .fold(coast_km, f64::min);

        let distance_to_coast_m = coast_km.is_finite().then_some(coast_km * 1000.0);
        let too_close = coast_km < buffer_km;

        LandValidation {
            is_on_land: true,
            is_in_country: true,
            distance_to_coast_m,
            rejection_reason: too_close.then_some(LandRejection::TooCloseToCoast),
            fell_back: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ManualClock, MemoryCache};
    use crate::geo::Polygon;
    use crate::provider::{Feature, FeatureGeometry, OfflineFeatureProvider, ProviderError};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    fn land_square() -> Feature {
        Feature {
            class: FeatureClass::Land,
            kind: None,
            geometry: FeatureGeometry::Polygon {
                polygon: Polygon::new(vec![
                    GeoPoint::new(40.0, -75.0),
                    GeoPoint::new(40.0, -74.0),
                    GeoPoint::new(41.0, -74.0),
                    GeoPoint::new(41.0, -75.0),
                ]),
            },
        }
    }

    fn lake() -> Feature {
        Feature {
            class: FeatureClass::Water,
            kind: Some("lake".into()),
            geometry: FeatureGeometry::Polygon {
                polygon: Polygon::new(vec![
                    GeoPoint::new(40.50, -74.50),
                    GeoPoint::new(40.50, -74.48),
                    GeoPoint::new(40.52, -74.48),
                    GeoPoint::new(40.52, -74.50),
                ]),
            },
        }
    }

    fn validator(provider: Arc<dyn FeatureProvider>) -> LandSuitabilityValidator {
        let config = ExpansionConfig {
            retry: crate::config::RetryPolicy {
                max_retries: 0,
                backoff_base_ms: 1,
            },
            ..Default::default()
        };
        let cache: Arc<dyn CacheStore<LandValidation>> = Arc::new(MemoryCache::new());
        LandSuitabilityValidator::new(provider, cache, &config)
    }

    struct FailingProvider;

    #[async_trait]
    impl FeatureProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        async fn query(&self, _: f64, _: f64, _: f64) -> Result<FeatureResponse, ProviderError> {
            Err(ProviderError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_inland_point_is_valid() {
        let provider = Arc::new(OfflineFeatureProvider::new("offline", vec![land_square(), lake()]));
        let v = validator(provider);
        let result = v.validate(40.3, -74.7).await;
        assert!(result.is_valid());
        assert!(result.distance_to_coast_m.unwrap() > 300.0);
    }

    #[tokio::test]
    async fn test_outside_land_polygon_is_outside_country() {
        let provider = Arc::new(OfflineFeatureProvider::new("offline", vec![land_square()]));
        let v = validator(provider);
        let result = v.classify(GeoPoint::new(41.0005, -74.5), &FeatureResponse {
            features: vec![land_square()],
        });
        assert!(!result.is_in_country);
        assert!(!result.is_on_land);
        assert_eq!(result.rejection_reason, Some(LandRejection::OutsideCountry));
    }

    #[tokio::test]
    async fn test_near_edge_rejected_as_coastal() {
        let provider = Arc::new(OfflineFeatureProvider::new("offline", vec![land_square()]));
        let v = validator(provider);
        // ~110 m inside the northern edge
        let result = v.validate(40.999, -74.5).await;
        assert!(result.is_on_land);
        assert_eq!(result.rejection_reason, Some(LandRejection::TooCloseToCoast));
        assert!(!result.is_valid());
    }

    #[tokio::test]
    async fn test_in_water_and_lakeshore() {
        let provider = Arc::new(OfflineFeatureProvider::new("offline", vec![land_square(), lake()]));
        let v = validator(provider);
        let wet = v.validate(40.51, -74.49).await;
        assert_eq!(wet.rejection_reason, Some(LandRejection::InWater));
        assert!(!wet.is_on_land);

        // ~110 m south of the lake
        let shore = v.validate(40.499, -74.49).await;
        assert_eq!(shore.rejection_reason, Some(LandRejection::TooCloseToCoast));
    }

    #[tokio::test]
    async fn test_bbox_fallback_without_polygons() {
        let provider = Arc::new(OfflineFeatureProvider::new("offline", vec![]));
        let v = validator(provider);
        assert!(v.validate(39.0, -100.0).await.is_valid());
        let abroad = v.validate(48.85, 2.35).await;
        assert_eq!(abroad.rejection_reason, Some(LandRejection::OutsideCountry));
    }

    #[tokio::test]
    async fn test_provider_failure_fails_open_and_is_not_cached() {
        let v = validator(Arc::new(FailingProvider));
        let result = v.validate(40.3, -74.7).await;
        assert!(result.is_valid());
        assert!(result.fell_back);

        v.validate(40.3, -74.7).await;
        let stats = v.stats().snapshot();
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.provider_failures, 2);
    }

    #[tokio::test]
    async fn test_cache_one_call_within_ttl_then_one_more_after_expiry() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()));
        let provider = Arc::new(OfflineFeatureProvider::new("offline", vec![land_square()]));
        let cache: Arc<dyn CacheStore<LandValidation>> = Arc::new(MemoryCache::with_clock(clock.clone()));
        let v = LandSuitabilityValidator::new(provider.clone(), cache, &ExpansionConfig::default());

        v.validate(40.3, -74.7).await;
        v.validate(40.300001, -74.700001).await;
        assert_eq!(provider.calls(), 1);

        clock.advance(Duration::days(91));
        v.validate(40.3, -74.7).await;
        assert_eq!(provider.calls(), 2);
    }

    struct YieldingProvider(OfflineFeatureProvider);

    #[async_trait]
    impl FeatureProvider for YieldingProvider {
        fn name(&self) -> &str {
            "yielding"
        }

        async fn query(&self, lat: f64, lng: f64, radius_m: f64) -> Result<FeatureResponse, ProviderError> {
            tokio::task::yield_now().await;
            self.0.query(lat, lng, radius_m).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_misses_on_one_key_make_one_call() {
        let provider = Arc::new(YieldingProvider(OfflineFeatureProvider::new("offline", vec![land_square()])));
        let v = validator(provider.clone());

        let run = ValidatorStats::default();
        let (a, b) = futures::join!(
            v.validate_counting(40.3, -74.7, &run),
            v.validate_counting(40.300001, -74.700001, &run)
        );
        assert_eq!(a, b);
        assert_eq!(provider.0.calls(), 1);
        assert_eq!(run.snapshot().cache_misses, 1);
        assert_eq!(run.snapshot().cache_hits, 1);
        assert_eq!(v.stats().snapshot(), run.snapshot());
    }
}
