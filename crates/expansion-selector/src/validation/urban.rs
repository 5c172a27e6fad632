//! Urban suitability
//!
//! Land-use tags decide when present; otherwise a road and a building within
//! the search radius stand in for built-up land. The density index blends
//! building and road counts within a wider radius.

use super::{Tally, ValidatorStats};
use crate::cache::{cache_key, CacheStore, KeyedLocks};
use crate::config::ExpansionConfig;
use crate::geo::GeoPoint;
use crate::provider::{Feature, FeatureClass, FeatureProvider, FeatureResponse};
use crate::rate_limit::ProviderGate;
use crate::Result;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const CACHE_NAMESPACE: &str = "urban";

pub const EXCLUDED_LANDUSE: [&str; 5] = ["farmland", "forest", "water", "wetland", "park"];
pub const APPROVED_LANDUSE: [&str; 4] = ["residential", "commercial", "retail", "industrial"];

/// Counts at which each density component saturates
const BUILDING_SATURATION: f64 = 50.0;
const ROAD_SATURATION: f64 = 20.0;
const BUILDING_SHARE: f64 = 0.6;
const ROAD_SHARE: f64 = 0.4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrbanValidation {
    pub is_suitable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landuse_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub road_distance_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub building_distance_m: Option<f64>,
    pub urban_density_index: f64,
}

impl UrbanValidation {
    pub fn rejection_reason(&self) -> Option<&'static str> {
        if self.is_suitable {
            None
        } else if self
            .landuse_type
            .as_deref()
            .is_some_and(|l| EXCLUDED_LANDUSE.contains(&l))
        {
            Some("excluded_landuse")
        } else {
            Some("no_built_environment")
        }
    }
}

/// Density in [0,1] from feature counts
pub fn urban_density_index(buildings: usize, roads: usize) -> f64 {
    let b = (buildings as f64 / BUILDING_SATURATION).min(1.0);
    let r = (roads as f64 / ROAD_SATURATION).min(1.0);
    (BUILDING_SHARE * b + ROAD_SHARE * r).clamp(0.0, 1.0)
}

pub struct UrbanSuitabilityValidator {
    provider: Arc<dyn FeatureProvider>,
    cache: Arc<dyn CacheStore<UrbanValidation>>,
    in_flight: KeyedLocks,
    gate: ProviderGate,
    search_radius_m: f64,
    density_radius_m: f64,
    ttl: Duration,
    stats: ValidatorStats,
}

impl UrbanSuitabilityValidator {
    pub fn new(
        provider: Arc<dyn FeatureProvider>,
        cache: Arc<dyn CacheStore<UrbanValidation>>,
        config: &ExpansionConfig,
    ) -> Self {
        let gate = ProviderGate::new(provider.name(), config.provider_requests_per_minute, config.retry);
        Self {
            provider,
            cache,
            in_flight: KeyedLocks::new(),
            gate,
            search_radius_m: config.urban_search_radius_m,
            density_radius_m: config.urban_density_radius_m,
            ttl: Duration::days(config.urban_cache_ttl_days),
            stats: ValidatorStats::default(),
        }
    }

    pub fn stats(&self) -> &ValidatorStats {
        &self.stats
    }

    /// Validate a coordinate. Provider failures are returned to the caller.
    pub async fn validate(&self, lat: f64, lng: f64) -> Result<UrbanValidation> {
        self.check(lat, lng, Tally::new(&self.stats, None)).await
    }

    /// As `validate`, also counting into `run`
    pub async fn validate_counting(&self, lat: f64, lng: f64, run: &ValidatorStats) -> Result<UrbanValidation> {
        self.check(lat, lng, Tally::new(&self.stats, Some(run))).await
    }

    async fn check(&self, lat: f64, lng: f64, tally: Tally<'_>) -> Result<UrbanValidation> {
        let p = GeoPoint::new(lat, lng);
        let key = cache_key(CACHE_NAMESPACE, p);

        if let Some(entry) = self.cache.get(&key) {
            tally.hit();
            return Ok(entry.value);
        }
        let _filling = self.in_flight.lock(&key).await;
        if let Some(entry) = self.cache.get(&key) {
            tally.hit();
            return Ok(entry.value);
        }
        tally.miss();

        let radius_m = self.search_radius_m.max(self.density_radius_m);
        tally.provider_call();
        let response = self
            .gate
            .call(|| self.provider.query(lat, lng, radius_m))
            .await
            .inspect_err(|_| tally.provider_failure())?;

        let result = self.classify(p, &response);
        debug!(
            lat,
            lng,
            suitable = result.is_suitable,
            density = result.urban_density_index,
            "urban validation"
        );

        let raw = serde_json::to_value(&response).unwrap_or(serde_json::Value::Null);
        if let Err(e) = self.cache.put(&key, result.clone(), raw, self.ttl) {
            tally.cache_write_failure();
            warn!(error = %e, "urban cache write failed");
        }
        Ok(result)
    }

    pub fn classify(&self, p: GeoPoint, response: &FeatureResponse) -> UrbanValidation {
        let search_km = self.search_radius_m / 1000.0;
        let density_km = self.density_radius_m / 1000.0;

        let landuse_type = nearest_landuse(p, response, search_km);

        let nearest_km = |class: FeatureClass| {
            response
                .of_class(class)
                .map(|f| f.geometry.distance_km(p))
                .fold(f64::INFINITY, f64::min)
        };
        let road_km = nearest_km(FeatureClass::Road);
        let building_km = nearest_km(FeatureClass::Building);

        let count_within = |class: FeatureClass| {
            response
                .of_class(class)
                .filter(|f| f.geometry.distance_km(p) <= density_km)
                .count()
        };
        let urban_density_index = urban_density_index(count_within(FeatureClass::Building), count_within(FeatureClass::Road));

        let is_suitable = match landuse_type.as_deref() {
            Some(l) if EXCLUDED_LANDUSE.contains(&l) => false,
            Some(l) if APPROVED_LANDUSE.contains(&l) => true,
            _ => road_km <= search_km && building_km <= search_km,
        };

        UrbanValidation {
            is_suitable,
            landuse_type,
            road_distance_m: road_km.is_finite().then_some(road_km * 1000.0),
            building_distance_m: building_km.is_finite().then_some(building_km * 1000.0),
            urban_density_index,
        }
    }
}

/// Land use at the point: a containing land-use area wins, else the nearest
/// tagged land-use feature within the search radius. Ties go to the
/// alphabetically first kind.
fn nearest_landuse(p: GeoPoint, response: &FeatureResponse, search_km: f64) -> Option<String> {
    let tagged = |f: &&Feature| {
        f.class == FeatureClass::Landuse || (f.class == FeatureClass::Water && f.geometry.contains(p))
    };
    response
        .features
        .iter()
        .filter(tagged)
        .filter_map(|f| {
            let kind = match f.class {
                FeatureClass::Water => "water".to_string(),
                _ => f.kind.as_deref()?.to_ascii_lowercase(),
            };
            let d = f.geometry.distance_km(p);
            (d <= search_km).then_some((d, kind))
        })
        .min_by(|(da, ka), (db, kb)| da.total_cmp(db).then_with(|| ka.cmp(kb)))
        .map(|(_, kind)| kind)
}
