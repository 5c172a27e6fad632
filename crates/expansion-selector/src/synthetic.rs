//! Seeded synthetic world for demos and tests
//!
//! Every random draw comes from the RNG handed in, so a seed fully determines
//! the stores, settlements, anchors and provider features produced.

use crate::geo::Polygon;
use crate::pipeline::PipelineInput;
use crate::provider::{Feature, FeatureClass, FeatureGeometry, OfflineFeatureProvider};
use crate::{
    AnchorKind, AnchorPoi, BoundingBox, ExistingStore, GeoPoint, PopulationSource, Settlement, SettlementTier,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

/// Land margin around the region so its edges are not coastal
const LAND_MARGIN_DEG: f64 = 0.5;
const REGION_BANDS: usize = 3;
const CENSUS_SHARE: f64 = 0.7;
const TURNOVER_REPORTED_SHARE: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct SyntheticWorld {
    pub region: BoundingBox,
    pub stores: Vec<ExistingStore>,
    pub settlements: Vec<Settlement>,
    pub anchors: Vec<AnchorPoi>,
    pub features: Vec<Feature>,
}

fn square(center: GeoPoint, half_deg: f64) -> Polygon {
    Polygon::new(vec![
        GeoPoint::new(center.lat - half_deg, center.lng - half_deg),
        GeoPoint::new(center.lat - half_deg, center.lng + half_deg),
        GeoPoint::new(center.lat + half_deg, center.lng + half_deg),
        GeoPoint::new(center.lat + half_deg, center.lng - half_deg),
    ])
}

fn area(class: FeatureClass, kind: &str, center: GeoPoint, half_deg: f64) -> Feature {
    Feature {
        class,
        kind: Some(kind.to_string()),
        geometry: FeatureGeometry::Polygon {
            polygon: square(center, half_deg),
        },
    }
}

fn jitter<R: Rng + ?Sized>(rng: &mut R, p: GeoPoint, deg: f64) -> GeoPoint {
    GeoPoint::new(p.lat + rng.gen_range(-deg..=deg), p.lng + rng.gen_range(-deg..=deg))
}

fn random_point<R: Rng + ?Sized>(rng: &mut R, bbox: &BoundingBox) -> GeoPoint {
    GeoPoint::new(
        rng.gen_range(bbox.min_lat..=bbox.max_lat),
        rng.gen_range(bbox.min_lng..=bbox.max_lng),
    )
}

impl SyntheticWorld {
    pub fn generate(region: &BoundingBox, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Self::generate_with(region, &mut rng)
    }

    pub fn generate_with<R: Rng + ?Sized>(region: &BoundingBox, rng: &mut R) -> Self {
        let band_width = (region.max_lng - region.min_lng) / REGION_BANDS as f64;
        let region_of = |p: GeoPoint| {
            let band = (((p.lng - region.min_lng) / band_width) as usize).min(REGION_BANDS - 1);
            format!("Region {}", (b'A' + band as u8) as char)
        };

        // Settlements
        let count = (region.area_km2() / 400.0).clamp(6.0, 60.0) as usize;
        let mut settlements = Vec::with_capacity(count);
        for i in 0..count {
            let location = random_point(rng, region);
            let tier = match i % 5 {
                0 => SettlementTier::City,
                1 | 2 => SettlementTier::Town,
                _ => SettlementTier::Village,
            };
            let population = match tier {
                SettlementTier::City => rng.gen_range(100_000..600_000),
                SettlementTier::Town => rng.gen_range(5_000..100_000),
                SettlementTier::Village => rng.gen_range(500..5_000),
            };
            let population_source = if rng.gen_bool(CENSUS_SHARE) {
                PopulationSource::Census
            } else {
                PopulationSource::Estimate
            };
            settlements.push(Settlement {
                name: format!("{:?} {}", tier, i + 1),
                region: region_of(location),
                location,
                population,
                tier,
                population_source,
            });
        }

        // Stores around cities and some towns
        let mut stores = Vec::new();
        for s in &settlements {
            let n = match s.tier {
                SettlementTier::City => rng.gen_range(1..=2),
                SettlementTier::Town if rng.gen_bool(0.3) => 1,
                _ => 0,
            };
            for _ in 0..n {
                let location = jitter(rng, s.location, 0.03);
                let trailing_turnover = rng
                    .gen_bool(TURNOVER_REPORTED_SHARE)
                    .then(|| rng.gen_range(0.6..1.6) * 1_000_000.0);
                stores.push(ExistingStore {
                    id: format!("store-{:03}", stores.len() + 1),
                    location,
                    city: s.name.clone(),
                    region: s.region.clone(),
                    country: "US".to_string(),
                    trailing_turnover,
                    population_band: None,
                });
            }
        }

        // Anchors near settlements, more for bigger places
        let mut anchors = Vec::new();
        for s in &settlements {
            let (malls, grocery, transit) = match s.tier {
                SettlementTier::City => (2, 6, 4),
                SettlementTier::Town => (0, 2, 1),
                SettlementTier::Village => (0, 1, 0),
            };
            let kinds = std::iter::repeat(AnchorKind::Mall)
                .take(malls)
                .chain(std::iter::repeat(AnchorKind::Grocery).take(grocery))
                .chain(std::iter::repeat(AnchorKind::Transit).take(transit));
            for kind in kinds {
                anchors.push(AnchorPoi {
                    id: format!("anchor-{:04}", anchors.len() + 1),
                    kind,
                    location: jitter(rng, s.location, 0.05),
                });
            }
        }

        // Provider features
        let mut features = vec![Feature {
            class: FeatureClass::Land,
            kind: None,
            geometry: FeatureGeometry::Polygon {
                polygon: Polygon::new(vec![
                    GeoPoint::new(region.min_lat - LAND_MARGIN_DEG, region.min_lng - LAND_MARGIN_DEG),
                    GeoPoint::new(region.min_lat - LAND_MARGIN_DEG, region.max_lng + LAND_MARGIN_DEG),
                    GeoPoint::new(region.max_lat + LAND_MARGIN_DEG, region.max_lng + LAND_MARGIN_DEG),
                    GeoPoint::new(region.max_lat + LAND_MARGIN_DEG, region.min_lng - LAND_MARGIN_DEG),
                ]),
            },
        }];

        for _ in 0..(count / 4).max(1) {
            let center = random_point(rng, region);
            features.push(area(FeatureClass::Water, "lake", center, rng.gen_range(0.01..0.03)));
        }
        for _ in 0..(count / 2).max(1) {
            let center = random_point(rng, region);
            let kind = if rng.gen_bool(0.5) { "farmland" } else { "forest" };
            features.push(area(FeatureClass::Landuse, kind, center, rng.gen_range(0.02..0.05)));
        }

        for s in &settlements {
            let (half, suburbs, buildings) = match s.tier {
                SettlementTier::City => (0.03, 4, 60),
                SettlementTier::Town => (0.015, 2, 25),
                SettlementTier::Village => (0.005, 1, 8),
            };
            features.push(area(FeatureClass::Landuse, "commercial", s.location, half));
            for _ in 0..suburbs {
                let center = jitter(rng, s.location, 0.15);
                features.push(area(FeatureClass::Landuse, "residential", center, rng.gen_range(0.01..0.025)));
            }

            // Two roads crossing at the settlement, buildings strung along them
            let reach = 0.3;
            let roads = [
                (
                    GeoPoint::new(s.location.lat, s.location.lng - reach),
                    GeoPoint::new(s.location.lat, s.location.lng + reach),
                ),
                (
                    GeoPoint::new(s.location.lat - reach, s.location.lng),
                    GeoPoint::new(s.location.lat + reach, s.location.lng),
                ),
            ];
            for (a, b) in roads {
                features.push(Feature {
                    class: FeatureClass::Road,
                    kind: Some("primary".to_string()),
                    geometry: FeatureGeometry::LineString { coordinates: vec![a, b] },
                });
                for _ in 0..buildings / 2 {
                    let t: f64 = rng.gen_range(0.0..=1.0);
                    let on_road = GeoPoint::new(a.lat + t * (b.lat - a.lat), a.lng + t * (b.lng - a.lng));
                    features.push(Feature {
                        class: FeatureClass::Building,
                        kind: None,
                        geometry: FeatureGeometry::Point {
                            coordinates: jitter(rng, on_road, 0.0005),
                        },
                    });
                }
            }
        }

        info!(
            "Generated synthetic world: {} settlements, {} stores, {} anchors, {} features",
            settlements.len(),
            stores.len(),
            anchors.len(),
            features.len()
        );

        Self {
            region: *region,
            stores,
            settlements,
            anchors,
            features,
        }
    }

    pub fn feature_provider(&self, name: &str) -> OfflineFeatureProvider {
        OfflineFeatureProvider::new(name, self.features.clone())
    }

    pub fn pipeline_input(&self) -> PipelineInput {
        PipelineInput {
            region: self.region,
            stores: self.stores.clone(),
            settlements: self.settlements.clone(),
            anchors: Some(self.anchors.clone()),
        }
    }
}
