//! Anti-cannibalization
//!
//! 1. Hard minimum great-circle distance to every existing store.
//! 2. Optional per-city cap, keeping each city's best candidates.
//! 3. Drive-time non-maximum suppression over the ranked list: a candidate
//!    within the drive-time radius of a higher-scoring kept candidate is
//!    removed for good.
//!
//! All orderings are by score descending with candidate id as the tie-break,
//! so results never depend on input order.

use crate::config::{ExpansionConfig, NmsConfig};
use crate::selector::by_rank;
use crate::{nearest_store, AreaClass, ExistingStore, ScoredCandidate};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

pub const REJECT_MIN_DISTANCE: &str = "min_distance";
pub const REJECT_MAX_PER_CITY: &str = "max_per_city";
pub const REJECT_DRIVE_TIME: &str = "drive_time_nms";

/// Survivors plus a histogram of why the rest were dropped
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub survivors: Vec<ScoredCandidate>,
    pub rejections: BTreeMap<String, usize>,
}

impl FilterOutcome {
    fn reject(&mut self, reason: &str, n: usize) {
        if n > 0 {
            *self.rejections.entry(reason.to_string()).or_insert(0) += n;
        }
    }
}

/// Approximate drive time in minutes for a straight-line distance
pub fn drive_time_minutes(distance_km: f64, area: AreaClass, nms: &NmsConfig) -> f64 {
    let speed = match area {
        AreaClass::Urban => nms.urban_speed_kmh,
        AreaClass::Suburban => nms.suburban_speed_kmh,
        AreaClass::Rural => nms.rural_speed_kmh,
    };
    distance_km * nms.circuity / speed.max(f64::EPSILON) * 60.0
}

pub struct AntiCannibalizationFilter<'a> {
    config: &'a ExpansionConfig,
    stores: &'a [ExistingStore],
}

impl<'a> AntiCannibalizationFilter<'a> {
    pub fn new(config: &'a ExpansionConfig, stores: &'a [ExistingStore]) -> Self {
        Self { config, stores }
    }

    /// Steps 1 and 2. Output is in rank order.
    pub fn filter(&self, mut candidates: Vec<ScoredCandidate>) -> FilterOutcome {
        let input = candidates.len();
        candidates.sort_by(by_rank);
        let mut outcome = FilterOutcome::default();

        // Step 1: minimum distance to existing stores
        let min_km = self.config.min_distance_km;
        let before = candidates.len();
        candidates.retain(|c| match nearest_store(c.candidate.center, self.stores) {
            Some((store, d)) if d < min_km => {
                debug!(candidate = %c.candidate.id, store = %store.id, distance_km = d, "too close to existing store");
                false
            }
            _ => true,
        });
        outcome.reject(REJECT_MIN_DISTANCE, before - candidates.len());

        // Step 2: per-city cap
        if let Some(max_per_city) = self.config.max_per_city {
            let mut per_city: HashMap<String, usize> = HashMap::new();
            let before = candidates.len();
            // Ranked order, so each city keeps its best
            candidates.retain(|c| {
                let n = per_city.entry(c.candidate.city.clone()).or_insert(0);
                *n += 1;
                *n <= max_per_city
            });
            outcome.reject(REJECT_MAX_PER_CITY, before - candidates.len());
        }

        info!(
            "Anti-cannibalization: {} in, {} out (min_distance={:.1}km, max_per_city={:?})",
            input,
            candidates.len(),
            min_km,
            self.config.max_per_city
        );
        outcome.survivors = candidates;
        outcome
    }

    /// Step 3: drive-time NMS over an already ranked list
    pub fn suppress(&self, ranked: Vec<ScoredCandidate>) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        if !self.config.nms.enabled {
            outcome.survivors = ranked;
            return outcome;
        }
        let (kept, suppressed) = non_max_suppression(ranked, &self.config.nms);
        outcome.reject(REJECT_DRIVE_TIME, suppressed);
        outcome.survivors = kept;
        outcome
    }
}

/// Greedy NMS in rank order. The drive speed comes from the area class of
/// the already kept, higher-scoring candidate.
pub fn non_max_suppression(mut candidates: Vec<ScoredCandidate>, nms: &NmsConfig) -> (Vec<ScoredCandidate>, usize) {
    candidates.sort_by(by_rank);
    let mut kept: Vec<ScoredCandidate> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut suppressed = 0;

    for c in candidates {
        if !seen.insert(c.candidate.id.clone()) {
            continue;
        }
        let blocker = kept.iter().find(|k| {
            let d = k.candidate.center.distance_km(c.candidate.center);
            drive_time_minutes(d, k.explanation.area_class, nms) <= nms.drive_time_minutes
        });
        match blocker {
            Some(k) => {
                debug!(candidate = %c.candidate.id, by = %k.candidate.id, "suppressed by drive-time NMS");
                suppressed += 1;
            }
            None => kept.push(c),
        }
    }
    (kept, suppressed)
}

/// Test fixtures shared with other modules' tests
#[cfg(test)]
pub(crate) mod fixtures {
    use crate::geo::GeoPoint;
    use crate::scorer::{DataQuality, RawFactors, ScoreExplanation, WhiteSpaceAssessment};
    use crate::{AreaClass, Candidate, ExistingStore, ScoredCandidate};

    pub fn make_scored(id: &str, lat: f64, lng: f64, city: &str, region: &str, score: f64) -> ScoredCandidate {
        ScoredCandidate {
            candidate: Candidate {
                id: id.to_string(),
                cell_id: format!("cell-{id}"),
                center: GeoPoint::new(lat, lng),
                boundary: vec![],
                city: city.to_string(),
                region: region.to_string(),
                provisional_score: None,
            },
            raw_factors: RawFactors {
                population: 10_000.0,
                anchor_count: 1.0,
                nearest_store_km: None,
                peer_performance: 0.5,
                market_saturation: 0.0,
                urban_density_index: 0.3,
                landuse: None,
                area_class: AreaClass::Suburban,
            },
            data_quality: DataQuality::default(),
            score,
            confidence: 1.0,
            explanation: ScoreExplanation {
                factors: vec![],
                white_space: WhiteSpaceAssessment {
                    is_white_space: true,
                    coverage_radius_km: 17.5,
                    nearest_store_km: None,
                    gap_points: 25.0,
                },
                area_class: AreaClass::Suburban,
                completeness: 1.0,
            },
            fell_back: false,
            rationale: None,
        }
    }

    pub fn make_store(id: &str, lat: f64, lng: f64) -> ExistingStore {
        ExistingStore {
            id: id.to_string(),
            location: GeoPoint::new(lat, lng),
            city: "Anytown".into(),
            region: "R".into(),
            country: "US".into(),
            trailing_turnover: None,
            population_band: None,
        }
    }
}
