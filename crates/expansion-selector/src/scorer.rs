//! Candidate scoring
//!
//! Five-factor model with data-quality-aware weights:
//! Score(c) = 100 · (ŵ_P·P + ŵ_G·G + ŵ_A·A + ŵ_R·R + ŵ_M·M)
//!
//! Factors backed by estimates rather than measurements have their weight
//! capped; whatever the caps remove moves onto the coverage-gap factor, which
//! is purely geometric, before the weights are renormalized to sum to 1.

use crate::config::{ExpansionConfig, FactorWeights, WeightCaps};
use crate::geo::GeoPoint;
use crate::{nearest_store, AnchorKind, AnchorPoi, AreaClass, Candidate, ExistingStore, PopulationSource, Settlement};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Radius for counting anchor POIs around a site
pub const ANCHOR_RADIUS_KM: f64 = 2.0;
/// Radius for peer store performance
pub const PEER_RADIUS_KM: f64 = 25.0;
/// Radius for market saturation
pub const SATURATION_RADIUS_KM: f64 = 10.0;
/// Settlements contribute population with linear decay out to this radius
pub const POPULATION_RADIUS_KM: f64 = 10.0;

/// Catchment population at which the population factor saturates
const POPULATION_NORM: f64 = 150_000.0;
/// Effective anchor count at which the anchor factor saturates
const ANCHOR_NORM: f64 = 10.0;
/// Stores per 100k residents treated as fully saturated
const SATURATION_NORM_PER_100K: f64 = 5.0;
/// Residents per unit of urban density when no settlement data reaches a site
const DENSITY_POPULATION_SCALE: f64 = 60_000.0;
/// Confidence penalty when a validator fell back to default-valid
const FALLBACK_CONFIDENCE_FACTOR: f64 = 0.85;
/// Weight given to an estimated factor when computing confidence
const ESTIMATED_CONFIDENCE_SHARE: f64 = 0.5;

/// Measured or estimated inputs behind the five factors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFactors {
    pub population: f64,
    /// Anchor count after mall/grocery de-duplication
    pub anchor_count: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_store_km: Option<f64>,
    /// Nearby turnover relative to the network, in [0,1] (0.5 = on par)
    pub peer_performance: f64,
    /// Stores per 100k residents within the saturation radius
    pub market_saturation: f64,
    pub urban_density_index: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landuse: Option<String>,
    pub area_class: AreaClass,
}

/// Which factors rest on estimates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DataQuality {
    pub population_estimated: bool,
    pub coverage_gap_estimated: bool,
    pub anchors_estimated: bool,
    pub peer_performance_estimated: bool,
    pub saturation_estimated: bool,
}

impl DataQuality {
    fn flags(&self) -> [bool; 5] {
        [
            self.population_estimated,
            self.coverage_gap_estimated,
            self.anchors_estimated,
            self.peer_performance_estimated,
            self.saturation_estimated,
        ]
    }

    /// Fraction of factors that are measured
    pub fn completeness(&self) -> f64 {
        let measured = self.flags().iter().filter(|f| !**f).count();
        measured as f64 / 5.0
    }
}

/// Signals carried over from validation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationSignals {
    pub urban_density_index: Option<f64>,
    pub landuse: Option<String>,
    /// A validator fell back to default-valid or could not run
    pub fell_back: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorBreakdown {
    pub name: String,
    pub nominal_weight: f64,
    pub effective_weight: f64,
    /// Normalized factor value in [0,1]
    pub value: f64,
    /// Contribution to the final score
    pub points: f64,
    pub estimated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteSpaceAssessment {
    pub is_white_space: bool,
    pub coverage_radius_km: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_store_km: Option<f64>,
    /// Coverage-gap points before normalization (0 to the boost cap)
    pub gap_points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreExplanation {
    pub factors: Vec<FactorBreakdown>,
    pub white_space: WhiteSpaceAssessment,
    pub area_class: AreaClass,
    pub completeness: f64,
}

/// AI or templated narrative for a selected candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rationale {
    pub source: RationaleSource,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RationaleSource {
    Ai,
    Template,
}

/// Candidate with score and its supporting evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub raw_factors: RawFactors,
    pub data_quality: DataQuality,
    /// Final score in [0,100]
    pub score: f64,
    /// Confidence in [0,1]
    pub confidence: f64,
    pub explanation: ScoreExplanation,
    pub fell_back: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<Rationale>,
}

/// Effective weights after data-quality capping, redistribution onto the
/// coverage-gap factor, and renormalization. Always sums to 1.
pub fn effective_weights(nominal: &FactorWeights, caps: &WeightCaps, quality: &DataQuality) -> FactorWeights {
    let cap = |w: f64, estimated: bool, factor: f64| if estimated { w * factor } else { w };

    let population = cap(nominal.population, quality.population_estimated, caps.estimated_population);
    let anchors = cap(nominal.anchors, quality.anchors_estimated, caps.estimated_anchors);
    let peer_performance = cap(
        nominal.peer_performance,
        quality.peer_performance_estimated,
        caps.estimated_peer_performance,
    );
    let removed = (nominal.population - population) + (nominal.anchors - anchors) + (nominal.peer_performance - peer_performance);

    let adjusted = FactorWeights {
        population,
        coverage_gap: nominal.coverage_gap + removed,
        anchors,
        peer_performance,
        saturation: nominal.saturation,
    };

    let total = adjusted.sum();
    if total <= 0.0 || !total.is_finite() {
        return FactorWeights {
            population: 0.0,
            coverage_gap: 1.0,
            anchors: 0.0,
            peer_performance: 0.0,
            saturation: 0.0,
        };
    }
    FactorWeights {
        population: adjusted.population / total,
        coverage_gap: adjusted.coverage_gap / total,
        anchors: adjusted.anchors / total,
        peer_performance: adjusted.peer_performance / total,
        saturation: adjusted.saturation / total,
    }
}

/// Anchor count with an overlap fraction of grocery anchors assumed to sit
/// inside malls
pub fn deduplicated_anchor_count(malls: usize, grocery: usize, transit: usize, overlap_fraction: f64) -> f64 {
    let grocery = grocery as f64;
    let co_located = if malls > 0 { grocery * overlap_fraction } else { 0.0 };
    malls as f64 + (grocery - co_located) + transit as f64
}

/// Derives raw factors for a site from the network and settlement data
pub struct FactorContext<'a> {
    config: &'a ExpansionConfig,
    stores: &'a [ExistingStore],
    settlements: &'a [Settlement],
    anchors: Option<&'a [AnchorPoi]>,
    median_turnover: Option<f64>,
}

impl<'a> FactorContext<'a> {
    pub fn new(
        config: &'a ExpansionConfig,
        stores: &'a [ExistingStore],
        settlements: &'a [Settlement],
        anchors: Option<&'a [AnchorPoi]>,
    ) -> Self {
        let mut turnovers: Vec<f64> = stores
            .iter()
            .filter_map(|s| s.trailing_turnover)
            .filter(|t| t.is_finite() && *t > 0.0)
            .collect();
        turnovers.sort_by(|a, b| a.total_cmp(b));
        let median_turnover = match turnovers.len() {
            0 => None,
            n if n % 2 == 1 => Some(turnovers[n / 2]),
            n => Some((turnovers[n / 2 - 1] + turnovers[n / 2]) / 2.0),
        };

        Self {
            config,
            stores,
            settlements,
            anchors,
            median_turnover,
        }
    }

    /// Population reachable from a site, and whether it is an estimate
    fn population(&self, p: GeoPoint, density: f64) -> (f64, bool) {
        let mut total = 0.0;
        let mut any = false;
        let mut all_census = true;
        for s in self.settlements {
            let d = p.distance_km(s.location);
            if d < POPULATION_RADIUS_KM {
                total += s.population as f64 * (1.0 - d / POPULATION_RADIUS_KM);
                any = true;
                all_census &= s.population_source == PopulationSource::Census;
            }
        }
        if any {
            (total, !all_census)
        } else {
            (density * DENSITY_POPULATION_SCALE, true)
        }
    }

    /// Density for sites the urban validator could not assess
    fn estimated_density(&self, p: GeoPoint) -> f64 {
        let (population, _) = self.population(p, 0.0);
        (population / POPULATION_NORM).clamp(0.0, 1.0)
    }

    fn anchors(&self, p: GeoPoint, density: f64) -> (f64, bool) {
        match self.anchors {
            Some(anchors) => {
                let (mut malls, mut grocery, mut transit) = (0, 0, 0);
                for a in anchors.iter().filter(|a| p.distance_km(a.location) <= ANCHOR_RADIUS_KM) {
                    match a.kind {
                        AnchorKind::Mall => malls += 1,
                        AnchorKind::Grocery => grocery += 1,
                        AnchorKind::Transit => transit += 1,
                    }
                }
                (
                    deduplicated_anchor_count(malls, grocery, transit, self.config.anchor_overlap_fraction),
                    false,
                )
            }
            None => (density * ANCHOR_NORM * 0.5, true),
        }
    }

    fn peer_performance(&self, p: GeoPoint) -> (f64, bool) {
        let Some(median) = self.median_turnover else {
            return (0.5, true);
        };
        let nearby: Vec<f64> = self
            .stores
            .iter()
            .filter(|s| p.distance_km(s.location) <= PEER_RADIUS_KM)
            .filter_map(|s| s.trailing_turnover)
            .filter(|t| t.is_finite() && *t > 0.0)
            .collect();
        if nearby.is_empty() {
            return (0.5, true);
        }
        let mean = nearby.iter().sum::<f64>() / nearby.len() as f64;
        ((mean / median / 2.0).clamp(0.0, 1.0), false)
    }

    fn saturation(&self, p: GeoPoint, population: f64) -> f64 {
        let count = self
            .stores
            .iter()
            .filter(|s| p.distance_km(s.location) <= SATURATION_RADIUS_KM)
            .count();
        if count == 0 {
            0.0
        } else {
            count as f64 / (population.max(1_000.0) / 100_000.0)
        }
    }

    pub fn raw_factors(&self, candidate: &Candidate, signals: &ValidationSignals) -> (RawFactors, DataQuality) {
        let p = candidate.center;
        let density = signals
            .urban_density_index
            .unwrap_or_else(|| self.estimated_density(p))
            .clamp(0.0, 1.0);

        let (population, population_estimated) = self.population(p, density);
        let (anchor_count, anchors_estimated) = self.anchors(p, density);
        let (peer_performance, peer_performance_estimated) = self.peer_performance(p);
        let market_saturation = self.saturation(p, population);

        let raw = RawFactors {
            population,
            anchor_count,
            nearest_store_km: nearest_store(p, self.stores).map(|(_, d)| d),
            peer_performance,
            market_saturation,
            urban_density_index: density,
            landuse: signals.landuse.clone(),
            area_class: AreaClass::from_urban_density(density),
        };
        let quality = DataQuality {
            population_estimated,
            coverage_gap_estimated: false,
            anchors_estimated,
            peer_performance_estimated,
            saturation_estimated: population_estimated,
        };
        (raw, quality)
    }
}

pub struct ScoringEngine<'a> {
    config: &'a ExpansionConfig,
    context: FactorContext<'a>,
}

impl<'a> ScoringEngine<'a> {
    pub fn new(
        config: &'a ExpansionConfig,
        stores: &'a [ExistingStore],
        settlements: &'a [Settlement],
        anchors: Option<&'a [AnchorPoi]>,
    ) -> Self {
        Self {
            config,
            context: FactorContext::new(config, stores, settlements, anchors),
        }
    }

    fn coverage_radius_km(&self, area: AreaClass) -> f64 {
        let radii = &self.config.coverage_radii;
        match area {
            AreaClass::Urban => radii.urban_km,
            AreaClass::Suburban => radii.suburban_km,
            AreaClass::Rural => radii.rural_km,
        }
    }

    /// Coverage-gap points: boosts for white space, a small proximity score otherwise
    pub fn white_space(&self, raw: &RawFactors) -> WhiteSpaceAssessment {
        let boosts = &self.config.white_space;
        let radius = self.coverage_radius_km(raw.area_class);

        let (is_white_space, gap_points) = match raw.nearest_store_km {
            Some(d) if d <= radius => (false, boosts.proximity_max * (d / radius).clamp(0.0, 1.0)),
            nearest => {
                let ratio = nearest.map_or(f64::INFINITY, |d| d / radius);
                let mut points = boosts.base;
                // High population
                if raw.population >= boosts.high_population_threshold {
                    points += boosts.high_population;
                }
                // Remoteness, linear from 1.0x up to the full boost at remoteness_ratio
                let span = (boosts.remoteness_ratio - 1.0).max(f64::EPSILON);
                points += boosts.remoteness * ((ratio - 1.0) / span).clamp(0.0, 1.0);
                // Rural
                if raw.area_class == AreaClass::Rural {
                    points += boosts.rural;
                }
                (true, points.min(boosts.max_total))
            }
        };

        WhiteSpaceAssessment {
            is_white_space,
            coverage_radius_km: radius,
            nearest_store_km: raw.nearest_store_km,
            gap_points,
        }
    }

    pub fn score(&self, candidate: Candidate, signals: &ValidationSignals) -> ScoredCandidate {
        let (raw, quality) = self.context.raw_factors(&candidate, signals);
        let white_space = self.white_space(&raw);

        // P: population catchment
        let population = (raw.population / POPULATION_NORM).clamp(0.0, 1.0);
        // G: coverage gap / white space
        let max_gap = self.config.white_space.max_total.max(f64::EPSILON);
        let coverage_gap = (white_space.gap_points / max_gap).clamp(0.0, 1.0);
        // A: anchors
        let anchors = (raw.anchor_count / ANCHOR_NORM).clamp(0.0, 1.0);
        // R: peer performance
        let peer = raw.peer_performance.clamp(0.0, 1.0);
        // M: market saturation (inverted)
        let saturation = 1.0 - (raw.market_saturation / SATURATION_NORM_PER_100K).clamp(0.0, 1.0);

        let effective = effective_weights(&self.config.weights, &self.config.weight_caps, &quality);
        let values = [population, coverage_gap, anchors, peer, saturation];
        let flags = quality.flags();

        let factors: Vec<FactorBreakdown> = self
            .config
            .weights
            .as_array()
            .iter()
            .zip(effective.as_array())
            .zip(values.iter().zip(flags))
            .map(|(((name, nominal), (_, eff)), (value, estimated))| FactorBreakdown {
                name: name.to_string(),
                nominal_weight: *nominal,
                effective_weight: eff,
                value: *value,
                points: 100.0 * eff * value,
                estimated,
            })
            .collect();

        let score = factors.iter().map(|f| f.points).sum::<f64>().clamp(0.0, 100.0);

        let mut confidence: f64 = factors
            .iter()
            .map(|f| f.effective_weight * if f.estimated { ESTIMATED_CONFIDENCE_SHARE } else { 1.0 })
            .sum();
        if signals.fell_back {
            confidence *= FALLBACK_CONFIDENCE_FACTOR;
        }
        let confidence = confidence.clamp(0.0, 1.0);

        debug!(
            "Scored {}: {:.2} (pop={:.2}, gap={:.2}, anchors={:.2}, peer={:.2}, sat={:.2}, conf={:.2})",
            candidate.id, score, population, coverage_gap, anchors, peer, saturation, confidence
        );

        ScoredCandidate {
            candidate,
            explanation: ScoreExplanation {
                factors,
                white_space,
                area_class: raw.area_class,
                completeness: quality.completeness(),
            },
            raw_factors: raw,
            data_quality: quality,
            score,
            confidence,
            fell_back: signals.fell_back,
            rationale: None,
        }
    }
}
