//! Expansion Site Selector
//!
//! Generates, validates, scores and selects new-site candidates for an
//! existing store network inside a geographic region.
//!
//! # Pipeline
//!
//! ```text
//! Tile → Validate (land + urban, bounded concurrency) → Score
//!      → AntiCannibalize (min distance, max per city, drive-time NMS)
//!      → AllocateFairness → Rank & Cap (≤ 300) → CostLimitEnrichment → Emit
//! ```
//!
//! # Scoring Model (5-factor, data-quality aware)
//!
//! ```text
//! Score(c) = 100 · Σ ŵᵢ · sᵢ        ŵ = normalize(cap(w, estimated flags))
//! ```
//!
//! | Factor | Nominal weight | Description |
//! |--------|----------------|-------------|
//! | P      | 0.25           | Population around the site |
//! | G      | 0.35           | Coverage gap / white space |
//! | A      | 0.20           | Anchor POI density (malls, grocery, transit) |
//! | R      | 0.20           | Peer store performance nearby |
//! | M      | 0.15           | Market saturation (inverted) |
//!
//! Weight removed from estimated factors is moved onto the coverage-gap
//! factor before renormalization.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

pub mod cache;
pub mod cannibalization;
pub mod config;
pub mod cost;
pub mod country;
pub mod geo;
pub mod loader;
pub mod pipeline;
pub mod provider;
pub mod rate_limit;
pub mod rationale;
pub mod scorer;
pub mod selector;
pub mod synthetic;
pub mod tiler;
pub mod validation;

pub use config::ExpansionConfig;
pub use geo::{BoundingBox, GeoPoint};
pub use pipeline::{CandidateSelectionPipeline, PipelineInput, PipelineOutput, Stage};
pub use scorer::{ScoredCandidate, ScoringEngine};

/// Absolute cap on emitted candidates, regardless of the requested target.
pub const HARD_CAP: usize = 300;

/// Mean Earth radius in km
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Region/city label used when nothing nearby can name a candidate's location.
pub const UNKNOWN_ADMIN: &str = "unknown";

#[derive(Error, Debug)]
pub enum SelectorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Provider unavailable ({provider}): {reason}")]
    ProviderUnavailable { provider: String, reason: String },
    #[error("Rate limit exceeded for {provider} after {attempts} attempts")]
    RateLimitExceeded { provider: String, attempts: u32 },
    #[error("Cache write failed for {key}: {reason}")]
    CacheWrite { key: String, reason: String },
    #[error("Run cancelled before stage {0:?}")]
    Cancelled(Stage),
}

pub type Result<T> = std::result::Result<T, SelectorError>;

/// Settlement size tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementTier {
    City,
    Town,
    Village,
}

impl SettlementTier {
    /// Towns and villages are the supplement pool when gap zones run dry
    pub fn is_small(&self) -> bool {
        matches!(self, Self::Town | Self::Village)
    }

    /// Tier inferred from population when the source does not carry one
    pub fn from_population(population: u64) -> Self {
        if population >= 100_000 {
            Self::City
        } else if population >= 5_000 {
            Self::Town
        } else {
            Self::Village
        }
    }
}

/// Where a population figure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulationSource {
    Census,
    #[default]
    Estimate,
}

/// A named settlement (city, town or village)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub name: String,
    pub region: String,
    pub location: GeoPoint,
    pub population: u64,
    pub tier: SettlementTier,
    #[serde(default)]
    pub population_source: PopulationSource,
}

/// Population band of the city an existing store sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulationBand {
    Metro,
    Large,
    Medium,
    Small,
}

/// An existing store in the network (read-only input)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingStore {
    pub id: String,
    pub location: GeoPoint,
    pub city: String,
    pub region: String,
    pub country: String,
    /// Trailing twelve-month turnover, when reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_turnover: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub population_band: Option<PopulationBand>,
}

/// Anchor point-of-interest category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorKind {
    Mall,
    Grocery,
    Transit,
}

/// A demand-generating point of interest near candidate sites
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorPoi {
    pub id: String,
    pub kind: AnchorKind,
    pub location: GeoPoint,
}

/// A prospective site produced by the tiler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub cell_id: String,
    pub center: GeoPoint,
    /// Hexagon of the originating cell (visualization only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boundary: Vec<GeoPoint>,
    pub city: String,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisional_score: Option<f64>,
}

/// Area classification driving coverage radius and drive speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaClass {
    Urban,
    Suburban,
    Rural,
}

impl AreaClass {
    pub fn from_urban_density(index: f64) -> Self {
        if index >= 0.6 {
            Self::Urban
        } else if index >= 0.25 {
            Self::Suburban
        } else {
            Self::Rural
        }
    }
}

/// Haversine distance between two points in km
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1 * PI / 180.0;
    let lat2_rad = lat2 * PI / 180.0;
    let dlat = (lat2 - lat1) * PI / 180.0;
    let dlon = (lon2 - lon1) * PI / 180.0;

    let a = (dlat / 2.0).sin().powi(2) + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Nearest existing store to a point, ties broken by store id
pub fn nearest_store<'a>(point: GeoPoint, stores: &'a [ExistingStore]) -> Option<(&'a ExistingStore, f64)> {
    stores
        .iter()
        .map(|s| (s, point.distance_km(s.location)))
        .min_by(|(a, da), (b, db)| da.total_cmp(db).then_with(|| a.id.cmp(&b.id)))
}
