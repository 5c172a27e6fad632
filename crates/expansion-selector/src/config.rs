//! Expansion run configuration
//!
//! Built once (defaults → JSON file → `EXPANSION_*` environment → CLI flags),
//! validated, then passed by reference into every stage. Nothing here is
//! mutated after a run starts.

use crate::{Result, SelectorError, HARD_CAP};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{info, warn};

/// Nominal factor weights
pub const W_POPULATION: f64 = 0.25;
pub const W_COVERAGE_GAP: f64 = 0.35;
pub const W_ANCHORS: f64 = 0.20;
pub const W_PEER_PERFORMANCE: f64 = 0.20;
pub const W_SATURATION: f64 = 0.15;

/// Default AI enrichment caps per environment
pub const AI_CAP_PRODUCTION: usize = 60;
pub const AI_CAP_DEVELOPMENT: usize = 30;

/// Hex resolution selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResolutionMode {
    Fixed { resolution: u8 },
    Adaptive { coarse: u8, medium: u8, fine: u8 },
}

impl Default for ResolutionMode {
    fn default() -> Self {
        Self::Adaptive {
            coarse: 6,
            medium: 7,
            fine: 8,
        }
    }
}

/// Per-factor nominal weights. They need not sum to 1; the scorer
/// normalizes after data-quality capping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    pub population: f64,
    pub coverage_gap: f64,
    pub anchors: f64,
    pub peer_performance: f64,
    pub saturation: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            population: W_POPULATION,
            coverage_gap: W_COVERAGE_GAP,
            anchors: W_ANCHORS,
            peer_performance: W_PEER_PERFORMANCE,
            saturation: W_SATURATION,
        }
    }
}

impl FactorWeights {
    pub fn as_array(&self) -> [(&'static str, f64); 5] {
        [
            ("population", self.population),
            ("coverage_gap", self.coverage_gap),
            ("anchors", self.anchors),
            ("peer_performance", self.peer_performance),
            ("saturation", self.saturation),
        ]
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().map(|(_, w)| w).sum()
    }
}

/// Fraction of nominal weight kept when a factor is estimated
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightCaps {
    pub estimated_population: f64,
    pub estimated_peer_performance: f64,
    pub estimated_anchors: f64,
}

impl Default for WeightCaps {
    fn default() -> Self {
        Self {
            estimated_population: 0.5,
            estimated_peer_performance: 0.5,
            estimated_anchors: 0.8,
        }
    }
}

/// Coverage radius (km) per area class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageRadii {
    pub urban_km: f64,
    pub suburban_km: f64,
    pub rural_km: f64,
}

impl Default for CoverageRadii {
    fn default() -> Self {
        Self {
            urban_km: 12.5,
            suburban_km: 17.5,
            rural_km: 25.0,
        }
    }
}

/// White-space boost points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhiteSpaceBoosts {
    pub base: f64,
    pub high_population: f64,
    pub high_population_threshold: f64,
    pub remoteness: f64,
    /// Distance ratio at which the remoteness boost is fully earned
    pub remoteness_ratio: f64,
    pub rural: f64,
    pub max_total: f64,
    /// Ceiling for the proximity score of non-white-space candidates
    pub proximity_max: f64,
}

impl Default for WhiteSpaceBoosts {
    fn default() -> Self {
        Self {
            base: 25.0,
            high_population: 15.0,
            high_population_threshold: 50_000.0,
            remoteness: 15.0,
            remoteness_ratio: 1.5,
            rural: 5.0,
            max_total: 50.0,
            proximity_max: 10.0,
        }
    }
}

/// Drive-time non-maximum suppression
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmsConfig {
    pub enabled: bool,
    pub drive_time_minutes: f64,
    /// Road distance over straight-line distance
    pub circuity: f64,
    pub urban_speed_kmh: f64,
    pub suburban_speed_kmh: f64,
    pub rural_speed_kmh: f64,
}

impl Default for NmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            drive_time_minutes: 10.0,
            circuity: 1.3,
            urban_speed_kmh: 30.0,
            suburban_speed_kmh: 45.0,
            rural_speed_kmh: 70.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FairnessConfig {
    /// Refill slots left empty by small regions from other regions
    pub redistribute_shortfall: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl std::str::FromStr for Environment {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(SelectorError::Configuration(format!("unknown environment '{other}'"))),
        }
    }
}

/// AI rationale budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiBudget {
    pub percentage: f64,
    /// Overrides the environment default when set
    pub absolute_cap: Option<usize>,
    pub avg_tokens_per_call: u64,
    pub input_usd_per_1k_tokens: f64,
    pub output_usd_per_1k_tokens: f64,
    pub concurrency: usize,
}

impl Default for AiBudget {
    fn default() -> Self {
        Self {
            percentage: 20.0,
            absolute_cap: None,
            avg_tokens_per_call: 1_500,
            input_usd_per_1k_tokens: 0.003,
            output_usd_per_1k_tokens: 0.015,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrbanFailurePolicy {
    #[default]
    Keep,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
        }
    }
}

/// Full configuration of an expansion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    pub environment: Environment,
    pub country_code: String,

    // Tiling
    pub resolution: ResolutionMode,
    pub samples_per_tile: usize,
    pub settlement_aware: bool,
    pub gap_focus_radius_km: f64,
    pub tile_target: usize,
    pub max_cells: usize,
    pub urban_density_hint: Option<f64>,

    // Validation
    pub coastline_buffer_m: f64,
    pub urban_search_radius_m: f64,
    pub urban_density_radius_m: f64,
    pub land_cache_ttl_days: i64,
    pub urban_cache_ttl_days: i64,
    pub validation_concurrency: usize,
    pub provider_requests_per_minute: Option<u32>,
    pub retry: RetryPolicy,
    pub urban_failure_policy: UrbanFailurePolicy,

    // Scoring
    pub weights: FactorWeights,
    pub weight_caps: WeightCaps,
    pub anchor_overlap_fraction: f64,
    pub coverage_radii: CoverageRadii,
    pub white_space: WhiteSpaceBoosts,

    // Selection
    pub min_distance_km: f64,
    pub max_per_city: Option<usize>,
    pub target_count: usize,
    pub nms: NmsConfig,
    pub fairness: FairnessConfig,

    // Enrichment
    pub ai: AiBudget,

    pub seed: u64,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Production,
            country_code: "US".to_string(),
            resolution: ResolutionMode::default(),
            samples_per_tile: 1,
            settlement_aware: true,
            gap_focus_radius_km: 15.0,
            tile_target: 600,
            max_cells: 20_000,
            urban_density_hint: None,
            coastline_buffer_m: 300.0,
            urban_search_radius_m: 150.0,
            urban_density_radius_m: 500.0,
            land_cache_ttl_days: 90,
            urban_cache_ttl_days: 30,
            validation_concurrency: 8,
            provider_requests_per_minute: None,
            retry: RetryPolicy::default(),
            urban_failure_policy: UrbanFailurePolicy::Keep,
            weights: FactorWeights::default(),
            weight_caps: WeightCaps::default(),
            anchor_overlap_fraction: 0.2,
            coverage_radii: CoverageRadii::default(),
            white_space: WhiteSpaceBoosts::default(),
            min_distance_km: 2.0,
            max_per_city: None,
            target_count: 100,
            nms: NmsConfig::default(),
            fairness: FairnessConfig::default(),
            ai: AiBudget::default(),
            seed: 42,
        }
    }
}

fn config_err(msg: impl Into<String>) -> SelectorError {
    SelectorError::Configuration(msg.into())
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| config_err(format!("{key}='{raw}': {e}")))
}

fn in_unit_range(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

impl ExpansionConfig {
    /// Load from a JSON file; missing fields take defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading expansion config from {:?}", path);
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Apply `EXPANSION_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply `EXPANSION_*` overrides from an arbitrary lookup
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        macro_rules! env_override {
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    $field = parse_env($key, &raw)?;
                }
            };
        }

        env_override!("EXPANSION_ENVIRONMENT", self.environment);
        env_override!("EXPANSION_SAMPLES_PER_TILE", self.samples_per_tile);
        env_override!("EXPANSION_COASTLINE_BUFFER_M", self.coastline_buffer_m);
        env_override!("EXPANSION_MIN_DISTANCE_KM", self.min_distance_km);
        env_override!("EXPANSION_TARGET_COUNT", self.target_count);
        env_override!("EXPANSION_AI_PERCENTAGE", self.ai.percentage);
        env_override!("EXPANSION_WEIGHT_POPULATION", self.weights.population);
        env_override!("EXPANSION_WEIGHT_COVERAGE_GAP", self.weights.coverage_gap);
        env_override!("EXPANSION_WEIGHT_ANCHORS", self.weights.anchors);
        env_override!("EXPANSION_WEIGHT_PEER_PERFORMANCE", self.weights.peer_performance);
        env_override!("EXPANSION_WEIGHT_SATURATION", self.weights.saturation);
        env_override!("EXPANSION_SEED", self.seed);

        if let Some(raw) = lookup("EXPANSION_COUNTRY") {
            self.country_code = raw.trim().to_uppercase();
        }
        if let Some(raw) = lookup("EXPANSION_MAX_PER_CITY") {
            self.max_per_city = Some(parse_env("EXPANSION_MAX_PER_CITY", &raw)?);
        }
        if let Some(raw) = lookup("EXPANSION_AI_CAP") {
            self.ai.absolute_cap = Some(parse_env("EXPANSION_AI_CAP", &raw)?);
        }
        if let Some(raw) = lookup("EXPANSION_RESOLUTION") {
            self.resolution = if raw.trim().eq_ignore_ascii_case("adaptive") {
                ResolutionMode::default()
            } else {
                ResolutionMode::Fixed {
                    resolution: parse_env("EXPANSION_RESOLUTION", &raw)?,
                }
            };
        }
        Ok(self)
    }

    /// Requested target clamped to the hard cap
    pub fn effective_target(&self) -> usize {
        self.target_count.min(HARD_CAP)
    }

    /// AI cap, falling back to the environment default
    pub fn ai_cap(&self) -> usize {
        self.ai.absolute_cap.unwrap_or(match self.environment {
            Environment::Production => AI_CAP_PRODUCTION,
            Environment::Development => AI_CAP_DEVELOPMENT,
        })
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        for (name, w) in self.weights.as_array() {
            if !w.is_finite() || w < 0.0 {
                return Err(config_err(format!("weight '{name}' must be a finite non-negative number, got {w}")));
            }
        }
        if self.weights.sum() <= 0.0 {
            return Err(config_err("at least one factor weight must be positive"));
        }
        let caps = &self.weight_caps;
        if ![caps.estimated_population, caps.estimated_peer_performance, caps.estimated_anchors]
            .into_iter()
            .all(in_unit_range)
        {
            return Err(config_err("weight caps must be within [0, 1]"));
        }
        if !in_unit_range(self.anchor_overlap_fraction) {
            return Err(config_err("anchor_overlap_fraction must be within [0, 1]"));
        }
        if !self.min_distance_km.is_finite() || !(0.0..=50.0).contains(&self.min_distance_km) {
            return Err(config_err(format!("min_distance_km must be within 0-50, got {}", self.min_distance_km)));
        }
        if let Some(max) = self.max_per_city {
            if !(1..=100).contains(&max) {
                return Err(config_err(format!("max_per_city must be within 1-100, got {max}")));
            }
        }
        if self.samples_per_tile == 0 {
            return Err(config_err("samples_per_tile must be at least 1"));
        }
        if self.target_count == 0 {
            return Err(config_err("target_count must be at least 1"));
        }
        if self.tile_target == 0 || self.max_cells == 0 {
            return Err(config_err("tile_target and max_cells must be at least 1"));
        }
        if !self.ai.percentage.is_finite() || !(0.0..=100.0).contains(&self.ai.percentage) {
            return Err(config_err(format!("ai.percentage must be within 0-100, got {}", self.ai.percentage)));
        }
        let r = &self.coverage_radii;
        if [r.urban_km, r.suburban_km, r.rural_km, self.gap_focus_radius_km]
            .iter()
            .any(|v| !v.is_finite() || *v <= 0.0)
        {
            return Err(config_err("coverage radii and gap focus radius must be positive"));
        }
        if !self.coastline_buffer_m.is_finite() || self.coastline_buffer_m < 0.0 {
            return Err(config_err("coastline_buffer_m must be non-negative"));
        }
        if self.urban_search_radius_m <= 0.0 || self.urban_density_radius_m <= 0.0 {
            return Err(config_err("urban search radii must be positive"));
        }
        if self.land_cache_ttl_days <= 0 || self.urban_cache_ttl_days <= 0 {
            return Err(config_err("cache TTLs must be positive"));
        }
        if self.nms.enabled && (self.nms.drive_time_minutes < 0.0 || self.nms.circuity < 1.0) {
            return Err(config_err("nms drive time must be non-negative and circuity at least 1.0"));
        }
        let resolutions = match self.resolution {
            ResolutionMode::Fixed { resolution } => vec![resolution],
            ResolutionMode::Adaptive { coarse, medium, fine } => vec![coarse, medium, fine],
        };
        for resolution in resolutions {
            if !(crate::tiler::MIN_RESOLUTION..=crate::tiler::MAX_RESOLUTION).contains(&resolution) {
                return Err(config_err(format!("resolution {resolution} is out of range")));
            }
        }
        if let Some(hint) = self.urban_density_hint {
            if !in_unit_range(hint) {
                return Err(config_err("urban_density_hint must be within [0, 1]"));
            }
        }
        if self.target_count > HARD_CAP {
            warn!(
                requested = self.target_count,
                cap = HARD_CAP,
                "target_count exceeds hard cap; clamping"
            );
        }
        Ok(())
    }
}
