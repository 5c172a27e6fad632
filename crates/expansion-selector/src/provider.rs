//! External collaborator contracts
//!
//! Feature providers answer radius queries around a coordinate with
//! classified map features; the validators turn those into land/urban
//! verdicts. The rationale provider produces prose for the enrichment subset.
//! Provider-specific response shapes stop at this boundary: everything past
//! here sees `FeatureResponse` or a decoded `RationaleResponse`.

use crate::geo::{distance_to_path_km, BoundingBox, GeoPoint, Polygon};
use crate::ExistingStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Transient failures worth another attempt
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureClass {
    Land,
    Water,
    Coastline,
    Landuse,
    Road,
    Building,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureGeometry {
    Point { coordinates: GeoPoint },
    LineString { coordinates: Vec<GeoPoint> },
    Polygon { polygon: Polygon },
    MultiPolygon { polygons: Vec<Polygon> },
}

impl FeatureGeometry {
    pub fn contains(&self, p: GeoPoint) -> bool {
        match self {
            Self::Polygon { polygon } => polygon.contains(p),
            Self::MultiPolygon { polygons } => polygons.iter().any(|poly| poly.contains(p)),
            Self::Point { .. } | Self::LineString { .. } => false,
        }
    }

    /// Distance in km; zero when an areal geometry contains the point
    pub fn distance_km(&self, p: GeoPoint) -> f64 {
        match self {
            Self::Point { coordinates } => p.distance_km(*coordinates),
            Self::LineString { coordinates } => distance_to_path_km(p, coordinates, false),
            Self::Polygon { polygon } => polygon.distance_km(p),
            Self::MultiPolygon { polygons } => polygons.iter().map(|poly| poly.distance_km(p)).fold(f64::INFINITY, f64::min),
        }
    }

    /// Distance in km to the outline, ignoring containment
    pub fn edge_distance_km(&self, p: GeoPoint) -> f64 {
        match self {
            Self::Polygon { polygon } => polygon.boundary_distance_km(p),
            Self::MultiPolygon { polygons } => polygons
                .iter()
                .map(|poly| poly.boundary_distance_km(p))
                .fold(f64::INFINITY, f64::min),
            other => other.distance_km(p),
        }
    }

    pub fn polygons(&self) -> Vec<&Polygon> {
        match self {
            Self::Polygon { polygon } => vec![polygon],
            Self::MultiPolygon { polygons } => polygons.iter().collect(),
            Self::Point { .. } | Self::LineString { .. } => Vec::new(),
        }
    }
}

/// One classified map feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub class: FeatureClass,
    /// Provider sub-type, e.g. "residential", "motorway", "lake"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub geometry: FeatureGeometry,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureResponse {
    pub features: Vec<Feature>,
}

impl FeatureResponse {
    pub fn of_class(&self, class: FeatureClass) -> impl Iterator<Item = &Feature> {
        self.features.iter().filter(move |f| f.class == class)
    }
}

#[async_trait]
pub trait FeatureProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn query(&self, lat: f64, lng: f64, radius_m: f64) -> Result<FeatureResponse, ProviderError>;
}

/// Feature index held in memory, optionally loaded from a JSON file
#[derive(Debug, Default)]
pub struct OfflineFeatureProvider {
    name: String,
    features: Vec<Feature>,
    calls: AtomicUsize,
}

impl OfflineFeatureProvider {
    pub fn new(name: impl Into<String>, features: Vec<Feature>) -> Self {
        Self {
            name: name.into(),
            features,
            calls: AtomicUsize::new(0),
        }
    }

    /// Load a `FeatureResponse`-shaped JSON document
    pub fn from_file(name: impl Into<String>, path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let response: FeatureResponse = serde_json::from_str(&content)?;
        Ok(Self::new(name, response.features))
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Number of queries answered so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FeatureProvider for OfflineFeatureProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, lat: f64, lng: f64, radius_m: f64) -> Result<FeatureResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let p = GeoPoint::new(lat, lng);
        if !p.is_valid() {
            return Err(ProviderError::Malformed(format!("invalid coordinate {lat},{lng}")));
        }
        let radius_km = radius_m / 1000.0;
        let features = self
            .features
            .iter()
            .filter(|f| f.geometry.distance_km(p) <= radius_km)
            .cloned()
            .collect();
        Ok(FeatureResponse { features })
    }
}

/// AI rationale response, decoded once at the adapter boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RationaleResponse {
    Text { text: String },
    Structured { summary: String, highlights: Vec<String> },
    Refusal { reason: String },
}

impl RationaleResponse {
    /// Decode a raw provider payload
    pub fn decode(raw: &serde_json::Value) -> Result<Self, ProviderError> {
        serde_json::from_value(raw.clone()).map_err(|e| ProviderError::Malformed(e.to_string()))
    }

    /// Display text, or `None` for a refusal or an empty answer
    pub fn into_text(self) -> Option<String> {
        let text = match self {
            Self::Text { text } => text,
            Self::Structured { summary, highlights } if highlights.is_empty() => summary,
            Self::Structured { summary, highlights } => format!("{} ({})", summary, highlights.join("; ")),
            Self::Refusal { .. } => return None,
        };
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

#[async_trait]
pub trait RationaleProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<RationaleResponse, ProviderError>;
}

/// Filter for listing stores
#[derive(Debug, Clone, Default)]
pub struct StoreFilter {
    pub country: Option<String>,
    pub region: Option<String>,
    pub within: Option<BoundingBox>,
}

impl StoreFilter {
    pub fn matches(&self, store: &ExistingStore) -> bool {
        self.country.as_ref().map_or(true, |c| store.country.eq_ignore_ascii_case(c))
            && self.region.as_ref().map_or(true, |r| store.region.eq_ignore_ascii_case(r))
            && self.within.as_ref().map_or(true, |b| b.contains(store.location))
    }
}

#[async_trait]
pub trait StoreSource: Send + Sync {
    async fn list_stores(&self, filter: &StoreFilter) -> crate::Result<Vec<ExistingStore>>;
}

/// Stores already in memory (demo mode, tests)
#[derive(Debug, Clone, Default)]
pub struct InMemoryStoreSource {
    stores: Vec<ExistingStore>,
}

impl InMemoryStoreSource {
    pub fn new(stores: Vec<ExistingStore>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl StoreSource for InMemoryStoreSource {
    async fn list_stores(&self, filter: &StoreFilter) -> crate::Result<Vec<ExistingStore>> {
        Ok(self.stores.iter().filter(|s| filter.matches(s)).cloned().collect())
    }
}
