//! Data loading from JSON files

use crate::provider::{StoreFilter, StoreSource};
use crate::{
    AnchorKind, AnchorPoi, ExistingStore, GeoPoint, PopulationBand, PopulationSource, Result, SelectorError,
    Settlement, SettlementTier, UNKNOWN_ADMIN,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Validate latitude is in valid range
fn is_valid_latitude(lat: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && lat.is_finite()
}

/// Validate longitude is in valid range
fn is_valid_longitude(lon: f64) -> bool {
    (-180.0..=180.0).contains(&lon) && lon.is_finite()
}

/// Sanitize ID (alphanumeric, dash, underscore only)
fn sanitize_id(id: String) -> String {
    id.chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(128)
        .collect()
}

/// Sanitize name (allow more chars but still limit)
fn sanitize_name(name: String) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || " -_.,()&'".contains(*c))
        .take(256)
        .collect()
}

fn coords(lat: Option<f64>, lng: Option<f64>) -> Option<GeoPoint> {
    match (lat, lng) {
        (Some(lat), Some(lng)) if is_valid_latitude(lat) && is_valid_longitude(lng) => Some(GeoPoint::new(lat, lng)),
        _ => None,
    }
}

fn admin_or_unknown(name: Option<String>) -> String {
    match name.map(sanitize_name) {
        Some(n) if !n.trim().is_empty() => n,
        _ => UNKNOWN_ADMIN.to_string(),
    }
}

/// Raw store record from JSON
#[derive(Debug, Deserialize)]
struct RawStore {
    id: Option<String>,
    #[serde(alias = "lat")]
    latitude: Option<f64>,
    #[serde(alias = "lng", alias = "lon")]
    longitude: Option<f64>,
    city: Option<String>,
    #[serde(alias = "state")]
    region: Option<String>,
    country: Option<String>,
    #[serde(alias = "turnover")]
    trailing_turnover: Option<f64>,
    population_band: Option<PopulationBand>,
}

/// Raw settlement record from JSON
#[derive(Debug, Deserialize)]
struct RawSettlement {
    name: Option<String>,
    #[serde(alias = "state")]
    region: Option<String>,
    #[serde(alias = "lat")]
    latitude: Option<f64>,
    #[serde(alias = "lng", alias = "lon")]
    longitude: Option<f64>,
    population: Option<u64>,
    tier: Option<SettlementTier>,
    population_source: Option<PopulationSource>,
}

/// Raw anchor POI record from JSON
#[derive(Debug, Deserialize)]
struct RawAnchor {
    id: Option<String>,
    kind: Option<String>,
    #[serde(alias = "lat")]
    latitude: Option<f64>,
    #[serde(alias = "lng", alias = "lon")]
    longitude: Option<f64>,
}

/// Read a JSON array, either bare or under `field`
fn read_records<T: DeserializeOwned>(path: &Path, field: &str) -> Result<Vec<T>> {
    let reader = BufReader::new(File::open(path)?);
    let raw: serde_json::Value = serde_json::from_reader(reader)?;

    if let Some(records) = raw.get(field) {
        Ok(serde_json::from_value(records.clone())?)
    } else if raw.is_array() {
        Ok(serde_json::from_value(raw)?)
    } else {
        Err(SelectorError::Configuration(format!(
            "{:?}: expected an array or an object with a '{}' array",
            path, field
        )))
    }
}

/// Load existing stores from a JSON file
pub fn load_stores(path: impl AsRef<Path>) -> Result<Vec<ExistingStore>> {
    let path = path.as_ref();
    info!("Loading stores from {:?}", path);
    let records: Vec<RawStore> = read_records(path, "stores")?;

    let mut stores = Vec::with_capacity(records.len());
    let mut skipped = 0;

    for (i, raw) in records.into_iter().enumerate() {
        let Some(location) = coords(raw.latitude, raw.longitude) else {
            skipped += 1;
            continue;
        };
        let turnover = raw.trailing_turnover.filter(|t| t.is_finite() && *t >= 0.0);

        stores.push(ExistingStore {
            id: sanitize_id(raw.id.unwrap_or_else(|| format!("store-{}", i))),
            location,
            city: admin_or_unknown(raw.city),
            region: admin_or_unknown(raw.region),
            country: raw.country.map(|c| c.trim().to_uppercase()).unwrap_or_default(),
            trailing_turnover: turnover,
            population_band: raw.population_band,
        });
    }

    info!("Loaded {} stores ({} skipped for missing coords)", stores.len(), skipped);
    Ok(stores)
}

/// Load settlements from a JSON file
pub fn load_settlements(path: impl AsRef<Path>) -> Result<Vec<Settlement>> {
    let path = path.as_ref();
    info!("Loading settlements from {:?}", path);
    let records: Vec<RawSettlement> = read_records(path, "settlements")?;

    let mut settlements = Vec::with_capacity(records.len());
    let mut skipped = 0;

    for (i, raw) in records.into_iter().enumerate() {
        let Some(location) = coords(raw.latitude, raw.longitude) else {
            skipped += 1;
            continue;
        };
        let population = raw.population.unwrap_or(0);

        settlements.push(Settlement {
            name: raw
                .name
                .map(sanitize_name)
                .unwrap_or_else(|| format!("settlement-{}", i)),
            region: admin_or_unknown(raw.region),
            location,
            population,
            tier: raw.tier.unwrap_or_else(|| SettlementTier::from_population(population)),
            // Without a population figure nothing can be called measured
            population_source: match raw.population {
                Some(_) => raw.population_source.unwrap_or_default(),
                None => PopulationSource::Estimate,
            },
        });
    }

    info!("Loaded {} settlements ({} skipped for missing coords)", settlements.len(), skipped);
    Ok(settlements)
}

/// Load anchor POIs from a JSON file. Unknown kinds are skipped.
pub fn load_anchors(path: impl AsRef<Path>) -> Result<Vec<AnchorPoi>> {
    let path = path.as_ref();
    info!("Loading anchors from {:?}", path);
    let records: Vec<RawAnchor> = read_records(path, "anchors")?;

    let mut anchors = Vec::with_capacity(records.len());
    let mut skipped = 0;

    for (i, raw) in records.into_iter().enumerate() {
        let kind = match raw.kind.as_deref().map(|k| k.trim().to_ascii_lowercase()).as_deref() {
            Some("mall" | "shopping_centre" | "shopping_center") => AnchorKind::Mall,
            Some("grocery" | "supermarket" | "retail") => AnchorKind::Grocery,
            Some("transit" | "station" | "bus_station" | "train_station") => AnchorKind::Transit,
            other => {
                debug!(index = i, kind = ?other, "skipping anchor with unknown kind");
                skipped += 1;
                continue;
            }
        };
        let Some(location) = coords(raw.latitude, raw.longitude) else {
            skipped += 1;
            continue;
        };
        anchors.push(AnchorPoi {
            id: sanitize_id(raw.id.unwrap_or_else(|| format!("anchor-{}", i))),
            kind,
            location,
        });
    }

    info!("Loaded {} anchors ({} skipped)", anchors.len(), skipped);
    Ok(anchors)
}

/// Store source reading a JSON file on every call
#[derive(Debug, Clone)]
pub struct JsonStoreSource {
    path: PathBuf,
}

impl JsonStoreSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StoreSource for JsonStoreSource {
    async fn list_stores(&self, filter: &StoreFilter) -> Result<Vec<ExistingStore>> {
        let stores = load_stores(&self.path)?;
        let total = stores.len();
        let matched: Vec<ExistingStore> = stores.into_iter().filter(|s| filter.matches(s)).collect();
        debug!(total, matched = matched.len(), "filtered stores");
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_json(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_stores() {
        let file = write_json(
            r#"[
            {"id": "s-1", "lat": 40.0, "lng": -74.0, "city": "Newark", "state": "NJ", "country": "us", "turnover": 1200000},
            {"id": "s-2", "city": "No Coords"},
            {"id": "s-3", "latitude": 95.0, "longitude": -74.0}
        ]"#,
        );

        let stores = load_stores(file.path()).unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].id, "s-1");
        assert_eq!(stores[0].region, "NJ");
        assert_eq!(stores[0].country, "US");
        assert_eq!(stores[0].trailing_turnover, Some(1_200_000.0));
    }

    #[test]
    fn test_load_stores_wrapped_object() {
        let file = write_json(r#"{"stores": [{"id": "s-1", "latitude": 40.0, "longitude": -74.0}]}"#);
        let stores = load_stores(file.path()).unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].city, UNKNOWN_ADMIN);
    }

    #[test]
    fn test_load_settlements_infers_tier_and_source() {
        let file = write_json(
            r#"{"settlements": [
            {"name": "Big", "region": "R", "lat": 40.0, "lng": -74.0, "population": 250000, "population_source": "census"},
            {"name": "Hamlet", "region": "R", "lat": 40.1, "lng": -74.1}
        ]}"#,
        );
        let settlements = load_settlements(file.path()).unwrap();
        assert_eq!(settlements.len(), 2);
        assert_eq!(settlements[0].tier, SettlementTier::City);
        assert_eq!(settlements[0].population_source, PopulationSource::Census);
        assert_eq!(settlements[1].tier, SettlementTier::Village);
        assert_eq!(settlements[1].population_source, PopulationSource::Estimate);
    }

    #[test]
    fn test_load_anchors_skips_unknown_kinds() {
        let file = write_json(
            r#"[
            {"id": "a1", "kind": "Supermarket", "lat": 40.0, "lng": -74.0},
            {"id": "a2", "kind": "stadium", "lat": 40.0, "lng": -74.0},
            {"id": "a3", "kind": "mall", "lat": 40.0, "lng": -74.0}
        ]"#,
        );
        let anchors = load_anchors(file.path()).unwrap();
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].kind, AnchorKind::Grocery);
        assert_eq!(anchors[1].kind, AnchorKind::Mall);
    }

    #[test]
    fn test_scalar_json_is_configuration_error() {
        let file = write_json("42");
        assert!(matches!(load_stores(file.path()), Err(SelectorError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_json_store_source_filters() {
        let file = write_json(
            r#"[
            {"id": "s-1", "lat": 40.0, "lng": -74.0, "region": "NJ", "country": "US"},
            {"id": "s-2", "lat": 41.0, "lng": -73.9, "region": "NY", "country": "US"},
            {"id": "s-3", "lat": 45.5, "lng": -73.6, "region": "QC", "country": "CA"}
        ]"#,
        );
        let source = JsonStoreSource::new(file.path());
        let us = source
            .list_stores(&StoreFilter {
                country: Some("us".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(us.len(), 2);

        let ny = source
            .list_stores(&StoreFilter {
                region: Some("NY".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ny.len(), 1);
        assert_eq!(ny[0].id, "s-2");
    }
}
