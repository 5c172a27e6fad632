//! Planar and spherical geometry helpers
//!
//! Distances between sites use the haversine formula. Anything that needs
//! planar math (hexagon layout, point-to-segment distance) goes through a
//! local equirectangular projection centred near the points involved, which
//! keeps errors well under a percent at city and province scale.

use crate::{haversine_km, Result, SelectorError};
use serde::{Deserialize, Serialize};

/// km per degree of latitude
const KM_PER_DEG_LAT: f64 = 110.574;
/// km per degree of longitude at the equator
const KM_PER_DEG_LNG: f64 = 111.320;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn distance_km(&self, other: GeoPoint) -> f64 {
        haversine_km(self.lat, self.lng, other.lat, other.lng)
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Lat/lng aligned rectangle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, min_lng: f64, max_lat: f64, max_lng: f64) -> Result<Self> {
        let bbox = Self {
            min_lat,
            min_lng,
            max_lat,
            max_lng,
        };
        let corners_valid = GeoPoint::new(min_lat, min_lng).is_valid() && GeoPoint::new(max_lat, max_lng).is_valid();
        if !corners_valid || min_lat >= max_lat || min_lng >= max_lng {
            return Err(SelectorError::Configuration(format!(
                "invalid bounding box {min_lat},{min_lng},{max_lat},{max_lng}"
            )));
        }
        Ok(bbox)
    }

    /// Parse `minLat,minLng,maxLat,maxLng`
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SelectorError::Configuration(format!("bad region '{s}': {e}")))?;
        match parts.as_slice() {
            [a, b, c, d] => Self::new(*a, *b, *c, *d),
            _ => Err(SelectorError::Configuration(format!(
                "region '{s}' must have four comma-separated values"
            ))),
        }
    }

    pub fn contains(&self, p: GeoPoint) -> bool {
        p.lat >= self.min_lat && p.lat <= self.max_lat && p.lng >= self.min_lng && p.lng <= self.max_lng
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint::new((self.min_lat + self.max_lat) / 2.0, (self.min_lng + self.max_lng) / 2.0)
    }

    /// Approximate area at the box's mid latitude
    pub fn area_km2(&self) -> f64 {
        let height = (self.max_lat - self.min_lat) * KM_PER_DEG_LAT;
        let width = (self.max_lng - self.min_lng) * KM_PER_DEG_LNG * self.center().lat.to_radians().cos();
        (height * width).max(0.0)
    }
}

/// Equirectangular projection to km around an origin
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    origin: GeoPoint,
    cos_lat: f64,
}

impl LocalProjection {
    pub fn new(origin: GeoPoint) -> Self {
        Self {
            origin,
            cos_lat: origin.lat.to_radians().cos().max(1e-6),
        }
    }

    pub fn project(&self, p: GeoPoint) -> (f64, f64) {
        (
            (p.lng - self.origin.lng) * KM_PER_DEG_LNG * self.cos_lat,
            (p.lat - self.origin.lat) * KM_PER_DEG_LAT,
        )
    }

    pub fn unproject(&self, x: f64, y: f64) -> GeoPoint {
        GeoPoint::new(
            self.origin.lat + y / KM_PER_DEG_LAT,
            self.origin.lng + x / (KM_PER_DEG_LNG * self.cos_lat),
        )
    }
}

/// Ray-casting point-in-ring test on raw lat/lng.
/// The ring is implicitly closed.
pub fn point_in_ring(p: GeoPoint, ring: &[GeoPoint]) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i].lng, ring[i].lat);
        let (xj, yj) = (ring[j].lng, ring[j].lat);
        if ((yi > p.lat) != (yj > p.lat)) && (p.lng < (xj - xi) * (p.lat - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Distance in km from `p` to the segment `a`-`b`, computed in a projection
/// centred on `p`.
pub fn point_segment_distance_km(p: GeoPoint, a: GeoPoint, b: GeoPoint) -> f64 {
    let proj = LocalProjection::new(p);
    let (ax, ay) = proj.project(a);
    let (bx, by) = proj.project(b);
    let (dx, dy) = (bx - ax, by - ay);
    let len2 = dx * dx + dy * dy;
    let t = if len2 > 0.0 {
        ((-ax * dx - ay * dy) / len2).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let (cx, cy) = (ax + t * dx, ay + t * dy);
    (cx * cx + cy * cy).sqrt()
}

/// Distance in km from `p` to a polyline (open) or ring (closed)
pub fn distance_to_path_km(p: GeoPoint, path: &[GeoPoint], closed: bool) -> f64 {
    match path.len() {
        0 => f64::INFINITY,
        1 => p.distance_km(path[0]),
        n => {
            let mut best = f64::INFINITY;
            for i in 0..n - 1 {
                best = best.min(point_segment_distance_km(p, path[i], path[i + 1]));
            }
            if closed {
                best = best.min(point_segment_distance_km(p, path[n - 1], path[0]));
            }
            best
        }
    }
}

/// Polygon with optional holes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Vec<GeoPoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub holes: Vec<Vec<GeoPoint>>,
}

impl Polygon {
    pub fn new(exterior: Vec<GeoPoint>) -> Self {
        Self {
            exterior,
            holes: Vec::new(),
        }
    }

    pub fn contains(&self, p: GeoPoint) -> bool {
        point_in_ring(p, &self.exterior) && !self.holes.iter().any(|h| point_in_ring(p, h))
    }

    /// Distance to the nearest edge of any ring, in km
    pub fn boundary_distance_km(&self, p: GeoPoint) -> f64 {
        self.holes
            .iter()
            .map(|h| distance_to_path_km(p, h, true))
            .fold(distance_to_path_km(p, &self.exterior, true), f64::min)
    }

    /// Zero inside, distance to the boundary outside
    pub fn distance_km(&self, p: GeoPoint) -> f64 {
        if self.contains(p) {
            0.0
        } else {
            self.boundary_distance_km(p)
        }
    }
}
