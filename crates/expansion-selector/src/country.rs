//! Coarse country extents
//!
//! Used by the land validator when the feature source returns no land
//! polygons around a point. Boxes are loose; the fallback only rejects
//! points that are plainly in another country or mid-ocean.

use crate::geo::{BoundingBox, GeoPoint};

/// (code, min_lat, max_lat, min_lng, max_lng)
const COUNTRY_BOUNDS: &[(&str, f64, f64, f64, f64)] = &[
    // North America
    ("US", 24.5, 49.5, -125.0, -66.0),
    ("CA", 41.5, 83.0, -141.0, -52.0),
    ("MX", 14.5, 32.7, -118.4, -86.7),
    // Europe
    ("GB", 49.0, 61.0, -8.0, 2.0),
    ("IE", 51.4, 55.4, -10.5, -6.0),
    ("FR", 41.3, 51.1, -5.0, 9.6),
    ("DE", 47.3, 55.1, 5.9, 15.0),
    ("IT", 35.5, 47.1, 6.6, 18.5),
    ("ES", 36.0, 43.8, -9.5, 3.3),
    ("PT", 36.4, 42.2, -9.5, -6.2),
    ("NL", 50.8, 53.5, 3.4, 7.2),
    ("BE", 49.5, 51.5, 2.5, 6.4),
    ("CH", 45.8, 47.8, 5.9, 10.5),
    ("AT", 46.4, 49.0, 9.5, 17.2),
    ("DK", 54.5, 58.0, 8.0, 15.2),
    ("NO", 57.5, 71.2, 4.5, 31.1),
    ("SE", 55.3, 69.1, 11.1, 24.2),
    ("FI", 59.8, 70.1, 20.6, 31.6),
    ("PL", 49.0, 54.8, 14.1, 24.2),
    ("CZ", 48.5, 51.1, 12.1, 18.9),
    ("GR", 34.8, 41.8, 19.4, 29.6),
    // Asia
    ("AE", 22.6, 26.1, 51.0, 56.4),
    ("SA", 16.4, 32.2, 34.5, 55.7),
    ("TR", 36.0, 42.1, 26.0, 44.8),
    ("IN", 6.7, 35.5, 68.2, 97.4),
    ("TH", 5.6, 20.5, 97.3, 105.6),
    ("SG", 1.15, 1.50, 103.6, 104.1),
    ("MY", 0.9, 7.4, 100.0, 119.3),
    ("VN", 8.4, 23.4, 102.1, 109.5),
    ("ID", -11.0, 6.1, 95.0, 141.0),
    ("PH", 4.6, 21.1, 116.9, 126.6),
    ("CN", 18.2, 53.6, 73.7, 135.1),
    ("KR", 33.1, 38.7, 124.6, 131.9),
    ("JP", 24.0, 45.5, 122.9, 145.8),
    // Oceania
    ("AU", -44.0, -10.0, 113.0, 154.0),
    ("NZ", -47.3, -34.4, 166.4, 178.6),
    // South America
    ("BR", -33.8, 5.3, -73.9, -34.8),
    ("AR", -55.1, -21.8, -73.6, -53.6),
    ("CL", -56.0, -17.5, -75.7, -66.4),
    ("CO", -4.2, 12.5, -79.0, -66.9),
    ("PE", -18.4, -0.0, -81.3, -68.7),
    // Africa
    ("ZA", -34.8, -22.1, 16.5, 32.9),
    ("KE", -4.7, 5.0, 33.9, 41.9),
    ("NG", 4.3, 13.9, 2.7, 14.7),
    ("EG", 22.0, 31.7, 24.7, 36.9),
    ("MA", 27.6, 35.9, -13.2, -1.0),
];

/// Bounding box for an ISO 3166-1 alpha-2 code, case-insensitive
pub fn country_bounds(code: &str) -> Option<BoundingBox> {
    let code = code.to_ascii_uppercase();
    COUNTRY_BOUNDS
        .iter()
        .find(|(c, ..)| *c == code)
        .map(|&(_, min_lat, max_lat, min_lng, max_lng)| BoundingBox {
            min_lat,
            min_lng,
            max_lat,
            max_lng,
        })
}

/// Whether the point falls inside the country's box.
/// `None` when the country is not in the table.
pub fn in_country_bounds(code: &str, p: GeoPoint) -> Option<bool> {
    country_bounds(code).map(|b| b.contains(p))
}
