//! Regional fairness allocation, rank/cap, and GeoJSON export

use crate::{ScoredCandidate, UNKNOWN_ADMIN};
use geojson::{feature::Id, Feature, FeatureCollection, Geometry, JsonObject, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Score descending, then candidate id ascending
pub fn by_rank(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.candidate.id.cmp(&b.candidate.id))
}

/// Sort into rank order and keep at most `cap`
pub fn rank_and_cap(mut candidates: Vec<ScoredCandidate>, cap: usize) -> Vec<ScoredCandidate> {
    candidates.sort_by(by_rank);
    candidates.truncate(cap);
    candidates
}

/// Allocation bucket; candidates without a region share one
fn region_key(c: &ScoredCandidate) -> &str {
    if c.candidate.region.is_empty() {
        UNKNOWN_ADMIN
    } else {
        &c.candidate.region
    }
}

/// Slots and picks for one region
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionAllocation {
    pub available: usize,
    pub average_score: f64,
    pub base_slots: usize,
    /// 1 when the region received a remainder slot
    pub remainder_slots: usize,
    pub selected: usize,
    /// Slots filled from this region after other regions fell short
    pub refilled: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FairnessAllocation {
    /// Selection in rank order
    pub selected: Vec<ScoredCandidate>,
    pub regions: BTreeMap<String, RegionAllocation>,
    /// Slots left empty because regions ran out of candidates
    pub shortfall: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegionalFairnessAllocator {
    redistribute_shortfall: bool,
}

impl RegionalFairnessAllocator {
    pub fn new(redistribute_shortfall: bool) -> Self {
        Self { redistribute_shortfall }
    }

    pub fn allocate(&self, candidates: Vec<ScoredCandidate>, total_target: usize) -> FairnessAllocation {
        let mut by_region: BTreeMap<String, Vec<ScoredCandidate>> = BTreeMap::new();
        for c in candidates {
            by_region.entry(region_key(&c).to_string()).or_default().push(c);
        }
        for list in by_region.values_mut() {
            list.sort_by(by_rank);
        }

        let region_count = by_region.len();
        if region_count == 0 || total_target == 0 {
            return FairnessAllocation::default();
        }

        let base = total_target / region_count;
        let remainder = total_target % region_count;

        // Remainder slots go to the highest-quality regions first
        let mut quality: Vec<(&String, f64)> = by_region
            .iter()
            .map(|(name, list)| (name, list.iter().map(|c| c.score).sum::<f64>() / list.len() as f64))
            .collect();
        quality.sort_by(|(na, qa), (nb, qb)| qb.partial_cmp(qa).unwrap_or(Ordering::Equal).then_with(|| na.cmp(nb)));

        let mut regions: BTreeMap<String, RegionAllocation> = quality
            .iter()
            .enumerate()
            .map(|(i, (name, avg))| {
                (
                    (*name).clone(),
                    RegionAllocation {
                        available: by_region[*name].len(),
                        average_score: *avg,
                        base_slots: base,
                        remainder_slots: usize::from(i < remainder),
                        ..Default::default()
                    },
                )
            })
            .collect();

        let mut selected = Vec::with_capacity(total_target);
        let mut leftovers = Vec::new();
        for (name, list) in by_region {
            let Some(alloc) = regions.get_mut(&name) else {
                continue;
            };
            let slots = alloc.base_slots + alloc.remainder_slots;
            let take = slots.min(list.len());
            alloc.selected = take;
            if take < slots {
                debug!(region = %name, slots, available = list.len(), "region cannot fill its allocation");
            }
            let mut list = list.into_iter();
            selected.extend(list.by_ref().take(take));
            leftovers.extend(list);
        }

        let mut shortfall = total_target.saturating_sub(selected.len());
        if self.redistribute_shortfall && shortfall > 0 {
            leftovers.sort_by(by_rank);
            for c in leftovers.into_iter().take(shortfall) {
                if let Some(alloc) = regions.get_mut(region_key(&c)) {
                    alloc.refilled += 1;
                }
                selected.push(c);
            }
            shortfall = total_target.saturating_sub(selected.len());
        }

        selected.sort_by(by_rank);
        info!(
            "Fairness: {} regions, base {} per region, {} remainder, {} selected, shortfall {}",
            region_count,
            base,
            remainder,
            selected.len(),
            shortfall
        );

        FairnessAllocation {
            selected,
            regions,
            shortfall,
        }
    }
}

/// Export candidates as a GeoJSON `FeatureCollection`. Each feature carries
/// the originating hexagon (or the site point when no boundary is known).
pub fn to_geojson(candidates: &[ScoredCandidate], metadata: Option<JsonObject>) -> FeatureCollection {
    let features = candidates
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let c = &s.candidate;
            let geometry = if c.boundary.len() >= 3 {
                let mut ring: Vec<Vec<f64>> = c.boundary.iter().map(|p| vec![p.lng, p.lat]).collect();
                ring.push(vec![c.boundary[0].lng, c.boundary[0].lat]);
                Geometry::new(Value::Polygon(vec![ring]))
            } else {
                Geometry::new(Value::Point(vec![c.center.lng, c.center.lat]))
            };

            let mut properties = JsonObject::new();
            properties.insert("rank".into(), (i + 1).into());
            properties.insert("cell_id".into(), c.cell_id.clone().into());
            properties.insert("city".into(), c.city.clone().into());
            properties.insert("region".into(), c.region.clone().into());
            properties.insert("center".into(), serde_json::json!([c.center.lng, c.center.lat]));
            properties.insert("score".into(), s.score.into());
            properties.insert("confidence".into(), s.confidence.into());
            properties.insert("completeness".into(), s.explanation.completeness.into());
            properties.insert("white_space".into(), s.explanation.white_space.is_white_space.into());
            properties.insert(
                "area_class".into(),
                serde_json::to_value(s.explanation.area_class).unwrap_or_default(),
            );
            properties.insert("fell_back".into(), s.fell_back.into());
            if let Some(r) = &s.rationale {
                properties.insert("rationale".into(), r.text.clone().into());
            }

            Feature {
                bbox: None,
                geometry: Some(geometry),
                id: Some(Id::String(c.id.clone())),
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: metadata,
    }
}
