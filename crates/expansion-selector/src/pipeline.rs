//! Candidate selection pipeline
//!
//! Stages run strictly in order and each consumes the previous stage's full
//! output:
//!
//! ```text
//! Tile → Validate → Score → AntiCannibalize → AllocateFairness
//!      → RankCap → CostLimitEnrichment → Emit
//! ```
//!
//! The cancel token is checked at every stage boundary. Validation results
//! that arrive after a cancellation are discarded with the run.

use crate::cannibalization::AntiCannibalizationFilter;
use crate::config::{ExpansionConfig, UrbanFailurePolicy};
use crate::cost::{AiCostLimiter, CostSummary};
use crate::provider::RationaleProvider;
use crate::rationale::attach_rationales;
use crate::scorer::{ScoringEngine, ValidationSignals};
use crate::selector::{rank_and_cap, RegionalFairnessAllocator};
use crate::tiler::{assign_admin_units, ProvisionalScore, SpatialTiler, TilingStats};
use crate::validation::{LandSuitabilityValidator, UrbanSuitabilityValidator, ValidatorStats, ValidatorStatsSnapshot};
use crate::{
    nearest_store, AnchorPoi, BoundingBox, Candidate, ExistingStore, GeoPoint, Result, ScoredCandidate, SelectorError,
    Settlement,
};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const REJECT_URBAN_PROVIDER: &str = "urban_provider_error";
pub const REJECT_FAIRNESS: &str = "fairness_unallocated";
pub const REJECT_HARD_CAP: &str = "rank_cap";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Tile,
    Validate,
    Score,
    AntiCannibalize,
    AllocateFairness,
    RankCap,
    CostLimitEnrichment,
    Emit,
}

/// Counts and timings for one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    pub stage: Stage,
    pub count_in: usize,
    pub count_out: usize,
    pub rejections: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit_rate: Option<f64>,
    pub elapsed_ms: u64,
}

impl StageDiagnostics {
    fn new(stage: Stage, count_in: usize, count_out: usize, started: Instant) -> Self {
        Self {
            stage,
            count_in,
            count_out,
            rejections: BTreeMap::new(),
            cache_hit_rate: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn with_rejections(mut self, rejections: BTreeMap<String, usize>) -> Self {
        self.rejections = rejections;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDiagnostics {
    pub stages: Vec<StageDiagnostics>,
    /// Candidates both validators answered for
    pub validated: usize,
    /// Kept without an urban verdict after the urban provider failed
    pub skipped: usize,
    /// Land provider failed and the candidate was treated as valid
    pub fell_back_default_valid: usize,
    pub urban_failures: usize,
    pub resolution: u8,
    pub tiling: TilingStats,
    pub land_validation: ValidatorStatsSnapshot,
    pub urban_validation: ValidatorStatsSnapshot,
}

impl RunDiagnostics {
    pub fn stage(&self, stage: Stage) -> Option<&StageDiagnostics> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Shared cancellation flag for one run
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, next: Stage) -> Result<()> {
        if self.is_cancelled() {
            info!("Run cancelled before {:?}", next);
            return Err(SelectorError::Cancelled(next));
        }
        Ok(())
    }
}

/// Hands out cancel tokens; starting a run supersedes the previous one
#[derive(Debug, Default)]
pub struct RunSupervisor {
    current: Mutex<Option<CancelToken>>,
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> CancelToken {
        let token = CancelToken::new();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            debug!("Superseding in-flight run");
            previous.cancel();
        }
        token
    }
}

/// Everything a run reads besides configuration
#[derive(Debug, Clone)]
pub struct PipelineInput {
    pub region: BoundingBox,
    pub stores: Vec<ExistingStore>,
    pub settlements: Vec<Settlement>,
    /// `None` when no anchor feed exists; anchor counts are then estimated
    pub anchors: Option<Vec<AnchorPoi>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Final selection in rank order
    pub candidates: Vec<ScoredCandidate>,
    pub diagnostics: RunDiagnostics,
    pub cost: CostSummary,
}

enum Verdict {
    Passed(Candidate, ValidationSignals),
    Rejected(&'static str),
}

/// Per-candidate validation result plus the counters it contributes to
struct Validated {
    id: String,
    verdict: Verdict,
    fell_back: bool,
    urban_failed: bool,
}

pub struct CandidateSelectionPipeline {
    config: ExpansionConfig,
    land: Arc<LandSuitabilityValidator>,
    urban: Arc<UrbanSuitabilityValidator>,
    rationale: Option<Arc<dyn RationaleProvider>>,
}

impl CandidateSelectionPipeline {
    /// Fails on an invalid configuration; nothing runs in that case
    pub fn new(
        config: ExpansionConfig,
        land: Arc<LandSuitabilityValidator>,
        urban: Arc<UrbanSuitabilityValidator>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            land,
            urban,
            rationale: None,
        })
    }

    pub fn with_rationale_provider(mut self, provider: Arc<dyn RationaleProvider>) -> Self {
        self.rationale = Some(provider);
        self
    }

    pub fn config(&self) -> &ExpansionConfig {
        &self.config
    }

    /// Run with an RNG seeded from the configuration
    pub async fn run(&self, input: &PipelineInput, cancel: &CancelToken) -> Result<PipelineOutput> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        self.run_with_rng(input, cancel, &mut rng).await
    }

    pub async fn run_with_rng<R: Rng + Send>(
        &self,
        input: &PipelineInput,
        cancel: &CancelToken,
        rng: &mut R,
    ) -> Result<PipelineOutput> {
        self.config.validate()?;
        let config = &self.config;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut diagnostics = RunDiagnostics::default();
        info!(%run_id, stores = input.stores.len(), settlements = input.settlements.len(), "Starting expansion run");

        // Tile
        cancel.check(Stage::Tile)?;
        let t = Instant::now();
        let tiling = {
            // Farther from the network is provisionally better
            let store_distance_km = |p: GeoPoint| nearest_store(p, &input.stores).map_or(f64::MAX, |(_, d)| d);
            let provisional: Option<ProvisionalScore<'_>> = if input.stores.is_empty() {
                None
            } else {
                Some(&store_distance_km)
            };
            SpatialTiler::new(config).tile(&input.region, &input.settlements, provisional, rng)
        };
        let candidates = assign_admin_units(tiling.candidates, &input.settlements, &input.stores);
        diagnostics.resolution = tiling.stats.resolution;
        diagnostics
            .stages
            .push(StageDiagnostics::new(Stage::Tile, tiling.stats.cells_total, candidates.len(), t));
        diagnostics.tiling = tiling.stats;

        // Validate
        cancel.check(Stage::Validate)?;
        let t = Instant::now();
        let land_run = ValidatorStats::default();
        let urban_run = ValidatorStats::default();
        let count_in = candidates.len();
        let mut results = self.validate_all(candidates, &land_run, &urban_run).await;
        cancel.check(Stage::Score)?;
        results.sort_by(|a, b| a.id.cmp(&b.id));

        let mut rejections: BTreeMap<String, usize> = BTreeMap::new();
        let mut passed = Vec::with_capacity(results.len());
        for r in results {
            diagnostics.fell_back_default_valid += usize::from(r.fell_back);
            diagnostics.urban_failures += usize::from(r.urban_failed);
            match r.verdict {
                Verdict::Passed(candidate, signals) => {
                    if r.urban_failed {
                        diagnostics.skipped += 1;
                    } else {
                        diagnostics.validated += 1;
                    }
                    passed.push((candidate, signals));
                }
                Verdict::Rejected(reason) => {
                    if !r.urban_failed && !r.fell_back {
                        diagnostics.validated += 1;
                    }
                    *rejections.entry(reason.to_string()).or_insert(0) += 1;
                }
            }
        }
        diagnostics.land_validation = land_run.snapshot();
        diagnostics.urban_validation = urban_run.snapshot();
        let mut stage = StageDiagnostics::new(Stage::Validate, count_in, passed.len(), t).with_rejections(rejections);
        stage.cache_hit_rate = Some(diagnostics.land_validation.merge(&diagnostics.urban_validation).hit_rate());
        if diagnostics.fell_back_default_valid > 0 || diagnostics.urban_failures > 0 {
            warn!(
                fell_back = diagnostics.fell_back_default_valid,
                urban_failures = diagnostics.urban_failures,
                "Validation degraded by provider failures"
            );
        }
        info!("Validated {} candidates: {} passed", count_in, passed.len());
        diagnostics.stages.push(stage);

        // Score
        let t = Instant::now();
        let engine = ScoringEngine::new(config, &input.stores, &input.settlements, input.anchors.as_deref());
        let count_in = passed.len();
        let scored: Vec<ScoredCandidate> = passed
            .into_iter()
            .map(|(candidate, signals)| engine.score(candidate, &signals))
            .collect();
        info!("Scored {} candidates", scored.len());
        diagnostics
            .stages
            .push(StageDiagnostics::new(Stage::Score, count_in, scored.len(), t));

        // AntiCannibalize
        cancel.check(Stage::AntiCannibalize)?;
        let t = Instant::now();
        let filter = AntiCannibalizationFilter::new(config, &input.stores);
        let count_in = scored.len();
        let filtered = filter.filter(scored);
        let suppressed = filter.suppress(filtered.survivors);
        let mut rejections = filtered.rejections;
        for (reason, n) in suppressed.rejections {
            *rejections.entry(reason).or_insert(0) += n;
        }
        let survivors = suppressed.survivors;
        diagnostics.stages.push(
            StageDiagnostics::new(Stage::AntiCannibalize, count_in, survivors.len(), t).with_rejections(rejections),
        );

        // AllocateFairness
        cancel.check(Stage::AllocateFairness)?;
        let t = Instant::now();
        let target = config.effective_target();
        let count_in = survivors.len();
        let allocation = RegionalFairnessAllocator::new(config.fairness.redistribute_shortfall).allocate(survivors, target);
        let mut rejections = BTreeMap::new();
        let unallocated = count_in - allocation.selected.len();
        if unallocated > 0 {
            rejections.insert(REJECT_FAIRNESS.to_string(), unallocated);
        }
        if allocation.shortfall > 0 {
            info!("Regional allocation left {} of {} slots empty", allocation.shortfall, target);
        }
        diagnostics.stages.push(
            StageDiagnostics::new(Stage::AllocateFairness, count_in, allocation.selected.len(), t)
                .with_rejections(rejections),
        );

        // RankCap
        cancel.check(Stage::RankCap)?;
        let t = Instant::now();
        let count_in = allocation.selected.len();
        let ranked = rank_and_cap(allocation.selected, target);
        let mut rejections = BTreeMap::new();
        if ranked.len() < count_in {
            rejections.insert(REJECT_HARD_CAP.to_string(), count_in - ranked.len());
        }
        diagnostics
            .stages
            .push(StageDiagnostics::new(Stage::RankCap, count_in, ranked.len(), t).with_rejections(rejections));

        // CostLimitEnrichment
        cancel.check(Stage::CostLimitEnrichment)?;
        let t = Instant::now();
        let count_in = ranked.len();
        let plan = AiCostLimiter::new(config).select_for_enrichment(&ranked);
        let (enriched, ai_fallbacks) =
            attach_rationales(ranked, &plan, self.rationale.as_deref(), config.ai.concurrency).await;
        let mut cost = plan.summary;
        cost.ai_fallbacks = ai_fallbacks;
        diagnostics.stages.push(StageDiagnostics::new(
            Stage::CostLimitEnrichment,
            count_in,
            enriched.len(),
            t,
        ));

        // Emit
        cancel.check(Stage::Emit)?;
        let finished_at = Utc::now();
        diagnostics
            .stages
            .push(StageDiagnostics::new(Stage::Emit, enriched.len(), enriched.len(), Instant::now()));

        info!(
            "Selected {} sites (target {}, validated {}, fell back {}, skipped {}) in {} ms",
            enriched.len(),
            target,
            diagnostics.validated,
            diagnostics.fell_back_default_valid,
            diagnostics.skipped,
            (finished_at - started_at).num_milliseconds()
        );

        Ok(PipelineOutput {
            run_id,
            started_at,
            finished_at,
            candidates: enriched,
            diagnostics,
            cost,
        })
    }

    /// Land then urban validation for every candidate, bounded concurrency
    async fn validate_all(
        &self,
        candidates: Vec<Candidate>,
        land_run: &ValidatorStats,
        urban_run: &ValidatorStats,
    ) -> Vec<Validated> {
        let land = self.land.as_ref();
        let urban = self.urban.as_ref();
        let policy = self.config.urban_failure_policy;

        stream::iter(candidates.into_iter().map(|candidate| async move {
            let id = candidate.id.clone();
            let (lat, lng) = (candidate.center.lat, candidate.center.lng);

            let land_result = land.validate_counting(lat, lng, land_run).await;
            let fell_back = land_result.fell_back;
            if let Some(reason) = land_result.rejection_reason {
                return Validated {
                    id,
                    verdict: Verdict::Rejected(reason.as_str()),
                    fell_back,
                    urban_failed: false,
                };
            }

            let mut signals = ValidationSignals {
                fell_back,
                ..Default::default()
            };
            let (verdict, urban_failed) = match urban.validate_counting(lat, lng, urban_run).await {
                Ok(u) => match u.rejection_reason() {
                    Some(reason) => (Verdict::Rejected(reason), false),
                    None => {
                        signals.urban_density_index = Some(u.urban_density_index);
                        signals.landuse = u.landuse_type;
                        (Verdict::Passed(candidate, signals), false)
                    }
                },
                Err(e) => {
                    debug!(candidate = %id, error = %e, ?policy, "urban validation failed");
                    let verdict = match policy {
                        UrbanFailurePolicy::Keep => Verdict::Passed(candidate, signals),
                        UrbanFailurePolicy::Drop => Verdict::Rejected(REJECT_URBAN_PROVIDER),
                    };
                    (verdict, true)
                }
            };

            Validated {
                id,
                verdict,
                fell_back,
                urban_failed,
            }
        }))
        .buffer_unordered(self.config.validation_concurrency.max(1))
        .collect::<Vec<_>>()
        .await
    }
}
