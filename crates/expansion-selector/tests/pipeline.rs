//! End-to-end pipeline runs against in-memory providers.
//!
//! Run: cargo test -p expansion-selector --test pipeline

use async_trait::async_trait;
use expansion_selector::cache::{CacheStore, MemoryCache};
use expansion_selector::cannibalization::{drive_time_minutes, REJECT_DRIVE_TIME};
use expansion_selector::config::{ExpansionConfig, FairnessConfig, NmsConfig, ResolutionMode, RetryPolicy, UrbanFailurePolicy};
use expansion_selector::geo::Polygon;
use expansion_selector::pipeline::{CancelToken, RunSupervisor, REJECT_URBAN_PROVIDER};
use expansion_selector::provider::{
    Feature, FeatureClass, FeatureGeometry, FeatureProvider, FeatureResponse, OfflineFeatureProvider,
    ProviderError, RationaleProvider, RationaleResponse,
};
use expansion_selector::scorer::RationaleSource;
use expansion_selector::synthetic::SyntheticWorld;
use expansion_selector::validation::{LandSuitabilityValidator, UrbanSuitabilityValidator};
use expansion_selector::{
    BoundingBox, CandidateSelectionPipeline, ExistingStore, GeoPoint, PipelineInput, SelectorError, Stage, HARD_CAP,
};
use proptest::prelude::*;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn region() -> BoundingBox {
    BoundingBox::new(40.0, -75.0, 40.6, -74.2).unwrap()
}

fn square_around(bbox: &BoundingBox, margin: f64) -> Polygon {
    Polygon::new(vec![
        GeoPoint::new(bbox.min_lat - margin, bbox.min_lng - margin),
        GeoPoint::new(bbox.min_lat - margin, bbox.max_lng + margin),
        GeoPoint::new(bbox.max_lat + margin, bbox.max_lng + margin),
        GeoPoint::new(bbox.max_lat + margin, bbox.min_lng - margin),
    ])
}

/// Inland, fully residential world: every sampled point passes validation
fn residential_features() -> Vec<Feature> {
    vec![
        Feature {
            class: FeatureClass::Land,
            kind: None,
            geometry: FeatureGeometry::Polygon {
                polygon: square_around(&region(), 0.5),
            },
        },
        Feature {
            class: FeatureClass::Landuse,
            kind: Some("residential".into()),
            geometry: FeatureGeometry::Polygon {
                polygon: square_around(&region(), 0.5),
            },
        },
    ]
}

fn store(id: &str, lat: f64, lng: f64, region: &str) -> ExistingStore {
    ExistingStore {
        id: id.to_string(),
        location: GeoPoint::new(lat, lng),
        city: format!("City {id}"),
        region: region.to_string(),
        country: "US".into(),
        trailing_turnover: Some(1_000_000.0),
        population_band: None,
    }
}

fn input() -> PipelineInput {
    PipelineInput {
        region: region(),
        stores: vec![
            store("s1", 40.1, -74.9, "A"),
            store("s2", 40.3, -74.6, "B"),
            store("s3", 40.5, -74.3, "C"),
        ],
        settlements: vec![],
        anchors: None,
    }
}

fn config() -> ExpansionConfig {
    ExpansionConfig {
        resolution: ResolutionMode::Fixed { resolution: 6 },
        settlement_aware: false,
        retry: RetryPolicy {
            max_retries: 0,
            backoff_base_ms: 1,
        },
        ..Default::default()
    }
}

fn pipeline(
    config: ExpansionConfig,
    land_provider: Arc<dyn FeatureProvider>,
    urban_provider: Arc<dyn FeatureProvider>,
) -> CandidateSelectionPipeline {
    let land_cache: Arc<dyn CacheStore<_>> = Arc::new(MemoryCache::new());
    let urban_cache: Arc<dyn CacheStore<_>> = Arc::new(MemoryCache::new());
    let land = Arc::new(LandSuitabilityValidator::new(land_provider, land_cache, &config));
    let urban = Arc::new(UrbanSuitabilityValidator::new(urban_provider, urban_cache, &config));
    CandidateSelectionPipeline::new(config, land, urban).unwrap()
}

fn offline() -> Arc<OfflineFeatureProvider> {
    Arc::new(OfflineFeatureProvider::new("offline", residential_features()))
}

struct DownProvider(ProviderError);

#[async_trait]
impl FeatureProvider for DownProvider {
    fn name(&self) -> &str {
        "down"
    }

    async fn query(&self, _: f64, _: f64, _: f64) -> Result<FeatureResponse, ProviderError> {
        Err(self.0.clone())
    }
}

struct EchoRationale;

#[async_trait]
impl RationaleProvider for EchoRationale {
    async fn generate(&self, _prompt: &str) -> Result<RationaleResponse, ProviderError> {
        Ok(RationaleResponse::Text {
            text: "Underserved residential area.".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_output_bounded_ranked_and_spaced() {
    let p = pipeline(config(), offline(), offline());
    let input = input();
    let out = p.run(&input, &CancelToken::new()).await.unwrap();

    assert!(!out.candidates.is_empty());
    assert!(out.candidates.len() <= p.config().target_count.min(HARD_CAP));
    assert!(out.candidates.windows(2).all(|w| w[0].score >= w[1].score));

    for c in &out.candidates {
        assert!((0.0..=100.0).contains(&c.score));
        assert!((0.0..=1.0).contains(&c.confidence));
        assert!(c.rationale.is_some());
        for s in &input.stores {
            assert!(c.candidate.center.distance_km(s.location) >= p.config().min_distance_km);
        }
    }

    let stages: Vec<Stage> = out.diagnostics.stages.iter().map(|s| s.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Tile,
            Stage::Validate,
            Stage::Score,
            Stage::AntiCannibalize,
            Stage::AllocateFairness,
            Stage::RankCap,
            Stage::CostLimitEnrichment,
            Stage::Emit,
        ]
    );
    // Each stage consumes the previous stage's output
    for w in out.diagnostics.stages.windows(2) {
        assert_eq!(w[0].count_out, w[1].count_in);
    }
    assert_eq!(out.diagnostics.resolution, 6);
}

#[tokio::test]
async fn test_small_target_is_respected() {
    let config = ExpansionConfig {
        target_count: 5,
        ..config()
    };
    let out = pipeline(config, offline(), offline())
        .run(&input(), &CancelToken::new())
        .await
        .unwrap();
    assert!(out.candidates.len() <= 5);
}

#[tokio::test]
async fn test_same_seed_same_selection() {
    let a = pipeline(config(), offline(), offline())
        .run(&input(), &CancelToken::new())
        .await
        .unwrap();
    let b = pipeline(config(), offline(), offline())
        .run(&input(), &CancelToken::new())
        .await
        .unwrap();
    let ids = |o: &expansion_selector::PipelineOutput| -> Vec<String> {
        o.candidates.iter().map(|c| c.candidate.id.clone()).collect()
    };
    assert_eq!(ids(&a), ids(&b));
    assert_ne!(a.run_id, b.run_id);
}

/// Fine tiling with spacing rules off: well over 300 candidates survive
fn dense_config() -> ExpansionConfig {
    ExpansionConfig {
        resolution: ResolutionMode::Fixed { resolution: 7 },
        nms: NmsConfig {
            enabled: false,
            ..Default::default()
        },
        ..config()
    }
}

#[tokio::test]
async fn test_hard_cap_binds_with_many_survivors() {
    let config = ExpansionConfig {
        target_count: 1000,
        fairness: FairnessConfig {
            redistribute_shortfall: true,
        },
        ..dense_config()
    };
    let out = pipeline(config, offline(), offline())
        .run(&input(), &CancelToken::new())
        .await
        .unwrap();

    let survivors = out.diagnostics.stage(Stage::AntiCannibalize).unwrap().count_out;
    assert!(survivors > HARD_CAP, "only {survivors} survivors");
    assert_eq!(out.candidates.len(), HARD_CAP);
}

#[tokio::test]
async fn test_suppression_runs_before_fairness() {
    let config = ExpansionConfig {
        target_count: 6,
        nms: NmsConfig {
            drive_time_minutes: 20.0,
            ..Default::default()
        },
        fairness: FairnessConfig {
            redistribute_shortfall: true,
        },
        ..config()
    };
    let nms = config.nms;
    let out = pipeline(config, offline(), offline())
        .run(&input(), &CancelToken::new())
        .await
        .unwrap();

    let d = &out.diagnostics;
    let suppression = d.stage(Stage::AntiCannibalize).unwrap();
    let fairness = d.stage(Stage::AllocateFairness).unwrap();
    assert!(suppression.rejections[REJECT_DRIVE_TIME] > 0);
    assert!(!fairness.rejections.contains_key(REJECT_DRIVE_TIME));
    // Fairness draws only from suppression survivors
    assert_eq!(fairness.count_in, suppression.count_out);

    // Refilled slots still keep their drive-time spacing
    assert_eq!(out.candidates.len(), 6);
    for (i, kept) in out.candidates.iter().enumerate() {
        for later in &out.candidates[i + 1..] {
            let d = kept.candidate.center.distance_km(later.candidate.center);
            assert!(drive_time_minutes(d, kept.explanation.area_class, &nms) > nms.drive_time_minutes);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn output_never_exceeds_cap_or_survivors(
        target_count in 1usize..=600,
        max_per_city in proptest::option::of(1usize..=100),
        min_distance_km in 0.0f64..10.0,
    ) {
        let config = ExpansionConfig {
            target_count,
            max_per_city,
            min_distance_km,
            ..dense_config()
        };
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let out = runtime
            .block_on(pipeline(config, offline(), offline()).run(&input(), &CancelToken::new()))
            .unwrap();

        let validated = out.diagnostics.stage(Stage::Validate).unwrap().count_out;
        let survivors = out.diagnostics.stage(Stage::AntiCannibalize).unwrap().count_out;
        prop_assert!(out.candidates.len() <= target_count.min(HARD_CAP));
        prop_assert!(out.candidates.len() <= survivors);
        prop_assert!(survivors <= validated);
    }
}

// ---------------------------------------------------------------------------
// Failure policies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_land_provider_down_fails_open_with_flag() {
    let land: Arc<dyn FeatureProvider> = Arc::new(DownProvider(ProviderError::Unavailable("503".into())));
    let out = pipeline(config(), land, offline())
        .run(&input(), &CancelToken::new())
        .await
        .unwrap();

    assert!(!out.candidates.is_empty());
    assert!(out.candidates.iter().all(|c| c.fell_back));
    assert!(out.candidates.iter().all(|c| c.confidence <= 0.85 + 1e-9));

    let d = &out.diagnostics;
    let tiled = d.stage(Stage::Tile).unwrap().count_out;
    assert_eq!(d.fell_back_default_valid, tiled);
    assert_eq!(d.land_validation.provider_failures as usize, tiled);
    // Fail-open verdicts are not cached
    assert_eq!(d.land_validation.cache_hits, 0);
}

#[tokio::test]
async fn test_urban_failure_keep_and_drop() {
    let down = || -> Arc<dyn FeatureProvider> { Arc::new(DownProvider(ProviderError::Malformed("bad".into()))) };

    let kept = pipeline(config(), offline(), down())
        .run(&input(), &CancelToken::new())
        .await
        .unwrap();
    let tiled = kept.diagnostics.stage(Stage::Tile).unwrap().count_out;
    assert!(!kept.candidates.is_empty());
    assert_eq!(kept.diagnostics.urban_failures, tiled);
    assert_eq!(kept.diagnostics.skipped, tiled);
    assert_eq!(kept.diagnostics.validated, 0);

    let config = ExpansionConfig {
        urban_failure_policy: UrbanFailurePolicy::Drop,
        ..config()
    };
    let dropped = pipeline(config, offline(), down())
        .run(&input(), &CancelToken::new())
        .await
        .unwrap();
    assert!(dropped.candidates.is_empty());
    let validate = dropped.diagnostics.stage(Stage::Validate).unwrap();
    assert_eq!(validate.rejections[REJECT_URBAN_PROVIDER], tiled);
}

#[tokio::test]
async fn test_invalid_weights_fail_before_running() {
    let mut config = config();
    config.weights.population = -1.0;
    let land_cache: Arc<dyn CacheStore<_>> = Arc::new(MemoryCache::new());
    let urban_cache: Arc<dyn CacheStore<_>> = Arc::new(MemoryCache::new());
    let land = Arc::new(LandSuitabilityValidator::new(offline(), land_cache, &config));
    let urban = Arc::new(UrbanSuitabilityValidator::new(offline(), urban_cache, &config));
    let result = CandidateSelectionPipeline::new(config, land, urban);
    assert!(matches!(result, Err(SelectorError::Configuration(_))));
}

// ---------------------------------------------------------------------------
// Caching and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_second_run_served_from_cache() {
    let provider = offline();
    let p = pipeline(config(), provider.clone(), provider.clone());

    let first = p.run(&input(), &CancelToken::new()).await.unwrap();
    let calls_after_first = provider.calls();
    assert!(calls_after_first > 0);

    let second = p.run(&input(), &CancelToken::new()).await.unwrap();
    assert_eq!(provider.calls(), calls_after_first);
    let rate = second.diagnostics.stage(Stage::Validate).unwrap().cache_hit_rate.unwrap();
    assert!((rate - 1.0).abs() < 1e-12);
    assert_eq!(first.candidates.len(), second.candidates.len());
}

#[tokio::test]
async fn test_concurrent_runs_report_their_own_validation_counts() {
    let config = config();
    let land_provider = offline();
    let land_cache: Arc<dyn CacheStore<_>> = Arc::new(MemoryCache::new());
    let urban_cache: Arc<dyn CacheStore<_>> = Arc::new(MemoryCache::new());
    let land = Arc::new(LandSuitabilityValidator::new(land_provider.clone(), land_cache, &config));
    let urban = Arc::new(UrbanSuitabilityValidator::new(offline(), urban_cache, &config));
    let first = CandidateSelectionPipeline::new(config.clone(), land.clone(), urban.clone()).unwrap();
    let second = CandidateSelectionPipeline::new(config, land.clone(), urban).unwrap();

    let input = input();
    let (cancel_a, cancel_b) = (CancelToken::new(), CancelToken::new());
    let (a, b) = tokio::join!(
        first.run(&input, &cancel_a),
        second.run(&input, &cancel_b)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    for out in [&a, &b] {
        let tiled = out.diagnostics.stage(Stage::Tile).unwrap().count_out as u64;
        let stats = &out.diagnostics.land_validation;
        assert_eq!(stats.cache_hits + stats.cache_misses, tiled);
    }
    let (la, lb) = (&a.diagnostics.land_validation, &b.diagnostics.land_validation);
    assert_eq!(land_provider.calls() as u64, la.cache_misses + lb.cache_misses);
    assert_eq!(land.stats().snapshot(), la.merge(lb));
}

#[tokio::test]
async fn test_superseded_run_is_cancelled() {
    let supervisor = RunSupervisor::new();
    let stale = supervisor.begin();
    let _fresh = supervisor.begin();

    let result = pipeline(config(), offline(), offline()).run(&input(), &stale).await;
    assert!(matches!(result, Err(SelectorError::Cancelled(Stage::Tile))));
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ai_rationale_for_top_slice_only() {
    let p = pipeline(config(), offline(), offline()).with_rationale_provider(Arc::new(EchoRationale));
    let out = p.run(&input(), &CancelToken::new()).await.unwrap();

    let n = out.candidates.len();
    let expected_ai = ((n as f64) * 0.2).ceil() as usize;
    assert_eq!(out.cost.ai_candidates, expected_ai.min(p.config().ai_cap()));
    assert_eq!(out.cost.ai_fallbacks, 0);

    let sources: Vec<RationaleSource> = out
        .candidates
        .iter()
        .map(|c| c.rationale.as_ref().unwrap().source)
        .collect();
    // Output is in rank order, so the AI slice is a prefix
    assert!(sources[..out.cost.ai_candidates].iter().all(|s| *s == RationaleSource::Ai));
    assert!(sources[out.cost.ai_candidates..]
        .iter()
        .all(|s| *s == RationaleSource::Template));
}

// ---------------------------------------------------------------------------
// Synthetic world
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_synthetic_world_end_to_end() {
    let bbox = BoundingBox::new(39.5, -76.0, 40.5, -74.5).unwrap();
    let world = SyntheticWorld::generate(&bbox, 11);
    let provider: Arc<dyn FeatureProvider> = Arc::new(world.feature_provider("synthetic"));
    let config = ExpansionConfig {
        target_count: 40,
        ..Default::default()
    };

    let out = pipeline(config, provider.clone(), provider)
        .run(&world.pipeline_input(), &CancelToken::new())
        .await
        .unwrap();

    assert!(out.candidates.len() <= 40);
    assert!(out.diagnostics.tiling.settlement_aware);
    for c in &out.candidates {
        assert!((0.0..=100.0).contains(&c.score));
        assert!(bbox.contains(c.candidate.center));
        assert_ne!(c.candidate.region, "");
    }
    let json = serde_json::to_value(&out).unwrap();
    assert!(json["diagnostics"]["stages"].is_array());
}
