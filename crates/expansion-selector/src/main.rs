//! Expansion Site Selection CLI
//!
//! Generates and ranks new-site candidates for a store network.
//!
//! Usage:
//!   select-sites --stores data/stores.json --settlements data/settlements.json \
//!                --features data/features.json --region 39.5,-76.0,40.5,-74.5 \
//!                --output data/expansion_candidates.json --geojson
//!
//!   select-sites --demo --seed 7 --output /tmp/demo.json

use anyhow::{bail, Context, Result};
use clap::Parser;
use expansion_selector::cache::{spawn_eviction_task, CacheStore, MemoryCache};
use expansion_selector::loader::{self, JsonStoreSource};
use expansion_selector::pipeline::{RunSupervisor, Stage};
use expansion_selector::provider::{FeatureProvider, OfflineFeatureProvider, StoreFilter, StoreSource};
use expansion_selector::selector::to_geojson;
use expansion_selector::synthetic::SyntheticWorld;
use expansion_selector::validation::{LandSuitabilityValidator, LandValidation, UrbanSuitabilityValidator, UrbanValidation};
use expansion_selector::{BoundingBox, CandidateSelectionPipeline, ExpansionConfig, PipelineInput};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEMO_REGION: &str = "39.5,-76.0,40.5,-74.5";
const EVICTION_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Parser, Debug)]
#[command(name = "select-sites", about = "Select expansion site candidates for a store network")]
struct Args {
    /// Existing stores JSON file
    #[arg(long, env = "EXPANSION_STORES")]
    stores: Option<PathBuf>,

    /// Settlements JSON file
    #[arg(long, env = "EXPANSION_SETTLEMENTS")]
    settlements: Option<PathBuf>,

    /// Anchor POIs JSON file (anchor counts are estimated without it)
    #[arg(long)]
    anchors: Option<PathBuf>,

    /// Offline feature index for land/urban validation
    #[arg(long, env = "EXPANSION_FEATURES")]
    features: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Region as minLat,minLng,maxLat,maxLng
    #[arg(short, long)]
    region: Option<String>,

    /// Number of sites to select (capped at 300)
    #[arg(short, long)]
    target: Option<usize>,

    /// Minimum distance to existing stores in km
    #[arg(long)]
    min_distance_km: Option<f64>,

    /// Maximum sites per city
    #[arg(long)]
    max_per_city: Option<usize>,

    /// Output JSON file
    #[arg(short, long, default_value = "data/expansion_candidates.json")]
    output: PathBuf,

    /// Also output GeoJSON
    #[arg(long)]
    geojson: bool,

    /// Run on a seeded synthetic world
    #[arg(long)]
    demo: bool,

    /// Seed for sampling and the demo world
    #[arg(long)]
    seed: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<ExpansionConfig> {
    let config = match &args.config {
        Some(path) => ExpansionConfig::from_file(path).with_context(|| format!("reading config {:?}", path))?,
        None => ExpansionConfig::default(),
    };
    let mut config = config.with_env_overrides()?;

    if let Some(target) = args.target {
        config.target_count = target;
    }
    if let Some(km) = args.min_distance_km {
        config.min_distance_km = km;
    }
    if let Some(max) = args.max_per_city {
        config.max_per_city = Some(max);
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_filter = if args.verbose {
        "expansion_selector=debug"
    } else {
        "expansion_selector=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("{}", "=".repeat(60));
    info!("Expansion Site Selector");
    info!("{}", "=".repeat(60));

    let config = build_config(&args)?;

    // Inputs and provider
    let (input, provider): (PipelineInput, Arc<dyn FeatureProvider>) = if args.demo {
        let region = BoundingBox::parse(args.region.as_deref().unwrap_or(DEMO_REGION))?;
        let world = SyntheticWorld::generate(&region, config.seed);
        let provider: Arc<dyn FeatureProvider> = Arc::new(world.feature_provider("synthetic"));
        (world.pipeline_input(), provider)
    } else {
        let Some(region) = args.region.as_deref() else {
            bail!("--region is required unless --demo is given");
        };
        let Some(stores_path) = &args.stores else {
            bail!("--stores is required unless --demo is given");
        };
        let region = BoundingBox::parse(region)?;
        let stores = JsonStoreSource::new(stores_path)
            .list_stores(&StoreFilter::default())
            .await?;
        let settlements = match &args.settlements {
            Some(path) => loader::load_settlements(path)?,
            None => Vec::new(),
        };
        let anchors = args.anchors.as_ref().map(|p| loader::load_anchors(p)).transpose()?;
        let provider: Arc<dyn FeatureProvider> = Arc::new(match &args.features {
            Some(path) => {
                let offline = OfflineFeatureProvider::from_file("offline", path)?;
                info!("Loaded {} features from {}", offline.len(), path.display());
                offline
            }
            None => {
                warn!("No feature index given; land checks fall back to country bounds");
                OfflineFeatureProvider::new("offline", Vec::new())
            }
        });
        (
            PipelineInput {
                region,
                stores,
                settlements,
                anchors,
            },
            provider,
        )
    };

    // Caches with background eviction
    let land_cache: Arc<dyn CacheStore<LandValidation>> = Arc::new(MemoryCache::new());
    let urban_cache: Arc<dyn CacheStore<UrbanValidation>> = Arc::new(MemoryCache::new());
    let evictors = [
        spawn_eviction_task(land_cache.clone(), EVICTION_INTERVAL),
        spawn_eviction_task(urban_cache.clone(), EVICTION_INTERVAL),
    ];

    let land = Arc::new(LandSuitabilityValidator::new(provider.clone(), land_cache, &config));
    let urban = Arc::new(UrbanSuitabilityValidator::new(provider, urban_cache, &config));
    let pipeline = CandidateSelectionPipeline::new(config, land, urban)?;

    let supervisor = RunSupervisor::new();
    let token = supervisor.begin();
    let output = pipeline.run(&input, &token).await?;
    for handle in evictors {
        handle.abort();
    }

    // Show top 10
    info!("\nTop 10 candidates:");
    for s in output.candidates.iter().take(10) {
        info!(
            "  {:6.2} | conf {:.2} | {:24.24} | {:16.16} | {}",
            s.score, s.confidence, s.candidate.id, s.candidate.region, s.candidate.city
        );
    }

    // Write output
    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    info!("\nWriting output to {:?}", args.output);
    let writer = BufWriter::new(File::create(&args.output)?);
    serde_json::to_writer_pretty(writer, &output)?;

    // Write GeoJSON if requested
    if args.geojson {
        let geojson_path = args.output.with_extension("geojson");
        info!("Writing GeoJSON to {:?}", geojson_path);
        let mut metadata = serde_json::Map::new();
        metadata.insert("run_id".into(), output.run_id.to_string().into());
        metadata.insert("generated_at".into(), output.finished_at.to_rfc3339().into());
        metadata.insert("total_selected".into(), output.candidates.len().into());
        let geojson = to_geojson(&output.candidates, Some(metadata));
        let writer = BufWriter::new(File::create(&geojson_path)?);
        serde_json::to_writer_pretty(writer, &geojson)?;
    }

    // Summary
    let d = &output.diagnostics;
    info!("\n{}", "=".repeat(60));
    info!("SUMMARY");
    info!("{}", "=".repeat(60));
    info!("Run {}", output.run_id);
    info!("Resolution: {}", d.resolution);
    for stage in &d.stages {
        info!(
            "  {:22} {:6} -> {:6} ({} ms){}",
            format!("{:?}", stage.stage),
            stage.count_in,
            stage.count_out,
            stage.elapsed_ms,
            if stage.rejections.is_empty() {
                String::new()
            } else {
                format!(" {:?}", stage.rejections)
            }
        );
    }
    if let Some(rate) = d.stage(Stage::Validate).and_then(|s| s.cache_hit_rate) {
        info!("Validation cache hit rate: {:.1}%", rate * 100.0);
    }
    info!(
        "Validated {}, fell back {}, skipped {}",
        d.validated, d.fell_back_default_valid, d.skipped
    );
    info!(
        "AI rationale: {} enriched ({} fell back), {} templated, est. ${:.2} saved",
        output.cost.ai_candidates, output.cost.ai_fallbacks, output.cost.template_candidates, output.cost.estimated_usd_saved
    );
    info!("Total selected: {}", output.candidates.len());
    if output.candidates.is_empty() {
        warn!("No candidates survived; check the region, store data and min distance");
    }

    Ok(())
}
