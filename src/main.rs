mod artifact;
mod config;
mod db;
mod error;
mod extract;
mod fetch;
mod gate;
mod normalize;
mod partial;
mod pipeline;
mod records;
mod sites;
mod stages;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::warn;

use crate::config::{Overrides, RunConfig};
use crate::error::SystemicFailure;
use crate::fetch::HttpFetcher;
use crate::pipeline::{input, Orchestrator, StageInput, StageReport};
use crate::sites::{PageShape, Site};
use crate::stages::StageSpec;

#[derive(Parser)]
#[command(name = "model_hub_scraper", about = "Model hub metadata scraper (Kaggle, NVIDIA)")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Max in-flight fetches per stage
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    /// Disable the rendered-DOM fallback
    #[arg(long, global = true)]
    no_render: bool,
    /// Directory for stage artifacts
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    /// Pagination cap for link discovery
    #[arg(long, global = true)]
    max_listing_pages: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover model detail pages from the listing
    Links {
        #[arg(long, value_enum)]
        site: Site,
    },
    /// Extract model metadata from detail pages
    Metadata {
        #[arg(long, value_enum)]
        site: Site,
        /// Links artifact to read (default: newest in the output dir)
        #[arg(long, conflicts_with = "urls")]
        input: Option<PathBuf>,
        /// File of detail-page URLs, one per line
        #[arg(long)]
        urls: Option<PathBuf>,
        /// Max pages to process
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Extract Kaggle model variations
    Variations {
        /// Metadata artifact to read (default: newest in the output dir)
        #[arg(long)]
        input: Option<PathBuf>,
        /// Max pages to process
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// All stages of a site, chained through their artifacts
    Run {
        #[arg(long, value_enum)]
        site: Site,
        /// Max pages per detail stage
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Load metadata/variation artifacts into SQLite
    Load {
        #[arg(required = true)]
        artifacts: Vec<PathBuf>,
        #[arg(long, default_value = db::DEFAULT_DB_PATH)]
        db: PathBuf,
    },
    /// Show row counts of the SQLite store
    Stats {
        #[arg(long, default_value = db::DEFAULT_DB_PATH)]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Links { site } => {
            let orch = orchestrator(&cli.global, None)?;
            let stage = stage_for(site, PageShape::Listing)?;
            run_one(&orch, stage, StageInput::Listing).await
        }
        Commands::Metadata {
            site,
            input: from,
            urls,
            limit,
        } => {
            let orch = orchestrator(&cli.global, limit)?;
            let stage = stage_for(site, PageShape::Detail)?;
            let seeds = match urls {
                Some(path) => input::from_url_file(stage, &path)?,
                None => input::resolve(stage, from.as_deref(), &orch.config().output_dir)?,
            };
            run_one(&orch, stage, seeds).await
        }
        Commands::Variations { input: from, limit } => {
            let orch = orchestrator(&cli.global, limit)?;
            let stage = stages::by_name("kaggle_variations")
                .ok_or_else(|| anyhow::anyhow!("kaggle_variations is not a registered stage"))?;
            let seeds = input::resolve(stage, from.as_deref(), &orch.config().output_dir)?;
            run_one(&orch, stage, seeds).await
        }
        Commands::Run { site, limit } => {
            let orch = orchestrator(&cli.global, limit)?;
            run_chain(&orch, site).await
        }
        Commands::Load { artifacts, db: path } => {
            let conn = db::connect(&path)?;
            db::init_schema(&conn)?;
            let mut total = db::LoadSummary::default();
            for artifact in &artifacts {
                let s = db::load_artifact(&conn, artifact)
                    .with_context(|| format!("Failed to load {:?}", artifact))?;
                println!(
                    "{}: {} models, {} variations, {} skipped (parent missing)",
                    artifact.display(),
                    s.models,
                    s.variations,
                    s.skipped
                );
                total.models += s.models;
                total.variations += s.variations;
                total.skipped += s.skipped;
            }
            println!(
                "Loaded {} models, {} variations into {} ({} skipped).",
                total.models,
                total.variations,
                path.display(),
                total.skipped
            );
            Ok(())
        }
        Commands::Stats { db: path } => {
            let conn = db::connect(&path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Models:     {}", s.models);
            for (site, n) in &s.by_site {
                println!("  {:<8} {}", site, n);
            }
            println!("Tags:       {}", s.tags);
            println!("Model tags: {}", s.model_tags);
            println!("Metadata:   {}", s.metadata);
            println!("Variations: {}", s.variations);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn stage_for(site: Site, shape: PageShape) -> anyhow::Result<&'static StageSpec> {
    stages::for_site(site, shape).ok_or_else(|| anyhow::anyhow!("{} has no {} stage", site, shape))
}

/// Config, fetch capability and Ctrl-C wiring shared by every stage command.
fn orchestrator(global: &GlobalArgs, max_pages: Option<usize>) -> anyhow::Result<Orchestrator> {
    let config = RunConfig::load(&Overrides {
        concurrency: global.concurrency,
        no_render: global.no_render,
        output_dir: global.output_dir.clone(),
        max_listing_pages: global.max_listing_pages,
        max_pages,
    })?;

    let fetcher = HttpFetcher::new(&config)?;
    if config.render_fallback && !fetcher.can_render() {
        return Err(SystemicFailure::CapabilityUnavailable {
            stage: "startup".into(),
            message: "render fallback needs SPIDER_API_KEY; set it or pass --no-render".into(),
        }
        .into());
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing current stage as partial");
            let _ = tx.send(true);
        }
    });

    Ok(Orchestrator::new(config, Arc::new(fetcher), rx))
}

async fn run_one(orch: &Orchestrator, stage: &'static StageSpec, seeds: StageInput) -> anyhow::Result<()> {
    println!("{}: {} seeds", stage, seeds.len());
    let report = orch.run_stage(stage, seeds).await?;
    print_report(&report);
    Ok(())
}

/// Runs each stage of `site` on the artifact of the one before it.
async fn run_chain(orch: &Orchestrator, site: Site) -> anyhow::Result<()> {
    let mut upstream: Option<PathBuf> = None;
    for stage in stages::chain(site) {
        let seeds = match upstream.as_deref() {
            None => StageInput::Listing,
            Some(path) => input::from_artifact(stage, path)?,
        };
        println!("{}: {} seeds", stage, seeds.len());
        let report = orch.run_stage(stage, seeds).await?;
        print_report(&report);
        if report.partial {
            println!("Stopping after {} (cancelled).", report.stage);
            break;
        }
        upstream = Some(report.path);
    }
    Ok(())
}

fn print_report(r: &StageReport) {
    let c = &r.counts;
    println!(
        "{}: fetched {}/{}, extracted {}, rejected {}, failed {}, render fallbacks {}",
        r.stage, c.fetched, c.total, c.extracted, c.rejected, c.failed, c.render_fallbacks
    );
    if c.shape_mismatch > 0 || c.duplicates > 0 {
        println!(
            "  shape mismatches {}, duplicates {}",
            c.shape_mismatch, c.duplicates
        );
    }
    println!(
        "  {} records -> {}{}",
        r.records,
        r.path.display(),
        if r.partial { " (partial)" } else { "" }
    );
    if c.rejected > 0 {
        println!("  rejections ({} total, showing {}):", c.rejected, r.rejection_samples.len());
        for rej in &r.rejection_samples {
            println!(
                "    [{}] {} {}: {}",
                rej.invariant,
                truncate(&rej.url, 80),
                rej.field,
                rej.message
            );
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
