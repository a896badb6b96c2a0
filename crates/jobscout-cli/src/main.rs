use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobscout_api::AppState;
use jobscout_pipeline::{
    load_source_registry, maybe_build_scheduler, IngestPipeline, Settings,
};
use jobscout_score::{build_oracle, OracleConfig, Scorer, ScoringConfig};
use jobscout_store::FileStore;

#[derive(Debug, Parser)]
#[command(name = "jobscout")]
#[command(about = "JobScout ingestion pipeline")]
struct Cli {
    /// Settings snapshot file.
    #[arg(long, default_value = "settings.yaml")]
    settings: String,
    /// Source registry file.
    #[arg(long, default_value = "sources.yaml")]
    sources: String,
    /// Record store directory.
    #[arg(long, default_value = "data/jobs")]
    data_dir: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scheduled scrape across enabled sources, then score pending.
    Scrape,
    /// Score everything pending against the candidate profile.
    Score,
    /// Serve the capture/tracking API (and the cron scheduler, if enabled).
    Serve,
}

fn build_scorer(settings: &Settings) -> Result<Scorer> {
    let provider = settings.oracle.provider.parse()?;
    let oracle = build_oracle(&OracleConfig {
        provider,
        model: settings.oracle.model.clone(),
        api_key: settings.oracle.api_key.clone(),
        endpoint: settings.oracle.endpoint.clone(),
    })?;
    Ok(Scorer::new(
        oracle,
        ScoringConfig {
            requests_per_minute: settings.oracle.requests_per_minute,
            ..ScoringConfig::default()
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = Arc::new(Settings::load(&cli.settings)?);
    let sources = load_source_registry(&cli.sources)?;
    let store = Arc::new(
        FileStore::open(&cli.data_dir)
            .await
            .with_context(|| format!("opening store at {}", cli.data_dir))?,
    );

    match cli.command.unwrap_or(Commands::Scrape) {
        Commands::Scrape => {
            let pipeline = Arc::new(IngestPipeline::new(
                settings.clone(),
                sources,
                store.clone(),
            )?);
            let summary = pipeline.run_once().await;
            println!(
                "scrape complete: run_id={} sources={} found={} new={}",
                summary.run_id,
                summary.sources.len(),
                summary.total_found(),
                summary.total_new(),
            );

            let scorer = build_scorer(&settings)?;
            match scorer
                .score_pending(store.as_ref(), &settings.profile, &AtomicBool::new(false))
                .await
            {
                Ok(batch) => println!(
                    "scoring complete: scored={} failed={} dealbreakers={}",
                    batch.scored, batch.failed, batch.dealbreakers
                ),
                Err(err) => eprintln!("scoring skipped: {err}"),
            }
        }
        Commands::Score => {
            let scorer = build_scorer(&settings)?;
            let batch = scorer
                .score_pending(store.as_ref(), &settings.profile, &AtomicBool::new(false))
                .await?;
            println!(
                "scoring complete: scored={} failed={} dealbreakers={}",
                batch.scored, batch.failed, batch.dealbreakers
            );
        }
        Commands::Serve => {
            let pipeline = Arc::new(IngestPipeline::new(
                settings.clone(),
                sources,
                store.clone(),
            )?);
            if let Some(scheduler) = maybe_build_scheduler(pipeline).await? {
                scheduler.start().await.context("starting scheduler")?;
            }

            let port: u16 = std::env::var("JOBSCOUT_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8300);
            let scorer = build_scorer(&settings)?;
            let state = AppState {
                store,
                scorer: Arc::new(scorer),
                settings,
            };
            println!("serving on 0.0.0.0:{port}");
            jobscout_api::serve(("0.0.0.0", port), state).await?;
        }
    }

    Ok(())
}
