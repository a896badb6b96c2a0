//! Ingestion orchestration: drives extraction across the configured sources
//! under concurrency and wall-clock limits, and runs ad hoc captures through
//! the same normalize -> dedup -> score path.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobscout_core::{CandidateProfile, JobRecord, JobStatus, MAX_DESCRIPTION_LEN};
use jobscout_extract::{extract_with_fallback, ExtractedJob, ExtractionTier, StrategyRegistry};
use jobscout_score::{ParsePostingError, Scorer};
use jobscout_store::{
    derived_source_id, AdmitOutcome, HttpClientConfig, HttpFetcher, JobStore, StoreError,
};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-pipeline";

// ---------------------------------------------------------------------------
// Configuration snapshot
// ---------------------------------------------------------------------------

fn default_high_score() -> u8 {
    80
}

fn default_rpm() -> u32 {
    6
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "qwen2.5:14b".to_string()
}

fn default_user_agent() -> String {
    "jobscout/0.1".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_worker_limit() -> usize {
    4
}

fn default_run_budget_secs() -> u64 {
    900
}

fn default_scrape_cron() -> String {
    "0 0 13,21 * * *".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleSettings {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            endpoint: None,
            requests_per_minute: default_rpm(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeSettings {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,
    #[serde(default = "default_run_budget_secs")]
    pub run_budget_secs: u64,
    #[serde(default)]
    pub scheduler_enabled: bool,
    #[serde(default = "default_scrape_cron")]
    pub scrape_cron: String,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            http_timeout_secs: default_timeout_secs(),
            worker_limit: default_worker_limit(),
            run_budget_secs: default_run_budget_secs(),
            scheduler_enabled: false,
            scrape_cron: default_scrape_cron(),
        }
    }
}

/// Immutable configuration snapshot taken at run start. Editing the settings
/// file mid-run never changes a run already in flight.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub exclude_companies: Vec<String>,
    #[serde(default)]
    pub exclude_title_keywords: Vec<String>,
    #[serde(default = "default_high_score")]
    pub high_score_threshold: u8,
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub scrape: ScrapeSettings,
    #[serde(default)]
    pub profile: CandidateProfile,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            exclude_companies: Vec::new(),
            exclude_title_keywords: Vec::new(),
            high_score_threshold: default_high_score(),
            oracle: OracleSettings::default(),
            scrape: ScrapeSettings::default(),
            profile: CandidateProfile::default(),
        }
    }
}

impl Settings {
    /// Load from YAML, falling back to defaults when the file is absent.
    /// The Oracle key can always be supplied via `JOBSCOUT_ORACLE_API_KEY`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut settings: Settings = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Settings::default()
        };
        if settings.oracle.api_key.is_none() {
            settings.oracle.api_key = std::env::var("JOBSCOUT_ORACLE_API_KEY").ok();
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub listing_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SourceRegistryFile {
    sources: Vec<SourceConfig>,
}

/// The eight scraped boards, disabled until listing URLs are configured.
pub fn default_sources() -> Vec<SourceConfig> {
    [
        ("indeed", "Indeed"),
        ("simplyhired", "SimplyHired"),
        ("linkedin", "LinkedIn"),
        ("ziprecruiter", "ZipRecruiter"),
        ("glassdoor", "Glassdoor"),
        ("monster", "Monster"),
        ("careerbuilder", "CareerBuilder"),
        ("flexjobs", "FlexJobs"),
    ]
    .into_iter()
    .map(|(source_id, display_name)| SourceConfig {
        source_id: source_id.to_string(),
        display_name: display_name.to_string(),
        enabled: false,
        listing_urls: Vec::new(),
    })
    .collect()
}

pub fn load_source_registry(path: impl AsRef<Path>) -> Result<Vec<SourceConfig>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(default_sources());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: SourceRegistryFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed.sources)
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

fn resolve_url(href: &str, page_url: Option<&str>) -> String {
    if !href.starts_with('/') {
        return href.to_string();
    }
    let Some(page) = page_url else {
        return href.to_string();
    };
    let scheme_host = page
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .map(|host| {
            let scheme = page.split("://").next().unwrap_or("https");
            format!("{scheme}://{host}")
        });
    match scheme_host {
        Some(base) => format!("{base}{href}"),
        None => href.to_string(),
    }
}

/// Map an extracted payload into a canonical record. Returns `None` when
/// the payload has no title — unstructured hints must go through the Oracle
/// parse path first.
pub fn normalize(
    job: ExtractedJob,
    source: &str,
    page_url: Option<&str>,
    now: DateTime<Utc>,
) -> Option<JobRecord> {
    let title = job.title.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
    let company = job
        .company
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or("Unknown");

    let url = job
        .url
        .as_deref()
        .map(|href| resolve_url(href, page_url))
        .or_else(|| page_url.map(ToString::to_string));

    let source_id = match &url {
        Some(url) => derived_source_id(url),
        None => derived_source_id(&format!("{source}:{company}:{title}")),
    };

    let mut description = job.description.unwrap_or_default();
    if description.len() > MAX_DESCRIPTION_LEN {
        description.truncate(
            (0..=MAX_DESCRIPTION_LEN)
                .rev()
                .find(|i| description.is_char_boundary(*i))
                .unwrap_or(0),
        );
    }

    Some(JobRecord {
        id: Uuid::new_v4(),
        source: source.to_string(),
        source_id,
        company: company.to_string(),
        title: title.to_string(),
        location: job.location.unwrap_or_default(),
        description,
        url,
        salary_text: job.salary_text,
        posted_date: job.posted_date,
        scraped_at: now,
        score: None,
        pros: Vec::new(),
        cons: Vec::new(),
        fit_summary: None,
        summary: None,
        ghost_risk: None,
        keyword_match: Vec::new(),
        gaps: Vec::new(),
        salary_estimate: None,
        scoring_failed: false,
        repost: false,
        repost_of: None,
        repost_confidence: None,
        status: JobStatus::New,
        applied_date: None,
        notes: None,
        created_at: now,
        updated_at: now,
    })
}

/// Exclusion filters applied before a posting ever reaches the Store, to
/// avoid wasted scoring cost.
pub fn excluded_by_filters(title: &str, company: &str, settings: &Settings) -> bool {
    let company_lower = company.to_lowercase();
    if settings
        .exclude_companies
        .iter()
        .any(|c| !c.trim().is_empty() && company_lower.contains(&c.trim().to_lowercase()))
    {
        return true;
    }
    let title_lower = title.to_lowercase();
    settings
        .exclude_title_keywords
        .iter()
        .any(|kw| !kw.trim().is_empty() && title_lower.contains(&kw.trim().to_lowercase()))
}

// ---------------------------------------------------------------------------
// Deduplication engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum DedupOutcome {
    New(JobRecord),
    DuplicateUnchanged(JobRecord),
    Repost { record: JobRecord, of: JobRecord },
}

impl DedupOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            DedupOutcome::New(r) => r,
            DedupOutcome::DuplicateUnchanged(r) => r,
            DedupOutcome::Repost { record, .. } => record,
        }
    }
}

pub struct DedupEngine;

impl DedupEngine {
    /// Similarity between a repost's title and the row it shadows, recorded
    /// for the analytics collaborator.
    pub fn repost_confidence(a: &str, b: &str) -> f64 {
        jaro_winkler(&a.to_lowercase(), &b.to_lowercase())
    }

    /// Run a candidate through the store's atomic check-then-insert and
    /// stamp the repost confidence on the flagged row.
    pub async fn admit(
        store: &dyn JobStore,
        candidate: JobRecord,
    ) -> Result<DedupOutcome, StoreError> {
        match store.admit(candidate).await? {
            AdmitOutcome::New(record) => Ok(DedupOutcome::New(record)),
            AdmitOutcome::DuplicateUnchanged(record) => {
                Ok(DedupOutcome::DuplicateUnchanged(record))
            }
            AdmitOutcome::Repost { mut record, of } => {
                record.repost_confidence = Some(Self::repost_confidence(&record.title, &of.title));
                store.update(&record).await?;
                info!(record = %record.id, of = %of.id, "repost detected");
                Ok(DedupOutcome::Repost { record, of })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduled runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub pages_fetched: usize,
    pub found: usize,
    pub new: usize,
    pub reposts: usize,
    pub duplicates: usize,
    pub excluded: usize,
    pub unstructured_skipped: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceOutcome>,
}

impl RunSummary {
    pub fn total_new(&self) -> usize {
        self.sources.iter().map(|s| s.new + s.reposts).sum()
    }

    pub fn total_found(&self) -> usize {
        self.sources.iter().map(|s| s.found).sum()
    }
}

pub struct IngestPipeline {
    settings: Arc<Settings>,
    sources: Vec<SourceConfig>,
    registry: StrategyRegistry,
    fetcher: HttpFetcher,
    store: Arc<dyn JobStore>,
}

impl IngestPipeline {
    pub fn new(
        settings: Arc<Settings>,
        sources: Vec<SourceConfig>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(settings.scrape.http_timeout_secs),
            user_agent: Some(settings.scrape.user_agent.clone()),
            global_concurrency: settings.scrape.worker_limit.max(1),
            ..HttpClientConfig::default()
        })?;
        Ok(Self {
            settings,
            sources,
            registry: StrategyRegistry::with_default_boards(),
            fetcher,
            store,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// One page of one source through extraction, filters, normalization,
    /// and dedup. Counts land on the passed outcome row.
    pub async fn ingest_page(
        &self,
        source_id: &str,
        page_url: Option<&str>,
        html: &str,
        outcome: &mut SourceOutcome,
    ) -> Result<(), StoreError> {
        let Some(extraction) = extract_with_fallback(&self.registry, Some(source_id), html) else {
            outcome.unstructured_skipped += 1;
            return Ok(());
        };

        // Raw-text hints are only resolvable through an Oracle round-trip,
        // which the scheduled path does not take; the capture path does.
        if extraction.tier == ExtractionTier::RawText {
            outcome.unstructured_skipped += extraction.jobs.len();
            return Ok(());
        }

        for job in extraction.jobs {
            outcome.found += 1;

            let Some(record) = normalize(job, source_id, page_url, Utc::now()) else {
                outcome.unstructured_skipped += 1;
                continue;
            };

            if excluded_by_filters(&record.title, &record.company, &self.settings) {
                outcome.excluded += 1;
                continue;
            }

            match DedupEngine::admit(self.store.as_ref(), record).await? {
                DedupOutcome::New(_) => outcome.new += 1,
                DedupOutcome::DuplicateUnchanged(_) => outcome.duplicates += 1,
                DedupOutcome::Repost { .. } => outcome.reposts += 1,
            }
        }
        Ok(())
    }

    async fn run_source(&self, source: &SourceConfig, deadline: Instant) -> SourceOutcome {
        let mut outcome = SourceOutcome {
            source_id: source.source_id.clone(),
            ..SourceOutcome::default()
        };

        // Pages within a source are sequential; the fetcher additionally
        // serializes per source.
        for url in &source.listing_urls {
            if Instant::now() >= deadline {
                outcome.error = Some("run budget exhausted before all pages fetched".to_string());
                break;
            }
            let html = match self.fetcher.fetch_text(&source.source_id, url).await {
                Ok(html) => html,
                Err(err) => {
                    warn!(source = %source.source_id, %url, %err, "page fetch failed");
                    outcome.error = Some(err.to_string());
                    continue;
                }
            };
            outcome.pages_fetched += 1;
            if let Err(err) = self
                .ingest_page(&source.source_id, Some(url), &html, &mut outcome)
                .await
            {
                warn!(source = %source.source_id, %url, %err, "ingest failed");
                outcome.error = Some(err.to_string());
            }
        }

        outcome
    }

    /// Scheduled multi-source run. Sources run as independent tasks under a
    /// bounded worker pool; one source failing never aborts the others. A
    /// run past its wall-clock budget stops starting new sources but lets
    /// in-flight ones finish; per-record commits make that safe.
    pub async fn run_once(self: Arc<Self>) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = Instant::now() + Duration::from_secs(self.settings.scrape.run_budget_secs);
        let limit = Arc::new(Semaphore::new(self.settings.scrape.worker_limit.max(1)));

        let enabled: Vec<SourceConfig> =
            self.sources.iter().filter(|s| s.enabled).cloned().collect();
        info!(%run_id, sources = enabled.len(), "scheduled run starting");

        let mut handles = Vec::with_capacity(enabled.len());
        for source in enabled {
            let pipeline = Arc::clone(&self);
            let limit = Arc::clone(&limit);
            handles.push(tokio::spawn(async move {
                let _permit = limit.acquire().await.expect("semaphore not closed");
                if Instant::now() >= deadline {
                    return SourceOutcome {
                        source_id: source.source_id.clone(),
                        error: Some("run budget exhausted; source not started".to_string()),
                        ..SourceOutcome::default()
                    };
                }
                pipeline.run_source(&source, deadline).await
            }));
        }

        let mut sources = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => sources.push(outcome),
                Err(err) => warn!(%err, "source task panicked"),
            }
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources,
        };
        info!(
            %run_id,
            found = summary.total_found(),
            new = summary.total_new(),
            "scheduled run finished"
        );
        summary
    }
}

/// Cron-driven runs, when enabled by the settings snapshot.
pub async fn maybe_build_scheduler(
    pipeline: Arc<IngestPipeline>,
) -> Result<Option<JobScheduler>> {
    if !pipeline.settings.scrape.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.settings.scrape.scrape_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_id, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let summary = pipeline.run_once().await;
            info!(run_id = %summary.run_id, new = summary.total_new(), "cron run finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

// ---------------------------------------------------------------------------
// Ad hoc capture
// ---------------------------------------------------------------------------

/// Raw extraction payload submitted from the browser-side collaborator:
/// either structured fields or raw text plus hints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapturePayload {
    pub source: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub salary_text: Option<String>,
    pub description: Option<String>,
    pub raw_text: Option<String>,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Could not extract job data from this page: {0}")]
    CouldNotExtract(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub record: JobRecord,
    pub duplicate: bool,
}

/// Interactive path: one submitted posting through normalize -> dedup ->
/// synchronous scoring. Unresolvable raw text is a typed error; a slow
/// Oracle degrades to an unscored record, never an indefinite block.
pub async fn capture(
    store: &dyn JobStore,
    scorer: &Scorer,
    profile: &CandidateProfile,
    payload: CapturePayload,
) -> Result<CaptureOutcome, CaptureError> {
    let source = payload
        .source
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "capture".to_string());

    let mut extracted = ExtractedJob {
        title: payload.title.clone(),
        company: payload.company.clone(),
        location: payload.location.clone(),
        salary_text: payload.salary_text.clone(),
        description: payload.description.clone(),
        url: payload.url.clone(),
        posted_date: None,
        raw_text: payload.raw_text.clone(),
    };

    let has_title = extracted
        .title
        .as_deref()
        .is_some_and(|t| !t.trim().is_empty());
    if !has_title {
        let Some(raw_text) = payload.raw_text.as_deref().filter(|t| !t.trim().is_empty()) else {
            return Err(CaptureError::CouldNotExtract(
                "payload had neither structured fields nor page text".to_string(),
            ));
        };
        // Field extraction deferred to the Oracle.
        let parsed = scorer
            .parse_posting_text(raw_text, payload.url.as_deref())
            .await
            .map_err(|err| match err {
                ParsePostingError::NoJobFound(msg) => CaptureError::CouldNotExtract(msg),
                ParsePostingError::Invalid(err) => CaptureError::CouldNotExtract(err.to_string()),
            })?;
        extracted.title = Some(parsed.title);
        extracted.company = Some(parsed.company).filter(|c| !c.is_empty());
        extracted.location = Some(parsed.location).filter(|l| !l.is_empty());
        extracted.salary_text = Some(parsed.salary_text).filter(|s| !s.is_empty());
        extracted.description = Some(parsed.description).filter(|d| !d.is_empty());
    }

    let record = normalize(extracted, &source, payload.url.as_deref(), Utc::now())
        .ok_or_else(|| {
            CaptureError::CouldNotExtract("no usable title in submitted payload".to_string())
        })?;

    match DedupEngine::admit(store, record).await? {
        DedupOutcome::DuplicateUnchanged(existing) => Ok(CaptureOutcome {
            record: existing,
            duplicate: true,
        }),
        DedupOutcome::New(mut record) | DedupOutcome::Repost { mut record, .. } => {
            if scorer.score_captured(&mut record, profile).await || record.scoring_failed {
                store.update(&record).await?;
            }
            Ok(CaptureOutcome {
                record,
                duplicate: false,
            })
        }
    }
}
