//! Store contract + file-backed implementation, and HTTP fetch utilities
//! shared by the scheduled scrape path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobscout_core::{dedup_key, JobRecord, JobStatus};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Outcome of an atomic check-then-insert against both identity keys.
#[derive(Debug, Clone)]
pub enum AdmitOutcome {
    /// Neither key matched; the candidate was inserted.
    New(JobRecord),
    /// Same `(source, source_id)` re-observed; mutable fields were
    /// refreshed on the existing row and the candidate was discarded.
    DuplicateUnchanged(JobRecord),
    /// Same normalized `(company, title)` under a different source
    /// identity. The candidate was inserted flagged as a repost.
    Repost { record: JobRecord, of: JobRecord },
}

impl AdmitOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            AdmitOutcome::New(r) => r,
            AdmitOutcome::DuplicateUnchanged(r) => r,
            AdmitOutcome::Repost { record, .. } => record,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub source: Option<String>,
    pub min_score: Option<u8>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Keyed upsert/query contract the pipeline runs against. `admit` is the
/// upsert-with-conflict-detection operation: the whole check-then-insert for
/// a candidate's keys happens under the store's internal lock, so concurrent
/// admissions of the same key cannot race.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn admit(&self, candidate: JobRecord) -> Result<AdmitOutcome, StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError>;
    async fn update(&self, record: &JobRecord) -> Result<(), StoreError>;
    /// Idempotent; returns whether the record existed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
    async fn list(&self, filter: JobFilter) -> Result<Vec<JobRecord>, StoreError>;
    /// Records awaiting scoring, oldest `scraped_at` first.
    async fn unscored(&self) -> Result<Vec<JobRecord>, StoreError>;
    async fn count(&self) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct StoreIndex {
    by_id: HashMap<Uuid, JobRecord>,
    by_source_identity: HashMap<(String, String), Uuid>,
    by_dedup_key: HashMap<String, Vec<Uuid>>,
}

impl StoreIndex {
    fn insert(&mut self, record: JobRecord) {
        self.by_source_identity
            .insert((record.source.clone(), record.source_id.clone()), record.id);
        self.by_dedup_key
            .entry(dedup_key(&record.company, &record.title))
            .or_default()
            .push(record.id);
        self.by_id.insert(record.id, record);
    }

    fn remove(&mut self, id: Uuid) -> Option<JobRecord> {
        let record = self.by_id.remove(&id)?;
        self.by_source_identity
            .remove(&(record.source.clone(), record.source_id.clone()));
        if let Some(ids) = self.by_dedup_key.get_mut(&dedup_key(&record.company, &record.title)) {
            ids.retain(|other| *other != id);
        }
        Some(record)
    }
}

/// JSON-file-backed store: one file per record, written with an atomic
/// temp-file rename, plus an in-memory index rebuilt on open.
pub struct FileStore {
    root: PathBuf,
    index: Mutex<StoreIndex>,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut index = StoreIndex::default();
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path).await?;
            match serde_json::from_str::<JobRecord>(&text) {
                Ok(record) => index.insert(record),
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable record file");
                }
            }
        }

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    async fn persist(&self, record: &JobRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let final_path = self.record_path(record.id);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileStore {
    async fn admit(&self, mut candidate: JobRecord) -> Result<AdmitOutcome, StoreError> {
        let mut index = self.index.lock().await;

        // Primary key: the same posting re-observed. Refresh mutable fields,
        // never re-score.
        let source_key = (candidate.source.clone(), candidate.source_id.clone());
        if let Some(existing_id) = index.by_source_identity.get(&source_key).copied() {
            if let Some(existing) = index.by_id.get_mut(&existing_id) {
                existing.scraped_at = candidate.scraped_at;
                existing.updated_at = candidate.updated_at;
                let refreshed = existing.clone();
                self.persist(&refreshed).await?;
                return Ok(AdmitOutcome::DuplicateUnchanged(refreshed));
            }
        }

        // Secondary key: same company+title seen before under a different
        // source identity. A repost is a signal, not noise: insert anyway.
        let key = dedup_key(&candidate.company, &candidate.title);
        let prior = index
            .by_dedup_key
            .get(&key)
            .and_then(|ids| ids.first())
            .and_then(|id| index.by_id.get(id))
            .cloned();

        if let Some(of) = prior {
            candidate.repost = true;
            candidate.repost_of = Some(of.id);
            self.persist(&candidate).await?;
            index.insert(candidate.clone());
            return Ok(AdmitOutcome::Repost {
                record: candidate,
                of,
            });
        }

        self.persist(&candidate).await?;
        index.insert(candidate.clone());
        Ok(AdmitOutcome::New(candidate))
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.index.lock().await.by_id.get(&id).cloned())
    }

    async fn update(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut index = self.index.lock().await;
        if !index.by_id.contains_key(&record.id) {
            return Err(StoreError::NotFound(record.id));
        }
        self.persist(record).await?;
        index.remove(record.id);
        index.insert(record.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut index = self.index.lock().await;
        let existed = index.remove(id).is_some();
        if existed {
            let _ = fs::remove_file(self.record_path(id)).await;
        }
        Ok(existed)
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let index = self.index.lock().await;
        let mut records: Vec<JobRecord> = index
            .by_id
            .values()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.source.as_deref().map_or(true, |s| r.source == s))
            .filter(|r| {
                filter
                    .min_score
                    .map_or(true, |min| r.score.map_or(true, |s| s >= min))
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let records = records
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(records)
    }

    async fn unscored(&self) -> Result<Vec<JobRecord>, StoreError> {
        let index = self.index.lock().await;
        let mut records: Vec<JobRecord> = index
            .by_id
            .values()
            .filter(|r| r.score.is_none())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.scraped_at.cmp(&b.scraped_at));
        Ok(records)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.index.lock().await.by_id.len())
    }
}

/// Stable id for sources that supply no native identifier: a truncated
/// sha256 over the posting's URL (or, failing that, its identity fields),
/// identical across re-observations so primary dedup holds.
pub fn derived_source_id(material: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

// ---------------------------------------------------------------------------
// HTTP fetching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: reqwest::StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_fetch_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Token bucket used to keep a caller under an external requests-per-period
/// ceiling. `take` suspends until a token is available.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket paced for a requests-per-minute ceiling: burst up to the
    /// ceiling, steady refill of one token per interval.
    pub fn per_minute(ceiling: u32) -> Self {
        let ceiling = ceiling.max(1);
        Self::new(ceiling, Duration::from_secs(60) / ceiling)
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Pages within one source are fetched one at a time to respect that
    /// source's rate tolerance.
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Retrying page fetcher with bounded global and per-source concurrency.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_text(&self, source: &str, url: &str) -> Result<String, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("page_fetch", source, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable http status, backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_fetch_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%err, attempt, "retryable fetch error, backing off");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

/// Convenience for tests and record construction.
pub fn blank_record(source: &str, source_id: &str, company: &str, title: &str, now: DateTime<Utc>) -> JobRecord {
    JobRecord {
        id: Uuid::new_v4(),
        source: source.to_string(),
        source_id: source_id.to_string(),
        company: company.to_string(),
        title: title.to_string(),
        location: String::new(),
        description: String::new(),
        url: None,
        salary_text: None,
        posted_date: None,
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn same_source_identity_admits_once() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open");

        let first = store
            .admit(blank_record("indeed", "jk-1", "Acme", "Senior Engineer", now()))
            .await
            .expect("first admit");
        assert!(matches!(first, AdmitOutcome::New(_)));

        let later = now() + chrono::Duration::hours(8);
        let mut resubmit = blank_record("indeed", "jk-1", "Acme", "Senior Engineer", later);
        resubmit.updated_at = later;
        let second = store.admit(resubmit).await.expect("second admit");

        match second {
            AdmitOutcome::DuplicateUnchanged(existing) => {
                assert_eq!(existing.id, first.record().id);
                assert_eq!(existing.scraped_at, later);
            }
            other => panic!("expected duplicate-unchanged, got {other:?}"),
        }
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn repost_inserts_flagged_row() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open");

        let first = store
            .admit(blank_record("indeed", "jk-1", "Acme Widgets LLC", "Senior Engineer", now()))
            .await
            .expect("first admit");

        let second = store
            .admit(blank_record("ziprecruiter", "zr-9", "ACME Widgets", "Senior  Engineer", now()))
            .await
            .expect("second admit");

        match second {
            AdmitOutcome::Repost { record, of } => {
                assert!(record.repost);
                assert_eq!(record.repost_of, Some(first.record().id));
                assert_eq!(of.id, first.record().id);
            }
            other => panic!("expected repost, got {other:?}"),
        }
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_admissions_of_distinct_sources_all_land() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FileStore::open(dir.path()).await.expect("open"));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let source = format!("board-{i}");
                store
                    .admit(blank_record(&source, "post-1", "Acme", "Senior Engineer", now()))
                    .await
                    .expect("admit")
            }));
        }

        let mut new_count = 0;
        let mut repost_count = 0;
        for handle in handles {
            match handle.await.expect("join") {
                AdmitOutcome::New(_) => new_count += 1,
                AdmitOutcome::Repost { .. } => repost_count += 1,
                AdmitOutcome::DuplicateUnchanged(_) => panic!("distinct sources cannot collide"),
            }
        }

        // None lost, none double-counted as duplicates of each other.
        assert_eq!(new_count, 1);
        assert_eq!(repost_count, 7);
        assert_eq!(store.count().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        let id = {
            let store = FileStore::open(dir.path()).await.expect("open");
            let outcome = store
                .admit(blank_record("monster", "m-1", "Globex", "Night Auditor", now()))
                .await
                .expect("admit");
            outcome.record().id
        };

        let reopened = FileStore::open(dir.path()).await.expect("reopen");
        let loaded = reopened.get(id).await.expect("get").expect("present");
        assert_eq!(loaded.company, "Globex");

        // Index was rebuilt: the same source identity still dedups.
        let again = reopened
            .admit(blank_record("monster", "m-1", "Globex", "Night Auditor", now()))
            .await
            .expect("admit");
        assert!(matches!(again, AdmitOutcome::DuplicateUnchanged(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open");
        let outcome = store
            .admit(blank_record("indeed", "jk-2", "Acme", "Analyst", now()))
            .await
            .expect("admit");
        let id = outcome.record().id;

        assert!(store.delete(id).await.expect("first delete"));
        assert!(!store.delete(id).await.expect("second delete"));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unscored_is_oldest_first() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open");

        let older = now();
        let newer = now() + chrono::Duration::hours(3);
        store
            .admit(blank_record("indeed", "a", "Acme", "Role A", newer))
            .await
            .expect("admit");
        store
            .admit(blank_record("indeed", "b", "Globex", "Role B", older))
            .await
            .expect("admit");

        let pending = store.unscored().await.expect("unscored");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].source_id, "b");
        assert_eq!(pending[1].source_id, "a");
    }

    #[test]
    fn derived_source_ids_are_stable() {
        let a = derived_source_id("https://example.com/careers/42");
        let b = derived_source_id("https://example.com/careers/42");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, derived_source_id("https://example.com/careers/43"));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn token_bucket_allows_burst_then_paces() {
        let bucket = TokenBucket::new(2, Duration::from_millis(40));
        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() < Duration::from_millis(30));
        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
