//! Scoring orchestration: builds Oracle requests from a job plus the
//! candidate profile, validates the structured output, and drives batches
//! under a requests-per-minute ceiling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobscout_core::{CandidateProfile, JobRecord, ScoringOutput};
use jobscout_store::{JobStore, StoreError, TokenBucket};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "jobscout-score";

/// Description text is truncated to this many chars when building a prompt.
const PROMPT_DESCRIPTION_LEN: usize = 3_000;
/// Raw page text is truncated harder; it is unstructured filler past this.
const PROMPT_RAW_TEXT_LEN: usize = 8_000;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("oracle returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("oracle returned an empty completion")]
    Empty,
}

/// External capability that evaluates a job description against a candidate
/// profile. Implementations are plain completion endpoints; all structure
/// is negotiated through the prompt and validated on the way back.
#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, OracleError>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleProvider {
    OpenRouter,
    Ollama,
}

impl std::str::FromStr for OracleProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openrouter" => Ok(OracleProvider::OpenRouter),
            "ollama" => Ok(OracleProvider::Ollama),
            other => anyhow::bail!("unknown oracle provider '{other}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub provider: OracleProvider,
    pub model: String,
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
}

pub fn build_oracle(config: &OracleConfig) -> anyhow::Result<Box<dyn ScoringOracle>> {
    match config.provider {
        OracleProvider::OpenRouter => {
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| anyhow::anyhow!("openrouter provider requires an api key"))?;
            Ok(Box::new(OpenRouterOracle::new(
                api_key,
                config.model.clone(),
                config.endpoint.clone(),
            )?))
        }
        OracleProvider::Ollama => Ok(Box::new(OllamaOracle::new(
            config
                .endpoint
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            config.model.clone(),
        )?)),
    }
}

#[derive(Debug, serde::Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, serde::Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// OpenRouter-compatible chat-completions client.
pub struct OpenRouterOracle {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenRouterOracle {
    pub fn new(api_key: String, model: String, endpoint: Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            api_key,
            model,
            endpoint: endpoint
                .unwrap_or_else(|| "https://openrouter.ai/api/v1/chat/completions".to_string()),
        })
    }
}

#[async_trait]
impl ScoringOracle for OpenRouterOracle {
    async fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::HttpStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(OracleError::Empty)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, serde::Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

/// Local Ollama `/api/chat` client.
pub struct OllamaOracle {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaOracle {
    pub fn new(endpoint: String, model: String) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            endpoint,
            model,
        })
    }
}

#[async_trait]
impl ScoringOracle for OllamaOracle {
    async fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        let request = OllamaChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.endpoint.trim_end_matches('/')))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::HttpStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: OllamaChatResponse = response.json().await?;
        if parsed.message.content.trim().is_empty() {
            return Err(OracleError::Empty);
        }
        Ok(parsed.message.content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn truncated(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn profile_block(profile: &CandidateProfile) -> String {
    let history = profile
        .work_history
        .iter()
        .map(|w| format!("- {} @ {} ({})", w.title, w.company, w.duration))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "CANDIDATE PROFILE:\nName: {}\nHeadline: {}\nExperience: {}+ years\nSkills: {}\nLocation: {}\nTarget Roles: {}\nTarget Industries: {}\nWork History:\n{}",
        profile.name,
        profile.headline,
        profile.experience_years,
        profile.skills.join(", "),
        profile.location,
        profile.target_roles.join(", "),
        profile.target_industries.join(", "),
        history,
    )
}

/// Scoring prompt. The clarified variant is the reduced request used after
/// the Oracle returns something that fails validation.
pub fn build_scoring_prompt(job: &JobRecord, profile: &CandidateProfile, clarified: bool) -> String {
    let job_block = format!(
        "JOB POSTING:\nTitle: {}\nCompany: {}\nLocation: {}\nSalary: {}\nSource: {}\nDescription:\n{}",
        job.title,
        job.company,
        job.location,
        job.salary_text.as_deref().unwrap_or("Not listed"),
        job.source,
        truncated(&job.description, PROMPT_DESCRIPTION_LEN),
    );

    let mut prompt = format!(
        "You are a job match analyst. Score how well this job matches the candidate on a scale of 0-100.\n\n{}\n\n{}\n\n\
SCORING GUIDE:\n\
- 90-100: Perfect match - right role, right location, right pay, strong skill overlap\n\
- 70-89: Strong match - most criteria met, worth applying\n\
- 50-69: Moderate match - some fit, might be a stretch\n\
- 30-49: Weak match - significant gaps or misalignment\n\
- 0-29: Poor match - wrong field, wrong location, or does not fit\n\
Only score above 60 if the candidate could genuinely perform this job with their actual experience. Be skeptical; a false positive wastes the candidate's time.\n\n\
ALSO PROVIDE:\n\
- \"summary\": a 2-sentence summary of what the role actually is.\n\
- \"ghost_risk\": \"low\", \"medium\", or \"high\" - likelihood this is a stale or fake posting, judged from how vague the description is.\n\
- \"keyword_match\": the top required skills/tools/qualifications from the description, each checked against the candidate profile. Categories: \"hard_skill\", \"soft_skill\", \"tool\", \"certification\".\n\
- \"gaps\": 3-5 specific gaps between the candidate and this role; \"transferable\" is true when the candidate has partial coverage.\n\
- \"salary_estimate\": if the posting lists no salary, estimate an annual range as a string, otherwise null.\n\n\
Return ONLY valid JSON (no markdown fences):\n\
{{\"score\": 0, \"pros\": [\"...\"], \"cons\": [\"...\"], \"fit_summary\": \"One sentence.\", \"summary\": \"Two sentences.\", \"ghost_risk\": \"low\", \"keyword_match\": [{{\"keyword\": \"Project Management\", \"category\": \"hard_skill\", \"matched\": true}}], \"gaps\": [{{\"description\": \"PMP certification\", \"transferable\": true}}], \"salary_estimate\": \"$65,000 - $85,000\"}}",
        profile_block(profile),
        job_block,
    );

    if clarified {
        prompt.push_str(
            "\n\nIMPORTANT: your previous reply was not a single valid JSON object of the shape above. \
Reply with exactly one JSON object, no prose, no markdown fences, score as an integer between 0 and 100.",
        );
    }
    prompt
}

/// Prompt used when a capture arrives as raw page text and field extraction
/// is deferred to the Oracle.
pub fn build_parse_prompt(raw_text: &str, url: Option<&str>) -> String {
    format!(
        "Extract job posting details from this page text. The page URL is: {}\n\n\
PAGE TEXT:\n{}\n\n\
Return ONLY valid JSON (no markdown fences):\n\
{{\"title\": \"Job Title\", \"company\": \"Company Name\", \"location\": \"City, State or Remote\", \"salary_text\": \"salary range if mentioned or empty string\", \"description\": \"the job description text (key responsibilities, requirements, qualifications)\"}}\n\n\
If you cannot identify a job posting in this text, return:\n\
{{\"error\": \"Could not identify a job posting on this page\"}}",
        url.unwrap_or("unknown"),
        truncated(raw_text, PROMPT_RAW_TEXT_LEN),
    )
}

// ---------------------------------------------------------------------------
// Output validation
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("output is not a JSON object")]
    NotAnObject,
    #[error("score is missing or not numeric")]
    ScoreNotNumeric,
    #[error("score {0} is outside 0..=100")]
    ScoreOutOfRange(f64),
}

/// Strip the markdown code fences providers wrap JSON in.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.rsplit_once("```").map(|(body, _)| body).unwrap_or(rest).trim()
}

/// Validate a raw Oracle completion against the Scoring Output schema.
/// Any deviation — unparseable JSON, missing fields, non-numeric or
/// out-of-range score — is a retryable error, never merged into a record.
pub fn parse_scoring_output(raw: &str) -> Result<ScoringOutput, ValidationError> {
    let cleaned = strip_code_fences(raw);
    let mut value: JsonValue = serde_json::from_str(cleaned)?;
    let obj = value.as_object_mut().ok_or(ValidationError::NotAnObject)?;

    let score = obj
        .get("score")
        .and_then(JsonValue::as_f64)
        .ok_or(ValidationError::ScoreNotNumeric)?;
    if !(0.0..=100.0).contains(&score) {
        return Err(ValidationError::ScoreOutOfRange(score));
    }
    obj.insert("score".to_string(), JsonValue::from(score.round() as u8));

    Ok(serde_json::from_value(value)?)
}

/// Fields recovered by the Oracle from a raw-text capture.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ParsedPosting {
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub salary_text: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Error)]
pub enum ParsePostingError {
    #[error("{0}")]
    NoJobFound(String),
    #[error("output is not a parseable posting: {0}")]
    Invalid(#[from] serde_json::Error),
}

pub fn parse_posting_output(raw: &str) -> Result<ParsedPosting, ParsePostingError> {
    let cleaned = strip_code_fences(raw);
    let value: JsonValue = serde_json::from_str(cleaned)?;
    if let Some(error) = value.get("error").and_then(JsonValue::as_str) {
        return Err(ParsePostingError::NoJobFound(error.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("candidate profile incomplete: missing {0}")]
    Gate(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// Retries after the first attempt, per job.
    pub max_retries: usize,
    pub requests_per_minute: u32,
    pub per_call_timeout: Duration,
    /// Overall budget for the interactive capture path.
    pub capture_timeout: Duration,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            requests_per_minute: 6,
            per_call_timeout: Duration::from_secs(60),
            capture_timeout: Duration::from_secs(25),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScoreBatchSummary {
    pub scored: usize,
    pub failed: usize,
    pub dealbreakers: usize,
    pub cancelled: bool,
}

fn dealbreaker_hit(job: &JobRecord, profile: &CandidateProfile) -> Option<String> {
    let haystack = format!("{} {} {}", job.title, job.company, job.description).to_lowercase();
    profile
        .dealbreakers
        .iter()
        .find(|kw| !kw.trim().is_empty() && haystack.contains(&kw.trim().to_lowercase()))
        .cloned()
}

/// Drives Oracle calls for both the batch and the interactive capture path,
/// sharing one requests-per-minute bucket so the ceiling holds globally.
pub struct Scorer {
    oracle: Box<dyn ScoringOracle>,
    bucket: TokenBucket,
    config: ScoringConfig,
}

impl Scorer {
    pub fn new(oracle: Box<dyn ScoringOracle>, config: ScoringConfig) -> Self {
        Self {
            bucket: TokenBucket::per_minute(config.requests_per_minute),
            oracle,
            config,
        }
    }

    pub fn oracle(&self) -> &dyn ScoringOracle {
        self.oracle.as_ref()
    }

    /// One job through the call/validate/retry loop. `None` means retries
    /// were exhausted and the job should carry the failure marker.
    async fn attempt_scoring(
        &self,
        job: &JobRecord,
        profile: &CandidateProfile,
    ) -> Option<ScoringOutput> {
        for attempt in 0..=self.config.max_retries {
            self.bucket.take().await;
            let prompt = build_scoring_prompt(job, profile, attempt > 0);
            let completion =
                tokio::time::timeout(self.config.per_call_timeout, self.oracle.complete(&prompt))
                    .await;

            let raw = match completion {
                Ok(Ok(raw)) => raw,
                Ok(Err(err)) => {
                    warn!(job = %job.id, attempt, %err, "oracle call failed");
                    continue;
                }
                Err(_) => {
                    warn!(job = %job.id, attempt, "oracle call timed out");
                    continue;
                }
            };

            match parse_scoring_output(&raw) {
                Ok(output) => return Some(output),
                Err(err) => {
                    warn!(job = %job.id, attempt, %err, "invalid scoring output, will clarify and retry");
                }
            }
        }
        None
    }

    /// Score everything pending, oldest first. The validation gate runs
    /// once up front: an incomplete profile fails the whole batch with a
    /// single error and zero Oracle calls.
    pub async fn score_pending(
        &self,
        store: &dyn JobStore,
        profile: &CandidateProfile,
        cancel: &AtomicBool,
    ) -> Result<ScoreBatchSummary, ScoringError> {
        let missing = profile.missing_fields();
        if !missing.is_empty() {
            return Err(ScoringError::Gate(missing.join(", ")));
        }

        let pending = store.unscored().await?;
        info!(pending = pending.len(), "scoring batch starting");
        let mut summary = ScoreBatchSummary::default();

        for mut job in pending {
            if cancel.load(Ordering::Relaxed) {
                summary.cancelled = true;
                break;
            }

            if let Some(keyword) = dealbreaker_hit(&job, profile) {
                job.score = Some(0);
                job.cons = vec![format!("Dealbreaker: contains '{keyword}'")];
                job.fit_summary =
                    Some(format!("Auto-rejected: posting contains dealbreaker keyword '{keyword}'."));
                job.updated_at = Utc::now();
                store.update(&job).await?;
                summary.dealbreakers += 1;
                continue;
            }

            match self.attempt_scoring(&job, profile).await {
                Some(output) => {
                    job.apply_scoring(output, Utc::now());
                    store.update(&job).await?;
                    summary.scored += 1;
                }
                None => {
                    // One bad job must not stall the batch.
                    job.scoring_failed = true;
                    job.updated_at = Utc::now();
                    store.update(&job).await?;
                    summary.failed += 1;
                }
            }
        }

        info!(
            scored = summary.scored,
            failed = summary.failed,
            dealbreakers = summary.dealbreakers,
            cancelled = summary.cancelled,
            "scoring batch finished"
        );
        Ok(summary)
    }

    /// Interactive path: score one captured record under a hard overall
    /// timeout. Returns whether the record ended up scored; on gate failure
    /// or timeout the record is left unscored ("scoring pending") rather
    /// than blocking the caller.
    pub async fn score_captured(
        &self,
        record: &mut JobRecord,
        profile: &CandidateProfile,
    ) -> bool {
        if !profile.missing_fields().is_empty() {
            debug!(job = %record.id, "profile incomplete; capture left unscored");
            return false;
        }

        if let Some(keyword) = dealbreaker_hit(record, profile) {
            record.score = Some(0);
            record.cons = vec![format!("Dealbreaker: contains '{keyword}'")];
            record.fit_summary =
                Some(format!("Auto-rejected: posting contains dealbreaker keyword '{keyword}'."));
            record.updated_at = Utc::now();
            return true;
        }

        let outcome =
            tokio::time::timeout(self.config.capture_timeout, self.attempt_scoring(record, profile))
                .await;
        match outcome {
            Ok(Some(output)) => {
                record.apply_scoring(output, Utc::now());
                true
            }
            Ok(None) => {
                record.scoring_failed = true;
                record.updated_at = Utc::now();
                false
            }
            Err(_) => {
                debug!(job = %record.id, "capture scoring timed out; returning unscored");
                false
            }
        }
    }

    /// Resolve a raw-text capture into structured fields via the Oracle.
    pub async fn parse_posting_text(
        &self,
        raw_text: &str,
        url: Option<&str>,
    ) -> Result<ParsedPosting, ParsePostingError> {
        self.bucket.take().await;
        let prompt = build_parse_prompt(raw_text, url);
        let completion =
            tokio::time::timeout(self.config.per_call_timeout, self.oracle.complete(&prompt)).await;
        let raw = match completion {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                return Err(ParsePostingError::NoJobFound(format!(
                    "oracle unavailable: {err}"
                )))
            }
            Err(_) => {
                return Err(ParsePostingError::NoJobFound(
                    "oracle timed out parsing page text".to_string(),
                ))
            }
        };
        parse_posting_output(&raw)
    }
}

/// Scripted oracle for tests: pops canned completions in order.
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    pub struct ScriptedOracle {
        responses: Mutex<VecDeque<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedOracle {
        pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScoringOracle for ScriptedOracle {
        async fn complete(&self, _prompt: &str) -> Result<String, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .expect("scripted oracle lock")
                .pop_front()
                .ok_or(OracleError::Empty)
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    // Lets tests hold a handle to the script while the scorer owns a boxed
    // clone.
    #[async_trait]
    impl ScoringOracle for std::sync::Arc<ScriptedOracle> {
        async fn complete(&self, prompt: &str) -> Result<String, OracleError> {
            self.as_ref().complete(prompt).await
        }

        fn model_name(&self) -> &str {
            self.as_ref().model_name()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedOracle;
    use super::*;
    use chrono::TimeZone;
    use jobscout_core::{GhostRisk, JobStatus, WorkHistoryEntry};
    use jobscout_store::{blank_record, FileStore};
    use tempfile::tempdir;

    const VALID_OUTPUT: &str = r#"{
        "score": 82,
        "pros": ["Right industry", "Local"],
        "cons": ["Shift work"],
        "fit_summary": "Strong operational fit.",
        "summary": "Runs the second-shift production floor. Reports to the plant manager.",
        "ghost_risk": "low",
        "keyword_match": [{"keyword": "Scheduling", "category": "hard_skill", "matched": true}],
        "gaps": [{"description": "Six Sigma", "transferable": true}],
        "salary_estimate": "$60,000 - $75,000"
    }"#;

    fn profile() -> CandidateProfile {
        CandidateProfile {
            name: "Sam".into(),
            headline: "Operations leader".into(),
            experience_years: 12,
            work_history: vec![WorkHistoryEntry {
                title: "Plant Manager".into(),
                company: "Acme".into(),
                duration: "2019-2024".into(),
            }],
            skills: vec!["Scheduling".into(), "Lean".into()],
            location: "Oklahoma City, OK".into(),
            target_roles: vec!["Operations Manager".into()],
            target_industries: vec!["Manufacturing".into()],
            dealbreakers: vec!["CDL required".into()],
        }
    }

    fn job() -> JobRecord {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap();
        let mut job = blank_record("indeed", "jk-1", "Acme", "Operations Manager", now);
        job.description = "Own production scheduling across two shifts.".into();
        job
    }

    fn fast_config() -> ScoringConfig {
        ScoringConfig {
            max_retries: 2,
            requests_per_minute: 6_000,
            per_call_timeout: Duration::from_secs(2),
            capture_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn valid_output_parses_with_fences() {
        let fenced = format!("```json\n{VALID_OUTPUT}\n```");
        let output = parse_scoring_output(&fenced).expect("parses");
        assert_eq!(output.score, 82);
        assert_eq!(output.ghost_risk, GhostRisk::Low);
        assert_eq!(output.pros.len(), 2);
        assert!(output.gaps[0].transferable);
    }

    #[test]
    fn out_of_range_and_non_numeric_scores_are_invalid() {
        let high = VALID_OUTPUT.replace("\"score\": 82", "\"score\": 150");
        assert!(matches!(
            parse_scoring_output(&high),
            Err(ValidationError::ScoreOutOfRange(s)) if s == 150.0
        ));

        let stringy = VALID_OUTPUT.replace("\"score\": 82", "\"score\": \"82\"");
        assert!(matches!(
            parse_scoring_output(&stringy),
            Err(ValidationError::ScoreNotNumeric)
        ));
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let missing = VALID_OUTPUT.replace("\"fit_summary\": \"Strong operational fit.\",", "");
        assert!(parse_scoring_output(&missing).is_err());
    }

    #[tokio::test]
    async fn invalid_output_is_retried_with_clarified_prompt() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open");
        store.admit(job()).await.expect("admit");

        let oracle = std::sync::Arc::new(ScriptedOracle::new(["not json at all", VALID_OUTPUT]));
        let scorer = Scorer::new(Box::new(oracle.clone()), fast_config());
        let summary = scorer
            .score_pending(&store, &profile(), &AtomicBool::new(false))
            .await
            .expect("batch runs");

        assert_eq!(summary.scored, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(oracle.calls(), 2);

        let scored = store.unscored().await.expect("query");
        assert!(scored.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_mark_scoring_failed() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open");
        let admitted = store.admit(job()).await.expect("admit");
        let id = admitted.record().id;

        // Out-of-range score every time: initial attempt + 2 retries.
        let bad = VALID_OUTPUT.replace("\"score\": 82", "\"score\": 180");
        let oracle = ScriptedOracle::new([bad.clone(), bad.clone(), bad]);
        let scorer = Scorer::new(Box::new(oracle), fast_config());
        let summary = scorer
            .score_pending(&store, &profile(), &AtomicBool::new(false))
            .await
            .expect("batch runs");

        assert_eq!(summary.scored, 0);
        assert_eq!(summary.failed, 1);

        let record = store.get(id).await.expect("get").expect("present");
        assert_eq!(record.score, None);
        assert!(record.scoring_failed);
        assert_eq!(record.status, JobStatus::New);
    }

    #[tokio::test]
    async fn validation_gate_skips_batch_with_zero_oracle_calls() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open");
        for i in 0..3 {
            let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap();
            store
                .admit(blank_record("indeed", &format!("jk-{i}"), "Acme", &format!("Role {i}"), now))
                .await
                .expect("admit");
        }

        let mut gated = profile();
        gated.skills.clear();

        let oracle = std::sync::Arc::new(ScriptedOracle::new([VALID_OUTPUT]));
        let scorer = Scorer::new(Box::new(oracle.clone()), fast_config());
        let err = scorer
            .score_pending(&store, &gated, &AtomicBool::new(false))
            .await
            .expect_err("gate fails");

        assert!(matches!(err, ScoringError::Gate(ref fields) if fields.contains("skills")));
        assert_eq!(oracle.calls(), 0);
        // Every job still pending, none marked failed.
        assert_eq!(store.unscored().await.expect("query").len(), 3);
    }

    #[tokio::test]
    async fn dealbreaker_scores_zero_without_oracle() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open");
        let mut hit = job();
        hit.description = "Class A CDL required for this role.".into();
        let id = store.admit(hit).await.expect("admit").record().id;

        let oracle = ScriptedOracle::new(Vec::<String>::new());
        let scorer = Scorer::new(Box::new(oracle), fast_config());
        let summary = scorer
            .score_pending(&store, &profile(), &AtomicBool::new(false))
            .await
            .expect("batch runs");

        assert_eq!(summary.dealbreakers, 1);
        let record = store.get(id).await.expect("get").expect("present");
        assert_eq!(record.score, Some(0));
        assert!(record.cons[0].contains("CDL required"));
    }

    #[tokio::test]
    async fn cancellation_stops_between_jobs() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).await.expect("open");
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap();
        for i in 0..2 {
            store
                .admit(blank_record("indeed", &format!("c-{i}"), "Acme", &format!("Role {i}"), now))
                .await
                .expect("admit");
        }

        let cancel = AtomicBool::new(true);
        let oracle = ScriptedOracle::new([VALID_OUTPUT]);
        let scorer = Scorer::new(Box::new(oracle), fast_config());
        let summary = scorer
            .score_pending(&store, &profile(), &cancel)
            .await
            .expect("batch runs");

        assert!(summary.cancelled);
        assert_eq!(summary.scored, 0);
        // Nothing corrupted: both records remain pending and unmarked.
        let pending = store.unscored().await.expect("query");
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|r| !r.scoring_failed));
    }

    #[test]
    fn parse_posting_output_surfaces_no_job_error() {
        let err = parse_posting_output(r#"{"error": "Could not identify a job posting on this page"}"#)
            .expect_err("error payload");
        assert!(matches!(err, ParsePostingError::NoJobFound(_)));

        let ok = parse_posting_output(
            r#"{"title": "Dock Lead", "company": "Hooli", "location": "Remote", "salary_text": "", "description": "Load trucks."}"#,
        )
        .expect("parses");
        assert_eq!(ok.title, "Dock Lead");
        assert_eq!(ok.company, "Hooli");
    }
}
