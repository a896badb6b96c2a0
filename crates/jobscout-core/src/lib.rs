//! Core domain model for JobScout: the canonical job record, the status
//! lifecycle, scoring-output contracts, and the candidate profile.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-core";

/// Hard cap applied to `JobRecord::description` at normalization time.
pub const MAX_DESCRIPTION_LEN: usize = 20_000;

/// Listing age (days) past which ghost risk is bumped one level.
pub const STALE_LISTING_DAYS: i64 = 45;

/// Status lifecycle. The forward chain is
/// `new -> interested -> applied -> interview -> offer`; `rejected` and
/// `withdrawn` are terminal and reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    New,
    Interested,
    Applied,
    Interview,
    Offer,
    Rejected,
    Withdrawn,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("unknown status '{0}'")]
    Unknown(String),
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Rejected | JobStatus::Withdrawn)
    }

    /// Position in the forward chain; terminal states have no position.
    fn chain_rank(self) -> Option<u8> {
        match self {
            JobStatus::New => Some(0),
            JobStatus::Interested => Some(1),
            JobStatus::Applied => Some(2),
            JobStatus::Interview => Some(3),
            JobStatus::Offer => Some(4),
            JobStatus::Rejected | JobStatus::Withdrawn => None,
        }
    }

    /// Transitions are user-driven, so forward jumps (e.g. `new -> applied`)
    /// are legal. Backward moves and leaving a terminal state are not.
    pub fn can_transition(self, to: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to.is_terminal() {
            return true;
        }
        match (self.chain_rank(), to.chain_rank()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Interested => "interested",
            JobStatus::Applied => "applied",
            JobStatus::Interview => "interview",
            JobStatus::Offer => "offer",
            JobStatus::Rejected => "rejected",
            JobStatus::Withdrawn => "withdrawn",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(JobStatus::New),
            "interested" => Ok(JobStatus::Interested),
            "applied" => Ok(JobStatus::Applied),
            "interview" => Ok(JobStatus::Interview),
            "offer" => Ok(JobStatus::Offer),
            "rejected" => Ok(JobStatus::Rejected),
            "withdrawn" => Ok(JobStatus::Withdrawn),
            other => Err(StatusError::Unknown(other.to_string())),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory likelihood that a posting is stale or fake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GhostRisk {
    Low,
    Medium,
    High,
}

impl GhostRisk {
    fn bumped(self) -> GhostRisk {
        match self {
            GhostRisk::Low => GhostRisk::Medium,
            GhostRisk::Medium | GhostRisk::High => GhostRisk::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordCategory {
    HardSkill,
    SoftSkill,
    Tool,
    Certification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordMatch {
    pub keyword: String,
    pub category: KeywordCategory,
    pub matched: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub description: String,
    pub transferable: bool,
}

/// Validated evaluation returned by the Scoring Oracle. Anything that does
/// not parse into this shape (or carries a score outside 0..=100) is a
/// retryable validation failure, never merged into a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringOutput {
    pub score: u8,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    pub fit_summary: String,
    pub summary: String,
    pub ghost_risk: GhostRisk,
    pub keyword_match: Vec<KeywordMatch>,
    pub gaps: Vec<Gap>,
    pub salary_estimate: Option<String>,
}

/// Canonical persisted job posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub source: String,
    pub source_id: String,
    pub company: String,
    pub title: String,
    pub location: String,
    pub description: String,
    pub url: Option<String>,
    pub salary_text: Option<String>,
    pub posted_date: Option<NaiveDate>,
    pub scraped_at: DateTime<Utc>,

    pub score: Option<u8>,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    pub fit_summary: Option<String>,
    pub summary: Option<String>,
    pub ghost_risk: Option<GhostRisk>,
    pub keyword_match: Vec<KeywordMatch>,
    pub gaps: Vec<Gap>,
    pub salary_estimate: Option<String>,
    pub scoring_failed: bool,

    pub repost: bool,
    pub repost_of: Option<Uuid>,
    pub repost_confidence: Option<f64>,

    pub status: JobStatus,
    pub applied_date: Option<NaiveDate>,
    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// First follow-up is due one week after applying.
    pub fn follow_up_1_due(&self) -> Option<NaiveDate> {
        self.applied_date.and_then(|d| d.checked_add_days(Days::new(7)))
    }

    /// Second follow-up is due two weeks after applying.
    pub fn follow_up_2_due(&self) -> Option<NaiveDate> {
        self.applied_date.and_then(|d| d.checked_add_days(Days::new(14)))
    }

    /// Days the posting has been listed, as of `today`. Uses the
    /// source-supplied posting date when present, otherwise the ingestion
    /// timestamp. Recomputed on every read, never stored.
    pub fn days_listed(&self, today: NaiveDate) -> i64 {
        let listed = self.posted_date.unwrap_or_else(|| self.scraped_at.date_naive());
        (today - listed).num_days().max(0)
    }

    /// Ghost risk as presented: the Oracle's vagueness assessment, bumped a
    /// level for a repost and again for a stale listing. Advisory only.
    pub fn effective_ghost_risk(&self, today: NaiveDate) -> GhostRisk {
        let mut risk = self.ghost_risk.unwrap_or(GhostRisk::Low);
        if self.repost {
            risk = risk.bumped();
        }
        if self.days_listed(today) > STALE_LISTING_DAYS {
            risk = risk.bumped();
        }
        risk
    }

    /// Merge a validated scoring output into the record.
    pub fn apply_scoring(&mut self, output: ScoringOutput, now: DateTime<Utc>) {
        self.score = Some(output.score.min(100));
        self.pros = output.pros;
        self.cons = output.cons;
        self.fit_summary = Some(output.fit_summary);
        self.summary = Some(output.summary);
        self.ghost_risk = Some(output.ghost_risk);
        self.keyword_match = output.keyword_match;
        self.gaps = output.gaps;
        // The Oracle only estimates when the posting itself lists nothing.
        if self.salary_text.is_none() {
            self.salary_estimate = output.salary_estimate;
        }
        self.scoring_failed = false;
        self.updated_at = now;
    }

    /// User/API-driven status change. Entering `applied` stamps
    /// `applied_date` once; re-entering later never moves it.
    pub fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<(), StatusError> {
        if !self.status.can_transition(to) {
            return Err(StatusError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to == JobStatus::Applied && self.applied_date.is_none() {
            self.applied_date = Some(now.date_naive());
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Legal-entity suffixes collapsed out of company names before dedup
/// comparison.
const LEGAL_SUFFIXES: &[&str] = &[
    "llc", "inc", "co", "corp", "corporation", "ltd", "llp", "plc", "company", "incorporated",
];

/// Lowercase, strip punctuation and whitespace variance.
fn normalize_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn normalized_company(company: &str) -> String {
    let mut words: Vec<&str> = Vec::new();
    let normalized = normalize_fragment(company);
    for word in normalized.split(' ') {
        words.push(word);
    }
    while let Some(last) = words.last() {
        if LEGAL_SUFFIXES.contains(last) && words.len() > 1 {
            words.pop();
        } else {
            break;
        }
    }
    words.join(" ")
}

pub fn normalized_title(title: &str) -> String {
    normalize_fragment(title)
}

/// Cross-source identity key: normalized `(company, title)`, independent of
/// the source that produced the record.
pub fn dedup_key(company: &str, title: &str) -> String {
    format!("{}::{}", normalized_company(company), normalized_title(title))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkHistoryEntry {
    pub title: String,
    pub company: String,
    pub duration: String,
}

/// Candidate profile consumed by the Validation Gate and the scoring prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub name: String,
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub experience_years: u32,
    #[serde(default)]
    pub work_history: Vec<WorkHistoryEntry>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub target_roles: Vec<String>,
    #[serde(default)]
    pub target_industries: Vec<String>,
    #[serde(default)]
    pub dealbreakers: Vec<String>,
}

impl CandidateProfile {
    /// Validation Gate predicate: names every missing required field so the
    /// failure can be surfaced once, with an actionable message.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.work_history.is_empty() {
            missing.push("work_history");
        }
        if self.skills.is_empty() {
            missing.push("skills");
        }
        if self.location.trim().is_empty() {
            missing.push("location");
        }
        if self.target_roles.is_empty() {
            missing.push("target_roles");
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> JobRecord {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();
        JobRecord {
            id: Uuid::new_v4(),
            source: "indeed".into(),
            source_id: "abc123".into(),
            company: "Acme".into(),
            title: "Operations Manager".into(),
            location: "Oklahoma City, OK".into(),
            description: "Run the plant.".into(),
            url: None,
            salary_text: None,
            posted_date: None,
            scraped_at: now,
            score: None,
            pros: vec![],
            cons: vec![],
            fit_summary: None,
            summary: None,
            ghost_risk: None,
            keyword_match: vec![],
            gaps: vec![],
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

    #[test]
    fn follow_ups_derive_from_applied_date() {
        let mut job = record();
        job.applied_date = Some(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        assert_eq!(
            job.follow_up_1_due(),
            Some(NaiveDate::from_ymd_opt(2026, 1, 8).unwrap())
        );
        assert_eq!(
            job.follow_up_2_due(),
            Some(NaiveDate::from_ymd_opt(2026, 1, 15).unwrap())
        );
        // Pure derivation: same answer on every read.
        assert_eq!(job.follow_up_1_due(), job.follow_up_1_due());
    }

    #[test]
    fn follow_ups_absent_until_applied() {
        let job = record();
        assert_eq!(job.follow_up_1_due(), None);
        assert_eq!(job.follow_up_2_due(), None);
    }

    #[test]
    fn days_listed_falls_back_to_scraped_at() {
        let job = record();
        let today = NaiveDate::from_ymd_opt(2026, 3, 12).unwrap();
        assert_eq!(job.days_listed(today), 10);
    }

    #[test]
    fn days_listed_prefers_posted_date() {
        let mut job = record();
        job.posted_date = Some(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        let today = NaiveDate::from_ymd_opt(2026, 3, 12).unwrap();
        assert_eq!(job.days_listed(today), 30);
    }

    #[test]
    fn applied_transition_stamps_date_once() {
        let mut job = record();
        let first = Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).single().unwrap();
        job.transition(JobStatus::Applied, first).unwrap();
        assert_eq!(job.applied_date, Some(first.date_naive()));

        job.transition(JobStatus::Interview, first).unwrap();
        assert_eq!(job.status, JobStatus::Interview);
        assert_eq!(job.applied_date, Some(first.date_naive()));
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut job = record();
        let now = job.updated_at;
        job.transition(JobStatus::Rejected, now).unwrap();
        let err = job.transition(JobStatus::Applied, now).unwrap_err();
        assert_eq!(
            err,
            StatusError::IllegalTransition {
                from: JobStatus::Rejected,
                to: JobStatus::Applied,
            }
        );
    }

    #[test]
    fn backward_moves_are_illegal() {
        assert!(!JobStatus::Applied.can_transition(JobStatus::Interested));
        assert!(JobStatus::New.can_transition(JobStatus::Applied));
        assert!(JobStatus::Interview.can_transition(JobStatus::Withdrawn));
    }

    #[test]
    fn repost_and_age_bump_ghost_risk() {
        let mut job = record();
        job.ghost_risk = Some(GhostRisk::Low);
        let today = NaiveDate::from_ymd_opt(2026, 3, 12).unwrap();
        assert_eq!(job.effective_ghost_risk(today), GhostRisk::Low);

        job.repost = true;
        assert_eq!(job.effective_ghost_risk(today), GhostRisk::Medium);

        job.posted_date = Some(NaiveDate::from_ymd_opt(2025, 12, 1).unwrap());
        assert_eq!(job.effective_ghost_risk(today), GhostRisk::High);
    }

    #[test]
    fn salary_estimate_ignored_when_posting_lists_salary() {
        let mut job = record();
        job.salary_text = Some("$70,000 - $85,000".into());
        let output = ScoringOutput {
            score: 70,
            pros: vec!["close".into()],
            cons: vec![],
            fit_summary: "fine".into(),
            summary: "fine".into(),
            ghost_risk: GhostRisk::Low,
            keyword_match: vec![],
            gaps: vec![],
            salary_estimate: Some("$60,000 - $75,000".into()),
        };
        job.apply_scoring(output, job.updated_at);
        assert_eq!(job.salary_estimate, None);
        assert_eq!(job.score, Some(70));
    }

    #[test]
    fn dedup_key_ignores_case_punctuation_and_legal_suffixes() {
        assert_eq!(
            dedup_key("Acme Widgets, LLC", "Senior   Engineer"),
            dedup_key("ACME WIDGETS", "senior engineer"),
        );
        assert_eq!(
            dedup_key("Titan Professional Services Inc.", "Plant Manager"),
            "titan professional services::plant manager",
        );
        // A bare suffix word is a degenerate name, not an empty key.
        assert_eq!(normalized_company("Co"), "co");
    }

    #[test]
    fn profile_gate_names_missing_fields() {
        let mut profile = CandidateProfile {
            name: "Sam".into(),
            location: "OKC".into(),
            target_roles: vec!["Operations Manager".into()],
            ..CandidateProfile::default()
        };
        assert_eq!(profile.missing_fields(), vec!["work_history", "skills"]);

        profile.work_history.push(WorkHistoryEntry {
            title: "Plant Manager".into(),
            company: "Acme".into(),
            duration: "2019-2024".into(),
        });
        profile.skills.push("Scheduling".into());
        assert!(profile.missing_fields().is_empty());
    }
}
