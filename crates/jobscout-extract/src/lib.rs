//! Extraction strategies for turning raw page content into job payloads.
//!
//! Dispatch is by source identifier, resolved through a registry of
//! site-specific strategies. When the site strategy misses (or none is
//! registered) the driver falls through a fixed tier order: embedded
//! structured data, page-metadata heuristics, then raw-text capture whose
//! field extraction is deferred to the Scoring Oracle. Extraction never
//! raises to the caller; a strategy that fails internally is treated the
//! same as one that finds nothing.

use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "jobscout-extract";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier {
    SiteSpecific,
    StructuredData,
    Heuristic,
    RawText,
}

impl ExtractionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionTier::SiteSpecific => "site_specific",
            ExtractionTier::StructuredData => "structured_data",
            ExtractionTier::Heuristic => "heuristic",
            ExtractionTier::RawText => "raw_text",
        }
    }
}

/// One posting recovered from a page. Site and structured tiers fill the
/// named fields; the raw-text tier carries the visible page text plus a
/// title hint for the Oracle to parse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedJob {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub salary_text: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub posted_date: Option<NaiveDate>,
    pub raw_text: Option<String>,
}

/// Result of running the tier ladder over one page.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutcome {
    pub tier: ExtractionTier,
    pub jobs: Vec<ExtractedJob>,
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = collapse_whitespace(&value);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First non-empty match across an ordered candidate list, scoped to the
/// given element. Stale selectors simply yield nothing and the next
/// candidate is tried; a selector that fails to parse is logged and
/// skipped.
fn first_text(scope: ElementRef<'_>, candidates: &[&str]) -> Option<String> {
    for &candidate in candidates {
        let Ok(selector) = Selector::parse(candidate) else {
            warn!(selector = candidate, "unparseable selector candidate");
            continue;
        };
        if let Some(found) = scope
            .select(&selector)
            .next()
            .and_then(|el| text_or_none(el.text().collect::<String>()))
        {
            debug!(selector = candidate, "selector matched");
            return Some(found);
        }
    }
    None
}

fn first_attr(scope: ElementRef<'_>, candidates: &[&str], attr: &str) -> Option<String> {
    for &candidate in candidates {
        let Ok(selector) = Selector::parse(candidate) else {
            warn!(selector = candidate, "unparseable selector candidate");
            continue;
        };
        if let Some(found) = scope
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr(attr))
            .and_then(|v| text_or_none(v.to_string()))
        {
            return Some(found);
        }
    }
    None
}

/// Visible page text: every text node outside script/style subtrees.
fn visible_text(scope: ElementRef<'_>) -> String {
    fn walk(el: ElementRef<'_>, out: &mut String) {
        if matches!(el.value().name(), "script" | "style" | "noscript" | "template") {
            return;
        }
        for child in el.children() {
            if let Some(text) = child.value().as_text() {
                out.push_str(text);
                out.push(' ');
            } else if let Some(child_el) = ElementRef::wrap(child) {
                walk(child_el, out);
            }
        }
    }
    let mut out = String::new();
    walk(scope, &mut out);
    collapse_whitespace(&out)
}

fn body_of(document: &Html) -> Option<ElementRef<'_>> {
    let body = Selector::parse("body").expect("static selector");
    document.select(&body).next()
}

// ---------------------------------------------------------------------------
// Tier 1: site-specific board strategies
// ---------------------------------------------------------------------------

/// Ordered selector candidates per field for one board. `cards` locates
/// listing entries; the field lists are scoped to a card when one matched,
/// or to the whole document on a detail page.
#[derive(Debug, Clone, Copy)]
pub struct FieldSelectors {
    pub cards: &'static [&'static str],
    pub title: &'static [&'static str],
    pub company: &'static [&'static str],
    pub location: &'static [&'static str],
    pub salary: &'static [&'static str],
    pub description: &'static [&'static str],
    pub link: &'static [&'static str],
}

pub trait SiteStrategy: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn hosts(&self) -> &'static [&'static str];
    /// Postings in source-listing order; empty means the strategy missed.
    fn extract(&self, document: &Html) -> Vec<ExtractedJob>;
}

struct BoardStrategy {
    source_id: &'static str,
    hosts: &'static [&'static str],
    selectors: FieldSelectors,
}

impl BoardStrategy {
    fn extract_from(&self, scope: ElementRef<'_>) -> Option<ExtractedJob> {
        let title = first_text(scope, self.selectors.title)?;
        Some(ExtractedJob {
            title: Some(title),
            company: first_text(scope, self.selectors.company),
            location: first_text(scope, self.selectors.location),
            salary_text: first_text(scope, self.selectors.salary),
            description: first_text(scope, self.selectors.description),
            url: first_attr(scope, self.selectors.link, "href"),
            posted_date: None,
            raw_text: None,
        })
    }
}

impl SiteStrategy for BoardStrategy {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    fn hosts(&self) -> &'static [&'static str] {
        self.hosts
    }

    fn extract(&self, document: &Html) -> Vec<ExtractedJob> {
        for &candidate in self.selectors.cards {
            let Ok(selector) = Selector::parse(candidate) else {
                warn!(selector = candidate, source = self.source_id, "unparseable card selector");
                continue;
            };
            let jobs: Vec<ExtractedJob> = document
                .select(&selector)
                .filter_map(|card| self.extract_from(card))
                .collect();
            if !jobs.is_empty() {
                debug!(selector = candidate, source = self.source_id, count = jobs.len(), "card selector matched");
                return jobs;
            }
        }

        // Not a listing page; try the whole document as a single detail page.
        body_of(document)
            .and_then(|body| self.extract_from(body))
            .into_iter()
            .collect()
    }
}

const INDEED: FieldSelectors = FieldSelectors {
    cards: &["div.job_seen_beacon", "div.cardOutline"],
    title: &["h2.jobTitle a", "h2.jobTitle span", "h2 a", "a[data-jk]", "h1.jobsearch-JobInfoHeader-title"],
    company: &["[data-testid=\"company-name\"]", ".companyName", ".company_location .companyName"],
    location: &["[data-testid=\"text-location\"]", ".companyLocation", ".company_location .companyLocation"],
    salary: &["[data-testid=\"attribute_snippet_testid\"]", ".salary-snippet-container", ".metadata .attribute_snippet"],
    description: &[".job-snippet", "[data-testid=\"job-snippet\"]", "#jobDescriptionText"],
    link: &["h2.jobTitle a", "h2 a", "a[data-jk]"],
};

const SIMPLYHIRED: FieldSelectors = FieldSelectors {
    cards: &["div[data-testid=\"searchSerpJob\"]", "div.SerpJob-jobCard", "li.SerpJob"],
    title: &["h2[data-testid=\"searchSerpJobTitle\"] a", "a.SerpJob-link", "h2.jobposting-title"],
    company: &["span[data-testid=\"companyName\"]", ".jobposting-company"],
    location: &["span[data-testid=\"searchSerpJobLocation\"]", ".jobposting-location"],
    salary: &["p[data-testid=\"searchSerpJobSalaryEst\"]", ".jobposting-salary"],
    description: &["p[data-testid=\"searchSerpJobSnippet\"]", ".jobposting-snippet"],
    link: &["h2[data-testid=\"searchSerpJobTitle\"] a", "a.SerpJob-link"],
};

const LINKEDIN: FieldSelectors = FieldSelectors {
    cards: &["div.base-card", "li.jobs-search-results__list-item"],
    title: &["h3.base-search-card__title", "a.job-card-list__title", "h1.top-card-layout__title"],
    company: &["h4.base-search-card__subtitle a", "a.hidden-nested-link", ".job-card-container__company-name"],
    location: &["span.job-search-card__location", ".job-card-container__metadata-item"],
    salary: &["span.job-search-card__salary-info"],
    description: &[".show-more-less-html__markup", ".description__text"],
    link: &["a.base-card__full-link", "a.job-card-list__title"],
};

const ZIPRECRUITER: FieldSelectors = FieldSelectors {
    cards: &["article.job_result", "div.job_content"],
    title: &["h2.title a", "a.job_link", "h1.job_title"],
    company: &["a.company_name", ".hiring_company_text"],
    location: &["a.company_location", ".hiring_location"],
    salary: &[".perk_item--pay .perk_value", "span.salary"],
    description: &["p.job_snippet", "div.jobDescriptionSection"],
    link: &["h2.title a", "a.job_link"],
};

const GLASSDOOR: FieldSelectors = FieldSelectors {
    cards: &["li.react-job-listing", "div[data-test=\"jobListing\"]"],
    title: &["a[data-test=\"job-title\"]", ".jobTitle"],
    company: &["div[data-test=\"employer-name\"]", ".employer-name"],
    location: &["div[data-test=\"emp-location\"]", ".location"],
    salary: &["div[data-test=\"detailSalary\"]", ".salaryEstimate"],
    description: &["div[data-test=\"descSnippet\"]", "div.jobDescriptionContent"],
    link: &["a[data-test=\"job-title\"]"],
};

const MONSTER: FieldSelectors = FieldSelectors {
    cards: &["div[data-testid=\"JobCard\"]", "article.job-cardstyle__JobCardComponent"],
    title: &["a[data-testid=\"jobTitle\"]", "h2.title a"],
    company: &["span[data-testid=\"company\"]", ".company .name"],
    location: &["span[data-testid=\"jobDetailLocation\"]", ".location .name"],
    salary: &["span[data-testid=\"salary\"]"],
    description: &["div[data-testid=\"svx-job-description\"]", "div.job-description"],
    link: &["a[data-testid=\"jobTitle\"]"],
};

const CAREERBUILDER: FieldSelectors = FieldSelectors {
    cards: &["li.data-results-content-parent", "div.data-results-content"],
    title: &[".data-results-title", "h2.job-title"],
    company: &["span.data-details-company", ".data-details span"],
    location: &["span.data-details-location", ".job-location"],
    salary: &["span.data-details-pay"],
    description: &[".data-results-publish-time + .block", "div.jdp-description-details"],
    link: &["a.data-results-content"],
};

const FLEXJOBS: FieldSelectors = FieldSelectors {
    cards: &["li.job", "div.job-listing"],
    title: &["a.job-title", "h5.job-title a"],
    company: &[".job-company", "div.company"],
    location: &[".job-locations", ".allowed-location"],
    salary: &[".job-salary"],
    description: &[".job-description", "p.job-description-text"],
    link: &["a.job-title"],
};

/// Registry of site strategies, closed-but-extensible: unregistered sources
/// fall straight through to the generic tiers.
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn SiteStrategy>>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// The eight scraped boards.
    pub fn with_default_boards() -> Self {
        let boards: Vec<(&'static str, &'static [&'static str], FieldSelectors)> = vec![
            ("indeed", &["indeed.com"], INDEED),
            ("simplyhired", &["simplyhired.com"], SIMPLYHIRED),
            ("linkedin", &["linkedin.com"], LINKEDIN),
            ("ziprecruiter", &["ziprecruiter.com"], ZIPRECRUITER),
            ("glassdoor", &["glassdoor.com"], GLASSDOOR),
            ("monster", &["monster.com"], MONSTER),
            ("careerbuilder", &["careerbuilder.com"], CAREERBUILDER),
            ("flexjobs", &["flexjobs.com"], FLEXJOBS),
        ];
        let mut registry = Self::empty();
        for (source_id, hosts, selectors) in boards {
            registry.register(Box::new(BoardStrategy {
                source_id,
                hosts,
                selectors,
            }));
        }
        registry
    }

    pub fn register(&mut self, strategy: Box<dyn SiteStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn for_source(&self, source_id: &str) -> Option<&dyn SiteStrategy> {
        self.strategies
            .iter()
            .find(|s| s.source_id() == source_id)
            .map(|s| s.as_ref())
    }

    pub fn source_ids(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.source_id()).collect()
    }

    /// Map a page URL to a registered source by hostname.
    pub fn detect_source(&self, url: &str) -> Option<&'static str> {
        let host = host_of(url)?;
        self.strategies
            .iter()
            .find(|s| {
                s.hosts()
                    .iter()
                    .any(|h| host == *h || host.ends_with(&format!(".{h}")))
            })
            .map(|s| s.source_id())
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next()?.to_ascii_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

// ---------------------------------------------------------------------------
// Tier 2: embedded structured data (JSON-LD JobPosting)
// ---------------------------------------------------------------------------

fn json_ld_candidates(value: JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(ref map) if map.contains_key("@graph") => map
            .get("@graph")
            .and_then(|g| g.as_array())
            .map(|a| a.to_vec())
            .unwrap_or_default(),
        other => vec![other],
    }
}

fn is_job_posting(value: &JsonValue) -> bool {
    match value.get("@type") {
        Some(JsonValue::String(s)) => s == "JobPosting",
        Some(JsonValue::Array(items)) => items.iter().any(|v| v.as_str() == Some("JobPosting")),
        _ => false,
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn ld_organization(value: &JsonValue) -> Option<String> {
    match value.get("hiringOrganization") {
        Some(JsonValue::String(s)) => text_or_none(s.clone()),
        Some(org) => json_str(org, &["name"]).and_then(|s| text_or_none(s.to_string())),
        None => None,
    }
}

fn ld_location(value: &JsonValue) -> Option<String> {
    let place = match value.get("jobLocation") {
        Some(JsonValue::Array(items)) => items.first()?,
        Some(place) => place,
        None => return None,
    };
    if let Some(s) = place.as_str() {
        return text_or_none(s.to_string());
    }
    let address = place.get("address")?;
    if let Some(s) = address.as_str() {
        return text_or_none(s.to_string());
    }
    let parts: Vec<&str> = ["addressLocality", "addressRegion", "addressCountry"]
        .iter()
        .filter_map(|key| json_str(address, &[key]))
        .collect();
    text_or_none(parts.join(", "))
}

fn ld_salary(value: &JsonValue) -> Option<String> {
    let base = value.get("baseSalary")?;
    if let Some(s) = base.as_str() {
        return text_or_none(s.to_string());
    }
    let currency = json_str(base, &["currency"]).unwrap_or("");
    let inner = base.get("value")?;
    let min = inner.get("minValue").and_then(|v| v.as_f64());
    let max = inner.get("maxValue").and_then(|v| v.as_f64());
    let unit = json_str(inner, &["unitText"]).unwrap_or("");
    let range = match (min, max) {
        (Some(min), Some(max)) => format!("{min} - {max}"),
        (Some(min), None) => format!("{min}"),
        (None, Some(max)) => format!("{max}"),
        (None, None) => inner.as_f64().map(|v| v.to_string())?,
    };
    text_or_none(format!("{currency} {range} {unit}"))
}

fn ld_description(value: &JsonValue) -> Option<String> {
    let raw = json_str(value, &["description"])?;
    // Descriptions in structured data are routinely HTML.
    let fragment = Html::parse_fragment(raw);
    let text = fragment
        .root_element()
        .text()
        .collect::<String>();
    text_or_none(text)
}

fn ld_posted_date(value: &JsonValue) -> Option<NaiveDate> {
    let raw = json_str(value, &["datePosted"])?;
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}

/// Machine-authored job-posting metadata embedded in the page; the
/// highest-confidence fallback when a site strategy misses.
pub fn structured_data_strategy(document: &Html) -> Option<ExtractedJob> {
    let selector = Selector::parse("script[type=\"application/ld+json\"]").expect("static selector");
    for script in document.select(&selector) {
        let raw = script.text().collect::<String>();
        let parsed: JsonValue = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(err) => {
                debug!(%err, "unparseable ld+json block");
                continue;
            }
        };
        for candidate in json_ld_candidates(parsed) {
            if !is_job_posting(&candidate) {
                continue;
            }
            let title = json_str(&candidate, &["title"])
                .and_then(|s| text_or_none(s.to_string()))?;
            return Some(ExtractedJob {
                title: Some(title),
                company: ld_organization(&candidate),
                location: ld_location(&candidate),
                salary_text: ld_salary(&candidate),
                description: ld_description(&candidate),
                url: json_str(&candidate, &["url"]).map(ToString::to_string),
                posted_date: ld_posted_date(&candidate),
                raw_text: None,
            });
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tier 3: page-metadata heuristics
// ---------------------------------------------------------------------------

fn page_title(document: &Html) -> Option<String> {
    if let Some(og) = first_attr(
        document.root_element(),
        &["meta[property=\"og:title\"]"],
        "content",
    ) {
        return Some(og);
    }
    first_text(document.root_element(), &["title"])
}

/// Split a page title like "Senior Engineer - Acme | Careers" into a job
/// title and a company guess.
fn split_title_company(page_title: &str) -> (String, Option<String>) {
    // Trailing "| Careers"-style site suffix first.
    let trimmed = page_title
        .rsplit_once('|')
        .map(|(head, _)| head.trim())
        .unwrap_or(page_title)
        .to_string();

    for separator in [" - ", " – ", " at "] {
        if let Some((title, company)) = trimmed.split_once(separator) {
            let title = collapse_whitespace(title);
            let company = collapse_whitespace(company);
            if !title.is_empty() && !company.is_empty() {
                return (title, Some(company));
            }
        }
    }
    (collapse_whitespace(&trimmed), None)
}

/// Largest semantic content region: the candidate container with the most
/// visible text.
fn main_content(document: &Html) -> Option<String> {
    let mut best: Option<String> = None;
    for candidate in ["main", "article", "#content", ".content", "section"] {
        let Ok(selector) = Selector::parse(candidate) else {
            continue;
        };
        for el in document.select(&selector) {
            let text = visible_text(el);
            if best.as_ref().map_or(true, |b| text.len() > b.len()) {
                best = Some(text);
            }
        }
    }
    best.filter(|text| text.len() >= 140)
}

/// Guess title/company/description from page metadata plus the main content
/// region.
pub fn heuristic_strategy(document: &Html) -> Option<ExtractedJob> {
    let raw_title = page_title(document)?;
    let (title, company) = split_title_company(&raw_title);
    if title.is_empty() {
        return None;
    }

    let description = main_content(document).or_else(|| {
        first_attr(
            document.root_element(),
            &["meta[name=\"description\"]", "meta[property=\"og:description\"]"],
            "content",
        )
    })?;

    Some(ExtractedJob {
        title: Some(title),
        company,
        location: None,
        salary_text: None,
        description: Some(description),
        url: None,
        posted_date: None,
        raw_text: None,
    })
}

// ---------------------------------------------------------------------------
// Tier 4: raw-text capture
// ---------------------------------------------------------------------------

/// Full visible text plus a title hint, deferring field extraction to the
/// Scoring Oracle.
pub fn raw_text_strategy(document: &Html) -> Option<ExtractedJob> {
    let body = body_of(document)?;
    let text = visible_text(body);
    if text.is_empty() {
        return None;
    }
    let hint = first_text(document.root_element(), &["h1", "title"]);
    Some(ExtractedJob {
        title: hint,
        raw_text: Some(text),
        ..ExtractedJob::default()
    })
}

// ---------------------------------------------------------------------------
// Tier driver
// ---------------------------------------------------------------------------

/// Run the fallback ladder over one page. `source` is the detected source
/// identifier, if any. Returns `None` only when every tier came up empty —
/// a terminal "could not extract", not an error.
pub fn extract_with_fallback(
    registry: &StrategyRegistry,
    source: Option<&str>,
    html_text: &str,
) -> Option<ExtractionOutcome> {
    let document = Html::parse_document(html_text);

    if let Some(strategy) = source.and_then(|s| registry.for_source(s)) {
        let jobs = strategy.extract(&document);
        if !jobs.is_empty() {
            info!(source = strategy.source_id(), tier = ExtractionTier::SiteSpecific.as_str(), count = jobs.len(), "extraction tier matched");
            return Some(ExtractionOutcome {
                tier: ExtractionTier::SiteSpecific,
                jobs,
            });
        }
        debug!(source = strategy.source_id(), "site strategy missed, falling through");
    }

    if let Some(job) = structured_data_strategy(&document) {
        info!(tier = ExtractionTier::StructuredData.as_str(), "extraction tier matched");
        return Some(ExtractionOutcome {
            tier: ExtractionTier::StructuredData,
            jobs: vec![job],
        });
    }

    if let Some(job) = heuristic_strategy(&document) {
        info!(tier = ExtractionTier::Heuristic.as_str(), "extraction tier matched");
        return Some(ExtractionOutcome {
            tier: ExtractionTier::Heuristic,
            jobs: vec![job],
        });
    }

    if let Some(job) = raw_text_strategy(&document) {
        info!(tier = ExtractionTier::RawText.as_str(), "extraction tier matched");
        return Some(ExtractionOutcome {
            tier: ExtractionTier::RawText,
            jobs: vec![job],
        });
    }

    None
}
