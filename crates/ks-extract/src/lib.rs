//! Field extraction: raw provider hits into normalized listing drafts.
//!
//! Extraction is a pure function of its inputs — no network access, no
//! side effects. Kind-specific behavior (allowed provider domains, query
//! expansion, provider classification, flag heuristics) lives behind
//! [`KindProfile`] so the heuristics can be iterated on without touching
//! the orchestrator.

use ks_core::{stable_id_for_url, KindFields, ListingDraft, ListingKind};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "ks-extract";

/// One raw hit from the external search provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSearchHit {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

/// Kind-specific extraction and validation strategy.
pub trait KindProfile: Send + Sync {
    fn kind(&self) -> ListingKind;

    /// Domains the external provider search is scoped to.
    fn allowed_domains(&self) -> &'static [&'static str];

    /// Rewrite the user query into a provider query.
    fn expand_query(&self, query: &str) -> String;

    /// Origin classification: known host, or best-effort title parsing.
    fn classify_provider(&self, hit: &RawSearchHit) -> String;

    fn kind_fields(&self, hit: &RawSearchHit, provider: &str) -> KindFields;

    fn tags(&self, query: &str, hit: &RawSearchHit) -> Vec<String>;
}

pub fn profile_for(kind: ListingKind) -> &'static dyn KindProfile {
    match kind {
        ListingKind::Course => &CourseProfile,
        ListingKind::Job => &JobProfile,
    }
}

/// Normalize one provider hit into a draft. Re-running the same hit
/// always reproduces the same stable external id.
pub fn extract_draft(profile: &dyn KindProfile, query: &str, hit: &RawSearchHit) -> ListingDraft {
    let provider = profile.classify_provider(hit);
    ListingDraft {
        stable_external_id: stable_id_for_url(&hit.url),
        title: hit.title.clone(),
        description: hit.content.clone().unwrap_or_default(),
        short_description: String::new(),
        url: hit.url.clone(),
        tags: profile.tags(query, hit),
        image_url: hit.image.clone().filter(|s| !s.is_empty()),
        kind_fields: profile.kind_fields(hit, &provider),
        provider_score: hit.score.unwrap_or(0.0),
        provider,
    }
}

fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.host_str().map(|h| h.to_ascii_lowercase())
}

/// Exact host or subdomain-of; plain substring containment would let
/// `udemy.com.evil.example` classify as Udemy.
fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn combined_text(hit: &RawSearchHit) -> String {
    let mut text = hit.title.to_lowercase();
    if let Some(content) = &hit.content {
        text.push(' ');
        text.push_str(&content.to_lowercase());
    }
    text
}

// ---------------------------------------------------------------------------
// Courses
// ---------------------------------------------------------------------------

pub struct CourseProfile;

const COURSE_DOMAINS: &[&str] = &[
    "coursera.org",
    "udemy.com",
    "edx.org",
    "youtube.com",
    "youtu.be",
];

impl CourseProfile {
    fn is_free(url: &str, provider: &str) -> bool {
        match provider {
            "YouTube" => true,
            "Coursera" => url.contains("audit"),
            "edX" => url.contains("course"),
            _ => false,
        }
    }
}

impl KindProfile for CourseProfile {
    fn kind(&self) -> ListingKind {
        ListingKind::Course
    }

    fn allowed_domains(&self) -> &'static [&'static str] {
        COURSE_DOMAINS
    }

    fn expand_query(&self, query: &str) -> String {
        format!("{query} online courses OR tutorials")
    }

    fn classify_provider(&self, hit: &RawSearchHit) -> String {
        let Some(host) = host_of(&hit.url) else {
            return "Other".to_string();
        };
        if host_matches(&host, "coursera.org") {
            "Coursera".to_string()
        } else if host_matches(&host, "udemy.com") {
            "Udemy".to_string()
        } else if host_matches(&host, "edx.org") {
            "edX".to_string()
        } else if host_matches(&host, "youtube.com") || host_matches(&host, "youtu.be") {
            "YouTube".to_string()
        } else {
            "Other".to_string()
        }
    }

    fn kind_fields(&self, hit: &RawSearchHit, provider: &str) -> KindFields {
        KindFields::Course {
            is_free: Self::is_free(&hit.url, provider),
            is_video: provider == "YouTube",
        }
    }

    /// The originating query becomes the course's category tag.
    fn tags(&self, query: &str, _hit: &RawSearchHit) -> Vec<String> {
        vec![query.to_lowercase()]
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

pub struct JobProfile;

const JOB_DOMAINS: &[&str] = &[
    "linkedin.com",
    "indeed.com",
    "glassdoor.com",
    "monster.com",
    "careerbuilder.com",
    "angel.co",
    "remote.co",
];

const REMOTE_KEYWORDS: &[&str] = &["remote", "work from home", "wfh", "virtual"];

/// Fixed vocabulary for containment-based skill extraction.
const SKILL_VOCABULARY: &[&str] = &[
    "JavaScript",
    "TypeScript",
    "React",
    "Angular",
    "Vue",
    "Node.js",
    "Python",
    "Java",
    "C#",
    "C++",
    "Go",
    "Rust",
    "Ruby",
    "PHP",
    "SQL",
    "MongoDB",
    "PostgreSQL",
    "MySQL",
    "Docker",
    "Kubernetes",
    "AWS",
    "Azure",
    "GCP",
    "CI/CD",
    "Git",
    "REST API",
    "GraphQL",
    "Machine Learning",
    "Data Science",
    "TensorFlow",
    "PyTorch",
];

/// Ordered, first match wins: "Engineer at Acme" before "Engineer - Acme".
static COMPANY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\bat\s+(.+)$").expect("company pattern"),
        Regex::new(r"-\s*([^-]+)$").expect("company pattern"),
    ]
});

static LOCATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\bin\s+([A-Za-z][A-Za-z ,]+)").expect("location pattern"),
        Regex::new(r"@\s*([A-Za-z][A-Za-z ,]+)").expect("location pattern"),
        Regex::new(r",\s*([A-Za-z][A-Za-z ]+)$").expect("location pattern"),
    ]
});

static SALARY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\s?\d[\d,]*(?:k|K)?(?:\s*-\s*\$?\s?\d[\d,]*(?:k|K)?)?").expect("salary pattern")
});

/// Ordered needle/label pairs; hyphenated spellings first so
/// "full-time" does not fall through to a plain word match.
const EMPLOYMENT_TYPES: &[(&str, &str)] = &[
    ("full-time", "Full-time"),
    ("full time", "Full-time"),
    ("part-time", "Part-time"),
    ("part time", "Part-time"),
    ("internship", "Internship"),
    ("contract", "Contract"),
    ("freelance", "Freelance"),
];

impl JobProfile {
    fn company_from_title(title: &str) -> String {
        for pattern in COMPANY_PATTERNS.iter() {
            if let Some(captures) = pattern.captures(title) {
                if let Some(company) = captures.get(1) {
                    let company = company.as_str().trim();
                    if !company.is_empty() {
                        return company.to_string();
                    }
                }
            }
        }
        "Unknown Company".to_string()
    }

    fn location_from(title: &str, content: &str) -> String {
        for haystack in [title, content] {
            for pattern in LOCATION_PATTERNS.iter() {
                if let Some(captures) = pattern.captures(haystack) {
                    if let Some(location) = captures.get(1) {
                        let location = location.as_str().trim();
                        if !location.is_empty() {
                            return location.to_string();
                        }
                    }
                }
            }
        }
        "Location not specified".to_string()
    }

    fn is_remote(text: &str) -> bool {
        REMOTE_KEYWORDS.iter().any(|keyword| text.contains(keyword))
    }

    fn skills_from(content: &str) -> Vec<String> {
        let content_lower = content.to_lowercase();
        SKILL_VOCABULARY
            .iter()
            .filter(|skill| content_lower.contains(&skill.to_lowercase()))
            .map(|skill| skill.to_string())
            .collect()
    }

    fn employment_type(text: &str) -> Option<String> {
        EMPLOYMENT_TYPES
            .iter()
            .find(|(needle, _)| text.contains(needle))
            .map(|(_, label)| label.to_string())
    }

    fn salary_from(text: &str) -> Option<String> {
        SALARY_PATTERN.find(text).map(|m| m.as_str().to_string())
    }
}

impl KindProfile for JobProfile {
    fn kind(&self) -> ListingKind {
        ListingKind::Job
    }

    fn allowed_domains(&self) -> &'static [&'static str] {
        JOB_DOMAINS
    }

    fn expand_query(&self, query: &str) -> String {
        format!("{query} jobs OR careers OR hiring")
    }

    /// Job boards host many employers, so the origin label is the
    /// company parsed out of the hit title rather than the board host.
    fn classify_provider(&self, hit: &RawSearchHit) -> String {
        Self::company_from_title(&hit.title)
    }

    fn kind_fields(&self, hit: &RawSearchHit, _provider: &str) -> KindFields {
        let text = combined_text(hit);
        let content = hit.content.as_deref().unwrap_or_default();
        KindFields::Job {
            is_remote: Self::is_remote(&text),
            location: Self::location_from(&hit.title, content),
            employment_type: Self::employment_type(&text),
            salary: Self::salary_from(content),
        }
    }

    fn tags(&self, _query: &str, hit: &RawSearchHit) -> Vec<String> {
        Self::skills_from(hit.content.as_deref().unwrap_or_default())
    }
}
