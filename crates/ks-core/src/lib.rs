//! Core domain model and identity types for the KaamSathi listing engine.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ks-core";

/// Which catalog a listing belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingKind {
    Course,
    Job,
}

impl ListingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingKind::Course => "course",
            ListingKind::Job => "job",
        }
    }

    /// Accepts the singular and plural route/config spellings.
    pub fn parse_slug(slug: &str) -> Option<Self> {
        match slug {
            "course" | "courses" => Some(ListingKind::Course),
            "job" | "jobs" => Some(ListingKind::Job),
            _ => None,
        }
    }
}

/// Kind-specific flags, fixed at extraction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KindFields {
    Course {
        is_free: bool,
        is_video: bool,
    },
    Job {
        is_remote: bool,
        location: String,
        employment_type: Option<String>,
        salary: Option<String>,
    },
}

impl KindFields {
    pub fn kind(&self) -> ListingKind {
        match self {
            KindFields::Course { .. } => ListingKind::Course,
            KindFields::Job { .. } => ListingKind::Job,
        }
    }
}

/// Normalized handoff contract from the field extractor into persistence.
///
/// Identity, popularity, and timestamps are owned by the store and only
/// exist on [`Listing`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub stable_external_id: String,
    pub title: String,
    pub description: String,
    /// Display summary; empty until metadata backfill fills it.
    pub short_description: String,
    pub provider: String,
    pub url: String,
    pub tags: Vec<String>,
    pub image_url: Option<String>,
    pub kind_fields: KindFields,
    /// Relevance reported by the external search provider, immutable.
    pub provider_score: f64,
}

impl ListingDraft {
    pub fn kind(&self) -> ListingKind {
        self.kind_fields.kind()
    }
}

/// Canonical persisted listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub stable_external_id: String,
    pub title: String,
    pub description: String,
    pub short_description: String,
    pub provider: String,
    pub url: String,
    pub tags: Vec<String>,
    pub image_url: Option<String>,
    pub kind_fields: KindFields,
    pub provider_score: f64,
    pub popularity_score: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn kind(&self) -> ListingKind {
        self.kind_fields.kind()
    }

    /// True when at least one backfillable presentation field is absent.
    pub fn needs_backfill(&self) -> bool {
        self.short_description.is_empty() || self.image_url.is_none()
    }
}

/// Join record between a user and a listing. Created lazily on first
/// bookmark or access; toggled, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserListingLink {
    pub user_id: Uuid,
    pub listing_id: Uuid,
    pub is_bookmarked: bool,
    pub last_accessed: Option<DateTime<Utc>>,
    /// Completed-at for courses, applied-at for jobs.
    pub milestone_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Derive the dedup identity key from a listing's source URL.
///
/// URL-safe unpadded base64, so the same URL always yields the same id
/// and [`url_from_stable_id`] can invert it.
pub fn stable_id_for_url(url: &str) -> String {
    URL_SAFE_NO_PAD.encode(url.as_bytes())
}

/// Invert [`stable_id_for_url`]. `None` for ids not produced by it.
pub fn url_from_stable_id(id: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(id).ok()?;
    String::from_utf8(bytes).ok()
}

pub mod rank {
    //! Ordering rules for listing sets returned to callers.

    use std::cmp::Ordering;

    use super::Listing;

    /// Featured ordering: provider relevance descending, popularity
    /// descending as tiebreak.
    pub fn featured_cmp(a: &Listing, b: &Listing) -> Ordering {
        b.provider_score
            .partial_cmp(&a.provider_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.popularity_score.cmp(&a.popularity_score))
    }

    pub fn by_featured(listings: &mut [Listing]) {
        listings.sort_by(featured_cmp);
    }

    /// Local-only hits carry no differentiating provider score, so the
    /// search fast path orders purely by popularity.
    pub fn by_popularity(listings: &mut [Listing]) {
        listings.sort_by(|a, b| b.popularity_score.cmp(&a.popularity_score));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(provider_score: f64, popularity_score: i64) -> Listing {
        let now = Utc::now();
        Listing {
            id: Uuid::new_v4(),
            stable_external_id: stable_id_for_url("https://example.com/a"),
            title: "a".into(),
            description: "a".into(),
            short_description: String::new(),
            provider: "Other".into(),
            url: "https://example.com/a".into(),
            tags: vec![],
            image_url: None,
            kind_fields: KindFields::Course {
                is_free: false,
                is_video: false,
            },
            provider_score,
            popularity_score,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn stable_id_is_deterministic_and_reversible() {
        let url = "https://www.coursera.org/learn/python?audit=true";
        let id = stable_id_for_url(url);
        assert_eq!(id, stable_id_for_url(url));
        assert_eq!(url_from_stable_id(&id).as_deref(), Some(url));
        assert!(!id.contains('/'), "id must be path-safe: {id}");
    }

    #[test]
    fn url_from_garbage_stable_id_is_none() {
        assert_eq!(url_from_stable_id("!!not-base64!!"), None);
    }

    #[test]
    fn featured_ordering_prefers_provider_score_then_popularity() {
        let mut set = vec![listing(90.0, 1), listing(80.0, 100), listing(90.0, 5)];
        rank::by_featured(&mut set);
        let order: Vec<(f64, i64)> = set
            .iter()
            .map(|l| (l.provider_score, l.popularity_score))
            .collect();
        assert_eq!(order, vec![(90.0, 5), (90.0, 1), (80.0, 100)]);
    }

    #[test]
    fn needs_backfill_when_summary_or_image_missing() {
        let mut l = listing(0.0, 0);
        assert!(l.needs_backfill());
        l.short_description = "summary".into();
        assert!(l.needs_backfill());
        l.image_url = Some("https://example.com/img.png".into());
        assert!(!l.needs_backfill());
    }

    #[test]
    fn kind_slug_parsing_accepts_plural_routes() {
        assert_eq!(ListingKind::parse_slug("courses"), Some(ListingKind::Course));
        assert_eq!(ListingKind::parse_slug("job"), Some(ListingKind::Job));
        assert_eq!(ListingKind::parse_slug("gigs"), None);
    }
}
