//! Tiered search orchestration: local store first, external provider
//! for the shortfall, dedup through the persistence gateway, then
//! bounded metadata backfill over the merged set.
//!
//! The pipeline degrades instead of failing: a provider outage or a
//! malformed provider response becomes "zero additional results", a
//! failed text index query retries simplified, and only an unreachable
//! store surfaces as an error to the caller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ks_core::{Listing, ListingKind, UserListingLink};
use ks_enrich::{BackfillEngine, HttpPageFetcher, MetaTagScraper};
use ks_extract::{extract_draft, profile_for, KindProfile, RawSearchHit};
use ks_store::{
    ListingGateway, OrderBy, PgListingStore, StoreError, FALLBACK_TEXT_FIELDS,
    PRIMARY_TEXT_FIELDS,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ks-search";

pub const DEFAULT_MAX_RESULTS: usize = 15;

// ---------------------------------------------------------------------------
// Search provider client
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned status {status}")]
    HttpStatus { status: u16 },
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// One outbound provider search, scoped to a kind's allowed domains.
/// Raw page content stays off to bound payload size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderQuery {
    pub query: String,
    pub max_results: usize,
    pub include_domains: Vec<String>,
    pub include_raw_content: bool,
}

/// External search provider capability.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &ProviderQuery) -> Result<Vec<RawSearchHit>, ProviderError>;
}

/// Tavily-backed search provider.
pub struct TavilyClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

pub const TAVILY_BASE_URL: &str = "https://api.tavily.com";

impl TavilyClient {
    pub fn new(api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: TAVILY_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    max_results: usize,
    include_domains: &'a [String],
    include_raw_content: bool,
}

#[derive(Deserialize, Default)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyHit>,
}

/// Tolerant hit shape: one record missing its url is dropped without
/// discarding the rest of the batch.
#[derive(Deserialize)]
struct TavilyHit {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    score: Option<f64>,
}

#[async_trait]
impl SearchProvider for TavilyClient {
    async fn search(&self, query: &ProviderQuery) -> Result<Vec<RawSearchHit>, ProviderError> {
        let request = TavilyRequest {
            query: &query.query,
            max_results: query.max_results,
            include_domains: &query.include_domains,
            include_raw_content: query.include_raw_content,
        };
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
            });
        }
        let body: TavilyResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Malformed(err.to_string()))?;
        Ok(body
            .results
            .into_iter()
            .filter_map(|hit| {
                let url = hit.url.filter(|u| !u.is_empty())?;
                Some(RawSearchHit {
                    url,
                    title: hit.title,
                    content: hit.content,
                    image: hit.image,
                    score: hit.score,
                })
            })
            .collect())
    }
}

/// Scripted provider for tests and offline runs. Records call count and
/// the last query so the local fast path is observable.
#[derive(Default)]
pub struct StaticSearchProvider {
    hits: Vec<RawSearchHit>,
    fail: bool,
    calls: AtomicUsize,
    last_query: Mutex<Option<ProviderQuery>>,
}

impl StaticSearchProvider {
    pub fn new(hits: Vec<RawSearchHit>) -> Self {
        Self {
            hits,
            ..Self::default()
        }
    }

    /// Provider whose every call errors, for degraded-mode tests.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn last_query(&self) -> Option<ProviderQuery> {
        self.last_query.lock().await.clone()
    }
}

#[async_trait]
impl SearchProvider for StaticSearchProvider {
    async fn search(&self, query: &ProviderQuery) -> Result<Vec<RawSearchHit>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_query.lock().await = Some(query.clone());
        if self.fail {
            return Err(ProviderError::HttpStatus { status: 503 });
        }
        let mut hits = self.hits.clone();
        hits.truncate(query.max_results);
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub tavily_api_key: String,
    pub tavily_base_url: String,
    pub default_max_results: usize,
    pub backfill_batch_size: usize,
    pub backfill_item_timeout_secs: u64,
    pub web_port: u16,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://ks:ks@localhost:5432/ks".to_string()),
            tavily_api_key: std::env::var("TAVILY_API_KEY").unwrap_or_default(),
            tavily_base_url: std::env::var("TAVILY_BASE_URL")
                .unwrap_or_else(|_| TAVILY_BASE_URL.to_string()),
            default_max_results: std::env::var("KS_MAX_RESULTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_RESULTS),
            backfill_batch_size: std::env::var("KS_BACKFILL_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(ks_enrich::DEFAULT_BATCH_SIZE),
            backfill_item_timeout_secs: std::env::var("KS_BACKFILL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            web_port: std::env::var("KS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

// ---------------------------------------------------------------------------
// Search service
// ---------------------------------------------------------------------------

/// The produced interface: tiered search plus the listing read/feedback
/// operations consumed by the HTTP layer.
pub struct SearchService {
    gateway: ListingGateway,
    provider: Arc<dyn SearchProvider>,
    backfill: BackfillEngine,
    default_max_results: usize,
}

impl SearchService {
    pub fn new(
        gateway: ListingGateway,
        provider: Arc<dyn SearchProvider>,
        backfill: BackfillEngine,
    ) -> Self {
        Self {
            gateway,
            provider,
            backfill,
            default_max_results: DEFAULT_MAX_RESULTS,
        }
    }

    pub fn with_default_max_results(mut self, default_max_results: usize) -> Self {
        self.default_max_results = default_max_results.max(1);
        self
    }

    /// Build the deployment wiring: Postgres store, Tavily provider,
    /// live page fetcher and scraper.
    pub async fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let store = PgListingStore::connect(&config.database_url).await?;
        store.ensure_schema().await?;
        let gateway = ListingGateway::new(Arc::new(store));

        let provider =
            TavilyClient::new(config.tavily_api_key.clone())?.with_base_url(config.tavily_base_url.clone());

        let item_timeout = Duration::from_secs(config.backfill_item_timeout_secs);
        let fetcher = HttpPageFetcher::new(item_timeout)?;
        let backfill = BackfillEngine::new(Arc::new(fetcher), Arc::new(MetaTagScraper))
            .with_batch_size(config.backfill_batch_size)
            .with_item_timeout(item_timeout);

        Ok(Self::new(gateway, Arc::new(provider), backfill)
            .with_default_max_results(config.default_max_results))
    }

    /// Tiered search. Local matches first; once a topic is
    /// well-populated this answers without touching the provider, which
    /// is what keeps latency and provider quota flat.
    pub async fn search(
        &self,
        kind: ListingKind,
        query: &str,
        max_results: Option<usize>,
    ) -> Result<Vec<Listing>, StoreError> {
        let max_results = max_results.unwrap_or(self.default_max_results).max(1);
        let profile = profile_for(kind);

        let mut local = self.local_matches(kind, query, max_results).await?;
        if local.len() >= max_results {
            local.truncate(max_results);
            return Ok(local);
        }

        let shortfall = max_results - local.len();
        let hits = self.provider_hits(profile, query, shortfall).await;

        let local_stable_ids: HashSet<&str> = local
            .iter()
            .map(|listing| listing.stable_external_id.as_str())
            .collect();
        let drafts = hits
            .iter()
            .map(|hit| extract_draft(profile, query, hit))
            .filter(|draft| !local_stable_ids.contains(draft.stable_external_id.as_str()))
            .collect();
        let persisted = self.gateway.persist_new(drafts).await?;

        let mut combined = local;
        let mut seen: HashSet<Uuid> = combined.iter().map(|listing| listing.id).collect();
        for listing in persisted {
            if seen.insert(listing.id) {
                combined.push(listing);
            }
        }
        combined.truncate(max_results);

        let summary = self.backfill.run(&self.gateway, &mut combined).await;
        info!(
            kind = kind.as_str(),
            query,
            results = combined.len(),
            backfill_candidates = summary.candidates,
            backfill_enriched = summary.enriched,
            "search complete"
        );
        Ok(combined)
    }

    /// Popularity-ordered local matches; a failed primary query retries
    /// over fewer fields before giving up.
    async fn local_matches(
        &self,
        kind: ListingKind,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Listing>, StoreError> {
        let store = self.gateway.store();
        match store
            .find_by_text(kind, PRIMARY_TEXT_FIELDS, query, limit, OrderBy::Popularity)
            .await
        {
            Ok(rows) => Ok(rows),
            Err(StoreError::Query(reason)) => {
                warn!(%reason, "primary text query failed, retrying simplified");
                store
                    .find_by_text(kind, FALLBACK_TEXT_FIELDS, query, limit, OrderBy::Popularity)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Provider results for the shortfall; any provider failure is
    /// logged and treated as zero additional results.
    async fn provider_hits(
        &self,
        profile: &dyn KindProfile,
        query: &str,
        count: usize,
    ) -> Vec<RawSearchHit> {
        let provider_query = ProviderQuery {
            query: profile.expand_query(query),
            max_results: count,
            include_domains: profile
                .allowed_domains()
                .iter()
                .map(ToString::to_string)
                .collect(),
            include_raw_content: false,
        };
        match self.provider.search(&provider_query).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, "search provider unavailable, degrading to local results");
                Vec::new()
            }
        }
    }

    /// Featured view: provider relevance first, popularity as tiebreak.
    pub async fn featured(
        &self,
        kind: ListingKind,
        limit: Option<usize>,
    ) -> Result<Vec<Listing>, StoreError> {
        self.gateway
            .store()
            .top_ranked(kind, limit.unwrap_or(self.default_max_results))
            .await
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
        self.gateway.store().find_by_id(id).await
    }

    pub async fn toggle_bookmark(
        &self,
        user_id: Uuid,
        listing_id: Uuid,
        bookmark: bool,
    ) -> Result<(), StoreError> {
        self.gateway.toggle_bookmark(user_id, listing_id, bookmark).await
    }

    pub async fn record_access(&self, user_id: Uuid, listing_id: Uuid) -> Result<(), StoreError> {
        self.gateway.record_access(user_id, listing_id).await
    }

    pub async fn mark_milestone(&self, user_id: Uuid, listing_id: Uuid) -> Result<(), StoreError> {
        self.gateway.mark_milestone(user_id, listing_id).await
    }

    pub async fn user_listings(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(Listing, UserListingLink)>, StoreError> {
        self.gateway.user_listings(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use ks_enrich::{MetaTagScraper, PageBehavior, ScriptedFetcher};
    use ks_store::{BackfillFields, ListingStore, MemoryListingStore};

    use super::*;

    fn course_hit(url: &str, title: &str, score: f64) -> RawSearchHit {
        RawSearchHit {
            url: url.to_string(),
            title: title.to_string(),
            content: Some(format!("{title} long description about python")),
            image: None,
            score: Some(score),
        }
    }

    fn service_with(
        store: Arc<MemoryListingStore>,
        provider: Arc<StaticSearchProvider>,
        fetcher: ScriptedFetcher,
    ) -> SearchService {
        let gateway = ListingGateway::new(store);
        let backfill = BackfillEngine::new(Arc::new(fetcher), Arc::new(MetaTagScraper));
        SearchService::new(gateway, provider, backfill)
    }

    async fn seed_course(
        store: &Arc<MemoryListingStore>,
        url: &str,
        title: &str,
        popularity: i64,
    ) -> Listing {
        let gateway = ListingGateway::new(store.clone());
        let profile = profile_for(ListingKind::Course);
        let draft = extract_draft(profile, "python", &course_hit(url, title, 0.0));
        let listing = gateway.persist_new(vec![draft]).await.unwrap().remove(0);
        store.increment_score(listing.id, popularity).await.unwrap();
        // Saturate presentation fields so seeded rows skip backfill.
        gateway
            .apply_backfill(
                listing.id,
                BackfillFields {
                    short_description: Some("seeded".into()),
                    image_url: Some(format!("{url}/img.png")),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn local_fast_path_never_calls_the_provider() {
        let store = Arc::new(MemoryListingStore::new());
        for i in 0..3 {
            seed_course(
                &store,
                &format!("https://coursera.org/learn/python-{i}"),
                &format!("Python Course {i}"),
                i,
            )
            .await;
        }
        let provider = Arc::new(StaticSearchProvider::new(vec![course_hit(
            "https://udemy.com/course/python",
            "Python Bootcamp",
            0.9,
        )]));
        let service = service_with(store, provider.clone(), ScriptedFetcher::new());

        let results = service
            .search(ListingKind::Course, "python", Some(3))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn fast_path_orders_by_popularity() {
        let store = Arc::new(MemoryListingStore::new());
        let low = seed_course(&store, "https://edx.org/course/python-low", "Python Low", 1).await;
        let high = seed_course(&store, "https://edx.org/course/python-high", "Python High", 9).await;
        let provider = Arc::new(StaticSearchProvider::default());
        let service = service_with(store, provider, ScriptedFetcher::new());

        let results = service
            .search(ListingKind::Course, "python", Some(2))
            .await
            .unwrap();
        assert_eq!(results[0].id, high.id);
        assert_eq!(results[1].id, low.id);
    }

    #[tokio::test]
    async fn shortfall_is_filled_from_the_provider_and_persisted() {
        let store = Arc::new(MemoryListingStore::new());
        let local = seed_course(
            &store,
            "https://coursera.org/learn/python",
            "Python Local",
            5,
        )
        .await;
        // One provider hit duplicates the local listing's URL and must
        // not reappear as a second record.
        let provider = Arc::new(StaticSearchProvider::new(vec![
            course_hit("https://coursera.org/learn/python", "Python Local", 0.9),
            course_hit("https://udemy.com/course/python-a", "Python A", 0.8),
            course_hit("https://udemy.com/course/python-b", "Python B", 0.7),
        ]));
        let service = service_with(store.clone(), provider.clone(), ScriptedFetcher::new());

        let results = service
            .search(ListingKind::Course, "python", Some(10))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, local.id, "local results lead the merge");
        let unique: HashSet<Uuid> = results.iter().map(|l| l.id).collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(provider.calls(), 1);

        let query = provider.last_query().await.unwrap();
        assert_eq!(query.query, "python online courses OR tutorials");
        assert_eq!(query.max_results, 9, "asks only for the shortfall");
        assert!(!query.include_raw_content);
        assert!(query.include_domains.contains(&"coursera.org".to_string()));
    }

    #[tokio::test]
    async fn repeated_searches_do_not_duplicate_listings() {
        let store = Arc::new(MemoryListingStore::new());
        let provider = Arc::new(StaticSearchProvider::new(vec![
            course_hit("https://udemy.com/course/python-a", "Python A", 0.8),
            course_hit("https://udemy.com/course/python-b", "Python B", 0.7),
        ]));
        let service = service_with(store.clone(), provider, ScriptedFetcher::new());

        let first = service
            .search(ListingKind::Course, "python", Some(10))
            .await
            .unwrap();
        let second = service
            .search(ListingKind::Course, "python", Some(10))
            .await
            .unwrap();

        let first_ids: HashSet<Uuid> = first.iter().map(|l| l.id).collect();
        let second_ids: HashSet<Uuid> = second.iter().map(|l| l.id).collect();
        assert_eq!(first_ids, second_ids);

        let stored = store
            .find_by_stable_id(
                ListingKind::Course,
                &ks_core::stable_id_for_url("https://udemy.com/course/python-a"),
            )
            .await
            .unwrap();
        assert!(stored.is_some());
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn provider_outage_degrades_to_local_results() {
        let store = Arc::new(MemoryListingStore::new());
        let local = seed_course(
            &store,
            "https://coursera.org/learn/python",
            "Python Local",
            2,
        )
        .await;
        let provider = Arc::new(StaticSearchProvider::failing());
        let service = service_with(store, provider.clone(), ScriptedFetcher::new());

        let results = service
            .search(ListingKind::Course, "python", Some(10))
            .await
            .unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, local.id);
    }

    #[tokio::test]
    async fn job_search_expands_query_and_scopes_job_boards() {
        let store = Arc::new(MemoryListingStore::new());
        let provider = Arc::new(StaticSearchProvider::new(vec![RawSearchHit {
            url: "https://linkedin.com/jobs/view/42".into(),
            title: "Rust Engineer at Oxide".into(),
            content: Some("Remote role using Rust and PostgreSQL".into()),
            image: None,
            score: Some(0.95),
        }]));
        let service = service_with(store, provider.clone(), ScriptedFetcher::new());

        let results = service
            .search(ListingKind::Job, "rust", Some(5))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].provider, "Oxide");
        assert_eq!(
            results[0].tags,
            vec!["Rust".to_string(), "SQL".to_string(), "PostgreSQL".to_string()]
        );

        let query = provider.last_query().await.unwrap();
        assert_eq!(query.query, "rust jobs OR careers OR hiring");
        assert!(query.include_domains.contains(&"linkedin.com".to_string()));
    }

    #[tokio::test]
    async fn search_response_includes_backfilled_metadata() {
        let store = Arc::new(MemoryListingStore::new());
        let provider = Arc::new(StaticSearchProvider::new(vec![course_hit(
            "https://udemy.com/course/python-meta",
            "Python Meta",
            0.8,
        )]));
        let fetcher = ScriptedFetcher::new().with_page(
            "https://udemy.com/course/python-meta",
            PageBehavior::Html(
                r#"<html><head>
                <meta property="og:description" content="Backfilled summary">
                <meta property="og:image" content="https://udemy.com/meta.png">
                </head></html>"#
                    .to_string(),
            ),
        );
        let service = service_with(store, provider, fetcher);

        let results = service
            .search(ListingKind::Course, "python", Some(5))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].short_description, "Backfilled summary");
        assert_eq!(
            results[0].image_url.as_deref(),
            Some("https://udemy.com/meta.png")
        );
    }

    #[tokio::test]
    async fn featured_orders_by_provider_score_then_popularity() {
        let store = Arc::new(MemoryListingStore::new());
        let gateway = ListingGateway::new(store.clone());
        let profile = profile_for(ListingKind::Course);
        for (url, score, popularity) in [
            ("https://edx.org/course/a", 90.0, 1i64),
            ("https://edx.org/course/b", 90.0, 5),
            ("https://edx.org/course/c", 80.0, 100),
        ] {
            let draft = extract_draft(profile, "python", &course_hit(url, url, score));
            let listing = gateway.persist_new(vec![draft]).await.unwrap().remove(0);
            store.increment_score(listing.id, popularity).await.unwrap();
        }
        let service = service_with(
            store,
            Arc::new(StaticSearchProvider::default()),
            ScriptedFetcher::new(),
        );

        let featured = service.featured(ListingKind::Course, None).await.unwrap();
        let order: Vec<(f64, i64)> = featured
            .iter()
            .map(|l| (l.provider_score, l.popularity_score))
            .collect();
        assert_eq!(order, vec![(90.0, 5), (90.0, 1), (80.0, 100)]);
    }
}
