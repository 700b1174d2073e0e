//! Metadata backfill: fetch listing pages and scrape presentation
//! fields for listings that are missing them.
//!
//! The engine is best-effort by construction: items run in fixed-size
//! batches (batches sequential, items within a batch concurrent), each
//! item races its fetch against a deadline, and any per-item failure —
//! fetch error, timeout, unparsable HTML — yields "no metadata" without
//! touching its siblings. Results are merged back by item identity, not
//! completion order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ks_core::Listing;
use ks_store::{BackfillFields, ListingGateway};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::time::timeout;
use tracing::warn;
use url::Url;

pub const CRATE_NAME: &str = "ks-enrich";

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// HTTP fetch capability consumed by the engine.
#[async_trait]
pub trait PageFetch: Send + Sync {
    async fn fetch_html(&self, url: &str) -> Result<String, FetchError>;
}

/// Live fetcher with a browser-like header set; listing sites routinely
/// refuse bare client requests.
pub struct HttpPageFetcher {
    client: reqwest::Client,
}

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

impl HttpPageFetcher {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(request_timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetch for HttpPageFetcher {
    async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        // 4xx bodies are still scraped; boards serve usable metadata on
        // soft-404 pages.
        if status.is_server_error() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

/// Scraped presentation metadata for one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetadata {
    pub description: Option<String>,
    pub image: Option<String>,
    pub logo: Option<String>,
}

impl PageMetadata {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.image.is_none() && self.logo.is_none()
    }

    /// The image to display: page image first, logo as fallback.
    pub fn display_image(&self) -> Option<&str> {
        self.image.as_deref().or(self.logo.as_deref())
    }
}

/// HTML metadata scraper capability; must tolerate malformed HTML.
pub trait MetadataScraper: Send + Sync {
    fn extract(&self, html: &str, url: &str) -> PageMetadata;
}

/// Scraper over `og:`/`twitter:`/plain meta tags plus icon links.
pub struct MetaTagScraper;

fn meta_content(document: &Html, keys: &[&str]) -> Option<String> {
    let selector = Selector::parse("meta").ok()?;
    for key in keys {
        for element in document.select(&selector) {
            let name = element
                .value()
                .attr("property")
                .or_else(|| element.value().attr("name"))
                .unwrap_or("");
            if !name.eq_ignore_ascii_case(key) {
                continue;
            }
            if let Some(content) = element.value().attr("content") {
                let content = content.trim();
                if !content.is_empty() {
                    return Some(content.to_string());
                }
            }
        }
    }
    None
}

fn icon_href(document: &Html) -> Option<String> {
    let selector = Selector::parse("link[rel]").ok()?;
    for element in document.select(&selector) {
        let rel = element.value().attr("rel").unwrap_or("").to_ascii_lowercase();
        if !rel.split_whitespace().any(|part| part.contains("icon")) {
            continue;
        }
        if let Some(href) = element.value().attr("href") {
            let href = href.trim();
            if !href.is_empty() {
                return Some(href.to_string());
            }
        }
    }
    None
}

fn absolutize(base: &str, href: &str) -> Option<String> {
    Url::parse(base).ok()?.join(href).ok().map(Into::into)
}

impl MetadataScraper for MetaTagScraper {
    fn extract(&self, html: &str, url: &str) -> PageMetadata {
        let document = Html::parse_document(html);

        let description = meta_content(
            &document,
            &["og:description", "twitter:description", "description"],
        );
        let image = meta_content(&document, &["og:image", "twitter:image"])
            .and_then(|href| absolutize(url, &href));
        let logo = icon_href(&document)
            .and_then(|href| absolutize(url, &href))
            .or_else(|| absolutize(url, "/favicon.ico"));

        PageMetadata {
            description,
            image,
            logo,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub candidates: usize,
    pub enriched: usize,
}

/// Batched, timeboxed enrichment over a listing set.
pub struct BackfillEngine {
    fetcher: Arc<dyn PageFetch>,
    scraper: Arc<dyn MetadataScraper>,
    batch_size: usize,
    item_timeout: Duration,
}

impl BackfillEngine {
    pub fn new(fetcher: Arc<dyn PageFetch>, scraper: Arc<dyn MetadataScraper>) -> Self {
        Self {
            fetcher,
            scraper,
            batch_size: DEFAULT_BATCH_SIZE,
            item_timeout: DEFAULT_ITEM_TIMEOUT,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_item_timeout(mut self, item_timeout: Duration) -> Self {
        self.item_timeout = item_timeout;
        self
    }

    /// Attempt to fill missing presentation fields across `listings`.
    ///
    /// Listings are mutated in place with whatever the store accepted,
    /// so the caller's response already reflects completed enrichment.
    /// Total runtime is bounded by `batches x item_timeout` in the
    /// worst case.
    pub async fn run(
        &self,
        gateway: &ListingGateway,
        listings: &mut [Listing],
    ) -> BackfillSummary {
        let candidates: Vec<usize> = listings
            .iter()
            .enumerate()
            .filter(|(_, listing)| listing.needs_backfill())
            .map(|(index, _)| index)
            .collect();
        let mut summary = BackfillSummary {
            candidates: candidates.len(),
            enriched: 0,
        };
        if candidates.is_empty() {
            return summary;
        }

        for batch in candidates.chunks(self.batch_size) {
            let mut handles = Vec::with_capacity(batch.len());
            for &index in batch {
                let url = listings[index].url.clone();
                let fetcher = Arc::clone(&self.fetcher);
                let scraper = Arc::clone(&self.scraper);
                let item_timeout = self.item_timeout;
                handles.push((
                    index,
                    tokio::spawn(async move {
                        fetch_one(fetcher, scraper, &url, item_timeout).await
                    }),
                ));
            }

            for (index, handle) in handles {
                let metadata = match handle.await {
                    Ok(Some(metadata)) => metadata,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(error = %err, "backfill task aborted");
                        continue;
                    }
                };
                let fields = BackfillFields {
                    short_description: metadata.description.clone(),
                    image_url: metadata.display_image().map(str::to_string),
                };
                match gateway.apply_backfill(listings[index].id, fields).await {
                    Ok(updated) => {
                        listings[index] = updated;
                        summary.enriched += 1;
                    }
                    Err(err) => {
                        warn!(
                            listing_id = %listings[index].id,
                            error = %err,
                            "failed to persist backfill result"
                        );
                    }
                }
            }
        }
        summary
    }
}

/// One item: fetch raced against the deadline, then scrape. Every
/// failure collapses to `None` so the batch keeps going.
async fn fetch_one(
    fetcher: Arc<dyn PageFetch>,
    scraper: Arc<dyn MetadataScraper>,
    url: &str,
    item_timeout: Duration,
) -> Option<PageMetadata> {
    match timeout(item_timeout, fetcher.fetch_html(url)).await {
        Ok(Ok(html)) => {
            let metadata = scraper.extract(&html, url);
            if metadata.is_empty() {
                None
            } else {
                Some(metadata)
            }
        }
        Ok(Err(err)) => {
            warn!(%url, error = %err, "metadata fetch failed");
            None
        }
        Err(_) => {
            warn!(%url, timeout_ms = item_timeout.as_millis() as u64, "metadata fetch timed out");
            None
        }
    }
}

/// Scripted fetcher for tests and offline runs.
#[derive(Default)]
pub struct ScriptedFetcher {
    pages: HashMap<String, PageBehavior>,
}

#[derive(Debug, Clone)]
pub enum PageBehavior {
    Html(String),
    Fail,
    Hang,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, behavior: PageBehavior) -> Self {
        self.pages.insert(url.to_string(), behavior);
        self
    }
}

#[async_trait]
impl PageFetch for ScriptedFetcher {
    async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        match self.pages.get(url) {
            Some(PageBehavior::Html(html)) => Ok(html.clone()),
            Some(PageBehavior::Hang) => std::future::pending().await,
            Some(PageBehavior::Fail) | None => Err(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            }),
        }
    }
}
