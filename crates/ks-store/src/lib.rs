//! Listing store capability + persistence gateway for the listing engine.
//!
//! The store itself is a consumed capability: [`ListingStore`] names the
//! operations the engine needs (text lookup, stable-id lookup, insert,
//! absent-only field fill, atomic score increment, link upsert) and two
//! implementations are provided — Postgres for deployment and an
//! in-memory store for tests. [`ListingGateway`] layers the engine's
//! persistence semantics on top: dedup by stable external id,
//! write-once-if-absent backfill, and transition-clamped bookmark
//! scoring.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ks_core::{rank, Listing, ListingDraft, ListingKind, UserListingLink};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ks-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing {0} not found")]
    NotFound(Uuid),
    #[error("duplicate stable external id {stable_external_id} for kind {kind:?}")]
    DuplicateStableId {
        kind: ListingKind,
        stable_external_id: String,
    },
    #[error("text query failed: {0}")]
    Query(String),
    #[error("store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

fn unavailable(err: impl Into<anyhow::Error>) -> StoreError {
    StoreError::Unavailable(err.into())
}

/// Columns eligible for substring matching in [`ListingStore::find_by_text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Title,
    Description,
    Tags,
    Provider,
}

/// The full field set used by a primary search.
pub const PRIMARY_TEXT_FIELDS: &[TextField] = &[
    TextField::Title,
    TextField::Description,
    TextField::Tags,
    TextField::Provider,
];

/// The reduced field set used when the primary query fails.
pub const FALLBACK_TEXT_FIELDS: &[TextField] = &[TextField::Title, TextField::Description];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    /// `popularity_score` descending (search fast path).
    Popularity,
    /// Provider relevance descending, popularity as tiebreak (featured view).
    Featured,
}

/// Presentation fields the backfill engine may fill when absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillFields {
    pub short_description: Option<String>,
    pub image_url: Option<String>,
}

impl BackfillFields {
    pub fn is_empty(&self) -> bool {
        self.short_description.is_none() && self.image_url.is_none()
    }
}

/// Store capability consumed by the engine. Implementations must keep
/// `(kind, stable_external_id)` unique and apply `increment_score` as a
/// single atomic operation, not a read-modify-write.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn find_by_text(
        &self,
        kind: ListingKind,
        fields: &[TextField],
        query: &str,
        limit: usize,
        order: OrderBy,
    ) -> Result<Vec<Listing>, StoreError>;

    async fn find_by_stable_id(
        &self,
        kind: ListingKind,
        stable_external_id: &str,
    ) -> Result<Option<Listing>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Listing>, StoreError>;

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Listing>, StoreError>;

    async fn top_ranked(&self, kind: ListingKind, limit: usize) -> Result<Vec<Listing>, StoreError>;

    /// Insert a draft, assigning identity and timestamps. Fails with
    /// [`StoreError::DuplicateStableId`] when the unique index rejects it.
    async fn insert(&self, draft: ListingDraft) -> Result<Listing, StoreError>;

    /// Set only the given fields whose stored value is currently
    /// empty/null; existing content is never overwritten.
    async fn fill_missing_fields(
        &self,
        id: Uuid,
        fields: &BackfillFields,
    ) -> Result<Listing, StoreError>;

    /// Atomically adjust `popularity_score` by `delta`, floored at zero.
    async fn increment_score(&self, id: Uuid, delta: i64) -> Result<(), StoreError>;

    async fn find_link(
        &self,
        user_id: Uuid,
        listing_id: Uuid,
    ) -> Result<Option<UserListingLink>, StoreError>;

    /// Links for one user, most recently accessed first.
    async fn find_links_by_user(&self, user_id: Uuid)
        -> Result<Vec<UserListingLink>, StoreError>;

    async fn upsert_link(&self, link: UserListingLink) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Lock-held maps implementing [`ListingStore`]; every mutation runs
/// under the write lock, which is what makes `increment_score` atomic.
#[derive(Default)]
pub struct MemoryListingStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    listings: HashMap<Uuid, Listing>,
    links: HashMap<(Uuid, Uuid), UserListingLink>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn field_haystack(listing: &Listing, field: TextField) -> String {
    match field {
        TextField::Title => listing.title.clone(),
        TextField::Description => listing.description.clone(),
        TextField::Tags => listing.tags.join(" "),
        TextField::Provider => listing.provider.clone(),
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn find_by_text(
        &self,
        kind: ListingKind,
        fields: &[TextField],
        query: &str,
        limit: usize,
        order: OrderBy,
    ) -> Result<Vec<Listing>, StoreError> {
        let needle = query.to_lowercase();
        let inner = self.inner.read().await;
        let mut matches: Vec<Listing> = inner
            .listings
            .values()
            .filter(|l| l.kind() == kind)
            .filter(|l| {
                fields
                    .iter()
                    .any(|f| field_haystack(l, *f).to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        drop(inner);

        match order {
            OrderBy::Popularity => rank::by_popularity(&mut matches),
            OrderBy::Featured => rank::by_featured(&mut matches),
        }
        matches.truncate(limit);
        Ok(matches)
    }

    async fn find_by_stable_id(
        &self,
        kind: ListingKind,
        stable_external_id: &str,
    ) -> Result<Option<Listing>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .listings
            .values()
            .find(|l| l.kind() == kind && l.stable_external_id == stable_external_id)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
        Ok(self.inner.read().await.listings.get(&id).cloned())
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Listing>, StoreError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.listings.get(id).cloned())
            .collect())
    }

    async fn top_ranked(&self, kind: ListingKind, limit: usize) -> Result<Vec<Listing>, StoreError> {
        let inner = self.inner.read().await;
        let mut all: Vec<Listing> = inner
            .listings
            .values()
            .filter(|l| l.kind() == kind)
            .cloned()
            .collect();
        drop(inner);
        rank::by_featured(&mut all);
        all.truncate(limit);
        Ok(all)
    }

    async fn insert(&self, draft: ListingDraft) -> Result<Listing, StoreError> {
        let mut inner = self.inner.write().await;
        let kind = draft.kind();
        if inner
            .listings
            .values()
            .any(|l| l.kind() == kind && l.stable_external_id == draft.stable_external_id)
        {
            return Err(StoreError::DuplicateStableId {
                kind,
                stable_external_id: draft.stable_external_id,
            });
        }

        let now = Utc::now();
        let listing = Listing {
            id: Uuid::new_v4(),
            stable_external_id: draft.stable_external_id,
            title: draft.title,
            description: draft.description,
            short_description: draft.short_description,
            provider: draft.provider,
            url: draft.url,
            tags: draft.tags,
            image_url: draft.image_url,
            kind_fields: draft.kind_fields,
            provider_score: draft.provider_score,
            popularity_score: 0,
            created_at: now,
            updated_at: now,
        };
        inner.listings.insert(listing.id, listing.clone());
        Ok(listing)
    }

    async fn fill_missing_fields(
        &self,
        id: Uuid,
        fields: &BackfillFields,
    ) -> Result<Listing, StoreError> {
        let mut inner = self.inner.write().await;
        let listing = inner
            .listings
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;

        let mut touched = false;
        if listing.short_description.is_empty() {
            if let Some(short) = &fields.short_description {
                listing.short_description = short.clone();
                touched = true;
            }
        }
        if listing.image_url.is_none() {
            if let Some(image) = &fields.image_url {
                listing.image_url = Some(image.clone());
                touched = true;
            }
        }
        if touched {
            listing.updated_at = Utc::now();
        }
        Ok(listing.clone())
    }

    async fn increment_score(&self, id: Uuid, delta: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let listing = inner
            .listings
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        listing.popularity_score = (listing.popularity_score + delta).max(0);
        Ok(())
    }

    async fn find_link(
        &self,
        user_id: Uuid,
        listing_id: Uuid,
    ) -> Result<Option<UserListingLink>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.links.get(&(user_id, listing_id)).cloned())
    }

    async fn find_links_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<UserListingLink>, StoreError> {
        let inner = self.inner.read().await;
        let mut links: Vec<UserListingLink> = inner
            .links
            .values()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        drop(inner);
        // Most recently accessed first; never-accessed links sort last.
        links.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        Ok(links)
    }

    async fn upsert_link(&self, link: UserListingLink) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.links.insert((link.user_id, link.listing_id), link);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS listings (
    id UUID PRIMARY KEY,
    kind TEXT NOT NULL,
    stable_external_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    short_description TEXT NOT NULL DEFAULT '',
    provider TEXT NOT NULL,
    url TEXT NOT NULL,
    tags JSONB NOT NULL DEFAULT '[]'::jsonb,
    image_url TEXT,
    kind_fields JSONB NOT NULL,
    provider_score DOUBLE PRECISION NOT NULL DEFAULT 0,
    popularity_score BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS listings_kind_stable_external_id_idx
    ON listings (kind, stable_external_id);

CREATE TABLE IF NOT EXISTS user_listing_links (
    user_id UUID NOT NULL,
    listing_id UUID NOT NULL,
    is_bookmarked BOOLEAN NOT NULL DEFAULT FALSE,
    last_accessed TIMESTAMPTZ,
    milestone_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (user_id, listing_id)
);
"#;

const LISTING_COLUMNS: &str = "id, kind, stable_external_id, title, description, \
     short_description, provider, url, tags, image_url, kind_fields, \
     provider_score, popularity_score, created_at, updated_at";

/// [`ListingStore`] backed by Postgres via sqlx. Kind-specific fields
/// live in a JSONB column; the unique index on
/// `(kind, stable_external_id)` is the dedup-race backstop.
#[derive(Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(unavailable)?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_SQL.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
        }
        Ok(())
    }
}

fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn text_condition(field: TextField) -> &'static str {
    match field {
        TextField::Title => "title ILIKE $2",
        TextField::Description => "description ILIKE $2",
        TextField::Tags => {
            "EXISTS (SELECT 1 FROM jsonb_array_elements_text(tags) AS t(tag) WHERE t.tag ILIKE $2)"
        }
        TextField::Provider => "provider ILIKE $2",
    }
}

fn order_clause(order: OrderBy) -> &'static str {
    match order {
        OrderBy::Popularity => "popularity_score DESC, updated_at DESC",
        OrderBy::Featured => "provider_score DESC, popularity_score DESC",
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StoreError> {
    let tags: sqlx::types::Json<Vec<String>> = row.try_get("tags").map_err(unavailable)?;
    let kind_fields: sqlx::types::Json<ks_core::KindFields> =
        row.try_get("kind_fields").map_err(unavailable)?;
    Ok(Listing {
        id: row.try_get("id").map_err(unavailable)?,
        stable_external_id: row.try_get("stable_external_id").map_err(unavailable)?,
        title: row.try_get("title").map_err(unavailable)?,
        description: row.try_get("description").map_err(unavailable)?,
        short_description: row.try_get("short_description").map_err(unavailable)?,
        provider: row.try_get("provider").map_err(unavailable)?,
        url: row.try_get("url").map_err(unavailable)?,
        tags: tags.0,
        image_url: row.try_get("image_url").map_err(unavailable)?,
        kind_fields: kind_fields.0,
        provider_score: row.try_get("provider_score").map_err(unavailable)?,
        popularity_score: row.try_get("popularity_score").map_err(unavailable)?,
        created_at: row.try_get("created_at").map_err(unavailable)?,
        updated_at: row.try_get("updated_at").map_err(unavailable)?,
    })
}

fn link_from_row(row: &PgRow) -> Result<UserListingLink, StoreError> {
    Ok(UserListingLink {
        user_id: row.try_get("user_id").map_err(unavailable)?,
        listing_id: row.try_get("listing_id").map_err(unavailable)?,
        is_bookmarked: row.try_get("is_bookmarked").map_err(unavailable)?,
        last_accessed: row.try_get("last_accessed").map_err(unavailable)?,
        milestone_at: row.try_get("milestone_at").map_err(unavailable)?,
        created_at: row.try_get("created_at").map_err(unavailable)?,
    })
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn find_by_text(
        &self,
        kind: ListingKind,
        fields: &[TextField],
        query: &str,
        limit: usize,
        order: OrderBy,
    ) -> Result<Vec<Listing>, StoreError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let conditions = fields
            .iter()
            .map(|f| text_condition(*f))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings \
             WHERE kind = $1 AND ({conditions}) \
             ORDER BY {} LIMIT $3",
            order_clause(order)
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(like_pattern(query))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn find_by_stable_id(
        &self,
        kind: ListingKind,
        stable_external_id: &str,
    ) -> Result<Option<Listing>, StoreError> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE kind = $1 AND stable_external_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(stable_external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Listing>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn top_ranked(&self, kind: ListingKind, limit: usize) -> Result<Vec<Listing>, StoreError> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE kind = $1 \
             ORDER BY provider_score DESC, popularity_score DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn insert(&self, draft: ListingDraft) -> Result<Listing, StoreError> {
        let kind = draft.kind();
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO listings \
             (id, kind, stable_external_id, title, description, short_description, \
              provider, url, tags, image_url, kind_fields, provider_score, \
              popularity_score, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0, $13, $13) \
             RETURNING {LISTING_COLUMNS}"
        );
        let result = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(kind.as_str())
            .bind(&draft.stable_external_id)
            .bind(&draft.title)
            .bind(&draft.description)
            .bind(&draft.short_description)
            .bind(&draft.provider)
            .bind(&draft.url)
            .bind(sqlx::types::Json(&draft.tags))
            .bind(&draft.image_url)
            .bind(sqlx::types::Json(&draft.kind_fields))
            .bind(draft.provider_score)
            .bind(now)
            .fetch_one(&self.pool)
            .await;
        match result {
            Ok(row) => listing_from_row(&row),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateStableId {
                    kind,
                    stable_external_id: draft.stable_external_id,
                })
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn fill_missing_fields(
        &self,
        id: Uuid,
        fields: &BackfillFields,
    ) -> Result<Listing, StoreError> {
        let sql = format!(
            "UPDATE listings SET \
               short_description = CASE \
                 WHEN short_description = '' AND $2::text IS NOT NULL THEN $2 \
                 ELSE short_description END, \
               image_url = COALESCE(image_url, $3), \
               updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {LISTING_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(fields.short_description.as_deref())
            .bind(fields.image_url.as_deref())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        match row {
            Some(row) => listing_from_row(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn increment_score(&self, id: Uuid, delta: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE listings SET popularity_score = GREATEST(popularity_score + $2, 0) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn find_link(
        &self,
        user_id: Uuid,
        listing_id: Uuid,
    ) -> Result<Option<UserListingLink>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, listing_id, is_bookmarked, last_accessed, milestone_at, created_at \
             FROM user_listing_links WHERE user_id = $1 AND listing_id = $2",
        )
        .bind(user_id)
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn find_links_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<UserListingLink>, StoreError> {
        let rows = sqlx::query(
            "SELECT user_id, listing_id, is_bookmarked, last_accessed, milestone_at, created_at \
             FROM user_listing_links WHERE user_id = $1 \
             ORDER BY last_accessed DESC NULLS LAST, created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(link_from_row).collect()
    }

    async fn upsert_link(&self, link: UserListingLink) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_listing_links \
             (user_id, listing_id, is_bookmarked, last_accessed, milestone_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (user_id, listing_id) DO UPDATE SET \
               is_bookmarked = EXCLUDED.is_bookmarked, \
               last_accessed = EXCLUDED.last_accessed, \
               milestone_at = EXCLUDED.milestone_at",
        )
        .bind(link.user_id)
        .bind(link.listing_id)
        .bind(link.is_bookmarked)
        .bind(link.last_accessed)
        .bind(link.milestone_at)
        .bind(link.created_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Persistence semantics layered over a [`ListingStore`].
#[derive(Clone)]
pub struct ListingGateway {
    store: Arc<dyn ListingStore>,
}

impl ListingGateway {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    /// Dedup-then-insert for a batch of drafts. Each draft is looked up
    /// by stable external id first; a hit short-circuits to the stored
    /// record unchanged. Losing an insert race to a concurrent search is
    /// recovered by re-reading the winner's row.
    pub async fn persist_new(
        &self,
        drafts: Vec<ListingDraft>,
    ) -> Result<Vec<Listing>, StoreError> {
        let mut out = Vec::with_capacity(drafts.len());
        for draft in drafts {
            out.push(self.persist_one(draft).await?);
        }
        Ok(out)
    }

    async fn persist_one(&self, draft: ListingDraft) -> Result<Listing, StoreError> {
        let kind = draft.kind();
        let stable_id = draft.stable_external_id.clone();
        if let Some(existing) = self.store.find_by_stable_id(kind, &stable_id).await? {
            return Ok(existing);
        }
        match self.store.insert(draft).await {
            Ok(listing) => Ok(listing),
            Err(StoreError::DuplicateStableId { .. }) => {
                warn!(
                    kind = kind.as_str(),
                    stable_external_id = %stable_id,
                    "lost insert race, reusing existing listing"
                );
                self.store
                    .find_by_stable_id(kind, &stable_id)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Query(format!(
                            "listing with stable id {stable_id} vanished after duplicate insert"
                        ))
                    })
            }
            Err(err) => Err(err),
        }
    }

    /// Apply scraped metadata to a listing, only where the stored value
    /// is still absent. Blank scrape results are discarded before they
    /// reach the store.
    pub async fn apply_backfill(
        &self,
        id: Uuid,
        mut fields: BackfillFields,
    ) -> Result<Listing, StoreError> {
        if fields
            .short_description
            .as_deref()
            .is_some_and(|s| s.trim().is_empty())
        {
            fields.short_description = None;
        }
        if fields.image_url.as_deref().is_some_and(|s| s.trim().is_empty()) {
            fields.image_url = None;
        }
        if fields.is_empty() {
            return self
                .store
                .find_by_id(id)
                .await?
                .ok_or(StoreError::NotFound(id));
        }
        self.store.fill_missing_fields(id, &fields).await
    }

    /// Toggle a bookmark. Only an actual `is_bookmarked` transition
    /// adjusts the popularity score, by exactly one, via the store's
    /// atomic increment.
    pub async fn toggle_bookmark(
        &self,
        user_id: Uuid,
        listing_id: Uuid,
        bookmark: bool,
    ) -> Result<(), StoreError> {
        let existing = self.store.find_link(user_id, listing_id).await?;
        let was_bookmarked = existing.as_ref().map(|l| l.is_bookmarked).unwrap_or(false);
        let mut link = existing.unwrap_or_else(|| new_link(user_id, listing_id));
        link.is_bookmarked = bookmark;
        self.store.upsert_link(link).await?;

        if was_bookmarked != bookmark {
            let delta = if bookmark { 1 } else { -1 };
            self.store.increment_score(listing_id, delta).await?;
        }
        Ok(())
    }

    /// Stamp `last_accessed`, creating the link lazily.
    pub async fn record_access(&self, user_id: Uuid, listing_id: Uuid) -> Result<(), StoreError> {
        let mut link = self
            .store
            .find_link(user_id, listing_id)
            .await?
            .unwrap_or_else(|| new_link(user_id, listing_id));
        link.last_accessed = Some(Utc::now());
        self.store.upsert_link(link).await
    }

    /// Stamp the kind-specific milestone (course completed / job
    /// applied) once; later calls are no-ops.
    pub async fn mark_milestone(&self, user_id: Uuid, listing_id: Uuid) -> Result<(), StoreError> {
        let mut link = self
            .store
            .find_link(user_id, listing_id)
            .await?
            .unwrap_or_else(|| new_link(user_id, listing_id));
        if link.milestone_at.is_some() {
            return Ok(());
        }
        link.milestone_at = Some(Utc::now());
        self.store.upsert_link(link).await
    }

    /// `(listing, link)` pairs for a user, most recently accessed first.
    pub async fn user_listings(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(Listing, UserListingLink)>, StoreError> {
        let links = self.store.find_links_by_user(user_id).await?;
        let ids: Vec<Uuid> = links.iter().map(|l| l.listing_id).collect();
        let listings = self.store.find_by_ids(&ids).await?;
        let by_id: HashMap<Uuid, Listing> =
            listings.into_iter().map(|l| (l.id, l)).collect();
        Ok(links
            .into_iter()
            .filter_map(|link| by_id.get(&link.listing_id).cloned().map(|l| (l, link)))
            .collect())
    }
}

fn new_link(user_id: Uuid, listing_id: Uuid) -> UserListingLink {
    UserListingLink {
        user_id,
        listing_id,
        is_bookmarked: false,
        last_accessed: None,
        milestone_at: None,
        created_at: Utc::now(),
    }
}
