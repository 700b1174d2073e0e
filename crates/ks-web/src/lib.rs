//! JSON surface over the search service, consumed by the HTTP app.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ks_core::{Listing, ListingKind, UserListingLink};
use ks_search::{EngineConfig, SearchService};
use ks_store::StoreError;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ks-web";

pub struct AppState {
    pub service: SearchService,
}

pub fn app(service: SearchService) -> Router {
    Router::new()
        .route("/api/{kind}/search", get(search_handler))
        .route("/api/{kind}/featured", get(featured_handler))
        .route("/api/listings/{id}", get(listing_handler))
        .route("/api/listings/{id}/bookmark", post(bookmark_handler))
        .route("/api/listings/{id}/access", post(access_handler))
        .route("/api/listings/{id}/milestone", post(milestone_handler))
        .route("/api/users/{user_id}/listings", get(user_listings_handler))
        .with_state(Arc::new(AppState { service }))
}

pub async fn serve(config: &EngineConfig, service: SearchService) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    axum::serve(listener, app(service)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    max_results: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FeaturedParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct BookmarkBody {
    user_id: Uuid,
    bookmark: bool,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    user_id: Uuid,
}

#[derive(Debug, Serialize)]
struct UserListingRow {
    listing: Listing,
    link: UserListingLink,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(params): Query<SearchParams>,
) -> Response {
    let Some(kind) = ListingKind::parse_slug(&kind) else {
        return unknown_kind(&kind);
    };
    match state
        .service
        .search(kind, &params.q, params.max_results)
        .await
    {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => store_error(err),
    }
}

async fn featured_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(params): Query<FeaturedParams>,
) -> Response {
    let Some(kind) = ListingKind::parse_slug(&kind) else {
        return unknown_kind(&kind);
    };
    match state.service.featured(kind, params.limit).await {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => store_error(err),
    }
}

async fn listing_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.service.get_by_id(id).await {
        Ok(Some(listing)) => Json(listing).into_response(),
        Ok(None) => not_found(),
        Err(err) => store_error(err),
    }
}

async fn bookmark_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<BookmarkBody>,
) -> Response {
    match state
        .service
        .toggle_bookmark(body.user_id, id, body.bookmark)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

async fn access_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UserBody>,
) -> Response {
    match state.service.record_access(body.user_id, id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

async fn milestone_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UserBody>,
) -> Response {
    match state.service.mark_milestone(body.user_id, id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

async fn user_listings_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Response {
    match state.service.user_listings(user_id).await {
        Ok(rows) => {
            let rows: Vec<UserListingRow> = rows
                .into_iter()
                .map(|(listing, link)| UserListingRow { listing, link })
                .collect();
            Json(rows).into_response()
        }
        Err(err) => store_error(err),
    }
}

fn unknown_kind(kind: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": format!("unknown listing kind '{kind}'") })),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "listing not found" })),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(_) => not_found(),
        err => {
            error!(error = %err, "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "service unavailable" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use ks_enrich::{BackfillEngine, MetaTagScraper, ScriptedFetcher};
    use ks_extract::RawSearchHit;
    use ks_search::StaticSearchProvider;
    use ks_store::{ListingGateway, MemoryListingStore};
    use tower::ServiceExt;

    use super::*;

    fn test_app(hits: Vec<RawSearchHit>) -> Router {
        let store = Arc::new(MemoryListingStore::new());
        let gateway = ListingGateway::new(store);
        let backfill = BackfillEngine::new(
            Arc::new(ScriptedFetcher::new()),
            Arc::new(MetaTagScraper),
        );
        let service = SearchService::new(
            gateway,
            Arc::new(StaticSearchProvider::new(hits)),
            backfill,
        );
        app(service)
    }

    fn course_hit(url: &str, title: &str) -> RawSearchHit {
        RawSearchHit {
            url: url.to_string(),
            title: title.to_string(),
            content: Some(format!("{title} about python")),
            image: None,
            score: Some(0.8),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn search_returns_listings_as_json() {
        let app = test_app(vec![course_hit("https://udemy.com/course/python", "Python")]);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/courses/search?q=python")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let listings = json.as_array().unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0]["title"], "Python");
        assert_eq!(listings[0]["provider"], "Udemy");
    }

    #[tokio::test]
    async fn unknown_kind_is_a_bad_request() {
        let app = test_app(vec![]);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/gigs/search?q=python")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_listing_is_a_not_found() {
        let app = test_app(vec![]);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/listings/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bookmark_flow_reaches_user_listings() {
        let app = test_app(vec![course_hit("https://udemy.com/course/rust", "Rust")]);
        let user_id = Uuid::new_v4();

        let search = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/courses/search?q=rust")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listings = body_json(search).await;
        let listing_id = listings[0]["id"].as_str().unwrap().to_string();

        let bookmark = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/listings/{listing_id}/bookmark"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({ "user_id": user_id, "bookmark": true }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bookmark.status(), StatusCode::NO_CONTENT);

        let rows = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/users/{user_id}/listings"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rows.status(), StatusCode::OK);
        let json = body_json(rows).await;
        let rows = json.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["link"]["is_bookmarked"], true);
        assert_eq!(rows[0]["listing"]["id"].as_str().unwrap(), listing_id);
        assert_eq!(rows[0]["listing"]["popularity_score"], 1);
    }

    #[tokio::test]
    async fn featured_endpoint_returns_ranked_listings() {
        let app = test_app(vec![
            course_hit("https://udemy.com/course/a", "Python A"),
            course_hit("https://udemy.com/course/b", "Python B"),
        ]);

        // Populate the store through a search first.
        let _ = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/courses/search?q=python")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/courses/featured?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 2);
    }
}
