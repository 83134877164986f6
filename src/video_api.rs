use crate::config::ApiConfig;
use crate::metadata_store::{
    StoreError, VideoId, VideoIdError, VideoMetadata, VideoPage, VideoStore,
};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn VideoStore>,
}

/// Video metadata in API responses
#[derive(Debug, Serialize)]
pub struct VideoBody {
    pub id: VideoId,
    pub name: String,
}

impl From<VideoMetadata> for VideoBody {
    fn from(v: VideoMetadata) -> Self {
        Self {
            id: v.id,
            name: v.name,
        }
    }
}

/// Response for the listing endpoint
#[derive(Debug, Serialize)]
pub struct VideoListResponse {
    pub videos: Vec<VideoBody>,
}

/// Response for a point lookup
#[derive(Debug, Serialize)]
pub struct VideoEnvelope {
    pub video: VideoBody,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Query parameters for the video listing
#[derive(Debug, Deserialize)]
pub struct VideoListParams {
    /// Maximum results per page
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Offset into the listing
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

/// Query parameters for a point lookup
#[derive(Debug, Deserialize)]
pub struct VideoLookupParams {
    pub id: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/videos", get(list_videos))
        .route("/video", get(get_video))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "metadata-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// List catalog entries
#[instrument(skip(state))]
async fn list_videos(
    State(state): State<AppState>,
    Query(params): Query<VideoListParams>,
) -> Result<Json<VideoListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let page = VideoPage {
        limit: params.limit,
        offset: params.offset,
    };

    let videos = state
        .store
        .list_videos(page)
        .await
        .map_err(store_failure)?;

    Ok(Json(VideoListResponse {
        videos: videos.into_iter().map(Into::into).collect(),
    }))
}

/// Look up one video by id
#[instrument(skip(state), fields(id = %params.id))]
async fn get_video(
    State(state): State<AppState>,
    Query(params): Query<VideoLookupParams>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let id: VideoId = params.id.parse().map_err(|e: VideoIdError| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "BAD_REQUEST".to_string(),
            }),
        )
    })?;

    let video = state.store.get_video(&id).await.map_err(store_failure)?;

    match video {
        Some(v) => Ok(Json(VideoEnvelope { video: v.into() }).into_response()),
        // A miss is a normal outcome: bare 404, no body
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

fn store_failure(e: StoreError) -> (StatusCode, Json<ErrorResponse>) {
    error!(error = %e, "Store query failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: "metadata store unavailable".to_string(),
            code: "STORE_UNAVAILABLE".to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::testing::InMemoryStore;
    use crate::metadata_store::MockVideoStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_config() -> ApiConfig {
        ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_enabled: false,
            cors_origins: vec![],
        }
    }

    fn router_over(store: Arc<dyn VideoStore>) -> Router {
        create_router(AppState { store }, &test_config())
    }

    async fn seeded_store(entries: &[(&str, &str)]) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for (id, name) in entries {
            store
                .upsert_video(VideoMetadata {
                    id: id.parse().unwrap(),
                    name: name.to_string(),
                })
                .await
                .unwrap();
        }
        store
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_list_on_empty_store_returns_empty_array() {
        let app = router_over(Arc::new(InMemoryStore::new()));

        let response = app
            .oneshot(Request::builder().uri("/videos").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "videos": [] })
        );
    }

    #[tokio::test]
    async fn test_listing_includes_ingested_video() {
        let store = seeded_store(&[("abc123", "My Clip")]).await;
        let app = router_over(store);

        let response = app
            .oneshot(Request::builder().uri("/videos").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "videos": [{ "id": "abc123", "name": "My Clip" }] })
        );
    }

    #[tokio::test]
    async fn test_lookup_hit_returns_video_envelope() {
        let store = seeded_store(&[("abc123", "My Clip")]).await;
        let app = router_over(store);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/video?id=abc123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "video": { "id": "abc123", "name": "My Clip" } })
        );
    }

    #[tokio::test]
    async fn test_lookup_miss_returns_404_with_empty_body() {
        let app = router_over(Arc::new(InMemoryStore::new()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/video?id=missing1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_id_returns_400() {
        let app = router_over(Arc::new(InMemoryStore::new()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/video?id=bad%20id%21")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_missing_id_param_returns_400() {
        let app = router_over(Arc::new(InMemoryStore::new()));

        let response = app
            .oneshot(Request::builder().uri("/video").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_503() {
        let mut store = MockVideoStore::new();
        store
            .expect_list_videos()
            .returning(|_| Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut)));

        let app = router_over(Arc::new(store));

        let response = app
            .oneshot(Request::builder().uri("/videos").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["code"], "STORE_UNAVAILABLE");
    }
}
