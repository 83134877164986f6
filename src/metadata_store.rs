use crate::config::DatabaseConfig;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Maximum identifier length accepted on any boundary
const MAX_ID_LEN: usize = 64;

/// Hard cap on a single listing page
const MAX_PAGE_SIZE: i64 = 500;

/// Publisher-assigned video identifier.
///
/// Validated wherever an id crosses into the service: 1 to 64 ASCII
/// alphanumerics, `-` or `_`. Construct via `str::parse`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct VideoId(String);

/// Rejection reason for a malformed identifier
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VideoIdError {
    #[error("video id must not be empty")]
    Empty,

    #[error("video id exceeds {MAX_ID_LEN} characters")]
    TooLong,

    #[error("video id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

impl FromStr for VideoId {
    type Err = VideoIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(VideoIdError::Empty);
        }
        if s.len() > MAX_ID_LEN {
            return Err(VideoIdError::TooLong);
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(VideoIdError::InvalidCharacter(c));
        }

        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl VideoId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One uploaded video's catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct VideoMetadata {
    /// Publisher-assigned identifier, unique across the catalog
    pub id: VideoId,
    /// Display name
    pub name: String,
}

/// Page window for video listings
#[derive(Debug, Clone, Copy)]
pub struct VideoPage {
    /// Maximum number of records, clamped to 500
    pub limit: i64,
    /// Number of records to skip
    pub offset: i64,
}

impl Default for VideoPage {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

impl VideoPage {
    fn effective_limit(&self) -> i64 {
        self.limit.clamp(0, MAX_PAGE_SIZE)
    }
}

/// Errors from the metadata store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying connection or query failed; callers treat this as
    /// transient and retryable.
    #[error("metadata store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

/// Typed operations against the persistent video catalog.
///
/// Ingestion and the query API depend on this trait rather than on the
/// PostgreSQL implementation, so settlement and response behavior are
/// assertable against test doubles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoStore: Send + Sync {
    /// Cheap connectivity probe for readiness checks
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert the record, or overwrite the existing record with the same id.
    /// Repeating the same write is a no-op; it never creates a duplicate.
    async fn upsert_video(&self, video: VideoMetadata) -> Result<(), StoreError>;

    /// Point lookup by identifier
    async fn get_video(&self, id: &VideoId) -> Result<Option<VideoMetadata>, StoreError>;

    /// List catalog entries in ingestion order, windowed by `page`
    async fn list_videos(&self, page: VideoPage) -> Result<Vec<VideoMetadata>, StoreError>;
}

/// Metadata store backed by PostgreSQL
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    /// Connect to the configured database
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url())
            .await?;

        info!(database = %config.name, "Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl VideoStore for MetadataStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, video), fields(video_id = %video.id))]
    async fn upsert_video(&self, video: VideoMetadata) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO videos (id, name)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(&video.id)
        .bind(&video.name)
        .execute(&self.pool)
        .await?;

        debug!(video_id = %video.id, "Video metadata upserted");

        metrics::counter!("metadata.videos.upserted").increment(1);

        Ok(())
    }

    async fn get_video(&self, id: &VideoId) -> Result<Option<VideoMetadata>, StoreError> {
        let video = sqlx::query_as::<_, VideoMetadata>(
            r#"
            SELECT id, name
            FROM videos
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(video)
    }

    async fn list_videos(&self, page: VideoPage) -> Result<Vec<VideoMetadata>, StoreError> {
        let videos = sqlx::query_as::<_, VideoMetadata>(
            r#"
            SELECT id, name
            FROM videos
            ORDER BY ingested_at, id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page.effective_limit())
        .bind(page.offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(videos)
    }
}
