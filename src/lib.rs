//! Video Metadata Service
//!
//! Keeps a video catalog in sync with "video uploaded" notifications from a
//! RabbitMQ fanout exchange and serves read access to that catalog over HTTP.
//! Every instance binds its own anonymous queue to the exchange, upserts each
//! event's metadata into PostgreSQL, and acknowledges the delivery only after
//! the write is confirmed, so a crash mid-flight costs at most a duplicate
//! upsert, never a lost record.
//!
//! ```text
//! video-uploaded          upload        metadata        query
//!    exchange   ────────▶ subscriber ─▶ store (PG) ◀─── API (axum)
//!   (fanout)              ack/requeue/     │
//!                         discard          └─ videos table
//! ```

pub mod amqp_subscriber;
pub mod config;
pub mod ingest;
pub mod metadata_store;
pub mod service;
pub mod video_api;

pub use amqp_subscriber::{
    EventHandler, InboundDelivery, Settlement, SubscriberError, UploadSubscriber,
};
pub use config::Config;
pub use ingest::{IngestError, UploadIngestor, UploadedEvent};
pub use metadata_store::{
    MetadataStore, StoreError, VideoId, VideoMetadata, VideoPage, VideoStore,
};
pub use service::Microservice;
pub use video_api::AppState;
