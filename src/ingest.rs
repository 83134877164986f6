use crate::amqp_subscriber::{EventHandler, InboundDelivery, Settlement};
use crate::metadata_store::{StoreError, VideoId, VideoIdError, VideoMetadata, VideoStore};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Upload notification as published on the wire:
/// `{"video": {"id": "...", "name": "..."}}`
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedEvent {
    pub video: UploadedVideo,
}

/// Video descriptor inside an upload notification
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedVideo {
    pub id: String,
    pub name: String,
}

impl TryFrom<UploadedEvent> for VideoMetadata {
    type Error = VideoIdError;

    fn try_from(event: UploadedEvent) -> Result<Self, Self::Error> {
        let id: VideoId = event.video.id.parse()?;
        Ok(Self {
            id,
            name: event.video.name,
        })
    }
}

/// Errors from ingesting one event
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("malformed event payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("invalid video id in event: {0}")]
    InvalidId(#[from] VideoIdError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Turns upload notifications into catalog writes.
///
/// The settlement is computed from the write result, so an acknowledgment can
/// only happen after the store has confirmed the write. A crash in between
/// leaves the delivery unacked and costs one harmless duplicate upsert on
/// redelivery.
pub struct UploadIngestor<S> {
    store: Arc<S>,
}

impl<S: VideoStore> UploadIngestor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn ingest(&self, payload: &[u8]) -> Result<VideoMetadata, IngestError> {
        let event: UploadedEvent = serde_json::from_slice(payload)?;
        let video = VideoMetadata::try_from(event)?;

        self.store.upsert_video(video.clone()).await?;

        Ok(video)
    }
}

#[async_trait]
impl<S: VideoStore> EventHandler for UploadIngestor<S> {
    #[instrument(skip(self, delivery), fields(redelivered = delivery.redelivered))]
    async fn handle(&self, delivery: &InboundDelivery) -> Settlement {
        match self.ingest(&delivery.payload).await {
            Ok(video) => {
                info!(video_id = %video.id, name = %video.name, "Video metadata recorded");
                metrics::counter!("metadata.events.ingested").increment(1);
                Settlement::Ack
            }
            Err(e @ (IngestError::MalformedPayload(_) | IngestError::InvalidId(_))) => {
                warn!(error = %e, "Dropping poison event");
                metrics::counter!("metadata.events.poison").increment(1);
                Settlement::Discard
            }
            Err(IngestError::Store(e)) => {
                warn!(error = %e, "Store write failed, leaving event for redelivery");
                metrics::counter!("metadata.events.requeued").increment(1);
                Settlement::Requeue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::testing::InMemoryStore;
    use crate::metadata_store::MockVideoStore;

    const UPLOADED: &[u8] = br#"{"video":{"id":"abc123","name":"My Clip"}}"#;

    #[test]
    fn test_deserialize_uploaded_event() {
        let event: UploadedEvent = serde_json::from_slice(UPLOADED).unwrap();
        assert_eq!(event.video.id, "abc123");
        assert_eq!(event.video.name, "My Clip");
    }

    #[tokio::test]
    async fn test_valid_event_is_written_then_acked() {
        let mut store = MockVideoStore::new();
        store
            .expect_upsert_video()
            .withf(|video| video.id.as_str() == "abc123" && video.name == "My Clip")
            .times(1)
            .returning(|_| Ok(()));

        let ingestor = UploadIngestor::new(Arc::new(store));
        let settlement = ingestor.handle(&InboundDelivery::for_payload(UPLOADED)).await;

        assert_eq!(settlement, Settlement::Ack);
    }

    #[tokio::test]
    async fn test_failed_write_is_never_acked() {
        let mut store = MockVideoStore::new();
        store
            .expect_upsert_video()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut)));

        let ingestor = UploadIngestor::new(Arc::new(store));
        let settlement = ingestor.handle(&InboundDelivery::for_payload(UPLOADED)).await;

        assert_eq!(settlement, Settlement::Requeue);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_discarded_without_store_call() {
        let mut store = MockVideoStore::new();
        store.expect_upsert_video().times(0);

        let ingestor = UploadIngestor::new(Arc::new(store));
        let settlement = ingestor
            .handle(&InboundDelivery::for_payload(b"not json".to_vec()))
            .await;

        assert_eq!(settlement, Settlement::Discard);
    }

    #[tokio::test]
    async fn test_invalid_id_is_discarded() {
        let mut store = MockVideoStore::new();
        store.expect_upsert_video().times(0);

        let ingestor = UploadIngestor::new(Arc::new(store));
        let settlement = ingestor
            .handle(&InboundDelivery::for_payload(
                br#"{"video":{"id":"bad id!","name":"x"}}"#.to_vec(),
            ))
            .await;

        assert_eq!(settlement, Settlement::Discard);
    }

    #[tokio::test]
    async fn test_redelivered_event_leaves_one_record() {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = UploadIngestor::new(store.clone());

        let first = ingestor.handle(&InboundDelivery::for_payload(UPLOADED)).await;
        let second = ingestor.handle(&InboundDelivery::for_payload(UPLOADED)).await;

        assert_eq!(first, Settlement::Ack);
        assert_eq!(second, Settlement::Ack);
        assert_eq!(store.record_count(), 1);

        let id: VideoId = "abc123".parse().unwrap();
        let found = store.get_video(&id).await.unwrap().unwrap();
        assert_eq!(found.name, "My Clip");
    }

    #[tokio::test]
    async fn test_poison_event_does_not_stop_subsequent_ingestion() {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = UploadIngestor::new(store.clone());

        let poison = ingestor
            .handle(&InboundDelivery::for_payload(b"{\"video\":42}".to_vec()))
            .await;
        let valid = ingestor.handle(&InboundDelivery::for_payload(UPLOADED)).await;

        assert_eq!(poison, Settlement::Discard);
        assert_eq!(valid, Settlement::Ack);
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_requeued_event_succeeds_once_store_recovers() {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = UploadIngestor::new(store.clone());

        store.fail_writes(true);
        let while_down = ingestor.handle(&InboundDelivery::for_payload(UPLOADED)).await;
        assert_eq!(while_down, Settlement::Requeue);
        assert_eq!(store.record_count(), 0);

        store.fail_writes(false);
        let redelivered = ingestor.handle(&InboundDelivery::for_payload(UPLOADED)).await;
        assert_eq!(redelivered, Settlement::Ack);
        assert_eq!(store.record_count(), 1);
    }
}
