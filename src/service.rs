use crate::amqp_subscriber::UploadSubscriber;
use crate::config::Config;
use crate::ingest::UploadIngestor;
use crate::metadata_store::{MetadataStore, VideoStore};
use crate::video_api::{create_router, AppState};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A running service instance.
///
/// Every `start` call builds an independent instance with its own store pool,
/// broker channel and HTTP listener, so tests can run several side by side
/// (bind port 0 and read the address back from `local_addr`).
pub struct Microservice {
    local_addr: SocketAddr,
    subscriber_shutdown: broadcast::Sender<()>,
    subscriber_task: JoinHandle<()>,
    http_task: JoinHandle<()>,
}

impl Microservice {
    /// Start the service: store first, then the subscriber, then HTTP.
    ///
    /// The store must be reachable before consumption begins so ingestion
    /// never targets an unready store. The HTTP listener binds last, once
    /// routes are registered over the live store handle.
    pub async fn start(config: Config) -> Result<Self> {
        let store = Arc::new(
            MetadataStore::connect(&config.database)
                .await
                .context("Failed to initialize metadata store")?,
        );

        if config.database.run_migrations {
            store
                .run_migrations()
                .await
                .context("Failed to run database migrations")?;
        }

        let subscriber = UploadSubscriber::connect(&config.amqp)
            .await
            .context("Failed to connect upload subscriber")?;
        let subscriber_shutdown = subscriber.shutdown_sender();

        let ingestor = Arc::new(UploadIngestor::new(store.clone()));
        let subscriber_task = tokio::spawn(async move {
            if let Err(e) = subscriber.run(ingestor).await {
                error!(error = %e, "Upload subscriber error");
            }
        });

        let state = AppState {
            store: store as Arc<dyn VideoStore>,
        };
        let router = create_router(state, &config.api);

        let addr = format!("{}:{}", config.api.host, config.api.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        let http_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "HTTP server error");
            }
        });

        info!(address = %local_addr, "Microservice online");

        Ok(Self {
            local_addr,
            subscriber_shutdown,
            subscriber_task,
            http_task,
        })
    }

    /// Address the HTTP listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the consume loop, then drop the HTTP listener
    pub async fn shutdown(self) {
        let _ = self.subscriber_shutdown.send(());

        let abort = self.subscriber_task.abort_handle();
        match tokio::time::timeout(Duration::from_secs(5), self.subscriber_task).await {
            Ok(Err(e)) if !e.is_cancelled() => error!(error = %e, "Subscriber task failed"),
            Ok(_) => {}
            Err(_) => {
                // In-flight delivery stays unacked; the broker redelivers it.
                warn!("Subscriber did not stop in time, aborting");
                abort.abort();
            }
        }

        self.http_task.abort();

        info!("Microservice stopped");
    }
}
