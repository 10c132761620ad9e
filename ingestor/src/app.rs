use crate::pipeline::{CycleOutcome, IngestionLoop};
use crate::retrieve::{DataRetriever, Retriever};
use crate::sink::{self, Sink};
use ingestor_core::{Config, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub struct App {
    retriever: Arc<dyn Retriever>,
    sink: Arc<dyn Sink>,
    ingestion: IngestionLoop,
}

impl App {
    #[instrument(skip(config))]
    pub async fn new(config: Config) -> Result<Self> {
        info!(endpoint = %config.retrieval.kind(), "Initializing application");

        let retriever: Arc<dyn Retriever> = Arc::new(DataRetriever::from_config(&config.retrieval)?);
        let sink = sink::connect(&config.sink).await?;

        let ingestion = IngestionLoop::new(
            Arc::clone(&retriever),
            Arc::clone(&sink),
            config.sink.key.clone(),
            &config.ingest,
        );

        Ok(Self {
            retriever,
            sink,
            ingestion,
        })
    }

    pub async fn run_continuous(&self, shutdown: CancellationToken) {
        self.ingestion.run(shutdown).await
    }

    pub async fn run_once(&self) -> CycleOutcome {
        self.ingestion.run_cycle().await
    }

    /// Close the sink, then the retriever.
    pub async fn shutdown(&self) {
        if let Err(e) = self.sink.close().await {
            warn!(sink = self.sink.sink_id(), error = %e, "Failed to close sink");
        }
        self.retriever.close().await;
        info!("Application stopped");
    }
}
