use crate::retrieve::Retriever;
use crate::sink::Sink;
use ingestor_core::config::IngestConfig;
use ingestor_core::telemetry::{CYCLES_TOTAL, RETRIEVE_DURATION_MS};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Retrieving,
    Storing,
    Sleeping,
}

/// How a single cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Stored,
    /// The sink answered but did not accept the value
    SinkRejected,
    SinkFailed,
    RetrievalFailed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Stored => "stored",
            CycleOutcome::SinkRejected => "sink_rejected",
            CycleOutcome::SinkFailed => "sink_failed",
            CycleOutcome::RetrievalFailed => "retrieval_failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Stored)
    }
}

/// Retrieve, store, sleep. Forever, until cancelled.
pub struct IngestionLoop {
    retriever: Arc<dyn Retriever>,
    sink: Arc<dyn Sink>,
    key: String,
    interval: Duration,
    verify_round_trip: bool,
}

impl IngestionLoop {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        sink: Arc<dyn Sink>,
        key: impl Into<String>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            retriever,
            sink,
            key: key.into(),
            interval: config.interval,
            verify_round_trip: config.verify_round_trip,
        }
    }

    fn enter(&self, state: LoopState) {
        debug!(state = ?state, "Loop state");
    }

    /// One retrieve-and-store pass. Never fails: every problem is logged
    /// once and reported through the outcome.
    #[instrument(skip(self), fields(source = self.retriever.source_id(), sink = self.sink.sink_id()))]
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.enter(LoopState::Retrieving);
        let started = Instant::now();
        let retrieved = self.retriever.retrieve().await;
        histogram!(RETRIEVE_DURATION_MS).record(started.elapsed().as_millis() as f64);

        let outcome = match retrieved {
            Err(e) => {
                error!(category = e.category(), error = %e, "Failed to retrieve data");
                CycleOutcome::RetrievalFailed
            }
            Ok(batch) => {
                self.enter(LoopState::Storing);
                match self.sink.put(&self.key, batch.as_str()).await {
                    Ok(true) => {
                        info!(key = %self.key, bytes = batch.len(), "Data stored successfully");
                        if self.verify_round_trip {
                            self.verify().await;
                        }
                        CycleOutcome::Stored
                    }
                    Ok(false) => {
                        error!(key = %self.key, "Sink did not accept the data");
                        CycleOutcome::SinkRejected
                    }
                    Err(e) => {
                        error!(key = %self.key, category = e.category(), error = %e, "Failed to store data");
                        CycleOutcome::SinkFailed
                    }
                }
            }
        };

        counter!(CYCLES_TOTAL, "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    async fn verify(&self) {
        match self.sink.verify(&self.key).await {
            Ok(Some(round_trip)) => {
                info!(
                    key = %self.key,
                    value = ?round_trip.value,
                    deleted = round_trip.deleted,
                    "Read back stored data"
                );
            }
            Ok(None) => debug!("Sink does not support read-back"),
            Err(e) => warn!(key = %self.key, error = %e, "Failed to read back stored data"),
        }
    }

    /// Run cycles spaced by the interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            source = self.retriever.source_id(),
            sink = self.sink.sink_id(),
            interval_secs = self.interval.as_secs_f64(),
            "Starting ingestion loop"
        );
        self.enter(LoopState::Idle);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.run_cycle().await;

            self.enter(LoopState::Sleeping);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Ingestion loop stopped");
    }
}
