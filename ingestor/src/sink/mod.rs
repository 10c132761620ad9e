pub mod mqtt;
pub mod state_store;

use async_trait::async_trait;
use ingestor_core::config::{SinkConfig, SinkTarget};
use ingestor_core::{Error, Result};
use std::sync::Arc;
use tracing::info;

pub use mqtt::MqttSink;
pub use state_store::StateStoreSink;

/// Result of reading a key back and deleting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTrip {
    pub value: Option<String>,
    pub deleted: bool,
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Store or publish `value` under `key`.
    ///
    /// `Ok(false)` means the backend answered but did not accept the value.
    async fn put(&self, key: &str, value: &str) -> Result<bool>;

    /// Read `key` back and delete it. `None` when the sink cannot do that.
    async fn verify(&self, _key: &str) -> Result<Option<RoundTrip>> {
        Ok(None)
    }

    fn sink_id(&self) -> &str;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Connect the configured sink, retrying transient failures with backoff.
/// Configuration errors return on the first attempt.
pub async fn connect(config: &SinkConfig) -> Result<Arc<dyn Sink>> {
    let retry = config.connect_retry;
    let transient = |e: &Error| !e.is_fatal();

    let sink: Arc<dyn Sink> = match &config.target {
        SinkTarget::StateStore { url } => {
            let sink = retry
                .run("connect_state_store", transient, || StateStoreSink::connect(url))
                .await?;
            Arc::new(sink)
        }
        SinkTarget::Mqtt(mqtt) => {
            let sink = retry
                .run("connect_mqtt", transient, || MqttSink::connect(mqtt))
                .await?;
            Arc::new(sink)
        }
    };

    info!(sink = sink.sink_id(), "Sink connected");
    Ok(sink)
}
