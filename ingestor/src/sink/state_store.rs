use super::{RoundTrip, Sink};
use async_trait::async_trait;
use ingestor_core::config::redact_url;
use ingestor_core::{Error, Result};
use redis::aio::ConnectionManager;
use tracing::{debug, instrument};

/// Key-value state store spoken to over the Redis protocol.
pub struct StateStoreSink {
    conn: ConnectionManager,
    sink_id: String,
}

impl StateStoreSink {
    pub async fn connect(url: &str) -> Result<Self> {
        let sink_id = redact_url(url);

        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("STATE_STORE_URL {sink_id} is invalid: {e}")))?;

        // Reconnects on its own after the first successful connection
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::sink(&sink_id, e))?;

        Ok(Self { conn, sink_id })
    }
}

#[async_trait]
impl Sink for StateStoreSink {
    #[instrument(skip(self, value), fields(sink = %self.sink_id))]
    async fn put(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::sink(&self.sink_id, e))?;

        debug!(reply = ?reply, "SET acknowledged");
        Ok(reply.as_deref() == Some("OK"))
    }

    #[instrument(skip(self), fields(sink = %self.sink_id))]
    async fn verify(&self, key: &str) -> Result<Option<RoundTrip>> {
        let mut conn = self.conn.clone();

        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::sink(&self.sink_id, e))?;

        let deleted: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::sink(&self.sink_id, e))?;

        Ok(Some(RoundTrip {
            value,
            deleted: deleted == 1,
        }))
    }

    fn sink_id(&self) -> &str {
        &self.sink_id
    }
}
