pub mod http;
pub mod sql;

use crate::model::FormattedBatch;
use async_trait::async_trait;
use ingestor_core::config::RetrievalConfig;
use ingestor_core::Result;

pub use http::HttpRetriever;
pub use sql::SqlRetriever;

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Fetch and normalize one batch
    async fn retrieve(&self) -> Result<FormattedBatch>;

    /// Get the source identifier
    fn source_id(&self) -> &str;

    /// Release any held connection resources
    async fn close(&self) {}
}

/// The configured source, HTTP or SQL.
pub enum DataRetriever {
    Http(HttpRetriever),
    Sql(SqlRetriever),
}

impl DataRetriever {
    pub fn from_config(config: &RetrievalConfig) -> Result<Self> {
        match config {
            RetrievalConfig::Http(http) => Ok(DataRetriever::Http(HttpRetriever::new(http)?)),
            RetrievalConfig::Sql(sql) => Ok(DataRetriever::Sql(SqlRetriever::new(sql))),
        }
    }
}

#[async_trait]
impl Retriever for DataRetriever {
    async fn retrieve(&self) -> Result<FormattedBatch> {
        match self {
            DataRetriever::Http(http) => http.retrieve().await,
            DataRetriever::Sql(sql) => sql.retrieve().await,
        }
    }

    fn source_id(&self) -> &str {
        match self {
            DataRetriever::Http(http) => http.source_id(),
            DataRetriever::Sql(sql) => sql.source_id(),
        }
    }

    async fn close(&self) {
        match self {
            DataRetriever::Http(http) => http.close().await,
            DataRetriever::Sql(sql) => sql.close().await,
        }
    }
}
