use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("request to {endpoint} failed with status code {status}")]
    HttpStatus { status: u16, endpoint: String },

    #[error("retrieval from {endpoint} failed: {details}")]
    Retrieval { endpoint: String, details: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink {sink} failed: {details}")]
    Sink { sink: String, details: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    pub fn sink(sink: impl Into<String>, details: impl std::fmt::Display) -> Self {
        Error::Sink {
            sink: sink.into(),
            details: details.to_string(),
        }
    }

    pub fn retrieval(endpoint: impl Into<String>, details: impl std::fmt::Display) -> Self {
        Error::Retrieval {
            endpoint: endpoint.into(),
            details: details.to_string(),
        }
    }

    /// Which part of the taxonomy this error belongs to, used as a log field.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration",
            Error::HttpStatus { .. }
            | Error::Retrieval { .. }
            | Error::Database(_)
            | Error::Http(_)
            | Error::Serialization(_) => "retrieval",
            Error::Sink { .. } => "sink",
            Error::Io(_) | Error::Internal(_) => "internal",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}
