pub mod auth;
pub mod backoff;
pub mod config;
pub mod error;
pub mod telemetry;

pub use auth::AuthStrategy;
pub use config::Config;
pub use error::{Error, Result};
