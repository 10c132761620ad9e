use crate::config::{LogFormat, TelemetryConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const CYCLES_TOTAL: &str = "ingestor_cycles_total";
pub const RETRIEVE_DURATION_MS: &str = "ingestor_retrieve_duration_ms";

pub fn init(config: &TelemetryConfig) -> anyhow::Result<()> {
    // RUST_LOG wins over LOG_LEVEL
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Pretty => fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    if config.metrics_enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], config.metrics_port).into();
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;

        metrics::describe_counter!(CYCLES_TOTAL, "Ingestion cycles by outcome");
        metrics::describe_histogram!(
            RETRIEVE_DURATION_MS,
            metrics::Unit::Milliseconds,
            "Time spent retrieving one batch"
        );

        tracing::info!(
            port = config.metrics_port,
            "Metrics endpoint started at http://0.0.0.0:{}/metrics",
            config.metrics_port
        );
    }

    Ok(())
}
