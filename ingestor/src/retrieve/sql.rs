use super::Retriever;
use crate::model::{format_context_rows, ContextRow, FormattedBatch};
use async_trait::async_trait;
use ingestor_core::config::SqlRetrievalConfig;
use ingestor_core::{Error, Result};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{Column, Connection, PgConnection, Row};
use tracing::{debug, instrument, warn};

pub struct SqlRetriever {
    options: PgConnectOptions,
    query: String,
    source_id: String,
}

impl SqlRetriever {
    pub fn new(config: &SqlRetrievalConfig) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&config.server)
            .database(&config.database);
        if let Some(port) = config.port {
            options = options.port(port);
        }
        let options = config.auth.apply_to_pg(options);

        let source_id = match config.port {
            Some(port) => format!("postgres://{}:{}/{}/{}", config.server, port, config.database, config.table),
            None => format!("postgres://{}/{}/{}", config.server, config.database, config.table),
        };

        Self {
            options,
            query: format!("SELECT * FROM {}", config.table.quoted()),
            source_id,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

#[async_trait]
impl Retriever for SqlRetriever {
    #[instrument(skip(self), fields(source = %self.source_id))]
    async fn retrieve(&self) -> Result<FormattedBatch> {
        let mut conn = PgConnection::connect_with(&self.options).await?;

        let fetched = sqlx::query(&self.query).fetch_all(&mut conn).await;

        // The connection never outlives the cycle, whatever the query did
        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close SQL connection cleanly");
        }

        let rows = fetched?
            .iter()
            .map(|row| decode_row(row, &self.source_id))
            .collect::<Result<Vec<_>>>()?;

        debug!(rows = rows.len(), "Fetched SQL rows");
        Ok(format_context_rows(&rows))
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }
}

/// Column names compared case-insensitively and without underscores, so
/// `ParticleSize` and `particle_size` both match.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn column_index(row: &PgRow, field: &str, source: &str) -> Result<usize> {
    let wanted = normalize(field);
    row.columns()
        .iter()
        .position(|column| normalize(column.name()) == wanted)
        .ok_or_else(|| Error::retrieval(source, format!("column '{field}' not found in result set")))
}

fn decode_row(row: &PgRow, source: &str) -> Result<ContextRow> {
    let country = row.try_get::<Option<String>, _>(column_index(row, "country", source)?)?;

    Ok(ContextRow {
        country,
        viscosity: decode_number(row, column_index(row, "viscosity", source)?)?,
        sweetness: decode_number(row, column_index(row, "sweetness", source)?)?,
        particle_size: decode_number(row, column_index(row, "particle_size", source)?)?,
        overall: decode_number(row, column_index(row, "overall", source)?)?,
    })
}

/// Accept double, real, integer and NUMERIC columns.
fn decode_number(row: &PgRow, index: usize) -> std::result::Result<Option<f64>, sqlx::Error> {
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return Ok(value);
    }
    if let Ok(value) = row.try_get::<Option<f32>, _>(index) {
        return Ok(value.map(widen_real));
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return Ok(value.map(|v| v as f64));
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(index) {
        return Ok(value.map(f64::from));
    }
    if let Ok(value) = row.try_get::<Option<i16>, _>(index) {
        return Ok(value.map(f64::from));
    }
    row.try_get::<Option<Decimal>, _>(index)
        .map(|value| value.and_then(decimal_to_f64))
}

/// Through the decimal text, so a REAL 0.51 stays 0.51 rather than
/// 0.5099999904632568.
fn widen_real(value: f32) -> f64 {
    value.to_string().parse().unwrap_or(f64::from(value))
}

fn decimal_to_f64(value: Decimal) -> Option<f64> {
    value.to_string().parse().ok()
}
