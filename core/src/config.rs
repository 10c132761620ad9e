use crate::auth::AuthStrategy;
use crate::backoff::RetryPolicy;
use crate::{Error, Result};
use config::{ConfigError, Environment, Source, Value};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Directory of configmap files, one setting per file
pub const CONFIGMAP_MOUNT_PATH: &str = "CONFIGMAP_MOUNT_PATH";
/// Directory of secret files, one setting per file
pub const SECRET_MOUNT_PATH: &str = "SECRET_MOUNT_PATH";

/// Raw settings as read from the layered sources, before validation.
///
/// Keys are the lowercase form of the environment variable names
/// (`HTTP_BASE_URL` -> `http_base_url`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub endpoint_type: Option<String>,
    pub auth_type: Option<String>,

    pub http_base_url: Option<String>,
    pub http_path: Option<String>,
    pub http_username: Option<String>,
    pub http_password: Option<String>,
    pub http_query_params: Option<String>,
    pub http_request_body: Option<String>,
    pub http_timeout_seconds: u64,

    pub sql_server_name: Option<String>,
    pub sql_db_name: Option<String>,
    pub sql_table_name: Option<String>,
    pub sql_username: Option<String>,
    pub sql_password: Option<String>,

    pub request_interval_seconds: u64,
    pub verify_round_trip: bool,

    pub dss_key: Option<String>,
    pub sink_type: String,
    pub state_store_url: Option<String>,
    pub connect_max_retries: u32,
    pub connect_retry_base_delay_ms: u64,

    pub mqtt_host: Option<String>,
    pub mqtt_port: Option<u16>,
    pub mqtt_client_id: Option<String>,
    pub mqtt_topic: Option<String>,
    pub use_tls: bool,
    pub ca_file_path: Option<String>,
    pub client_cert_file: Option<String>,
    pub client_key_file: Option<String>,
    pub client_key_password: Option<String>,
    pub sat_token_path: Option<String>,

    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint_type: None,
            auth_type: None,
            http_base_url: None,
            http_path: None,
            http_username: None,
            http_password: None,
            http_query_params: None,
            http_request_body: None,
            http_timeout_seconds: 100,
            sql_server_name: None,
            sql_db_name: None,
            sql_table_name: None,
            sql_username: None,
            sql_password: None,
            request_interval_seconds: 5,
            verify_round_trip: false,
            dss_key: None,
            sink_type: "state_store".to_string(),
            state_store_url: None,
            connect_max_retries: 5,
            connect_retry_base_delay_ms: 1000,
            mqtt_host: None,
            mqtt_port: None,
            mqtt_client_id: None,
            mqtt_topic: None,
            use_tls: false,
            ca_file_path: None,
            client_cert_file: None,
            client_key_file: None,
            client_key_password: None,
            sat_token_path: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

impl Settings {
    /// Layer defaults, the environment and any mounted directories.
    ///
    /// Mounted directories are applied in order, so later ones win; all of
    /// them override the environment.
    pub fn collect(env: Environment, mounts: &[PathBuf]) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load default configuration
        builder = builder.add_source(config::Config::try_from(&Settings::default())?);

        builder = builder.add_source(env);

        for mount in mounts {
            builder = builder.add_source(MountedDir::new(mount));
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }
}

/// A configmap or secret volume: every regular file is one key, named after
/// the file, holding the file content.
#[derive(Debug, Clone)]
pub struct MountedDir {
    path: PathBuf,
}

impl MountedDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Source for MountedDir {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> std::result::Result<config::Map<String, Value>, ConfigError> {
        let mut values = config::Map::new();
        let origin = self.path.display().to_string();

        let entries = fs::read_dir(&self.path).map_err(|e| {
            ConfigError::Message(format!("cannot read mounted configuration {origin}: {e}"))
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| ConfigError::Foreign(Box::new(e)))?;
            let name = entry.file_name().to_string_lossy().to_string();

            // Kubernetes keeps its bookkeeping in `..data` and friends
            if name.starts_with('.') {
                continue;
            }

            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let content = fs::read_to_string(&path).map_err(|e| ConfigError::Foreign(Box::new(e)))?;
            let content = content.trim_end_matches(['\n', '\r']).to_string();

            values.insert(name.to_ascii_lowercase(), Value::new(Some(&origin), content));
        }

        Ok(values)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub retrieval: RetrievalConfig,
    pub sink: SinkConfig,
    pub ingest: IngestConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Http,
    Sql,
}

impl FromStr for EndpointKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(EndpointKind::Http),
            "sql" => Ok(EndpointKind::Sql),
            other => Err(Error::Config(format!(
                "invalid ENDPOINT_TYPE '{other}', expected 'http' or 'sql'"
            ))),
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Http => write!(f, "http"),
            EndpointKind::Sql => write!(f, "sql"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RetrievalConfig {
    Http(HttpRetrievalConfig),
    Sql(SqlRetrievalConfig),
}

impl RetrievalConfig {
    pub fn kind(&self) -> EndpointKind {
        match self {
            RetrievalConfig::Http(_) => EndpointKind::Http,
            RetrievalConfig::Sql(_) => EndpointKind::Sql,
        }
    }

    pub fn auth(&self) -> &AuthStrategy {
        match self {
            RetrievalConfig::Http(http) => &http.auth,
            RetrievalConfig::Sql(sql) => &sql.auth,
        }
    }
}

#[derive(Clone)]
pub struct HttpRetrievalConfig {
    pub base_url: Url,
    pub path: Option<String>,
    pub query_params: Vec<(String, String)>,
    pub request_body: Option<String>,
    pub timeout: Duration,
    pub auth: AuthStrategy,
}

impl fmt::Debug for HttpRetrievalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRetrievalConfig")
            .field("base_url", &redact_url(self.base_url.as_str()))
            .field("path", &self.path)
            .field("query_params", &self.query_params)
            .field("request_body", &self.request_body.as_ref().map(|body| body.len()))
            .field("timeout", &self.timeout)
            .field("auth", &self.auth)
            .finish()
    }
}

impl HttpRetrievalConfig {
    /// The resolved request URL, with `path` joined onto `base_url`.
    pub fn endpoint(&self) -> Result<Url> {
        match self.path.as_deref() {
            None => Ok(self.base_url.clone()),
            Some(path) => self.base_url.join(path).map_err(|e| {
                Error::Config(format!("HTTP_PATH '{path}' cannot be joined to HTTP_BASE_URL: {e}"))
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlRetrievalConfig {
    pub server: String,
    pub port: Option<u16>,
    pub database: String,
    pub table: TableName,
    pub auth: AuthStrategy,
}

/// A plain or schema-qualified SQL table identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.trim().split('.').collect();
        for part in &parts {
            if !is_identifier(part) {
                return Err(Error::Config(format!(
                    "SQL_TABLE_NAME '{raw}' is not a valid table identifier"
                )));
            }
        }

        match parts.as_slice() {
            [name] => Ok(Self {
                schema: None,
                name: name.to_string(),
            }),
            [schema, name] => Ok(Self {
                schema: Some(schema.to_string()),
                name: name.to_string(),
            }),
            _ => Err(Error::Config(format!(
                "SQL_TABLE_NAME '{raw}' has too many qualifiers"
            ))),
        }
    }

    /// Double-quoted form, safe to splice into a statement.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{schema}\".\"{}\"", self.name),
            None => format!("\"{}\"", self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// State store key, or topic for the MQTT sink
    pub key: String,
    pub target: SinkTarget,
    /// Applies to the initial connection only
    pub connect_retry: RetryPolicy,
}

#[derive(Clone)]
pub enum SinkTarget {
    StateStore { url: String },
    Mqtt(MqttConfig),
}

impl fmt::Debug for SinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkTarget::StateStore { url } => f
                .debug_struct("StateStore")
                .field("url", &redact_url(url))
                .finish(),
            SinkTarget::Mqtt(mqtt) => f.debug_tuple("Mqtt").field(mqtt).finish(),
        }
    }
}

/// Strip any password from a connection URL before it reaches a log line.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("redacted"));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub client_id: String,
    pub use_tls: bool,
    pub ca_file: Option<PathBuf>,
    pub client_cert_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
    pub sat_token_path: Option<PathBuf>,
}

impl MqttConfig {
    pub fn port(&self) -> u16 {
        match (self.port, self.use_tls) {
            (Some(port), _) => port,
            (None, true) => 8883,
            (None, false) => 1883,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub interval: Duration,
    pub verify_round_trip: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            log_level: settings.log_level,
            log_format: settings.log_format,
            metrics_enabled: settings.metrics_enabled,
            metrics_port: settings.metrics_port,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    /// Read the process environment plus the configmap/secret mounts named by
    /// `CONFIGMAP_MOUNT_PATH` and `SECRET_MOUNT_PATH`.
    pub fn load() -> Result<Self> {
        let mounts: Vec<PathBuf> = [CONFIGMAP_MOUNT_PATH, SECRET_MOUNT_PATH]
            .iter()
            .filter_map(std::env::var_os)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .collect();

        let settings = Settings::collect(Environment::default(), &mounts)?;
        Config::from_settings(settings)
    }

    /// Same as [`Config::load`] but with an explicit environment, for tests
    /// and embedding.
    pub fn from_sources(env: config::Map<String, String>, mounts: &[PathBuf]) -> Result<Self> {
        let settings = Settings::collect(Environment::default().source(Some(env)), mounts)?;
        Config::from_settings(settings)
    }

    pub fn from_settings(settings: Settings) -> Result<Self> {
        let kind: EndpointKind = required(&settings.endpoint_type, "ENDPOINT_TYPE")?.parse()?;

        let retrieval = match kind {
            EndpointKind::Http => RetrievalConfig::Http(http_config(&settings)?),
            EndpointKind::Sql => RetrievalConfig::Sql(sql_config(&settings)?),
        };

        let sink = sink_config(&settings)?;

        if settings.request_interval_seconds == 0 {
            return Err(Error::Config(
                "REQUEST_INTERVAL_SECONDS must be greater than 0".into(),
            ));
        }

        let ingest = IngestConfig {
            interval: Duration::from_secs(settings.request_interval_seconds),
            verify_round_trip: settings.verify_round_trip,
        };

        let telemetry = TelemetryConfig {
            log_level: settings.log_level,
            log_format: settings.log_format,
            metrics_enabled: settings.metrics_enabled,
            metrics_port: settings.metrics_port,
        };

        Ok(Self {
            retrieval,
            sink,
            ingest,
            telemetry,
        })
    }
}

fn http_config(settings: &Settings) -> Result<HttpRetrievalConfig> {
    let raw_url = required(&settings.http_base_url, "HTTP_BASE_URL")?;
    let base_url = Url::parse(raw_url)
        .map_err(|e| Error::Config(format!("HTTP_BASE_URL '{raw_url}' is invalid: {e}")))?;

    let auth = AuthStrategy::from_parts(
        settings.auth_type.as_deref(),
        settings.http_username.as_deref(),
        settings.http_password.as_deref(),
        "HTTP",
    )?;

    if settings.http_timeout_seconds == 0 {
        return Err(Error::Config("HTTP_TIMEOUT_SECONDS must be greater than 0".into()));
    }

    let config = HttpRetrievalConfig {
        base_url,
        path: optional(&settings.http_path).map(str::to_string),
        query_params: settings
            .http_query_params
            .as_deref()
            .map(parse_query_params)
            .unwrap_or_default(),
        request_body: optional(&settings.http_request_body).map(str::to_string),
        timeout: Duration::from_secs(settings.http_timeout_seconds),
        auth,
    };

    // Surface a bad path at startup rather than on the first cycle
    config.endpoint()?;
    Ok(config)
}

fn sql_config(settings: &Settings) -> Result<SqlRetrievalConfig> {
    let (server, port) = parse_server(required(&settings.sql_server_name, "SQL_SERVER_NAME")?)?;
    let database = required(&settings.sql_db_name, "SQL_DB_NAME")?.to_string();
    let table = TableName::parse(required(&settings.sql_table_name, "SQL_TABLE_NAME")?)?;

    let auth = AuthStrategy::from_parts(
        settings.auth_type.as_deref(),
        settings.sql_username.as_deref(),
        settings.sql_password.as_deref(),
        "SQL",
    )?;

    Ok(SqlRetrievalConfig {
        server,
        port,
        database,
        table,
        auth,
    })
}

fn sink_config(settings: &Settings) -> Result<SinkConfig> {
    let dss_key = optional(&settings.dss_key);

    let (key, target) = match settings.sink_type.trim().to_ascii_lowercase().as_str() {
        "state_store" | "statestore" | "dss" => {
            let key = dss_key.ok_or_else(|| {
                Error::Config("DSS_KEY is required for the state store sink".into())
            })?;
            let url = required(&settings.state_store_url, "STATE_STORE_URL")?.to_string();
            (key.to_string(), SinkTarget::StateStore { url })
        }
        "mqtt" => {
            let topic = optional(&settings.mqtt_topic).or(dss_key).ok_or_else(|| {
                Error::Config("MQTT_TOPIC or DSS_KEY is required for the MQTT sink".into())
            })?;
            (topic.to_string(), SinkTarget::Mqtt(mqtt_config(settings)?))
        }
        other => {
            return Err(Error::Config(format!(
                "invalid SINK_TYPE '{other}', expected 'state_store' or 'mqtt'"
            )))
        }
    };

    Ok(SinkConfig {
        key,
        target,
        connect_retry: RetryPolicy::new(
            settings.connect_max_retries,
            Duration::from_millis(settings.connect_retry_base_delay_ms),
        ),
    })
}

fn mqtt_config(settings: &Settings) -> Result<MqttConfig> {
    let host = required(&settings.mqtt_host, "MQTT_HOST")?.to_string();
    let client_id = optional(&settings.mqtt_client_id)
        .map(str::to_string)
        .unwrap_or_else(|| format!("contextual-ingestor-{}", uuid::Uuid::new_v4()));

    let ca_file = optional(&settings.ca_file_path).map(PathBuf::from);
    let client_cert_file = optional(&settings.client_cert_file).map(PathBuf::from);
    let client_key_file = optional(&settings.client_key_file).map(PathBuf::from);

    if settings.use_tls && ca_file.is_none() {
        return Err(Error::Config(
            "USE_TLS is set but CA_FILE_PATH is not".into(),
        ));
    }

    match (&client_cert_file, &client_key_file) {
        (Some(_), Some(_)) if !settings.use_tls => {
            return Err(Error::Config(
                "X509 authentication is configured but USE_TLS is disabled".into(),
            ));
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(Error::Config(
                "CLIENT_CERT_FILE and CLIENT_KEY_FILE must be set together".into(),
            ));
        }
        _ => {}
    }

    if optional(&settings.client_key_password).is_some() {
        return Err(Error::Config(
            "CLIENT_KEY_PASSWORD is set but encrypted client keys are not supported; provide an unencrypted PEM key".into(),
        ));
    }

    Ok(MqttConfig {
        host,
        port: settings.mqtt_port,
        client_id,
        use_tls: settings.use_tls,
        ca_file,
        client_cert_file,
        client_key_file,
        sat_token_path: optional(&settings.sat_token_path).map(PathBuf::from),
    })
}

fn optional(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    optional(value).ok_or_else(|| Error::Config(format!("{name} is required")))
}

/// `host`, `host:port` or `host,port`.
fn parse_server(raw: &str) -> Result<(String, Option<u16>)> {
    let split = raw.rsplit_once(',').or_else(|| raw.rsplit_once(':'));
    match split {
        Some((host, port)) => {
            let port = port.trim().parse::<u16>().map_err(|_| {
                Error::Config(format!("SQL_SERVER_NAME '{raw}' has an invalid port"))
            })?;
            Ok((host.trim().to_string(), Some(port)))
        }
        None => Ok((raw.to_string(), None)),
    }
}

fn parse_query_params(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Check that a configured file exists before anything tries to read it.
pub fn ensure_file(path: &Path, setting: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{setting} points to {}, which is not a readable file",
            path.display()
        )))
    }
}
