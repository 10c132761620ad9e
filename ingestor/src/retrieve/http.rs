use super::Retriever;
use crate::model::{FormattedBatch, Record, MAX_HTTP_RECORD_FIELDS};
use async_trait::async_trait;
use ingestor_core::config::HttpRetrievalConfig;
use ingestor_core::{AuthStrategy, Error, Result};
use reqwest::header::ACCEPT;
use reqwest::{Client, Url};
use serde_json::Value;
use tracing::{debug, instrument};

pub struct HttpRetriever {
    client: Client,
    endpoint: Url,
    source_id: String,
    query_params: Vec<(String, String)>,
    request_body: Option<String>,
    auth: AuthStrategy,
}

impl HttpRetriever {
    pub fn new(config: &HttpRetrievalConfig) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            source_id: endpoint.to_string(),
            endpoint,
            query_params: config.query_params.clone(),
            request_body: config.request_body.clone(),
            auth: config.auth.clone(),
        })
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    #[instrument(skip(self), fields(endpoint = %self.source_id))]
    async fn retrieve(&self) -> Result<FormattedBatch> {
        let mut request = self
            .auth
            .apply(self.client.get(self.endpoint.clone()))
            .header(ACCEPT, "application/json");

        if !self.query_params.is_empty() {
            request = request.query(&self.query_params);
        }
        if let Some(body) = &self.request_body {
            request = request.body(body.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                endpoint: self.source_id.clone(),
            });
        }

        let body = response.text().await?;
        let batch = format_json_batch(&body, &self.source_id)?;

        debug!(bytes = batch.len(), "Fetched HTTP batch");
        Ok(batch)
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }
}

/// Turn a JSON array of objects into a batch, keeping the first
/// [`MAX_HTTP_RECORD_FIELDS`] properties of each object.
pub fn format_json_batch(body: &str, endpoint: &str) -> Result<FormattedBatch> {
    let Value::Array(elements) = serde_json::from_str::<Value>(body)? else {
        return Err(Error::retrieval(endpoint, "expected a JSON array response"));
    };

    let records = elements
        .iter()
        .enumerate()
        .map(|(index, element)| match element {
            Value::Object(object) => Ok(Record::from_json_object(object, MAX_HTTP_RECORD_FIELDS)),
            _ => Err(Error::retrieval(
                endpoint,
                format!("array element {index} is not a JSON object"),
            )),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(FormattedBatch::from_records(&records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::time::Duration;

    const CONTEXTS: &str = r#"[
        {"country": "us", "viscosity": 0.5, "sweetness": 0.8, "particle_size": 0.7, "overall": 0.4},
        {"country": "uk", "viscosity": 0.51, "sweetness": 0.81, "particle_size": 0.71, "overall": 0.41}
    ]"#;

    fn config(base_url: &str, auth: AuthStrategy) -> HttpRetrievalConfig {
        HttpRetrievalConfig {
            base_url: Url::parse(base_url).unwrap(),
            path: Some("contexts/quality".to_string()),
            query_params: vec![],
            request_body: None,
            timeout: Duration::from_secs(5),
            auth,
        }
    }

    #[test]
    fn formats_array_of_objects() {
        let batch = format_json_batch(CONTEXTS, "test").unwrap();

        assert_eq!(
            batch.as_str(),
            "country: us\nviscosity: 0.5\nsweetness: 0.8\nparticle_size: 0.7\n\n\
             country: uk\nviscosity: 0.51\nsweetness: 0.81\nparticle_size: 0.71"
        );
    }

    #[test]
    fn empty_array_is_empty_string() {
        assert_eq!(format_json_batch("[]", "test").unwrap().as_str(), "");
    }

    #[test]
    fn rejects_non_array_payloads() {
        let err = format_json_batch(r#"{"country": "uk"}"#, "http://backend/x").unwrap_err();
        assert_eq!(err.category(), "retrieval");

        assert!(format_json_batch(r#"[1, 2]"#, "test").is_err());
        assert!(format_json_batch("not json", "test").is_err());
    }

    proptest! {
        #[test]
        fn one_block_per_element_with_at_most_four_lines(
            objects in prop::collection::vec(
                prop::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 1..8),
                0..6,
            )
        ) {
            let array: Vec<Value> = objects
                .iter()
                .map(|fields| {
                    Value::Object(
                        fields
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                            .collect(),
                    )
                })
                .collect();
            let body = serde_json::to_string(&array).unwrap();

            let batch = format_json_batch(&body, "prop").unwrap();

            if objects.is_empty() {
                prop_assert!(batch.is_empty());
            } else {
                let blocks: Vec<&str> = batch.as_str().split("\n\n").collect();
                prop_assert_eq!(blocks.len(), objects.len());
                for (block, fields) in blocks.iter().zip(&objects) {
                    let lines = block.lines().count();
                    prop_assert!(lines <= MAX_HTTP_RECORD_FIELDS);
                    prop_assert_eq!(lines, fields.len().min(MAX_HTTP_RECORD_FIELDS));
                }
            }
        }
    }

    #[tokio::test]
    async fn retrieves_with_basic_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/contexts/quality")
            .match_header("authorization", "Basic dTpw")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(CONTEXTS)
            .create_async()
            .await;

        let auth = AuthStrategy::Basic {
            username: "u".into(),
            password: "p".into(),
        };
        let retriever = HttpRetriever::new(&config(&server.url(), auth)).unwrap();

        let batch = retriever.retrieve().await.unwrap();

        mock.assert_async().await;
        assert!(batch.as_str().starts_with("country: us\n"));
        assert_eq!(batch.as_str().split("\n\n").count(), 2);
    }

    #[tokio::test]
    async fn non_success_status_is_a_retrieval_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/contexts/quality")
            .with_status(401)
            .with_body(r#"{"error": "Unauthorized"}"#)
            .create_async()
            .await;

        let retriever = HttpRetriever::new(&config(&server.url(), AuthStrategy::None)).unwrap();

        match retriever.retrieve().await {
            Err(Error::HttpStatus { status, endpoint }) => {
                assert_eq!(status, 401);
                assert!(endpoint.ends_with("/contexts/quality"));
            }
            other => panic!("expected an HTTP status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sends_configured_query_parameters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/contexts/quality")
            .match_query(mockito::Matcher::UrlEncoded("site".into(), "berlin".into()))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let mut config = config(&server.url(), AuthStrategy::None);
        config.query_params = vec![("site".into(), "berlin".into())];
        let retriever = HttpRetriever::new(&config).unwrap();

        assert!(retriever.retrieve().await.unwrap().is_empty());
        mock.assert_async().await;
    }
}
