//! Backend transport: the trait the engine talks through and a
//! GraphQL-over-HTTP implementation of it.

use crate::config::SinkConfig;
use crate::errors::{Result, SinkError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Header carrying the admin secret on every request.
const ADMIN_SECRET_HEADER: &str = "x-hasura-admin-secret";
/// Header carrying the write session id on sweep deletions.
const WRITE_SESSION_HEADER: &str = "x-write-session";

const HEALTH_QUERY: &str = "query { __typename }";

/// Response envelope returned by the graph backend.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct GraphResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<GraphResponseError>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct GraphResponseError {
    pub message: String,
    #[serde(default)]
    pub extensions: Option<Value>,
}

impl GraphResponse {
    /// Collapses backend errors into one message, if any were reported.
    pub fn error_message(&self) -> Option<String> {
        let errors = self.errors.as_ref()?;
        if errors.is_empty() {
            return None;
        }
        Some(
            errors
                .iter()
                .map(|error| error.message.clone())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Transport seam between the sink and a graph backend.
#[async_trait]
pub trait GraphClient: Send + Sync {
    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<()>;

    /// Posts one GraphQL document and returns the parsed envelope.
    async fn post_query(&self, query: &str) -> Result<GraphResponse>;

    /// Whether the backend accepts a write session id alongside mutations.
    fn supports_write_sessions(&self) -> bool {
        false
    }

    /// Posts a mutation, attaching `session` when the backend supports it.
    async fn post_mutation(&self, query: &str, session: Option<&str>) -> Result<GraphResponse> {
        let _ = session;
        self.post_query(query).await
    }
}

/// GraphQL-over-HTTP client for a Hasura-style backend.
pub struct HttpGraphClient {
    http: reqwest::Client,
    endpoint: String,
    admin_secret: Option<String>,
}

impl HttpGraphClient {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            admin_secret: config.admin_secret.clone(),
        })
    }

    async fn post(&self, query: &str, session: Option<&str>) -> Result<GraphResponse> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({ "query": query }));
        if let Some(secret) = &self.admin_secret {
            request = request.header(ADMIN_SECRET_HEADER, secret);
        }
        if let Some(session) = session {
            request = request.header(WRITE_SESSION_HEADER, session);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SinkError::Backend {
                message: format!(
                    "HTTP {}: {}",
                    response.status(),
                    response.text().await.unwrap_or_default()
                ),
                query: query.to_string(),
            });
        }
        Ok(response.json::<GraphResponse>().await?)
    }
}

#[async_trait]
impl GraphClient for HttpGraphClient {
    async fn health_check(&self) -> Result<()> {
        let response = self.post(HEALTH_QUERY, None).await?;
        if let Some(message) = response.error_message() {
            return Err(SinkError::Backend {
                message,
                query: HEALTH_QUERY.to_string(),
            });
        }
        Ok(())
    }

    async fn post_query(&self, query: &str) -> Result<GraphResponse> {
        self.post(query, None).await
    }

    fn supports_write_sessions(&self) -> bool {
        true
    }

    async fn post_mutation(&self, query: &str, session: Option<&str>) -> Result<GraphResponse> {
        self.post(query, session).await
    }
}
