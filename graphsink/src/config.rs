use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct SinkConfig {
    /// GraphQL endpoint of the backing graph service.
    pub endpoint: String,
    /// Admin secret attached to every request when present.
    #[serde(default)]
    pub admin_secret: Option<String>,
    /// Buffered row count per model that triggers a flush.
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
    /// Queued update/deletion count that triggers a flush.
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,
    /// Rows fetched and deleted per page during a reset sweep.
    #[serde(default = "default_reset_page_size")]
    pub reset_page_size: usize,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_upsert_batch_size() -> usize {
    1000
}

fn default_write_batch_size() -> usize {
    500
}

fn default_reset_page_size() -> usize {
    500
}

fn default_timeout_secs() -> u64 {
    60
}

impl SinkConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            admin_secret: None,
            upsert_batch_size: default_upsert_batch_size(),
            write_batch_size: default_write_batch_size(),
            reset_page_size: default_reset_page_size(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_admin_secret(mut self, secret: impl Into<String>) -> Self {
        self.admin_secret = Some(secret.into());
        self
    }
}
