use async_trait::async_trait;
use graphsink::client::{GraphClient, GraphResponse};
use graphsink::config::SinkConfig;
use graphsink::errors::Result;
use graphsink::schema::SchemaView;
use serde_json::{Map, Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct PostedQuery {
    pub query: String,
    pub session: Option<String>,
}

/// Scripted backend double: records every posted document and answers from
/// a queue of canned responses. Unscripted calls get an empty envelope.
pub struct RecordingClient {
    queries: Mutex<Vec<PostedQuery>>,
    script: Mutex<VecDeque<GraphResponse>>,
    supports_sessions: bool,
}

#[allow(dead_code)]
impl RecordingClient {
    pub fn new() -> Self {
        Self {
            queries: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            supports_sessions: false,
        }
    }

    pub fn with_sessions() -> Self {
        Self {
            supports_sessions: true,
            ..Self::new()
        }
    }

    pub fn push_response(&self, body: Value) {
        let response: GraphResponse =
            serde_json::from_value(body).expect("scripted response must be a valid envelope");
        self.script.lock().unwrap().push_back(response);
    }

    pub fn queries(&self) -> Vec<PostedQuery> {
        self.queries.lock().unwrap().clone()
    }

    fn answer(&self, query: &str, session: Option<&str>) -> GraphResponse {
        self.queries.lock().unwrap().push(PostedQuery {
            query: query.to_string(),
            session: session.map(str::to_string),
        });
        self.script.lock().unwrap().pop_front().unwrap_or_default()
    }
}

#[async_trait]
impl GraphClient for RecordingClient {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn post_query(&self, query: &str) -> Result<GraphResponse> {
        Ok(self.answer(query, None))
    }

    fn supports_write_sessions(&self) -> bool {
        self.supports_sessions
    }

    async fn post_mutation(&self, query: &str, session: Option<&str>) -> Result<GraphResponse> {
        Ok(self.answer(query, session))
    }
}

/// Four-model schema exercising references, back references, and a
/// self-referential hierarchy.
#[allow(dead_code)]
pub fn vcs_schema() -> SchemaView {
    SchemaView::from_json(
        r#"{
        "models": {
            "organization": {
                "table": "organization",
                "primaryKeys": ["uid"],
                "scalars": {
                    "uid": "text",
                    "name": "text",
                    "origin": "text",
                    "refreshedAt": "timestamptz"
                },
                "backReferences": ["repositories"]
            },
            "repository": {
                "table": "repository",
                "primaryKeys": ["uid"],
                "scalars": {
                    "uid": "text",
                    "name": "text",
                    "organizationId": "uuid",
                    "origin": "text",
                    "refreshedAt": "timestamptz"
                },
                "references": {
                    "organization": { "model": "organization", "column": "organizationId" }
                },
                "backReferences": ["branches"]
            },
            "branch": {
                "table": "branch",
                "primaryKeys": ["uid"],
                "scalars": {
                    "uid": "text",
                    "name": "text",
                    "repositoryId": "uuid",
                    "origin": "text",
                    "refreshedAt": "timestamptz"
                },
                "references": {
                    "repository": { "model": "repository", "column": "repositoryId" }
                }
            },
            "team": {
                "table": "team",
                "primaryKeys": ["uid"],
                "scalars": {
                    "uid": "text",
                    "name": "text",
                    "parentTeamId": "uuid",
                    "origin": "text",
                    "refreshedAt": "timestamptz"
                },
                "references": {
                    "parentTeam": { "model": "team", "column": "parentTeamId" }
                }
            }
        }
    }"#,
    )
    .expect("test schema must load")
}

#[allow(dead_code)]
pub fn test_config() -> SinkConfig {
    let mut config = SinkConfig::new("http://localhost:8080/v1/graphql");
    config.upsert_batch_size = 100;
    config.write_batch_size = 100;
    config.reset_page_size = 3;
    config
}

/// Response envelope for a bulk upsert into `table`.
#[allow(dead_code)]
pub fn upsert_returning(table: &str, rows: Value) -> Value {
    let mut payload = Map::new();
    payload.insert("returning".to_string(), rows);
    let mut data = Map::new();
    data.insert(format!("insert_{table}"), Value::Object(payload));
    json!({ "data": data })
}

#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
