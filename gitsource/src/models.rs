//! Wire models for the captured VCS event stream.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationRecord {
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRecord {
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub is_private: Option<bool>,
    pub organization_uid: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BranchRecord {
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_default: Option<bool>,
    pub repository_uid: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub sha: String,
    #[serde(default)]
    pub message: Option<String>,
    pub committed_at: DateTime<Utc>,
    /// Additions/deletions payload, stored as-is.
    #[serde(default)]
    pub stats: Option<Value>,
    pub repository_uid: String,
    #[serde(default)]
    pub author_uid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PersonRecord {
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub emails: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TeamRecord {
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
    pub organization_uid: String,
    #[serde(default)]
    pub parent_team_uid: Option<String>,
}

/// One line of the captured stream.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum VcsEvent {
    Organization(OrganizationRecord),
    Repository(RepositoryRecord),
    Branch(BranchRecord),
    Commit(CommitRecord),
    Person(PersonRecord),
    Team(TeamRecord),
    BranchDeleted {
        uid: String,
        #[serde(rename = "deletedAt")]
        deleted_at: DateTime<Utc>,
    },
}

impl VcsEvent {
    /// Parses one NDJSON line.
    pub fn parse(line: &str) -> Result<VcsEvent> {
        Ok(serde_json::from_str(line)?)
    }
}
