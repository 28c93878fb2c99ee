//! Converts VCS events into graph entries.
//!
//! Flat `*Uid` wire fields become nested reference stubs so the sink can
//! link rows across models without the stream carrying backend ids.

use crate::models::VcsEvent;
use graphsink::convert::{Converter, SourceEntry};
use graphsink::errors::Result;
use graphsink::models::TimestampedRecord;
use serde_json::{Map, Value, json};

pub struct VcsConverter;

impl Converter for VcsConverter {
    fn name(&self) -> &'static str {
        "vcs"
    }

    fn convert(&self, raw: &Value) -> Result<Vec<SourceEntry>> {
        let event: VcsEvent = serde_json::from_value(raw.clone())?;
        let entry = match event {
            VcsEvent::Organization(org) => record(
                "organization",
                json!({
                    "uid": org.uid,
                    "name": org.name,
                }),
            ),
            VcsEvent::Repository(repo) => record(
                "repository",
                json!({
                    "uid": repo.uid,
                    "name": repo.name,
                    "description": repo.description,
                    "topics": repo.topics,
                    "isPrivate": repo.is_private,
                    "organization": { "uid": repo.organization_uid },
                }),
            ),
            VcsEvent::Branch(branch) => record(
                "branch",
                json!({
                    "uid": branch.uid,
                    "name": branch.name,
                    "isDefault": branch.is_default,
                    "repository": { "uid": branch.repository_uid },
                }),
            ),
            VcsEvent::Commit(commit) => {
                let mut fields = object(json!({
                    "sha": commit.sha,
                    "message": commit.message,
                    "committedAt": commit.committed_at,
                    "stats": commit.stats,
                    "repository": { "uid": commit.repository_uid },
                }));
                // an absent author is unknown, not authorless; the link is
                // left untouched instead of being cleared
                if let Some(author) = &commit.author_uid {
                    fields.insert("author".to_string(), json!({ "uid": author }));
                }
                SourceEntry::Record {
                    model: "commit".to_string(),
                    record: fields,
                }
            }
            VcsEvent::Person(person) => record(
                "person",
                json!({
                    "uid": person.uid,
                    "name": person.name,
                    "emails": person.emails,
                }),
            ),
            VcsEvent::Team(team) => {
                // a team without a parent is a hierarchy root; the pointer
                // is cleared with an explicit null
                let parent = team.parent_team_uid.as_ref().map(|uid| json!({ "uid": uid }));
                record(
                    "team",
                    json!({
                        "uid": team.uid,
                        "name": team.name,
                        "organization": { "uid": team.organization_uid },
                        "parentTeam": parent,
                    }),
                )
            }
            VcsEvent::BranchDeleted { uid, deleted_at } => {
                SourceEntry::Timestamped(TimestampedRecord::Deletion {
                    at: deleted_at,
                    model: "branch".to_string(),
                    where_clause: object(json!({ "uid": uid })),
                })
            }
        };
        Ok(vec![entry])
    }
}

fn record(model: &str, value: Value) -> SourceEntry {
    SourceEntry::Record {
        model: model.to_string(),
        record: object(value),
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
