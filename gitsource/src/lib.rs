pub mod convert;
pub mod error;
pub mod models;

pub use convert::VcsConverter;

use graphsink::schema::SchemaView;

/// Model definitions for the VCS mirror, embedded at build time.
pub const VCS_SCHEMA_JSON: &str = include_str!("../schema/vcs.json");

/// Loads the embedded VCS schema.
pub fn vcs_schema() -> error::Result<SchemaView> {
    Ok(SchemaView::from_json(VCS_SCHEMA_JSON)?)
}
