//! Log actions and the table schema.
//!
//! Each commit file under `_delta_log` holds one JSON encoded action per line. Replaying the
//! actions of all commits in version order yields the table state.

use serde::{Deserialize, Serialize};

pub(crate) mod actions;
pub mod schema;

pub use actions::*;
pub use schema::*;

/// One line of a commit file, or one row of a checkpoint
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// Table metadata
    #[serde(rename = "metaData")]
    Metadata(Metadata),
    /// Reader and writer requirements
    Protocol(Protocol),
    /// A data file joins the table
    Add(Add),
    /// A data file leaves the table
    Remove(Remove),
    /// Change data file, skipped by replay
    Cdc(AddCDCFile),
    /// Application progress marker
    Txn(Transaction),
    /// Commit provenance
    CommitInfo(CommitInfo),
    /// Named domain configuration, skipped by replay
    DomainMetadata(DomainMetadata),
    /// Header of a V2 checkpoint
    CheckpointMetadata(CheckpointMetadata),
    /// Reference to a sidecar file of a V2 checkpoint
    Sidecar(Sidecar),
}

impl Action {
    /// Keys of the actions known to this crate, as they appear in the log
    pub const KNOWN_KEYS: [&'static str; 10] = [
        "metaData",
        "protocol",
        "add",
        "remove",
        "cdc",
        "txn",
        "commitInfo",
        "domainMetadata",
        "checkpointMetadata",
        "sidecar",
    ];
}
