//! Delta transaction log protocol: checkpoint discovery and reading.

use std::str::Utf8Error;

use object_store::path::Path;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::logstore::LogStore;
use crate::storage::StorageClient;
use crate::{DeltaResult, DeltaTableError};

pub mod checkpoints;
pub(crate) mod parquet_read;

pub use checkpoints::{Checkpoint, CheckpointKind};

const LAST_CHECKPOINT_FILE_NAME: &str = "_last_checkpoint";

/// Delta log protocol errors
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// There is no `_last_checkpoint` hint
    #[error("End of transaction log")]
    CheckpointNotFound,

    /// A field of a checkpoint row has an unexpected type
    #[error("Invalid action field: {0}")]
    InvalidField(String),

    /// A checkpoint row does not hold an action
    #[error("Invalid action in parquet row: {0}")]
    InvalidRow(String),

    /// A data file path is not valid percent encoded utf-8
    #[error("Invalid file path: {source}")]
    InvalidPath {
        /// Decoding error
        #[from]
        source: Utf8Error,
    },

    /// Reading a log object failed
    #[error("Failed to read the transaction log: {source}")]
    Storage {
        /// Error of the storage layer
        source: Box<DeltaTableError>,
    },
}

/// Content of the `_delta_log/_last_checkpoint` hint
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckPoint {
    /// Delta table version
    pub version: i64,
    /// The number of actions in the checkpoint
    pub size: i64,
    /// The number of fragments if the last checkpoint was written in multiple parts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts: Option<u32>,
    /// Size of the checkpoint in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_in_bytes: Option<i64>,
    /// Number of add actions in the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_of_add_files: Option<i64>,
}

impl CheckPoint {
    /// Creates a new checkpoint hint for `version`
    pub fn new(version: i64, size: i64, parts: Option<u32>) -> Self {
        Self {
            version,
            size,
            parts,
            size_in_bytes: None,
            num_of_add_files: None,
        }
    }
}

/// Read the `_last_checkpoint` hint of the table.
///
/// Fails with [`ProtocolError::CheckpointNotFound`] when there is no hint.
pub async fn get_last_checkpoint(log_store: &dyn LogStore) -> Result<CheckPoint, ProtocolError> {
    read_last_checkpoint(log_store.storage(), log_store.log_path())
        .await
        .map_err(|err| ProtocolError::Storage {
            source: Box::new(err),
        })?
        .ok_or(ProtocolError::CheckpointNotFound)
}

/// Try reading the `_last_checkpoint` file.
///
/// A missing file and invalid JSON both yield `None`: the hint is an optimization and a
/// listing of the log finds the same checkpoints.
pub async fn read_last_checkpoint(
    storage: &StorageClient,
    log_path: &Path,
) -> DeltaResult<Option<CheckPoint>> {
    let file_path = log_path.child(LAST_CHECKPOINT_FILE_NAME);
    let data = match storage.get(&file_path).await {
        Ok(data) => data,
        Err(DeltaTableError::ObjectStore {
            source: object_store::Error::NotFound { .. },
        }) => return Ok(None),
        Err(err) => return Err(err),
    };
    Ok(serde_json::from_slice(&data)
        .inspect_err(|e| warn!("invalid _last_checkpoint JSON: {e}"))
        .ok())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use object_store::memory::InMemory;
    use object_store::{ObjectStore, PutPayload};

    use super::*;
    use crate::logstore::{logstore_with, StorageConfig};
    use crate::storage::TableLocation;

    #[tokio::test]
    async fn test_read_last_checkpoint() {
        let store = Arc::new(InMemory::new());
        let log_store = logstore_with(
            store.clone(),
            TableLocation::parse("memory:///").unwrap(),
            StorageConfig::default(),
        );
        assert!(matches!(
            get_last_checkpoint(log_store.as_ref()).await,
            Err(ProtocolError::CheckpointNotFound)
        ));

        let path = Path::from("_delta_log/_last_checkpoint");
        store
            .put(&path, PutPayload::from_static(b"{\"version\":10,\"size\":13,\"parts\":2}"))
            .await
            .unwrap();
        let hint = get_last_checkpoint(log_store.as_ref()).await.unwrap();
        assert_eq!(hint, CheckPoint::new(10, 13, Some(2)));

        // a truncated hint is ignored
        store
            .put(&path, PutPayload::from_static(b"{\"version\":1"))
            .await
            .unwrap();
        assert!(matches!(
            get_last_checkpoint(log_store.as_ref()).await,
            Err(ProtocolError::CheckpointNotFound)
        ));
    }
}
