//! Default implementation of [`LogStore`], reading the log straight from object storage

use bytes::Bytes;

use super::{LogStore, LogStoreConfig};
use crate::storage::StorageClient;
use crate::DeltaResult;

/// Default [`LogStore`] implementation
#[derive(Debug, Clone)]
pub struct DefaultLogStore {
    storage: StorageClient,
    config: LogStoreConfig,
}

impl DefaultLogStore {
    /// Create a new instance of [`DefaultLogStore`]
    ///
    /// # Arguments
    ///
    /// * `storage` - A client rooted at the table root, the parent of `_delta_log`.
    /// * `config` - The location and options `storage` was built from.
    pub fn new(storage: StorageClient, config: LogStoreConfig) -> Self {
        Self { storage, config }
    }
}

#[async_trait::async_trait]
impl LogStore for DefaultLogStore {
    fn name(&self) -> String {
        "DefaultLogStore".into()
    }

    fn storage(&self) -> &StorageClient {
        &self.storage
    }

    async fn read_commit_entry(&self, version: i64) -> DeltaResult<Option<Bytes>> {
        super::read_commit_entry(&self.storage, version).await
    }

    async fn get_latest_version(&self, current_version: i64) -> DeltaResult<i64> {
        super::get_latest_version(self, current_version).await
    }

    fn config(&self) -> &LogStoreConfig {
        &self.config
    }
}
