//! Delta Table read implementation

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use tracing::{debug, info};

use self::builder::DeltaTableConfig;
use crate::kernel::snapshot::log_segment::PathExt;
use crate::kernel::{Action, CommitInfo, Metadata, Protocol, Snapshot, StructType, Transaction};
use crate::logstore::{get_actions, LogStoreRef};
use crate::storage::ObjectStoreRef;
use crate::{DeltaResult, DeltaTableError};

pub mod builder;

/// In memory representation of a Delta Table
///
/// The loaded state is an immutable [`Snapshot`]. Every load builds a new snapshot in isolation
/// and publishes it with a single swap: a failed or cancelled load leaves the previous state in
/// place, and callers holding an `Arc<Snapshot>` keep a consistent view across reloads.
pub struct DeltaTable {
    /// The state of the table as of the most recent loaded Delta log entry.
    state: RwLock<Option<Arc<Snapshot>>>,
    /// the load options used during load
    config: DeltaTableConfig,
    /// log store
    log_store: LogStoreRef,
}

impl DeltaTable {
    /// Create a new Delta Table struct without loading any data from backing storage.
    ///
    /// NOTE: This is for advanced users. If you don't know why you need to use this method, please
    /// call one of the `open_table` helper methods instead.
    pub fn new(log_store: LogStoreRef, config: DeltaTableConfig) -> Self {
        Self {
            state: RwLock::new(None),
            log_store,
            config,
        }
    }

    /// get a shared reference to the delta object store
    pub fn object_store(&self) -> ObjectStoreRef {
        self.log_store.storage().object_store()
    }

    /// Check if the [`DeltaTable`] exists
    pub async fn verify_deltatable_existence(&self) -> DeltaResult<bool> {
        self.log_store.is_delta_table_location().await
    }

    /// The URI of the underlying data
    pub fn table_uri(&self) -> String {
        self.log_store.root_uri()
    }

    /// get a shared reference to the log store
    pub fn log_store(&self) -> LogStoreRef {
        self.log_store.clone()
    }

    /// The load options of this table
    pub fn config(&self) -> &DeltaTableConfig {
        &self.config
    }

    /// returns the latest available version of the table
    pub async fn get_latest_version(&self) -> DeltaResult<i64> {
        let current = self.loaded().map_or(-1, |s| s.version());
        self.log_store.get_latest_version(current).await
    }

    /// Currently loaded version of the table.
    ///
    /// Fails with [`DeltaTableError::NotLoaded`] before the first successful load.
    pub fn version(&self) -> DeltaResult<i64> {
        Ok(self.snapshot()?.version())
    }

    /// Load DeltaTable with data from latest checkpoint
    ///
    /// If a concurrent load already published a newer version, that version is kept.
    pub async fn load(&self) -> DeltaResult<()> {
        let snapshot = Snapshot::try_new(self.log_store.as_ref(), self.config.clone(), None).await?;
        self.publish_if_newer(snapshot);
        Ok(())
    }

    /// Updates the DeltaTable to the most recent state committed to the transaction log by
    /// incrementally applying each version since the loaded one.
    pub async fn update(&self) -> DeltaResult<()> {
        self.update_incremental(None).await
    }

    /// Updates the DeltaTable to `max_version`, or the latest version, by incrementally
    /// applying newer versions on top of the loaded state.
    ///
    /// Loads the table from scratch if nothing is loaded yet, or if the commits following the
    /// loaded version are no longer in the log.
    pub async fn update_incremental(&self, max_version: Option<i64>) -> DeltaResult<()> {
        let Some(current) = self.loaded() else {
            let snapshot =
                Snapshot::try_new(self.log_store.as_ref(), self.config.clone(), max_version).await?;
            self.publish_if_newer(snapshot);
            return Ok(());
        };

        match current.update(self.log_store.as_ref(), max_version).await {
            Ok(Some(snapshot)) => self.publish_if_newer(snapshot),
            Ok(None) => debug!("table is up to date at version {}", current.version()),
            Err(DeltaTableError::MissingLogSegment { version }) => {
                info!("commit {version} is gone from the log, reloading the table");
                let snapshot =
                    Snapshot::try_new(self.log_store.as_ref(), self.config.clone(), max_version)
                        .await?;
                self.publish_if_newer(snapshot);
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Loads the DeltaTable state for the given version.
    pub async fn load_version(&self, version: i64) -> DeltaResult<()> {
        let snapshot =
            Snapshot::try_new(self.log_store.as_ref(), self.config.clone(), Some(version)).await?;
        self.publish(snapshot);
        Ok(())
    }

    /// Time travel Delta table to the latest version that's created at or before provided
    /// `datetime` argument.
    ///
    /// Commit times are the last modified times of the commit files.
    pub async fn load_with_datetime(&self, datetime: DateTime<Utc>) -> DeltaResult<()> {
        let log_store = self.log_store.as_ref();
        let version = log_store
            .storage()
            .list(Some(log_store.log_path()))
            .await?
            .into_iter()
            .filter(|meta| meta.location.is_top_level_log_file() && meta.location.is_commit_file())
            .filter(|meta| meta.last_modified <= datetime)
            .filter_map(|meta| meta.location.commit_version())
            .max()
            .ok_or_else(|| DeltaTableError::InvalidTimestamp(datetime.to_rfc3339()))?;
        debug!("version {version} is the latest commit at or before {datetime}");
        self.load_version(version).await
    }

    /// Returns provenance information, including the operation, user, and so on, for each
    /// commit of the table, newest first.
    ///
    /// If `limit` is given, this returns the information of the latest `limit` commits.
    /// Commits no longer present in the log are skipped.
    pub async fn history(&self, limit: Option<usize>) -> DeltaResult<Vec<CommitInfo>> {
        let latest = self.version()?;
        let earliest = match limit {
            Some(limit) => {
                let limit = i64::try_from(limit).unwrap_or(i64::MAX);
                (latest + 1).saturating_sub(limit).max(0)
            }
            None => 0,
        };
        let log_store = self.log_store.as_ref();

        let entries = futures::stream::iter((earliest..=latest).rev())
            .map(|version| async move {
                let entry = log_store.read_commit_entry(version).await?;
                DeltaResult::Ok(entry.map(|bytes| (version, bytes)))
            })
            .buffered(self.config.log_buffer_size)
            .try_collect::<Vec<_>>()
            .await?;

        let mut infos = Vec::with_capacity(entries.len());
        for (version, bytes) in entries.into_iter().flatten() {
            let commit_info = get_actions(version, bytes)?
                .into_iter()
                .find_map(|action| match action {
                    Action::CommitInfo(info) => Some(info),
                    _ => None,
                });
            infos.extend(commit_info);
        }
        Ok(infos)
    }

    /// Returns the file paths, relative to the table root, present in the loaded state
    pub fn get_files(&self) -> DeltaResult<Vec<Path>> {
        self.snapshot()?.file_paths()
    }

    /// Returns an iterator of file names present in the loaded state
    pub fn get_files_iter(&self) -> DeltaResult<impl Iterator<Item = Path>> {
        Ok(self.get_files()?.into_iter())
    }

    /// Returns a URIs for all active files present in the current table version.
    pub fn get_file_uris(&self) -> DeltaResult<impl Iterator<Item = String> + '_> {
        Ok(self
            .get_files()?
            .into_iter()
            .map(|path| self.log_store.to_uri(&path)))
    }

    /// Get the number of files in the table - returns 0 if no metadata is loaded
    pub fn get_files_count(&self) -> usize {
        self.loaded().map_or(0, |s| s.files_count())
    }

    /// Returns the currently loaded state snapshot.
    ///
    /// The snapshot is not affected by later loads.
    pub fn snapshot(&self) -> DeltaResult<Arc<Snapshot>> {
        self.loaded().ok_or(DeltaTableError::NotLoaded)
    }

    /// Returns current table protocol
    pub fn protocol(&self) -> DeltaResult<Protocol> {
        Ok(self.snapshot()?.protocol().clone())
    }

    /// Returns the metadata associated with the loaded state.
    pub fn metadata(&self) -> DeltaResult<Metadata> {
        Ok(self.snapshot()?.metadata().clone())
    }

    /// Return table schema parsed from transaction log.
    pub fn schema(&self) -> DeltaResult<StructType> {
        Ok(self.snapshot()?.schema().clone())
    }

    /// Returns the latest transaction of every application that committed to the table.
    pub fn get_app_transaction_version(&self) -> DeltaResult<HashMap<String, Transaction>> {
        Ok(self.snapshot()?.transactions().clone())
    }

    fn loaded(&self) -> Option<Arc<Snapshot>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, snapshot: Snapshot) {
        debug!("publishing snapshot at version {}", snapshot.version());
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(snapshot));
    }

    /// Publish unless the table already holds a newer version
    fn publish_if_newer(&self, snapshot: Snapshot) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = state.as_ref().filter(|s| s.version() > snapshot.version()) {
            let (kept, stale) = (current.version(), snapshot.version());
            debug!("keeping version {kept} over stale version {stale}");
            return;
        }
        debug!("publishing snapshot at version {}", snapshot.version());
        *state = Some(Arc::new(snapshot));
    }
}

impl fmt::Display for DeltaTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "DeltaTable({})", self.table_uri())?;
        writeln!(f, "\tversion: {:?}", self.version().ok())
    }
}

impl std::fmt::Debug for DeltaTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "DeltaTable <{}>", self.table_uri())
    }
}
