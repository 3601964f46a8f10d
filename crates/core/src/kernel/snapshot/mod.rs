//! Delta table snapshots
//!
//! A snapshot represents the state of a Delta Table at a given version: the [`Protocol`],
//! the [`Metadata`], the set of live data files and the latest application transactions.
//!
//! ## Reading the log
//!
//! A snapshot is reconstructed from a [`LogSegment`]. The checkpoint, if any, seeds the
//! state and every later commit is applied on top of it strictly in version order. Commit
//! files may be fetched concurrently, but the [`SnapshotBuilder`] only accepts them one
//! version at a time.
//!
//! Builders never share state with a published [`Snapshot`]: an update clones the current
//! state into a fresh builder, so an abandoned replay leaves nothing half applied.

use std::collections::HashMap;

use futures::TryStreamExt;
use object_store::path::Path;
use tracing::debug;

use super::{Action, Add, DomainMetadata, Metadata, Protocol, StructType, Transaction};
use crate::logstore::LogStore;
use crate::{DeltaResult, DeltaTableConfig, DeltaTableError};

pub use self::log_segment::LogSegment;

pub(crate) mod log_segment;

/// A snapshot of a Delta table
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    version: i64,
    /// Configuration for the current session
    config: DeltaTableConfig,
    /// Protocol of the Delta table
    protocol: Protocol,
    /// Metadata of the Delta table
    metadata: Metadata,
    /// Logical table schema
    schema: StructType,
    /// Live data files, keyed by their decoded path
    files: HashMap<String, Add>,
    app_transactions: HashMap<String, Transaction>,
    domain_metadata: HashMap<String, DomainMetadata>,
}

impl Snapshot {
    /// Create a new [`Snapshot`] instance at `version`, or at the latest version
    pub async fn try_new(
        log_store: &dyn LogStore,
        config: DeltaTableConfig,
        version: Option<i64>,
    ) -> DeltaResult<Self> {
        let log_segment = LogSegment::try_new(log_store, version).await?;
        let builder = SnapshotBuilder::new(config.require_files);
        replay(builder, &log_segment, log_store, config).await
    }

    /// Advance the snapshot to `target_version`, or to the latest version.
    ///
    /// Only the commits after the current version are read. Returns `None` if there is
    /// nothing new. Moving to an older version replays the log from scratch.
    pub async fn update(
        &self,
        log_store: &dyn LogStore,
        target_version: Option<i64>,
    ) -> DeltaResult<Option<Self>> {
        match target_version {
            Some(v) if v == self.version => return Ok(None),
            Some(v) if v < self.version => {
                return Self::try_new(log_store, self.config.clone(), Some(v))
                    .await
                    .map(Some)
            }
            _ => {}
        }

        let log_segment = LogSegment::try_new_slice(log_store, self.version, target_version).await?;
        if log_segment.commit_files.is_empty() {
            return Ok(None);
        }
        debug!(
            "updating snapshot from version {} to {}",
            self.version, log_segment.version
        );
        let builder = SnapshotBuilder::from_snapshot(self);
        replay(builder, &log_segment, log_store, self.config.clone())
            .await
            .map(Some)
    }

    /// Get the table version of the snapshot
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Get the table schema of the snapshot
    pub fn schema(&self) -> &StructType {
        &self.schema
    }

    /// Get the table metadata of the snapshot
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Get the table protocol of the snapshot
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Get the table config which is loaded with of the snapshot
    pub fn load_config(&self) -> &DeltaTableConfig {
        &self.config
    }

    /// Live file actions, in no particular order
    pub fn file_actions_iter(&self) -> DeltaResult<impl Iterator<Item = &Add> + '_> {
        self.ensure_files("file_actions_iter")?;
        Ok(self.files.values())
    }

    /// Paths of the live data files relative to the table root, sorted
    pub fn file_paths(&self) -> DeltaResult<Vec<Path>> {
        self.ensure_files("file_paths")?;
        let mut paths: Vec<Path> = self.files.keys().map(|p| Path::from(p.as_str())).collect();
        paths.sort();
        Ok(paths)
    }

    /// Look up a live file by its decoded path
    pub fn file(&self, path: &str) -> DeltaResult<Option<&Add>> {
        self.ensure_files("file")?;
        Ok(self.files.get(path))
    }

    /// Number of live data files
    pub fn files_count(&self) -> usize {
        self.files.len()
    }

    /// Latest transaction version of every application that committed to the table
    pub fn transactions(&self) -> &HashMap<String, Transaction> {
        &self.app_transactions
    }

    /// Latest transaction version committed by `app_id`
    pub fn app_transaction_version(&self, app_id: &str) -> Option<i64> {
        self.app_transactions.get(app_id).map(|txn| txn.version)
    }

    /// Configuration of a metadata domain, unless the domain was removed
    pub fn domain_metadata(&self, domain: &str) -> Option<&str> {
        self.domain_metadata
            .get(domain)
            .map(|d| d.configuration.as_str())
    }

    fn ensure_files(&self, operation: &str) -> DeltaResult<()> {
        if !self.config.require_files {
            return Err(DeltaTableError::NotInitializedWithFiles(operation.into()));
        }
        Ok(())
    }
}

async fn replay(
    mut builder: SnapshotBuilder,
    log_segment: &LogSegment,
    log_store: &dyn LogStore,
    config: DeltaTableConfig,
) -> DeltaResult<Snapshot> {
    if let Some(checkpoint) = &log_segment.checkpoint {
        let actions = checkpoint
            .read_actions(
                log_store.storage(),
                log_store.log_path(),
                config.log_buffer_size,
            )
            .await?;
        builder.seed_checkpoint(checkpoint.version, actions)?;
    }

    let mut commits = log_segment.commit_stream(log_store, config.log_buffer_size);
    while let Some((version, actions)) = commits.try_next().await? {
        builder.apply_commit(version, actions)?;
    }
    builder.build(config)
}

/// Accumulates log actions into the state of one table version.
///
/// Data files are keyed by their decoded path: a later `add` replaces an earlier one, a
/// `remove` drops the entry and is a no-op for unknown paths. `metaData` and `protocol`
/// keep the last value seen.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    version: i64,
    require_files: bool,
    protocol: Option<Protocol>,
    metadata: Option<Metadata>,
    files: HashMap<String, Add>,
    app_transactions: HashMap<String, Transaction>,
    domain_metadata: HashMap<String, DomainMetadata>,
}

impl SnapshotBuilder {
    /// An empty builder, before version 0.
    pub fn new(require_files: bool) -> Self {
        Self {
            version: -1,
            require_files,
            protocol: None,
            metadata: None,
            files: HashMap::new(),
            app_transactions: HashMap::new(),
            domain_metadata: HashMap::new(),
        }
    }

    /// A builder continuing from `snapshot`
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            version: snapshot.version,
            require_files: snapshot.config.require_files,
            protocol: Some(snapshot.protocol.clone()),
            metadata: Some(snapshot.metadata.clone()),
            files: snapshot.files.clone(),
            app_transactions: snapshot.app_transactions.clone(),
            domain_metadata: snapshot.domain_metadata.clone(),
        }
    }

    /// Version of the last applied checkpoint or commit, `-1` if nothing was applied.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Start from the checkpoint of `version`. Only valid on an empty builder.
    pub fn seed_checkpoint(
        &mut self,
        version: i64,
        actions: impl IntoIterator<Item = Action>,
    ) -> DeltaResult<()> {
        if self.version >= 0 {
            return Err(DeltaTableError::Generic(format!(
                "cannot seed checkpoint {version} on top of version {}",
                self.version
            )));
        }
        actions.into_iter().for_each(|action| self.apply(action));
        self.version = version;
        Ok(())
    }

    /// Apply the actions of commit `version`, which must directly follow the current version.
    pub fn apply_commit(
        &mut self,
        version: i64,
        actions: impl IntoIterator<Item = Action>,
    ) -> DeltaResult<()> {
        let expected = self.version + 1;
        if version != expected {
            return Err(DeltaTableError::MissingLogSegment { version: expected });
        }
        actions.into_iter().for_each(|action| self.apply(action));
        self.version = version;
        Ok(())
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Add(add) => {
                if self.require_files {
                    self.files.insert(add.path.clone(), add);
                }
            }
            Action::Remove(remove) => {
                self.files.remove(&remove.path);
            }
            Action::Metadata(metadata) => self.metadata = Some(metadata),
            Action::Protocol(protocol) => self.protocol = Some(protocol),
            Action::Txn(txn) => {
                self.app_transactions.insert(txn.app_id.clone(), txn);
            }
            Action::DomainMetadata(domain) => {
                if domain.removed {
                    self.domain_metadata.remove(&domain.domain);
                } else {
                    self.domain_metadata.insert(domain.domain.clone(), domain);
                }
            }
            Action::Cdc(_)
            | Action::CommitInfo(_)
            | Action::CheckpointMetadata(_)
            | Action::Sidecar(_) => {}
        }
    }

    /// Finish the snapshot.
    ///
    /// Fails if no metadata or protocol was seen, or if the protocol requires reader
    /// capabilities this crate does not have.
    pub fn build(self, config: DeltaTableConfig) -> DeltaResult<Snapshot> {
        let version = self.version;
        let protocol = self.protocol.ok_or_else(|| {
            DeltaTableError::MetadataError(format!("no protocol found up to version {version}"))
        })?;
        let metadata = self.metadata.ok_or_else(|| {
            DeltaTableError::MetadataError(format!("no metadata found up to version {version}"))
        })?;
        protocol.ensure_read_supported()?;
        let schema = metadata.schema()?;

        Ok(Snapshot {
            version: self.version,
            config,
            protocol,
            metadata,
            schema,
            files: self.files,
            app_transactions: self.app_transactions,
            domain_metadata: self.domain_metadata,
        })
    }
}
