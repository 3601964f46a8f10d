//! # Delta log access
//!
//! A [`LogStore`] is scoped to a single table. It knows where the `_delta_log` directory lives
//! and how to read commit entries from it, while the [`StorageClient`] it wraps takes care of
//! retries and timeouts for every request.
//!
//! [`logstore_for`] resolves credentials and builds the object store for a [`TableLocation`].
//! [`logstore_with`] wraps an already configured [`ObjectStore`](object_store::ObjectStore),
//! e.g. an in-memory store in tests or a custom backend.
//!
//! ## Configuration
//!
//! See [`config`] for the recognized storage options and their aliases.
use std::cmp::max;
use std::io::{BufRead, BufReader, Cursor};
use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialResolver, TokenCache};
use crate::kernel::snapshot::log_segment::PathExt;
use crate::kernel::Action;
use crate::protocol::{get_last_checkpoint, ProtocolError};
use crate::storage::{
    build_storage_client, ObjectStoreRef, RetryPolicy, StorageClient, TableLocation,
};
use crate::{DeltaResult, DeltaTableError};

pub use self::config::StorageConfig;
pub use self::default_logstore::DefaultLogStore;

pub mod config;
pub(crate) mod default_logstore;

/// Sharable reference to [`LogStore`]
pub type LogStoreRef = Arc<dyn LogStore>;

static DELTA_LOG_PATH: LazyLock<Path> = LazyLock::new(|| Path::from("_delta_log"));

/// Return the [DefaultLogStore] for the given storage client
pub fn default_logstore(storage: StorageClient, config: LogStoreConfig) -> LogStoreRef {
    Arc::new(DefaultLogStore::new(storage, config))
}

/// Return the [LogStoreRef] for the provided [TableLocation].
///
/// Credentials are resolved from the storage options first, and the environment second.
/// Tokens are served from `cache`.
///
/// ```rust
/// # use std::sync::Arc;
/// # use deltaread_core::credentials::{CredentialResolver, TokenCache};
/// # use deltaread_core::logstore::*;
/// # use deltaread_core::storage::TableLocation;
/// let location = TableLocation::parse("memory:///table").unwrap();
/// let logstore = logstore_for(
///     location,
///     StorageConfig::default(),
///     &CredentialResolver::default(),
///     &Arc::new(TokenCache::default()),
/// )
/// .expect("Failed to get a logstore");
/// assert_eq!(logstore.root_uri(), "memory:///table");
/// ```
pub fn logstore_for(
    location: TableLocation,
    storage_config: StorageConfig,
    resolver: &CredentialResolver,
    cache: &Arc<TokenCache<String>>,
) -> DeltaResult<LogStoreRef> {
    let credential = resolver.resolve(location.provider, &storage_config.options)?;
    info!(
        provider = %location.provider,
        credential = %credential.kind(),
        "opening log store for {location}"
    );
    let storage = build_storage_client(&location, &storage_config, &credential, cache)?;
    Ok(default_logstore(
        storage,
        LogStoreConfig {
            location,
            options: storage_config,
        },
    ))
}

/// Return the [LogStoreRef] using the given [ObjectStoreRef].
///
/// `store` must be rooted at the table root, i.e. `_delta_log` is a top level directory.
pub fn logstore_with(
    store: ObjectStoreRef,
    location: TableLocation,
    storage_config: StorageConfig,
) -> LogStoreRef {
    debug!("using a custom object store for {location}");
    let policy = RetryPolicy::new(
        storage_config.retry.clone(),
        storage_config.client.request_timeout,
    );
    default_logstore(
        StorageClient::new(store, policy),
        LogStoreConfig {
            location,
            options: storage_config,
        },
    )
}

/// Configuration parameters for a log store
#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    /// Parsed table location
    pub location: TableLocation,
    /// Options used for configuring backend storage
    pub options: StorageConfig,
}

/// Read access to the commit entries of one table.
#[async_trait::async_trait]
pub trait LogStore: Send + Sync {
    /// Return the name of this LogStore implementation
    fn name(&self) -> String;

    /// Retrying client rooted at the table root
    fn storage(&self) -> &StorageClient;

    /// Read the commit entry for `version`, `None` if it does not exist.
    async fn read_commit_entry(&self, version: i64) -> DeltaResult<Option<Bytes>>;

    /// Find the latest version, starting the search at `current_version`.
    async fn get_latest_version(&self, current_version: i64) -> DeltaResult<i64>;

    /// Fully qualified uri for a path relative to the table root
    fn to_uri(&self, location: &Path) -> String {
        self.config().location.to_uri(location)
    }

    /// Get fully qualified uri for table root
    fn root_uri(&self) -> String {
        self.to_uri(&Path::from(""))
    }

    /// [Path] to Delta log
    fn log_path(&self) -> &Path {
        &DELTA_LOG_PATH
    }

    /// Check if the location is a delta table location
    async fn is_delta_table_location(&self) -> DeltaResult<bool> {
        let entries = match self.storage().list(Some(self.log_path())).await {
            Ok(entries) => entries,
            Err(DeltaTableError::ObjectStore {
                source: ObjectStoreError::NotFound { .. },
            }) => return Ok(false),
            Err(err) => return Err(err),
        };
        for meta in entries {
            // valid but optional files
            if meta.location.is_last_checkpoint_file() || meta.location.is_crc_file() {
                continue;
            }
            if meta.location.is_commit_file() || meta.location.is_checkpoint_file() {
                return Ok(true);
            }
            warn!(
                "Expected a valid delta file. Found {}",
                meta.location.filename().unwrap_or("<empty>")
            );
        }
        Ok(false)
    }

    /// Get configuration representing configured log store.
    fn config(&self) -> &LogStoreConfig;
}

impl std::fmt::Debug for dyn LogStore + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.root_uri())
    }
}

/// Path of the commit file for `version`, relative to the table root.
///
/// ```rust
/// # use deltaread_core::logstore::commit_uri_from_version;
/// assert_eq!(
///     commit_uri_from_version(7).as_ref(),
///     "_delta_log/00000000000000000007.json"
/// );
/// ```
pub fn commit_uri_from_version(version: i64) -> Path {
    let version = format!("{version:020}.json");
    DELTA_LOG_PATH.child(version.as_str())
}

/// Parse the actions of the commit file for `version`.
///
/// Blank lines are skipped, as are well formed lines carrying an action this crate does not
/// know about. Any other line that does not parse fails with
/// [`DeltaTableError::CorruptLogEntry`].
pub fn get_actions(version: i64, commit_log_bytes: Bytes) -> DeltaResult<Vec<Action>> {
    debug!("parsing commit with version {version}...");
    let reader = BufReader::new(Cursor::new(commit_log_bytes));

    let mut actions = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|err| DeltaTableError::corrupt_entry(version, "", err))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Action>(trimmed) {
            Ok(action) => actions.push(action),
            Err(err) if is_unknown_action(trimmed) => {
                debug!("skipping unknown action in version {version}: {err}");
            }
            Err(err) => return Err(DeltaTableError::corrupt_entry(version, line, err)),
        }
    }
    Ok(actions)
}

/// A JSON object whose keys are all unknown action names
fn is_unknown_action(line: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(serde_json::Value::Object(map)) => {
            !map.is_empty() && map.keys().all(|key| !Action::KNOWN_KEYS.contains(&key.as_str()))
        }
        _ => false,
    }
}

/// Default implementation for retrieving the latest version
pub async fn get_latest_version(
    log_store: &dyn LogStore,
    current_version: i64,
) -> DeltaResult<i64> {
    let version_start = match get_last_checkpoint(log_store).await {
        Ok(last_check_point) => last_check_point.version,
        Err(ProtocolError::CheckpointNotFound) => -1,
        Err(err) => {
            warn!("ignoring unreadable _last_checkpoint: {err}");
            -1
        }
    };
    debug!("latest checkpoint version: {version_start}");

    let version_start = max(current_version, version_start);
    let prefix = log_store.log_path();
    let files = log_store
        .storage()
        .list_with_offset(Some(prefix), &commit_uri_from_version(version_start))
        .await?;

    let mut max_version = version_start;
    let mut empty_listing = true;
    for meta in files.iter() {
        // files in subdirectories are uncommitted transactions
        if !meta.location.is_top_level_log_file() {
            continue;
        }
        if let Some(log_version) = meta.location.commit_version() {
            max_version = max(max_version, log_version);
            empty_listing = false;
        }
    }

    if max_version < 0 {
        return Err(DeltaTableError::not_a_table(log_store.root_uri()));
    }

    // nothing after the starting point, make sure the starting point itself exists
    if empty_listing && version_start >= 0 {
        let exists = log_store
            .storage()
            .head_exists(&commit_uri_from_version(version_start))
            .await?;
        if !exists && current_version >= 0 {
            return Box::pin(get_latest_version(log_store, -1)).await;
        }
    }

    Ok(max_version)
}

/// Read delta log for a specific version
pub async fn read_commit_entry(
    storage: &StorageClient,
    version: i64,
) -> DeltaResult<Option<Bytes>> {
    let commit_uri = commit_uri_from_version(version);
    match storage.get(&commit_uri).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(DeltaTableError::ObjectStore {
            source: ObjectStoreError::NotFound { .. },
        }) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;
    use object_store::{ObjectStore, PutPayload};
    use pretty_assertions::assert_eq;

    use super::*;

    fn memory_logstore() -> (Arc<InMemory>, LogStoreRef) {
        let store = Arc::new(InMemory::new());
        let logstore = logstore_with(
            store.clone(),
            TableLocation::parse("memory:///table").unwrap(),
            StorageConfig::default(),
        );
        (store, logstore)
    }

    async fn put(store: &InMemory, path: &str, data: &'static [u8]) {
        store
            .put(&Path::from(path), PutPayload::from_static(data))
            .await
            .unwrap();
    }

    #[test]
    fn logstore_with_invalid_url() {
        assert!(TableLocation::parse("nonexistent://table").is_err());
    }

    #[tokio::test]
    async fn test_is_location_a_table() {
        let (store, logstore) = memory_logstore();
        assert!(!logstore.is_delta_table_location().await.unwrap());

        // a failed commit alone does not make a table
        put(&store, "_delta_log/_commit_failed.tmp", b"test-drivin").await;
        assert!(!logstore.is_delta_table_location().await.unwrap());
    }

    #[tokio::test]
    async fn test_is_location_a_table_commit() {
        let (store, logstore) = memory_logstore();
        put(&store, "_delta_log/00000000000000000000.json", b"test").await;
        assert!(logstore.is_delta_table_location().await.unwrap());
    }

    #[tokio::test]
    async fn test_is_location_a_table_checkpoint() {
        let (store, logstore) = memory_logstore();
        put(&store, "_delta_log/_last_checkpoint", b"{}").await;
        put(
            &store,
            "_delta_log/00000000000000000010.checkpoint.parquet",
            b"test",
        )
        .await;
        assert!(logstore.is_delta_table_location().await.unwrap());
    }

    #[tokio::test]
    async fn test_latest_version() {
        let (store, logstore) = memory_logstore();
        assert!(matches!(
            logstore.get_latest_version(-1).await,
            Err(DeltaTableError::NotATable(_))
        ));

        for path in [
            "_delta_log/00000000000000000000.json",
            "_delta_log/00000000000000000001.json",
            "_delta_log/00000000000000000002.json",
            // uncommitted transactions live in subdirectories
            "_delta_log/tmp/00000000000000000009.json",
        ] {
            put(&store, path, b"{}").await;
        }
        assert_eq!(logstore.get_latest_version(-1).await.unwrap(), 2);
        assert_eq!(logstore.get_latest_version(1).await.unwrap(), 2);
        assert_eq!(logstore.get_latest_version(2).await.unwrap(), 2);
        // a stale starting point restarts the search
        assert_eq!(logstore.get_latest_version(5).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_read_commit_entry() {
        let (store, logstore) = memory_logstore();
        put(&store, "_delta_log/00000000000000000000.json", b"{}").await;
        assert!(logstore.read_commit_entry(0).await.unwrap().is_some());
        assert!(logstore.read_commit_entry(1).await.unwrap().is_none());
    }

    #[test]
    fn test_get_actions() {
        let commit = Bytes::from_static(
            br#"{"commitInfo":{"timestamp":1,"operation":"WRITE"}}
{"protocol":{"minReaderVersion":1,"minWriterVersion":2}}

{"someFutureAction":{"x":1}}
{"add":{"path":"part%20one.parquet","partitionValues":{},"size":10,"modificationTime":1,"dataChange":true}}
"#,
        );
        let actions = get_actions(3, commit).unwrap();
        assert_eq!(actions.len(), 3);
        let Action::Add(add) = &actions[2] else {
            panic!("expected add, got {:?}", actions[2]);
        };
        assert_eq!(add.path, "part one.parquet");
    }

    #[test]
    fn test_get_actions_corrupt() {
        for line in [
            r#"{"add":{"path":"a.parquet"}"#,
            r#"{"add":{"size":1}}"#,
            "not json",
        ] {
            let err = get_actions(4, Bytes::from(line.to_string())).unwrap_err();
            match err {
                DeltaTableError::CorruptLogEntry {
                    version, line: l, ..
                } => {
                    assert_eq!(version, 4);
                    assert_eq!(l, line);
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
    }
}
