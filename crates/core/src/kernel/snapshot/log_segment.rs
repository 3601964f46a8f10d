use std::sync::LazyLock;

use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::path::Path;
use object_store::{Error as ObjectStoreError, ObjectMeta};
use regex::Regex;
use tracing::debug;

use crate::kernel::Action;
use crate::logstore::{commit_uri_from_version, get_actions, LogStore};
use crate::protocol::{read_last_checkpoint, Checkpoint};
use crate::{DeltaResult, DeltaTableError};

static DELTA_FILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{20}\.json$").unwrap());
static CHECKPOINT_FILE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{20}\.checkpoint(?:\.(\d{10})\.(\d{10}))?\.parquet$").unwrap()
});
static UUID_CHECKPOINT_FILE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    let uuid = r"[0-9a-fA-F]{8}(?:-[0-9a-fA-F]{4}){3}-[0-9a-fA-F]{12}";
    Regex::new(&format!(r"^\d{{20}}\.checkpoint\.{uuid}\.(?:json|parquet)$")).unwrap()
});

/// Trait to extend a file path representation with delta specific functionality
///
/// specifically, this trait adds the ability to recognize valid log files and
/// parse the version number from a log file path
pub(crate) trait PathExt {
    /// Returns the last path segment if not terminated with a "/"
    fn filename(&self) -> Option<&str>;

    /// Number of path segments
    fn depth(&self) -> usize;

    /// Parse the version number assuming a commit json or checkpoint file
    fn commit_version(&self) -> Option<i64> {
        self.filename()
            .and_then(|f| f.split_once('.'))
            .and_then(|(name, _)| name.parse().ok())
    }

    /// Returns true if the file is a checkpoint file of any layout
    fn is_checkpoint_file(&self) -> bool {
        self.filename().is_some_and(|name| {
            CHECKPOINT_FILE_PATTERN.is_match(name) || UUID_CHECKPOINT_FILE_PATTERN.is_match(name)
        })
    }

    /// Returns true if the file is a uuid named V2 checkpoint
    fn is_uuid_checkpoint(&self) -> bool {
        self.filename()
            .is_some_and(|name| UUID_CHECKPOINT_FILE_PATTERN.is_match(name))
    }

    /// `(part, parts)` of a multi-part checkpoint file
    fn checkpoint_part(&self) -> Option<(u32, u32)> {
        let captures = CHECKPOINT_FILE_PATTERN.captures(self.filename()?)?;
        let part = captures.get(1)?.as_str().parse().ok()?;
        let parts = captures.get(2)?.as_str().parse().ok()?;
        Some((part, parts))
    }

    /// Returns true if the file is a commit json file
    fn is_commit_file(&self) -> bool {
        self.filename()
            .is_some_and(|name| DELTA_FILE_PATTERN.is_match(name))
    }

    fn is_last_checkpoint_file(&self) -> bool {
        self.filename() == Some("_last_checkpoint")
    }

    fn is_crc_file(&self) -> bool {
        self.filename().is_some_and(|name| name.ends_with(".crc"))
    }

    /// Direct child of `_delta_log`, files in subdirectories are not part of the log
    fn is_top_level_log_file(&self) -> bool {
        self.depth() == 2
    }
}

impl PathExt for Path {
    fn filename(&self) -> Option<&str> {
        self.filename()
    }

    fn depth(&self) -> usize {
        self.parts().count()
    }
}

/// The log files needed to reconstruct one table version: the most recent usable checkpoint
/// and every commit after it, in ascending order.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSegment {
    /// Version of the last commit (or of the checkpoint, without commits)
    pub version: i64,
    /// Checkpoint the replay starts from
    pub checkpoint: Option<Checkpoint>,
    /// Commits to replay, contiguous and ascending
    pub commit_files: Vec<ObjectMeta>,
}

impl LogSegment {
    /// Try to create a new [`LogSegment`] for `version`, or for the latest version.
    ///
    /// The `_last_checkpoint` hint narrows the listing when it can be used, otherwise the
    /// entire log directory is listed.
    pub async fn try_new(log_store: &dyn LogStore, version: Option<i64>) -> DeltaResult<Self> {
        if let Some(v) = version.filter(|v| *v < 0) {
            return Err(DeltaTableError::InvalidVersion(v));
        }
        let storage = log_store.storage();
        let log_path = log_store.log_path();

        let hint = read_last_checkpoint(storage, log_path)
            .await?
            .filter(|cp| version.is_none_or(|v| cp.version <= v));

        if let Some(hint) = hint {
            let start_from = log_path.child(format!("{:020}", hint.version).as_str());
            let files = top_level(storage.list_with_offset(Some(log_path), &start_from).await?);
            match Checkpoint::latest_complete(&files, version) {
                Some(checkpoint) => {
                    debug!(
                        "using checkpoint {} from _last_checkpoint hint {}",
                        checkpoint.version, hint.version
                    );
                    return Self::from_files(log_store, Some(checkpoint), &files, version);
                }
                None => debug!(
                    "checkpoint {} from _last_checkpoint not found, listing the log",
                    hint.version
                ),
            }
        }

        let files = top_level(storage.list(Some(log_path)).await?);
        let checkpoint = Checkpoint::latest_complete(&files, version);
        Self::from_files(log_store, checkpoint, &files, version)
    }

    /// Try to create a [`LogSegment`] holding the commits after `current_version`, up to
    /// `end_version` or the latest commit.
    pub async fn try_new_slice(
        log_store: &dyn LogStore,
        current_version: i64,
        end_version: Option<i64>,
    ) -> DeltaResult<Self> {
        debug!("try_new_slice: current_version: {current_version}, end_version: {end_version:?}");
        let log_path = log_store.log_path();
        let files = top_level(
            log_store
                .storage()
                .list_with_offset(Some(log_path), &commit_uri_from_version(current_version))
                .await?,
        );
        let commit_files = commits_after(&files, current_version, end_version);
        let version = validate_contiguous(&commit_files, current_version)?;
        if let Some(end) = end_version.filter(|end| *end > version) {
            return Err(DeltaTableError::InvalidVersion(end));
        }
        Ok(Self {
            version,
            checkpoint: None,
            commit_files,
        })
    }

    fn from_files(
        log_store: &dyn LogStore,
        checkpoint: Option<Checkpoint>,
        files: &[ObjectMeta],
        version: Option<i64>,
    ) -> DeltaResult<Self> {
        let checkpoint_version = checkpoint.as_ref().map_or(-1, |cp| cp.version);
        let commit_files = commits_after(files, checkpoint_version, version);

        if checkpoint.is_none() && commit_files.is_empty() {
            let any_log_file = files
                .iter()
                .any(|f| f.location.is_commit_file() || f.location.is_checkpoint_file());
            return Err(if any_log_file {
                DeltaTableError::MissingLogSegment { version: 0 }
            } else {
                DeltaTableError::not_a_table(log_store.root_uri())
            });
        }

        let latest = validate_contiguous(&commit_files, checkpoint_version)?;
        if let Some(v) = version.filter(|v| *v > latest) {
            return Err(DeltaTableError::InvalidVersion(v));
        }

        debug!(
            "log segment for version {latest}: checkpoint {:?}, {} commits",
            checkpoint.as_ref().map(|cp| cp.version),
            commit_files.len()
        );
        Ok(Self {
            version: latest,
            checkpoint,
            commit_files,
        })
    }

    /// Version of the checkpoint the segment starts from
    pub fn checkpoint_version(&self) -> Option<i64> {
        self.checkpoint.as_ref().map(|cp| cp.version)
    }

    /// Stream the parsed actions of every commit, in ascending version order.
    ///
    /// Up to `buffer_size` commits are fetched concurrently, results are yielded in order.
    pub fn commit_stream<'a>(
        &'a self,
        log_store: &'a dyn LogStore,
        buffer_size: usize,
    ) -> BoxStream<'a, DeltaResult<(i64, Vec<Action>)>> {
        futures::stream::iter(self.commit_files.iter())
            .map(move |meta| async move {
                let version = meta.location.commit_version().ok_or_else(|| {
                    DeltaTableError::Generic(format!("not a commit: {}", meta.location))
                })?;
                let bytes = match log_store.storage().get(&meta.location).await {
                    Ok(bytes) => bytes,
                    // removed between listing and reading
                    Err(DeltaTableError::ObjectStore {
                        source: ObjectStoreError::NotFound { .. },
                    }) => return Err(DeltaTableError::MissingLogSegment { version }),
                    Err(err) => return Err(err),
                };
                Ok((version, get_actions(version, bytes)?))
            })
            .buffered(buffer_size)
            .boxed()
    }
}

fn top_level(files: Vec<ObjectMeta>) -> Vec<ObjectMeta> {
    files
        .into_iter()
        .filter(|f| f.location.is_top_level_log_file())
        .collect()
}

/// Commit files with `after < version <= max_version`, ascending
fn commits_after(files: &[ObjectMeta], after: i64, max_version: Option<i64>) -> Vec<ObjectMeta> {
    let mut commits: Vec<ObjectMeta> = files
        .iter()
        .filter(|f| f.location.is_commit_file())
        .filter(|f| {
            f.location
                .commit_version()
                .is_some_and(|v| v > after && max_version.is_none_or(|max| v <= max))
        })
        .cloned()
        .collect();
    commits.sort_unstable_by(|a, b| a.location.cmp(&b.location));
    commits
}

/// Check that `commits` continue `start` without gaps, returns the last version.
fn validate_contiguous(commits: &[ObjectMeta], start: i64) -> DeltaResult<i64> {
    let mut expected = start + 1;
    for meta in commits {
        match meta.location.commit_version() {
            Some(v) if v == expected => expected += 1,
            _ => return Err(DeltaTableError::MissingLogSegment { version: expected }),
        }
    }
    Ok(expected - 1)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use object_store::memory::InMemory;
    use object_store::{ObjectStore, PutPayload};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::logstore::{logstore_with, LogStoreRef, StorageConfig};
    use crate::protocol::CheckpointKind;
    use crate::storage::TableLocation;

    async fn log_store_with_files(files: &[&str]) -> (Arc<InMemory>, LogStoreRef) {
        let store = Arc::new(InMemory::new());
        for file in files {
            store
                .put(&Path::from(*file), PutPayload::from_static(b"{}"))
                .await
                .unwrap();
        }
        let log_store = logstore_with(
            store.clone(),
            TableLocation::parse("memory:///").unwrap(),
            StorageConfig::default(),
        );
        (store, log_store)
    }

    fn commit(version: i64) -> String {
        format!("_delta_log/{version:020}.json")
    }

    fn versions(segment: &LogSegment) -> Vec<i64> {
        segment
            .commit_files
            .iter()
            .filter_map(|f| f.location.commit_version())
            .collect()
    }

    #[test]
    fn test_path_ext() {
        let path =
            Path::from("_delta_log/00000000000000000010.checkpoint.0000000002.0000000003.parquet");
        assert_eq!(path.commit_version(), Some(10));
        assert!(path.is_checkpoint_file());
        assert!(!path.is_commit_file());
        assert_eq!(path.checkpoint_part(), Some((2, 3)));

        let path = Path::from("_delta_log/00000000000000000003.json");
        assert!(path.is_commit_file());
        assert!(path.is_top_level_log_file());
        assert_eq!(path.commit_version(), Some(3));

        assert!(!Path::from("_delta_log/00000000000000000003.json.tmp").is_commit_file());
        assert!(!Path::from("_delta_log/00000000000000000003.crc").is_commit_file());
        assert!(!Path::from("_delta_log/tmp/00000000000000000003.json").is_top_level_log_file());
        assert!(Path::from("_delta_log/_last_checkpoint").is_last_checkpoint_file());
        assert_eq!(Path::from("_delta_log/_last_checkpoint").commit_version(), None);
    }

    #[tokio::test]
    async fn test_full_listing() {
        let files: Vec<String> = (0..=4).map(commit).collect();
        let files: Vec<&str> = files.iter().map(String::as_str).collect();
        let (_, log_store) = log_store_with_files(&files).await;

        let segment = LogSegment::try_new(log_store.as_ref(), None).await.unwrap();
        assert_eq!(segment.version, 4);
        assert_eq!(segment.checkpoint, None);
        assert_eq!(versions(&segment), vec![0, 1, 2, 3, 4]);

        let segment = LogSegment::try_new(log_store.as_ref(), Some(2)).await.unwrap();
        assert_eq!(segment.version, 2);
        assert_eq!(versions(&segment), vec![0, 1, 2]);

        assert!(matches!(
            LogSegment::try_new(log_store.as_ref(), Some(7)).await,
            Err(DeltaTableError::InvalidVersion(7))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_segment() {
        let mut files: Vec<String> = (0..=12).map(commit).collect();
        files.push("_delta_log/00000000000000000010.checkpoint.parquet".to_string());
        files.push("_delta_log/00000000000000000005.checkpoint.parquet".to_string());
        let files: Vec<&str> = files.iter().map(String::as_str).collect();
        let (store, log_store) = log_store_with_files(&files).await;

        let segment = LogSegment::try_new(log_store.as_ref(), None).await.unwrap();
        assert_eq!(segment.version, 12);
        assert_eq!(segment.checkpoint_version(), Some(10));
        assert_eq!(versions(&segment), vec![11, 12]);

        // older versions start from an older checkpoint
        let segment = LogSegment::try_new(log_store.as_ref(), Some(8)).await.unwrap();
        assert_eq!(segment.checkpoint_version(), Some(5));
        assert_eq!(versions(&segment), vec![6, 7, 8]);

        // with a hint, the same segment is found
        store
            .put(
                &Path::from("_delta_log/_last_checkpoint"),
                PutPayload::from_static(b"{\"version\":10,\"size\":4}"),
            )
            .await
            .unwrap();
        let hinted = LogSegment::try_new(log_store.as_ref(), None).await.unwrap();
        assert_eq!(hinted.checkpoint_version(), Some(10));
        assert_eq!(hinted.checkpoint.as_ref().unwrap().kind, CheckpointKind::Classic);
        assert_eq!(versions(&hinted), vec![11, 12]);

        let segment = LogSegment::try_new(log_store.as_ref(), Some(10)).await.unwrap();
        assert_eq!(segment.version, 10);
        assert!(segment.commit_files.is_empty());
    }

    #[tokio::test]
    async fn test_stale_hint_falls_back_to_listing() {
        let mut files: Vec<String> = (0..=3).map(commit).collect();
        files.push("_delta_log/00000000000000000002.checkpoint.parquet".to_string());
        let files: Vec<&str> = files.iter().map(String::as_str).collect();
        let (store, log_store) = log_store_with_files(&files).await;
        store
            .put(
                &Path::from("_delta_log/_last_checkpoint"),
                PutPayload::from_static(b"{\"version\":3,\"size\":4}"),
            )
            .await
            .unwrap();

        let segment = LogSegment::try_new(log_store.as_ref(), None).await.unwrap();
        assert_eq!(segment.checkpoint_version(), Some(2));
        assert_eq!(versions(&segment), vec![3]);
    }

    #[tokio::test]
    async fn test_missing_commit_is_reported() {
        let (_, log_store) =
            log_store_with_files(&[&commit(0), &commit(1), &commit(3), &commit(4)]).await;
        let err = LogSegment::try_new(log_store.as_ref(), None).await.unwrap_err();
        assert!(
            matches!(err, DeltaTableError::MissingLogSegment { version: 2 }),
            "{err:?}"
        );

        // history before the requested version is gone
        let (_, log_store) = log_store_with_files(&[&commit(3), &commit(4)]).await;
        let err = LogSegment::try_new(log_store.as_ref(), None).await.unwrap_err();
        assert!(matches!(err, DeltaTableError::MissingLogSegment { version: 0 }));
        let err = LogSegment::try_new(log_store.as_ref(), Some(1)).await.unwrap_err();
        assert!(matches!(err, DeltaTableError::MissingLogSegment { version: 0 }));
    }

    #[tokio::test]
    async fn test_not_a_table() {
        let (_, log_store) = log_store_with_files(&["data/part-0.parquet"]).await;
        assert!(matches!(
            LogSegment::try_new(log_store.as_ref(), None).await,
            Err(DeltaTableError::NotATable(_))
        ));
    }

    #[tokio::test]
    async fn test_slice() {
        let files: Vec<String> = (0..=5).map(commit).collect();
        let files: Vec<&str> = files.iter().map(String::as_str).collect();
        let (_, log_store) = log_store_with_files(&files).await;

        let slice = LogSegment::try_new_slice(log_store.as_ref(), 2, None).await.unwrap();
        assert_eq!(slice.version, 5);
        assert_eq!(versions(&slice), vec![3, 4, 5]);

        let slice = LogSegment::try_new_slice(log_store.as_ref(), 2, Some(4)).await.unwrap();
        assert_eq!(versions(&slice), vec![3, 4]);

        let slice = LogSegment::try_new_slice(log_store.as_ref(), 5, None).await.unwrap();
        assert_eq!(slice.version, 5);
        assert!(slice.commit_files.is_empty());

        assert!(matches!(
            LogSegment::try_new_slice(log_store.as_ref(), 2, Some(9)).await,
            Err(DeltaTableError::InvalidVersion(9))
        ));
    }
}
