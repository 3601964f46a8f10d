//! Discovery and reading of delta checkpoints.
//!
//! A checkpoint for version `N` is a reduction of commits `0..=N`: the live files plus the latest
//! metadata, protocol and transaction versions. Three layouts are read:
//!
//! - classic: `N.checkpoint.parquet`
//! - multi-part: `N.checkpoint.<part>.<parts>.parquet`, used only when every part is present
//! - V2: `N.checkpoint.<uuid>.(json|parquet)`, whose file actions may live in sidecar files
//!   under `_delta_log/_sidecars`
use std::collections::BTreeMap;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::ObjectMeta;
use tracing::debug;

use super::parquet_read;
use crate::kernel::snapshot::log_segment::PathExt;
use crate::kernel::Action;
use crate::logstore::get_actions;
use crate::storage::StorageClient;
use crate::{DeltaResult, DeltaTableError};

/// Layout of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// A single parquet file
    Classic,
    /// `parts` parquet files
    MultiPart {
        /// Number of parts
        parts: u32,
    },
    /// A single uuid named file, possibly referencing sidecars
    V2,
}

/// A complete checkpoint found in the log
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Table version the checkpoint reduces
    pub version: i64,
    /// Layout of the checkpoint
    pub kind: CheckpointKind,
    /// Checkpoint files, multi-part checkpoints ordered by part
    pub files: Vec<ObjectMeta>,
}

impl Checkpoint {
    /// The most recent complete checkpoint at or before `max_version`.
    ///
    /// `files` may hold any log entries, everything but checkpoint files is ignored.
    pub fn latest_complete<'a>(
        files: impl IntoIterator<Item = &'a ObjectMeta>,
        max_version: Option<i64>,
    ) -> Option<Self> {
        let mut by_version: BTreeMap<i64, Vec<&ObjectMeta>> = BTreeMap::new();
        for meta in files {
            if !meta.location.is_checkpoint_file() {
                continue;
            }
            match meta.location.commit_version() {
                Some(v) if max_version.is_none_or(|max| v <= max) => {
                    by_version.entry(v).or_default().push(meta)
                }
                _ => {}
            }
        }

        by_version
            .into_iter()
            .rev()
            .find_map(|(version, candidates)| Self::complete_at(version, candidates))
    }

    fn complete_at(version: i64, mut candidates: Vec<&ObjectMeta>) -> Option<Self> {
        candidates.sort_by(|a, b| a.location.cmp(&b.location));

        if let Some(meta) = candidates.iter().find(|m| m.location.is_uuid_checkpoint()) {
            return Some(Self {
                version,
                kind: CheckpointKind::V2,
                files: vec![(*meta).clone()],
            });
        }
        if let Some(meta) = candidates
            .iter()
            .find(|m| m.location.checkpoint_part().is_none() && !m.location.is_uuid_checkpoint())
        {
            return Some(Self {
                version,
                kind: CheckpointKind::Classic,
                files: vec![(*meta).clone()],
            });
        }

        // multi-part checkpoints, a writer may have left an incomplete set behind
        let mut by_parts: BTreeMap<u32, BTreeMap<u32, &ObjectMeta>> = BTreeMap::new();
        for meta in &candidates {
            if let Some((part, parts)) = meta.location.checkpoint_part() {
                by_parts.entry(parts).or_default().insert(part, *meta);
            }
        }
        for (parts, found) in by_parts.into_iter().rev() {
            if (1..=parts).all(|p| found.contains_key(&p)) {
                return Some(Self {
                    version,
                    kind: CheckpointKind::MultiPart { parts },
                    files: found.into_values().cloned().collect(),
                });
            }
            debug!(
                "skipping incomplete checkpoint {version}: {} of {parts} parts",
                found.len()
            );
        }
        None
    }

    /// Read every action of the checkpoint, including the file actions of its sidecars.
    ///
    /// Up to `buffer_size` files are fetched concurrently.
    pub async fn read_actions(
        &self,
        storage: &StorageClient,
        log_path: &Path,
        buffer_size: usize,
    ) -> DeltaResult<Vec<Action>> {
        let version = self.version;
        debug!("reading {:?} checkpoint at version {version}", self.kind);

        let locations: Vec<Path> = self.files.iter().map(|m| m.location.clone()).collect();
        let mut actions: Vec<Action> = futures::stream::iter(locations)
            .map(move |location| async move {
                let bytes = storage.get(&location).await?;
                decode(version, &location, bytes).await
            })
            .buffered(buffer_size)
            .try_concat()
            .await?;

        let sidecars: Vec<Path> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Sidecar(sidecar) => Some(sidecar_path(log_path, &sidecar.file_name)),
                _ => None,
            })
            .collect();
        if !sidecars.is_empty() {
            debug!("reading {} sidecars of checkpoint {version}", sidecars.len());
            let sidecar_actions: Vec<Action> = futures::stream::iter(sidecars)
                .map(move |path| async move {
                    let bytes = storage.get(&path).await?;
                    decode(version, &path, bytes).await
                })
                .buffered(buffer_size)
                .try_concat()
                .await?;
            actions.retain(|action| !matches!(action, Action::Sidecar(_)));
            actions.extend(sidecar_actions);
        }

        Ok(actions)
    }
}

fn sidecar_path(log_path: &Path, file_name: &str) -> Path {
    Path::from(format!("{log_path}/_sidecars/{file_name}"))
}

async fn decode(version: i64, location: &Path, bytes: Bytes) -> DeltaResult<Vec<Action>> {
    if location.extension() == Some("json") {
        return get_actions(version, bytes);
    }
    tokio::task::spawn_blocking(move || parquet_read::read_actions(version, bytes))
        .await
        .map_err(|err| DeltaTableError::Generic(err.to_string()))?
}
