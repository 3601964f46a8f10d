//! Read-only Delta Lake table access in Rust
//!
//! # Usage
//!
//! Open the latest version of a table:
//!
//! ```rust
//! async {
//!   let table = deltaread_core::open_table("/data/events").await.unwrap();
//!   let version = table.version();
//! };
//! ```
//!
//! Time travel to a version:
//!
//! ```rust
//! async {
//!   let table = deltaread_core::open_table_with_version("/data/events", 0).await.unwrap();
//!   let files = table.get_files();
//! };
//! ```
//!
//! Time travel to the last version committed at or before an instant:
//!
//! ```rust
//! async {
//!   let table = deltaread_core::open_table_with_ds(
//!       "/data/events",
//!       "2020-05-02T23:47:31-07:00",
//!   ).await.unwrap();
//!   let version = table.version();
//! };
//! ```
//!
//! Open a table in Azure Data Lake Storage with an explicit account key:
//!
//! ```rust
//! use std::collections::HashMap;
//!
//! async {
//!   let options = HashMap::from([
//!       ("azure_storage_account_key".to_string(), "<key>".to_string()),
//!   ]);
//!   let table = deltaread_core::open_table_with_storage_options(
//!       "abfss://container@account.dfs.core.windows.net/path/to/table",
//!       options,
//!   ).await.unwrap();
//!   let metadata = table.metadata();
//! };
//! ```
//!
//! # Optional cargo package features
//!
//! - `s3`, `gcs`, `azure` - enable the storage backends for AWS S3, Google Cloud Storage (GCS),
//!   or Azure Blob Storage / Azure Data Lake Storage Gen2 (ADLS2). `cloud` enables all of them
//!   and is on by default.

#![deny(missing_docs)]
#![allow(rustdoc::invalid_html_tags)]
#![allow(clippy::nonminimal_bool)]

pub mod credentials;
pub mod errors;
pub mod kernel;
pub mod logstore;
pub mod protocol;
pub mod storage;
pub mod table;

#[cfg(test)]
pub(crate) mod test_utils;

use std::collections::HashMap;

pub use self::errors::*;
pub use self::kernel::Snapshot;
pub use self::table::builder::{DeltaTableBuilder, DeltaTableConfig, DeltaVersion};
pub use self::table::DeltaTable;
pub use object_store::{path::Path, Error as ObjectStoreError, ObjectMeta, ObjectStore};

// re-exported so callers need not pin matching versions
pub use parquet;
pub use protocol::checkpoints;

/// Open the table at `table_uri` and load its latest version.
/// The storage backend follows the uri scheme.
pub async fn open_table(table_uri: impl AsRef<str>) -> Result<DeltaTable, DeltaTableError> {
    let table = DeltaTableBuilder::from_uri(table_uri)?.load().await?;
    Ok(table)
}

/// [`open_table`] with storage options, which also feed credential resolution.
pub async fn open_table_with_storage_options(
    table_uri: impl AsRef<str>,
    storage_options: HashMap<String, String>,
) -> Result<DeltaTable, DeltaTableError> {
    let table = DeltaTableBuilder::from_uri(table_uri)?
        .with_storage_options(storage_options)
        .load()
        .await?;
    Ok(table)
}

/// Open the table at `table_uri` as of `version`.
pub async fn open_table_with_version(
    table_uri: impl AsRef<str>,
    version: i64,
) -> Result<DeltaTable, DeltaTableError> {
    let table = DeltaTableBuilder::from_uri(table_uri)?
        .with_version(version)
        .load()
        .await?;
    Ok(table)
}

/// Open the table at `table_uri` as of the RFC-3339 timestamp `ds`.
pub async fn open_table_with_ds(
    table_uri: impl AsRef<str>,
    ds: impl AsRef<str>,
) -> Result<DeltaTable, DeltaTableError> {
    let table = DeltaTableBuilder::from_uri(table_uri)?
        .with_datestring(ds)?
        .load()
        .await?;
    Ok(table)
}

/// Version of this crate
pub fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_open_local_table() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let log_dir = tmp_dir.path().join("_delta_log");
        std::fs::create_dir(&log_dir).unwrap();
        let commit = [
            test_utils::protocol(1, 2),
            test_utils::metadata(&["part"]),
            test_utils::add("part=a/part-0.parquet", 100),
        ]
        .map(|action| action.to_string())
        .join("\n");
        std::fs::write(log_dir.join("00000000000000000000.json"), commit).unwrap();

        let table = open_table(tmp_dir.path().to_str().unwrap()).await.unwrap();
        assert_eq!(table.version().unwrap(), 0);
        assert_eq!(table.metadata().unwrap().partition_columns, vec!["part"]);
        assert_eq!(
            table.get_files().unwrap(),
            vec![Path::from("part=a/part-0.parquet")]
        );

        let table = open_table_with_version(tmp_dir.path().to_str().unwrap(), 0)
            .await
            .unwrap();
        assert_eq!(table.version().unwrap(), 0);
        assert!(matches!(
            open_table_with_version(tmp_dir.path().to_str().unwrap(), 1).await,
            Err(DeltaTableError::InvalidVersion(1))
        ));
    }

    #[tokio::test]
    async fn test_open_missing_local_table() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let result = open_table(tmp_dir.path().join("missing").to_str().unwrap()).await;
        assert!(matches!(result, Err(DeltaTableError::NotATable(_))));

        // a directory without a log
        let result = open_table(tmp_dir.path().to_str().unwrap()).await;
        assert!(matches!(result, Err(DeltaTableError::NotATable(_))));
    }
}
