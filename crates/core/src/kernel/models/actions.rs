use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::schema::StructType;
use crate::{DeltaResult, DeltaTableError};

/// Encoding of the table's data files
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Format name, `parquet` for every table this crate reads
    pub provider: String,
    /// Format specific options
    #[serde(default)]
    pub options: HashMap<String, Option<String>>,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            provider: String::from("parquet"),
            options: HashMap::new(),
        }
    }
}

/// Empty struct schema for `metaData` actions written without one
fn default_schema() -> String {
    warn!("metaData action without schemaString, using an empty schema");
    r#"{"type":"struct",  "fields": []}"#.into()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
/// Table metadata, the last one in the log wins
pub struct Metadata {
    /// Table id, stable for the lifetime of the table
    pub id: String,
    /// Optional display name
    pub name: Option<String>,
    #[allow(missing_docs)]
    pub description: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub format: Format,
    /// Table schema serialized as JSON
    #[serde(default = "default_schema")]
    pub schema_string: String,
    /// Partition columns, in order
    #[serde(default)]
    pub partition_columns: Vec<String>,
    /// Creation time in epoch milliseconds
    pub created_time: Option<i64>,
    /// Table properties such as `delta.appendOnly`
    #[serde(default)]
    pub configuration: HashMap<String, Option<String>>,
}

impl Metadata {
    /// Parse [`Self::schema_string`]
    pub fn schema(&self) -> DeltaResult<StructType> {
        Ok(serde_json::from_str(&self.schema_string)?)
    }
}

/// Highest reader protocol version this crate implements
pub const MAX_SUPPORTED_READER_VERSION: i32 = 3;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
/// Reader and writer requirements of a table
pub struct Protocol {
    /// Lowest reader version able to read the table
    pub min_reader_version: i32,
    /// Lowest writer version able to write the table. Carried along, never checked.
    pub min_writer_version: i32,
    /// Named reader features, only present with reader version 3
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reader_features: Option<HashSet<ReaderFeatures>>,
    /// Named writer features, only present with writer version 7
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writer_features: Option<HashSet<String>>,
}

impl Protocol {
    /// Protocol without named features
    pub fn new(min_reader_version: i32, min_writer_version: i32) -> Self {
        Self {
            min_reader_version,
            min_writer_version,
            reader_features: None,
            writer_features: None,
        }
    }

    /// Replace the reader features
    pub fn with_reader_features(
        mut self,
        reader_features: impl IntoIterator<Item = impl Into<ReaderFeatures>>,
    ) -> Self {
        self.reader_features = Some(reader_features.into_iter().map(Into::into).collect());
        self
    }

    /// Fail unless this crate can read a table with this protocol.
    pub fn ensure_read_supported(&self) -> DeltaResult<()> {
        let mut unsupported = match (&self.reader_features, self.min_reader_version) {
            (Some(features), 3) => features
                .iter()
                .filter(|f| !f.is_supported())
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            _ => vec![],
        };
        if self.min_reader_version > MAX_SUPPORTED_READER_VERSION || !unsupported.is_empty() {
            unsupported.sort();
            return Err(DeltaTableError::UnsupportedProtocol {
                min_reader_version: self.min_reader_version,
                max_supported: MAX_SUPPORTED_READER_VERSION,
                features: unsupported,
            });
        }
        Ok(())
    }
}

/// Reader features a protocol can name
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum ReaderFeatures {
    ColumnMapping,
    /// Rows may be masked by deletion vectors; files of such tables are not listable
    DeletionVectors,
    #[serde(rename = "timestampNtz")]
    TimestampWithoutTimezone,
    /// Checkpoints with sidecar files
    V2Checkpoint,
    VacuumProtocolCheck,
    TypeWidening,
    #[serde(rename = "typeWidening-preview")]
    TypeWideningPreview,
    /// Anything this crate does not know
    #[serde(untagged)]
    Other(String),
}

impl ReaderFeatures {
    /// Whether files of a table with this feature can be listed by this crate
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::DeletionVectors | Self::Other(_))
    }
}

impl From<&str> for ReaderFeatures {
    fn from(value: &str) -> Self {
        match value {
            "columnMapping" => ReaderFeatures::ColumnMapping,
            "deletionVectors" => ReaderFeatures::DeletionVectors,
            "timestampNtz" => ReaderFeatures::TimestampWithoutTimezone,
            "v2Checkpoint" => ReaderFeatures::V2Checkpoint,
            "vacuumProtocolCheck" => ReaderFeatures::VacuumProtocolCheck,
            "typeWidening" => ReaderFeatures::TypeWidening,
            "typeWidening-preview" => ReaderFeatures::TypeWideningPreview,
            f => ReaderFeatures::Other(f.to_string()),
        }
    }
}

impl From<String> for ReaderFeatures {
    fn from(value: String) -> Self {
        value.as_str().into()
    }
}

impl AsRef<str> for ReaderFeatures {
    fn as_ref(&self) -> &str {
        match self {
            ReaderFeatures::ColumnMapping => "columnMapping",
            ReaderFeatures::DeletionVectors => "deletionVectors",
            ReaderFeatures::TimestampWithoutTimezone => "timestampNtz",
            ReaderFeatures::V2Checkpoint => "v2Checkpoint",
            ReaderFeatures::VacuumProtocolCheck => "vacuumProtocolCheck",
            ReaderFeatures::TypeWidening => "typeWidening",
            ReaderFeatures::TypeWideningPreview => "typeWidening-preview",
            ReaderFeatures::Other(f) => f,
        }
    }
}

impl fmt::Display for ReaderFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// A data file that becomes part of the table
pub struct Add {
    /// Path of the data file relative to the table root. Percent encoded in the log,
    /// decoded here.
    #[serde(with = "serde_path")]
    pub path: String,

    /// Partition values keyed by column, `None` for null
    #[serde(default)]
    pub partition_values: HashMap<String, Option<String>>,

    /// File size in bytes
    pub size: i64,

    /// Last modification of the file in epoch milliseconds
    pub modification_time: i64,

    /// Whether the action changed table data, as opposed to a rewrite
    pub data_change: bool,

    /// Column statistics as a JSON string, see [`Add::get_stats`]
    pub stats: Option<String>,
}

impl Add {
    /// Parsed [`Stats`] of this file, if any were written.
    pub fn get_stats(&self) -> DeltaResult<Option<Stats>> {
        match self.stats.as_deref() {
            None | Some("") => Ok(None),
            Some(stats) => Ok(Some(serde_json::from_str(stats)?)),
        }
    }
}

/// Column statistics of a data file
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Stats {
    pub num_records: i64,
    #[serde(default)]
    pub min_values: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub max_values: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub null_count: HashMap<String, serde_json::Value>,
}

/// Drops a data file from the table. Removing an unknown path has no effect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Remove {
    #[serde(with = "serde_path")]
    pub path: String,
    pub data_change: bool,
    /// Deletion time in epoch milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,
}

/// Change data file. Parsed so commits carrying it load, ignored during replay.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct AddCDCFile {
    #[serde(with = "serde_path")]
    pub path: String,
    pub size: i64,
}

/// Progress marker of an external writer, keyed by `app_id`
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Transaction {
    pub app_id: String,
    /// Latest version the application recorded
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

impl Transaction {
    #[allow(missing_docs)]
    pub fn new(app_id: impl ToString, version: i64) -> Self {
        Transaction {
            app_id: app_id.to_string(),
            version,
            last_updated: None,
        }
    }
}

/// Free form provenance of a commit, surfaced by [`crate::DeltaTable::history`]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    /// Commit time in epoch milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Operation name, e.g. `WRITE` or `DELETE`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Everything else the writer recorded, e.g. `operationParameters` or `engineInfo`
    #[serde(flatten, default)]
    pub info: HashMap<String, serde_json::Value>,
}

/// Configuration of a named metadata domain
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct DomainMetadata {
    pub domain: String,
    pub configuration: String,
    pub removed: bool,
}

/// Header row of a V2 checkpoint
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct CheckpointMetadata {
    pub version: i64,
}

/// A file in `_delta_log/_sidecars` holding part of the file actions of a V2 checkpoint
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Sidecar {
    /// Name of the sidecar file, relative to `_delta_log/_sidecars`
    #[serde(rename = "path")]
    pub file_name: String,
    pub size_in_bytes: i64,
    pub modification_time: i64,
}

/// Data file paths are percent encoded in the log and kept decoded in memory.
pub(crate) mod serde_path {
    use std::str::Utf8Error;

    use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
    use serde::{Deserialize, Deserializer, Serializer};

    // control characters plus what S3 and GCS advise against in object names
    const ESCAPED: &AsciiSet = &CONTROLS
        .add(b'"')
        .add(b'#')
        .add(b'%')
        .add(b'*')
        .add(b'<')
        .add(b'>')
        .add(b'?')
        .add(b'[')
        .add(b'\\')
        .add(b']')
        .add(b'^')
        .add(b'`')
        .add(b'{')
        .add(b'|')
        .add(b'}');

    pub fn decode_path(path: &str) -> Result<String, Utf8Error> {
        percent_decode_str(path).decode_utf8().map(Into::into)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let raw = String::deserialize(deserializer)?;
        decode_path(&raw).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S: Serializer>(path: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&utf8_percent_encode(path, ESCAPED))
    }
}
