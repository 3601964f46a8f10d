//! Exceptions for the deltaread crate
use object_store::Error as ObjectStoreError;

use crate::credentials::CredentialError;
use crate::protocol::ProtocolError;

/// A result returned by deltaread
pub type DeltaResult<T> = Result<T, DeltaTableError>;

/// Delta Table specific error
#[derive(thiserror::Error, Debug)]
pub enum DeltaTableError {
    /// The table location could not be mapped onto a known storage provider.
    #[error("Invalid table location: {0}")]
    InvalidLocation(String),

    /// More than one mutually exclusive credential option was supplied.
    #[error("Ambiguous credentials, only one of {} may be configured", .options.join(", "))]
    AmbiguousCredentials {
        /// Canonical names of the conflicting options, sorted.
        options: Vec<String>,
    },

    /// No credential applies but the storage provider requires authentication.
    #[error("Missing credentials for {provider}: {reason}")]
    MissingCredentials {
        /// Storage provider that requires authentication.
        provider: String,
        /// What is missing.
        reason: String,
    },

    /// A fresh credential was rejected by the store as well.
    #[error("Credentials expired and could not be refreshed for {path}: {source}")]
    AuthExpired {
        /// Object path of the failed request.
        path: String,
        /// Error returned by the object store.
        source: ObjectStoreError,
    },

    /// Acquiring a token from the CLI or the managed identity endpoint failed.
    #[error("Failed to acquire credential: {source}")]
    Credential {
        /// Error reported by the credential source.
        source: CredentialError,
    },

    /// Transient store failures persisted past the retry budget.
    #[error("Object store unavailable after {attempts} attempts: {source}")]
    StoreUnavailable {
        /// Number of attempts made, including the first one.
        attempts: usize,
        /// The last transient error.
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Error returned when reading the delta log object failed.
    #[error("Failed to read delta log object: {}", .source)]
    ObjectStore {
        /// Storage error details when reading the delta log object failed.
        #[from]
        source: ObjectStoreError,
    },

    /// Generic error of the log protocol
    #[error("Delta protocol violation: {source}")]
    Protocol {
        /// Source error details returned while reading the log.
        #[from]
        source: ProtocolError,
    },

    /// Error returned when parsing checkpoint parquet.
    #[error("Failed to parse parquet: {}", .source)]
    Parquet {
        /// Parquet error details returned when reading the checkpoint failed.
        #[from]
        source: parquet::errors::ParquetError,
    },

    /// A line of a commit file, or a row of a checkpoint, is not a valid action.
    #[error("Corrupt log entry, version={}, line=`{}`, err=`{}`", .version, .line, .reason)]
    CorruptLogEntry {
        /// Table version of the log file.
        version: i64,
        /// Offending log entry content.
        line: String,
        /// Why the entry could not be parsed.
        reason: String,
    },

    /// A commit required to reach the requested version is not present in the log.
    #[error("Delta log segment missing for table version: {version}")]
    MissingLogSegment {
        /// Missing commit version.
        version: i64,
    },

    /// The table requires reader capabilities this crate does not implement.
    #[error(
        "Unsupported reader protocol: minReaderVersion={min_reader_version}, supported up to {max_supported}, unsupported features: {features:?}"
    )]
    UnsupportedProtocol {
        /// minReaderVersion declared by the table.
        min_reader_version: i32,
        /// Highest reader version supported here.
        max_supported: i32,
        /// Reader features declared by the table and not supported here.
        features: Vec<String>,
    },

    /// No table version was committed at or before the requested instant.
    #[error("No table version exists at or before {0}")]
    InvalidTimestamp(String),

    /// File actions were requested from a table loaded without them.
    #[error("Table has not yet been initialized with files, therefore {0} is not supported.")]
    NotInitializedWithFiles(String),

    /// Table state was queried before a successful load.
    #[error("Table has not been loaded, call `load` first.")]
    NotLoaded,

    /// Error returned when the DeltaTable has an invalid version.
    #[error("Invalid table version: {0}")]
    InvalidVersion(i64),

    /// Error returned when it is not a DeltaTable.
    #[error("Not a Delta table: {0}")]
    NotATable(String),

    /// Error returned when a replayed log does not define table metadata or protocol.
    #[error("Table metadata is invalid: {0}")]
    MetadataError(String),

    /// Error returned when the log record has an invalid JSON.
    #[error("Invalid JSON: {}", .json_err)]
    InvalidJson {
        /// JSON error details.
        #[from]
        json_err: serde_json::error::Error,
    },

    /// Error returned when the datetime string is invalid for a conversion.
    #[error("Invalid datetime string: {}", .source)]
    InvalidDateTimeString {
        /// Parse error details returned of the datetime string parse error.
        #[from]
        source: chrono::ParseError,
    },

    /// A Feature is missing to perform operation
    #[error("deltaread must be built with feature '{feature}' to support loading from: {url}.")]
    MissingFeature {
        /// Name of the missing feature
        feature: &'static str,
        /// Storage location url
        url: String,
    },

    /// Storage options could not be parsed.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic Delta Table error
    #[error("Generic DeltaTable error: {0}")]
    Generic(String),
}

impl From<object_store::path::Error> for DeltaTableError {
    fn from(err: object_store::path::Error) -> Self {
        Self::InvalidLocation(err.to_string())
    }
}

impl From<url::ParseError> for DeltaTableError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidLocation(err.to_string())
    }
}

impl From<CredentialError> for DeltaTableError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Ambiguous { options } => Self::AmbiguousCredentials { options },
            CredentialError::Missing { provider, reason } => {
                Self::MissingCredentials { provider, reason }
            }
            source => Self::Credential { source },
        }
    }
}

impl DeltaTableError {
    /// Crate a NotATable Error with message for given path.
    pub fn not_a_table(path: impl AsRef<str>) -> Self {
        let msg = format!(
            "No snapshot or version 0 found, perhaps {} is an empty dir?",
            path.as_ref()
        );
        Self::NotATable(msg)
    }

    /// Shorthand for a [`DeltaTableError::CorruptLogEntry`].
    pub(crate) fn corrupt_entry(
        version: i64,
        line: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::CorruptLogEntry {
            version,
            line: line.into(),
            reason: reason.to_string(),
        }
    }
}
