//! Create or load DeltaTables

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::debug;

use crate::credentials::{global_token_cache, CredentialResolver, EnvSnapshot, TokenCache};
use crate::logstore::{LogStoreRef, StorageConfig};
use crate::storage::{ObjectStoreRef, TableLocation};
use crate::{DeltaResult, DeltaTable, DeltaTableError};

/// possible version specifications for loading a delta table
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DeltaVersion {
    /// load the newest version
    #[default]
    Newest,
    /// specify the version to load
    Version(i64),
    /// specify the timestamp in UTC
    Timestamp(DateTime<Utc>),
}

/// Configuration options for delta table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaTableConfig {
    /// Keep the set of live data files in the snapshot (default `true`).
    ///
    /// Callers that only need the version, schema or metadata can turn this off; `add`
    /// actions are then skipped during replay and file listings fail.
    pub require_files: bool,

    /// Number of commit files fetched concurrently during replay (default `4 * num_cpus`).
    ///
    /// Commits are still applied one at a time in version order. Larger values cut latency
    /// on long logs at the cost of memory and more parallel requests against the store.
    pub log_buffer_size: usize,
}

impl Default for DeltaTableConfig {
    fn default() -> Self {
        Self {
            require_files: true,
            log_buffer_size: num_cpus::get() * 4,
        }
    }
}

/// Configures where a table lives, how to reach it, and which version to load.
#[derive(Debug)]
pub struct DeltaTableBuilder {
    /// parsed table location
    location: TableLocation,
    /// backend to access storage system, rooted at the table root
    storage_backend: Option<ObjectStoreRef>,
    version: DeltaVersion,
    storage_options: Option<HashMap<String, String>>,
    allow_http: Option<bool>,
    table_config: DeltaTableConfig,
    resolver: CredentialResolver,
    token_cache: Option<Arc<TokenCache<String>>>,
}

impl DeltaTableBuilder {
    /// Creates `DeltaTableBuilder` from table uri
    ///
    /// ```rust
    /// # use deltaread_core::table::builder::*;
    /// let builder = DeltaTableBuilder::from_uri("memory:///test").unwrap();
    /// ```
    pub fn from_uri(table_uri: impl AsRef<str>) -> DeltaResult<Self> {
        let location = TableLocation::parse(table_uri)?;
        debug!("creating table builder with {location}");
        Ok(Self::from_location(location))
    }

    /// Creates `DeltaTableBuilder` from an already parsed location
    pub fn from_location(location: TableLocation) -> Self {
        Self {
            location,
            storage_backend: None,
            version: DeltaVersion::default(),
            storage_options: None,
            allow_http: None,
            table_config: DeltaTableConfig::default(),
            resolver: CredentialResolver::new(),
            token_cache: None,
        }
    }

    /// Sets `require_files=false` to the builder
    pub fn without_files(mut self) -> Self {
        self.table_config.require_files = false;
        self
    }

    /// Sets `version` to the builder
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = DeltaVersion::Version(version);
        self
    }

    /// Sets `log_buffer_size` to the builder
    pub fn with_log_buffer_size(mut self, log_buffer_size: usize) -> DeltaResult<Self> {
        if log_buffer_size == 0 {
            return Err(DeltaTableError::Generic(String::from(
                "Log buffer size should be positive",
            )));
        }
        self.table_config.log_buffer_size = log_buffer_size;
        Ok(self)
    }

    /// specify the timestamp given as ISO-8601/RFC-3339 timestamp
    pub fn with_datestring(self, date_string: impl AsRef<str>) -> DeltaResult<Self> {
        let datetime = DateTime::<Utc>::from(DateTime::<FixedOffset>::parse_from_rfc3339(
            date_string.as_ref(),
        )?);
        Ok(self.with_timestamp(datetime))
    }

    /// specify a timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.version = DeltaVersion::Timestamp(timestamp);
        self
    }

    /// Set the storage backend.
    ///
    /// If a backend is not provided then it is derived from the location and the resolved
    /// credentials. `store` must be rooted at the table root.
    pub fn with_storage_backend(mut self, store: ObjectStoreRef) -> Self {
        self.storage_backend = Some(store);
        self
    }

    /// Options for the storage backend and the credential resolver.
    ///
    /// Keys are accepted in snake_case, camelCase or environment style. Values that look like
    /// endpoints (an `http://` or `https://` value, or a key ending in `_url`) lose their
    /// trailing slash.
    pub fn with_storage_options(mut self, storage_options: HashMap<String, String>) -> Self {
        self.storage_options = Some(
            storage_options
                .into_iter()
                .map(|(k, v)| {
                    let needs_trim = v.starts_with("http://")
                        || v.starts_with("https://")
                        || k.to_lowercase().ends_with("_url");
                    if needs_trim {
                        (k, v.trim_end_matches('/').to_owned())
                    } else {
                        (k, v)
                    }
                })
                .collect(),
        );
        self
    }

    /// Allow plain http endpoints, e.g. a local storage emulator.
    pub fn with_allow_http(mut self, allow_http: bool) -> Self {
        self.allow_http = Some(allow_http);
        self
    }

    /// Resolve credentials against `env` instead of the process environment
    pub fn with_env(mut self, env: EnvSnapshot) -> Self {
        self.resolver = CredentialResolver::with_env(env);
        self
    }

    /// Share a token cache other than the process wide one
    pub fn with_credential_cache(mut self, cache: Arc<TokenCache<String>>) -> Self {
        self.token_cache = Some(cache);
        self
    }

    /// Location of the table
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    /// Storage options for configuring backend object store
    pub fn storage_options(&self) -> HashMap<String, String> {
        let mut storage_options = self.storage_options.clone().unwrap_or_default();
        if let Some(allow) = self.allow_http {
            storage_options.insert(
                "allow_http".into(),
                if allow { "true" } else { "false" }.into(),
            );
        };
        storage_options
    }

    /// Build a delta storage backend for the given config
    pub fn build_storage(&self) -> DeltaResult<LogStoreRef> {
        debug!("build_storage() with {}", self.location);
        let storage_config = StorageConfig::parse_options(self.storage_options())?;

        if let Some(store) = self.storage_backend.as_ref() {
            debug!("Loading a logstore with a custom store: {store:?}");
            Ok(crate::logstore::logstore_with(
                store.clone(),
                self.location.clone(),
                storage_config,
            ))
        } else {
            let cache = self.token_cache.clone().unwrap_or_else(global_token_cache);
            crate::logstore::logstore_for(
                self.location.clone(),
                storage_config,
                &self.resolver,
                &cache,
            )
        }
    }

    /// Resolve credentials and storage into an unloaded [`DeltaTable`].
    ///
    /// Nothing is read from the log; see [`DeltaTableBuilder::load`].
    pub fn build(self) -> DeltaResult<DeltaTable> {
        Ok(DeltaTable::new(self.build_storage()?, self.table_config))
    }

    /// Build the [`DeltaTable`] and load its state
    pub async fn load(self) -> DeltaResult<DeltaTable> {
        let version = self.version;
        let table = self.build()?;
        match version {
            DeltaVersion::Newest => table.load().await?,
            DeltaVersion::Version(v) => table.load_version(v).await?,
            DeltaVersion::Timestamp(ts) => table.load_with_datetime(ts).await?,
        }
        Ok(table)
    }
}
