//! Configuration for table storage.
//!
//! All configuration is parsed from String -> String mappings. Keys are accepted in
//! snake_case, camelCase or upper case environment style and are normalized onto a
//! canonical name before they are interpreted, so `azureStorageAccountKey`,
//! `azure_storage_account_key` and `AZURE_STORAGE_ACCOUNT_KEY` mean the same thing.
//!
//! Specific pieces of configuration implement the `TryUpdateKey` trait which
//! defines how to update internal fields based on key-value pairs.
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use object_store::RetryConfig;
use tracing::debug;

use crate::{DeltaResult, DeltaTableError};

/// Canonical option names understood by the credential resolver and store builders.
pub mod keys {
    #![allow(missing_docs)]

    pub const ACCOUNT_NAME: &str = "account_name";
    pub const ACCOUNT_KEY: &str = "account_key";
    pub const SAS_TOKEN: &str = "sas_token";
    pub const CLIENT_ID: &str = "client_id";
    pub const CLIENT_SECRET: &str = "client_secret";
    pub const TENANT_ID: &str = "tenant_id";
    pub const AUTHORITY_HOST: &str = "authority_host";
    pub const USE_AZURE_CLI: &str = "use_azure_cli";
    pub const USE_MANAGED_IDENTITY: &str = "use_managed_identity";
    pub const MSI_ENDPOINT: &str = "msi_endpoint";
    pub const OBJECT_ID: &str = "object_id";
    pub const MSI_RESOURCE_ID: &str = "msi_resource_id";
    pub const SKIP_SIGNATURE: &str = "skip_signature";
    pub const USE_EMULATOR: &str = "use_emulator";
    pub const ALLOW_HTTP: &str = "allow_http";
    pub const ENDPOINT: &str = "endpoint";
    pub const AWS_ACCESS_KEY_ID: &str = "aws_access_key_id";
    pub const AWS_SECRET_ACCESS_KEY: &str = "aws_secret_access_key";
    pub const AWS_SESSION_TOKEN: &str = "aws_session_token";
    pub const AWS_REGION: &str = "aws_region";
    pub const GOOGLE_SERVICE_ACCOUNT_PATH: &str = "google_service_account_path";
    pub const GOOGLE_SERVICE_ACCOUNT_KEY: &str = "google_service_account_key";
}

static ALIAS_MAP: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        // account name
        ("azure_storage_account_name", keys::ACCOUNT_NAME),
        ("azure_account_name", keys::ACCOUNT_NAME),
        ("account_name", keys::ACCOUNT_NAME),
        // access key
        ("azure_storage_account_key", keys::ACCOUNT_KEY),
        ("azure_storage_access_key", keys::ACCOUNT_KEY),
        ("azure_storage_master_key", keys::ACCOUNT_KEY),
        ("azure_storage_key", keys::ACCOUNT_KEY),
        ("account_key", keys::ACCOUNT_KEY),
        ("access_key", keys::ACCOUNT_KEY),
        // sas key
        ("azure_storage_sas_token", keys::SAS_TOKEN),
        ("azure_storage_sas_key", keys::SAS_TOKEN),
        ("sas_token", keys::SAS_TOKEN),
        ("sas_key", keys::SAS_TOKEN),
        // client id
        ("azure_storage_client_id", keys::CLIENT_ID),
        ("azure_client_id", keys::CLIENT_ID),
        ("client_id", keys::CLIENT_ID),
        // client secret
        ("azure_storage_client_secret", keys::CLIENT_SECRET),
        ("azure_client_secret", keys::CLIENT_SECRET),
        ("client_secret", keys::CLIENT_SECRET),
        // authority id
        ("azure_storage_tenant_id", keys::TENANT_ID),
        ("azure_storage_authority_id", keys::TENANT_ID),
        ("azure_tenant_id", keys::TENANT_ID),
        ("azure_authority_id", keys::TENANT_ID),
        ("tenant_id", keys::TENANT_ID),
        ("authority_id", keys::TENANT_ID),
        // authority host
        ("azure_storage_authority_host", keys::AUTHORITY_HOST),
        ("azure_authority_host", keys::AUTHORITY_HOST),
        ("authority_host", keys::AUTHORITY_HOST),
        // azure cli
        ("azure_use_azure_cli", keys::USE_AZURE_CLI),
        ("azure_storage_use_azure_cli", keys::USE_AZURE_CLI),
        ("use_azure_cli", keys::USE_AZURE_CLI),
        // managed identity
        ("azure_use_managed_identity", keys::USE_MANAGED_IDENTITY),
        ("use_managed_identity", keys::USE_MANAGED_IDENTITY),
        ("azure_msi_endpoint", keys::MSI_ENDPOINT),
        ("azure_identity_endpoint", keys::MSI_ENDPOINT),
        ("msi_endpoint", keys::MSI_ENDPOINT),
        ("azure_object_id", keys::OBJECT_ID),
        ("object_id", keys::OBJECT_ID),
        ("azure_msi_resource_id", keys::MSI_RESOURCE_ID),
        ("msi_resource_id", keys::MSI_RESOURCE_ID),
        // anonymous access
        ("azure_skip_signature", keys::SKIP_SIGNATURE),
        ("aws_skip_signature", keys::SKIP_SIGNATURE),
        ("skip_signature", keys::SKIP_SIGNATURE),
        // use emulator
        ("azure_storage_use_emulator", keys::USE_EMULATOR),
        ("object_store_use_emulator", keys::USE_EMULATOR),
        ("use_emulator", keys::USE_EMULATOR),
        // allow http
        ("azure_storage_allow_http", keys::ALLOW_HTTP),
        ("object_store_allow_http", keys::ALLOW_HTTP),
        ("aws_allow_http", keys::ALLOW_HTTP),
        ("allow_http", keys::ALLOW_HTTP),
        // endpoint
        ("azure_storage_endpoint", keys::ENDPOINT),
        ("azure_endpoint", keys::ENDPOINT),
        ("aws_endpoint_url", keys::ENDPOINT),
        ("aws_endpoint", keys::ENDPOINT),
        ("endpoint_url", keys::ENDPOINT),
        ("endpoint", keys::ENDPOINT),
        // aws
        ("aws_access_key_id", keys::AWS_ACCESS_KEY_ID),
        ("access_key_id", keys::AWS_ACCESS_KEY_ID),
        ("aws_secret_access_key", keys::AWS_SECRET_ACCESS_KEY),
        ("secret_access_key", keys::AWS_SECRET_ACCESS_KEY),
        ("aws_session_token", keys::AWS_SESSION_TOKEN),
        ("aws_token", keys::AWS_SESSION_TOKEN),
        ("session_token", keys::AWS_SESSION_TOKEN),
        ("aws_region", keys::AWS_REGION),
        ("aws_default_region", keys::AWS_REGION),
        ("region", keys::AWS_REGION),
        // google
        ("google_service_account", keys::GOOGLE_SERVICE_ACCOUNT_PATH),
        ("google_service_account_path", keys::GOOGLE_SERVICE_ACCOUNT_PATH),
        ("google_application_credentials", keys::GOOGLE_SERVICE_ACCOUNT_PATH),
        ("service_account", keys::GOOGLE_SERVICE_ACCOUNT_PATH),
        ("service_account_path", keys::GOOGLE_SERVICE_ACCOUNT_PATH),
        ("google_service_account_key", keys::GOOGLE_SERVICE_ACCOUNT_KEY),
        ("service_account_key", keys::GOOGLE_SERVICE_ACCOUNT_KEY),
    ])
});

/// Convert camelCase and UPPER_CASE option names into snake_case.
///
/// ```rust
/// # use deltaread_core::logstore::config::normalize_key;
/// assert_eq!(normalize_key("azureStorageAccountKey"), "azure_storage_account_key");
/// assert_eq!(normalize_key("AZURE_STORAGE_ACCOUNT_KEY"), "azure_storage_account_key");
/// assert_eq!(normalize_key("backoff_config.base"), "backoff_config.base");
/// ```
pub fn normalize_key(key: &str) -> String {
    let mut normalized = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for c in key.trim().chars() {
        if c.is_ascii_uppercase() && prev_lower {
            normalized.push('_');
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        normalized.push(c.to_ascii_lowercase());
    }
    normalized
}

/// Map an option name onto its canonical name, if it is a known storage option.
pub fn canonical_key(key: &str) -> Option<&'static str> {
    ALIAS_MAP.get(normalize_key(key).as_str()).copied()
}

/// A configuration section that can be filled from string options
pub trait TryUpdateKey: Default {
    /// Update an internal field in the configuration.
    ///
    /// ## Returns
    /// - `Ok(Some(()))` if the key was updated.
    /// - `Ok(None)` if the key was not found and no internal field was updated.
    /// - `Err(_)` if the update failed. Failed updates may include finding a known key,
    ///   but failing to parse the value into the expected type.
    fn try_update_key(&mut self, key: &str, value: &str) -> DeltaResult<Option<()>>;
}

#[derive(Debug)]
/// Generic container for parsing configuration
pub struct ParseResult<T: std::fmt::Debug> {
    /// Parsed configuration
    pub config: T,
    /// Unrecognized key value pairs.
    pub unparsed: HashMap<String, String>,
    /// Errors encountered during parsing
    pub errors: Vec<(String, String)>,
    /// Whether the configuration is defaults only - i.e. no custom values were provided
    pub is_default: bool,
}

impl<T: std::fmt::Debug> ParseResult<T> {
    /// Fail if any option had an unparsable value
    pub fn raise_errors(&self) -> DeltaResult<()> {
        if !self.errors.is_empty() {
            return Err(DeltaTableError::InvalidConfiguration(format!(
                "Failed to parse config: {:?}",
                self.errors
            )));
        }
        Ok(())
    }
}

impl<T: std::fmt::Debug, K, V> FromIterator<(K, V)> for ParseResult<T>
where
    T: TryUpdateKey,
    K: AsRef<str> + Into<String>,
    V: AsRef<str> + Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut config = T::default();
        let mut unparsed = HashMap::new();
        let mut errors = Vec::new();
        let mut is_default = true;
        for (k, v) in iter {
            match config.try_update_key(&normalize_key(k.as_ref()), v.as_ref()) {
                Ok(None) => {
                    unparsed.insert(k.into(), v.into());
                }
                Ok(Some(_)) => is_default = false,
                Err(e) => errors.push((k.into(), e.to_string())),
            }
        }
        ParseResult {
            config,
            unparsed,
            errors,
            is_default,
        }
    }
}

pub(crate) fn try_parse_impl<T: std::fmt::Debug, K, V, I>(
    options: I,
) -> DeltaResult<(T, HashMap<String, String>)>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str> + Into<String>,
    V: AsRef<str> + Into<String>,
    T: TryUpdateKey,
{
    let result = ParseResult::from_iter(options);
    result.raise_errors()?;
    Ok((result.config, result.unparsed))
}

impl TryUpdateKey for RetryConfig {
    fn try_update_key(&mut self, key: &str, v: &str) -> DeltaResult<Option<()>> {
        match key {
            "max_retries" => self.max_retries = parse_usize(v)?,
            "retry_timeout" => self.retry_timeout = parse_duration(v)?,
            "init_backoff" | "backoff_config.init_backoff" | "backoff.init_backoff" => {
                self.backoff.init_backoff = parse_duration(v)?
            }
            "max_backoff" | "backoff_config.max_backoff" | "backoff.max_backoff" => {
                self.backoff.max_backoff = parse_duration(v)?;
            }
            "base" | "backoff_config.base" | "backoff.base" => {
                self.backoff.base = parse_f64(v)?;
            }
            _ => return Ok(None),
        }
        Ok(Some(()))
    }
}

/// Per request limits applied to every call against the object store.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Upper bound for a single request, including reading the response body.
    pub request_timeout: Duration,
    /// Upper bound for establishing a connection.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl TryUpdateKey for ClientConfig {
    fn try_update_key(&mut self, key: &str, v: &str) -> DeltaResult<Option<()>> {
        match key {
            "request_timeout" | "timeout" => self.request_timeout = parse_duration(v)?,
            "connect_timeout" => self.connect_timeout = parse_duration(v)?,
            _ => return Ok(None),
        }
        Ok(Some(()))
    }
}

/// Storage options keyed by canonical name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageOptions(HashMap<&'static str, String>);

impl StorageOptions {
    /// Value for a canonical key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether a canonical key is set to a truthy value
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).is_some_and(str_is_truthy)
    }

    /// Whether a canonical key is present at all
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Set a canonical key
    pub fn insert(&mut self, key: &'static str, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }

    /// Iterate over all options
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Number of options set
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no option is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for StorageOptions
where
    K: AsRef<str>,
    V: Into<String>,
{
    /// Collect options, silently dropping keys that are not known storage options.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .filter_map(|(k, v)| canonical_key(k.as_ref()).map(|key| (key, v.into())))
                .collect(),
        )
    }
}

/// Options of the storage layer, split into retry, request and provider settings
#[derive(Default, Debug, Clone)]
pub struct StorageConfig {
    /// Retry policy for transient store errors.
    pub retry: RetryConfig,

    /// Per request limits.
    pub client: ClientConfig,

    /// Provider and credential options, keyed by canonical name.
    pub options: StorageOptions,

    /// Properties that are not recognized by the storage configuration.
    pub unknown_properties: HashMap<String, String>,

    /// Original unprocessed properties.
    pub raw: HashMap<String, String>,
}

impl StorageConfig {
    /// Parse options into a StorageConfig.
    ///
    /// # Raises
    ///
    /// Raises a `DeltaTableError::InvalidConfiguration` if any of the options are invalid
    /// - i.e. cannot be parsed into target type.
    pub fn parse_options<K, V, I>(options: I) -> DeltaResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str> + Into<String>,
        V: AsRef<str> + Into<String>,
    {
        let mut props = StorageConfig {
            raw: options
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Default::default()
        };

        let (retry, remainder): (RetryConfig, _) = try_parse_impl(&props.raw)?;
        props.retry = retry;
        let (client, remainder): (ClientConfig, _) = try_parse_impl(remainder)?;
        props.client = client;

        for (key, value) in remainder {
            match canonical_key(&key) {
                Some(canonical) => props.options.insert(canonical, value),
                None => {
                    debug!("ignoring unknown storage option: {key}");
                    props.unknown_properties.insert(key, value);
                }
            }
        }
        Ok(props)
    }
}

fn parse_usize(value: &str) -> DeltaResult<usize> {
    value.parse::<usize>().map_err(|_| {
        DeltaTableError::InvalidConfiguration(format!("failed to parse \"{value}\" as usize"))
    })
}

fn parse_f64(value: &str) -> DeltaResult<f64> {
    value.parse::<f64>().map_err(|_| {
        DeltaTableError::InvalidConfiguration(format!("failed to parse \"{value}\" as f64"))
    })
}

fn parse_duration(value: &str) -> DeltaResult<Duration> {
    humantime::parse_duration(value).map_err(|_| {
        DeltaTableError::InvalidConfiguration(format!("failed to parse \"{value}\" as Duration"))
    })
}

/// Return true for all the stringly values typically associated with true
///
/// aka YAML booleans
///
/// ```rust
/// # use deltaread_core::logstore::config::*;
/// for value in ["1", "true", "on", "YES", "Y"] {
///     assert!(str_is_truthy(value));
/// }
/// for value in ["0", "FALSE", "off", "NO", "n", "bork"] {
///     assert!(!str_is_truthy(value));
/// }
/// ```
pub fn str_is_truthy(val: &str) -> bool {
    val.eq_ignore_ascii_case("1")
        | val.eq_ignore_ascii_case("true")
        | val.eq_ignore_ascii_case("on")
        | val.eq_ignore_ascii_case("yes")
        | val.eq_ignore_ascii_case("y")
}
