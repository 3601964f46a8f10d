//! Object storage backend abstraction layer for Delta Table transaction logs

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::prefix::PrefixStore;
#[cfg(any(feature = "azure", feature = "s3", feature = "gcs"))]
use object_store::{ClientOptions, RetryConfig};
use tracing::debug;

pub mod location;
pub mod retry_ext;

#[cfg(any(feature = "azure", feature = "s3", feature = "gcs"))]
use crate::credentials::AccountKey;
#[cfg(feature = "azure")]
use crate::credentials::CacheKey;
use crate::credentials::{Credential, TokenCache};
#[cfg(any(feature = "azure", feature = "s3", feature = "gcs"))]
use crate::logstore::config::keys;
use crate::logstore::config::StorageConfig;
use crate::{DeltaResult, DeltaTableError};
pub use location::{StorageProvider, TableLocation};
pub use retry_ext::{CredentialRefresh, RetryPolicy};

pub use object_store;
pub use object_store::path::{Path, DELIMITER};
pub use object_store::{
    DynObjectStore, Error as ObjectStoreError, ObjectMeta, ObjectStore,
    Result as ObjectStoreResult,
};

/// Sharable reference to [`ObjectStore`]
pub type ObjectStoreRef = Arc<DynObjectStore>;

/// Wrap the given [ObjectStore] in a [PrefixStore] if necessary
///
/// This ensures that list/get/etc operations start from the table root rather than from the
/// root of the bucket or container.
pub fn url_prefix_handler(store: ObjectStoreRef, prefix: &Path) -> ObjectStoreRef {
    if prefix.as_ref().is_empty() {
        store
    } else {
        Arc::new(PrefixStore::new(store, prefix.clone()))
    }
}

/// Read access to a table's objects with retries and timeouts applied to every call.
///
/// Paths are relative to the table root.
#[derive(Debug, Clone)]
pub struct StorageClient {
    store: ObjectStoreRef,
    policy: RetryPolicy,
}

impl StorageClient {
    /// Wrap `store`, calls through the client follow `policy`
    pub fn new(store: ObjectStoreRef, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// The wrapped store, without retries
    pub fn object_store(&self) -> ObjectStoreRef {
        self.store.clone()
    }

    #[allow(missing_docs)]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Read a whole object
    pub async fn get(&self, path: &Path) -> DeltaResult<Bytes> {
        self.policy
            .run(path, || async move { self.store.get(path).await?.bytes().await })
            .await
    }

    /// Object metadata
    pub async fn head(&self, path: &Path) -> DeltaResult<ObjectMeta> {
        self.policy
            .run(path, || async move { self.store.head(path).await })
            .await
    }

    /// Whether an object exists
    pub async fn head_exists(&self, path: &Path) -> DeltaResult<bool> {
        self.policy
            .run(path, || async move {
                match self.store.head(path).await {
                    Ok(_) => Ok(true),
                    Err(ObjectStoreError::NotFound { .. }) => Ok(false),
                    Err(err) => Err(err),
                }
            })
            .await
    }

    /// All objects below `prefix`, sorted by path.
    ///
    /// A transient failure restarts the listing from the beginning.
    pub async fn list(&self, prefix: Option<&Path>) -> DeltaResult<Vec<ObjectMeta>> {
        let path = prefix.cloned().unwrap_or_default();
        let mut objects = self
            .policy
            .run(&path, || async move {
                self.store.list(prefix).try_collect::<Vec<_>>().await
            })
            .await?;
        objects.sort_unstable_by(|a, b| a.location.cmp(&b.location));
        Ok(objects)
    }

    /// Objects below `prefix` sorting after `offset`, sorted by path.
    pub async fn list_with_offset(
        &self,
        prefix: Option<&Path>,
        offset: &Path,
    ) -> DeltaResult<Vec<ObjectMeta>> {
        let mut objects = self
            .policy
            .run(offset, || async move {
                self.store
                    .list_with_offset(prefix, offset)
                    .try_collect::<Vec<_>>()
                    .await
            })
            .await?;
        objects.sort_unstable_by(|a, b| a.location.cmp(&b.location));
        Ok(objects)
    }
}

#[cfg(any(feature = "azure", feature = "s3", feature = "gcs"))]
fn client_options(config: &StorageConfig) -> ClientOptions {
    ClientOptions::new()
        .with_timeout(config.client.request_timeout)
        .with_connect_timeout(config.client.connect_timeout)
        .with_allow_http(config.options.get_bool(keys::ALLOW_HTTP))
}

/// Retries happen in [`RetryPolicy`], never inside `object_store`
#[cfg(any(feature = "azure", feature = "s3", feature = "gcs"))]
fn disabled_retries(config: &StorageConfig) -> RetryConfig {
    RetryConfig {
        max_retries: 0,
        ..config.retry.clone()
    }
}

fn not_applicable(credential: &Credential, location: &TableLocation) -> DeltaTableError {
    DeltaTableError::InvalidConfiguration(format!(
        "{} credentials cannot be used with {}",
        credential.kind(),
        location.provider
    ))
}

/// Build the client for `location`, authenticated with `credential`.
///
/// Token based credentials are served from `cache`.
pub fn build_storage_client(
    location: &TableLocation,
    config: &StorageConfig,
    credential: &Credential,
    cache: &Arc<TokenCache<String>>,
) -> DeltaResult<StorageClient> {
    let policy = RetryPolicy::new(config.retry.clone(), config.client.request_timeout);
    debug!(
        "building {} store for {location} with {} credentials",
        location.provider,
        credential.kind()
    );

    let (store, refresh): (ObjectStoreRef, Option<CredentialRefresh>) = match location.provider {
        StorageProvider::Local => {
            let path = location
                .local_path()
                .ok_or_else(|| DeltaTableError::InvalidLocation(location.to_string()))?;
            if !path.is_dir() {
                return Err(DeltaTableError::not_a_table(location.to_string()));
            }
            (Arc::new(LocalFileSystem::new_with_prefix(path)?), None)
        }
        StorageProvider::Memory => (
            url_prefix_handler(Arc::new(InMemory::new()), &location.root),
            None,
        ),
        StorageProvider::AzureBlobSecure
        | StorageProvider::AzureBlob
        | StorageProvider::AzureAdl => build_azure(location, config, credential, cache)?,
        StorageProvider::S3 => (build_s3(location, config, credential)?, None),
        StorageProvider::Gcs => (build_gcs(location, config, credential)?, None),
    };

    Ok(StorageClient::new(
        store,
        policy.with_credential_refresh(refresh),
    ))
}

#[cfg(feature = "azure")]
fn build_azure(
    location: &TableLocation,
    config: &StorageConfig,
    credential: &Credential,
    cache: &Arc<TokenCache<String>>,
) -> DeltaResult<(ObjectStoreRef, Option<CredentialRefresh>)> {
    use object_store::azure::MicrosoftAzureBuilder;

    use crate::credentials::azure::{token_credential, CachedTokenProvider};

    let use_emulator = config.options.get_bool(keys::USE_EMULATOR);
    let account = location
        .account
        .clone()
        .or_else(|| config.options.get(keys::ACCOUNT_NAME).map(str::to_string))
        .or_else(|| use_emulator.then(|| "devstoreaccount1".to_string()))
        .ok_or_else(|| {
            DeltaTableError::InvalidLocation(format!(
                "no storage account for {location}, set `account_name`"
            ))
        })?;
    let container = location
        .container
        .clone()
        .ok_or_else(|| DeltaTableError::InvalidLocation(location.to_string()))?;

    let mut builder = MicrosoftAzureBuilder::new()
        .with_account(&account)
        .with_container_name(container)
        .with_use_emulator(use_emulator)
        .with_retry(disabled_retries(config))
        .with_client_options(client_options(config));
    if let Some(endpoint) = config.options.get(keys::ENDPOINT) {
        builder = builder.with_endpoint(endpoint.to_string());
    }

    let mut refresh = None;
    builder = match credential {
        Credential::AccountKey(AccountKey::Azure(key)) => builder.with_access_key(key),
        Credential::SasToken(pairs) => builder.with_sas_authorization(pairs.clone()),
        Credential::Anonymous => builder.with_skip_signature(true),
        Credential::ServicePrincipal { .. }
        | Credential::CliDerivedToken
        | Credential::ManagedIdentity(_) => {
            let http = reqwest::Client::builder()
                .timeout(config.client.request_timeout)
                .connect_timeout(config.client.connect_timeout)
                .build()
                .map_err(|err| DeltaTableError::Generic(err.to_string()))?;
            let source = token_credential(credential, http)
                .ok_or_else(|| not_applicable(credential, location))?;
            let key = CacheKey::new(location.provider, account.clone(), credential.kind());
            refresh = Some(CredentialRefresh::new(cache.clone(), key.clone()));
            builder.with_credentials(Arc::new(CachedTokenProvider::new(
                key,
                cache.clone(),
                source,
            )))
        }
        other => return Err(not_applicable(other, location)),
    };

    let store = Arc::new(builder.build()?) as ObjectStoreRef;
    Ok((url_prefix_handler(store, &location.root), refresh))
}

#[cfg(not(feature = "azure"))]
fn build_azure(
    location: &TableLocation,
    _config: &StorageConfig,
    _credential: &Credential,
    _cache: &Arc<TokenCache<String>>,
) -> DeltaResult<(ObjectStoreRef, Option<CredentialRefresh>)> {
    Err(DeltaTableError::MissingFeature {
        feature: "azure",
        url: location.to_string(),
    })
}

#[cfg(feature = "s3")]
fn build_s3(
    location: &TableLocation,
    config: &StorageConfig,
    credential: &Credential,
) -> DeltaResult<ObjectStoreRef> {
    use object_store::aws::AmazonS3Builder;

    let bucket = location
        .container
        .clone()
        .ok_or_else(|| DeltaTableError::InvalidLocation(location.to_string()))?;
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_retry(disabled_retries(config))
        .with_client_options(client_options(config));
    if let Some(region) = config.options.get(keys::AWS_REGION) {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = config.options.get(keys::ENDPOINT) {
        builder = builder.with_endpoint(endpoint);
    }

    builder = match credential {
        Credential::AccountKey(AccountKey::Aws {
            access_key_id,
            secret_access_key,
            session_token,
        }) => {
            let builder = builder
                .with_access_key_id(access_key_id)
                .with_secret_access_key(secret_access_key);
            match session_token {
                Some(token) => builder.with_token(token),
                None => builder,
            }
        }
        Credential::Anonymous => builder.with_skip_signature(true),
        // instance profile, web identity and friends are picked up by the builder
        Credential::ManagedIdentity(_) => builder,
        other => return Err(not_applicable(other, location)),
    };

    let store = Arc::new(builder.build()?) as ObjectStoreRef;
    Ok(url_prefix_handler(store, &location.root))
}

#[cfg(not(feature = "s3"))]
fn build_s3(
    location: &TableLocation,
    _config: &StorageConfig,
    _credential: &Credential,
) -> DeltaResult<ObjectStoreRef> {
    Err(DeltaTableError::MissingFeature {
        feature: "s3",
        url: location.to_string(),
    })
}

#[cfg(feature = "gcs")]
fn build_gcs(
    location: &TableLocation,
    config: &StorageConfig,
    credential: &Credential,
) -> DeltaResult<ObjectStoreRef> {
    use object_store::gcp::GoogleCloudStorageBuilder;

    let bucket = location
        .container
        .clone()
        .ok_or_else(|| DeltaTableError::InvalidLocation(location.to_string()))?;
    let builder = GoogleCloudStorageBuilder::from_env()
        .with_bucket_name(bucket)
        .with_retry(disabled_retries(config))
        .with_client_options(client_options(config));

    let builder = match credential {
        Credential::AccountKey(AccountKey::GcpServiceAccountPath(path)) => {
            builder.with_service_account_path(path)
        }
        Credential::AccountKey(AccountKey::GcpServiceAccountKey(key)) => {
            builder.with_service_account_key(key)
        }
        Credential::ManagedIdentity(_) => builder,
        other => return Err(not_applicable(other, location)),
    };

    let store = Arc::new(builder.build()?) as ObjectStoreRef;
    Ok(url_prefix_handler(store, &location.root))
}

#[cfg(not(feature = "gcs"))]
fn build_gcs(
    location: &TableLocation,
    _config: &StorageConfig,
    _credential: &Credential,
) -> DeltaResult<ObjectStoreRef> {
    Err(DeltaTableError::MissingFeature {
        feature: "gcs",
        url: location.to_string(),
    })
}
