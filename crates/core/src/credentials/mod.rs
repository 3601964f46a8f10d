//! Credential resolution for the supported storage providers.
//!
//! Given a provider and a bag of storage options, [`CredentialResolver`] picks exactly one
//! [`Credential`]. Precedence, first match wins:
//!
//! 1. account key
//! 2. SAS token
//! 3. service principal (client id, client secret, tenant id)
//! 4. token from the Azure CLI
//! 5. managed identity
//! 6. anonymous access
//!
//! Explicitly configured options are never silently preferred over one another: supplying two
//! of them fails with [`CredentialError::Ambiguous`]. The environment is only consulted when the
//! options carry no credential at all, in which case the precedence above decides.
use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::logstore::config::{keys, StorageOptions};
use crate::storage::location::StorageProvider;

#[cfg(feature = "azure")]
pub mod azure;
pub mod cache;

pub use cache::{global_token_cache, CacheKey, TemporaryToken, TokenCache};

/// Well known key of the Azurite storage emulator
const EMULATOR_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// Environment variables marking an App Service / Functions managed identity
const IDENTITY_ENDPOINT_ENV_KEYS: [&str; 2] = ["IDENTITY_ENDPOINT", "MSI_ENDPOINT"];
const IDENTITY_HEADER_ENV_KEY: &str = "IDENTITY_HEADER";

/// Errors raised while resolving or acquiring credentials.
///
/// Cloneable so a single token request can be shared by concurrent callers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Mutually exclusive options were supplied together.
    #[error("Ambiguous credentials, only one of {} may be configured", .options.join(", "))]
    Ambiguous {
        /// Canonical names of the conflicting options, sorted.
        options: Vec<String>,
    },

    /// No credential applies to a provider that requires one.
    #[error("Missing credentials for {provider}: {reason}")]
    Missing {
        /// Provider that requires authentication.
        provider: String,
        /// What is missing.
        reason: String,
    },

    /// The Azure CLI could not produce a token.
    #[error("Azure CLI error: {message}")]
    AzureCli {
        /// Error output or description.
        message: String,
    },

    /// The token endpoint could not be reached.
    #[error("Token request to {endpoint} failed: {message}")]
    TokenRequest {
        /// Endpoint that was called.
        endpoint: String,
        /// Transport error description.
        message: String,
    },

    /// The token endpoint answered with an error status.
    #[error("Non-200 returned on token acquisition: {status}: {body}")]
    InvalidResponse {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
}

/// Provider specific key material for [`Credential::AccountKey`]
#[derive(Clone, PartialEq, Eq)]
pub enum AccountKey {
    /// Azure storage account shared key
    Azure(String),
    /// AWS access key pair
    Aws {
        /// Access key id
        access_key_id: String,
        /// Secret access key
        secret_access_key: String,
        /// Optional session token for temporary credentials
        session_token: Option<String>,
    },
    /// Path to a GCP service account file
    GcpServiceAccountPath(String),
    /// Inline GCP service account JSON
    GcpServiceAccountKey(String),
}

/// Settings for a managed identity token request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedIdentity {
    /// Client id of a user assigned identity
    pub client_id: Option<String>,
    /// Object id of a user assigned identity
    pub object_id: Option<String>,
    /// Resource id of a user assigned identity
    pub msi_resource_id: Option<String>,
    /// Token endpoint, defaults to the instance metadata service
    pub endpoint: Option<String>,
    /// Secret sent as `x-identity-header` on App Service
    pub identity_header: Option<String>,
}

/// The single credential a table session authenticates with.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Long lived account key
    AccountKey(AccountKey),
    /// Shared access signature, split into query pairs
    SasToken(Vec<(String, String)>),
    /// Azure AD application with a client secret
    ServicePrincipal {
        /// Application (client) id
        client_id: String,
        /// Client secret
        client_secret: String,
        /// Directory (tenant) id
        tenant_id: String,
        /// Authority host override
        authority_host: Option<String>,
    },
    /// Token obtained from `az account get-access-token`
    CliDerivedToken,
    /// Token obtained from the ambient managed identity. For S3 and GCS this is the
    /// provider's default credential chain.
    ManagedIdentity(ManagedIdentity),
    /// Unsigned requests, public containers and local stores
    Anonymous,
}

/// Discriminant of [`Credential`], used in logs and cache keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CredentialKind {
    AccountKey,
    SasToken,
    ServicePrincipal,
    CliDerivedToken,
    ManagedIdentity,
    Anonymous,
}

impl CredentialKind {
    /// Name used in logs and error messages, e.g. `sas_token`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccountKey => "account_key",
            Self::SasToken => "sas_token",
            Self::ServicePrincipal => "service_principal",
            Self::CliDerivedToken => "azure_cli",
            Self::ManagedIdentity => "managed_identity",
            Self::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Credential {
    /// Which variant this is, without the secret
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::AccountKey(_) => CredentialKind::AccountKey,
            Self::SasToken(_) => CredentialKind::SasToken,
            Self::ServicePrincipal { .. } => CredentialKind::ServicePrincipal,
            Self::CliDerivedToken => CredentialKind::CliDerivedToken,
            Self::ManagedIdentity(_) => CredentialKind::ManagedIdentity,
            Self::Anonymous => CredentialKind::Anonymous,
        }
    }
}

// secrets stay out of logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServicePrincipal {
                client_id,
                tenant_id,
                ..
            } => f
                .debug_struct("ServicePrincipal")
                .field("client_id", client_id)
                .field("tenant_id", tenant_id)
                .finish_non_exhaustive(),
            Self::ManagedIdentity(identity) => {
                f.debug_tuple("ManagedIdentity").field(identity).finish()
            }
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// A snapshot of the credential related process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the relevant variables of the current process
    pub fn from_process() -> Self {
        Self::from_vars(std::env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, value.into_string().ok()?))
        }))
    }

    /// Build a snapshot from explicit variables
    pub fn from_vars<K: Into<String>, V: Into<String>>(
        vars: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .filter(|(k, _)| {
                    ["AZURE_", "AWS_", "GOOGLE_", "IDENTITY_", "MSI_"]
                        .iter()
                        .any(|prefix| k.starts_with(prefix))
                })
                .collect(),
        }
    }

    /// Value of the variable `name`, if it was set
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Storage options that can be derived from the environment
    fn options(&self) -> StorageOptions {
        self.vars
            .iter()
            .filter(|(k, _)| !k.starts_with("IDENTITY_") && !k.starts_with("MSI_"))
            .collect()
    }

    fn identity_endpoint(&self) -> Option<&str> {
        IDENTITY_ENDPOINT_ENV_KEYS
            .iter()
            .find_map(|key| self.get(key))
    }
}

/// Explicit credential groups; supplying more than one is ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Group {
    AccountKey,
    SasToken,
    ServicePrincipal,
    AzureCli,
    ManagedIdentity,
    Anonymous,
}

impl Group {
    fn option_name(&self) -> &'static str {
        match self {
            Self::AccountKey => keys::ACCOUNT_KEY,
            Self::SasToken => keys::SAS_TOKEN,
            Self::ServicePrincipal => keys::CLIENT_SECRET,
            Self::AzureCli => keys::USE_AZURE_CLI,
            Self::ManagedIdentity => keys::USE_MANAGED_IDENTITY,
            Self::Anonymous => keys::SKIP_SIGNATURE,
        }
    }
}

/// Resolves a [`Credential`] from storage options and an environment snapshot.
#[derive(Debug, Clone, Default)]
pub struct CredentialResolver {
    env: EnvSnapshot,
}

impl CredentialResolver {
    /// Resolver reading the current process environment
    pub fn new() -> Self {
        Self::with_env(EnvSnapshot::from_process())
    }

    /// Resolver with an explicit environment, resolution is deterministic for a fixed
    /// environment and options.
    pub fn with_env(env: EnvSnapshot) -> Self {
        Self { env }
    }

    /// Pick the credential for `provider`.
    pub fn resolve(
        &self,
        provider: StorageProvider,
        options: &StorageOptions,
    ) -> Result<Credential, CredentialError> {
        if !provider.requires_auth() {
            return Ok(Credential::Anonymous);
        }

        let explicit = explicit_groups(provider, options);
        if explicit.len() > 1 {
            let mut names: Vec<String> = explicit
                .iter()
                .map(|g| g.option_name().to_string())
                .collect();
            names.sort();
            return Err(CredentialError::Ambiguous { options: names });
        }

        if let Some(group) = explicit.first() {
            debug!("using explicitly configured {group:?} credential for {provider}");
            let merged = self.merged(options);
            return build_credential(provider, *group, &merged, &self.env);
        }

        // nothing explicit, fall back to the environment in precedence order
        let merged = self.merged(options);
        for group in explicit_groups(provider, &merged) {
            match build_credential(provider, group, &merged, &self.env) {
                Ok(credential) => {
                    debug!("using {group:?} credential from the environment for {provider}");
                    return Ok(credential);
                }
                Err(CredentialError::Missing { reason, .. }) => {
                    debug!("skipping partial {group:?} credential from the environment: {reason}");
                }
                Err(err) => return Err(err),
            }
        }

        if provider.is_azure() {
            if options.get_bool(keys::USE_EMULATOR) {
                return Ok(Credential::AccountKey(AccountKey::Azure(
                    EMULATOR_ACCOUNT_KEY.to_string(),
                )));
            }
            if let Some(endpoint) = self.env.identity_endpoint() {
                debug!("found managed identity endpoint in the environment");
                return Ok(Credential::ManagedIdentity(managed_identity(
                    &merged,
                    &self.env,
                    Some(endpoint.to_string()),
                )));
            }
            return Err(CredentialError::Missing {
                provider: provider.to_string(),
                reason: "no credential configured, set one of account_key, sas_token, \
                    client_id/client_secret/tenant_id, use_azure_cli, use_managed_identity \
                    or skip_signature"
                    .to_string(),
            });
        }

        // S3 and GCS defer to the provider's default chain (instance profile, metadata server)
        Ok(Credential::ManagedIdentity(ManagedIdentity::default()))
    }

    /// Options augmented with values from the environment, options win.
    fn merged(&self, options: &StorageOptions) -> StorageOptions {
        let mut merged = self.env.options();
        for (key, value) in options.iter() {
            merged.insert(key, value);
        }
        merged
    }
}

/// Credential groups present in `options`, ordered by precedence.
fn explicit_groups(provider: StorageProvider, options: &StorageOptions) -> Vec<Group> {
    let mut groups = Vec::new();
    let has_account_key = match provider {
        StorageProvider::S3 => {
            options.contains(keys::AWS_ACCESS_KEY_ID)
                || options.contains(keys::AWS_SECRET_ACCESS_KEY)
        }
        StorageProvider::Gcs => {
            options.contains(keys::GOOGLE_SERVICE_ACCOUNT_PATH)
                || options.contains(keys::GOOGLE_SERVICE_ACCOUNT_KEY)
        }
        _ => options.contains(keys::ACCOUNT_KEY),
    };
    if has_account_key {
        groups.push(Group::AccountKey);
    }
    if provider.is_azure() {
        if options.contains(keys::SAS_TOKEN) {
            groups.push(Group::SasToken);
        }
        if options.contains(keys::CLIENT_SECRET) {
            groups.push(Group::ServicePrincipal);
        }
        if options.get_bool(keys::USE_AZURE_CLI) {
            groups.push(Group::AzureCli);
        }
        if options.get_bool(keys::USE_MANAGED_IDENTITY)
            || options.contains(keys::MSI_ENDPOINT)
            || options.contains(keys::OBJECT_ID)
            || options.contains(keys::MSI_RESOURCE_ID)
        {
            groups.push(Group::ManagedIdentity);
        }
    }
    if options.get_bool(keys::SKIP_SIGNATURE) {
        groups.push(Group::Anonymous);
    }
    groups
}

fn build_credential(
    provider: StorageProvider,
    group: Group,
    options: &StorageOptions,
    env: &EnvSnapshot,
) -> Result<Credential, CredentialError> {
    let missing = |reason: &str| CredentialError::Missing {
        provider: provider.to_string(),
        reason: reason.to_string(),
    };
    let required = |key: &str| {
        options
            .get(key)
            .map(str::to_string)
            .ok_or_else(|| missing(&format!("`{key}` is required")))
    };

    Ok(match group {
        Group::AccountKey => Credential::AccountKey(match provider {
            StorageProvider::S3 => AccountKey::Aws {
                access_key_id: required(keys::AWS_ACCESS_KEY_ID)?,
                secret_access_key: required(keys::AWS_SECRET_ACCESS_KEY)?,
                session_token: options.get(keys::AWS_SESSION_TOKEN).map(str::to_string),
            },
            StorageProvider::Gcs => match options.get(keys::GOOGLE_SERVICE_ACCOUNT_KEY) {
                Some(key) => AccountKey::GcpServiceAccountKey(key.to_string()),
                None => AccountKey::GcpServiceAccountPath(required(
                    keys::GOOGLE_SERVICE_ACCOUNT_PATH,
                )?),
            },
            _ => AccountKey::Azure(required(keys::ACCOUNT_KEY)?),
        }),
        Group::SasToken => Credential::SasToken(split_sas(&required(keys::SAS_TOKEN)?)?),
        Group::ServicePrincipal => Credential::ServicePrincipal {
            client_id: required(keys::CLIENT_ID)?,
            client_secret: required(keys::CLIENT_SECRET)?,
            tenant_id: required(keys::TENANT_ID)?,
            authority_host: options.get(keys::AUTHORITY_HOST).map(str::to_string),
        },
        Group::AzureCli => Credential::CliDerivedToken,
        Group::ManagedIdentity => {
            let endpoint = options
                .get(keys::MSI_ENDPOINT)
                .or_else(|| env.identity_endpoint())
                .map(str::to_string);
            Credential::ManagedIdentity(managed_identity(options, env, endpoint))
        }
        Group::Anonymous => Credential::Anonymous,
    })
}

fn managed_identity(
    options: &StorageOptions,
    env: &EnvSnapshot,
    endpoint: Option<String>,
) -> ManagedIdentity {
    ManagedIdentity {
        client_id: options.get(keys::CLIENT_ID).map(str::to_string),
        object_id: options.get(keys::OBJECT_ID).map(str::to_string),
        msi_resource_id: options.get(keys::MSI_RESOURCE_ID).map(str::to_string),
        endpoint,
        identity_header: env.get(IDENTITY_HEADER_ENV_KEY).map(str::to_string),
    }
}

/// Split a SAS token into its query pairs
pub(crate) fn split_sas(sas: &str) -> Result<Vec<(String, String)>, CredentialError> {
    let kv_str_pairs = sas
        .trim_start_matches('?')
        .split('&')
        .filter(|s| !s.chars().all(char::is_whitespace));
    let mut pairs = Vec::new();
    for kv_pair_str in kv_str_pairs {
        let (k, v) = kv_pair_str
            .trim()
            .split_once('=')
            .ok_or_else(|| CredentialError::Missing {
                provider: "azure".to_string(),
                reason: format!("malformed sas token segment `{kv_pair_str}`"),
            })?;
        pairs.push((k.into(), v.into()))
    }
    Ok(pairs)
}
