//! Token sources for Azure storage.
//!
//! Service principal, CLI and managed identity tokens are requested by the types in this module
//! and handed to `object_store` through [`CachedTokenProvider`], so every table pointing at the
//! same account shares a token.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use object_store::azure::AzureCredential;
use object_store::CredentialProvider;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{CacheKey, Credential, CredentialError, ManagedIdentity, TemporaryToken, TokenCache};

/// Resource all storage tokens are requested for
pub const STORAGE_RESOURCE: &str = "https://storage.azure.com";
const CONTENT_TYPE_JSON: &str = "application/json";
const MSI_API_VERSION: &str = "2019-08-01";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// A list of known Azure authority hosts
pub mod authority_hosts {
    /// China-based Azure Authority Host
    pub const AZURE_CHINA: &str = "https://login.chinacloudapi.cn";
    /// Germany-based Azure Authority Host
    pub const AZURE_GERMANY: &str = "https://login.microsoftonline.de";
    /// US Government Azure Authority Host
    pub const AZURE_GOVERNMENT: &str = "https://login.microsoftonline.us";
    /// Public Cloud Azure Authority Host
    pub const AZURE_PUBLIC_CLOUD: &str = "https://login.microsoftonline.com";
}

/// Source of expiring bearer tokens
#[async_trait::async_trait]
pub trait TokenCredential: std::fmt::Debug + Send + Sync + 'static {
    /// get the token
    async fn fetch_token(&self) -> Result<TemporaryToken<String>, CredentialError>;
}

/// The token source for a resolved credential, if it is token based.
pub fn token_credential(
    credential: &Credential,
    client: Client,
) -> Option<Arc<dyn TokenCredential>> {
    match credential {
        Credential::ServicePrincipal {
            client_id,
            client_secret,
            tenant_id,
            authority_host,
        } => Some(Arc::new(ClientSecretOAuthProvider::new(
            client_id,
            client_secret,
            tenant_id,
            authority_host.clone(),
            client,
        ))),
        Credential::CliDerivedToken => Some(Arc::new(AzureCliCredential::new())),
        Credential::ManagedIdentity(identity) => Some(Arc::new(
            ImdsManagedIdentityOAuthProvider::new(identity.clone(), client),
        )),
        _ => None,
    }
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

async fn non200_or_json<T: DeserializeOwned>(
    endpoint: &str,
    response: Response,
) -> Result<T, CredentialError> {
    let status = response.status();
    let body = response.text().await.map_err(|err| request_error(endpoint, err))?;
    if !status.is_success() {
        return Err(CredentialError::InvalidResponse {
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|err| CredentialError::TokenRequest {
        endpoint: endpoint.to_string(),
        message: format!("failed to parse token response: {err}"),
    })
}

fn request_error(endpoint: &str, err: reqwest::Error) -> CredentialError {
    CredentialError::TokenRequest {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    }
}

/// Azure AD application authenticating with a client secret
#[derive(Debug, Clone)]
pub struct ClientSecretOAuthProvider {
    token_url: String,
    client_id: String,
    client_secret: String,
    client: Client,
}

impl ClientSecretOAuthProvider {
    /// Create a new [`ClientSecretOAuthProvider`]
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        tenant_id: impl AsRef<str>,
        authority_host: Option<String>,
        client: Client,
    ) -> Self {
        let authority_host =
            authority_host.unwrap_or_else(|| authority_hosts::AZURE_PUBLIC_CLOUD.to_owned());

        Self {
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                authority_host.trim_end_matches('/'),
                tenant_id.as_ref()
            ),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl TokenCredential for ClientSecretOAuthProvider {
    async fn fetch_token(&self) -> Result<TemporaryToken<String>, CredentialError> {
        let response = self
            .client
            .request(Method::POST, &self.token_url)
            .header(ACCEPT, HeaderValue::from_static(CONTENT_TYPE_JSON))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", &format!("{STORAGE_RESOURCE}/.default")),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|err| request_error(&self.token_url, err))?;

        let response: TokenResponse = non200_or_json(&self.token_url, response).await?;

        Ok(TemporaryToken {
            token: response.access_token,
            expiry: Some(Instant::now() + Duration::from_secs(response.expires_in)),
        })
    }
}

mod az_cli_date_format {
    use chrono::{DateTime, TimeZone};
    use serde::{self, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<chrono::Local>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        // expiresOn from azure cli uses the local timezone
        let date = chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S.%6f")
            .map_err(serde::de::Error::custom)?;
        chrono::Local
            .from_local_datetime(&date)
            .single()
            .ok_or(serde::de::Error::custom(
                "azure cli returned ambiguous expiry date",
            ))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureCliTokenResponse {
    pub access_token: String,
    #[serde(with = "az_cli_date_format")]
    pub expires_on: chrono::DateTime<chrono::Local>,
    pub token_type: String,
}

/// Credential for acquiring access tokens via the Azure CLI
#[derive(Default, Debug, Clone)]
pub struct AzureCliCredential {
    program: Option<PathBuf>,
}

impl AzureCliCredential {
    /// Create a new instance of [`AzureCliCredential`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `program` instead of `az`.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn command(&self) -> tokio::process::Command {
        let mut command = match &self.program {
            Some(program) => tokio::process::Command::new(program),
            // on windows az is a cmd and it should be called like this
            None if cfg!(target_os = "windows") => {
                let mut command = tokio::process::Command::new("cmd");
                command.args(["/C", "az"]);
                command
            }
            None => tokio::process::Command::new("az"),
        };
        command.args([
            "account",
            "get-access-token",
            "--output",
            "json",
            "--resource",
            STORAGE_RESOURCE,
        ]);
        command
    }
}

#[async_trait::async_trait]
impl TokenCredential for AzureCliCredential {
    async fn fetch_token(&self) -> Result<TemporaryToken<String>, CredentialError> {
        debug!("requesting storage token from the azure cli");
        match self.command().output().await {
            Ok(az_output) if az_output.status.success() => {
                let output = std::str::from_utf8(&az_output.stdout).map_err(|_| {
                    CredentialError::AzureCli {
                        message: "az response is not a valid utf-8 string".to_string(),
                    }
                })?;

                let token_response = serde_json::from_str::<AzureCliTokenResponse>(output)
                    .map_err(|err| CredentialError::AzureCli {
                        message: format!("failed deserializing token response: {err:?}"),
                    })?;
                if !token_response.token_type.eq_ignore_ascii_case("bearer") {
                    return Err(CredentialError::AzureCli {
                        message: format!(
                            "got unexpected token type from azure cli: {0}",
                            token_response.token_type
                        ),
                    });
                }
                let duration =
                    token_response.expires_on.naive_local() - chrono::Local::now().naive_local();
                Ok(TemporaryToken {
                    token: token_response.access_token,
                    expiry: Some(
                        Instant::now()
                            + duration.to_std().map_err(|_| CredentialError::AzureCli {
                                message: "az returned invalid lifetime".to_string(),
                            })?,
                    ),
                })
            }
            Ok(az_output) => {
                let message = String::from_utf8_lossy(&az_output.stderr);
                Err(CredentialError::AzureCli {
                    message: message.trim().into(),
                })
            }
            Err(e) => match e.kind() {
                std::io::ErrorKind::NotFound => Err(CredentialError::AzureCli {
                    message: "Azure Cli not installed".into(),
                }),
                error_kind => Err(CredentialError::AzureCli {
                    message: format!("io error: {error_kind:?}"),
                }),
            },
        }
    }
}

fn expires_in_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    v.parse::<u64>().map_err(serde::de::Error::custom)
}

// IMDS sends `expires_in` as a string
#[derive(Debug, Clone, Deserialize)]
struct MsiTokenResponse {
    pub access_token: String,
    #[serde(deserialize_with = "expires_in_string")]
    pub expires_in: u64,
}

/// Token source for the managed identity of the host, asked through the instance metadata
/// endpoint.
#[derive(Debug)]
pub struct ImdsManagedIdentityOAuthProvider {
    msi_endpoint: String,
    identity: ManagedIdentity,
    client: Client,
}

impl ImdsManagedIdentityOAuthProvider {
    /// Create a new [`ImdsManagedIdentityOAuthProvider`] for an azure backed store
    pub fn new(identity: ManagedIdentity, client: Client) -> Self {
        let msi_endpoint = identity
            .endpoint
            .clone()
            .unwrap_or_else(|| IMDS_ENDPOINT.to_owned());

        Self {
            msi_endpoint,
            identity,
            client,
        }
    }
}

#[async_trait::async_trait]
impl TokenCredential for ImdsManagedIdentityOAuthProvider {
    async fn fetch_token(&self) -> Result<TemporaryToken<String>, CredentialError> {
        let mut query_items = vec![
            ("api-version", MSI_API_VERSION),
            ("resource", STORAGE_RESOURCE),
        ];

        let identity = [
            ("client_id", &self.identity.client_id),
            ("object_id", &self.identity.object_id),
            ("msi_res_id", &self.identity.msi_resource_id),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
        .last();
        if let Some(item) = identity {
            query_items.push(item);
        }

        let mut builder = self
            .client
            .request(Method::GET, &self.msi_endpoint)
            .header("metadata", "true")
            .query(&query_items);

        if let Some(header) = &self.identity.identity_header {
            builder = builder.header("x-identity-header", header);
        };

        let response = builder
            .send()
            .await
            .map_err(|err| request_error(&self.msi_endpoint, err))?;

        let response: MsiTokenResponse = non200_or_json(&self.msi_endpoint, response).await?;

        Ok(TemporaryToken {
            token: response.access_token,
            expiry: Some(Instant::now() + Duration::from_secs(response.expires_in)),
        })
    }
}

/// Bridges a [`TokenCredential`] and a shared [`TokenCache`] into an `object_store`
/// credential provider.
#[derive(Debug)]
pub struct CachedTokenProvider {
    key: CacheKey,
    cache: Arc<TokenCache<String>>,
    credential: Arc<dyn TokenCredential>,
}

impl CachedTokenProvider {
    /// Serve tokens of `credential` through `cache` under `key`
    pub fn new(
        key: CacheKey,
        cache: Arc<TokenCache<String>>,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self {
            key,
            cache,
            credential,
        }
    }
}

#[async_trait::async_trait]
impl CredentialProvider for CachedTokenProvider {
    type Credential = AzureCredential;

    async fn get_credential(&self) -> object_store::Result<Arc<AzureCredential>> {
        let credential = self.credential.clone();
        let token = self
            .cache
            .get_or_refresh(&self.key, move || async move { credential.fetch_token().await })
            .await
            .map_err(|source| object_store::Error::Generic {
                store: "MicrosoftAzure",
                source: Box::new(source),
            })?;
        Ok(Arc::new(AzureCredential::BearerToken(token)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use httpmock::prelude::*;

    use super::*;
    use crate::credentials::CredentialKind;
    use crate::storage::location::StorageProvider;

    #[tokio::test]
    async fn test_managed_identity() {
        let server = MockServer::start_async().await;

        let mock = server
            .mock_async(|when, then| {
                when.path("/metadata/identity/oauth2/token")
                    .query_param("client_id", "client_id")
                    .query_param("api-version", MSI_API_VERSION)
                    .query_param("resource", STORAGE_RESOURCE)
                    .method(GET)
                    .header("x-identity-header", "env-secret")
                    .header("metadata", "true");
                then.body(
                    r#"
            {
                "access_token": "TOKEN",
                "refresh_token": "",
                "expires_in": "3599",
                "expires_on": "1506484173",
                "not_before": "1506480273",
                "resource": "https://storage.azure.com",
                "token_type": "Bearer"
              }
            "#,
                );
            })
            .await;

        let credential = ImdsManagedIdentityOAuthProvider::new(
            ManagedIdentity {
                client_id: Some("client_id".into()),
                endpoint: Some(server.url("/metadata/identity/oauth2/token")),
                identity_header: Some("env-secret".into()),
                ..Default::default()
            },
            Client::new(),
        );

        let token = credential.fetch_token().await.unwrap();

        assert_eq!(&token.token, "TOKEN");
        assert!(token.expiry.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_secret() {
        let server = MockServer::start_async().await;
        let tenant = "tenant";

        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(format!("/{tenant}/oauth2/v2.0/token"))
                    .body_contains("grant_type=client_credentials")
                    .body_contains("client_secret=secret");
                then.body(
                    r#"{
                        "access_token": "SP_TOKEN",
                        "token_type": "Bearer",
                        "expires_in": 3599
                    }"#,
                );
            })
            .await;

        let credential = ClientSecretOAuthProvider::new(
            "client_id",
            "secret",
            tenant,
            Some(server.base_url()),
            Client::new(),
        );
        let token = credential.fetch_token().await.unwrap();
        assert_eq!(&token.token, "SP_TOKEN");
    }

    #[tokio::test]
    async fn test_invalid_response_code() {
        let server = MockServer::start_async().await;

        server
            .mock_async(|when, then| {
                when.path("/tenant/oauth2/v2.0/token");
                then.status(401).body("invalid_client");
            })
            .await;

        let credential = ClientSecretOAuthProvider::new(
            "client_id",
            "client_secret",
            "tenant",
            Some(server.base_url()),
            Client::new(),
        );

        let err = credential.fetch_token().await.unwrap_err();
        assert_eq!(
            err,
            CredentialError::InvalidResponse {
                status: 401,
                body: "invalid_client".to_string()
            }
        );
    }

    #[derive(Debug, Default)]
    struct CountingCredential {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TokenCredential for CountingCredential {
        async fn fetch_token(&self) -> Result<TemporaryToken<String>, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TemporaryToken {
                token: format!("token-{n}"),
                expiry: Some(Instant::now() + Duration::from_secs(3600)),
            })
        }
    }

    #[tokio::test]
    async fn test_cached_provider_reuses_token() {
        let cache = Arc::new(TokenCache::default());
        let counting = Arc::new(CountingCredential::default());
        let key = CacheKey::new(
            StorageProvider::AzureBlobSecure,
            "account",
            CredentialKind::ManagedIdentity,
        );
        let first = CachedTokenProvider::new(key.clone(), cache.clone(), counting.clone());
        let second = CachedTokenProvider::new(key, cache, counting.clone());

        for provider in [&first, &second, &first] {
            let credential = provider.get_credential().await.unwrap();
            assert!(
                matches!(credential.as_ref(), AzureCredential::BearerToken(t) if t == "token-1")
            );
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    fn fake_az(dir: &std::path::Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("az");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial_test::serial]
    async fn test_azure_cli_token() {
        let dir = tempfile::tempdir().unwrap();
        let expires_on = (chrono::Local::now() + chrono::Duration::hours(1))
            .format("%Y-%m-%d %H:%M:%S%.6f")
            .to_string();
        let script = format!(
            "#!/bin/sh\necho '{{\"accessToken\":\"cli-token\",\"expiresOn\":\"{expires_on}\",\"tokenType\":\"Bearer\"}}'\n"
        );
        let credential = AzureCliCredential::with_program(fake_az(dir.path(), &script));

        let token = credential.fetch_token().await.unwrap();
        assert_eq!(token.token, "cli-token");
        let remaining = token.expiry.unwrap() - Instant::now();
        assert!(remaining > Duration::from_secs(3000));
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial_test::serial]
    async fn test_azure_cli_not_logged_in() {
        let dir = tempfile::tempdir().unwrap();
        let script = "#!/bin/sh\necho 'Please run az login' >&2\nexit 1\n";
        let credential = AzureCliCredential::with_program(fake_az(dir.path(), script));

        let err = credential.fetch_token().await.unwrap_err();
        assert_eq!(
            err,
            CredentialError::AzureCli {
                message: "Please run az login".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_azure_cli_missing_binary() {
        let credential = AzureCliCredential::with_program("/nonexistent/bin/az");
        let err = credential.fetch_token().await.unwrap_err();
        assert!(matches!(
            err,
            CredentialError::AzureCli { message } if message.contains("not installed")
        ));
    }
}
