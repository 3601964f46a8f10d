//! Retry policy for object store requests.
//!
//! `object_store` retries on the HTTP level only and has no notion of our credential cache, so
//! its own retries are switched off and every call made by this crate goes through
//! [`RetryPolicy::run`] instead:
//!
//! - each attempt is bounded by the request timeout
//! - throttling, 5xx, connection failures and timeouts back off exponentially with jitter
//! - an `Unauthenticated` response drops the cached token and the call is repeated once
//! - everything else fails immediately

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use backon::{ExponentialBuilder, Retryable};
use object_store::path::Path;
use object_store::{Error as ObjectStoreError, RetryConfig};
use tracing::{debug, warn};

use crate::credentials::{CacheKey, CredentialError, TokenCache};
use crate::{DeltaResult, DeltaTableError};

/// Error of a single attempt
#[derive(thiserror::Error, Debug)]
pub enum AttemptError {
    /// No response within the request timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The store answered with an error
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
}

impl AttemptError {
    /// Whether repeating the request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            // token acquisition failures surface as generic errors too
            Self::Store(ObjectStoreError::Generic { source, .. }) => {
                !source.is::<CredentialError>()
            }
            Self::Store(_) => false,
        }
    }

    fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Store(ObjectStoreError::Unauthenticated { .. }))
    }
}

/// Drops a cached token so the next request fetches a fresh one.
#[derive(Debug, Clone)]
pub struct CredentialRefresh {
    cache: Arc<TokenCache<String>>,
    key: CacheKey,
}

impl CredentialRefresh {
    #[allow(missing_docs)]
    pub fn new(cache: Arc<TokenCache<String>>, key: CacheKey) -> Self {
        Self { cache, key }
    }

    /// Forget the cached token
    pub fn invalidate(&self) {
        self.cache.invalidate(&self.key)
    }
}

/// How object store calls are bounded and retried
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retry: RetryConfig,
    request_timeout: Duration,
    refresh: Option<CredentialRefresh>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default(), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    /// Retry with `retry` and give up on a single attempt after `request_timeout`
    pub fn new(retry: RetryConfig, request_timeout: Duration) -> Self {
        Self {
            retry,
            request_timeout,
            refresh: None,
        }
    }

    /// Invalidate `refresh` when the store rejects a token
    pub fn with_credential_refresh(mut self, refresh: Option<CredentialRefresh>) -> Self {
        self.refresh = refresh;
        self
    }

    /// Bound on a single attempt
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Attempts after the first one
    pub fn max_retries(&self) -> usize {
        self.retry.max_retries
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.retry.backoff.init_backoff)
            .with_max_delay(self.retry.backoff.max_backoff)
            .with_factor(self.retry.backoff.base as f32)
            .with_max_times(self.retry.max_retries)
            .with_jitter()
    }

    /// Run `op` under this policy. `path` is only used for error reporting.
    pub async fn run<T, F, Fut>(&self, path: &Path, op: F) -> DeltaResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = object_store::Result<T>>,
    {
        let attempts = AtomicUsize::new(0);
        let mut result = self.run_with_backoff(path, &op, &attempts).await;

        if let Some(refresh) = &self.refresh {
            if matches!(&result, Err(err) if err.is_auth_expired()) {
                debug!("credentials rejected for {path}, refreshing and retrying once");
                refresh.invalidate();
                result = self.run_with_backoff(path, &op, &attempts).await;
            }
        }

        result.map_err(|err| {
            let attempts = attempts.load(Ordering::Relaxed);
            match err {
                AttemptError::Store(ObjectStoreError::Unauthenticated { path, source }) => {
                    DeltaTableError::AuthExpired {
                        path: path.clone(),
                        source: ObjectStoreError::Unauthenticated { path, source },
                    }
                }
                AttemptError::Store(ObjectStoreError::Generic { store, source })
                    if source.is::<CredentialError>() =>
                {
                    match source.downcast::<CredentialError>() {
                        Ok(credential) => DeltaTableError::from(*credential),
                        Err(source) => ObjectStoreError::Generic { store, source }.into(),
                    }
                }
                err if err.is_transient() => DeltaTableError::StoreUnavailable {
                    attempts,
                    source: Box::new(err),
                },
                AttemptError::Store(source) => DeltaTableError::ObjectStore { source },
                AttemptError::Timeout(elapsed) => DeltaTableError::StoreUnavailable {
                    attempts,
                    source: Box::new(AttemptError::Timeout(elapsed)),
                },
            }
        })
    }

    async fn run_with_backoff<T, F, Fut>(
        &self,
        path: &Path,
        op: &F,
        attempts: &AtomicUsize,
    ) -> Result<T, AttemptError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = object_store::Result<T>>,
    {
        let started = Instant::now();
        let timeout = self.request_timeout;
        let retry_timeout = self.retry.retry_timeout;

        (|| {
            attempts.fetch_add(1, Ordering::Relaxed);
            let fut = op();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result.map_err(AttemptError::from),
                    Err(_) => Err(AttemptError::Timeout(timeout)),
                }
            }
        })
        .retry(self.backoff())
        .when(|err: &AttemptError| err.is_transient() && started.elapsed() < retry_timeout)
        .notify(|err: &AttemptError, dur: Duration| {
            warn!(
                error = %err,
                "transient error for {path}, retrying in {:.1}s",
                dur.as_secs_f32()
            );
        })
        .await
    }
}
