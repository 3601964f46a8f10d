//! Process wide cache of short lived tokens.
//!
//! Tokens are keyed by provider, account and credential kind. At most one refresh per key is
//! in flight at a time; concurrent callers await the same request.
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use super::{CredentialError, CredentialKind};
use crate::storage::location::StorageProvider;

/// Tokens expiring within this window are refreshed before use
pub const DEFAULT_MIN_TTL: Duration = Duration::from_secs(300);

static GLOBAL_TOKEN_CACHE: LazyLock<Arc<TokenCache<String>>> =
    LazyLock::new(|| Arc::new(TokenCache::default()));

/// The cache shared by all tables that do not bring their own.
pub fn global_token_cache() -> Arc<TokenCache<String>> {
    GLOBAL_TOKEN_CACHE.clone()
}

/// A token and when it stops being valid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryToken<T> {
    /// The temporary credential
    pub token: T,
    /// The instant at which this credential is no longer valid,
    /// `None` means the credential does not expire
    pub expiry: Option<Instant>,
}

/// Identifies one cached token: a credential of one kind for one account
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    #[allow(missing_docs)]
    pub provider: StorageProvider,
    /// Storage account, bucket or other tenant the token was issued for
    pub account: String,
    #[allow(missing_docs)]
    pub kind: CredentialKind,
}

impl CacheKey {
    #[allow(missing_docs)]
    pub fn new(
        provider: StorageProvider,
        account: impl Into<String>,
        kind: CredentialKind,
    ) -> Self {
        Self {
            provider,
            account: account.into(),
            kind,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.account, self.kind)
    }
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<TemporaryToken<T>, CredentialError>>>;

enum Slot<T> {
    Ready(TemporaryToken<T>),
    Refreshing { generation: u64, fetch: SharedFetch<T> },
}

impl<T> Slot<T> {
    fn is_refreshing(&self, generation: u64) -> bool {
        matches!(self, Slot::Refreshing { generation: g, .. } if *g == generation)
    }
}

enum Lookup<T> {
    Fresh(T),
    Pending(u64, SharedFetch<T>),
    Stale,
}

/// Single-flight token cache.
pub struct TokenCache<T> {
    slots: DashMap<CacheKey, Slot<T>>,
    generation: AtomicU64,
    min_ttl: Duration,
}

impl<T> Default for TokenCache<T> {
    fn default() -> Self {
        Self::with_min_ttl(DEFAULT_MIN_TTL)
    }
}

impl<T> fmt::Debug for TokenCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("entries", &self.slots.len())
            .field("min_ttl", &self.min_ttl)
            .finish()
    }
}

impl<T> TokenCache<T> {
    /// Empty cache that refreshes tokens with less than `min_ttl` left
    pub fn with_min_ttl(min_ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            generation: AtomicU64::new(0),
            min_ttl,
        }
    }

    fn is_fresh(&self, token: &TemporaryToken<T>) -> bool {
        match token.expiry {
            Some(expiry) => {
                let remaining = expiry.checked_duration_since(Instant::now());
                remaining.unwrap_or_default() > self.min_ttl
            }
            None => true,
        }
    }

    /// Drop a cached token so the next caller fetches a new one.
    ///
    /// A refresh already in flight is left alone.
    pub fn invalidate(&self, key: &CacheKey) {
        if self
            .slots
            .remove_if(key, |_, slot| matches!(slot, Slot::Ready(_)))
            .is_some()
        {
            debug!("invalidated cached token for {key}");
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TokenCache<T> {
    /// Return the cached token for `key`, calling `fetch` if there is none or it is about
    /// to expire. Callers arriving while a fetch runs share its result. Failures are not
    /// cached.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
    ) -> Result<T, CredentialError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TemporaryToken<T>, CredentialError>> + Send + 'static,
    {
        // the map guard must be released before awaiting
        let (generation, pending) = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let lookup = match entry.get() {
                    Slot::Ready(token) if self.is_fresh(token) => {
                        Lookup::Fresh(token.token.clone())
                    }
                    Slot::Refreshing { generation, fetch } => {
                        Lookup::Pending(*generation, fetch.clone())
                    }
                    Slot::Ready(_) => Lookup::Stale,
                };
                match lookup {
                    Lookup::Fresh(token) => return Ok(token),
                    Lookup::Pending(generation, pending) => (generation, pending),
                    Lookup::Stale => {
                        debug!("cached token for {key} is expiring, refreshing");
                        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                        let pending = fetch().boxed().shared();
                        entry.insert(Slot::Refreshing {
                            generation,
                            fetch: pending.clone(),
                        });
                        (generation, pending)
                    }
                }
            }
            Entry::Vacant(entry) => {
                debug!("fetching token for {key}");
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let pending = fetch().boxed().shared();
                entry.insert(Slot::Refreshing {
                    generation,
                    fetch: pending.clone(),
                });
                (generation, pending)
            }
        };

        let result = pending.await;
        match &result {
            Ok(token) => {
                if let Some(mut slot) = self.slots.get_mut(key) {
                    if slot.is_refreshing(generation) {
                        *slot = Slot::Ready(token.clone());
                    }
                }
            }
            Err(_) => {
                self.slots
                    .remove_if(key, |_, slot| slot.is_refreshing(generation));
            }
        }
        result.map(|token| token.token)
    }
}
