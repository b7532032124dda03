//! Host public key resolution with a time-bounded cache.

use crate::error::EngineError;
use crate::services::HostKeyDirectory;
use log::{debug, warn};
use meterlink_crypto::PublicKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Looks up host keys through a primary directory, then an optional
/// fallback, caching successful lookups for `ttl`.
pub struct CachedHostKeys {
    primary: Arc<dyn HostKeyDirectory>,
    fallback: Option<Arc<dyn HostKeyDirectory>>,
    ttl: Duration,
    cache: RwLock<HashMap<String, (PublicKey, Instant)>>,
}

impl CachedHostKeys {
    pub fn new(
        primary: Arc<dyn HostKeyDirectory>,
        fallback: Option<Arc<dyn HostKeyDirectory>>,
        ttl: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the public key of `host_address`.
    pub async fn resolve(&self, host_address: &str) -> Result<PublicKey, EngineError> {
        let cache_key = host_address.to_ascii_lowercase();
        if let Some((key, fetched_at)) = self.cache.read().get(&cache_key).cloned()
            && fetched_at.elapsed() < self.ttl
        {
            return Ok(key);
        }

        let mut last_error = None;
        let directories = std::iter::once(&self.primary).chain(self.fallback.as_ref());
        for directory in directories {
            match directory.host_public_key(host_address).await {
                Ok(Some(key)) => {
                    debug!("host key resolved (host={})", host_address);
                    self.cache
                        .write()
                        .insert(cache_key, (key.clone(), Instant::now()));
                    return Ok(key);
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!("host key lookup failed (host={}, err={})", host_address, err);
                    last_error = Some(err);
                }
            }
        }

        let reason = match last_error {
            Some(err) => format!("{host_address}: {err}"),
            None => host_address.to_string(),
        };
        Err(EngineError::HostKeyUnavailable(reason))
    }

    /// Drop a cached key, e.g. after the host rotated it.
    pub fn invalidate(&self, host_address: &str) {
        self.cache.write().remove(&host_address.to_ascii_lowercase());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use async_trait::async_trait;
    use meterlink_crypto::generate_secret_key;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDirectory {
        key: Option<PublicKey>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl CountingDirectory {
        fn new(key: Option<PublicKey>, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                key,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HostKeyDirectory for CountingDirectory {
        async fn host_public_key(
            &self,
            _host_address: &str,
        ) -> Result<Option<PublicKey>, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CollaboratorError::new("directory offline"));
            }
            Ok(self.key.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn caches_until_ttl_expires() {
        let key = generate_secret_key().public_key();
        let primary = CountingDirectory::new(Some(key.clone()), false);
        let keys = CachedHostKeys::new(primary.clone(), None, Duration::from_secs(60));

        assert_eq!(keys.resolve("0xHost").await.expect("first"), key);
        assert_eq!(keys.resolve("0xhost").await.expect("cached"), key);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        keys.resolve("0xhost").await.expect("refetched");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn falls_back_when_primary_has_no_key() {
        let key = generate_secret_key().public_key();
        let primary = CountingDirectory::new(None, true);
        let fallback = CountingDirectory::new(Some(key.clone()), false);
        let keys = CachedHostKeys::new(primary, Some(fallback), Duration::from_secs(60));
        assert_eq!(keys.resolve("0xhost").await.expect("fallback"), key);
    }

    #[tokio::test]
    async fn reports_unavailable_when_no_directory_knows_the_host() {
        let keys = CachedHostKeys::new(
            CountingDirectory::new(None, false),
            None,
            Duration::from_secs(60),
        );
        let err = keys.resolve("0xhost").await.unwrap_err();
        assert!(matches!(err, EngineError::HostKeyUnavailable(_)));
    }
}
