//! TTL-bound DNS cache for proxy targets.
//!
//! Concurrent callers for the same hostname share a single in-flight
//! resolution: each hostname owns a slot lock that is held across the
//! lookup, so a second caller waits on the slot instead of launching a
//! duplicate query. Failed resolutions propagate and are never cached.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Result, WorkspaceError};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Hostname resolution, swappable for tests.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>>;
}

/// System resolver via tokio's `lookup_host`.
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        let addrs =
            tokio::net::lookup_host((hostname, 0))
                .await
                .map_err(|e| WorkspaceError::Internal {
                    reason: format!("DNS resolution failed for {hostname}: {e}"),
                })?;

        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for addr in addrs {
            let ip = addr.ip();
            if seen.insert(ip) {
                result.push(ip);
            }
        }
        Ok(result)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
}

/// Async TTL cache over a [`Resolver`].
pub struct DnsCache {
    ttl: Duration,
    resolver: Arc<dyn Resolver>,
    slots: Mutex<HashMap<String, Arc<Mutex<Option<CacheEntry>>>>>,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_resolver(ttl, Arc::new(SystemResolver))
    }

    pub fn with_resolver(ttl: Duration, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            ttl,
            resolver,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a hostname, serving from cache while the entry is fresh.
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(hostname.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };

        // Holding the slot lock across the lookup is what deduplicates
        // concurrent resolutions of the same hostname.
        let mut entry = slot.lock().await;
        if let Some(cached) = entry.as_ref()
            && cached.expires_at > Instant::now()
        {
            tracing::debug!("DNS cache hit for {}", hostname);
            return Ok(cached.addresses.clone());
        }

        let addresses = self.resolver.resolve(hostname).await?;
        *entry = Some(CacheEntry {
            addresses: addresses.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        tracing::debug!(
            "DNS resolved {} to {} address(es), cached for {:?}",
            hostname,
            addresses.len(),
            self.ttl
        );
        Ok(addresses)
    }

    /// Drop every cached entry.
    pub async fn clear(&self) {
        let mut slots = self.slots.lock().await;
        let count = slots.len();
        slots.clear();
        tracing::info!("DNS cache cleared ({} entries)", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingResolver {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Resolver for CountingResolver {
        async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Simulate lookup latency so concurrent callers overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(WorkspaceError::Internal {
                    reason: format!("no such host: {hostname}"),
                });
            }
            Ok(vec!["93.184.216.34".parse().unwrap()])
        }
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let resolver = CountingResolver::new(false);
        let cache = DnsCache::with_resolver(Duration::from_secs(60), resolver.clone());

        let first = cache.resolve("example.com").await.unwrap();
        let second = cache.resolve("example.com").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refreshed() {
        let resolver = CountingResolver::new(false);
        let cache = DnsCache::with_resolver(Duration::from_millis(10), resolver.clone());

        cache.resolve("example.com").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.resolve("example.com").await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_lookup() {
        let resolver = CountingResolver::new(false);
        let cache = Arc::new(DnsCache::with_resolver(
            Duration::from_secs(60),
            resolver.clone(),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.resolve("example.com").await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let resolver = CountingResolver::new(true);
        let cache = DnsCache::with_resolver(Duration::from_secs(60), resolver.clone());

        assert!(cache.resolve("missing.example").await.is_err());
        assert!(cache.resolve("missing.example").await.is_err());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_forces_new_lookup() {
        let resolver = CountingResolver::new(false);
        let cache = DnsCache::with_resolver(Duration::from_secs(60), resolver.clone());

        cache.resolve("example.com").await.unwrap();
        cache.clear().await;
        cache.resolve("example.com").await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }
}
