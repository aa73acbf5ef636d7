//! The process-wide DNS facade every handler resolves through.
//!
//! One `Resolver` per worker: a timeout-bounded hickory resolver with
//! an in-memory LRU cache keyed by `(qname, qtype)`. Answers come back
//! as plain strings so callers never touch resolver record types, and
//! failures collapse into the four-way taxonomy handlers reason about.

use std::{
    net::IpAddr,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    TokioAsyncResolver,
};
use lru::LruCache;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Typed lookup failure.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The name definitively does not exist.
    #[error("NXDOMAIN: {0}")]
    NxDomain(String),

    /// The resolver answered but could not serve the query.
    #[error("DNS server failure for {0}")]
    ServFail(String),

    /// The per-query deadline elapsed.
    #[error("DNS query timed out for {0}")]
    Timeout(String),

    /// The response could not be understood.
    #[error("Malformed DNS response for {0}")]
    Malformed(String),
}

impl DnsError {
    /// `true` when a retry might succeed; handlers map these to
    /// `temperror` rather than `fail`.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::ServFail(_) | Self::Timeout(_))
    }

    fn classify(qname: &str, err: &ResolveError) -> Self {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => Self::NxDomain(qname.to_string()),
            ResolveErrorKind::Timeout => Self::Timeout(qname.to_string()),
            ResolveErrorKind::Proto(_) => Self::Malformed(qname.to_string()),
            _ => Self::ServFail(qname.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Per-query deadline in seconds (default: 5).
    pub timeout_secs: u64,

    /// Cache TTL in seconds (default: 300).
    pub cache_ttl_secs: u64,

    /// Maximum number of cached answer sets (default: 1000).
    pub cache_size: usize,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

const fn default_cache_size() -> usize {
    1000
}

const DEFAULT_CACHE_SIZE_NONZERO: NonZeroUsize = match NonZeroUsize::new(default_cache_size()) {
    Some(size) => size,
    None => unreachable!(),
};

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum QueryType {
    Ptr,
    Addr,
    Txt,
}

#[derive(Debug, Clone)]
struct CachedAnswers {
    answers: Arc<Vec<String>>,
    expires_at: Instant,
}

/// Cached, deadline-bounded resolver.
pub struct Resolver {
    inner: TokioAsyncResolver,
    cache: Mutex<LruCache<(String, QueryType), CachedAnswers>>,
    config: DnsConfig,
}

impl Resolver {
    #[must_use]
    pub fn new(config: DnsConfig) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        Self::with_resolver(
            TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            config,
        )
    }

    #[must_use]
    pub fn with_resolver(inner: TokioAsyncResolver, config: DnsConfig) -> Self {
        let cache_size =
            NonZeroUsize::new(config.cache_size).unwrap_or(DEFAULT_CACHE_SIZE_NONZERO);

        Self {
            inner,
            cache: Mutex::new(LruCache::new(cache_size)),
            config,
        }
    }

    async fn cached(&self, qname: &str, qtype: QueryType) -> Option<Arc<Vec<String>>> {
        let mut cache = self.cache.lock().await;
        let entry = cache.get(&(qname.to_string(), qtype))?;
        if entry.expires_at > Instant::now() {
            debug!("DNS cache hit for {qname} ({qtype:?})");
            return Some(Arc::clone(&entry.answers));
        }
        None
    }

    async fn store(&self, qname: &str, qtype: QueryType, answers: Vec<String>) -> Arc<Vec<String>> {
        let answers = Arc::new(answers);
        let entry = CachedAnswers {
            answers: Arc::clone(&answers),
            expires_at: Instant::now() + Duration::from_secs(self.config.cache_ttl_secs),
        };
        self.cache
            .lock()
            .await
            .put((qname.to_string(), qtype), entry);
        answers
    }

    /// Run `lookup` under the facade deadline, translating both the
    /// elapsed deadline and resolver failures into `DnsError`.
    async fn bounded<F, T>(&self, qname: &str, lookup: F) -> Result<T, DnsError>
    where
        F: std::future::Future<Output = Result<T, ResolveError>>,
    {
        let deadline = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(deadline, lookup).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(err)) => Err(DnsError::classify(qname, &err)),
            Err(_) => Err(DnsError::Timeout(qname.to_string())),
        }
    }

    /// PTR names for `ip`, trailing dots stripped.
    pub async fn lookup_ptr(&self, ip: IpAddr) -> Result<Arc<Vec<String>>, DnsError> {
        let qname = ip.to_string();
        if let Some(answers) = self.cached(&qname, QueryType::Ptr).await {
            return Ok(answers);
        }

        let lookup = self.bounded(&qname, self.inner.reverse_lookup(ip)).await?;
        let names = lookup
            .iter()
            .map(|ptr| ptr.to_string().trim_end_matches('.').to_string())
            .collect();

        Ok(self.store(&qname, QueryType::Ptr, names).await)
    }

    /// A/AAAA addresses for `name`, as strings.
    pub async fn lookup_ip(&self, name: &str) -> Result<Arc<Vec<String>>, DnsError> {
        if let Some(answers) = self.cached(name, QueryType::Addr).await {
            return Ok(answers);
        }

        let lookup = self.bounded(name, self.inner.lookup_ip(name)).await?;
        let addrs = lookup.iter().map(|ip| ip.to_string()).collect();

        Ok(self.store(name, QueryType::Addr, addrs).await)
    }

    /// TXT records for `name`, character-strings concatenated per
    /// record.
    pub async fn lookup_txt(&self, name: &str) -> Result<Arc<Vec<String>>, DnsError> {
        if let Some(answers) = self.cached(name, QueryType::Txt).await {
            return Ok(answers);
        }

        let lookup = self.bounded(name, self.inner.txt_lookup(name)).await?;
        let texts = lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .concat()
            })
            .collect();

        Ok(self.store(name, QueryType::Txt, texts).await)
    }

    /// Forward-confirmed reverse DNS (the iprev property): the first
    /// PTR name of `ip` whose forward lookup contains `ip` again.
    ///
    /// `Ok(None)` means PTR records exist but none confirm.
    pub async fn verify_ptr(&self, ip: IpAddr) -> Result<Option<String>, DnsError> {
        let names = self.lookup_ptr(ip).await?;
        let ip_text = ip.to_string();

        for name in names.iter() {
            match self.lookup_ip(name).await {
                Ok(addrs) if addrs.iter().any(|addr| *addr == ip_text) => {
                    return Ok(Some(name.clone()));
                }
                // An unconfirmable name is not an error; try the rest.
                Ok(_) | Err(DnsError::NxDomain(_)) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(None)
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_taxonomy_temporariness() {
        assert!(DnsError::Timeout("example.com".to_string()).is_temporary());
        assert!(DnsError::ServFail("example.com".to_string()).is_temporary());
        assert!(!DnsError::NxDomain("example.com".to_string()).is_temporary());
        assert!(!DnsError::Malformed("example.com".to_string()).is_temporary());
    }

    #[test]
    fn config_defaults() {
        let config = DnsConfig::default();
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.cache_ttl_secs, 300);
        assert_eq!(config.cache_size, 1000);
    }

    #[tokio::test]
    async fn cache_stores_and_expires() {
        let resolver = Resolver::new(DnsConfig {
            cache_ttl_secs: 3600,
            ..DnsConfig::default()
        });

        let stored = resolver
            .store("example.com", QueryType::Addr, vec!["192.0.2.1".to_string()])
            .await;
        assert_eq!(stored.as_slice(), ["192.0.2.1".to_string()]);

        let hit = resolver.cached("example.com", QueryType::Addr).await;
        assert_eq!(hit.as_deref().map(Vec::as_slice), Some(stored.as_slice()));

        // Same name under a different query type misses.
        assert!(resolver.cached("example.com", QueryType::Txt).await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let resolver = Resolver::new(DnsConfig {
            cache_ttl_secs: 0,
            ..DnsConfig::default()
        });

        resolver
            .store("example.com", QueryType::Ptr, vec!["mx.example.com".to_string()])
            .await;
        assert!(resolver.cached("example.com", QueryType::Ptr).await.is_none());
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn reverse_lookup_roundtrip() {
        let resolver = Resolver::new(DnsConfig::default());
        let names = resolver.lookup_ptr("1.1.1.1".parse().unwrap()).await;
        assert!(names.is_ok());
    }
}
