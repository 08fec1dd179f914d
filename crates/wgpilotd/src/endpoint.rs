//! Public endpoint discovery.
//!
//! Clients need a reachable host for the server. An operator can pin one in
//! configuration; otherwise the host's public address is looked up over HTTP
//! and reused for a TTL. A failed lookup falls back to the last known
//! address, however old.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{EngineError, Result};

/// Source of the host's public address.
pub trait AddressLookup: Send + Sync {
    /// Returns the public address as text.
    fn lookup(&self) -> impl Future<Output = Result<String>> + Send;
}

/// Looks the address up from a plain-text HTTP service such as ipify. The
/// body must be a bare IPv4 or IPv6 address.
#[derive(Debug, Clone)]
pub struct HttpLookup {
    url: String,
    timeout: StdDuration,
    client: reqwest::Client,
}

impl HttpLookup {
    /// Creates a lookup against `url`, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: StdDuration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            timeout,
            client,
        })
    }
}

impl AddressLookup for HttpLookup {
    async fn lookup(&self) -> Result<String> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout {
                    operation: format!("GET {}", self.url),
                    after: self.timeout,
                }
            } else {
                EngineError::EndpointLookup(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::EndpointLookup(format!("HTTP {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::EndpointLookup(e.to_string()))?;
        let address = body.trim();
        if address.is_empty() {
            return Err(EngineError::EndpointLookup("empty response".to_string()));
        }
        let ip: IpAddr = address.parse().map_err(|_| {
            let preview: String = address.chars().take(64).collect();
            EngineError::EndpointLookup(format!("response is not an IP address: '{preview}'"))
        })?;
        Ok(ip.to_string())
    }
}

#[derive(Debug, Clone)]
struct CachedAddress {
    address: String,
    fetched_at: Option<DateTime<Utc>>,
}

/// Resolves the public host clients connect to.
#[derive(Debug)]
pub struct PublicEndpointResolver<L> {
    public_host: Option<String>,
    lookup: L,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: Mutex<Option<CachedAddress>>,
}

impl<L: AddressLookup> PublicEndpointResolver<L> {
    /// Creates a resolver. A configured `public_host` wins over the lookup.
    pub fn new(
        public_host: Option<String>,
        lookup: L,
        ttl: StdDuration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            public_host: public_host.filter(|h| !h.trim().is_empty()),
            lookup,
            clock,
            ttl: Duration::from_std(ttl).unwrap_or(Duration::MAX),
            cache: Mutex::new(None),
        }
    }

    /// Returns the public host, or `None` when it has never been known.
    pub async fn resolve(&self) -> Option<String> {
        if let Some(host) = &self.public_host {
            return Some(host.clone());
        }

        let now = self.clock.now();
        if let Some(address) = self.fresh(now) {
            return Some(address);
        }

        match self.lookup.lookup().await {
            Ok(address) => {
                debug!(%address, "public address looked up");
                *self.cache.lock() = Some(CachedAddress {
                    address: address.clone(),
                    fetched_at: Some(now),
                });
                Some(address)
            }
            Err(e) => {
                let stale = self.cached();
                warn!(error = %e, fallback = ?stale, "public address lookup failed");
                stale
            }
        }
    }

    /// Forces the next [`resolve`](Self::resolve) to look the address up.
    /// The current value stays available as a fallback.
    pub fn expire(&self) {
        if let Some(cached) = self.cache.lock().as_mut() {
            cached.fetched_at = None;
        }
    }

    /// Returns the last looked up address regardless of age.
    #[must_use]
    pub fn cached(&self) -> Option<String> {
        self.cache.lock().as_ref().map(|c| c.address.clone())
    }

    fn fresh(&self, now: DateTime<Utc>) -> Option<String> {
        let cache = self.cache.lock();
        let cached = cache.as_ref()?;
        let fetched_at = cached.fetched_at?;
        (now - fetched_at < self.ttl).then(|| cached.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Replays scripted answers and counts calls.
    #[derive(Debug, Default)]
    struct ScriptedLookup {
        answers: Mutex<VecDeque<Result<String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedLookup {
        fn new(answers: Vec<Result<String>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl AddressLookup for ScriptedLookup {
        async fn lookup(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::EndpointLookup("script exhausted".into())))
        }
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).single().expect("valid time"))
    }

    fn resolver(
        public_host: Option<&str>,
        answers: Vec<Result<String>>,
        clock: &ManualClock,
    ) -> PublicEndpointResolver<ScriptedLookup> {
        PublicEndpointResolver::new(
            public_host.map(str::to_string),
            ScriptedLookup::new(answers),
            StdDuration::from_secs(3600),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn configured_host_skips_lookup() {
        let clock = clock();
        let resolver = resolver(Some("vpn.example.com"), vec![], &clock);
        assert_eq!(resolver.resolve().await.as_deref(), Some("vpn.example.com"));
        assert_eq!(resolver.lookup.calls(), 0);
    }

    #[tokio::test]
    async fn lookup_is_cached_for_ttl() {
        let clock = clock();
        let resolver = resolver(
            None,
            vec![Ok("203.0.113.7".into()), Ok("203.0.113.8".into())],
            &clock,
        );

        assert_eq!(resolver.resolve().await.as_deref(), Some("203.0.113.7"));
        clock.advance(Duration::minutes(59));
        assert_eq!(resolver.resolve().await.as_deref(), Some("203.0.113.7"));
        assert_eq!(resolver.lookup.calls(), 1);

        clock.advance(Duration::minutes(1));
        assert_eq!(resolver.resolve().await.as_deref(), Some("203.0.113.8"));
        assert_eq!(resolver.lookup.calls(), 2);
    }

    #[tokio::test]
    async fn failed_lookup_falls_back_to_stale_value() {
        let clock = clock();
        let resolver = resolver(
            None,
            vec![
                Ok("203.0.113.7".into()),
                Err(EngineError::EndpointLookup("offline".into())),
            ],
            &clock,
        );

        resolver.resolve().await;
        clock.advance(Duration::hours(5));
        assert_eq!(resolver.resolve().await.as_deref(), Some("203.0.113.7"));
        assert_eq!(resolver.lookup.calls(), 2);
    }

    #[tokio::test]
    async fn never_known_is_none() {
        let clock = clock();
        let resolver = resolver(None, vec![], &clock);
        assert!(resolver.resolve().await.is_none());
        assert!(resolver.cached().is_none());
    }

    #[tokio::test]
    async fn expire_forces_lookup() {
        let clock = clock();
        let resolver = resolver(
            None,
            vec![Ok("203.0.113.7".into()), Ok("198.51.100.1".into())],
            &clock,
        );

        resolver.resolve().await;
        resolver.expire();
        assert_eq!(resolver.cached().as_deref(), Some("203.0.113.7"));
        assert_eq!(resolver.resolve().await.as_deref(), Some("198.51.100.1"));
    }

    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.expect("write");
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn http_lookup_trims_body() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\n203.0.113.7\n",
        )
        .await;
        let lookup = HttpLookup::new(url, StdDuration::from_secs(5)).expect("client");
        assert_eq!(lookup.lookup().await.expect("lookup"), "203.0.113.7");
    }

    #[tokio::test]
    async fn http_lookup_rejects_error_status() {
        let url = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let lookup = HttpLookup::new(url, StdDuration::from_secs(5)).expect("client");
        assert!(matches!(
            lookup.lookup().await,
            Err(EngineError::EndpointLookup(_))
        ));
    }

    #[tokio::test]
    async fn http_lookup_rejects_non_address_body() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 33\r\n\
             Connection: close\r\n\r\n<html><body>Sign in</body></html>",
        )
        .await;
        let lookup = HttpLookup::new(url, StdDuration::from_secs(5)).expect("client");
        assert!(matches!(
            lookup.lookup().await,
            Err(EngineError::EndpointLookup(_))
        ));
    }

    #[tokio::test]
    async fn http_lookup_accepts_ipv6() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\n2001:db8::7\n",
        )
        .await;
        let lookup = HttpLookup::new(url, StdDuration::from_secs(5)).expect("client");
        assert_eq!(lookup.lookup().await.expect("lookup"), "2001:db8::7");
    }
}
