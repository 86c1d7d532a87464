//! Lazily-created, per-authority `reqwest::Client`s, shared for the
//! process lifetime.
//!
//! Client construction is single-flight: two concurrent misses on the same
//! authority must observe the same client. `moka::future::Cache::try_get_with`
//! gives us that directly — the first caller to miss a key runs the init
//! future and installs the result; every other concurrent caller awaits the
//! same in-flight future instead of racing a second construction, the
//! "load-or-store" pattern called out in DESIGN.md.
//!
//! Per-host connection count is bounded two ways: `pool_max_idle_per_host`
//! caps how many *idle* connections `reqwest` keeps warm, and a
//! per-authority `tokio::sync::Semaphore` caps how many requests may have a
//! connection open to that authority at once (idle or not). The semaphore is
//! acquired by the caller (see `worker.rs::perform_request`) around the
//! client call and held for the lifetime of that request.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Error;
use crate::metrics::Metrics;

/// Client construction knobs, resolved once from CLI flags.
#[derive(Debug, Clone, Copy)]
pub struct ClientPoolConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_idle_connections_per_host: usize,
    pub max_connections_per_host: usize,
}

impl Default for ClientPoolConfig {
    fn default() -> Self {
        ClientPoolConfig {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_idle_connections_per_host: 0,
            max_connections_per_host: 0,
        }
    }
}

pub struct ClientPool {
    config: ClientPoolConfig,
    metrics: Arc<Metrics>,
    clients: Cache<String, Arc<reqwest::Client>>,
    semaphores: Cache<String, Arc<Semaphore>>,
}

impl ClientPool {
    pub fn new(config: ClientPoolConfig, metrics: Arc<Metrics>) -> Self {
        let eviction_metrics = Arc::clone(&metrics);
        ClientPool {
            config,
            metrics,
            // Unbounded by entry count: one entry per distinct authority seen
            // during a replay, which is small relative to request volume.
            clients: Cache::builder()
                .eviction_listener(move |authority: Arc<String>, _client, _cause| {
                    eviction_metrics.inc_connections_closed(&authority);
                })
                .build(),
            semaphores: Cache::builder().build(),
        }
    }

    /// Returns the shared client for `authority`, building one on first use.
    /// `is_tls` only affects which default TLS backend negotiation
    /// `reqwest` performs; the same client handles both schemes, so TLS and
    /// plaintext requests to the same authority (an unusual capture, but
    /// not invalid) would share a client. In practice an authority implies
    /// one scheme, since the authority is derived per-request from that
    /// request's own URL.
    pub async fn get(&self, authority: &str) -> Result<Arc<reqwest::Client>, Error> {
        let config = self.config;
        let metrics = Arc::clone(&self.metrics);
        let authority_owned = authority.to_string();
        self.clients
            .try_get_with(authority_owned.clone(), async move {
                let result = build_client(config);
                match &result {
                    Ok(_) => metrics.inc_connections_opened(&authority_owned),
                    Err(_) => metrics.inc_connections_failed(&authority_owned),
                }
                result
            })
            .await
            .map_err(|e: Arc<Error>| Error::BadInput(format!("client construction failed: {e}")))
    }

    /// Acquires one of `max_connections_per_host` in-flight slots for
    /// `authority`, creating that authority's semaphore on first use.
    /// Returns `None` when the cap is disabled (`max_connections_per_host ==
    /// 0`); the permit, once held, must be kept alive for the duration of
    /// the request it bounds.
    pub async fn acquire(&self, authority: &str) -> Option<OwnedSemaphorePermit> {
        let max = self.config.max_connections_per_host;
        if max == 0 {
            return None;
        }

        let semaphore = self
            .semaphores
            .get_with(authority.to_string(), async move { Arc::new(Semaphore::new(max)) })
            .await;

        semaphore.acquire_owned().await.ok()
    }

    pub fn entry_count(&self) -> u64 {
        self.clients.entry_count()
    }
}

fn build_client(config: ClientPoolConfig) -> Result<Arc<reqwest::Client>, Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        // Redirects are never followed: replay fidelity requires the
        // original request be the one that hits the origin.
        .redirect(reqwest::redirect::Policy::none())
        .pool_idle_timeout(Some(Duration::from_secs(90)));

    if config.max_idle_connections_per_host > 0 {
        builder = builder.pool_max_idle_per_host(config.max_idle_connections_per_host);
    }

    builder
        .build()
        .map(Arc::new)
        .map_err(|e| Error::BadInput(format!("failed to build http client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_flight_shares_one_client_per_authority() {
        let pool = Arc::new(ClientPool::new(ClientPoolConfig::default(), Metrics::noop()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.get("example.com:80").await.unwrap() }));
        }

        let clients: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        for client in &clients {
            assert!(Arc::ptr_eq(client, &clients[0]));
        }
        assert_eq!(pool.entry_count(), 1);
    }

    #[tokio::test]
    async fn distinct_authorities_get_distinct_clients() {
        let pool = ClientPool::new(ClientPoolConfig::default(), Metrics::noop());
        let a = pool.get("a.example:80").await.unwrap();
        let b = pool.get("b.example:80").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.entry_count(), 2);
    }

    #[tokio::test]
    async fn unlimited_cap_never_blocks() {
        let pool = ClientPool::new(ClientPoolConfig::default(), Metrics::noop());
        let a = pool.acquire("h:80").await;
        let b = pool.acquire("h:80").await;
        assert!(a.is_none());
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn cap_bounds_concurrent_permits_per_host() {
        let config = ClientPoolConfig {
            max_connections_per_host: 1,
            ..ClientPoolConfig::default()
        };
        let pool = Arc::new(ClientPool::new(config, Metrics::noop()));

        let first = pool.acquire("h:80").await;
        assert!(first.is_some());

        // A second acquire on the same host would block forever while the
        // first permit is held; race it against a timeout instead of
        // awaiting it directly.
        let pool2 = Arc::clone(&pool);
        let second = tokio::time::timeout(Duration::from_millis(50), async move {
            pool2.acquire("h:80").await
        })
        .await;
        assert!(second.is_err(), "second acquire should not complete while the first permit is held");

        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire("h:80")).await;
        assert!(third.is_ok(), "permit should free up once the first is dropped");
    }
}
