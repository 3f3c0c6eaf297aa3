//! Process-wide state shared across every axum handler: the subdomain →
//! session registry and the per-tunnel rate limiters that sit in front of
//! it.

use std::sync::Arc;

use dashmap::DashMap;

use xpose_core::access::RateLimiter;

use crate::session::{self, SessionHandle};

/// The subdomain → session-actor registry. Cloning is cheap (an `Arc`
/// around the map); every clone refers to the same sessions.
#[derive(Clone)]
pub struct SharedRegistry(Arc<DashMap<String, SessionHandle>>);

impl SharedRegistry {
    pub fn new() -> Self {
        Self(Arc::new(DashMap::new()))
    }

    pub fn get(&self, subdomain: &str) -> Option<SessionHandle> {
        self.0.get(subdomain).map(|entry| entry.clone())
    }

    /// Return the existing session for `subdomain`, spawning a fresh,
    /// unauthenticated actor if none exists yet.
    pub fn get_or_create(&self, subdomain: &str, public_domain: &str) -> SessionHandle {
        if let Some(existing) = self.get(subdomain) {
            return existing;
        }
        let fresh = session::spawn(subdomain.to_string(), public_domain.to_string(), self.clone());
        self.0
            .entry(subdomain.to_string())
            .or_insert(fresh)
            .clone()
    }

    pub fn remove(&self, subdomain: &str) {
        self.0.remove(subdomain);
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything an axum handler needs: the session registry, the edge's own
/// public domain (for Host-header classification and `auth-ack.url`), and
/// one rate limiter per subdomain, replaced whenever a tunnel's configured
/// limit changes.
#[derive(Clone)]
pub struct GatewayState {
    pub sessions: SharedRegistry,
    pub public_domain: String,
    pub marketing: Arc<dyn MarketingSiteFetcher>,
    rate_limiters: Arc<DashMap<String, Arc<RateLimiter>>>,
}

impl GatewayState {
    pub fn new(public_domain: String) -> Self {
        Self {
            sessions: SharedRegistry::new(),
            public_domain,
            marketing: Arc::new(StaticMarketingSite),
            rate_limiters: Arc::new(DashMap::new()),
        }
    }

    /// The rate limiter for `subdomain`, matching `configured_limit`. A
    /// stale limiter left over from a previous auth with a different limit
    /// is replaced so a config change takes effect on the next request.
    pub fn rate_limiter_for(&self, subdomain: &str, configured_limit: u32) -> Arc<RateLimiter> {
        if let Some(existing) = self.rate_limiters.get(subdomain) {
            if existing.limit() == configured_limit {
                return existing.clone();
            }
        }
        let fresh = Arc::new(RateLimiter::new(configured_limit));
        self.rate_limiters.insert(subdomain.to_string(), fresh.clone());
        fresh
    }
}

/// Serves the body shown when a visitor hits the bare domain or `www`
/// instead of a tunnel subdomain. A real deployment would proxy this to a
/// marketing site; tests and local runs get a static placeholder.
pub trait MarketingSiteFetcher: Send + Sync {
    fn fetch(&self) -> (String, String);
}

pub struct StaticMarketingSite;

impl MarketingSiteFetcher for StaticMarketingSite {
    fn fetch(&self) -> (String, String) {
        (
            "text/html; charset=utf-8".to_string(),
            "<!doctype html><html><body><h1>xpose</h1><p>Expose a local port to the internet.</p></body></html>".to_string(),
        )
    }
}
