//! Round-robin rotation over egress routes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// An egress path for one outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// No proxy configured; connect directly.
    Direct,
    /// Proxy URL as accepted by `reqwest::Proxy::all`.
    Proxy(Arc<str>),
}

impl Route {
    pub fn label(&self) -> &str {
        match self {
            Route::Direct => "direct",
            Route::Proxy(url) => url,
        }
    }
}

/// Hands out routes in round-robin order. `next()` is called once per
/// request, possibly from concurrent fetch tasks; `force_rotate()` skips the
/// current route after a failure that is likely tied to it.
#[derive(Debug, Default)]
pub struct ProxyPool {
    routes: Vec<Route>,
    cursor: AtomicUsize,
    forced: AtomicU64,
}

impl ProxyPool {
    pub fn new<I, S>(proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut routes: Vec<Route> = Vec::new();
        for p in proxies {
            let p = p.as_ref().trim();
            if p.is_empty() {
                continue;
            }
            let route = if p.eq_ignore_ascii_case("direct") {
                Route::Direct
            } else {
                Route::Proxy(Arc::from(p))
            };
            if !routes.contains(&route) {
                routes.push(route);
            }
        }
        Self {
            routes,
            cursor: AtomicUsize::new(0),
            forced: AtomicU64::new(0),
        }
    }

    pub fn direct() -> Self {
        Self::default()
    }

    /// Number of distinct routes; an empty pool still has the direct route.
    pub fn len(&self) -> usize {
        self.routes.len().max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// True when requests can be spread over at least two routes.
    pub fn is_parallel(&self) -> bool {
        self.routes.len() >= 2
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn next(&self) -> Route {
        if self.routes.is_empty() {
            return Route::Direct;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.routes[idx % self.routes.len()].clone()
    }

    /// Advance the pointer outside the normal cycle.
    pub fn force_rotate(&self) {
        self.forced.fetch_add(1, Ordering::Relaxed);
        if !self.routes.is_empty() {
            self.cursor.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// How many times `force_rotate()` has been called.
    pub fn forced_rotations(&self) -> u64 {
        self.forced.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_always_returns_direct() {
        let pool = ProxyPool::direct();
        assert_eq!(pool.next(), Route::Direct);
        pool.force_rotate();
        assert_eq!(pool.next(), Route::Direct);
        assert_eq!(pool.len(), 1);
        assert!(!pool.is_parallel());
    }

    #[test]
    fn round_robin_and_forced_skip() {
        let pool = ProxyPool::new(["http://a:1", "http://b:2", "http://c:3"]);
        assert_eq!(pool.next().label(), "http://a:1");
        assert_eq!(pool.next().label(), "http://b:2");
        pool.force_rotate();
        // c was skipped by the forced rotation
        assert_eq!(pool.next().label(), "http://a:1");
        assert_eq!(pool.forced_rotations(), 1);
    }

    #[test]
    fn dedupes_and_accepts_direct_entry() {
        let pool = ProxyPool::new(["direct", "http://a:1", "http://a:1", " "]);
        assert_eq!(pool.routes().len(), 2);
        assert!(pool.is_parallel());
        assert_eq!(pool.next(), Route::Direct);
    }
}
