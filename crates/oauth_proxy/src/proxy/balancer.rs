use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};
use url::Url;

/// How long an endpoint is skipped after a transport failure.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// A backend service instance.
#[derive(Debug)]
pub struct Endpoint {
    url: Url,
    /// Set after a transport failure; the endpoint is unhealthy until this instant
    unhealthy_until: Mutex<Option<Instant>>,
}

impl Endpoint {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            unhealthy_until: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_healthy(&self) -> bool {
        match *self.unhealthy_until.lock() {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    pub fn mark_failed(&self, cooldown: Duration) {
        *self.unhealthy_until.lock() = Some(Instant::now() + cooldown);
    }

    pub fn mark_healthy(&self) {
        *self.unhealthy_until.lock() = None;
    }
}

/// Round-robin pool of backend endpoints.
///
/// Readers pick from an immutable snapshot; upsert/remove publish a new one, so
/// no lock is held while a request is in flight.
pub struct EndpointPool {
    endpoints: RwLock<Arc<Vec<Arc<Endpoint>>>>,
    cursor: AtomicUsize,
    cooldown: Duration,
}

impl EndpointPool {
    pub fn new(urls: impl IntoIterator<Item = Url>) -> Self {
        Self::with_cooldown(urls, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(urls: impl IntoIterator<Item = Url>, cooldown: Duration) -> Self {
        let endpoints: Vec<Arc<Endpoint>> =
            urls.into_iter().map(|url| Arc::new(Endpoint::new(url))).collect();
        Self {
            endpoints: RwLock::new(Arc::new(endpoints)),
            cursor: AtomicUsize::new(0),
            cooldown,
        }
    }

    /// Current endpoint snapshot.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Endpoint>>> {
        self.endpoints.read().clone()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an endpoint, or reset its health if it is already present.
    pub fn upsert(&self, url: Url) {
        let mut guard = self.endpoints.write();
        if let Some(existing) = guard.iter().find(|e| e.url == url) {
            existing.mark_healthy();
            return;
        }
        let mut next: Vec<Arc<Endpoint>> = guard.as_ref().clone();
        next.push(Arc::new(Endpoint::new(url.clone())));
        *guard = Arc::new(next);
        info!("[OK] Endpoint added: {}", url);
    }

    /// Remove an endpoint. Returns whether it was present.
    pub fn remove(&self, url: &Url) -> bool {
        let mut guard = self.endpoints.write();
        let next: Vec<Arc<Endpoint>> = guard.iter().filter(|e| &e.url != url).cloned().collect();
        if next.len() == guard.len() {
            return false;
        }
        *guard = Arc::new(next);
        info!("[OK] Endpoint removed: {}", url);
        true
    }

    /// Pick the next endpoint, avoiding those already `tried` for this request.
    ///
    /// Preference order: healthy and untried, untried, healthy, any.
    pub fn next(&self, tried: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return None;
        }

        let untried = |e: &&Arc<Endpoint>| !tried.iter().any(|t| Arc::ptr_eq(t, *e));
        let healthy = |e: &&Arc<Endpoint>| e.is_healthy();

        let tiers: [Vec<&Arc<Endpoint>>; 4] = [
            snapshot.iter().filter(untried).filter(healthy).collect(),
            snapshot.iter().filter(untried).collect(),
            snapshot.iter().filter(healthy).collect(),
            snapshot.iter().collect(),
        ];

        let candidates = tiers.iter().find(|tier| !tier.is_empty())?;
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(candidates[index]))
    }

    pub fn mark_failed(&self, endpoint: &Endpoint) {
        if endpoint.is_healthy() {
            warn!(
                "[WARN] Endpoint {} marked unhealthy for {:?}",
                endpoint.url, self.cooldown
            );
        }
        endpoint.mark_failed(self.cooldown);
    }

    pub fn mark_healthy(&self, endpoint: &Endpoint) {
        endpoint.mark_healthy();
    }

    /// True when at least one endpoint is outside its failure cooldown.
    pub fn has_healthy(&self) -> bool {
        self.snapshot().iter().any(|e| e.is_healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn urls(n: usize) -> Vec<Url> {
        (0..n)
            .map(|i| Url::parse(&format!("http://10.0.0.{}:8080", i + 1)).unwrap())
            .collect()
    }

    #[test]
    fn test_round_robin_fairness() {
        let pool = EndpointPool::new(urls(3));
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..100 {
            let endpoint = pool.next(&[]).unwrap();
            *counts.entry(endpoint.url().to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!(*count >= 100 / 3);
        }
    }

    #[test]
    fn test_unhealthy_endpoints_are_skipped() {
        let pool = EndpointPool::new(urls(2));
        let snapshot = pool.snapshot();
        pool.mark_failed(&snapshot[0]);

        for _ in 0..10 {
            assert_eq!(pool.next(&[]).unwrap().url(), snapshot[1].url());
        }
        assert!(pool.has_healthy());

        pool.mark_failed(&snapshot[1]);
        assert!(!pool.has_healthy());
        // Everything is down: still hand out endpoints rather than nothing.
        assert!(pool.next(&[]).is_some());
    }

    #[test]
    fn test_cooldown_expires() {
        let pool = EndpointPool::with_cooldown(urls(1), Duration::ZERO);
        let snapshot = pool.snapshot();
        pool.mark_failed(&snapshot[0]);
        assert!(snapshot[0].is_healthy());
    }

    #[test]
    fn test_retry_prefers_untried_endpoint() {
        let pool = EndpointPool::new(urls(2));
        let first = pool.next(&[]).unwrap();
        let second = pool.next(&[first.clone()]).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        // Single endpoint: retries go back to it.
        let single = EndpointPool::new(urls(1));
        let only = single.next(&[]).unwrap();
        assert!(Arc::ptr_eq(&only, &single.next(&[only.clone()]).unwrap()));
    }

    #[test]
    fn test_upsert_and_remove() {
        let pool = EndpointPool::new(urls(2));
        let removed = urls(1).remove(0);

        assert!(pool.remove(&removed));
        assert!(!pool.remove(&removed));
        for _ in 0..10 {
            assert_ne!(pool.next(&[]).unwrap().url(), &removed);
        }

        pool.upsert(removed.clone());
        pool.upsert(removed.clone());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_empty_pool() {
        let pool = EndpointPool::new(Vec::new());
        assert!(pool.next(&[]).is_none());
        assert!(!pool.has_healthy());
    }

    #[test]
    fn test_removed_endpoint_never_chosen_under_concurrency() {
        use std::collections::HashSet;
        use std::sync::atomic::AtomicBool;

        let pool = EndpointPool::new(urls(8));
        let to_remove: Vec<Url> = urls(6);
        let added: Vec<Url> = (0..3)
            .map(|i| Url::parse(&format!("http://10.0.1.{}:8080", i + 1)).unwrap())
            .collect();
        // URLs whose removal has completed.
        let removed: RwLock<HashSet<Url>> = RwLock::new(HashSet::new());
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mut picks = 0usize;
                    while !done.load(Ordering::Acquire) || picks < 1_000 {
                        let gone = removed.read().clone();
                        let endpoint = pool.next(&[]).unwrap();
                        assert!(
                            !gone.contains(endpoint.url()),
                            "{} chosen after removal",
                            endpoint.url()
                        );
                        picks += 1;
                    }
                });
            }

            scope.spawn(|| {
                for (url, new) in to_remove.iter().zip(added.iter().cycle()) {
                    pool.upsert(new.clone());
                    assert!(pool.remove(url));
                    removed.write().insert(url.clone());
                    std::thread::yield_now();
                }
                done.store(true, Ordering::Release);
            });
        });

        assert_eq!(pool.len(), 8 - 6 + 3);
        let remaining: HashSet<Url> = pool.snapshot().iter().map(|e| e.url().clone()).collect();
        assert!(to_remove.iter().all(|url| !remaining.contains(url)));
    }
}
