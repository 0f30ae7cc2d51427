//! Forged certificate cache
//!
//! LRU cache of forged leaf certificates keyed by server name, with a
//! single-flight guarantee: for any one name, at most one generation runs at
//! a time and concurrent callers observe the certificate it produced. Each
//! name maps to a cell; generation happens under the cell's own lock, so a
//! slow build for one host never stalls lookups for another.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::ca::ForgedCert;
use crate::error::Result;

type Cell = Arc<Mutex<Option<Arc<ForgedCert>>>>;

/// Keyed single-flight cache for forged certificates.
pub struct CertStore {
    cells: Mutex<LruCache<String, Cell>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CertStore {
    /// Create a store holding up to `capacity` certificates.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1000).unwrap());
        Self {
            cells: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached certificate for `name`, or run `generate` exactly
    /// once per concurrent burst and cache its result. A failed generation
    /// leaves the slot empty so a later call can retry.
    pub fn fetch<F>(&self, name: &str, generate: F) -> Result<Arc<ForgedCert>>
    where
        F: FnOnce() -> Result<ForgedCert>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap();
            match cells.get(name) {
                Some(cell) => Arc::clone(cell),
                None => {
                    let cell = Cell::default();
                    cells.put(name.to_string(), Arc::clone(&cell));
                    cell
                }
            }
        };

        // Everyone racing on this name queues here; the winner generates
        // while holding only this cell's lock.
        let mut slot = cell.lock().unwrap();
        if let Some(cert) = slot.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(cert));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let forged = Arc::new(generate()?);
        *slot = Some(Arc::clone(&forged));
        Ok(forged)
    }

    /// Number of cached names.
    pub fn len(&self) -> usize {
        self.cells.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Drop all cached certificates, e.g. after a CA rotation.
    pub fn clear(&self) {
        self.cells.lock().unwrap().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("len", &self.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;

    fn store_and_ca() -> (Arc<CertStore>, Arc<CertificateAuthority>) {
        (
            Arc::new(CertStore::new(16)),
            Arc::new(CertificateAuthority::ephemeral().unwrap()),
        )
    }

    #[test]
    fn fetch_caches_by_name() {
        let (store, ca) = store_and_ca();

        let first = store
            .fetch("example.com", || ca.sign_host(&["example.com".to_string()]))
            .unwrap();
        let second = store
            .fetch("example.com", || ca.sign_host(&["example.com".to_string()]))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.hits(), 1);
        assert_eq!(store.misses(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn failed_generation_is_retried() {
        let (store, ca) = store_and_ca();

        let result = store.fetch("example.com", || {
            Err(crate::error::ProxyError::cert_generation("example.com", "boom"))
        });
        assert!(result.is_err());

        let retried = store
            .fetch("example.com", || ca.sign_host(&["example.com".to_string()]))
            .unwrap();
        assert_eq!(retried.sans, vec!["example.com"]);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let store = CertStore::new(2);
        let ca = CertificateAuthority::ephemeral().unwrap();

        for name in ["a.test", "b.test", "c.test"] {
            store
                .fetch(name, || ca.sign_host(&[name.to_string()]))
                .unwrap();
        }
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn concurrent_fetch_generates_once() {
        use std::sync::atomic::AtomicUsize;

        let (store, ca) = store_and_ca();
        let generations = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let ca = Arc::clone(&ca);
            let generations = Arc::clone(&generations);
            workers.push(std::thread::spawn(move || {
                store
                    .fetch("signed.once", || {
                        generations.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        ca.sign_host(&["signed.once".to_string()])
                    })
                    .unwrap()
            }));
        }

        let certs: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(generations.load(Ordering::SeqCst), 1);
        for cert in &certs[1..] {
            assert!(Arc::ptr_eq(&certs[0], cert));
        }
    }
}
