//! Persistent pool of candidate peer addresses.
//!
//! The pool is bounded, de-duplicated by `ip:port`, and never contains
//! blacklisted entries or our own advertised address. Insertions evict the
//! oldest entry once capacity is reached. Fetches are biased away from
//! recently-handed-out entries so outbound batches spread across the pool.

pub mod file;

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::PathBuf;

use lru::LruCache;
use rand::seq::IteratorRandom;
use rand::Rng;
use tokio::sync::Mutex;

use crate::config::{BlacklistEntry, Settings};
use crate::error::{P2pError, P2pResult};
use crate::wire::NetworkAddress;

type Key = (IpAddr, u16);

fn key(addr: &NetworkAddress) -> Key {
    (addr.ip, addr.port)
}

struct Inner {
    /// Known addresses, oldest at the front.
    entries: VecDeque<NetworkAddress>,
    /// Fast membership by `ip:port`.
    index: HashSet<Key>,
    /// Addresses recently handed out by `fetch`.
    recent: LruCache<Key, ()>,
}

/// Bounded, persisted set of candidate peer addresses.
pub struct Hosts {
    capacity: usize,
    path: PathBuf,
    self_address: Option<SocketAddr>,
    blacklist: Vec<BlacklistEntry>,
    inner: Mutex<Inner>,
}

impl Hosts {
    /// Create an empty pool from the settings.
    pub fn new(settings: &Settings) -> Self {
        let recent_capacity =
            NonZeroUsize::new((settings.host_pool_capacity / 4).max(1)).expect("nonzero");
        Self {
            capacity: settings.host_pool_capacity,
            path: settings.hosts_file.clone(),
            self_address: settings.self_address,
            blacklist: settings.blacklist.clone(),
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                index: HashSet::new(),
                recent: LruCache::new(recent_capacity),
            }),
        }
    }

    fn accepts(&self, addr: &NetworkAddress) -> bool {
        if addr.port == 0 {
            return false;
        }
        let socket = addr.socket_addr();
        if self.self_address.as_ref() == Some(&socket) {
            return false;
        }
        !self.blacklist.iter().any(|rule| rule.matches(&socket))
    }

    /// Number of pooled addresses.
    pub async fn count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Insert one address. Rejected entries are dropped silently.
    pub async fn store(&self, addr: NetworkAddress) -> P2pResult<()> {
        if self.capacity == 0 || !self.accepts(&addr) {
            tracing::trace!(addr = %addr, "address rejected by pool policy");
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        if inner.index.contains(&key(&addr)) {
            // Refresh the sighting time of the existing entry.
            if let Some(existing) = inner.entries.iter_mut().find(|e| **e == addr) {
                existing.timestamp = existing.timestamp.max(addr.timestamp);
                existing.services = addr.services;
            }
            return Ok(());
        }

        if inner.entries.len() >= self.capacity {
            if let Some(evicted) = inner.entries.pop_front() {
                inner.index.remove(&key(&evicted));
                tracing::trace!(addr = %evicted, "evicted oldest pooled address");
            }
        }

        inner.index.insert(key(&addr));
        inner.entries.push_back(addr);
        Ok(())
    }

    /// Insert a batch of gossiped addresses.
    pub async fn store_many(&self, addrs: Vec<NetworkAddress>) -> P2pResult<()> {
        for addr in addrs {
            self.store(addr).await?;
        }
        Ok(())
    }

    /// Delete an address if present. Succeeds either way.
    pub async fn remove(&self, addr: &SocketAddr) -> P2pResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.index.remove(&(addr.ip(), addr.port())) {
            inner
                .entries
                .retain(|e| !(e.ip == addr.ip() && e.port == addr.port()));
        }
        Ok(())
    }

    /// Pick one address uniformly at random, avoiding entries handed out
    /// recently until the rest of the pool is exhausted.
    pub async fn fetch(&self) -> P2pResult<NetworkAddress> {
        let mut inner = self.inner.lock().await;
        if inner.entries.is_empty() {
            return Err(P2pError::AddressNotFound);
        }

        let mut rng = rand::thread_rng();
        let fresh: Vec<usize> = inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !inner.recent.contains(&key(e)))
            .map(|(i, _)| i)
            .collect();

        let choice = if fresh.is_empty() {
            rng.gen_range(0..inner.entries.len())
        } else {
            fresh[rng.gen_range(0..fresh.len())]
        };

        let picked = inner.entries[choice].clone();
        inner.recent.put(key(&picked), ());
        Ok(picked)
    }

    /// A random sample of up to `max` addresses, for `addr` responses.
    pub async fn sample(&self, max: usize) -> Vec<NetworkAddress> {
        let inner = self.inner.lock().await;
        let mut rng = rand::thread_rng();
        inner.entries.iter().cloned().choose_multiple(&mut rng, max)
    }

    /// Replace the pool with the persisted list.
    ///
    /// Duplicates collapse, rejected entries drop, and the oldest entries
    /// beyond capacity are truncated. A missing file loads as empty.
    pub async fn load(&self) -> P2pResult<()> {
        let mut records = file::load(&self.path).await?;

        // Oldest first so capacity truncation discards the stalest entries.
        records.sort_by_key(|r| r.timestamp);
        let mut entries = VecDeque::new();
        let mut index = HashSet::new();
        for record in records {
            if !self.accepts(&record) || index.contains(&key(&record)) {
                continue;
            }
            index.insert(key(&record));
            entries.push_back(record);
        }
        while entries.len() > self.capacity {
            if let Some(evicted) = entries.pop_front() {
                index.remove(&key(&evicted));
            }
        }

        let count = entries.len();
        let mut inner = self.inner.lock().await;
        inner.entries = entries;
        inner.index = index;
        tracing::info!(count, path = ?self.path, "host pool loaded");
        Ok(())
    }

    /// Persist the pool, replacing the file atomically.
    pub async fn save(&self) -> P2pResult<()> {
        let snapshot: Vec<NetworkAddress> = {
            let inner = self.inner.lock().await;
            inner.entries.iter().cloned().collect()
        };
        file::save(&self.path, &snapshot).await?;
        tracing::debug!(count = snapshot.len(), path = ?self.path, "host pool saved");
        Ok(())
    }
}
