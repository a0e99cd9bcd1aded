//! Per-call endpoint selection over the healthy endpoint set.

use crate::LoadBalancingPolicy;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Selects one endpoint per call attempt according to the configured
/// [`LoadBalancingPolicy`].
///
/// The balancer keeps no endpoint cache of its own: every pick runs against
/// the healthy snapshot handed in by the caller, so health transitions and
/// registry changes take effect on the very next selection. In-flight
/// counts are the only retained state, and they clean themselves up when
/// the last [`Pick`] for an endpoint is dropped.
pub struct Balancer {
    policy: LoadBalancingPolicy,
    cursor: AtomicUsize,
    loads: Arc<Mutex<HashMap<SocketAddr, u32>>>,
}

/// A selected endpoint, holding the in-flight accounting slot for the
/// duration of the attempt it was picked for.
pub struct Pick {
    addr: SocketAddr,
    _load: LoadGuard,
}

impl Pick {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

struct LoadGuard {
    addr: SocketAddr,
    loads: Arc<Mutex<HashMap<SocketAddr, u32>>>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        let mut loads = self.loads.lock();
        if let Some(in_flight) = loads.get_mut(&self.addr) {
            *in_flight -= 1;
            if *in_flight == 0 {
                loads.remove(&self.addr);
            }
        }
    }
}

impl Balancer {
    pub fn new(policy: LoadBalancingPolicy) -> Self {
        Self {
            policy,
            cursor: AtomicUsize::new(0),
            loads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Pick one endpoint out of `healthy`, or `None` if the set is empty.
    ///
    /// When more than one candidate exists, `avoid` is excluded, so that
    /// a retry does not land on the endpoint that just failed.
    pub fn pick(&self, healthy: &[SocketAddr], avoid: Option<SocketAddr>) -> Option<Pick> {
        let filtered: Vec<SocketAddr>;
        let candidates: &[SocketAddr] = match avoid {
            Some(avoid) if healthy.len() > 1 => {
                filtered = healthy.iter().copied().filter(|a| *a != avoid).collect();
                &filtered
            }
            _ => healthy,
        };

        if candidates.is_empty() {
            return None;
        }

        let addr = match self.policy {
            LoadBalancingPolicy::Random => *candidates.choose(&mut rand::thread_rng())?,
            LoadBalancingPolicy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates[index]
            }
            LoadBalancingPolicy::LeastLoaded => {
                let loads = self.loads.lock();
                candidates
                    .iter()
                    .copied()
                    .min_by_key(|addr| (loads.get(addr).copied().unwrap_or(0), *addr))?
            }
        };

        Some(self.acquire(addr))
    }

    /// Take an in-flight slot on a specific endpoint, bypassing policy
    /// selection. Used to keep a call pinned to its first endpoint.
    pub(crate) fn acquire(&self, addr: SocketAddr) -> Pick {
        *self.loads.lock().entry(addr).or_insert(0) += 1;
        Pick {
            addr,
            _load: LoadGuard {
                addr,
                loads: Arc::clone(&self.loads),
            },
        }
    }

    /// The number of attempts currently in flight against `addr`.
    pub fn in_flight(&self, addr: SocketAddr) -> u32 {
        self.loads.lock().get(&addr).copied().unwrap_or(0)
    }
}
