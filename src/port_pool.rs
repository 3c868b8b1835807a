//! Finite pool of TCP ports for raw-TCP ingress (spec §3, §4.1).
//!
//! Mirrors the teacher's single-`RwLock`-guarded map convention (see
//! `state.rs`'s `tunnels`/`verified_keys` fields), but port claim/release must
//! be linearizable test-and-set, so a plain `Mutex` over a `Vec<bool>` is used
//! instead of per-entry locking.

use tokio::sync::Mutex;

struct Inner {
    lo: u16,
    /// assigned[i] corresponds to port `lo + i`.
    assigned: Vec<bool>,
}

/// A finite, lowest-first pool of ports in `[lo, hi]`.
pub struct PortPool {
    inner: Mutex<Option<Inner>>,
}

impl PortPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn empty() -> Self {
        Self::new()
    }

    /// Merges an inclusive range into the pool. Fails if `lo > hi`. A second
    /// call widens the pool to cover both ranges without disturbing any bit
    /// already assigned by a prior call.
    pub async fn add_range(&self, lo: u16, hi: u16) -> Result<(), &'static str> {
        if lo > hi {
            return Err("lo > hi");
        }
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            None => {
                *guard = Some(Inner {
                    lo,
                    assigned: vec![false; (hi - lo) as usize + 1],
                });
            }
            Some(inner) => {
                let new_lo = inner.lo.min(lo);
                let new_hi = (inner.lo + inner.assigned.len() as u16 - 1).max(hi);
                let mut assigned = vec![false; (new_hi - new_lo) as usize + 1];
                for (i, taken) in inner.assigned.iter().enumerate() {
                    assigned[(inner.lo + i as u16 - new_lo) as usize] = *taken;
                }
                inner.lo = new_lo;
                inner.assigned = assigned;
            }
        }
        Ok(())
    }

    /// Lowest free port, marked assigned atomically. `(0, false)` if the pool
    /// is empty or exhausted.
    pub async fn unassigned(&self) -> (u16, bool) {
        let mut guard = self.inner.lock().await;
        let Some(inner) = guard.as_mut() else {
            return (0, false);
        };
        for (i, taken) in inner.assigned.iter_mut().enumerate() {
            if !*taken {
                *taken = true;
                return (inner.lo + i as u16, true);
            }
        }
        (0, false)
    }

    /// Unconditional bit set; no-op if `port` is outside the configured range.
    pub async fn set(&self, port: u16, assigned: bool) {
        let mut guard = self.inner.lock().await;
        if let Some(inner) = guard.as_mut() {
            if port >= inner.lo && (port - inner.lo) as usize < inner.assigned.len() {
                inner.assigned[(port - inner.lo) as usize] = assigned;
            }
        }
    }

    /// True iff `port` transitions free->assigned, or lies outside the pool
    /// (so the OS-picked ephemeral port case never fails a claim).
    pub async fn claim(&self, port: u16) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(inner) = guard.as_mut() else {
            return true;
        };
        if port < inner.lo || (port - inner.lo) as usize >= inner.assigned.len() {
            return true;
        }
        let idx = (port - inner.lo) as usize;
        if inner.assigned[idx] {
            false
        } else {
            inner.assigned[idx] = true;
            true
        }
    }

    pub async fn release(&self, port: u16) {
        self.set(port, false).await;
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_range_returns_false() {
        let pool = PortPool::new();
        let (_, ok) = pool.unassigned().await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn lowest_free_port_first() {
        let pool = PortPool::new();
        pool.add_range(40000, 40010).await.unwrap();
        let (p, ok) = pool.unassigned().await;
        assert!(ok);
        assert_eq!(p, 40000);
        let (p2, ok2) = pool.unassigned().await;
        assert!(ok2);
        assert_eq!(p2, 40001);
    }

    #[tokio::test]
    async fn claim_is_test_and_set() {
        let pool = PortPool::new();
        pool.add_range(5000, 5000).await.unwrap();
        assert!(pool.claim(5000).await);
        assert!(!pool.claim(5000).await);
        pool.release(5000).await;
        assert!(pool.claim(5000).await);
    }

    #[tokio::test]
    async fn claim_outside_range_always_succeeds() {
        let pool = PortPool::new();
        pool.add_range(100, 200).await.unwrap();
        assert!(pool.claim(9999).await);
        assert!(pool.claim(9999).await);
    }

    #[tokio::test]
    async fn add_range_rejects_inverted_bounds() {
        let pool = PortPool::new();
        assert!(pool.add_range(10, 5).await.is_err());
    }

    #[tokio::test]
    async fn second_add_range_preserves_existing_claims() {
        let pool = PortPool::new();
        pool.add_range(100, 102).await.unwrap();
        assert!(pool.claim(101).await);
        pool.add_range(103, 105).await.unwrap();
        assert!(!pool.claim(101).await);
        assert!(pool.claim(100).await);
        assert!(pool.claim(104).await);
    }

    #[tokio::test]
    async fn release_then_unassigned_returns_same_port() {
        let pool = PortPool::new();
        pool.add_range(1, 1).await.unwrap();
        let (p, _) = pool.unassigned().await;
        pool.release(p).await;
        let (p2, ok) = pool.unassigned().await;
        assert!(ok);
        assert_eq!(p, p2);
    }
}
