use crate::transport::error::TransportError;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

/// Hands out unique TCP ports from the closed pool [min, max].
///
/// Allocation is pure memory; no durability across restarts is needed
/// because no backup survives a hub restart (the block servers die with
/// it), so the pool starts fully free.
pub struct PortAllocator {
    inner: Mutex<PoolInner>,
    pool_size: usize,
}

struct PoolInner {
    free: BTreeSet<u16>,
    in_use: HashMap<u16, String>,
}

impl PortAllocator {
    /// Builds an allocator over the inclusive range [min, max].
    pub fn new(min: u16, max: u16) -> Self {
        let free: BTreeSet<u16> = (min..=max).collect();
        let pool_size = free.len();
        Self {
            inner: Mutex::new(PoolInner {
                free,
                in_use: HashMap::new(),
            }),
            pool_size,
        }
    }

    /// Returns the lowest free port, marking it owned by `owner_tag`.
    ///
    /// Exhaustion is a retriable condition for callers (503-class); the
    /// pool is left unchanged.
    pub fn allocate(&self, owner_tag: &str) -> Result<u16, TransportError> {
        let mut inner = self.inner.lock();
        let port = match inner.free.iter().next().copied() {
            Some(port) => port,
            None => {
                return Err(TransportError::Exhausted {
                    pool_size: self.pool_size,
                })
            }
        };
        inner.free.remove(&port);
        inner.in_use.insert(port, owner_tag.to_string());
        log::debug!("Allocated NBD port {} to {}", port, owner_tag);
        Ok(port)
    }

    /// Returns a port to the pool. Idempotent; releasing an unknown port
    /// is a no-op with a warning.
    pub fn release(&self, port: u16) {
        let mut inner = self.inner.lock();
        match inner.in_use.remove(&port) {
            Some(owner) => {
                inner.free.insert(port);
                log::debug!("Released NBD port {} (was owned by {})", port, owner);
            }
            None => {
                log::warn!("Release of NBD port {} which is not allocated", port);
            }
        }
    }

    /// Snapshot of allocated ports and their owners.
    pub fn in_use(&self) -> HashMap<u16, String> {
        self.inner.lock().in_use.clone()
    }

    /// Number of currently free ports.
    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_port_first() {
        let pool = PortAllocator::new(10100, 10102);
        assert_eq!(pool.allocate("job-1").unwrap(), 10100);
        assert_eq!(pool.allocate("job-1").unwrap(), 10101);
        pool.release(10100);
        assert_eq!(pool.allocate("job-2").unwrap(), 10100);
    }

    #[test]
    fn exhaustion_leaves_pool_unchanged() {
        let pool = PortAllocator::new(10100, 10101);
        pool.allocate("job-1").unwrap();
        pool.allocate("job-1").unwrap();
        assert!(matches!(
            pool.allocate("job-2"),
            Err(TransportError::Exhausted { pool_size: 2 })
        ));
        assert_eq!(pool.available(), 0);
        pool.release(10100);
        pool.release(10101);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn release_is_idempotent() {
        let pool = PortAllocator::new(10100, 10100);
        let port = pool.allocate("job-1").unwrap();
        pool.release(port);
        pool.release(port);
        pool.release(9999);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn in_use_reports_owners() {
        let pool = PortAllocator::new(10100, 10101);
        pool.allocate("job-7").unwrap();
        let in_use = pool.in_use();
        assert_eq!(in_use.get(&10100).map(String::as_str), Some("job-7"));
        assert!(!in_use.contains_key(&10101));
    }
}
