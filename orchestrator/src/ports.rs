//! Host port allocation for published-port (NAT) deployments.

use std::{collections::BTreeSet, ops::Range, sync::Mutex};

use anyhow::Result;

/// Hands out free host ports from a configured range. Safe under concurrent
/// Ensure calls; ports are returned on container removal.
pub struct PortAllocator {
    range: Range<u16>,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            range,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<u16> {
        let mut allocated = self.allocated.lock().unwrap();
        for port in self.range.clone() {
            if !allocated.contains(&port) {
                allocated.insert(port);
                return Ok(port);
            }
        }
        Err(anyhow::anyhow!(
            "no free ports in range {}..{}",
            self.range.start,
            self.range.end
        ))
    }

    pub fn release(&self, port: u16) {
        self.allocated.lock().unwrap().remove(&port);
    }

    /// Mark a port seen on an adopted container as in use.
    pub fn reserve(&self, port: u16) {
        if self.range.contains(&port) {
            self.allocated.lock().unwrap().insert(port);
        }
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_release_cycle() {
        let ports = PortAllocator::new(31000..31003);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        let c = ports.allocate().unwrap();
        assert_eq!((a, b, c), (31000, 31001, 31002));
        assert!(ports.allocate().is_err());

        ports.release(b);
        assert_eq!(ports.allocate().unwrap(), 31001);
    }

    #[test]
    fn test_reserve_adopted_port() {
        let ports = PortAllocator::new(31000..31002);
        ports.reserve(31000);
        assert_eq!(ports.allocate().unwrap(), 31001);
        // Out-of-range ports are ignored.
        ports.reserve(40000);
        assert_eq!(ports.allocated_count(), 2);
    }
}
