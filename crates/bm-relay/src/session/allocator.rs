//! Relay port allocation
//!
//! Candidates are drawn at random from the configured range and checked
//! against the ports held by live sessions. The relay's own bind result is
//! the final word; a rejected bind leads to a reassignment through the
//! registry.

use std::collections::HashSet;

use bm_core::config::PortRange;
use bm_core::SessionError;
use rand::Rng;

/// Picks relay ports for new host sessions
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> &PortRange {
        &self.range
    }

    /// Draw a port not contained in `in_use`.
    ///
    /// Gives up with `PortAllocationFailed` after the configured number of
    /// draws.
    pub fn allocate(&self, in_use: &HashSet<u16>) -> Result<u16, SessionError> {
        if self.range.is_empty() {
            return Err(SessionError::PortAllocationFailed { attempts: 0 });
        }

        let mut rng = rand::thread_rng();
        for _ in 0..self.range.max_attempts {
            let candidate = rng.gen_range(self.range.start..=self.range.end);
            if !in_use.contains(&candidate) {
                tracing::debug!("Allocated relay port {}", candidate);
                return Ok(candidate);
            }
        }

        tracing::warn!(
            "No free port in {}-{} after {} attempts",
            self.range.start,
            self.range.end,
            self.range.max_attempts
        );
        Err(SessionError::PortAllocationFailed {
            attempts: self.range.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u16, end: u16) -> PortRange {
        PortRange {
            start,
            end,
            max_attempts: 100,
        }
    }

    #[test]
    fn test_allocates_within_range() {
        let allocator = PortAllocator::new(range(20000, 20100));
        for _ in 0..50 {
            let port = allocator.allocate(&HashSet::new()).unwrap();
            assert!((20000..=20100).contains(&port));
        }
    }

    #[test]
    fn test_avoids_ports_in_use() {
        let allocator = PortAllocator::new(range(30000, 30001));
        let in_use: HashSet<u16> = [30000].into_iter().collect();
        for _ in 0..20 {
            assert_eq!(allocator.allocate(&in_use).unwrap(), 30001);
        }
    }

    #[test]
    fn test_exhausted_range_fails() {
        let allocator = PortAllocator::new(range(41523, 41523));
        let in_use: HashSet<u16> = [41523].into_iter().collect();
        assert!(matches!(
            allocator.allocate(&in_use),
            Err(SessionError::PortAllocationFailed { attempts: 100 })
        ));
    }
}
