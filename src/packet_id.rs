//! Packet ID allocation for MQTT

use crate::error::{Result, SessionError};

/// Hands out packet identifiers that do not collide with outstanding ones
///
/// Identifiers are drawn from 1..=65535 (0 is invalid) in wrapping order,
/// starting after the most recently issued id.
#[derive(Debug)]
pub struct PacketIdAllocator {
    next_id: u16,
}

impl PacketIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    /// Returns the next id for which `in_use` is false
    ///
    /// # Errors
    ///
    /// Returns `SessionError::IdExhausted` when every non-zero id is in use
    pub fn allocate(&mut self, in_use: impl Fn(u16) -> bool) -> Result<u16> {
        let mut candidate = self.next_id;
        for _ in 0..u16::MAX {
            let following = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if !in_use(candidate) {
                self.next_id = following;
                return Ok(candidate);
            }
            candidate = following;
        }
        Err(SessionError::IdExhausted)
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_packet_id_sequence() {
        let mut ids = PacketIdAllocator::new();

        assert_eq!(ids.allocate(|_| false).unwrap(), 1);
        assert_eq!(ids.allocate(|_| false).unwrap(), 2);
        assert_eq!(ids.allocate(|_| false).unwrap(), 3);
    }

    #[test]
    fn test_packet_id_wraparound() {
        let mut ids = PacketIdAllocator { next_id: u16::MAX };

        assert_eq!(ids.allocate(|_| false).unwrap(), u16::MAX);
        assert_eq!(ids.allocate(|_| false).unwrap(), 1); // 0 is skipped
    }

    #[test]
    fn test_skips_outstanding_ids() {
        let mut ids = PacketIdAllocator::new();
        let outstanding: HashSet<u16> = [1, 2, 4].into_iter().collect();

        assert_eq!(ids.allocate(|id| outstanding.contains(&id)).unwrap(), 3);
        assert_eq!(ids.allocate(|id| outstanding.contains(&id)).unwrap(), 5);
    }

    #[test]
    fn test_exhaustion() {
        let mut ids = PacketIdAllocator::new();
        assert!(matches!(
            ids.allocate(|_| true),
            Err(SessionError::IdExhausted)
        ));

        // A single free id is still found
        assert_eq!(ids.allocate(|id| id != 40_000).unwrap(), 40_000);
    }
}
