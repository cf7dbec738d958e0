//! Domain Value Objects

use serde::Serialize;
use std::fmt;

/// Required leading zero bits of the proof-of-work hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Difficulty(u8);

impl Difficulty {
    pub const MIN: u8 = 16;
    pub const MAX: u8 = 32;

    pub fn new(bits: u8) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&bits) {
            Some(Self(bits))
        } else {
            None
        }
    }

    /// `min(32, 16 + floor(ln(queued + 1)))`
    ///
    /// Non-decreasing in `queued`; an idle queue costs 2^16 hashes, a queue
    /// of ~8.9e6 reaches the cap.
    pub fn for_queue_depth(queued: u64) -> Self {
        let bonus = (queued as f64 + 1.0).ln().floor();
        let bits = (Self::MIN as f64 + bonus).min(Self::MAX as f64);
        Self(bits as u8)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl From<Difficulty> for u8 {
    fn from(d: Difficulty) -> Self {
        d.0
    }
}

/// Host port reserved for one job's container
///
/// Always even and inside [`Port::LOWEST`, `Port::HIGHEST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Port(u16);

impl Port {
    /// Exclusive upper bound of a candidate draw
    pub const DRAW_SPAN: u32 = 30_000;
    const DRAW_BASE: u32 = 1_024;

    pub const LOWEST: u16 = (Self::DRAW_BASE * 2) as u16;
    pub const HIGHEST: u16 = ((Self::DRAW_SPAN - 1 + Self::DRAW_BASE) * 2) as u16;

    pub fn new(port: u16) -> Option<Self> {
        if port % 2 == 0 && (Self::LOWEST..=Self::HIGHEST).contains(&port) {
            Some(Self(port))
        } else {
            None
        }
    }

    /// Map a uniform draw in `[0, DRAW_SPAN)` onto the port range
    pub fn from_draw(draw: u32) -> Self {
        let draw = draw % Self::DRAW_SPAN;
        Self(((draw + Self::DRAW_BASE) * 2) as u16)
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difficulty_bounds() {
        assert!(Difficulty::new(15).is_none());
        assert!(Difficulty::new(16).is_some());
        assert!(Difficulty::new(32).is_some());
        assert!(Difficulty::new(33).is_none());
    }

    #[test]
    fn test_difficulty_for_queue_depth() {
        assert_eq!(Difficulty::for_queue_depth(0).bits(), 16);
        assert_eq!(Difficulty::for_queue_depth(1).bits(), 16); // ln 2 = 0.69
        assert_eq!(Difficulty::for_queue_depth(2).bits(), 17); // ln 3 = 1.09
        assert_eq!(Difficulty::for_queue_depth(19).bits(), 18); // ln 20 = 2.99
        assert_eq!(Difficulty::for_queue_depth(20).bits(), 19); // ln 21 = 3.04
        assert_eq!(Difficulty::for_queue_depth(u64::MAX).bits(), 32);
    }

    #[test]
    fn test_difficulty_monotonic_and_clamped() {
        let mut previous = Difficulty::for_queue_depth(0);
        let mut queued = 0u64;
        while queued < 50_000_000 {
            let current = Difficulty::for_queue_depth(queued);
            assert!(current >= previous, "decreased at {}", queued);
            assert!((Difficulty::MIN..=Difficulty::MAX).contains(&current.bits()));
            previous = current;
            queued = queued * 3 / 2 + 1;
        }
    }

    #[test]
    fn test_port_range() {
        assert_eq!(Port::LOWEST, 2048);
        assert_eq!(Port::HIGHEST, 62046);
        assert_eq!(Port::from_draw(0).get(), 2048);
        assert_eq!(Port::from_draw(Port::DRAW_SPAN - 1).get(), 62046);
        assert_eq!(Port::from_draw(Port::DRAW_SPAN), Port::from_draw(0));
    }

    #[test]
    fn test_port_validation() {
        assert!(Port::new(2048).is_some());
        assert!(Port::new(2049).is_none());
        assert!(Port::new(2046).is_none());
        assert!(Port::new(62048).is_none());
    }
}
