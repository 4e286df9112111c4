//! Global checkpoint identifiers.
//!
//! A GCI is stamped on every committed row version and orders durability
//! points. It travels as two words: `gci_hi` (the global checkpoint epoch)
//! and `gci_lo` (the micro checkpoint within the epoch).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Immutable GCI with total ordering: epoch first, then micro checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gci {
    /// Epoch (`gci_hi` on the wire)
    pub hi: u32,
    /// Micro checkpoint (`gci_lo` on the wire)
    pub lo: u32,
}

impl Gci {
    pub const ZERO: Gci = Gci { hi: 0, lo: 0 };

    pub const fn new(hi: u32, lo: u32) -> Self {
        Self { hi, lo }
    }

    pub const fn as_u64(&self) -> u64 {
        ((self.hi as u64) << 32) | self.lo as u64
    }

    pub const fn from_u64(value: u64) -> Self {
        Self {
            hi: (value >> 32) as u32,
            lo: value as u32,
        }
    }
}

impl fmt::Display for Gci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hi, self.lo)
    }
}

/// Monotonic GCI source shared by the coordinator instances of a node.
///
/// Commits that run inside the same micro checkpoint share its GCI; the
/// checkpoint protocol (external) moves the clock forward.
pub struct GciClock {
    current: AtomicU64,
}

impl GciClock {
    /// Create a clock positioned at `start`
    pub fn starting_at(start: Gci) -> Self {
        Self {
            current: AtomicU64::new(start.as_u64()),
        }
    }

    /// GCI to stamp on a commit decided now
    pub fn current(&self) -> Gci {
        Gci::from_u64(self.current.load(Ordering::SeqCst))
    }

    /// Start the next micro checkpoint within the epoch
    pub fn advance_micro(&self) -> Gci {
        Gci::from_u64(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Start a new epoch; the micro counter restarts at zero
    pub fn advance_epoch(&self) -> Gci {
        let mut observed = self.current.load(Ordering::SeqCst);
        loop {
            let next = Gci::new(Gci::from_u64(observed).hi + 1, 0).as_u64();
            match self.current.compare_exchange(
                observed,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Gci::from_u64(next),
                Err(actual) => observed = actual,
            }
        }
    }

    /// Catch up with a GCI seen from another node; never moves backwards.
    pub fn observe(&self, seen: Gci) -> Gci {
        let previous = self.current.fetch_max(seen.as_u64(), Ordering::SeqCst);
        Gci::from_u64(previous.max(seen.as_u64()))
    }
}

impl Default for GciClock {
    fn default() -> Self {
        Self::starting_at(Gci::new(1, 0))
    }
}

/// Clock shared across coordinator instances
pub type SharedGciClock = Arc<GciClock>;
