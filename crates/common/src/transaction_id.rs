//! Transaction identifier carried as two 32-bit words
//!
//! Every protocol message that references a transaction carries the identity
//! verbatim as `transid1` (high word) and `transid2` (low word). Participants
//! only use it to locate and validate the local operation; it implies no
//! ordering between transactions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit transaction identifier split into two wire words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    /// High word (`transid1` on the wire)
    pub transid1: u32,
    /// Low word (`transid2` on the wire)
    pub transid2: u32,
}

impl TransactionId {
    /// Create from the two wire words
    pub const fn new(transid1: u32, transid2: u32) -> Self {
        Self { transid1, transid2 }
    }

    /// Create from a 64-bit value
    pub const fn from_u64(value: u64) -> Self {
        Self {
            transid1: (value >> 32) as u32,
            transid2: value as u32,
        }
    }

    /// Convert to a 64-bit value
    pub const fn as_u64(&self) -> u64 {
        ((self.transid1 as u64) << 32) | self.transid2 as u64
    }

    /// The two wire words in transmission order
    pub const fn words(&self) -> [u32; 2] {
        [self.transid1, self.transid2]
    }

    /// Parse from the `transid1:transid2` string form
    pub fn parse(s: &str) -> Result<Self, String> {
        let (hi, lo) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid transaction ID: {} (expected hi:lo)", s))?;
        let transid1 = hi
            .parse()
            .map_err(|_| format!("Invalid transid1 component: {}", hi))?;
        let transid2 = lo
            .parse()
            .map_err(|_| format!("Invalid transid2 component: {}", lo))?;
        Ok(Self::new(transid1, transid2))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transid1, self.transid2)
    }
}

impl From<u64> for TransactionId {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u64_roundtrip() {
        let id = TransactionId::from_u64(0x0000_0001_0000_002a);
        assert_eq!(id, TransactionId::new(1, 42));
        assert_eq!(id.as_u64(), 0x0000_0001_0000_002a);
    }

    #[test]
    fn test_string_roundtrip() {
        let id = TransactionId::new(7, u32::MAX);
        let parsed = TransactionId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TransactionId::parse("42").is_err());
        assert!(TransactionId::parse("a:1").is_err());
        assert!(TransactionId::parse("1:").is_err());
    }

    #[test]
    fn test_words_order() {
        let id = TransactionId::new(1, 42);
        assert_eq!(id.words(), [1, 42]);
    }
}
