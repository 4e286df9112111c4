//! Fixed-layout signal bodies

use crate::error::{Result, SignalError};
use crate::{Gsn, SignalFrame};
use kestrel_common::BlockRef;

/// A signal body made of positional 32-bit words.
///
/// `LENGTHS` lists every accepted length, shortest first. Decoding rejects a
/// body of any other length instead of zero-filling or truncating.
pub trait SignalData: Sized {
    const GSN: Gsn;
    const LENGTHS: &'static [usize];

    /// Words in transmission order
    fn to_words(&self) -> Vec<u32>;

    /// Build from a body whose length has been checked
    fn from_checked_words(data: &[u32]) -> Self;

    fn check_length(data: &[u32]) -> Result<()> {
        if Self::LENGTHS.contains(&data.len()) {
            Ok(())
        } else {
            Err(SignalError::LengthMismatch {
                signal: Self::GSN.name(),
                actual: data.len(),
                expected: Self::LENGTHS.to_vec(),
            })
        }
    }

    fn from_words(data: &[u32]) -> Result<Self> {
        Self::check_length(data)?;
        Ok(Self::from_checked_words(data))
    }

    fn to_frame(&self, sender: BlockRef) -> SignalFrame {
        SignalFrame::new(Self::GSN, sender, self.to_words())
    }
}
