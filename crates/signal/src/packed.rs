//! Packed signal codec
//!
//! A packed frame carries several short sub-messages back to back. The top
//! four bits of each sub-message's first word hold its tag and the low 28 bits
//! its token; the remaining length comes from a static table, except COMMIT,
//! whose length the caller supplies. A frame is accepted whole or rejected
//! whole: unknown or disallowed tags, truncated sub-messages and oversized
//! frames never get partially processed.

use crate::error::PackedError;
use kestrel_common::{BlockRef, Gci, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Upper bound on the words of one packed frame
pub const MAX_PACKED_WORDS: usize = 25;

/// Bits of the first word available to the sub-message token
pub const TOKEN_MASK: u32 = 0x0FFF_FFFF;

const TAG_SHIFT: u32 = 28;

/// Default COMMIT sub-message length
pub const COMMIT_LENGTH: u32 = 5;
/// COMMIT sub-message without the trailing `gci_lo`
pub const COMMIT_LENGTH_SHORT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum PackedTag {
    Commit = 0,
    Complete = 1,
    Committed = 2,
    Completed = 3,
    LqhKeyConf = 4,
    RemoveMarker = 5,
    FireTrigReq = 6,
    FireTrigConf = 7,
}

impl PackedTag {
    pub fn from_u32(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => PackedTag::Commit,
            1 => PackedTag::Complete,
            2 => PackedTag::Committed,
            3 => PackedTag::Completed,
            4 => PackedTag::LqhKeyConf,
            5 => PackedTag::RemoveMarker,
            6 => PackedTag::FireTrigReq,
            7 => PackedTag::FireTrigConf,
            _ => return None,
        })
    }

    /// Bit of this tag in a type mask
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Type mask allowing every listed tag
    pub fn mask(tags: &[PackedTag]) -> u32 {
        tags.iter().fold(0, |mask, tag| mask | tag.bit())
    }

    pub fn name(self) -> &'static str {
        match self {
            PackedTag::Commit => "COMMIT",
            PackedTag::Complete => "COMPLETE",
            PackedTag::Committed => "COMMITTED",
            PackedTag::Completed => "COMPLETED",
            PackedTag::LqhKeyConf => "LQHKEYCONF",
            PackedTag::RemoveMarker => "REMOVE_MARKER",
            PackedTag::FireTrigReq => "FIRE_TRIG_REQ",
            PackedTag::FireTrigConf => "FIRE_TRIG_CONF",
        }
    }
}

/// Static sub-message length for a raw tag value.
///
/// COMMIT reports its default length; decoders use the caller-supplied one.
pub fn length_of(tag: u32) -> Option<u32> {
    match PackedTag::from_u32(tag)? {
        PackedTag::Commit => Some(COMMIT_LENGTH),
        PackedTag::Complete => Some(3),
        PackedTag::Committed => Some(3),
        PackedTag::Completed => Some(3),
        PackedTag::LqhKeyConf => Some(7),
        PackedTag::RemoveMarker => Some(3),
        PackedTag::FireTrigReq => Some(4),
        PackedTag::FireTrigConf => Some(4),
    }
}

/// Key operation prepared; tells the coordinator the participant's record word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LqhKeyConf {
    pub lqh_ptr: u32,
    pub tc_oprec: u32,
    pub user_ref: BlockRef,
    pub read_len: u32,
    pub trans_id: TransactionId,
    pub num_fired_triggers: u32,
}

/// One decoded sub-message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackedSignal {
    Commit {
        lqh_ptr: u32,
        gci: Gci,
        trans_id: TransactionId,
    },
    Complete {
        lqh_ptr: u32,
        trans_id: TransactionId,
    },
    Committed {
        tc_oprec: u32,
        trans_id: TransactionId,
    },
    Completed {
        tc_oprec: u32,
        trans_id: TransactionId,
    },
    LqhKeyConf(LqhKeyConf),
    RemoveMarker {
        fail_api: bool,
        trans_id: TransactionId,
    },
    FireTrigReq {
        tc_oprec: u32,
        trans_id: TransactionId,
        pass: u32,
    },
    FireTrigConf {
        tc_oprec: u32,
        trans_id: TransactionId,
        num_fired: u32,
    },
}

impl PackedSignal {
    pub fn tag(&self) -> PackedTag {
        match self {
            PackedSignal::Commit { .. } => PackedTag::Commit,
            PackedSignal::Complete { .. } => PackedTag::Complete,
            PackedSignal::Committed { .. } => PackedTag::Committed,
            PackedSignal::Completed { .. } => PackedTag::Completed,
            PackedSignal::LqhKeyConf(_) => PackedTag::LqhKeyConf,
            PackedSignal::RemoveMarker { .. } => PackedTag::RemoveMarker,
            PackedSignal::FireTrigReq { .. } => PackedTag::FireTrigReq,
            PackedSignal::FireTrigConf { .. } => PackedTag::FireTrigConf,
        }
    }

    pub fn trans_id(&self) -> TransactionId {
        match self {
            PackedSignal::Commit { trans_id, .. }
            | PackedSignal::Complete { trans_id, .. }
            | PackedSignal::Committed { trans_id, .. }
            | PackedSignal::Completed { trans_id, .. }
            | PackedSignal::RemoveMarker { trans_id, .. }
            | PackedSignal::FireTrigReq { trans_id, .. }
            | PackedSignal::FireTrigConf { trans_id, .. } => *trans_id,
            PackedSignal::LqhKeyConf(conf) => conf.trans_id,
        }
    }

    /// Encoded length in words
    pub fn word_len(&self) -> usize {
        match self {
            PackedSignal::Commit { .. } => COMMIT_LENGTH as usize,
            other => length_of(other.tag() as u32).unwrap_or(0) as usize,
        }
    }

    fn token(&self) -> u32 {
        match self {
            PackedSignal::Commit { lqh_ptr, .. } | PackedSignal::Complete { lqh_ptr, .. } => {
                *lqh_ptr
            }
            PackedSignal::Committed { tc_oprec, .. }
            | PackedSignal::Completed { tc_oprec, .. }
            | PackedSignal::FireTrigReq { tc_oprec, .. }
            | PackedSignal::FireTrigConf { tc_oprec, .. } => *tc_oprec,
            PackedSignal::LqhKeyConf(conf) => conf.lqh_ptr,
            PackedSignal::RemoveMarker { fail_api, .. } => *fail_api as u32,
        }
    }

    fn write(&self, out: &mut Vec<u32>) -> Result<(), PackedError> {
        let token = self.token();
        if token & !TOKEN_MASK != 0 {
            return Err(PackedError::TokenTooWide(token));
        }
        out.push(((self.tag() as u32) << TAG_SHIFT) | token);
        match self {
            PackedSignal::Commit { gci, trans_id, .. } => {
                out.extend([gci.hi, trans_id.transid1, trans_id.transid2, gci.lo])
            }
            PackedSignal::Complete { trans_id, .. }
            | PackedSignal::Committed { trans_id, .. }
            | PackedSignal::Completed { trans_id, .. }
            | PackedSignal::RemoveMarker { trans_id, .. } => {
                out.extend(trans_id.words());
            }
            PackedSignal::LqhKeyConf(conf) => out.extend([
                conf.tc_oprec,
                conf.user_ref.as_u32(),
                conf.read_len,
                conf.trans_id.transid1,
                conf.trans_id.transid2,
                conf.num_fired_triggers,
            ]),
            PackedSignal::FireTrigReq { trans_id, pass, .. } => {
                out.extend([trans_id.transid1, trans_id.transid2, *pass])
            }
            PackedSignal::FireTrigConf {
                trans_id,
                num_fired,
                ..
            } => out.extend([trans_id.transid1, trans_id.transid2, *num_fired]),
        }
        Ok(())
    }

    fn read(tag: PackedTag, words: &[u32]) -> Self {
        let token = words[0] & TOKEN_MASK;
        match tag {
            PackedTag::Commit => PackedSignal::Commit {
                lqh_ptr: token,
                gci: Gci::new(words[1], words.get(4).copied().unwrap_or(0)),
                trans_id: TransactionId::new(words[2], words[3]),
            },
            PackedTag::Complete => PackedSignal::Complete {
                lqh_ptr: token,
                trans_id: TransactionId::new(words[1], words[2]),
            },
            PackedTag::Committed => PackedSignal::Committed {
                tc_oprec: token,
                trans_id: TransactionId::new(words[1], words[2]),
            },
            PackedTag::Completed => PackedSignal::Completed {
                tc_oprec: token,
                trans_id: TransactionId::new(words[1], words[2]),
            },
            PackedTag::LqhKeyConf => PackedSignal::LqhKeyConf(LqhKeyConf {
                lqh_ptr: token,
                tc_oprec: words[1],
                user_ref: BlockRef::from_u32(words[2]),
                read_len: words[3],
                trans_id: TransactionId::new(words[4], words[5]),
                num_fired_triggers: words[6],
            }),
            PackedTag::RemoveMarker => PackedSignal::RemoveMarker {
                fail_api: token & 1 != 0,
                trans_id: TransactionId::new(words[1], words[2]),
            },
            PackedTag::FireTrigReq => PackedSignal::FireTrigReq {
                tc_oprec: token,
                trans_id: TransactionId::new(words[1], words[2]),
                pass: words[3],
            },
            PackedTag::FireTrigConf => PackedSignal::FireTrigConf {
                tc_oprec: token,
                trans_id: TransactionId::new(words[1], words[2]),
                num_fired: words[3],
            },
        }
    }
}

fn check_commit_len(commit_len: u32) -> Result<(), PackedError> {
    if commit_len == COMMIT_LENGTH || commit_len == COMMIT_LENGTH_SHORT {
        Ok(())
    } else {
        Err(PackedError::InvalidCommitLength(commit_len))
    }
}

fn check_bound(frame: &[u32]) -> Result<(), PackedError> {
    if frame.len() > MAX_PACKED_WORDS {
        return Err(PackedError::FrameTooLong {
            len: frame.len(),
            max: MAX_PACKED_WORDS,
        });
    }
    Ok(())
}

/// Walk sub-message boundaries: (position, tag, length) per sub-message.
fn walk(frame: &[u32], commit_len: u32) -> Result<Vec<(usize, PackedTag, usize)>, PackedError> {
    let mut pos = 0;
    let mut spans = Vec::new();
    while pos < frame.len() {
        let raw = frame[pos] >> TAG_SHIFT;
        let tag = PackedTag::from_u32(raw).ok_or(PackedError::UnknownTag { tag: raw, pos })?;
        let len = match tag {
            PackedTag::Commit => commit_len,
            other => length_of(other as u32).ok_or(PackedError::UnknownTag { tag: raw, pos })?,
        } as usize;
        if pos + len > frame.len() {
            return Err(PackedError::Truncated {
                pos,
                needed: len,
                remaining: frame.len() - pos,
            });
        }
        spans.push((pos, tag, len));
        pos += len;
    }
    Ok(spans)
}

/// Decode a frame into sub-messages in frame order
pub fn decode(frame: &[u32], commit_len: u32) -> Result<Vec<PackedSignal>, PackedError> {
    check_bound(frame)?;
    check_commit_len(commit_len)?;
    let spans = walk(frame, commit_len)?;
    Ok(spans
        .into_iter()
        .map(|(pos, tag, len)| PackedSignal::read(tag, &frame[pos..pos + len]))
        .collect())
}

/// Encode sub-messages into one frame
pub fn encode(signals: &[PackedSignal]) -> Result<Vec<u32>, PackedError> {
    let mut frame = Vec::with_capacity(MAX_PACKED_WORDS);
    for signal in signals {
        signal.write(&mut frame)?;
    }
    check_bound(&frame)?;
    Ok(frame)
}

/// Group sub-messages into batches that each fit one frame, preserving order
pub fn batch(signals: Vec<PackedSignal>) -> Vec<Vec<PackedSignal>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut words = 0;
    for signal in signals {
        let len = signal.word_len();
        if !current.is_empty() && words + len > MAX_PACKED_WORDS {
            batches.push(std::mem::take(&mut current));
            words = 0;
        }
        words += len;
        current.push(signal);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Encode sub-messages into as few frames as the word bound allows,
/// preserving order
pub fn encode_frames(signals: &[PackedSignal]) -> Result<Vec<Vec<u32>>, PackedError> {
    batch(signals.to_vec())
        .iter()
        .map(|signals| encode(signals))
        .collect()
}

/// Check a received frame before any sub-message is acted on.
///
/// Rejects tags outside `allowed_mask`, a cumulative length that does not
/// land exactly on the frame end, and frames over the word bound. A rejected
/// frame is dumped to the diagnostics stream.
pub fn verify(frame: &[u32], allowed_mask: u32, commit_len: u32) -> Result<(), PackedError> {
    let result = verify_inner(frame, allowed_mask, commit_len);
    if let Err(ref error) = result {
        dump_frame(frame, commit_len, error);
    }
    result
}

fn verify_inner(frame: &[u32], allowed_mask: u32, commit_len: u32) -> Result<(), PackedError> {
    check_bound(frame)?;
    check_commit_len(commit_len)?;
    let mut pos = 0;
    while pos < frame.len() {
        let raw = frame[pos] >> TAG_SHIFT;
        if (1 << raw) & allowed_mask == 0 {
            return Err(PackedError::UnexpectedTag {
                tag: raw,
                pos,
                allowed: allowed_mask,
            });
        }
        let len = if raw == PackedTag::Commit as u32 {
            commit_len
        } else {
            length_of(raw).ok_or(PackedError::UnknownTag { tag: raw, pos })?
        };
        pos += len as usize;
    }
    if pos != frame.len() {
        return Err(PackedError::LengthMismatch {
            consumed: pos,
            declared: frame.len(),
        });
    }
    Ok(())
}

/// Verify against `allowed_mask`, then decode
pub fn decode_verified(
    frame: &[u32],
    allowed_mask: u32,
    commit_len: u32,
) -> Result<Vec<PackedSignal>, PackedError> {
    verify(frame, allowed_mask, commit_len)?;
    decode(frame, commit_len)
}

/// Hex dump of a frame, one word per column, eight words per row
pub fn hex_dump(frame: &[u32]) -> String {
    let mut out = String::new();
    for (row, chunk) in frame.chunks(8).enumerate() {
        let _ = write!(out, "{:04}:", row * 8);
        for word in chunk {
            let _ = write!(out, " H'{}", hex::encode(word.to_be_bytes()));
        }
        out.push('\n');
    }
    out
}

/// Log a rejected frame: the raw words, then every sub-message that can
/// still be delimited.
pub fn dump_frame(frame: &[u32], commit_len: u32, error: &PackedError) {
    let mut listing = String::new();
    let mut pos = 0;
    while pos < frame.len() {
        let raw = frame[pos] >> TAG_SHIFT;
        let len = match PackedTag::from_u32(raw) {
            Some(PackedTag::Commit) if check_commit_len(commit_len).is_ok() => commit_len as usize,
            Some(tag) => length_of(tag as u32).unwrap_or(0) as usize,
            None => 0,
        };
        let tag = PackedTag::from_u32(raw);
        match tag {
            Some(tag) if len > 0 && pos + len <= frame.len() => {
                let signal = PackedSignal::read(tag, &frame[pos..pos + len]);
                let fields = serde_json::to_string(&signal)
                    .unwrap_or_else(|e| format!("<unprintable: {}>", e));
                let _ = writeln!(listing, "  [{:02}] {} {}", pos, tag.name(), fields);
                pos += len;
            }
            _ => {
                let _ = writeln!(
                    listing,
                    "  [{:02}] tag {} undecodable, {} trailing words",
                    pos,
                    raw,
                    frame.len() - pos
                );
                break;
            }
        }
    }
    tracing::error!(
        "Packed frame rejected ({}), {} words:\n{}{}",
        error,
        frame.len(),
        hex_dump(frame),
        listing
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::NodeId;

    const TRANS: TransactionId = TransactionId::new(1, 42);

    fn sample() -> Vec<PackedSignal> {
        vec![
            PackedSignal::Commit {
                lqh_ptr: 0x123,
                gci: Gci::new(3, 0),
                trans_id: TRANS,
            },
            PackedSignal::Complete {
                lqh_ptr: 0x456,
                trans_id: TRANS,
            },
            PackedSignal::RemoveMarker {
                fail_api: true,
                trans_id: TRANS,
            },
        ]
    }

    fn all_masks() -> u32 {
        0xFF
    }

    #[test]
    fn test_length_table() {
        assert_eq!(length_of(0), Some(5));
        assert_eq!(length_of(1), Some(3));
        assert_eq!(length_of(2), Some(3));
        assert_eq!(length_of(3), Some(3));
        assert_eq!(length_of(4), Some(7));
        assert_eq!(length_of(5), Some(3));
        assert_eq!(length_of(6), Some(4));
        assert_eq!(length_of(7), Some(4));
        assert_eq!(length_of(8), None);
        assert_eq!(length_of(15), None);
    }

    #[test]
    fn test_frame_roundtrip() {
        let signals = sample();
        let frame = encode(&signals).unwrap();
        assert_eq!(frame.len(), 11);
        assert_eq!(frame[0] >> 28, 0);
        assert_eq!(frame[5] >> 28, 1);
        assert_eq!(frame[8], (5 << 28) | 1);
        verify(&frame, all_masks(), COMMIT_LENGTH).unwrap();
        assert_eq!(decode(&frame, COMMIT_LENGTH).unwrap(), signals);
    }

    #[test]
    fn test_short_commit_length() {
        let frame = vec![0x10, 3, 1, 42];
        let decoded = decode(&frame, COMMIT_LENGTH_SHORT).unwrap();
        assert_eq!(
            decoded,
            vec![PackedSignal::Commit {
                lqh_ptr: 0x10,
                gci: Gci::new(3, 0),
                trans_id: TRANS,
            }]
        );
        assert!(decode(&frame, COMMIT_LENGTH).is_err());
        assert_eq!(
            decode(&frame, 6),
            Err(PackedError::InvalidCommitLength(6))
        );
    }

    #[test]
    fn test_mutated_tag_is_rejected() {
        let mut frame = encode(&sample()).unwrap();
        frame[5] = (9 << 28) | (frame[5] & TOKEN_MASK);
        assert!(matches!(
            verify(&frame, all_masks(), COMMIT_LENGTH),
            Err(PackedError::UnexpectedTag { tag: 9, pos: 5, .. })
        ));
        assert_eq!(
            decode(&frame, COMMIT_LENGTH),
            Err(PackedError::UnknownTag { tag: 9, pos: 5 })
        );
    }

    #[test]
    fn test_disallowed_tag_is_rejected() {
        let frame = encode(&sample()).unwrap();
        let mask = PackedTag::mask(&[PackedTag::Commit, PackedTag::Complete]);
        assert!(matches!(
            verify(&frame, mask, COMMIT_LENGTH),
            Err(PackedError::UnexpectedTag { tag: 5, pos: 8, .. })
        ));
    }

    #[test]
    fn test_truncation_by_one_word_is_rejected() {
        let mut frame = encode(&sample()).unwrap();
        frame.pop();
        assert_eq!(
            verify(&frame, all_masks(), COMMIT_LENGTH),
            Err(PackedError::LengthMismatch {
                consumed: 11,
                declared: 10
            })
        );
        assert!(matches!(
            decode(&frame, COMMIT_LENGTH),
            Err(PackedError::Truncated { pos: 8, .. })
        ));
    }

    #[test]
    fn test_word_bound_is_enforced() {
        let committed = PackedSignal::Committed {
            tc_oprec: 7,
            trans_id: TRANS,
        };
        let fits = vec![committed; 8];
        assert_eq!(encode(&fits).unwrap().len(), 24);

        let too_many = vec![committed; 9];
        assert_eq!(
            encode(&too_many),
            Err(PackedError::FrameTooLong { len: 27, max: 25 })
        );

        let frame = vec![(2 << 28) | 7, 1, 42].repeat(9);
        assert!(matches!(
            verify(&frame, all_masks(), COMMIT_LENGTH),
            Err(PackedError::FrameTooLong { .. })
        ));
    }

    #[test]
    fn test_encode_frames_splits_at_bound() {
        let signals: Vec<PackedSignal> = (0..6)
            .map(|i| PackedSignal::Commit {
                lqh_ptr: i,
                gci: Gci::new(3, 0),
                trans_id: TRANS,
            })
            .collect();
        let frames = encode_frames(&signals).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 25);
        assert_eq!(frames[1].len(), 5);
        let decoded: Vec<PackedSignal> = frames
            .iter()
            .flat_map(|f| decode(f, COMMIT_LENGTH).unwrap())
            .collect();
        assert_eq!(decoded, signals);
    }

    #[test]
    fn test_token_too_wide() {
        let signal = PackedSignal::Committed {
            tc_oprec: 0x1000_0000,
            trans_id: TRANS,
        };
        assert_eq!(
            encode(&[signal]),
            Err(PackedError::TokenTooWide(0x1000_0000))
        );
    }

    #[test]
    fn test_lqhkeyconf_layout() {
        let conf = PackedSignal::LqhKeyConf(LqhKeyConf {
            lqh_ptr: 0x20,
            tc_oprec: 7,
            user_ref: BlockRef::new(NodeId(2), 1),
            read_len: 0,
            trans_id: TRANS,
            num_fired_triggers: 0,
        });
        let frame = encode(&[conf]).unwrap();
        assert_eq!(frame.len(), 7);
        assert_eq!(frame[0], (4 << 28) | 0x20);
        assert_eq!(decode(&frame, COMMIT_LENGTH).unwrap(), vec![conf]);
    }

    #[test]
    fn test_hex_dump_format() {
        let dump = hex_dump(&[0x2000_0007, 1, 42]);
        assert_eq!(dump, "0000: H'20000007 H'00000001 H'0000002a\n");
    }

    #[test]
    fn test_empty_frame_is_valid() {
        verify(&[], all_masks(), COMMIT_LENGTH).unwrap();
        assert!(decode(&[], COMMIT_LENGTH).unwrap().is_empty());
    }
}
