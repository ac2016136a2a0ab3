use bytes::{Buf, BufMut};
use crate::safe_converter::PrecheckedCast;

/// A run of received TSNs after a gap, as offsets relative to the cumulative TSN ack. Both
///  boundaries are inclusive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GapAckBlock {
    pub start: u16,
    pub end: u16,
}

/// The value of a SACK chunk:
///
/// ```ascii
///  0: cumulative TSN ack (u32)
///  4: advertised receiver window credit (u32)
///  8: number of gap ack blocks (u16)
/// 10: number of duplicate TSNs (u16)
/// 12: gap ack blocks: start (u16), end (u16)
///  *: duplicate TSNs (u32)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SackChunk {
    pub cumulative_tsn_ack: u32,
    pub advertised_receiver_window_credit: u32,
    pub gap_ack_blocks: Vec<GapAckBlock>,
    pub duplicate_tsns: Vec<u32>,
}

impl SackChunk {
    pub(crate) const FIXED_LEN: usize = 12;

    pub(crate) fn value_len(&self) -> usize {
        Self::FIXED_LEN + 4 * self.gap_ack_blocks.len() + 4 * self.duplicate_tsns.len()
    }

    pub(crate) fn ser_value(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.cumulative_tsn_ack);
        buf.put_u32(self.advertised_receiver_window_credit);
        buf.put_u16(self.gap_ack_blocks.len().prechecked_cast());
        buf.put_u16(self.duplicate_tsns.len().prechecked_cast());
        for block in &self.gap_ack_blocks {
            buf.put_u16(block.start);
            buf.put_u16(block.end);
        }
        for tsn in &self.duplicate_tsns {
            buf.put_u32(*tsn);
        }
    }

    pub(crate) fn deser_value(buf: &mut impl Buf) -> anyhow::Result<SackChunk> {
        let cumulative_tsn_ack = buf.try_get_u32()?;
        let advertised_receiver_window_credit = buf.try_get_u32()?;
        let num_gap_ack_blocks = buf.try_get_u16()?;
        let num_duplicate_tsns = buf.try_get_u16()?;

        let mut gap_ack_blocks = Vec::with_capacity(num_gap_ack_blocks.into());
        for _ in 0..num_gap_ack_blocks {
            gap_ack_blocks.push(GapAckBlock {
                start: buf.try_get_u16()?,
                end: buf.try_get_u16()?,
            });
        }

        let mut duplicate_tsns = Vec::with_capacity(num_duplicate_tsns.into());
        for _ in 0..num_duplicate_tsns {
            duplicate_tsns.push(buf.try_get_u32()?);
        }

        Ok(SackChunk {
            cumulative_tsn_ack,
            advertised_receiver_window_credit,
            gap_ack_blocks,
            duplicate_tsns,
        })
    }
}
