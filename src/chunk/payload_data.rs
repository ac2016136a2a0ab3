use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PayloadFlags: u8 {
        /// last fragment of a user message
        const END       = 0b0000_0001;
        /// first fragment of a user message
        const BEGIN     = 0b0000_0010;
        const UNORDERED = 0b0000_0100;
        /// RFC 7053: the receiver should acknowledge without delay
        const IMMEDIATE = 0b0000_1000;
    }
}

/// The value of a DATA chunk:
///
/// ```ascii
///  0: TSN (u32)
///  4: stream identifier (u16)
///  6: stream sequence number (u16)
///  8: payload protocol identifier (u32)
/// 12: user data
/// ```
///
/// NB: User messages are never fragmented, so every chunk sent has both BEGIN and END set
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PayloadDataChunk {
    pub flags: PayloadFlags,
    pub tsn: u32,
    pub stream_id: u16,
    pub stream_sequence_number: u16,
    pub payload_protocol_id: u32,
    pub user_data: Bytes,
}

impl PayloadDataChunk {
    pub(crate) const FIXED_LEN: usize = 12;

    pub(crate) fn value_len(&self) -> usize {
        Self::FIXED_LEN + self.user_data.len()
    }

    pub(crate) fn ser_value(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.tsn);
        buf.put_u16(self.stream_id);
        buf.put_u16(self.stream_sequence_number);
        buf.put_u32(self.payload_protocol_id);
        buf.put_slice(&self.user_data);
    }

    pub(crate) fn deser_value(flags: u8, buf: &mut impl Buf) -> anyhow::Result<PayloadDataChunk> {
        let tsn = buf.try_get_u32()?;
        let stream_id = buf.try_get_u16()?;
        let stream_sequence_number = buf.try_get_u16()?;
        let payload_protocol_id = buf.try_get_u32()?;
        let user_data = buf.copy_to_bytes(buf.remaining());

        Ok(PayloadDataChunk {
            flags: PayloadFlags::from_bits_retain(flags),
            tsn,
            stream_id,
            stream_sequence_number,
            payload_protocol_id,
            user_data,
        })
    }
}
