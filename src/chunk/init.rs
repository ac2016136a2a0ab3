use bytes::{Buf, BufMut};
use crate::chunk::parameter::InitParameters;

/// The value of INIT and INIT ACK chunks, which share their structure:
///
/// ```ascii
///  0: initiate tag (u32)
///  4: advertised receiver window credit (u32)
///  8: number of outbound streams (u16)
/// 10: number of inbound streams (u16)
/// 12: initial TSN (u32)
/// 16: optional / variable length parameters
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitChunk {
    /// the verification tag that the receiver must put into every packet for the sender
    pub initiate_tag: u32,
    pub advertised_receiver_window_credit: u32,
    pub number_of_outbound_streams: u16,
    pub number_of_inbound_streams: u16,
    pub initial_tsn: u32,
    pub parameters: InitParameters,
}

impl InitChunk {
    const FIXED_LEN: usize = 16;

    pub(crate) fn value_len(&self) -> usize {
        Self::FIXED_LEN + self.parameters.serialized_len()
    }

    pub(crate) fn ser_value(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.initiate_tag);
        buf.put_u32(self.advertised_receiver_window_credit);
        buf.put_u16(self.number_of_outbound_streams);
        buf.put_u16(self.number_of_inbound_streams);
        buf.put_u32(self.initial_tsn);
        self.parameters.ser(buf);
    }

    pub(crate) fn deser_value(buf: &mut impl Buf) -> anyhow::Result<InitChunk> {
        Ok(InitChunk {
            initiate_tag: buf.try_get_u32()?,
            advertised_receiver_window_credit: buf.try_get_u32()?,
            number_of_outbound_streams: buf.try_get_u16()?,
            number_of_inbound_streams: buf.try_get_u16()?,
            initial_tsn: buf.try_get_u32()?,
            parameters: InitParameters::deser(buf)?,
        })
    }
}
