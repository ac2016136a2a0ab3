//! Optional and variable length parameters of INIT and INIT ACK chunks, encoded as TLVs:
//!
//! ```ascii
//! 0: parameter type (u16)
//! 2: parameter length (u16): length of type, length and value, excluding padding
//! 4: parameter value
//! *: zero padding to a multiple of four bytes
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, trace};
use crate::chunk::{padded_len, padding_len};
use crate::safe_converter::{PrecheckedCast, SafeCast};

const PARAMETER_HEADER_LEN: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ParameterType {
    Ipv4Address = 5,
    Ipv6Address = 6,
    StateCookie = 7,
    UnrecognizedParameter = 8,
    CookiePreservative = 9,
    HostNameAddress = 11,
    SupportedAddressTypes = 12,
    /// RFC 5061
    SupportedExtensions = 0x8008,
    /// RFC 3758
    ForwardTsnSupported = 0xc000,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownParameter {
    pub parameter_type: u16,
    pub value: Bytes,
}
impl UnknownParameter {
    /// The complete TLV, e.g. for reporting it back to the peer as an unrecognized parameter
    pub fn to_tlv(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(padded_len(PARAMETER_HEADER_LEN + self.value.len()));
        put_parameter(&mut buf, self.parameter_type, &self.value);
        buf.freeze()
    }
}

/// The parameters of an INIT or INIT ACK chunk. Each known parameter type has its own field;
///  parameters of other types are kept raw in `unknown_parameters`.
///
/// NB: This is a decoded view, not a lossless copy of the TLV list. Serialization writes the
///      parameters in field order regardless of the order they were received in, and for
///      parameters that may occur only once (state cookie, cookie preservative, host name) the
///      first occurrence wins.
///
/// NB: Address parameters are decoded, but WebRTC data channels must not use them, so this
///      implementation never sends them and ignores them when received
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InitParameters {
    pub ipv4_addresses: Vec<Ipv4Addr>,
    pub ipv6_addresses: Vec<Ipv6Addr>,
    pub state_cookie: Option<Bytes>,
    /// raw TLVs of parameters that the sender of an INIT ACK did not recognize
    pub unrecognized_parameters: Vec<Bytes>,
    /// suggested cookie lifespan increment in milliseconds
    pub cookie_preservative: Option<u32>,
    pub host_name: Option<Bytes>,
    pub supported_address_types: Vec<u16>,
    /// chunk types of supported protocol extensions
    pub supported_extensions: Vec<u8>,
    pub forward_tsn_supported: bool,
    pub unknown_parameters: Vec<UnknownParameter>,
}

impl InitParameters {
    pub fn serialized_len(&self) -> usize {
        let tlv = |value_len: usize| padded_len(PARAMETER_HEADER_LEN + value_len);

        self.ipv4_addresses.len() * tlv(4)
            + self.ipv6_addresses.len() * tlv(16)
            + self.state_cookie.as_ref().map_or(0, |c| tlv(c.len()))
            + self.unrecognized_parameters.iter().map(|p| tlv(p.len())).sum::<usize>()
            + self.cookie_preservative.map_or(0, |_| tlv(4))
            + self.host_name.as_ref().map_or(0, |h| tlv(h.len()))
            + if self.supported_address_types.is_empty() { 0 } else { tlv(2 * self.supported_address_types.len()) }
            + if self.supported_extensions.is_empty() { 0 } else { tlv(self.supported_extensions.len()) }
            + if self.forward_tsn_supported { tlv(0) } else { 0 }
            + self.unknown_parameters.iter().map(|p| tlv(p.value.len())).sum::<usize>()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        for addr in &self.ipv4_addresses {
            put_parameter(buf, ParameterType::Ipv4Address.into(), &addr.octets());
        }
        for addr in &self.ipv6_addresses {
            put_parameter(buf, ParameterType::Ipv6Address.into(), &addr.octets());
        }
        if let Some(cookie) = &self.state_cookie {
            put_parameter(buf, ParameterType::StateCookie.into(), cookie);
        }
        for unrecognized in &self.unrecognized_parameters {
            put_parameter(buf, ParameterType::UnrecognizedParameter.into(), unrecognized);
        }
        if let Some(increment) = self.cookie_preservative {
            put_parameter(buf, ParameterType::CookiePreservative.into(), &increment.to_be_bytes());
        }
        if let Some(host_name) = &self.host_name {
            put_parameter(buf, ParameterType::HostNameAddress.into(), host_name);
        }
        if !self.supported_address_types.is_empty() {
            let value = self.supported_address_types.iter()
                .flat_map(|t| t.to_be_bytes())
                .collect::<Vec<_>>();
            put_parameter(buf, ParameterType::SupportedAddressTypes.into(), &value);
        }
        if !self.supported_extensions.is_empty() {
            put_parameter(buf, ParameterType::SupportedExtensions.into(), &self.supported_extensions);
        }
        if self.forward_tsn_supported {
            put_parameter(buf, ParameterType::ForwardTsnSupported.into(), &[]);
        }
        for unknown in &self.unknown_parameters {
            put_parameter(buf, unknown.parameter_type, &unknown.value);
        }
    }

    /// Reads parameters until the buffer is exhausted. Any malformed parameter fails the entire
    ///  parameter list.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<InitParameters> {
        let mut result = InitParameters::default();

        while buf.has_remaining() {
            let parameter_type = buf.try_get_u16()?;
            let length: usize = buf.try_get_u16()?.safe_cast();
            if length < PARAMETER_HEADER_LEN {
                bail!("parameter {:#06x} has length {}, which is less than the parameter header", parameter_type, length);
            }
            let value_len = length - PARAMETER_HEADER_LEN;
            if value_len > buf.remaining() {
                bail!("parameter {:#06x} with length {} exceeds the remaining {} bytes", parameter_type, length, buf.remaining());
            }
            let mut value = buf.copy_to_bytes(value_len);

            // the last parameter's padding may be outside the chunk
            let padding = padding_len(length).min(buf.remaining());
            buf.advance(padding);

            trace!("decoded parameter {:#06x} with length {}", parameter_type, length);

            match ParameterType::try_from(parameter_type) {
                Ok(ParameterType::Ipv4Address) => {
                    result.ipv4_addresses.push(Ipv4Addr::from(value.try_get_u32()?));
                }
                Ok(ParameterType::Ipv6Address) => {
                    result.ipv6_addresses.push(Ipv6Addr::from(value.try_get_u128()?));
                }
                Ok(ParameterType::StateCookie) => set_once(&mut result.state_cookie, value, parameter_type),
                Ok(ParameterType::UnrecognizedParameter) => result.unrecognized_parameters.push(value),
                Ok(ParameterType::CookiePreservative) => {
                    set_once(&mut result.cookie_preservative, value.try_get_u32()?, parameter_type);
                }
                Ok(ParameterType::HostNameAddress) => set_once(&mut result.host_name, value, parameter_type),
                Ok(ParameterType::SupportedAddressTypes) => {
                    while value.has_remaining() {
                        result.supported_address_types.push(value.try_get_u16()?);
                    }
                }
                Ok(ParameterType::SupportedExtensions) => result.supported_extensions.extend_from_slice(&value),
                Ok(ParameterType::ForwardTsnSupported) => result.forward_tsn_supported = true,
                Err(_) => result.unknown_parameters.push(UnknownParameter { parameter_type, value }),
            }
        }

        Ok(result)
    }
}

fn set_once<T>(field: &mut Option<T>, value: T, parameter_type: u16) {
    if field.is_some() {
        debug!("ignoring repeated parameter {:#06x}", parameter_type);
        return;
    }
    *field = Some(value);
}

fn put_parameter(buf: &mut impl BufMut, parameter_type: u16, value: &[u8]) {
    let length = PARAMETER_HEADER_LEN + value.len();
    buf.put_u16(parameter_type);
    buf.put_u16(length.prechecked_cast());
    buf.put_slice(value);
    buf.put_bytes(0, padding_len(length));
}
