//! Chunk codec. Every chunk starts with a four byte header:
//!
//! ```ascii
//! 0: chunk type (u8)
//! 1: chunk flags (u8)
//! 2: chunk length (u16): length of header and value, excluding padding
//! 4: chunk value
//! *: zero padding to a multiple of four bytes
//! ```
//!
//! The two most significant bits of the chunk type tell a receiver what to do with a chunk type
//!  it does not recognize, see [UnrecognizedChunkAction].

pub mod control;
pub mod init;
pub mod parameter;
pub mod payload_data;
pub mod sack;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;
use crate::safe_converter::{PrecheckedCast, SafeCast};

use control::{AbortChunk, ShutdownChunk, ShutdownCompleteChunk};
use init::InitChunk;
use payload_data::PayloadDataChunk;
use sack::SackChunk;

pub const CHUNK_HEADER_LEN: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ChunkType {
    PayloadData = 0,
    Init = 1,
    InitAck = 2,
    Sack = 3,
    Heartbeat = 4,
    HeartbeatAck = 5,
    Abort = 6,
    Shutdown = 7,
    ShutdownAck = 8,
    Error = 9,
    CookieEcho = 10,
    CookieAck = 11,
    ShutdownComplete = 14,
    /// RFC 6525 stream reconfiguration
    ReConfig = 130,
    /// RFC 4820
    Padding = 0x84,
    /// RFC 3758
    ForwardTsn = 0xc0,
}

/// What a receiver does with a chunk of a type it does not recognize, encoded in the two most
///  significant bits of the chunk type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnrecognizedChunkAction {
    /// 00: stop processing the packet and discard it
    Stop,
    /// 01: stop processing the packet, discard it and report the chunk in an ERROR chunk
    StopAndReport,
    /// 10: skip the chunk and continue processing
    Skip,
    /// 11: skip the chunk, continue processing and report the chunk in an ERROR chunk
    SkipAndReport,
}
impl UnrecognizedChunkAction {
    pub fn for_chunk_type(chunk_type: u8) -> UnrecognizedChunkAction {
        match chunk_type >> 6 {
            0b00 => UnrecognizedChunkAction::Stop,
            0b01 => UnrecognizedChunkAction::StopAndReport,
            0b10 => UnrecognizedChunkAction::Skip,
            _ => UnrecognizedChunkAction::SkipAndReport,
        }
    }

    pub fn continues_processing(&self) -> bool {
        matches!(self, UnrecognizedChunkAction::Skip | UnrecognizedChunkAction::SkipAndReport)
    }

    pub fn reports(&self) -> bool {
        matches!(self, UnrecognizedChunkAction::StopAndReport | UnrecognizedChunkAction::SkipAndReport)
    }
}

/// A chunk of a type this implementation does not decode. It is kept raw so that callers can
///  echo or drop it according to its [UnrecognizedChunkAction].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownChunk {
    pub chunk_type: u8,
    pub flags: u8,
    pub value: Bytes,
}
impl UnknownChunk {
    pub fn action(&self) -> UnrecognizedChunkAction {
        UnrecognizedChunkAction::for_chunk_type(self.chunk_type)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Chunk {
    PayloadData(PayloadDataChunk),
    Init(InitChunk),
    InitAck(InitChunk),
    Sack(SackChunk),
    /// the raw heartbeat info parameter
    Heartbeat(Bytes),
    /// echoes the heartbeat info parameter of the corresponding HEARTBEAT
    HeartbeatAck(Bytes),
    Abort(AbortChunk),
    Shutdown(ShutdownChunk),
    ShutdownAck,
    ShutdownComplete(ShutdownCompleteChunk),
    /// the state cookie as received in INIT ACK
    CookieEcho(Bytes),
    CookieAck,
    Padding(Bytes),
    Unknown(UnknownChunk),
}

impl Chunk {
    pub fn chunk_type(&self) -> u8 {
        match self {
            Chunk::PayloadData(_) => ChunkType::PayloadData.into(),
            Chunk::Init(_) => ChunkType::Init.into(),
            Chunk::InitAck(_) => ChunkType::InitAck.into(),
            Chunk::Sack(_) => ChunkType::Sack.into(),
            Chunk::Heartbeat(_) => ChunkType::Heartbeat.into(),
            Chunk::HeartbeatAck(_) => ChunkType::HeartbeatAck.into(),
            Chunk::Abort(_) => ChunkType::Abort.into(),
            Chunk::Shutdown(_) => ChunkType::Shutdown.into(),
            Chunk::ShutdownAck => ChunkType::ShutdownAck.into(),
            Chunk::ShutdownComplete(_) => ChunkType::ShutdownComplete.into(),
            Chunk::CookieEcho(_) => ChunkType::CookieEcho.into(),
            Chunk::CookieAck => ChunkType::CookieAck.into(),
            Chunk::Padding(_) => ChunkType::Padding.into(),
            Chunk::Unknown(c) => c.chunk_type,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Chunk::PayloadData(_) => "DATA",
            Chunk::Init(_) => "INIT",
            Chunk::InitAck(_) => "INIT ACK",
            Chunk::Sack(_) => "SACK",
            Chunk::Heartbeat(_) => "HEARTBEAT",
            Chunk::HeartbeatAck(_) => "HEARTBEAT ACK",
            Chunk::Abort(_) => "ABORT",
            Chunk::Shutdown(_) => "SHUTDOWN",
            Chunk::ShutdownAck => "SHUTDOWN ACK",
            Chunk::ShutdownComplete(_) => "SHUTDOWN COMPLETE",
            Chunk::CookieEcho(_) => "COOKIE ECHO",
            Chunk::CookieAck => "COOKIE ACK",
            Chunk::Padding(_) => "PAD",
            Chunk::Unknown(_) => "UNKNOWN",
        }
    }

    /// INIT, INIT ACK and COOKIE ECHO must not be bundled with other chunks
    pub fn must_be_sent_alone(&self) -> bool {
        matches!(self, Chunk::Init(_) | Chunk::InitAck(_) | Chunk::CookieEcho(_))
    }

    fn flags(&self) -> u8 {
        match self {
            Chunk::PayloadData(c) => c.flags.bits(),
            Chunk::Abort(c) => c.flags(),
            Chunk::ShutdownComplete(c) => c.flags(),
            Chunk::Unknown(c) => c.flags,
            _ => 0,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            Chunk::PayloadData(c) => c.value_len(),
            Chunk::Init(c) | Chunk::InitAck(c) => c.value_len(),
            Chunk::Sack(c) => c.value_len(),
            Chunk::Heartbeat(info) | Chunk::HeartbeatAck(info) => info.len(),
            Chunk::Abort(c) => c.error_causes.len(),
            Chunk::Shutdown(_) => ShutdownChunk::VALUE_LEN,
            Chunk::ShutdownAck | Chunk::CookieAck | Chunk::ShutdownComplete(_) => 0,
            Chunk::CookieEcho(cookie) => cookie.len(),
            Chunk::Padding(padding) => padding.len(),
            Chunk::Unknown(c) => c.value.len(),
        }
    }

    /// The number of bytes this chunk occupies in a packet, including padding
    pub fn serialized_len(&self) -> usize {
        padded_len(CHUNK_HEADER_LEN + self.value_len())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let length = CHUNK_HEADER_LEN + self.value_len();

        buf.put_u8(self.chunk_type());
        buf.put_u8(self.flags());
        buf.put_u16(length.prechecked_cast());

        match self {
            Chunk::PayloadData(c) => c.ser_value(buf),
            Chunk::Init(c) | Chunk::InitAck(c) => c.ser_value(buf),
            Chunk::Sack(c) => c.ser_value(buf),
            Chunk::Heartbeat(info) | Chunk::HeartbeatAck(info) => buf.put_slice(info),
            Chunk::Abort(c) => buf.put_slice(&c.error_causes),
            Chunk::Shutdown(c) => c.ser_value(buf),
            Chunk::ShutdownAck | Chunk::CookieAck | Chunk::ShutdownComplete(_) => {}
            Chunk::CookieEcho(cookie) => buf.put_slice(cookie),
            Chunk::Padding(padding) => buf.put_slice(padding),
            Chunk::Unknown(c) => buf.put_slice(&c.value),
        }

        buf.put_bytes(0, padding_len(length));
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Chunk> {
        let chunk_type = buf.try_get_u8()?;
        let flags = buf.try_get_u8()?;
        let length: usize = buf.try_get_u16()?.safe_cast();

        if length < CHUNK_HEADER_LEN {
            bail!("chunk length {} is less than the chunk header", length);
        }
        let value_len = length - CHUNK_HEADER_LEN;
        if value_len > buf.remaining() {
            bail!("chunk length {} exceeds the remaining {} bytes", length, buf.remaining() + CHUNK_HEADER_LEN);
        }
        let mut value = buf.copy_to_bytes(value_len);

        let chunk = match ChunkType::try_from(chunk_type) {
            Ok(ChunkType::PayloadData) => Chunk::PayloadData(PayloadDataChunk::deser_value(flags, &mut value)?),
            Ok(ChunkType::Init) => Chunk::Init(InitChunk::deser_value(&mut value)?),
            Ok(ChunkType::InitAck) => Chunk::InitAck(InitChunk::deser_value(&mut value)?),
            Ok(ChunkType::Sack) => Chunk::Sack(SackChunk::deser_value(&mut value)?),
            Ok(ChunkType::Heartbeat) => Chunk::Heartbeat(value),
            Ok(ChunkType::HeartbeatAck) => Chunk::HeartbeatAck(value),
            Ok(ChunkType::Abort) => Chunk::Abort(AbortChunk::new(flags, value)),
            Ok(ChunkType::Shutdown) => Chunk::Shutdown(ShutdownChunk::deser_value(&mut value)?),
            Ok(ChunkType::ShutdownAck) => Chunk::ShutdownAck,
            Ok(ChunkType::ShutdownComplete) => Chunk::ShutdownComplete(ShutdownCompleteChunk::from_flags(flags)),
            Ok(ChunkType::CookieEcho) => Chunk::CookieEcho(value),
            Ok(ChunkType::CookieAck) => Chunk::CookieAck,
            Ok(ChunkType::Padding) => Chunk::Padding(value),
            _ => Chunk::Unknown(UnknownChunk { chunk_type, flags, value }),
        };

        // the last chunk in a packet may come without padding
        let padding = padding_len(length).min(buf.remaining());
        buf.advance(padding);

        trace!("decoded {} chunk with length {}", chunk.name(), length);
        Ok(chunk)
    }
}

pub(crate) fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

pub(crate) fn padding_len(len: usize) -> usize {
    padded_len(len) - len
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::chunk::init::InitChunk;
    use crate::chunk::parameter::{InitParameters, UnknownParameter};
    use crate::chunk::payload_data::PayloadFlags;
    use crate::chunk::sack::GapAckBlock;

    fn init_chunk() -> InitChunk {
        InitChunk {
            initiate_tag: 0x12345678,
            advertised_receiver_window_credit: 0xffff_ffff,
            number_of_outbound_streams: 0xffff,
            number_of_inbound_streams: 0xffff,
            initial_tsn: 0,
            parameters: InitParameters {
                supported_extensions: vec![ChunkType::ReConfig.into()],
                forward_tsn_supported: true,
                ..InitParameters::default()
            },
        }
    }

    fn init_ack_chunk() -> InitChunk {
        InitChunk {
            initiate_tag: 0x9abcdef0,
            advertised_receiver_window_credit: 131072,
            number_of_outbound_streams: 1024,
            number_of_inbound_streams: 2048,
            initial_tsn: 0xfffffff0,
            parameters: InitParameters {
                state_cookie: Some(Bytes::from_static(b"dtls")),
                unrecognized_parameters: vec![Bytes::from_static(&[0x80, 0x02, 0x00, 0x05, 0x01, 0x00, 0x00, 0x00])],
                cookie_preservative: Some(500),
                host_name: Some(Bytes::from_static(b"example.com\0")),
                supported_address_types: vec![5, 6, 11],
                supported_extensions: vec![ChunkType::ReConfig.into(), ChunkType::ForwardTsn.into()],
                unknown_parameters: vec![UnknownParameter { parameter_type: 0x8002, value: Bytes::from_static(&[1, 2, 3, 4, 5]) }],
                ..InitParameters::default()
            },
        }
    }

    #[rstest]
    #[case::init(Chunk::Init(init_chunk()))]
    #[case::init_ack(Chunk::InitAck(init_ack_chunk()))]
    #[case::init_ack_with_addresses(Chunk::InitAck(InitChunk {
        parameters: InitParameters {
            ipv4_addresses: vec![[192, 168, 0, 1].into()],
            ipv6_addresses: vec![[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16].into()],
            ..InitParameters::default()
        },
        ..init_chunk()
    }))]
    #[case::cookie_echo(Chunk::CookieEcho(Bytes::from_static(b"dtls")))]
    #[case::cookie_echo_unpadded(Chunk::CookieEcho(Bytes::from_static(b"cookie")))]
    #[case::cookie_ack(Chunk::CookieAck)]
    #[case::heartbeat(Chunk::Heartbeat(Bytes::from_static(&[0, 1, 0, 8, 1, 2, 3, 4])))]
    #[case::heartbeat_ack(Chunk::HeartbeatAck(Bytes::from_static(&[0, 1, 0, 7, 1, 2, 3])))]
    #[case::padding(Chunk::Padding(Bytes::from_static(&[0; 13])))]
    #[case::unknown(Chunk::Unknown(UnknownChunk { chunk_type: 255, flags: 0x5a, value: Bytes::from_static(&[1, 2, 3, 4, 5]) }))]
    #[case::unknown_empty(Chunk::Unknown(UnknownChunk { chunk_type: 0x40, flags: 0, value: Bytes::new() }))]
    #[case::payload_data(Chunk::PayloadData(PayloadDataChunk {
        flags: PayloadFlags::BEGIN | PayloadFlags::END,
        tsn: 17,
        stream_id: 2,
        stream_sequence_number: 3,
        payload_protocol_id: 51,
        user_data: Bytes::from_static(b"hello"),
    }))]
    #[case::sack(Chunk::Sack(SackChunk {
        cumulative_tsn_ack: 101,
        advertised_receiver_window_credit: 5000,
        gap_ack_blocks: vec![GapAckBlock { start: 2, end: 2 }, GapAckBlock { start: 4, end: 7 }],
        duplicate_tsns: vec![100, 101],
    }))]
    #[case::abort(Chunk::Abort(AbortChunk { verification_tag_reflected: true, error_causes: Bytes::from_static(&[0, 12, 0, 4]) }))]
    #[case::shutdown(Chunk::Shutdown(ShutdownChunk { cumulative_tsn_ack: 0xffff_ffff }))]
    #[case::shutdown_ack(Chunk::ShutdownAck)]
    #[case::shutdown_complete(Chunk::ShutdownComplete(ShutdownCompleteChunk { verification_tag_reflected: true }))]
    fn test_ser_deser(#[case] chunk: Chunk) {
        let mut buf = Vec::new();
        chunk.ser(&mut buf);
        assert_eq!(buf.len(), chunk.serialized_len());
        assert_eq!(buf.len() % 4, 0);

        let mut b: &[u8] = &buf;
        let deser = Chunk::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, chunk);
    }

    #[test]
    fn test_deser_real_init_packet() {
        let packet: Vec<u8> = vec![
            0x13, 0x88, 0x13, 0x88, 0x00, 0x00, 0x00, 0x00, 0xdf, 0x9d, 0x5e, 0x22,
            0x01, 0x00, 0x00, 0x56, 0xff, 0x55, 0x39, 0x12, 0x00, 0x02, 0x00, 0x00,
            0x04, 0x00, 0x08, 0x00, 0xce, 0x91, 0x30, 0x32, 0xc0, 0x00, 0x00, 0x04,
            0x80, 0x08, 0x00, 0x09, 0xc0, 0x0f, 0xc1, 0x80, 0x82, 0x00, 0x00, 0x00,
            0x80, 0x02, 0x00, 0x24, 0xf1, 0x77, 0x00, 0x00, 0x51, 0x0a, 0x00, 0x00,
            0xba, 0x21, 0x00, 0x00, 0xd2, 0x39, 0x00, 0x00, 0xc2, 0x38, 0x00, 0x00,
            0xbb, 0x7f, 0x00, 0x00, 0x25, 0x53, 0x00, 0x00, 0xd8, 0x44, 0x00, 0x00,
            0x80, 0x04, 0x00, 0x06, 0x00, 0x01, 0x00, 0x00, 0x80, 0x03, 0x00, 0x06,
            0x00, 0x00, 0x00, 0x00,
        ];

        let mut b: &[u8] = &packet[crate::packet_header::PacketHeader::SERIALIZED_LEN..];
        let chunk = Chunk::deser(&mut b).unwrap();
        assert!(b.is_empty());

        match chunk {
            Chunk::Init(init) => {
                assert_eq!(init.initiate_tag, 0xff553912);
                assert_eq!(init.advertised_receiver_window_credit, 0x20000);
                assert_eq!(init.number_of_outbound_streams, 1024);
                assert_eq!(init.number_of_inbound_streams, 2048);
                assert_eq!(init.initial_tsn, 0xce913032);
                assert!(init.parameters.forward_tsn_supported);
                assert_eq!(init.parameters.supported_extensions, vec![0xc0, 0x0f, 0xc1, 0x80, 0x82]);
                let unknown_types = init.parameters.unknown_parameters.iter()
                    .map(|p| p.parameter_type)
                    .collect::<Vec<_>>();
                assert_eq!(unknown_types, vec![0x8002, 0x8004, 0x8003]);
                assert_eq!(init.parameters.unknown_parameters[0].value.len(), 32);
            }
            other => panic!("expected INIT, got {:?}", other),
        }
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_header(vec![1, 0, 0])]
    #[case::length_below_header(vec![11, 0, 0, 3])]
    #[case::length_exceeds_buffer(vec![10, 0, 0, 9, 1, 2, 3, 4])]
    #[case::truncated_init(vec![1, 0, 0, 8, 1, 2, 3, 4])]
    #[case::truncated_sack(vec![3, 0, 0, 16, 0, 0, 0, 1, 0, 0, 0, 2, 0, 1, 0, 0])]
    #[case::init_parameter_length_below_header(vec![1, 0, 0, 24, 0,0,0,1, 0,0,0,0, 0,1, 0,1, 0,0,0,0, 0x80,0x08,0,2])]
    #[case::init_parameter_truncated(vec![1, 0, 0, 24, 0,0,0,1, 0,0,0,0, 0,1, 0,1, 0,0,0,0, 0,7,0,9])]
    fn test_deser_invalid(#[case] buf: Vec<u8>) {
        let mut b: &[u8] = &buf;
        assert!(Chunk::deser(&mut b).is_err());
    }

    #[test]
    fn test_deser_consumes_padding_between_chunks() {
        let mut buf = Vec::new();
        Chunk::CookieEcho(Bytes::from_static(b"abc")).ser(&mut buf);
        Chunk::CookieAck.ser(&mut buf);

        let mut b: &[u8] = &buf;
        assert_eq!(Chunk::deser(&mut b).unwrap(), Chunk::CookieEcho(Bytes::from_static(b"abc")));
        assert_eq!(Chunk::deser(&mut b).unwrap(), Chunk::CookieAck);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::stop(0x3f, UnrecognizedChunkAction::Stop, false, false)]
    #[case::stop_and_report(0x41, UnrecognizedChunkAction::StopAndReport, false, true)]
    #[case::skip(0x82, UnrecognizedChunkAction::Skip, true, false)]
    #[case::skip_and_report(0xff, UnrecognizedChunkAction::SkipAndReport, true, true)]
    fn test_unrecognized_chunk_action(#[case] chunk_type: u8, #[case] expected: UnrecognizedChunkAction, #[case] continues: bool, #[case] reports: bool) {
        let action = UnknownChunk { chunk_type, flags: 0, value: Bytes::new() }.action();
        assert_eq!(action, expected);
        assert_eq!(action.continues_processing(), continues);
        assert_eq!(action.reports(), reports);
    }

    #[rstest]
    #[case::init(Chunk::Init(init_chunk()), true)]
    #[case::init_ack(Chunk::InitAck(init_ack_chunk()), true)]
    #[case::cookie_echo(Chunk::CookieEcho(Bytes::new()), true)]
    #[case::cookie_ack(Chunk::CookieAck, false)]
    #[case::sack(Chunk::Sack(SackChunk { cumulative_tsn_ack: 1, advertised_receiver_window_credit: 1, gap_ack_blocks: vec![], duplicate_tsns: vec![] }), false)]
    fn test_must_be_sent_alone(#[case] chunk: Chunk, #[case] expected: bool) {
        assert_eq!(chunk.must_be_sent_alone(), expected);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 4)]
    #[case(4, 4)]
    #[case(5, 8)]
    #[case(7, 8)]
    fn test_padded_len(#[case] len: usize, #[case] expected: usize) {
        assert_eq!(padded_len(len), expected);
    }
}
