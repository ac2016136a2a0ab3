use thiserror::Error;

/// Reasons for the association to drop input or refuse a request. None of these is fatal for
///  the association itself: dropped input leaves the association's state untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SctpError {
    /// A datagram, header or chunk could not be decoded.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// The datagram is not addressed to this association's port pair.
    #[error("port mismatch: packet is {source_port} -> {destination_port}")]
    PortMismatch { source_port: u16, destination_port: u16 },

    /// The datagram carries a verification tag other than the one expected.
    #[error("verification tag mismatch: expected {expected:#010x}, got {actual:#010x}")]
    VerificationTagMismatch { expected: u32, actual: u32 },

    /// The CRC32C checksum does not match the datagram's content.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A chunk arrived that the current state has no use for.
    #[error("unexpected {chunk} chunk in state {state}")]
    UnexpectedChunk { chunk: &'static str, state: &'static str },

    /// INIT or COOKIE ECHO was retransmitted the maximum number of times without a response.
    #[error("handshake abandoned after {retransmissions} retransmissions")]
    HandshakeAbandoned { retransmissions: u32 },

    /// A SACK that is older than what was already acknowledged.
    #[error("stale acknowledgment: cumulative TSN ack {cumulative_tsn_ack} is behind the ack point")]
    StaleAcknowledgment { cumulative_tsn_ack: u32 },

    /// A user message does not fit into a single packet. Messages are not fragmented.
    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// All stream ids with the local side's parity are in use.
    #[error("no free stream id")]
    StreamsExhausted,

    /// An operation was requested that the current state does not support.
    #[error("{operation} is not possible in state {state}")]
    InvalidState { operation: &'static str, state: &'static str },
}
