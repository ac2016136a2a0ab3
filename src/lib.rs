//! SCTP (RFC 4960) as it is used for WebRTC data channels: the association handshake, the chunk
//!  codec and reliable data transfer with selective acknowledgement. SCTP packets are carried
//!  inside DTLS records, so this crate neither touches sockets nor deals with IP addresses,
//!  multi-homing or path MTU discovery.
//!
//! ## Packet
//!
//! All numbers are in network byte order (BE) unless noted:
//!
//! ```ascii
//!  0: source port (u16)
//!  2: destination port (u16)
//!  4: verification tag (u32): the receiver's tag, 0 in packets carrying INIT
//!  8: checksum (u32): CRC32C over the entire packet with this field set to 0, transmitted
//!      in little endian byte order
//! 12: chunks, each padded to a multiple of four bytes
//! ```
//!
//! ## Handshake
//!
//! ```ascii
//!   initiator                             responder
//!   CLOSED                                CLOSED
//!      associate()
//!   COOKIE-WAIT   --- INIT ----------->
//!                 <-- INIT ACK --------   (state cookie)
//!   COOKIE-ECHOED --- COOKIE ECHO ---->   ESTABLISHED
//!   ESTABLISHED   <-- COOKIE ACK ------
//! ```
//!
//! INIT and COOKIE ECHO are retransmitted until they are answered or the retransmission budget
//!  is exhausted. The state cookie carries no information: DTLS authenticates the peer, so
//!  there is nothing for the cookie to protect.
//!
//! ## Data transfer
//!
//! Every user message is sent as a single DATA chunk with BEGIN and END flags set, i.e. there
//!  is no fragmentation. The receiver acknowledges with SACK chunks listing gaps and duplicates,
//!  delaying acknowledgement where RFC 4960 permits it. The sender retransmits unacknowledged
//!  chunks after an RTO that is estimated from measured round trip times.

pub mod association;
pub mod chunk;
pub mod config;
pub mod data_receiver;
pub mod data_sender;
pub mod error;
pub mod packet_header;
pub mod rto;
pub mod safe_converter;
pub mod sequence_number;
pub mod stream;
pub mod time_service;
pub mod transmitter;

pub use association::{Association, AssociationListener, Role};
pub use config::{RtoConfig, SctpConfig};
pub use error::SctpError;
pub use stream::{Stream, StreamListener};
pub use time_service::{ManualTimeService, TimeService, Timer, TimerId, TokioTimeService};
