//! The association ties the codec and the data engine together. It is sans-IO: the embedding
//!  code feeds received datagrams into [Association::write_packet], pulls datagrams to send
//!  out of [Association::read_packet], and reports expired timers through
//!  [Association::handle_timeout]. All calls must come from the same logical thread.
//!
//! Chunks produced by the state machine and the data engine go into a FIFO control queue, and
//!  `read_packet` bundles them into packets. INIT, INIT ACK and COOKIE ECHO always travel
//!  alone in their packet.

mod state;

use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use bytes::{Buf, BufMut, Bytes};
use rand::{Rng, RngCore};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use crate::chunk::payload_data::PayloadDataChunk;
use crate::chunk::{Chunk, CHUNK_HEADER_LEN};
use crate::config::SctpConfig;
use crate::error::SctpError;
use crate::packet_header::{finalize_checksum, verify_checksum, PacketHeader};
use crate::stream::{Payload, Stream, StreamListener};
use crate::time_service::{TimeService, TimerId};
use crate::transmitter::Transmitter;

use state::{Event, State, Transition};

/// Notifications from an association to the layer above it. All callbacks are invoked
///  synchronously from within calls into the association.
#[cfg_attr(test, mockall::automock)]
pub trait AssociationListener: Send + Sync {
    fn on_established(&self);

    /// The association is closed, either because it was aborted or shut down, or because the
    ///  handshake was abandoned.
    fn on_closed(&self);

    /// The peer sent data on a stream that was not opened locally. The returned listener
    ///  receives this and all subsequent payload on the stream.
    fn on_stream_created(&self, stream_id: u16) -> Option<Arc<dyn StreamListener>>;

    /// There is data to be sent, i.e. [Association::read_packet] will return a packet. This is
    ///  called when the control queue goes from empty to non-empty.
    fn on_pending_data(&self) {}
}

/// Which side initiated the handshake. This decides the parity of locally opened stream ids.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// opens streams with even ids
    Initiator,
    /// opens streams with odd ids
    Responder,
}

/// Outgoing chunks waiting to be bundled into packets
struct ControlQueue {
    chunks: VecDeque<Chunk>,
    pending_data: bool,
    listener: Option<Arc<dyn AssociationListener>>,
}
impl Transmitter for ControlQueue {
    fn enqueue(&mut self, chunk: Chunk) {
        trace!("enqueueing {} chunk", chunk.name());
        self.chunks.push_back(chunk);

        if !self.pending_data {
            self.pending_data = true;
            if let Some(listener) = &self.listener {
                listener.on_pending_data();
            }
        }
    }
}
impl ControlQueue {
    fn clear(&mut self) {
        self.chunks.clear();
        self.pending_data = false;
    }
}

/// Everything an association has apart from its current state
struct Context {
    config: SctpConfig,
    time_service: Arc<dyn TimeService>,
    rng: Box<dyn RngCore + Send>,
    listener: Option<Arc<dyn AssociationListener>>,
    role: Option<Role>,
    local_verification_tag: u32,
    remote_verification_tag: u32,
    control_queue: ControlQueue,
    streams: FxHashMap<u16, Stream>,
}

impl Context {
    fn new_verification_tag(&mut self) -> u32 {
        self.rng.gen_range(1..=u32::MAX)
    }

    fn deliver(&mut self, payload: Payload) {
        let stream = match self.streams.entry(payload.stream_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                debug!("peer opened stream {}", payload.stream_id);
                let listener = self.listener.as_ref()
                    .and_then(|l| l.on_stream_created(payload.stream_id));
                e.insert(Stream::new(payload.stream_id, listener))
            }
        };
        stream.deliver(payload);
    }
}

pub struct Association {
    context: Context,
    state: State,
}

impl Debug for Association {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ASSOCIATION{{{}->{}:{}}}", self.context.config.local_port, self.context.config.remote_port, self.state.name())
    }
}

impl Association {
    pub fn new(config: SctpConfig, time_service: Arc<dyn TimeService>, rng: Box<dyn RngCore + Send>, listener: Option<Arc<dyn AssociationListener>>) -> anyhow::Result<Association> {
        config.validate()?;

        Ok(Association {
            context: Context {
                config,
                time_service,
                rng,
                listener: listener.clone(),
                role: None,
                local_verification_tag: 0,
                remote_verification_tag: 0,
                control_queue: ControlQueue {
                    chunks: VecDeque::new(),
                    pending_data: false,
                    listener,
                },
                streams: FxHashMap::default(),
            },
            state: State::closed(),
        })
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Established(_))
    }

    pub fn role(&self) -> Option<Role> {
        self.context.role
    }

    pub fn local_verification_tag(&self) -> u32 {
        self.context.local_verification_tag
    }

    pub fn remote_verification_tag(&self) -> u32 {
        self.context.remote_verification_tag
    }

    pub fn has_pending_data(&self) -> bool {
        self.context.control_queue.pending_data
    }

    /// the retransmission timeout currently used for DATA, if established
    pub fn rto(&self) -> Option<Duration> {
        match &self.state {
            State::Established(established) => Some(established.sender.rto()),
            _ => None,
        }
    }

    /// Starts the handshake as the initiating side
    pub fn associate(&mut self) -> Result<(), SctpError> {
        self.dispatch(Event::Associate)
    }

    /// Starts a graceful shutdown: the peer is asked to close, and the association is closed once
    ///  the peer acknowledges.
    pub fn shutdown(&mut self) -> Result<(), SctpError> {
        self.dispatch(Event::Shutdown)
    }

    /// Tears the association down immediately, notifying the peer with an ABORT if the peer is
    ///  known
    pub fn abort(&mut self) {
        if let Err(e) = self.dispatch(Event::Abort) {
            debug!("error aborting association: {}", e);
        }
    }

    pub fn handle_timeout(&mut self, timer_id: TimerId) -> Result<(), SctpError> {
        trace!("timer {:?} expired", timer_id);
        self.dispatch(Event::Timeout(timer_id))
    }

    /// Sends a single user message on a stream. Messages are not fragmented, so a message must
    ///  fit into a single packet.
    pub fn send(&mut self, stream_id: u16, payload_protocol_id: u32, data: Bytes) -> Result<(), SctpError> {
        let max = self.context.config.max_packet_size
            .saturating_sub(PacketHeader::SERIALIZED_LEN + CHUNK_HEADER_LEN + PayloadDataChunk::FIXED_LEN);
        if data.len() > max {
            return Err(SctpError::MessageTooLarge { size: data.len(), max });
        }
        self.dispatch(Event::Send { stream_id, payload_protocol_id, data })
    }

    /// Opens the next free stream with the local role's parity and returns its id
    pub fn open_stream(&mut self, listener: Option<Arc<dyn StreamListener>>) -> Result<u16, SctpError> {
        let first_id = match self.context.role {
            Some(Role::Initiator) => 0,
            Some(Role::Responder) => 1,
            None => return Err(SctpError::InvalidState { operation: "open stream", state: self.state.name() }),
        };

        let streams = &mut self.context.streams;
        let stream_id = (first_id..=u16::MAX).step_by(2)
            .find(|id| !streams.contains_key(id))
            .ok_or(SctpError::StreamsExhausted)?;

        debug!("opening stream {}", stream_id);
        streams.insert(stream_id, Stream::new(stream_id, listener));
        Ok(stream_id)
    }

    pub fn stream_mut(&mut self, stream_id: u16) -> Option<&mut Stream> {
        self.context.streams.get_mut(&stream_id)
    }

    /// Processes a datagram received from the peer. A datagram that fails validation is dropped
    ///  as a whole, leaving the association unchanged.
    pub fn write_packet(&mut self, packet: &[u8]) -> Result<(), SctpError> {
        let mut buf = packet;
        let header = PacketHeader::deser(&mut buf)
            .map_err(|e| SctpError::InvalidEncoding(e.to_string()))?;

        if header.source_port != self.context.config.remote_port || header.destination_port != self.context.config.local_port {
            debug!("dropping packet {:?}: port mismatch", header);
            return Err(SctpError::PortMismatch { source_port: header.source_port, destination_port: header.destination_port });
        }
        if self.context.config.verify_checksum && !verify_checksum(packet) {
            debug!("dropping packet {:?}: checksum mismatch", header);
            return Err(SctpError::ChecksumMismatch);
        }

        let mut chunks = Vec::new();
        while buf.remaining() >= CHUNK_HEADER_LEN {
            let chunk = Chunk::deser(&mut buf)
                .map_err(|e| {
                    debug!("dropping packet {:?}: {}", header, e);
                    SctpError::InvalidEncoding(e.to_string())
                })?;
            chunks.push(chunk);
        }

        self.check_verification_tag(&header, &chunks)?;
        trace!("received packet {:?} with {} chunks", header, chunks.len());

        for chunk in chunks {
            if let Chunk::Unknown(unknown) = &chunk {
                let action = unknown.action();
                if action.reports() {
                    // there is no ERROR chunk support, so 'reporting' is limited to logging
                    debug!("unrecognized chunk type {:#04x} should be reported to the peer", unknown.chunk_type);
                }
                if !action.continues_processing() {
                    debug!("unrecognized chunk type {:#04x} - skipping the rest of the packet", unknown.chunk_type);
                    break;
                }
                trace!("skipping unrecognized chunk type {:#04x}", unknown.chunk_type);
                continue;
            }

            if let Err(e) = self.dispatch(Event::Chunk(chunk)) {
                debug!("error processing chunk: {}", e);
            }
        }

        self.dispatch(Event::PacketProcessed)
    }

    /// Serializes the next packet into `buf`, returning its length or 0 if there is nothing to
    ///  send. Packets never exceed the configured maximum packet size.
    pub fn read_packet(&mut self, buf: &mut [u8]) -> usize {
        let queue = &mut self.context.control_queue;

        let Some(first) = queue.chunks.front() else {
            return 0;
        };
        // the peer's tag is not known yet when sending INIT
        let verification_tag = if matches!(first, Chunk::Init(_)) { 0 } else { self.context.remote_verification_tag };

        let limit = buf.len().min(self.context.config.max_packet_size);
        let max_chunks_len = self.context.config.max_packet_size.saturating_sub(PacketHeader::SERIALIZED_LEN);
        if limit < PacketHeader::SERIALIZED_LEN + CHUNK_HEADER_LEN {
            warn!("buffer of {} bytes is too small for a packet", buf.len());
            return 0;
        }
        let packet = &mut buf[..limit];

        let mut writer = &mut packet[..];
        PacketHeader::new(self.context.config.local_port, self.context.config.remote_port, verification_tag)
            .ser(&mut writer);

        let mut num_chunks = 0;
        while let Some(chunk) = queue.chunks.front() {
            if chunk.must_be_sent_alone() && num_chunks > 0 {
                break;
            }
            if chunk.serialized_len() > writer.remaining_mut() {
                if num_chunks == 0 && chunk.serialized_len() > max_chunks_len {
                    warn!("dropping {} chunk: {} bytes do not fit into a packet", chunk.name(), chunk.serialized_len());
                    queue.chunks.pop_front();
                    continue;
                }
                // the chunk stays queued for the next packet or a bigger buffer
                break;
            }

            let Some(chunk) = queue.chunks.pop_front() else {
                break;
            };
            chunk.ser(&mut writer);
            num_chunks += 1;

            if chunk.must_be_sent_alone() {
                break;
            }
        }
        let len = limit - writer.remaining_mut();

        if queue.chunks.is_empty() {
            queue.pending_data = false;
        }
        if num_chunks == 0 {
            return 0;
        }

        finalize_checksum(&mut packet[..len]);
        trace!("sending packet with {} chunks, {} bytes", num_chunks, len);
        len
    }

    fn check_verification_tag(&self, header: &PacketHeader, chunks: &[Chunk]) -> Result<(), SctpError> {
        let expected = if chunks.iter().any(|c| matches!(c, Chunk::Init(_))) {
            if chunks.len() != 1 {
                debug!("dropping packet {:?}: INIT is bundled with other chunks", header);
                return Err(SctpError::InvalidEncoding("INIT must be the only chunk in its packet".to_string()));
            }
            0
        }
        else {
            match chunks.first() {
                Some(Chunk::Abort(abort)) if abort.verification_tag_reflected => self.context.remote_verification_tag,
                Some(Chunk::ShutdownComplete(c)) if c.verification_tag_reflected => self.context.remote_verification_tag,
                _ => self.context.local_verification_tag,
            }
        };

        if header.verification_tag != expected {
            debug!("dropping packet {:?}: expected verification tag {:08x}", header, expected);
            return Err(SctpError::VerificationTagMismatch { expected, actual: header.verification_tag });
        }
        Ok(())
    }

    fn dispatch(&mut self, event: Event) -> Result<(), SctpError> {
        match self.state.handle(&mut self.context, event)? {
            Transition::Stay => Ok(()),
            Transition::To(next) => {
                self.transition(next);
                Ok(())
            }
            Transition::Fail(next, error) => {
                self.transition(next);
                Err(error)
            }
        }
    }

    fn transition(&mut self, mut next: State) {
        debug!("association {}->{}: {} -> {}", self.context.config.local_port, self.context.config.remote_port, self.state.name(), next.name());

        self.state.on_leave();
        let was_closed = matches!(self.state, State::Closed(_));
        next.on_enter(&mut self.context, was_closed);
        self.state = next;
    }
}
