use bytes::Bytes;
use tracing::{debug, trace};
use crate::chunk::control::{AbortChunk, ShutdownChunk, ShutdownCompleteChunk};
use crate::chunk::init::InitChunk;
use crate::chunk::parameter::InitParameters;
use crate::chunk::{Chunk, ChunkType};
use crate::data_receiver::DataReceiver;
use crate::data_sender::DataSender;
use crate::error::SctpError;
use crate::time_service::{Timer, TimerId};
use crate::transmitter::Transmitter;

use super::{Context, Role};

/// initial TSN for locally sent DATA
const INITIAL_TSN: u32 = 0;

/// Authentication of the peer is done by DTLS, so the state cookie is just a marker
const STATE_COOKIE: &[u8] = b"dtls";

/// number of outbound and inbound streams announced in INIT and INIT ACK
const NUM_STREAMS: u16 = 0xffff;

pub(super) enum Event {
    Associate,
    Chunk(Chunk),
    /// all chunks of a received packet were dispatched
    PacketProcessed,
    Timeout(TimerId),
    Send { stream_id: u16, payload_protocol_id: u32, data: Bytes },
    Shutdown,
    Abort,
}

pub(super) enum Transition {
    Stay,
    To(State),
    /// moves to the new state and reports the error to the caller
    Fail(State, SctpError),
}

/// What the local side knows about the peer's data transfer after the handshake
#[derive(Clone, Copy, Debug)]
pub(super) struct PeerParameters {
    initial_tsn: u32,
    advertised_receiver_window_credit: u32,
}
impl PeerParameters {
    fn from_init(init: &InitChunk) -> PeerParameters {
        PeerParameters {
            initial_tsn: init.initial_tsn,
            advertised_receiver_window_credit: init.advertised_receiver_window_credit,
        }
    }
}

pub(super) enum State {
    /// `peer` is set once an INIT was answered, waiting for the peer's COOKIE ECHO
    Closed(Option<PeerParameters>),
    CookieWait(HandshakeRetransmission),
    CookieEchoed(HandshakeRetransmission, PeerParameters),
    Established(Box<EstablishedState>),
    ShutdownSent,
    ShutdownAckSent,
}

/// A handshake chunk that is retransmitted until the peer answers
pub(super) struct HandshakeRetransmission {
    chunk: Chunk,
    timer_id: TimerId,
    retransmissions: u32,
    timer: Box<dyn Timer>,
}
impl HandshakeRetransmission {
    fn start(ctx: &mut Context, chunk: Chunk, timer_id: TimerId) -> HandshakeRetransmission {
        ctx.control_queue.enqueue(chunk.clone());
        let timer = ctx.time_service.create_timer(ctx.config.init_retransmit_timeout, None, timer_id);

        HandshakeRetransmission {
            chunk,
            timer_id,
            retransmissions: 0,
            timer,
        }
    }

    fn on_timeout(&mut self, ctx: &mut Context, timer_id: TimerId) -> Transition {
        if timer_id != self.timer_id {
            trace!("ignoring stale timer {:?}", timer_id);
            return Transition::Stay;
        }

        if self.retransmissions >= ctx.config.max_init_retransmits {
            debug!("no response to {} after {} retransmissions - giving up", self.chunk.name(), self.retransmissions);
            ctx.control_queue.clear();
            return Transition::Fail(State::closed(), SctpError::HandshakeAbandoned { retransmissions: self.retransmissions });
        }

        self.retransmissions += 1;
        debug!("retransmitting {} ({}/{})", self.chunk.name(), self.retransmissions, ctx.config.max_init_retransmits);
        ctx.control_queue.enqueue(self.chunk.clone());
        self.timer.again(ctx.config.init_retransmit_timeout);
        Transition::Stay
    }
}

pub(super) struct EstablishedState {
    pub(super) sender: DataSender,
    pub(super) receiver: DataReceiver,
}
impl EstablishedState {
    fn new(ctx: &Context, peer: PeerParameters) -> EstablishedState {
        EstablishedState {
            sender: DataSender::new(&ctx.config, ctx.time_service.clone(), INITIAL_TSN, peer.advertised_receiver_window_credit),
            receiver: DataReceiver::new(&ctx.config, ctx.time_service.clone(), peer.initial_tsn),
        }
    }

    fn deliver_received(&mut self, ctx: &mut Context) {
        for payload in self.receiver.take_delivered() {
            ctx.deliver(payload);
        }
    }
}

impl State {
    pub(super) fn closed() -> State {
        State::Closed(None)
    }

    pub(super) fn name(&self) -> &'static str {
        match self {
            State::Closed(_) => "CLOSED",
            State::CookieWait(_) => "COOKIE-WAIT",
            State::CookieEchoed(..) => "COOKIE-ECHOED",
            State::Established(_) => "ESTABLISHED",
            State::ShutdownSent => "SHUTDOWN-SENT",
            State::ShutdownAckSent => "SHUTDOWN-ACK-SENT",
        }
    }

    pub(super) fn on_leave(&mut self) {
        match self {
            State::CookieWait(handshake) | State::CookieEchoed(handshake, _) => handshake.timer.cancel(),
            State::Established(established) => {
                established.sender.stop();
                established.receiver.stop();
            }
            _ => {}
        }
    }

    pub(super) fn on_enter(&mut self, ctx: &mut Context, was_closed: bool) {
        match self {
            State::Closed(_) => {
                ctx.local_verification_tag = 0;
                if !was_closed {
                    if let Some(listener) = &ctx.listener {
                        listener.on_closed();
                    }
                }
            }
            State::Established(_) => {
                if let Some(listener) = &ctx.listener {
                    listener.on_established();
                }
            }
            _ => {}
        }
    }

    pub(super) fn handle(&mut self, ctx: &mut Context, event: Event) -> Result<Transition, SctpError> {
        // events with the same handling in every state
        match event {
            Event::Chunk(Chunk::Heartbeat(info)) => {
                if ctx.remote_verification_tag != 0 {
                    ctx.control_queue.enqueue(Chunk::HeartbeatAck(info));
                }
                else {
                    debug!("ignoring HEARTBEAT before the peer's verification tag is known");
                }
                return Ok(Transition::Stay);
            }
            Event::Chunk(Chunk::Padding(_)) => return Ok(Transition::Stay),
            Event::Chunk(Chunk::Abort(_)) => {
                if let State::Closed(peer) = self {
                    if peer.take().is_some() {
                        debug!("peer aborted before echoing the cookie");
                        ctx.control_queue.clear();
                    }
                    return Ok(Transition::Stay);
                }
                debug!("association aborted by peer");
                ctx.control_queue.clear();
                return Ok(Transition::To(State::closed()));
            }
            Event::Abort => {
                if let State::Closed(peer) = self {
                    // an INIT was answered: a later COOKIE ECHO must not establish the association
                    if peer.take().is_some() {
                        ctx.control_queue.clear();
                        ctx.local_verification_tag = 0;
                        if ctx.remote_verification_tag != 0 {
                            ctx.control_queue.enqueue(Chunk::Abort(AbortChunk { verification_tag_reflected: false, error_causes: Bytes::new() }));
                        }
                    }
                    return Ok(Transition::Stay);
                }
                ctx.control_queue.clear();
                if ctx.remote_verification_tag != 0 {
                    ctx.control_queue.enqueue(Chunk::Abort(AbortChunk { verification_tag_reflected: false, error_causes: Bytes::new() }));
                }
                return Ok(Transition::To(State::closed()));
            }
            event => self.handle_in_state(ctx, event),
        }
    }

    fn handle_in_state(&mut self, ctx: &mut Context, event: Event) -> Result<Transition, SctpError> {
        let state_name = self.name();

        match (self, event) {
            (State::Closed(_), Event::Associate) => {
                ctx.role = Some(Role::Initiator);
                ctx.local_verification_tag = ctx.new_verification_tag();
                ctx.remote_verification_tag = 0;

                let init = Chunk::Init(InitChunk {
                    initiate_tag: ctx.local_verification_tag,
                    advertised_receiver_window_credit: ctx.config.advertised_receiver_window_credit,
                    number_of_outbound_streams: NUM_STREAMS,
                    number_of_inbound_streams: NUM_STREAMS,
                    initial_tsn: INITIAL_TSN,
                    parameters: local_init_parameters(),
                });
                let handshake = HandshakeRetransmission::start(ctx, init, TimerId::InitRetransmit);
                Ok(Transition::To(State::CookieWait(handshake)))
            }
            (State::Closed(peer), Event::Chunk(Chunk::Init(init))) => {
                ctx.role = Some(Role::Responder);
                ctx.remote_verification_tag = init.initiate_tag;
                ctx.local_verification_tag = ctx.new_verification_tag();
                *peer = Some(PeerParameters::from_init(&init));
                debug!("received INIT from peer with tag {:08x}", init.initiate_tag);

                let init_ack = Chunk::InitAck(InitChunk {
                    initiate_tag: ctx.local_verification_tag,
                    advertised_receiver_window_credit: ctx.config.advertised_receiver_window_credit,
                    number_of_outbound_streams: NUM_STREAMS,
                    number_of_inbound_streams: NUM_STREAMS,
                    initial_tsn: INITIAL_TSN,
                    parameters: InitParameters {
                        state_cookie: Some(Bytes::from_static(STATE_COOKIE)),
                        unrecognized_parameters: init.parameters.unknown_parameters.iter()
                            .map(|p| p.to_tlv())
                            .collect(),
                        ..local_init_parameters()
                    },
                });
                ctx.control_queue.enqueue(init_ack);
                Ok(Transition::Stay)
            }
            (State::Closed(peer), Event::Chunk(Chunk::CookieEcho(_))) => {
                // the cookie carries no information, so there is nothing to check
                match peer {
                    Some(peer) => {
                        ctx.control_queue.enqueue(Chunk::CookieAck);
                        let established = EstablishedState::new(ctx, *peer);
                        Ok(Transition::To(State::Established(Box::new(established))))
                    }
                    None => {
                        debug!("ignoring COOKIE ECHO without a preceding INIT");
                        Ok(Transition::Stay)
                    }
                }
            }

            (State::CookieWait(_), Event::Chunk(Chunk::InitAck(init_ack))) => {
                let Some(cookie) = init_ack.parameters.state_cookie.clone() else {
                    debug!("ignoring INIT ACK without state cookie");
                    return Ok(Transition::Stay);
                };
                if !init_ack.parameters.unrecognized_parameters.is_empty() {
                    debug!("peer did not recognize {} INIT parameters", init_ack.parameters.unrecognized_parameters.len());
                }

                ctx.remote_verification_tag = init_ack.initiate_tag;
                let peer = PeerParameters::from_init(&init_ack);

                let handshake = HandshakeRetransmission::start(ctx, Chunk::CookieEcho(cookie), TimerId::CookieRetransmit);
                Ok(Transition::To(State::CookieEchoed(handshake, peer)))
            }
            (State::CookieWait(handshake), Event::Timeout(timer_id)) => Ok(handshake.on_timeout(ctx, timer_id)),

            (State::CookieEchoed(_, peer), Event::Chunk(Chunk::CookieAck)) => {
                let established = EstablishedState::new(ctx, *peer);
                Ok(Transition::To(State::Established(Box::new(established))))
            }
            (State::CookieEchoed(handshake, _), Event::Timeout(timer_id)) => Ok(handshake.on_timeout(ctx, timer_id)),

            (State::Established(established), Event::Chunk(Chunk::PayloadData(chunk))) => {
                established.receiver.handle_payload_chunk(chunk);
                Ok(Transition::Stay)
            }
            (State::Established(established), Event::Chunk(Chunk::Sack(sack))) => {
                if let Err(e) = established.sender.handle_sack_chunk(&sack, &mut ctx.control_queue) {
                    debug!("dropping SACK: {}", e);
                }
                Ok(Transition::Stay)
            }
            (State::Established(established), Event::PacketProcessed) => {
                established.receiver.handle_packet_processed(&mut ctx.control_queue);
                established.deliver_received(ctx);
                Ok(Transition::Stay)
            }
            (State::Established(established), Event::Timeout(TimerId::DelayedSack)) => {
                established.receiver.handle_timeout(&mut ctx.control_queue);
                established.deliver_received(ctx);
                Ok(Transition::Stay)
            }
            (State::Established(established), Event::Timeout(TimerId::DataRetransmit)) => {
                established.sender.handle_timeout(&mut ctx.control_queue);
                Ok(Transition::Stay)
            }
            (State::Established(established), Event::Send { stream_id, payload_protocol_id, data }) => {
                established.sender.send(stream_id, payload_protocol_id, data, &mut ctx.control_queue);
                Ok(Transition::Stay)
            }
            (State::Established(_), Event::Chunk(Chunk::CookieEcho(_))) => {
                // the peer did not get our COOKIE ACK
                if ctx.role == Some(Role::Responder) {
                    ctx.control_queue.enqueue(Chunk::CookieAck);
                }
                Ok(Transition::Stay)
            }
            (State::Established(established), Event::Shutdown) => {
                ctx.control_queue.enqueue(Chunk::Shutdown(ShutdownChunk { cumulative_tsn_ack: established.receiver.cumulative_tsn() }));
                Ok(Transition::To(State::ShutdownSent))
            }
            (State::Established(_), Event::Chunk(Chunk::Shutdown(_))) => {
                ctx.control_queue.enqueue(Chunk::ShutdownAck);
                Ok(Transition::To(State::ShutdownAckSent))
            }

            (State::ShutdownSent, Event::Chunk(Chunk::ShutdownAck)) => {
                ctx.control_queue.enqueue(Chunk::ShutdownComplete(ShutdownCompleteChunk { verification_tag_reflected: false }));
                Ok(Transition::To(State::closed()))
            }
            (State::ShutdownSent, Event::Chunk(Chunk::Shutdown(_))) => {
                ctx.control_queue.enqueue(Chunk::ShutdownAck);
                Ok(Transition::To(State::ShutdownAckSent))
            }
            (State::ShutdownAckSent, Event::Chunk(Chunk::ShutdownComplete(_))) => Ok(Transition::To(State::closed())),

            (_, Event::Associate) => Err(SctpError::InvalidState { operation: "associate", state: state_name }),
            (_, Event::Send { .. }) => Err(SctpError::InvalidState { operation: "send", state: state_name }),
            (_, Event::Shutdown) => Err(SctpError::InvalidState { operation: "shutdown", state: state_name }),
            (_, Event::Chunk(chunk)) => {
                debug!("ignoring chunk: {}", SctpError::UnexpectedChunk { chunk: chunk.name(), state: state_name });
                Ok(Transition::Stay)
            }
            (_, Event::Timeout(timer_id)) => {
                trace!("ignoring stale timer {:?} in state {}", timer_id, state_name);
                Ok(Transition::Stay)
            }
            (_, Event::PacketProcessed) | (_, Event::Abort) => Ok(Transition::Stay),
        }
    }
}

/// INIT parameters sent by this side. WebRTC forbids address parameters, and the dynamic
///  address reconfiguration extension announces support for stream reconfiguration.
fn local_init_parameters() -> InitParameters {
    InitParameters {
        supported_extensions: vec![ChunkType::ReConfig.into()],
        ..InitParameters::default()
    }
}
