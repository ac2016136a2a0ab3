use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use crate::chunk::payload_data::{PayloadDataChunk, PayloadFlags};
use crate::chunk::sack::SackChunk;
use crate::chunk::Chunk;
use crate::config::SctpConfig;
use crate::error::SctpError;
use crate::rto::RtoCalculator;
use crate::safe_converter::SafeCast;
use crate::sequence_number::SequenceNumberWrapper;
use crate::time_service::{TimeService, Timer, TimerId};
use crate::transmitter::Transmitter;

struct BufferedChunk {
    chunk: PayloadDataChunk,
    /// time of the first transmission, `None` if the chunk was not sent yet
    first_sent: Option<Duration>,
    retransmitted: bool,
}

/// Sending side of an established association: assigns TSNs and stream sequence numbers to
///  outgoing user messages, keeps them for retransmission until they are acknowledged, and
///  runs the retransmission timer (T3-rtx) based on an adaptive RTO.
///
/// A new chunk is transmitted right away only if there is no backlog, i.e. if its TSN directly
///  follows the cumulative ack point. Chunks sent while others are outstanding are buffered and
///  go out when the cumulative ack point advances or the retransmission timer expires.
pub struct DataSender {
    time_service: Arc<dyn TimeService>,
    payload_pool_size: usize,

    tsn_wrapper: SequenceNumberWrapper<u32>,
    cumulative_tsn_ack_point: u64,
    next_tsn: u64,
    unacknowledged: BTreeSet<u64>,
    /// bounded: the oldest entries are evicted, acknowledged or not
    payload_pool: BTreeMap<u64, BufferedChunk>,
    stream_sequence_numbers: FxHashMap<u16, u16>,
    peer_receiver_window_credit: u32,

    rto: RtoCalculator,
    retransmission_timer: Option<Box<dyn Timer>>,
}

impl DataSender {
    pub fn new(config: &SctpConfig, time_service: Arc<dyn TimeService>, local_initial_tsn: u32, peer_receiver_window_credit: u32) -> DataSender {
        let tsn_wrapper = SequenceNumberWrapper::starting_at(local_initial_tsn);
        let initial_tsn = tsn_wrapper.wrap(local_initial_tsn);

        DataSender {
            time_service,
            payload_pool_size: config.payload_pool_size,
            tsn_wrapper,
            cumulative_tsn_ack_point: initial_tsn - 1,
            next_tsn: initial_tsn,
            unacknowledged: BTreeSet::new(),
            payload_pool: BTreeMap::new(),
            stream_sequence_numbers: FxHashMap::default(),
            peer_receiver_window_credit,
            rto: RtoCalculator::new(config.rto.clone()),
            retransmission_timer: None,
        }
    }

    pub fn cumulative_tsn_ack_point(&self) -> u32 {
        self.tsn_wrapper.unwrap(self.cumulative_tsn_ack_point)
    }

    /// as advertised in the peer's most recent INIT / INIT ACK or SACK
    pub fn peer_receiver_window_credit(&self) -> u32 {
        self.peer_receiver_window_credit
    }

    pub fn num_unacknowledged(&self) -> usize {
        self.unacknowledged.len()
    }

    pub fn rto(&self) -> Duration {
        self.rto.rto()
    }

    pub fn send(&mut self, stream_id: u16, payload_protocol_id: u32, data: Bytes, transmitter: &mut dyn Transmitter) {
        let tsn = self.next_tsn;
        self.next_tsn += 1;

        let stream_sequence_number = self.stream_sequence_numbers.entry(stream_id).or_insert(0);
        let chunk = PayloadDataChunk {
            flags: PayloadFlags::BEGIN | PayloadFlags::END,
            tsn: self.tsn_wrapper.unwrap(tsn),
            stream_id,
            stream_sequence_number: *stream_sequence_number,
            payload_protocol_id,
            user_data: data,
        };
        *stream_sequence_number = stream_sequence_number.wrapping_add(1);

        trace!("assigned TSN {} to message with {} bytes on stream {}", chunk.tsn, chunk.user_data.len(), stream_id);

        self.payload_pool.insert(tsn, BufferedChunk { chunk, first_sent: None, retransmitted: false });
        while self.payload_pool.len() > self.payload_pool_size {
            if let Some((evicted, _)) = self.payload_pool.pop_first() {
                if self.unacknowledged.contains(&evicted) {
                    warn!("payload pool is full: evicting unacknowledged TSN {} - it can not be retransmitted", self.tsn_wrapper.unwrap(evicted));
                }
            }
        }
        self.unacknowledged.insert(tsn);

        if tsn == self.cumulative_tsn_ack_point + 1 {
            self.transmit(tsn, transmitter);
            self.start_retransmission_timer(false);
        }
    }

    pub fn handle_sack_chunk(&mut self, sack: &SackChunk, transmitter: &mut dyn Transmitter) -> Result<(), SctpError> {
        let cumulative_tsn_ack = self.tsn_wrapper.wrap(sack.cumulative_tsn_ack);

        if cumulative_tsn_ack < self.cumulative_tsn_ack_point {
            return Err(SctpError::StaleAcknowledgment { cumulative_tsn_ack: sack.cumulative_tsn_ack });
        }
        if cumulative_tsn_ack >= self.next_tsn {
            warn!("SACK acknowledges TSN {} that was never sent - ignoring", sack.cumulative_tsn_ack);
            return Ok(());
        }

        self.peer_receiver_window_credit = sack.advertised_receiver_window_credit;
        let earliest_outstanding = self.unacknowledged.first().copied();
        let ack_point_advanced = cumulative_tsn_ack > self.cumulative_tsn_ack_point;

        self.acknowledge_up_to(cumulative_tsn_ack);

        // gap ack blocks can only refer to TSNs that were sent and are not cumulatively acked
        let highest_sent = self.next_tsn - 1;

        let mut newly_missing = false;
        let mut previous_end = cumulative_tsn_ack;
        for block in &sack.gap_ack_blocks {
            if block.start == 0 || block.start > block.end {
                debug!("ignoring invalid gap ack block {:?}", block);
                continue;
            }
            let start = cumulative_tsn_ack + SafeCast::<u64>::safe_cast(block.start);
            if start <= previous_end {
                debug!("ignoring gap ack block {:?} that overlaps its predecessor", block);
                continue;
            }
            if start > highest_sent {
                debug!("ignoring gap ack block {:?} for TSNs that were never sent", block);
                break;
            }
            let end = highest_sent.min(cumulative_tsn_ack + SafeCast::<u64>::safe_cast(block.end));

            // TSNs between the previous block and this one were not received, even if an
            //  earlier SACK reported them in a gap ack block
            let missing = self.payload_pool.range(previous_end + 1 .. start)
                .map(|(&tsn, _)| tsn)
                .filter(|tsn| !self.unacknowledged.contains(tsn))
                .collect::<Vec<_>>();
            for tsn in missing {
                debug!("TSN {} was acknowledged in a gap ack block before but is missing now", self.tsn_wrapper.unwrap(tsn));
                self.unacknowledged.insert(tsn);
                newly_missing = true;
            }

            let acked = self.unacknowledged.range(start..=end)
                .copied()
                .collect::<Vec<_>>();
            for tsn in acked {
                self.unacknowledged.remove(&tsn);
            }
            previous_end = end;
        }

        if ack_point_advanced {
            self.transmit_unsent(transmitter);
        }

        if newly_missing {
            self.start_retransmission_timer(true);
        }
        else if self.unacknowledged.is_empty() {
            self.stop();
        }
        else if self.unacknowledged.first().copied() != earliest_outstanding {
            self.start_retransmission_timer(true);
        }

        Ok(())
    }

    /// The retransmission timer expired: send all unacknowledged chunks that are still buffered
    pub fn handle_timeout(&mut self, transmitter: &mut dyn Transmitter) {
        let outstanding = self.unacknowledged.iter().copied().collect::<Vec<_>>();
        if outstanding.is_empty() {
            return;
        }

        debug!("retransmission timeout - resending {} chunks", outstanding.len());
        for tsn in outstanding {
            if let Some(buffered) = self.payload_pool.get_mut(&tsn) {
                buffered.retransmitted |= buffered.first_sent.is_some();
            }
            self.transmit(tsn, transmitter);
        }
        self.start_retransmission_timer(true);
    }

    pub fn stop(&mut self) {
        if let Some(timer) = &mut self.retransmission_timer {
            timer.cancel();
        }
    }

    fn acknowledge_up_to(&mut self, cumulative_tsn_ack: u64) {
        let now = self.time_service.now();
        let mut rtt_sample = None;

        while let Some(entry) = self.payload_pool.first_entry() {
            if *entry.key() > cumulative_tsn_ack {
                break;
            }
            let buffered = entry.remove();
            // Karn's algorithm: retransmitted chunks give no valid RTT measurement
            if !buffered.retransmitted {
                if let Some(first_sent) = buffered.first_sent {
                    rtt_sample = Some(now.saturating_sub(first_sent));
                }
            }
        }
        self.unacknowledged.retain(|&tsn| tsn > cumulative_tsn_ack);
        self.cumulative_tsn_ack_point = cumulative_tsn_ack;
        self.tsn_wrapper.advance(cumulative_tsn_ack);

        if let Some(rtt) = rtt_sample {
            self.rto.add_measurement(rtt);
        }
    }

    fn transmit_unsent(&mut self, transmitter: &mut dyn Transmitter) {
        let unsent = self.payload_pool.iter()
            .filter(|(_, b)| b.first_sent.is_none())
            .map(|(&tsn, _)| tsn)
            .collect::<Vec<_>>();
        for tsn in unsent {
            self.transmit(tsn, transmitter);
        }
    }

    fn transmit(&mut self, tsn: u64, transmitter: &mut dyn Transmitter) {
        let now = self.time_service.now();
        match self.payload_pool.get_mut(&tsn) {
            Some(buffered) => {
                buffered.first_sent.get_or_insert(now);
                transmitter.enqueue(Chunk::PayloadData(buffered.chunk.clone()));
            }
            None => debug!("TSN {} is no longer buffered - can not transmit it", self.tsn_wrapper.unwrap(tsn)),
        }
    }

    fn start_retransmission_timer(&mut self, restart: bool) {
        let rto = self.rto.rto();
        match &mut self.retransmission_timer {
            Some(timer) => {
                if restart || !timer.is_scheduled() {
                    timer.again(rto);
                }
            }
            None => {
                self.retransmission_timer = Some(self.time_service.create_timer(rto, None, TimerId::DataRetransmit));
            }
        }
    }
}
