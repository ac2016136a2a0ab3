use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use crate::chunk::payload_data::{PayloadDataChunk, PayloadFlags};
use crate::chunk::sack::{GapAckBlock, SackChunk};
use crate::chunk::{Chunk, CHUNK_HEADER_LEN};
use crate::config::SctpConfig;
use crate::packet_header::PacketHeader;
use crate::safe_converter::PrecheckedCast;
use crate::sequence_number::SequenceNumberWrapper;
use crate::stream::Payload;
use crate::time_service::{TimeService, Timer, TimerId};
use crate::transmitter::Transmitter;

/// Receiving side of an established association: tracks received TSNs, acknowledges them with
///  SACK chunks and releases user messages once all TSNs up to theirs were received.
///
/// Acknowledgement is immediate for the very first DATA chunk, when there are gaps or duplicates,
///  and when a delayed acknowledgement is already pending (i.e. at least every second packet).
///  Otherwise it is delayed by up to the configured SACK timeout. The decision is taken once per
///  packet (see [DataReceiver::handle_packet_processed]) so that several DATA chunks in a packet
///  share a single SACK.
pub struct DataReceiver {
    time_service: Arc<dyn TimeService>,
    sack_timeout: Duration,
    advertised_receiver_window_credit: u32,
    /// how many gap ack blocks and duplicate TSNs fit into a single SACK packet
    max_sack_entries: usize,

    tsn_wrapper: SequenceNumberWrapper<u32>,
    cumulative_tsn: u64,
    /// received chunks with TSNs above the cumulative TSN
    pending: BTreeMap<u64, PayloadDataChunk>,
    /// duplicates received since the last SACK, to be reported in the next SACK
    duplicate_tsns: Vec<u32>,

    received_any: bool,
    must_acknowledge: bool,
    acknowledge_immediately: bool,
    sack_timer: Option<Box<dyn Timer>>,

    delivered: Vec<Payload>,
}

impl DataReceiver {
    pub fn new(config: &SctpConfig, time_service: Arc<dyn TimeService>, remote_initial_tsn: u32) -> DataReceiver {
        let tsn_wrapper = SequenceNumberWrapper::starting_at(remote_initial_tsn);
        let cumulative_tsn = tsn_wrapper.wrap(remote_initial_tsn) - 1;

        let sack_overhead = PacketHeader::SERIALIZED_LEN + CHUNK_HEADER_LEN + SackChunk::FIXED_LEN;

        DataReceiver {
            time_service,
            sack_timeout: config.sack_timeout,
            advertised_receiver_window_credit: config.advertised_receiver_window_credit,
            max_sack_entries: config.max_packet_size.saturating_sub(sack_overhead) / 4,
            tsn_wrapper,
            cumulative_tsn,
            pending: BTreeMap::new(),
            duplicate_tsns: Vec::new(),
            received_any: false,
            must_acknowledge: false,
            acknowledge_immediately: false,
            sack_timer: None,
            delivered: Vec::new(),
        }
    }

    /// the TSN up to which all DATA chunks were received
    pub fn cumulative_tsn(&self) -> u32 {
        self.tsn_wrapper.unwrap(self.cumulative_tsn)
    }

    pub fn handle_payload_chunk(&mut self, chunk: PayloadDataChunk) {
        let tsn = self.tsn_wrapper.wrap(chunk.tsn);

        if tsn > self.cumulative_tsn + u64::from(u16::MAX) {
            // beyond anything a gap ack block can express
            debug!("dropping DATA chunk with TSN {} far ahead of cumulative TSN {}", chunk.tsn, self.cumulative_tsn());
            return;
        }

        let duplicate = tsn <= self.cumulative_tsn || self.pending.contains_key(&tsn);
        let sender_requests_immediate = chunk.flags.contains(PayloadFlags::IMMEDIATE);

        if duplicate {
            trace!("received duplicate TSN {}", chunk.tsn);
            self.duplicate_tsns.push(chunk.tsn);
        }
        else {
            trace!("received TSN {} on stream {}", chunk.tsn, chunk.stream_id);
            self.tsn_wrapper.advance(tsn);
            self.pending.insert(tsn, chunk);
        }

        let timer_running = self.sack_timer.as_ref()
            .map(|t| t.is_scheduled())
            .unwrap_or(false);

        if !self.received_any || duplicate || self.has_gaps() || timer_running || sender_requests_immediate {
            self.acknowledge_immediately = true;
        }
        self.received_any = true;
        self.must_acknowledge = true;
    }

    /// called once after all chunks of a received packet were handled
    pub fn handle_packet_processed(&mut self, transmitter: &mut dyn Transmitter) {
        if !self.must_acknowledge {
            return;
        }

        let timer_running = self.sack_timer.as_ref()
            .map(|t| t.is_scheduled())
            .unwrap_or(false);

        if self.acknowledge_immediately || self.sack_timeout.is_zero() || timer_running {
            self.acknowledge(transmitter);
            return;
        }

        trace!("delaying SACK by {:?}", self.sack_timeout);
        match &mut self.sack_timer {
            Some(timer) => timer.again(self.sack_timeout),
            None => self.sack_timer = Some(self.time_service.create_timer(self.sack_timeout, None, TimerId::DelayedSack)),
        }
    }

    pub fn handle_timeout(&mut self, transmitter: &mut dyn Transmitter) {
        if self.must_acknowledge {
            self.acknowledge(transmitter);
        }
    }

    pub fn acknowledge(&mut self, transmitter: &mut dyn Transmitter) {
        let sack = self.generate_sack();
        debug!("acknowledging cumulative TSN {} with {} gap ack blocks and {} duplicates", sack.cumulative_tsn_ack, sack.gap_ack_blocks.len(), sack.duplicate_tsns.len());
        transmitter.enqueue(Chunk::Sack(sack));

        self.must_acknowledge = false;
        self.acknowledge_immediately = false;
        if let Some(timer) = &mut self.sack_timer {
            timer.cancel();
        }
    }

    /// user messages that became deliverable since the last call, in TSN order
    pub fn take_delivered(&mut self) -> Vec<Payload> {
        std::mem::take(&mut self.delivered)
    }

    /// stops the delayed acknowledgement timer when the association leaves the established state
    pub fn stop(&mut self) {
        if let Some(timer) = &mut self.sack_timer {
            timer.cancel();
        }
    }

    fn has_gaps(&self) -> bool {
        // all pending TSNs are unique and above the cumulative TSN, so they are contiguous iff
        //  the highest of them is exactly 'their number' above the cumulative TSN
        match self.pending.keys().next_back() {
            None => false,
            Some(&highest) => highest != self.cumulative_tsn + self.pending.len() as u64,
        }
    }

    fn generate_sack(&mut self) -> SackChunk {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.cumulative_tsn + 1 {
                break;
            }
            let chunk = entry.remove();
            self.cumulative_tsn += 1;
            self.delivered.push(Payload {
                stream_id: chunk.stream_id,
                payload_protocol_id: chunk.payload_protocol_id,
                data: chunk.user_data,
            });
        }

        let mut gap_ack_blocks = Vec::new();
        let mut current: Option<(u64, u64)> = None;
        for &tsn in self.pending.keys() {
            current = match current {
                Some((start, end)) if tsn == end + 1 => Some((start, tsn)),
                previous => {
                    if let Some(block) = previous {
                        gap_ack_blocks.push(block);
                    }
                    Some((tsn, tsn))
                }
            };
        }
        gap_ack_blocks.extend(current);

        let gap_ack_blocks = gap_ack_blocks.into_iter()
            .take(self.max_sack_entries)
            .map(|(start, end)| GapAckBlock {
                start: (start - self.cumulative_tsn).prechecked_cast(),
                end: (end - self.cumulative_tsn).prechecked_cast(),
            })
            .collect::<Vec<_>>();

        let mut duplicate_tsns = std::mem::take(&mut self.duplicate_tsns);
        duplicate_tsns.truncate(self.max_sack_entries - gap_ack_blocks.len());

        SackChunk {
            cumulative_tsn_ack: self.cumulative_tsn(),
            advertised_receiver_window_credit: self.advertised_receiver_window_credit,
            gap_ack_blocks,
            duplicate_tsns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mockall::predicate::eq;
    use rstest::rstest;
    use crate::time_service::ManualTimeService;
    use crate::transmitter::MockTransmitter;

    fn data(tsn: u32) -> PayloadDataChunk {
        PayloadDataChunk {
            flags: PayloadFlags::BEGIN | PayloadFlags::END,
            tsn,
            stream_id: 1,
            stream_sequence_number: 0,
            payload_protocol_id: 51,
            user_data: Bytes::from(tsn.to_be_bytes().to_vec()),
        }
    }

    fn sack(cumulative_tsn_ack: u32, gap_ack_blocks: Vec<(u16, u16)>, duplicate_tsns: Vec<u32>) -> Chunk {
        Chunk::Sack(SackChunk {
            cumulative_tsn_ack,
            advertised_receiver_window_credit: 0xffff_ffff,
            gap_ack_blocks: gap_ack_blocks.into_iter()
                .map(|(start, end)| GapAckBlock { start, end })
                .collect(),
            duplicate_tsns,
        })
    }

    fn receiver(time_service: &ManualTimeService, initial_tsn: u32) -> DataReceiver {
        DataReceiver::new(&SctpConfig::default(), Arc::new(time_service.clone()), initial_tsn)
    }

    fn delivered_tsns(receiver: &mut DataReceiver) -> Vec<u32> {
        receiver.take_delivered().into_iter()
            .map(|p| u32::from_be_bytes(p.data.as_ref().try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_gap_and_duplicate() {
        let time_service = ManualTimeService::new();
        let mut receiver = receiver(&time_service, 100);

        let mut transmitter = MockTransmitter::new();
        transmitter.expect_enqueue()
            .with(eq(sack(101, vec![(2, 2)], vec![])))
            .once()
            .return_const(());

        receiver.handle_payload_chunk(data(100));
        receiver.handle_payload_chunk(data(101));
        receiver.handle_payload_chunk(data(103));
        receiver.handle_packet_processed(&mut transmitter);
        transmitter.checkpoint();

        assert_eq!(delivered_tsns(&mut receiver), vec![100, 101]);
        assert_eq!(receiver.cumulative_tsn(), 101);

        transmitter.expect_enqueue()
            .with(eq(sack(101, vec![(2, 2)], vec![101])))
            .once()
            .return_const(());

        receiver.handle_payload_chunk(data(101));
        receiver.handle_packet_processed(&mut transmitter);
        transmitter.checkpoint();

        assert!(delivered_tsns(&mut receiver).is_empty());
    }

    #[test]
    fn test_filling_gap_delivers_buffered_chunks() {
        let time_service = ManualTimeService::new();
        let mut receiver = receiver(&time_service, 1);

        let mut transmitter = MockTransmitter::new();
        transmitter.expect_enqueue()
            .with(eq(sack(0, vec![(2, 3), (5, 5)], vec![])))
            .once()
            .return_const(());
        transmitter.expect_enqueue()
            .with(eq(sack(5, vec![], vec![])))
            .once()
            .return_const(());

        receiver.handle_payload_chunk(data(2));
        receiver.handle_payload_chunk(data(3));
        receiver.handle_payload_chunk(data(5));
        receiver.handle_packet_processed(&mut transmitter);
        assert!(delivered_tsns(&mut receiver).is_empty());

        receiver.handle_payload_chunk(data(1));
        receiver.handle_payload_chunk(data(4));
        receiver.handle_packet_processed(&mut transmitter);
        assert_eq!(delivered_tsns(&mut receiver), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_delayed_ack() {
        let time_service = ManualTimeService::new();
        let mut receiver = receiver(&time_service, 1);

        let mut transmitter = MockTransmitter::new();
        transmitter.expect_enqueue()
            .with(eq(sack(1, vec![], vec![])))
            .once()
            .return_const(());

        // the very first chunk is acknowledged immediately
        receiver.handle_payload_chunk(data(1));
        receiver.handle_packet_processed(&mut transmitter);
        transmitter.checkpoint();

        transmitter.expect_enqueue().never();
        receiver.handle_payload_chunk(data(2));
        receiver.handle_packet_processed(&mut transmitter);
        assert!(time_service.advance(Duration::from_millis(99)).is_empty());
        transmitter.checkpoint();

        transmitter.expect_enqueue()
            .with(eq(sack(2, vec![], vec![])))
            .once()
            .return_const(());
        assert_eq!(time_service.advance(Duration::from_millis(1)), vec![TimerId::DelayedSack]);
        receiver.handle_timeout(&mut transmitter);
        transmitter.checkpoint();

        // a stale expiry does not produce another SACK
        transmitter.expect_enqueue().never();
        receiver.handle_timeout(&mut transmitter);
    }

    #[test]
    fn test_second_packet_while_delayed_is_acknowledged_immediately() {
        let time_service = ManualTimeService::new();
        let mut receiver = receiver(&time_service, 1);

        let mut transmitter = MockTransmitter::new();
        transmitter.expect_enqueue()
            .with(eq(sack(1, vec![], vec![])))
            .once()
            .return_const(());
        transmitter.expect_enqueue()
            .with(eq(sack(3, vec![], vec![])))
            .once()
            .return_const(());

        receiver.handle_payload_chunk(data(1));
        receiver.handle_packet_processed(&mut transmitter);
        receiver.handle_payload_chunk(data(2));
        receiver.handle_packet_processed(&mut transmitter);
        receiver.handle_payload_chunk(data(3));
        receiver.handle_packet_processed(&mut transmitter);

        // the acknowledgement cancelled the delay timer
        assert!(time_service.advance(Duration::from_secs(1)).is_empty());
    }

    #[rstest]
    #[case::zero_sack_timeout(Duration::ZERO, PayloadFlags::BEGIN | PayloadFlags::END)]
    #[case::immediate_flag(Duration::from_millis(100), PayloadFlags::BEGIN | PayloadFlags::END | PayloadFlags::IMMEDIATE)]
    fn test_no_delay(#[case] sack_timeout: Duration, #[case] flags: PayloadFlags) {
        let time_service = ManualTimeService::new();
        let config = SctpConfig { sack_timeout, ..SctpConfig::default() };
        let mut receiver = DataReceiver::new(&config, Arc::new(time_service.clone()), 1);

        let mut transmitter = MockTransmitter::new();
        transmitter.expect_enqueue()
            .times(2)
            .return_const(());

        receiver.handle_payload_chunk(data(1));
        receiver.handle_packet_processed(&mut transmitter);
        receiver.handle_payload_chunk(PayloadDataChunk { flags, ..data(2) });
        receiver.handle_packet_processed(&mut transmitter);
    }

    #[test]
    fn test_tsn_wraparound() {
        let time_service = ManualTimeService::new();
        let mut receiver = receiver(&time_service, u32::MAX - 1);

        let mut transmitter = MockTransmitter::new();
        transmitter.expect_enqueue()
            .with(eq(sack(1, vec![], vec![])))
            .once()
            .return_const(());

        for tsn in [u32::MAX - 1, u32::MAX, 0, 1] {
            receiver.handle_payload_chunk(data(tsn));
        }
        receiver.handle_packet_processed(&mut transmitter);
        assert_eq!(delivered_tsns(&mut receiver), vec![u32::MAX - 1, u32::MAX, 0, 1]);
    }

    #[test]
    fn test_chunk_before_initial_tsn_is_duplicate() {
        let time_service = ManualTimeService::new();
        let mut receiver = receiver(&time_service, 0);

        let mut transmitter = MockTransmitter::new();
        transmitter.expect_enqueue()
            .with(eq(sack(u32::MAX, vec![], vec![u32::MAX])))
            .once()
            .return_const(());

        receiver.handle_payload_chunk(data(u32::MAX));
        receiver.handle_packet_processed(&mut transmitter);
        assert!(delivered_tsns(&mut receiver).is_empty());
    }

    #[test]
    fn test_far_ahead_tsn_is_dropped() {
        let time_service = ManualTimeService::new();
        let mut receiver = receiver(&time_service, 1);

        let mut transmitter = MockTransmitter::new();
        transmitter.expect_enqueue().never();

        receiver.handle_payload_chunk(data(1 + 0x1_0000));
        receiver.handle_packet_processed(&mut transmitter);
    }

    #[test]
    fn test_dropped_tsn_does_not_shift_later_tsns() {
        let time_service = ManualTimeService::new();
        let mut receiver = receiver(&time_service, 1);

        let mut transmitter = MockTransmitter::new();
        transmitter.expect_enqueue()
            .with(eq(sack(2, vec![], vec![])))
            .once()
            .return_const(());

        // half a cycle ahead: dropped
        receiver.handle_payload_chunk(data(0x8000_0001));
        receiver.handle_payload_chunk(data(1));
        receiver.handle_payload_chunk(data(2));
        receiver.handle_packet_processed(&mut transmitter);

        assert_eq!(receiver.cumulative_tsn(), 2);
        assert_eq!(delivered_tsns(&mut receiver), vec![1, 2]);
    }

    #[test]
    fn test_sack_fits_into_packet() {
        let time_service = ManualTimeService::new();
        let config = SctpConfig { max_packet_size: 12 + 4 + 12 + 4 * 3, ..SctpConfig::default() };
        let mut receiver = DataReceiver::new(&config, Arc::new(time_service.clone()), 1);

        let mut transmitter = MockTransmitter::new();
        transmitter.expect_enqueue()
            .with(eq(sack(0, vec![(2, 2), (4, 4), (6, 6)], vec![])))
            .once()
            .return_const(());

        for tsn in [2, 4, 6, 8, 8] {
            receiver.handle_payload_chunk(data(tsn));
        }
        receiver.handle_packet_processed(&mut transmitter);
    }

    #[test]
    fn test_no_acknowledgement_without_data() {
        let time_service = ManualTimeService::new();
        let mut receiver = receiver(&time_service, 1);

        let mut transmitter = MockTransmitter::new();
        transmitter.expect_enqueue().never();
        receiver.handle_packet_processed(&mut transmitter);
        receiver.handle_timeout(&mut transmitter);
    }
}
