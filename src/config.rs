use std::time::Duration;
use anyhow::bail;

pub struct SctpConfig {
    /// The SCTP port of this side of the association. WebRTC uses 5000 unless negotiated
    ///  otherwise in SDP.
    pub local_port: u16,
    pub remote_port: u16,

    /// The receiver window credit advertised to the peer in INIT, INIT ACK and SACK chunks. There
    ///  is no receive-side flow control, so this is a constant.
    pub advertised_receiver_window_credit: u32,

    /// This is the maximum size of an SCTP packet that the association produces, i.e. the payload
    ///  of a DTLS record. It must fit into a single UDP datagram after DTLS overhead, and since
    ///  there is no path MTU discovery, the default is chosen conservatively.
    pub max_packet_size: usize,

    /// The delay before an unanswered INIT or COOKIE ECHO is sent again
    pub init_retransmit_timeout: Duration,
    /// The number of times INIT or COOKIE ECHO are retransmitted before the handshake is abandoned
    pub max_init_retransmits: u32,

    /// The maximum delay for acknowledging received data when there is no reason to acknowledge
    ///  immediately. A value of zero means that every packet is acknowledged immediately.
    pub sack_timeout: Duration,

    /// The number of sent payload chunks that are buffered for retransmission. When this is
    ///  exceeded, the oldest buffered chunks are discarded even if they are not acknowledged yet.
    pub payload_pool_size: usize,

    /// Verify the CRC32C checksum of incoming packets. Inside DTLS, packets are integrity
    ///  protected anyway, and some stacks send a zero checksum in that case.
    pub verify_checksum: bool,

    pub rto: RtoConfig,
}

impl Default for SctpConfig {
    fn default() -> Self {
        SctpConfig {
            local_port: 5000,
            remote_port: 5000,
            advertised_receiver_window_credit: 0xffff_ffff,
            max_packet_size: 1200,
            init_retransmit_timeout: Duration::from_millis(100),
            max_init_retransmits: 10,
            sack_timeout: Duration::from_millis(100),
            payload_pool_size: 1000,
            verify_checksum: true,
            rto: RtoConfig::default(),
        }
    }
}

impl SctpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.local_port == 0 || self.remote_port == 0 {
            bail!("SCTP ports must not be 0");
        }
        // INIT / INIT ACK with their parameters, and DATA with some user data, must fit
        if self.max_packet_size < 100 {
            bail!("max packet size {} is too small", self.max_packet_size);
        }
        if self.init_retransmit_timeout.is_zero() {
            bail!("init retransmit timeout must be positive");
        }
        if self.payload_pool_size == 0 {
            bail!("payload pool size must be positive");
        }
        self.rto.validate()
    }
}

/// Parameters for estimating the retransmission timeout from measured round trip times, see
///  RFC 4960 section 6.3.1
#[derive(Clone, Debug)]
pub struct RtoConfig {
    /// the RTO before the first round trip was measured
    pub initial: Duration,
    pub min: Duration,
    pub max: Duration,
    /// weight of a new measurement in the smoothed round trip time
    pub alpha: f64,
    /// weight of a new measurement in the round trip time variation
    pub beta: f64,
}

impl Default for RtoConfig {
    fn default() -> Self {
        RtoConfig {
            initial: Duration::from_millis(1000),
            min: Duration::from_millis(1000),
            max: Duration::from_millis(60_000),
            alpha: 1.0 / 8.0,
            beta: 1.0 / 4.0,
        }
    }
}

impl RtoConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min > self.max {
            bail!("minimum RTO {:?} is greater than maximum RTO {:?}", self.min, self.max);
        }
        if self.initial < self.min || self.initial > self.max {
            bail!("initial RTO {:?} is outside of [{:?}, {:?}]", self.initial, self.min, self.max);
        }
        if !(0.0..=1.0).contains(&self.alpha) || !(0.0..=1.0).contains(&self.beta) {
            bail!("RTO alpha and beta must be between 0 and 1");
        }
        Ok(())
    }
}
