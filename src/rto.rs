use std::time::Duration;
use tracing::trace;
use crate::config::RtoConfig;

/// Estimates the retransmission timeout from round trip time measurements as described in
///  RFC 4960 section 6.3.1.
///
/// The first measurement R initializes the smoothed round trip time SRTT to R and the round trip
///  time variation RTTVAR to R/2. Every subsequent measurement R' updates them as
///
/// ```ascii
/// RTTVAR = (1 - beta) * RTTVAR + beta * |SRTT - R'|
/// SRTT   = (1 - alpha) * SRTT + alpha * R'
/// ```
///
/// and RTO is `SRTT + 4 * RTTVAR`, clamped to the configured bounds.
#[derive(Debug)]
pub struct RtoCalculator {
    config: RtoConfig,
    /// seconds
    smoothed_rtt: Option<f64>,
    /// seconds
    rtt_variation: f64,
    rto: Duration,
}

impl RtoCalculator {
    pub fn new(config: RtoConfig) -> RtoCalculator {
        RtoCalculator {
            rto: config.initial,
            config,
            smoothed_rtt: None,
            rtt_variation: 0.0,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.smoothed_rtt.map(Duration::from_secs_f64)
    }

    pub fn add_measurement(&mut self, rtt: Duration) {
        let rtt = rtt.as_secs_f64();

        let smoothed_rtt = match self.smoothed_rtt {
            None => {
                self.rtt_variation = rtt / 2.0;
                rtt
            }
            Some(srtt) => {
                self.rtt_variation = (1.0 - self.config.beta) * self.rtt_variation + self.config.beta * (srtt - rtt).abs();
                (1.0 - self.config.alpha) * srtt + self.config.alpha * rtt
            }
        };
        self.smoothed_rtt = Some(smoothed_rtt);

        self.rto = self.clamp(Duration::from_secs_f64(smoothed_rtt + 4.0 * self.rtt_variation));
        trace!("RTT measurement {:.3}s -> SRTT {:.3}s, RTTVAR {:.3}s, RTO {:?}", rtt, smoothed_rtt, self.rtt_variation, self.rto);
    }

    /// Doubles the RTO (up to the maximum) after a retransmission timeout, see RFC 4960
    ///  section 6.3.3 rule E2. The next measurement replaces the backed-off value.
    pub fn backoff(&mut self) {
        self.rto = self.clamp(self.rto.saturating_mul(2));
    }

    fn clamp(&self, rto: Duration) -> Duration {
        rto.clamp(self.config.min, self.config.max)
    }
}
