use std::time::Duration;
use anyhow::bail;
use crate::throttle::{ThrottleCategory, ThrottleRates};

/// The highest sequence number the protocol uses before wrapping around to 1
pub const MAX_SEQUENCE: u32 = 0xFF_FFFF;

/// the largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

pub struct ClientStackConfig {
    /// Sequence numbers are allocated from `1..=max_sequence`, wrapping around to 1
    pub max_sequence: u32,

    /// A reliable packet that was not acknowledged within this interval is re-sent (under the
    ///  `Resend` throttle category), once per elapsed interval until it is acknowledged
    pub resend_timeout: Duration,

    /// Interval of the periodic sweep that sends standalone acks, re-sends overdue reliable
    ///  packets and emits packet statistics
    pub ack_interval: Duration,

    pub ping_interval: Duration,
    /// Number of consecutive liveness probes without any inbound packet that is tolerated
    ///  before the connection is closed
    pub max_probe_failures: u32,
    /// Same as `max_probe_failures`, applying while the viewer reported itself as paused
    pub max_probe_failures_blocked: u32,

    /// Inbound sequence numbers are remembered for this long to suppress duplicates
    pub dupe_window: Duration,

    pub max_appended_acks: usize,
    /// If more inbound acks than this are pending, acks are no longer piggybacked on outbound
    ///  packets but left to the periodic standalone ack packets
    pub append_ack_threshold: usize,
    /// Upper bound for pending inbound acks - acks beyond this are dropped (and the sender
    ///  eventually re-sends)
    pub max_pending_acks: usize,
    /// Upper bound for outbound packets waiting for an ack. When it is reached, the oldest
    ///  record is discarded.
    pub max_unacked_packets: usize,

    /// The maximum size of a UDP payload. Appended acks are only added up to this size.
    pub max_packet_size: usize,

    /// Whether packet objects and wire buffers are recycled. Correctness never depends on it.
    pub packet_pooling: bool,
    /// Number of pooled packet objects that are retained per packet type
    pub packet_pool_size: usize,
    pub buffer_pool_size: usize,

    pub throttle: ThrottleConfig,

    /// Malformed datagrams are logged as warnings at most once per interval and source address
    pub malformed_log_interval: Duration,
}

impl Default for ClientStackConfig {
    fn default() -> Self {
        ClientStackConfig {
            max_sequence: MAX_SEQUENCE,
            resend_timeout: Duration::from_millis(4000),
            ack_interval: Duration::from_millis(750),
            ping_interval: Duration::from_secs(5),
            max_probe_failures: 30,
            max_probe_failures_blocked: 90,
            dupe_window: Duration::from_secs(30),
            max_appended_acks: 10,
            append_ack_threshold: 250,
            max_pending_acks: 1024,
            max_unacked_packets: 4096,
            max_packet_size: 1500,
            packet_pooling: true,
            packet_pool_size: 64,
            buffer_pool_size: 256,
            throttle: ThrottleConfig::default(),
            malformed_log_interval: Duration::from_secs(10),
        }
    }
}

impl ClientStackConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_sequence == 0 || self.max_sequence > MAX_SEQUENCE {
            bail!("max_sequence must be in 1..={}, was {}", MAX_SEQUENCE, self.max_sequence);
        }
        if self.resend_timeout.is_zero() || self.ack_interval.is_zero() || self.ping_interval.is_zero() {
            bail!("timer intervals must not be zero");
        }
        if self.max_appended_acks > u8::MAX as usize {
            bail!("at most {} acks can be appended to a packet, configured {}", u8::MAX, self.max_appended_acks);
        }
        if self.max_packet_size < 100 {
            bail!("max packet size is too small");
        }
        if self.max_packet_size > MAX_DATAGRAM_SIZE {
            bail!("max packet size {} exceeds the UDP payload limit of {}", self.max_packet_size, MAX_DATAGRAM_SIZE);
        }
        self.throttle.validate()
    }
}

pub struct ThrottleConfig {
    /// budgets in bytes per second that apply until the viewer sends its own throttle settings
    pub initial_rates: ThrottleRates,
    /// applied to all client-supplied throttle values
    pub multiplier: f64,
    pub min_rate: u32,
    pub max_rate: u32,
    /// the amount of unused budget a category can accumulate, expressed as time at its rate
    pub burst: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        let mut initial_rates = ThrottleRates::uniform(10_000);
        initial_rates.set(ThrottleCategory::Resend, 12_500);
        initial_rates.set(ThrottleCategory::Land, 12_500);
        initial_rates.set(ThrottleCategory::Wind, 5_000);
        initial_rates.set(ThrottleCategory::Cloud, 5_000);
        initial_rates.set(ThrottleCategory::Task, 25_000);
        initial_rates.set(ThrottleCategory::Texture, 100_000);
        initial_rates.set(ThrottleCategory::Asset, 50_000);
        initial_rates.set(ThrottleCategory::Unknown, 50_000);

        ThrottleConfig {
            initial_rates,
            multiplier: 1.0,
            min_rate: 1_000,
            max_rate: 1_000_000,
            burst: Duration::from_millis(250),
        }
    }
}

impl ThrottleConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if !(self.multiplier > 0.0) {
            bail!("throttle multiplier must be positive, was {}", self.multiplier);
        }
        if self.min_rate == 0 || self.min_rate > self.max_rate {
            bail!("throttle rate bounds are inconsistent: {}..{}", self.min_rate, self.max_rate);
        }
        for category in ThrottleCategory::ALL {
            if self.initial_rates.get(category) == 0 {
                bail!("initial throttle rate for {:?} must not be zero", category);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        ClientStackConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::sequence_zero(|c: &mut ClientStackConfig| c.max_sequence = 0)]
    #[case::sequence_too_big(|c: &mut ClientStackConfig| c.max_sequence = MAX_SEQUENCE + 1)]
    #[case::zero_resend(|c: &mut ClientStackConfig| c.resend_timeout = Duration::ZERO)]
    #[case::zero_ack_interval(|c: &mut ClientStackConfig| c.ack_interval = Duration::ZERO)]
    #[case::too_many_acks(|c: &mut ClientStackConfig| c.max_appended_acks = 256)]
    #[case::tiny_packets(|c: &mut ClientStackConfig| c.max_packet_size = 99)]
    #[case::huge_packets(|c: &mut ClientStackConfig| c.max_packet_size = MAX_DATAGRAM_SIZE + 1)]
    #[case::negative_multiplier(|c: &mut ClientStackConfig| c.throttle.multiplier = -1.0)]
    #[case::nan_multiplier(|c: &mut ClientStackConfig| c.throttle.multiplier = f64::NAN)]
    #[case::inverted_bounds(|c: &mut ClientStackConfig| c.throttle.min_rate = c.throttle.max_rate + 1)]
    #[case::zero_rate(|c: &mut ClientStackConfig| c.throttle.initial_rates.set(ThrottleCategory::Wind, 0))]
    fn test_validate_rejects(#[case] modify: fn(&mut ClientStackConfig)) {
        let mut config = ClientStackConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
