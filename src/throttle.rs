use std::time::Duration;
use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::time::Instant;
use crate::config::ThrottleConfig;

/// Traffic classes with independent byte-rate budgets. The first seven are the categories a
///  viewer reports in `AgentThrottle`, in wire order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ThrottleCategory {
    Resend = 0,
    Land = 1,
    Wind = 2,
    Cloud = 3,
    Task = 4,
    Texture = 5,
    Asset = 6,
    Unknown = 7,
}

impl ThrottleCategory {
    pub const COUNT: usize = 8;

    pub const ALL: [ThrottleCategory; Self::COUNT] = [
        ThrottleCategory::Resend,
        ThrottleCategory::Land,
        ThrottleCategory::Wind,
        ThrottleCategory::Cloud,
        ThrottleCategory::Task,
        ThrottleCategory::Texture,
        ThrottleCategory::Asset,
        ThrottleCategory::Unknown,
    ];

    /// number of categories a viewer sends in its throttle block
    pub const CLIENT_REPORTED: usize = 7;

    pub fn index(self) -> usize {
        u8::from(self) as usize
    }
}

/// Byte-per-second budgets, one per category
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ThrottleRates([u32; ThrottleCategory::COUNT]);

impl ThrottleRates {
    pub fn uniform(rate: u32) -> ThrottleRates {
        ThrottleRates([rate; ThrottleCategory::COUNT])
    }

    pub fn get(&self, category: ThrottleCategory) -> u32 {
        self.0[category.index()]
    }

    pub fn set(&mut self, category: ThrottleCategory, rate: u32) {
        self.0[category.index()] = rate;
    }

    /// Applies the throttle block of an `AgentThrottle` message: seven little-endian F32 values
    ///  in bits per second, in category order starting at `Resend`. The `Unknown` category is
    ///  not client controlled and keeps its current budget.
    pub fn with_client_throttles(&self, raw: &[u8], config: &ThrottleConfig) -> anyhow::Result<ThrottleRates> {
        if raw.len() < ThrottleCategory::CLIENT_REPORTED * size_of::<f32>() {
            bail!("throttle block has {} bytes, expected at least {}", raw.len(), ThrottleCategory::CLIENT_REPORTED * size_of::<f32>());
        }

        let mut result = *self;
        let reported = raw.chunks_exact(size_of::<f32>()).take(ThrottleCategory::CLIENT_REPORTED);
        for (category, chunk) in ThrottleCategory::ALL.iter().zip(reported) {
            let bits_per_second = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let bytes_per_second = if bits_per_second.is_finite() {
                (bits_per_second as f64 / 8.0) * config.multiplier
            }
            else {
                0.0
            };
            let clamped = bytes_per_second.clamp(config.min_rate as f64, config.max_rate as f64);
            result.set(*category, clamped as u32);
        }
        Ok(result)
    }
}

/// A token bucket that starts empty and accrues `rate` bytes per second up to its capacity.
///  Since tokens are never handed out before they are accrued, the bytes released in any
///  interval starting at creation never exceed `rate * elapsed`.
pub(crate) struct TokenBucket {
    rate: u32,
    tokens: f64,
    capacity: f64,
    burst: Duration,
    min_capacity: usize,
    last_refill: Instant,
}

impl TokenBucket {
    /// `min_capacity` ensures that a packet of maximum size is releasable even for low rates
    pub fn new(rate: u32, burst: Duration, min_capacity: usize, now: Instant) -> TokenBucket {
        TokenBucket {
            rate,
            tokens: 0.0,
            capacity: Self::capacity_for(rate, burst, min_capacity),
            burst,
            min_capacity,
            last_refill: now,
        }
    }

    fn capacity_for(rate: u32, burst: Duration, min_capacity: usize) -> f64 {
        (rate as f64 * burst.as_secs_f64()).max(min_capacity as f64)
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: u32, now: Instant) {
        self.refill(now);
        self.rate = rate;
        self.capacity = Self::capacity_for(rate, self.burst, self.min_capacity);
        self.tokens = self.tokens.min(self.capacity);
    }

    pub fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity);
        self.last_refill = now;
    }

    pub fn try_consume(&mut self, size: usize) -> bool {
        let required = (size as f64).min(self.capacity);
        if self.tokens >= required {
            self.tokens -= size as f64;
            true
        }
        else {
            false
        }
    }

    /// time until `try_consume(size)` can succeed, assuming a refill at that point
    pub fn time_until_available(&self, size: usize) -> Duration {
        let required = (size as f64).min(self.capacity);
        let missing = required - self.tokens;
        if missing <= 0.0 || self.rate == 0 {
            return Duration::from_millis(1);
        }
        Duration::from_secs_f64(missing / self.rate as f64)
            .max(Duration::from_millis(1))
    }
}
