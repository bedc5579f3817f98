// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Byte-rate limiter shared by every transfer of a manager.
///
/// Token bucket whose burst equals one second worth of bytes. A rate of 0
/// disables limiting.
#[derive(Clone)]
pub struct SpeedLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

struct Bucket {
    /// Bytes per second; 0 means unlimited.
    rate: u64,
    available: u64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        let earned = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if earned > 0 {
            self.available = self.available.saturating_add(earned).min(self.rate);
            self.last_refill = now;
        }
    }
}

impl SpeedLimiter {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                rate: rate_bytes_per_sec,
                available: rate_bytes_per_sec,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Changes the rate; the bucket starts full at the new rate.
    pub async fn set_rate(&self, rate_bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock().await;
        bucket.rate = rate_bytes_per_sec;
        bucket.available = rate_bytes_per_sec;
        bucket.last_refill = Instant::now();
    }

    /// Waits until `amount` bytes may pass.
    ///
    /// Amounts larger than the burst are admitted in burst-sized slices, so a
    /// single large chunk cannot stall forever.
    pub async fn acquire(&self, amount: u64) {
        let mut remaining = amount;
        while remaining > 0 {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.rate == 0 {
                    return;
                }
                bucket.refill(Instant::now());

                let wanted = remaining.min(bucket.rate);
                if bucket.available >= wanted {
                    bucket.available -= wanted;
                    remaining -= wanted;
                    continue;
                }
                let missing = wanted - bucket.available;
                Duration::from_secs_f64(missing as f64 / bucket.rate as f64)
            };
            tokio::time::sleep(wait).await;
        }
    }
}
