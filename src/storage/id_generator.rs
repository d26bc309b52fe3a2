//! Positive 63-bit identifiers for entities and name mappings.

use crate::core::{DbError, Result};
use crate::storage::kv::KvBackend;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

pub trait IdGenerator: Send + Sync {
    /// Always positive. Never fails.
    fn next_id(&self) -> i64;

    fn name(&self) -> &'static str;
}

/// Ids drawn from random UUIDs.
#[derive(Debug)]
pub struct RandomIdGenerator {
    // Used only when the random source keeps producing zero.
    fallback: AtomicI64,
}

impl Default for RandomIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomIdGenerator {
    pub fn new() -> Self {
        Self {
            fallback: AtomicI64::new(1),
        }
    }

    fn draw() -> i64 {
        let (_, low) = uuid::Uuid::new_v4().as_u64_pair();
        (low & i64::MAX as u64) as i64
    }
}

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> i64 {
        for _ in 0..2 {
            let id = Self::draw();
            if id != 0 {
                return id;
            }
        }
        warn!("Random source produced zero twice, using fallback counter");
        self.fallback.fetch_add(1, Ordering::Relaxed).max(1)
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Key holding the last persisted wall-clock watermark.
pub const LAST_TIMESTAMP_KEY: &[u8] = b"last_timestamp";

const COUNTER_BITS: u32 = 18;
const COUNTER_LIMIT: i64 = 1 << COUNTER_BITS;
const START_POLL_INTERVAL: Duration = Duration::from_millis(100);
const START_MAX_POLLS: u32 = 50;

#[derive(Debug, Default)]
struct Clock {
    last_millis: i64,
    counter: i64,
}

/// Time-ordered ids: `(millis << 18) + counter`.
///
/// [`start`](Self::start) must run before the first id is handed out so a
/// restart after a clock step backwards cannot repeat ids.
pub struct TimestampIdGenerator {
    backend: Arc<dyn KvBackend>,
    max_skew: Duration,
    clock: Mutex<Clock>,
}

impl TimestampIdGenerator {
    pub fn new(backend: Arc<dyn KvBackend>, max_skew: Duration) -> Self {
        Self {
            backend,
            max_skew,
            clock: Mutex::new(Clock::default()),
        }
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn saved_watermark(&self) -> Result<i64> {
        match self.backend.get(LAST_TIMESTAMP_KEY)? {
            None => Ok(0),
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    DbError::Serialization(format!(
                        "watermark has {} bytes, expected 8",
                        bytes.len()
                    ))
                })?;
                Ok(i64::from_be_bytes(raw))
            }
        }
    }

    /// Waits until the clock has moved past the persisted watermark plus
    /// the allowed skew, then persists the current time.
    pub fn start(&self) -> Result<()> {
        let watermark = self.saved_watermark()?;
        let skew_ms = i64::try_from(self.max_skew.as_millis()).unwrap_or(i64::MAX);
        let threshold = watermark.saturating_add(skew_ms);

        let mut now = Self::now_millis();
        let mut polls = 0;
        while now <= threshold && polls < START_MAX_POLLS {
            std::thread::sleep(START_POLL_INTERVAL);
            now = Self::now_millis();
            polls += 1;
        }
        if now <= threshold {
            return Err(DbError::Backend(format!(
                "clock is {} ms behind the persisted id watermark",
                threshold - now
            )));
        }

        self.backend
            .put(LAST_TIMESTAMP_KEY, &now.to_be_bytes(), true)?;
        let mut clock = self.clock.lock()?;
        clock.last_millis = clock.last_millis.max(now);
        info!(watermark, now, "Timestamp id generator started");
        Ok(())
    }
}

impl IdGenerator for TimestampIdGenerator {
    fn next_id(&self) -> i64 {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Self::now_millis();
        if now > clock.last_millis {
            clock.last_millis = now;
            clock.counter = 0;
        } else {
            clock.counter += 1;
            if clock.counter >= COUNTER_LIMIT {
                let mut next = Self::now_millis();
                while next <= clock.last_millis {
                    std::thread::sleep(Duration::from_millis(1));
                    next = Self::now_millis();
                }
                clock.last_millis = next;
                clock.counter = 0;
            }
        }
        (clock.last_millis << COUNTER_BITS) + clock.counter
    }

    fn name(&self) -> &'static str {
        "timestamp"
    }
}
