use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};

use super::DeviceClock;

/// Wall clock backed by the host system time plus a correction offset.
///
/// Setting the host clock needs privileges the process does not have, so corrections
/// from NTP or GNSS are kept as an offset and applied on every read.
#[derive(Debug, Default)]
pub struct SystemClock {
    offset: Mutex<TimeDelta>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock starting at a fixed time, mostly for tests and bench setups
    pub fn starting_at(time: DateTime<Utc>) -> Self {
        let clock = Self::new();
        clock.set(time);
        clock
    }
}

impl DeviceClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let offset = match self.offset.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        Utc::now() + offset
    }

    fn set(&self, time: DateTime<Utc>) {
        let delta = time - Utc::now();
        match self.offset.lock() {
            Ok(mut guard) => *guard = delta,
            Err(poisoned) => {
                warn!("Clock offset lock poisoned, overwriting");
                *poisoned.into_inner() = delta;
            }
        }
        info!("Device clock set to {}", time);
    }
}
