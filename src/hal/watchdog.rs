use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::Watchdog;

/// Watchdog recording the time of the last feed.
///
/// A monitor task compares that timestamp against a timeout and reports starvation;
/// the binary uses it to end the process so the service manager restarts it.
#[derive(Debug, Clone)]
pub struct HeartbeatWatchdog {
    origin: Instant,
    last_feed_ms: Arc<AtomicU64>,
}

impl Default for HeartbeatWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatWatchdog {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_feed_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Time since the last feed
    pub fn starved_for(&self) -> Duration {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        let last = self.last_feed_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last))
    }

    /// Spawns the monitor. `on_starved` runs once when no feed arrived within `timeout`.
    pub fn spawn_monitor<F>(
        &self,
        timeout: Duration,
        shutdown: CancellationToken,
        on_starved: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        let watchdog = self.clone();
        let check_every = (timeout / 4).max(Duration::from_millis(100));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Watchdog monitor stopped");
                        return;
                    }
                    _ = tokio::time::sleep(check_every) => {}
                }
                let starved = watchdog.starved_for();
                if starved >= timeout {
                    error!("Watchdog starved for {:?}", starved);
                    on_starved(starved);
                    return;
                }
            }
        })
    }
}

impl Watchdog for HeartbeatWatchdog {
    fn feed(&self) {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        self.last_feed_ms.store(now_ms, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feeding_resets_starvation() {
        let watchdog = HeartbeatWatchdog::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(watchdog.starved_for() >= Duration::from_millis(20));

        watchdog.feed();
        assert!(watchdog.starved_for() < Duration::from_millis(20));
    }
}
