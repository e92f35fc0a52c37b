use std::time::Duration;

use tokio::time::Instant;

pub const CHECK_CONNECTION_INTERVAL: Duration = Duration::from_millis(600_000);
pub const CHECK_SUBSCRIPTION_INTERVAL: Duration = Duration::from_millis(14_400_000);
pub const NTP_SYNC_INTERVAL: Duration = Duration::from_millis(21_600_000);
pub const LAST_CONNECTED_WATCH: Duration = Duration::from_millis(14_400_000);
/// First health checks after (re)entering the listening phase
pub const LISTEN_ENTRY_CHECK: Duration = Duration::from_millis(20_000);

/// A `{start, duration}` pair
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    duration: Duration,
}

impl Deadline {
    pub fn new(duration: Duration) -> Self {
        Self {
            start: Instant::now(),
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn restart(&mut self) {
        self.start = Instant::now();
    }

    /// Restarts with a new duration
    pub fn restart_with(&mut self, duration: Duration) {
        self.duration = duration;
        self.restart();
    }

    /// Changes the duration without moving the start
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    /// Pushes the start later by `by`, never past now
    pub fn postpone(&mut self, by: Duration) {
        self.start = (self.start + by).min(Instant::now());
    }

    pub fn is_up(&self) -> bool {
        self.start.elapsed() >= self.duration
    }

    pub fn is_up_then_restart(&mut self) -> bool {
        if self.is_up() {
            self.restart();
            true
        } else {
            false
        }
    }
}

/// All supervisor timers
#[derive(Debug, Clone, Copy)]
pub struct Timers {
    /// Overall deadline of the current sub-operation
    pub state: Deadline,
    pub gnss_retry: Deadline,
    pub check_subscription: Deadline,
    pub check_connection: Deadline,
    pub ntp_sync: Deadline,
    /// Restarted on every listening tick; expiry forces an operator rescan
    pub last_connected: Deadline,
}

impl Timers {
    pub fn new(state_timeout: Duration, gnss_retry: Duration) -> Self {
        Self {
            state: Deadline::new(state_timeout),
            gnss_retry: Deadline::new(gnss_retry),
            check_subscription: Deadline::new(CHECK_SUBSCRIPTION_INTERVAL),
            check_connection: Deadline::new(CHECK_CONNECTION_INTERVAL),
            ntp_sync: Deadline::new(NTP_SYNC_INTERVAL),
            last_connected: Deadline::new(LAST_CONNECTED_WATCH),
        }
    }
}
