//! Escalation policies for repeated failure.
//!
//! Two independent ladders: [`Escalation`] for state deadlines, power-down length and the
//! unresponsive-modem counter, and [`GnssBackoff`] for the positioning retry budget. Both
//! grow monotonically during an unbroken failure streak, stop at their caps and return to
//! baseline on success.

use std::time::Duration;

use super::state::ConnectivityState;

pub const STATE_TIMEOUT_START: Duration = Duration::from_millis(20_000);
pub const STATE_TIMEOUT_END: Duration = Duration::from_millis(90_000);
pub const POWER_DOWN_START: Duration = Duration::from_millis(5_000);
pub const POWER_DOWN_END: Duration = Duration::from_millis(40_000);
const ESCALATION_STEP: Duration = Duration::from_millis(5_000);

/// Every n-th consecutive state expiry routes to quarantine
pub const EXPIRIES_BEFORE_QUARANTINE: u32 = 4;
const EXPIRY_WRAP: u32 = 10;
/// Consecutive unresponsive detections before a cold boot
pub const COLD_BOOT_AFTER: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    state_timeout: Duration,
    power_down: Duration,
    expiries: u32,
    unresponsive: u32,
}

impl Default for Escalation {
    fn default() -> Self {
        Self {
            state_timeout: STATE_TIMEOUT_START,
            power_down: POWER_DOWN_START,
            expiries: 0,
            unresponsive: 0,
        }
    }
}

impl Escalation {
    pub fn state_timeout(&self) -> Duration {
        self.state_timeout
    }

    pub fn power_down(&self) -> Duration {
        self.power_down
    }

    pub fn expiries(&self) -> u32 {
        self.expiries
    }

    /// Records a state deadline expiry and returns where to go next
    pub fn on_state_expired(&mut self) -> ConnectivityState {
        self.expiries += 1;
        let next = if self.expiries % EXPIRIES_BEFORE_QUARANTINE == 0 {
            ConnectivityState::Quarantine
        } else {
            self.state_timeout = (self.state_timeout + ESCALATION_STEP).min(STATE_TIMEOUT_END);
            ConnectivityState::ModemRestart
        };
        if self.expiries > EXPIRY_WRAP {
            self.expiries = 0;
        }
        next
    }

    /// Power-down length for this quarantine; the next one is longer
    pub fn next_quarantine(&mut self) -> Duration {
        let current = self.power_down;
        self.power_down = (self.power_down + ESCALATION_STEP).min(POWER_DOWN_END);
        self.expiries = 0;
        current
    }

    /// Records an unresponsive-modem detection. True when a cold boot is due.
    pub fn on_unresponsive(&mut self) -> bool {
        self.unresponsive += 1;
        if self.unresponsive >= COLD_BOOT_AFTER {
            self.unresponsive = 0;
            true
        } else {
            false
        }
    }

    pub fn clear_unresponsive(&mut self) {
        self.unresponsive = 0;
    }

    /// Baseline again; called on every listening tick
    pub fn reset(&mut self) {
        let unresponsive = self.unresponsive;
        *self = Self {
            unresponsive,
            ..Self::default()
        };
    }
}

pub const GNSS_BASE_RETRIES: u32 = 70;
pub const GNSS_MAX_RETRIES: u32 = 120;
const GNSS_RETRY_STEP: u32 = 12;
pub const GNSS_BASE_WINDOW: Duration = Duration::from_millis(200_000);
pub const GNSS_MAX_WINDOW: Duration = Duration::from_millis(7_200_000);
const GNSS_WINDOW_STEP: Duration = Duration::from_millis(40_000);
const GNSS_ESCALATION_STEP: Duration = Duration::from_millis(120_000);
/// Acquisition cycles tolerated before the extra window growth kicks in
const GNSS_ESCALATE_AFTER: u32 = 3;

/// Poll budget and retry window of the positioning search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GnssBackoff {
    retries: u32,
    window: Duration,
}

impl Default for GnssBackoff {
    fn default() -> Self {
        Self {
            retries: GNSS_BASE_RETRIES,
            window: GNSS_BASE_WINDOW,
        }
    }
}

impl GnssBackoff {
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Grows both ladders after a failed acquisition cycle
    pub fn on_failed_cycle(&mut self, cycles: u32) {
        let extra = if cycles > GNSS_ESCALATE_AFTER { cycles } else { 0 };
        self.retries = (self.retries + GNSS_RETRY_STEP).min(GNSS_MAX_RETRIES);
        self.window = (self.window + GNSS_WINDOW_STEP + GNSS_ESCALATION_STEP * extra)
            .min(GNSS_MAX_WINDOW);
    }

    /// Overrides the poll budget, capped
    pub fn set_retries(&mut self, retries: u32) {
        self.retries = retries.min(GNSS_MAX_RETRIES);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
