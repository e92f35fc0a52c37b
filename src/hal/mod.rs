//! # Hardware Boundary
//!
//! ## Why This Module Exists
//! The connectivity core drives a modem it does not own: the wall clock, the liveness
//! watchdog and the modem power key all belong to the host platform. This module defines
//! the narrow traits the core consumes and ships the host implementations used by the binary.
//!
//! ## Key Abstractions
//! - **DeviceClock**: read and set the device wall time (NTP and GNSS fixes both set it)
//! - **Watchdog**: fed on every poll iteration of any blocking wait
//! - **ModemPower**: drives the modem power-key line for power cycling
//!
//! ```text
//! hal/
//! ├── clock.rs      - offset-based system clock
//! ├── watchdog.rs   - heartbeat watchdog and its monitor task
//! └── power_key.rs  - rppal GPIO power key and a logging fallback
//! ```

pub mod clock;
pub mod power_key;
pub mod watchdog;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use clock::SystemClock;
pub use power_key::{GpioPowerKey, NoPowerKey};
pub use watchdog::HeartbeatWatchdog;

/// Errors raised by hardware collaborators
#[derive(Debug, Error)]
pub enum HalError {
    /// GPIO access failed (chip not present, pin busy, permissions)
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),
}

/// Device wall clock.
///
/// The core never owns the time source. It reads it to timestamp reports and sets it
/// whenever the modem hands over a trusted time (NTP answer or GNSS fix).
pub trait DeviceClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn set(&self, time: DateTime<Utc>);
}

/// Liveness watchdog serviced during every blocking wait.
pub trait Watchdog: Send + Sync {
    fn feed(&self);
}

/// Watchdog that ignores feeds, for hosts supervised by other means.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn feed(&self) {}
}

/// Modem power-key line.
pub trait ModemPower: Send {
    fn set_level(&mut self, high: bool) -> Result<(), HalError>;
}
