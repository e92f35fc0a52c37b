//! # Connectivity State Machine
//!
//! ## Why This Module Exists
//! Getting from a powered-off modem to a subscribed MQTT session takes dozens of slow
//! transactions, any of which can fail. This module sequences them into phases, retries
//! with growing budgets, and falls back to power cycling when nothing else helps.
//!
//! ```text
//! connectivity/
//! ├── supervisor.rs   - Supervisor, tick loop, preamble, task handle
//! ├── state.rs        - ConnectivityState, StepSequencer, Step
//! ├── timers.rs       - Deadline and the named timers
//! ├── backoff.rs      - state-timeout escalation, quarantine, positioning backoff
//! ├── power.rs        - power cycling, cold boot, Quarantine phase
//! ├── bringup.rs      - ModemRestart, NetworkInit, operators, NTP
//! ├── gnss.rs         - Gnss phase
//! ├── session.rs      - MqttConnect, MqttListen, health checks, publish
//! ├── health.rs       - link snapshot and the reported shadow
//! ├── operators.rs    - scanned operator list
//! └── loss_window.rs  - recent connection losses
//! ```

pub mod backoff;
pub mod bringup;
pub mod gnss;
pub mod health;
pub mod loss_window;
pub mod operators;
pub mod power;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod timers;

pub use state::ConnectivityState;
pub use supervisor::{Collaborators, ConnectivityHandle, Exit, LinkStatus, Supervisor};
