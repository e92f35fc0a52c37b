//! Connectivity core of a cellular lighting controller.
//!
//! ```text
//! lumenlink/
//! ├── at/            - command transaction engine over the modem's serial link
//! ├── connectivity/  - supervisor state machine: bring-up, positioning, MQTT session
//! ├── protocol/      - JSON message types, inbound dispatch, outbound batching
//! ├── ota/           - firmware download, verification and install
//! ├── hal/           - clock, watchdog and power-key boundaries
//! ├── persistence/   - key-value settings store
//! ├── bus.rs         - bounded channels shared with the rest of the device
//! └── config.rs      - TOML device configuration
//! ```

pub mod at;
pub mod bus;
pub mod config;
pub mod connectivity;
pub mod hal;
pub mod ota;
pub mod persistence;
pub mod protocol;
