//! # Command Transaction Engine
//!
//! Request/response exchange with the cellular modem over its serial link, with inline
//! interception of the notifications the modem interleaves with answers.
//!
//! ```text
//! at/
//! ├── transport.rs  - byte-stream boundary and the serial port implementation
//! ├── classify.rs   - ordered matcher→action table for response lines
//! ├── engine.rs     - AtEngine: send, read_line, transact, raw block reads
//! ├── parse.rs      - response format parsers
//! └── error.rs      - AtError
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! serial bytes ─► read_line ─► classify ─┬─► current transaction (expected / OK / ERROR)
//!                                        ├─► publish channel (+QMTRECV)
//!                                        ├─► device clock (+QNTP)
//!                                        └─► disconnected flag (APP RDY, +QMTSTAT, pdpdeact)
//! ```
//!
//! Every poll iteration feeds the watchdog, so no transaction can starve it.

pub mod classify;
pub mod engine;
pub mod error;
pub mod parse;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use engine::{AtEngine, Outcome, Transaction, Unsolicited};
pub use error::AtError;
pub use transport::{SerialTransport, Transport};
