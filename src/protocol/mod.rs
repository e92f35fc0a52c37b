//! # Message Protocol
//!
//! ## Why This Module Exists
//! The broker, the connectivity core and the rest of the device all speak one compact JSON
//! dialect: a document is an object whose keys are 4-hex-digit message types. The core
//! handles the types that concern the modem itself, answers report requests from its own
//! state, and passes everything else through untouched.
//!
//! ## Key Abstractions
//! - **MessageType**: the exhaustive type table plus `Unknown(key)` for foreign keys
//! - **OutboundBatch**: fragments merged into one uplink document, report bodies filled in
//! - **dispatch**: inbound handlers, implemented on the supervisor
//!
//! ```text
//! broker ─► +QMTRECV ─► decode ─► per key ─┬─► local handler ─► ack on outgoing
//!                                          └─► incoming channel (other subsystems)
//!
//! outgoing channel ─► OutboundBatch ─► AT+QMTPUB ─► broker
//! ```

pub mod codec;
pub mod dispatch;
pub mod message_type;
pub mod outbound;

pub use codec::ProtocolError;
pub use message_type::MessageType;
