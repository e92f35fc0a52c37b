//! # Firmware Update
//!
//! ## Why This Module Exists
//! New firmware arrives through the modem, not through the host's own network stack. The
//! modem downloads the image into a file on its own flash, and the core reads that file back
//! through the same transaction engine that drives everything else, verifying the server's
//! digest before the image is allowed to boot.
//!
//! ## Key Abstractions
//! - **UpdateRequest**: product, variant, version and download timeout class
//! - **StagedHeader**: `Content-Length` and `lsx-md5` from the start of the staged file
//! - **FirmwareSink**: begin/write/end/set-boot-partition/abort image destination
//! - **FirmwareUpdate**: typestate `Requested → Staged → Opened`
//!
//! ```text
//! ota/
//! ├── request.rs  - update message body, timeout classes, download URL
//! ├── header.rs   - staged header parsing
//! ├── sink.rs     - FirmwareSink and the file-backed sink
//! └── updater.rs  - download, open, verified install, staged-file cleanup
//! ```

pub mod header;
pub mod request;
pub mod sink;
pub mod updater;

pub use request::UpdateRequest;
pub use sink::{FileFirmwareSink, FirmwareSink, SinkError};
pub use updater::{delete_staged, update_firmware, OtaError};

#[cfg(test)]
pub use sink::testing;
