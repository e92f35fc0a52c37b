//! Destination of a verified firmware image.
//!
//! Mirrors a flash/boot partition API: `begin`, a stream of `write`s, `end` to finalize,
//! then `set_boot_partition` to make the image the next one started. `abort` throws away
//! a partially written image.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Image I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No image in progress")]
    NotStarted,

    #[error("Image was not finalized")]
    NotFinalized,
}

pub trait FirmwareSink: Send {
    fn begin(&mut self) -> Result<(), SinkError>;
    fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError>;
    fn end(&mut self) -> Result<(), SinkError>;
    fn set_boot_partition(&mut self) -> Result<(), SinkError>;
    fn abort(&mut self);
}

const PARTIAL_IMAGE: &str = "next.part";
const FINAL_IMAGE: &str = "next.img";
const BOOT_MARKER: &str = "boot";

/// Writes images into a directory on the host.
///
/// ```text
/// <dir>/next.part   image being written
/// <dir>/next.img    finalized image
/// <dir>/boot        name of the image to start next
/// ```
pub struct FileFirmwareSink {
    dir: PathBuf,
    partial: Option<File>,
    finalized: bool,
}

impl FileFirmwareSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            partial: None,
            finalized: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FirmwareSink for FileFirmwareSink {
    fn begin(&mut self) -> Result<(), SinkError> {
        fs::create_dir_all(&self.dir)?;
        let file = File::create(self.dir.join(PARTIAL_IMAGE))?;
        self.partial = Some(file);
        self.finalized = false;
        debug!("Writing image to {:?}", self.dir);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        let file = self.partial.as_mut().ok_or(SinkError::NotStarted)?;
        file.write_all(chunk)?;
        Ok(())
    }

    fn end(&mut self) -> Result<(), SinkError> {
        let file = self.partial.take().ok_or(SinkError::NotStarted)?;
        file.sync_all()?;
        drop(file);
        fs::rename(self.dir.join(PARTIAL_IMAGE), self.dir.join(FINAL_IMAGE))?;
        self.finalized = true;
        Ok(())
    }

    fn set_boot_partition(&mut self) -> Result<(), SinkError> {
        if !self.finalized {
            return Err(SinkError::NotFinalized);
        }
        fs::write(self.dir.join(BOOT_MARKER), FINAL_IMAGE)?;
        info!("Next boot image: {:?}", self.dir.join(FINAL_IMAGE));
        Ok(())
    }

    fn abort(&mut self) {
        self.partial = None;
        self.finalized = false;
        let partial = self.dir.join(PARTIAL_IMAGE);
        if partial.exists() {
            if let Err(e) = fs::remove_file(&partial) {
                warn!("Failed to remove partial image: {}", e);
            }
        }
    }
}
