use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info};

/// Byte-stream link to the modem.
///
/// Lines end with `\n`. When no terminator arrives within the timeout `read_line` returns
/// whatever was received, so prompts such as `> ` still come through; an empty buffer means
/// nothing arrived at all.
pub trait Transport: Send {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn read_line(&mut self, timeout: Duration) -> io::Result<Vec<u8>>;
    /// Reads exactly `buf.len()` raw bytes unless the timeout hits first; returns the count read
    fn read_exact_within(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
    fn available(&mut self) -> usize;
    fn clear(&mut self);
}

const POLL_TIMEOUT: Duration = Duration::from_millis(20);

/// Runs a blocking port read. On a multi-threaded runtime the worker hands its other tasks
/// off first; elsewhere the read runs in place.
fn blocking<R>(read: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(read)
        }
        _ => read(),
    }
}

/// Transport over a local serial device (USB CDC or UART)
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(POLL_TIMEOUT)
            .open()
            .map_err(io::Error::from)?;
        info!("Opened modem port {} at {} baud", path, baud_rate);
        Ok(Self {
            port,
            pending: Vec::with_capacity(2048),
        })
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 512];
        match self.port.read(&mut chunk) {
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn read_line_blocking(&mut self, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
                return Ok(self.pending.drain(..=end).collect());
            }
            if Instant::now() >= deadline {
                return Ok(std::mem::take(&mut self.pending));
            }
            self.fill()?;
        }
    }

    fn read_exact_blocking(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        while self.pending.len() < buf.len() && Instant::now() < deadline {
            self.fill()?;
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Vec<u8>> {
        blocking(|| self.read_line_blocking(timeout))
    }

    fn read_exact_within(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        blocking(|| self.read_exact_blocking(buf, timeout))
    }

    fn available(&mut self) -> usize {
        let queued = self.port.bytes_to_read().unwrap_or(0) as usize;
        self.pending.len() + queued
    }

    fn clear(&mut self) {
        self.pending.clear();
        if let Err(e) = self.port.clear(ClearBuffer::All) {
            debug!("Failed to clear port buffers: {}", e);
        }
    }
}
