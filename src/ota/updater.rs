//! Firmware update through the modem's HTTP client and file system.
//!
//! ```text
//! Requested ──download──► Staged ──open──► Opened ──install──► boot image set
//!     │                     │                 │
//!     └─────────────────────┴─────────────────┴──► staged file deleted
//! ```
//!
//! The typestate keeps the order of the modem-side operations fixed: a file handle only
//! exists in `Opened`, and only a staged file can be opened.

use md5::{Digest, Md5};
use statum::{machine, state};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::header::{HeaderError, StagedHeader, HEADER_BLOCK};
use super::request::UpdateRequest;
use super::sink::{FirmwareSink, SinkError};
use crate::at::{parse, AtEngine, AtError, Transaction, Transport};
use crate::config::UpdateConfig;

const INSTALL_ATTEMPTS: u32 = 3;
const CHUNK: usize = 4096;
const HTTP_OK: u16 = 200;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("Download failed at {0}")]
    Download(&'static str),

    #[error("Server answered HTTP {0}")]
    HttpStatus(u16),

    #[error("Staged file unavailable: {0}")]
    Staging(String),

    #[error("Staged header rejected: {0}")]
    Header(#[from] HeaderError),

    #[error("Modem read failed: {0}")]
    At(#[from] AtError),

    #[error("Image write failed: {0}")]
    Sink(#[from] SinkError),

    #[error("Image truncated after {read} of {expected} bytes")]
    Truncated { read: u32, expected: u32 },

    #[error("Digest mismatch: header {expected}, image {computed}")]
    DigestMismatch { expected: String, computed: String },
}

#[state]
#[derive(Debug, Clone)]
pub enum UpdatePhase {
    Requested,
    Staged,
    Opened,
}

#[machine]
pub struct FirmwareUpdate<S: UpdatePhase> {
    request: UpdateRequest,
    base_url: String,
    staging_file: String,
    file_size: u32,
    handle: u32,
}

impl<S: UpdatePhase> FirmwareUpdate<S> {
    fn quoted_file(&self) -> String {
        format!("\"{}\"", self.staging_file)
    }
}

impl FirmwareUpdate<Requested> {
    pub fn requested(request: UpdateRequest, config: &UpdateConfig) -> Self {
        Self::new(
            request,
            config.base_url.clone(),
            config.staging_file.clone(),
            0,
            0,
        )
    }

    /// Has the modem fetch the image into its staging file
    pub async fn download<T: Transport>(
        self,
        at: &mut AtEngine<T>,
    ) -> Result<FirmwareUpdate<Staged>, OtaError> {
        let url = self.request.url(&self.base_url);
        info!("Downloading firmware {}", url);

        at.transact(&Transaction::new("AT+QHTTPCFG=\"contextid\",1", "OK"))
            .await;
        at.transact(&Transaction::new("AT+QHTTPCFG=\"responseheader\",1", "OK"))
            .await;
        at.pause_ms(5000).await;

        let prompt = Transaction::new(format!("AT+QHTTPURL={},80", url.len()), "CONNECT")
            .without_ok();
        if !at.transact(&prompt).await.succeeded() {
            return Err(OtaError::Download("url prompt"));
        }
        if !at
            .transact(&Transaction::new(url, "OK").forwarding())
            .await
            .succeeded()
        {
            return Err(OtaError::Download("url"));
        }

        let get = Transaction::new("AT+QHTTPGET=80", "+QHTTPGET:").forwarding();
        let outcome = at.transact(&get).await;
        if !outcome.succeeded() {
            return Err(OtaError::Download("request"));
        }
        match parse::http_status(&outcome.response) {
            Some(HTTP_OK) => {}
            Some(status) => return Err(OtaError::HttpStatus(status)),
            None => return Err(OtaError::Download("request")),
        }

        let secs = self.request.download_secs();
        let command = format!("AT+QHTTPREADFILE={},{}", self.quoted_file(), secs);
        let store = Transaction::new(command, "+QHTTPREADFILE:")
            .timeout_ms(u64::from(secs) * 1000)
            .without_ok();
        if !at.transact(&store).await.confirms("+QHTTPREADFILE: 0") {
            return Err(OtaError::Download("store"));
        }
        debug!("Firmware staged in {}", self.staging_file);
        Ok(self.transition())
    }
}

impl FirmwareUpdate<Staged> {
    /// Reads the staged file size and opens it for reading
    pub async fn open<T: Transport>(
        mut self,
        at: &mut AtEngine<T>,
    ) -> Result<FirmwareUpdate<Opened>, OtaError> {
        at.pause_ms(100).await;

        let list = Transaction::new(format!("AT+QFLST={}", self.quoted_file()), "+QFLST:");
        let outcome = at.transact(&list).await;
        self.file_size = outcome
            .succeeded()
            .then(|| parse::file_size(&outcome.response))
            .flatten()
            .ok_or_else(|| OtaError::Staging(outcome.response.clone()))?;

        let open = Transaction::new(format!("AT+QFOPEN={},2", self.quoted_file()), "+QFOPEN:");
        let outcome = at.transact(&open).await;
        self.handle = outcome
            .succeeded()
            .then(|| parse::file_handle(&outcome.response))
            .flatten()
            .ok_or_else(|| OtaError::Staging(outcome.response.clone()))?;

        debug!("Staged file: {} bytes, handle {}", self.file_size, self.handle);
        Ok(self.transition())
    }
}

impl FirmwareUpdate<Opened> {
    /// Streams the body into `sink`, verifying its digest; closes the file either way
    pub async fn install<T: Transport>(
        self,
        at: &mut AtEngine<T>,
        sink: &mut dyn FirmwareSink,
    ) -> Result<(), OtaError> {
        let mut result = Ok(());
        for attempt in 1..=INSTALL_ATTEMPTS {
            result = self.try_install(at, sink).await;
            match &result {
                Ok(()) => {
                    info!("Firmware installed on attempt {}", attempt);
                    at.clear();
                    break;
                }
                Err(e) => warn!("Install attempt {} failed: {}", attempt, e),
            }
        }
        let close = Transaction::new(format!("AT+QFCLOSE={}", self.handle), "OK");
        at.transact(&close).await;
        result
    }

    async fn try_install<T: Transport>(
        &self,
        at: &mut AtEngine<T>,
        sink: &mut dyn FirmwareSink,
    ) -> Result<(), OtaError> {
        self.seek(at, 0).await?;
        let mut block = vec![0u8; HEADER_BLOCK];
        let read = at
            .read_block(&self.read_command(HEADER_BLOCK), &mut block, READ_TIMEOUT)
            .await?;
        let header = StagedHeader::parse(&block[..read], self.file_size)?;
        self.seek(at, header.body_offset(self.file_size)).await?;

        sink.begin()?;
        let streamed = self.stream(at, sink, &header).await;
        if streamed.is_err() {
            sink.abort();
        }
        streamed
    }

    async fn stream<T: Transport>(
        &self,
        at: &mut AtEngine<T>,
        sink: &mut dyn FirmwareSink,
        header: &StagedHeader,
    ) -> Result<(), OtaError> {
        let mut hasher = Md5::new();
        let mut chunk = vec![0u8; CHUNK];
        let mut total: u32 = 0;

        while total < header.content_length {
            let wanted = CHUNK.min((header.content_length - total) as usize);
            let read = at
                .read_block(&self.read_command(wanted), &mut chunk, READ_TIMEOUT)
                .await?;
            if read == 0 {
                break;
            }
            hasher.update(&chunk[..read]);
            sink.write(&chunk[..read])?;
            total += read as u32;
            at.pause_ms(50).await;
        }
        if total < header.content_length {
            return Err(OtaError::Truncated {
                read: total,
                expected: header.content_length,
            });
        }

        let computed = hex::encode(hasher.finalize());
        if computed != header.md5 {
            return Err(OtaError::DigestMismatch {
                expected: header.md5.clone(),
                computed,
            });
        }
        sink.end()?;
        sink.set_boot_partition()?;
        Ok(())
    }

    async fn seek<T: Transport>(&self, at: &mut AtEngine<T>, offset: u32) -> Result<(), OtaError> {
        let command = format!("AT+QFSEEK={},{},0", self.handle, offset);
        at.transact(&Transaction::new(command, "OK"))
            .await
            .into_result()?;
        Ok(())
    }

    fn read_command(&self, length: usize) -> String {
        format!("AT+QFREAD={},{}", self.handle, length)
    }
}

/// Deletes the staging file if the modem lists it. False when it exists and could not be
/// deleted.
pub async fn delete_staged<T: Transport>(at: &mut AtEngine<T>, file: &str) -> bool {
    let list = Transaction::new(format!("AT+QFLST=\"{}\"", file), "+QFLST:");
    if !at.transact(&list).await.succeeded() {
        return true;
    }
    let deleted = at
        .transact(&Transaction::new(format!("AT+QFDEL=\"{}\"", file), "OK"))
        .await
        .succeeded();
    if !deleted {
        warn!("Failed to delete staged firmware {}", file);
    }
    deleted
}

/// Runs the whole update. The staged file is deleted afterwards whatever the outcome.
pub async fn update_firmware<T: Transport>(
    at: &mut AtEngine<T>,
    sink: &mut dyn FirmwareSink,
    request: UpdateRequest,
    config: &UpdateConfig,
) -> Result<(), OtaError> {
    let update = FirmwareUpdate::requested(request, config);
    let result = async {
        let staged = update.download(at).await?;
        let opened = staged.open(at).await?;
        opened.install(at, sink).await
    }
    .await;

    if let Err(e) = &result {
        warn!("Firmware update failed: {}", e);
    }
    delete_staged(at, &config.staging_file).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::testing::{ScriptedModem, SentLog};
    use crate::hal::{NoWatchdog, SystemClock};
    use crate::ota::testing::MemorySink;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn body() -> Vec<u8> {
        (0..5000u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn staged_file(body: &[u8], digest: &str) -> Vec<u8> {
        let mut file = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nlsx-md5: {}\r\n\r\n",
            body.len(),
            digest
        )
        .into_bytes();
        file.extend_from_slice(body);
        file
    }

    fn server(file: Vec<u8>) -> ScriptedModem {
        ScriptedModem::new()
            .on("AT+QHTTPURL", &["CONNECT"])
            .on("http://", &["OK"])
            .on("AT+QHTTPGET", &["OK", "+QHTTPGET: 0,200,5200"])
            .on("AT+QHTTPREADFILE", &["OK", "+QHTTPREADFILE: 0"])
            .default_ok()
            .with_file("firmware.bin", file)
    }

    fn engine(modem: ScriptedModem) -> (AtEngine<ScriptedModem>, SentLog) {
        let log = modem.log();
        let (tx, _rx) = mpsc::channel(4);
        let engine = AtEngine::new(modem, tx, Arc::new(SystemClock::new()), Arc::new(NoWatchdog));
        (engine, log)
    }

    fn request() -> UpdateRequest {
        UpdateRequest {
            product: "zhaga".into(),
            variant: "dali".into(),
            version: "2.4.1".into(),
            timeout_class: Some(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn matching_digest_installs_the_image() {
        let body = body();
        let digest = hex::encode(Md5::digest(&body));
        let (mut at, log) = engine(server(staged_file(&body, &digest)));
        let mut sink = MemorySink::default();

        update_firmware(&mut at, &mut sink, request(), &UpdateConfig::default())
            .await
            .unwrap();

        assert_eq!(sink.image(), body);
        assert!(sink.booted());
        assert!(log.contains("AT+QHTTPREADFILE=\"firmware.bin\",3600"));
        assert!(log.contains("AT+QFCLOSE=1"));
        assert!(log.contains("AT+QFDEL=\"firmware.bin\""));
    }

    #[tokio::test(start_paused = true)]
    async fn single_flipped_byte_is_rejected() {
        let body = body();
        let digest = hex::encode(Md5::digest(&body));
        let file = staged_file(&body, &digest);
        let last = file.len() - 1;
        let (mut at, log) = engine(server(file).corrupt_byte(last));
        let mut sink = MemorySink::default();

        let err = update_firmware(&mut at, &mut sink, request(), &UpdateConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, OtaError::DigestMismatch { .. }));
        assert!(!sink.booted());
        assert_eq!(sink.aborts(), INSTALL_ATTEMPTS);
        assert_eq!(log.count("AT+QFSEEK=1,0,0"), INSTALL_ATTEMPTS as usize);
        assert!(log.contains("AT+QFDEL=\"firmware.bin\""));
    }

    #[tokio::test(start_paused = true)]
    async fn http_error_stops_before_staging() {
        let modem = ScriptedModem::new()
            .on("AT+QHTTPURL", &["CONNECT"])
            .on("http://", &["OK"])
            .on("AT+QHTTPGET", &["OK", "+QHTTPGET: 0,404,0"])
            .default_ok();
        let (mut at, log) = engine(modem);
        let mut sink = MemorySink::default();

        let err = update_firmware(&mut at, &mut sink, request(), &UpdateConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, OtaError::HttpStatus(404)));
        assert!(!log.contains("AT+QHTTPREADFILE"));
        assert!(!log.contains("AT+QFOPEN"));
    }

    #[tokio::test(start_paused = true)]
    async fn staged_file_is_kept_only_when_listed() {
        let (mut at, log) = engine(ScriptedModem::new().on("AT+QFLST", &["+CME ERROR: 405"]));
        assert!(delete_staged(&mut at, "firmware.bin").await);
        assert!(!log.contains("AT+QFDEL"));

        let modem = ScriptedModem::new()
            .on("AT+QFLST", &["+QFLST: \"firmware.bin\",10", "OK"])
            .on("AT+QFDEL", &["+CME ERROR: 426"]);
        let (mut at, _) = engine(modem);
        assert!(!delete_staged(&mut at, "firmware.bin").await);
    }
}
