//! Command transaction engine.
//!
//! One [`AtEngine`] owns the modem transport. `transact` writes a command and polls for
//! response lines until the expected token (and OK, when required) arrived or the deadline
//! passed. Lines that belong to nobody in particular are handled inline: inbound publishes
//! go to the publish channel, time answers set the device clock, disconnect indications
//! latch a flag the state machine reads after the call returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::classify::{classify, LineAction, ERROR_MARKER, OK_MARKER};
use super::error::AtError;
use super::parse;
use super::transport::Transport;
use crate::bus::{offer, OFFER_WAIT};
use crate::hal::{DeviceClock, Watchdog};

pub const POLL_INTERVAL: Duration = Duration::from_millis(30);
pub const LINE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(40);
pub const MAX_LINE_LEN: usize = 2048;
/// Sent-ahead-of-received gap after which the modem counts as unresponsive
pub const UNRESPONSIVE_AFTER: Duration = Duration::from_secs(5);

const CTRL_Z: char = '\u{1a}';

/// One command/response exchange
#[derive(Debug, Clone)]
pub struct Transaction {
    pub command: String,
    pub expected: String,
    pub timeout: Duration,
    pub require_ok: bool,
    pub forward_publishes: bool,
    pub abort_on_disconnect: bool,
}

impl Transaction {
    /// Expects `expected` followed by OK within the default 40 s
    pub fn new(command: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            expected: expected.into(),
            timeout: DEFAULT_TIMEOUT,
            require_ok: true,
            forward_publishes: false,
            abort_on_disconnect: false,
        }
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout = Duration::from_millis(ms);
        self
    }

    pub fn without_ok(mut self) -> Self {
        self.require_ok = false;
        self
    }

    pub fn forwarding(mut self) -> Self {
        self.forward_publishes = true;
        self
    }

    pub fn aborting(mut self) -> Self {
        self.abort_on_disconnect = true;
        self
    }

    /// Session-level exchanges: forward publishes and give up on disconnects
    pub fn session(self) -> Self {
        self.forwarding().aborting()
    }
}

/// Result of [`AtEngine::transact`]
#[derive(Debug, Default)]
pub struct Outcome {
    pub ok_found: bool,
    pub expected_found: bool,
    pub require_ok: bool,
    pub response: String,
    pub error: Option<AtError>,
}

impl Outcome {
    fn pending(require_ok: bool) -> Self {
        Self {
            require_ok,
            ..Self::default()
        }
    }

    fn complete(&self) -> bool {
        (self.ok_found || !self.require_ok) && self.expected_found
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.complete()
    }

    /// True when it succeeded and the captured response contains `needle`
    pub fn confirms(&self, needle: &str) -> bool {
        self.succeeded() && self.response.contains(needle)
    }

    pub fn into_result(self) -> Result<String, AtError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.response),
        }
    }
}

/// Lines seen outside of any transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Unsolicited {
    Publish,
    Disconnect(String),
    NetworkTime,
    Other(String),
}

enum LineVerdict {
    Continue,
    Stop,
}

pub struct AtEngine<T: Transport> {
    transport: T,
    publish_tx: mpsc::Sender<String>,
    clock: Arc<dyn DeviceClock>,
    watchdog: Arc<dyn Watchdog>,
    disconnected: bool,
    created: Instant,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
}

impl<T: Transport> AtEngine<T> {
    pub fn new(
        transport: T,
        publish_tx: mpsc::Sender<String>,
        clock: Arc<dyn DeviceClock>,
        watchdog: Arc<dyn Watchdog>,
    ) -> Self {
        Self {
            transport,
            publish_tx,
            clock,
            watchdog,
            disconnected: false,
            created: Instant::now(),
            last_sent: None,
            last_received: None,
        }
    }

    pub fn clock(&self) -> &Arc<dyn DeviceClock> {
        &self.clock
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn reset_disconnected(&mut self) {
        self.disconnected = false;
    }

    /// How far the last send is ahead of the last received line, if it is
    pub fn silence(&self) -> Option<Duration> {
        let sent = self.last_sent?;
        let received = self.last_received.unwrap_or(self.created);
        (sent > received).then(|| sent - received)
    }

    pub fn is_unresponsive(&self) -> bool {
        self.silence().is_some_and(|gap| gap >= UNRESPONSIVE_AFTER)
    }

    pub fn mark_alive(&mut self) {
        self.last_received = Some(Instant::now());
    }

    pub fn clear(&mut self) {
        self.transport.clear();
    }

    pub fn has_input(&mut self) -> bool {
        self.transport.available() > 0
    }

    pub fn send(&mut self, line: &str) -> Result<(), AtError> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.transport.send(&bytes)?;
        self.last_sent = Some(Instant::now());
        Ok(())
    }

    /// Next line without its terminator. Oversized and non-UTF-8 lines are dropped.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, AtError> {
        let raw = self.transport.read_line(timeout)?;
        if raw.is_empty() {
            return Ok(None);
        }
        self.last_received = Some(Instant::now());
        if raw.len() > MAX_LINE_LEN {
            warn!("Dropping oversized line of {} bytes", raw.len());
            return Ok(None);
        }
        match String::from_utf8(raw) {
            Ok(line) => Ok(Some(line.trim_end_matches(['\r', '\n']).to_string())),
            Err(_) => {
                debug!("Dropping malformed line");
                Ok(None)
            }
        }
    }

    /// Sleeps while keeping the watchdog fed
    pub async fn pause(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            self.watchdog.feed();
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep((deadline - now).min(Duration::from_millis(100))).await;
        }
    }

    pub async fn pause_ms(&mut self, ms: u64) {
        self.pause(Duration::from_millis(ms)).await;
    }

    pub async fn transact(&mut self, tx: &Transaction) -> Outcome {
        let mut outcome = Outcome::pending(tx.require_ok);
        if let Err(e) = self.send(&tx.command) {
            warn!("Failed to send {}: {}", tx.command, e);
            outcome.error = Some(e);
            return outcome;
        }

        let expect_ok = tx.expected == OK_MARKER;
        let echo = tx.command.trim_end_matches(CTRL_Z).trim();
        let mut echo_seen = false;
        let deadline = Instant::now() + tx.timeout;

        while Instant::now() < deadline {
            self.watchdog.feed();
            if self.transport.available() == 0 {
                sleep(POLL_INTERVAL).await;
                continue;
            }
            let line = match self.read_line(LINE_TIMEOUT) {
                Ok(Some(line)) => line,
                Ok(None) => continue,
                Err(e) => {
                    outcome.error = Some(e);
                    return outcome;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            if !echo_seen && !echo.is_empty() && line.contains(echo) {
                echo_seen = true;
                continue;
            }
            if let LineVerdict::Stop = self.process_line(tx, &line, expect_ok, &mut outcome).await
            {
                return outcome;
            }
            if outcome.complete() {
                return outcome;
            }
        }

        debug!("Timeout on {} waiting for {}", tx.command, tx.expected);
        outcome.error = Some(AtError::Timeout {
            command: tx.command.clone(),
            expected: tx.expected.clone(),
        });
        outcome
    }

    async fn process_line(
        &mut self,
        tx: &Transaction,
        line: &str,
        expect_ok: bool,
        outcome: &mut Outcome,
    ) -> LineVerdict {
        let mut matched = false;
        for action in classify(line, &tx.expected) {
            matched = true;
            match action {
                LineAction::Fail => {
                    debug!("{} answered {}", tx.command, line);
                    outcome.response = line.to_string();
                    outcome.error = Some(AtError::Modem {
                        command: tx.command.clone(),
                        line: line.to_string(),
                    });
                    return LineVerdict::Stop;
                }
                LineAction::LatchDisconnect => {
                    warn!("Disconnect indication: {}", line);
                    self.disconnected = true;
                    if tx.abort_on_disconnect {
                        outcome.error = Some(AtError::Disconnected {
                            command: tx.command.clone(),
                            line: line.to_string(),
                        });
                        return LineVerdict::Stop;
                    }
                }
                LineAction::ForwardPublish => {
                    if tx.forward_publishes {
                        offer(&self.publish_tx, line.to_string(), OFFER_WAIT).await;
                        return LineVerdict::Continue;
                    }
                }
                LineAction::ApplyNetworkTime => {
                    if let Some(time) = parse::ntp_time(line) {
                        self.clock.set(time);
                    }
                }
                LineAction::MatchExpected => {
                    if !outcome.expected_found {
                        outcome.expected_found = true;
                        if expect_ok {
                            outcome.ok_found = true;
                            if outcome.response.is_empty() {
                                outcome.response = line.to_string();
                            }
                        } else {
                            outcome.response = line.to_string();
                        }
                    }
                    return LineVerdict::Continue;
                }
                LineAction::MatchOk => {
                    if tx.require_ok {
                        outcome.ok_found = true;
                    }
                }
            }
        }
        if !matched && expect_ok && outcome.response.is_empty() {
            outcome.response = line.to_string();
        }
        LineVerdict::Continue
    }

    /// Handles at most one line that arrived outside a transaction
    pub async fn poll_unsolicited(&mut self) -> Option<Unsolicited> {
        if self.transport.available() == 0 {
            return None;
        }
        let line = match self.read_line(LINE_TIMEOUT) {
            Ok(Some(line)) if !line.trim().is_empty() => line,
            Ok(_) => return None,
            Err(e) => {
                warn!("Unsolicited read failed: {}", e);
                return None;
            }
        };
        for action in classify(&line, "") {
            match action {
                LineAction::LatchDisconnect => {
                    warn!("Disconnect indication: {}", line);
                    self.disconnected = true;
                    return Some(Unsolicited::Disconnect(line.clone()));
                }
                LineAction::ForwardPublish => {
                    offer(&self.publish_tx, line.clone(), OFFER_WAIT).await;
                    return Some(Unsolicited::Publish);
                }
                LineAction::ApplyNetworkTime => {
                    if let Some(time) = parse::ntp_time(&line) {
                        self.clock.set(time);
                    }
                    return Some(Unsolicited::NetworkTime);
                }
                _ => {}
            }
        }
        debug!("Unsolicited: {}", line);
        Some(Unsolicited::Other(line))
    }

    /// Sends `command` and reads the raw block announced by `CONNECT <n>` into `buf`.
    ///
    /// Used for file reads, where binary data follows the announcement line.
    pub async fn read_block(
        &mut self,
        command: &str,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, AtError> {
        self.send(command)?;
        let deadline = Instant::now() + timeout;
        let mut announced: Option<usize> = None;

        while Instant::now() < deadline {
            self.watchdog.feed();
            match announced {
                None if self.transport.available() > 0 => {
                    let Some(line) = self.read_line(LINE_TIMEOUT)? else {
                        continue;
                    };
                    if line.contains(ERROR_MARKER) {
                        return Err(AtError::Modem {
                            command: command.to_string(),
                            line,
                        });
                    }
                    if let Some(length) = parse::block_length(&line) {
                        if length > buf.len() {
                            return Err(AtError::BlockTooLarge {
                                announced: length,
                                capacity: buf.len(),
                            });
                        }
                        announced = Some(length);
                    }
                    continue;
                }
                Some(length) if self.transport.available() >= length => {
                    let read = self
                        .transport
                        .read_exact_within(&mut buf[..length], LINE_TIMEOUT)?;
                    self.last_received = Some(Instant::now());
                    self.transport.clear();
                    return Ok(read);
                }
                _ => {}
            }
            sleep(POLL_INTERVAL).await;
        }
        Err(AtError::Timeout {
            command: command.to_string(),
            expected: "CONNECT".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::testing::ScriptedModem;
    use crate::hal::{NoWatchdog, SystemClock};
    use chrono::{TimeZone, Utc};

    fn engine(modem: ScriptedModem) -> (AtEngine<ScriptedModem>, mpsc::Receiver<String>, Arc<SystemClock>) {
        let (tx, rx) = mpsc::channel(4);
        let clock = Arc::new(SystemClock::new());
        let engine = AtEngine::new(modem, tx, clock.clone(), Arc::new(NoWatchdog));
        (engine, rx, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn expected_token_and_ok_succeed() {
        let modem = ScriptedModem::new().on("AT+CSQ", &["+CSQ: 20,99", "OK"]);
        let (mut engine, _rx, _) = engine(modem);

        let outcome = engine.transact(&Transaction::new("AT+CSQ", "+CSQ:")).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.response, "+CSQ: 20,99");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ok_fails_only_when_required() {
        let modem = ScriptedModem::new().on("AT+QMTOPEN", &["+QMTOPEN: 0,0"]);
        let (mut engine, _rx, _) = engine(modem);

        let strict = Transaction::new("AT+QMTOPEN=0,\"h\",1883", "+QMTOPEN:").timeout_ms(2000);
        let outcome = engine.transact(&strict).await;
        assert!(!outcome.succeeded());
        assert!(matches!(outcome.error, Some(AtError::Timeout { .. })));
        assert!(outcome.expected_found);

        let relaxed = strict.clone().without_ok();
        assert!(engine.transact(&relaxed).await.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn error_line_fails_immediately() {
        let modem = ScriptedModem::new().on("AT+QIACT=1", &["+CME ERROR: 30", "OK"]);
        let (mut engine, _rx, _) = engine(modem);

        let started = Instant::now();
        let outcome = engine.transact(&Transaction::new("AT+QIACT=1", "OK")).await;
        assert!(matches!(outcome.error, Some(AtError::Modem { .. })));
        assert_eq!(outcome.response, "+CME ERROR: 30");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_latches_and_aborts_on_request() {
        let modem = ScriptedModem::new().on("AT+QMTSUB", &["+QMTSTAT: 0,1", "+QMTSUB: 0,1,0,2", "OK"]);
        let (mut engine, _rx, _) = engine(modem);

        let tx = Transaction::new("AT+QMTSUB=0,1,\"t\",2", "+QMTSUB:").aborting();
        let outcome = engine.transact(&tx).await;
        assert!(matches!(outcome.error, Some(AtError::Disconnected { .. })));
        assert!(engine.is_disconnected());

        engine.reset_disconnected();
        engine.clear();
        let tx = Transaction::new("AT+QMTSUB=0,1,\"t\",2", "+QMTSUB:");
        assert!(engine.transact(&tx).await.succeeded());
        assert!(engine.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn app_ready_is_both_disconnect_and_expected() {
        let modem = ScriptedModem::new().on("AT+CFUN=1,1", &["OK", "APP RDY"]);
        let (mut engine, _rx, _) = engine(modem);

        let outcome = engine
            .transact(&Transaction::new("AT+CFUN=1,1", "APP RDY").timeout_ms(60000))
            .await;
        assert!(outcome.succeeded());
        assert!(engine.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_are_forwarded_without_completing() {
        let publish = "+QMTRECV: 0,1,\"d/down/push\",\"{\"0009\":1}\"";
        let modem = ScriptedModem::new().on("AT+QMTCONN?", &[publish, "+QMTCONN: 0,3", "OK"]);
        let (mut engine, mut rx, _) = engine(modem);

        let tx = Transaction::new("AT+QMTCONN?", "+QMTCONN:").forwarding();
        let outcome = engine.transact(&tx).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.response, "+QMTCONN: 0,3");
        assert_eq!(rx.try_recv().unwrap(), publish);
    }

    #[tokio::test(start_paused = true)]
    async fn ntp_line_sets_the_clock() {
        let modem = ScriptedModem::new().on(
            "AT+QNTP",
            &["OK", "+QNTP: 0,\"2031/02/03,04:05:06+00\""],
        );
        let (mut engine, _rx, clock) = engine(modem);

        let tx = Transaction::new("AT+QNTP=1,\"ntp.se\"", "+QNTP:");
        assert!(engine.transact(&tx).await.succeeded());
        let expected = Utc.with_ymd_and_hms(2031, 2, 3, 4, 5, 6).unwrap();
        assert!((clock.now() - expected).num_seconds().abs() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ok_transactions_capture_the_first_data_line() {
        let modem = ScriptedModem::new().on("AT+CIMI", &["240075812345678", "OK"]);
        let (mut engine, _rx, _) = engine(modem);

        let outcome = engine.transact(&Transaction::new("AT+CIMI", "OK")).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.response, "240075812345678");
    }

    #[tokio::test(start_paused = true)]
    async fn echo_is_never_mistaken_for_the_answer() {
        // echo of a passthrough command contains the expected text
        let modem = ScriptedModem::new();
        let (mut engine, _rx, _) = engine(modem);

        let tx = Transaction::new("AT+QGPSCFG=\"priority\"", "QGPSCFG").timeout_ms(1000);
        let outcome = engine.transact(&tx).await;
        assert!(!outcome.expected_found);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_the_modem_looking_unresponsive() {
        let modem = ScriptedModem::new().without_echo();
        let (mut engine, _rx, _) = engine(modem);

        let tx = Transaction::new("AT", "OK").timeout_ms(6000);
        assert!(!engine.transact(&tx).await.succeeded());
        tokio::time::advance(Duration::from_secs(6)).await;
        engine.send("AT").unwrap();
        assert!(engine.is_unresponsive());

        engine.mark_alive();
        assert!(!engine.is_unresponsive());
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_lines_are_routed() {
        let modem = ScriptedModem::new()
            .unsolicited("+QIURC: \"pdpdeact\",1")
            .unsolicited("+QMTRECV: 0,1,\"d/down/push\",\"{}\"");
        let (mut engine, mut rx, _) = engine(modem);

        assert!(matches!(engine.poll_unsolicited().await, Some(Unsolicited::Disconnect(_))));
        assert!(engine.is_disconnected());
        assert_eq!(engine.poll_unsolicited().await, Some(Unsolicited::Publish));
        assert!(rx.try_recv().is_ok());
        assert_eq!(engine.poll_unsolicited().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn raw_blocks_follow_connect() {
        let content: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let modem = ScriptedModem::new().with_file("firmware.bin", content.clone());
        let (mut engine, _rx, _) = engine(modem);

        let mut buf = vec![0u8; 4096];
        let read = engine
            .read_block("AT+QFREAD=1,2048", &mut buf, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(read, 2048);
        assert_eq!(&buf[..read], &content[..2048]);

        let mut small = vec![0u8; 16];
        let err = engine
            .read_block("AT+QFREAD=1,2048", &mut small, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AtError::BlockTooLarge { .. }));
    }
}
