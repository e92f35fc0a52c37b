//! Positioning phase.
//!
//! The step list is rebuilt every tick from the assistance-data flags, so steps that
//! only make sense with XTRA enabled simply do not exist otherwise.

use std::time::Duration;

use chrono::TimeDelta;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bringup::clock_is_stale;
use super::state::{ConnectivityState, Step};
use super::supervisor::Supervisor;
use super::timers::Deadline;
use crate::at::{parse, Transaction, Transport};
use crate::protocol::{codec, MessageType};

/// Acquisition cycles without a fix before assistance data is switched back on
const XTRA_AFTER_CYCLES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GnssStep {
    Begin,
    XtraTime,
    XtraInfo,
    XtraDownload,
    Start,
    Poll,
    Exit,
}

fn plan(xtra_enabled: bool, xtra_expired: bool) -> Vec<GnssStep> {
    let mut steps = vec![GnssStep::Begin];
    if xtra_enabled {
        steps.push(GnssStep::XtraTime);
        steps.push(GnssStep::XtraInfo);
        if xtra_expired {
            steps.push(GnssStep::XtraDownload);
        }
    }
    steps.extend([GnssStep::Start, GnssStep::Poll, GnssStep::Exit]);
    steps
}

impl<T: Transport> Supervisor<T> {
    pub(crate) async fn gnss_step(&mut self) -> Step {
        let steps = plan(self.gnss.xtra_enabled, self.gnss.xtra_expired);
        let step = steps
            .get(self.seq.step())
            .copied()
            .unwrap_or(GnssStep::Exit);

        match step {
            GnssStep::Begin => {
                self.gnss.cycles += 1;
                debug!("Positioning cycle {}", self.gnss.cycles);
                if self.gnss.cycles == 1
                    && self.gnss.xtra_enabled
                    && clock_is_stale(self.clock().now())
                {
                    info!("Clock not set, restarting without assistance data");
                    self.gnss.xtra_enabled = false;
                    return Step::Enter(ConnectivityState::ModemRestart);
                }
                Step::Advance
            }
            GnssStep::XtraTime => {
                self.gnss.xtra_expired = true;
                let query = Transaction::new("AT+QGPSXTRATIME?", "+QGPSXTRATIME:").forwarding();
                let outcome = self.at.transact(&query).await;
                if outcome.succeeded() && parse::xtra_time_missing(&outcome.response) {
                    let stamp = parse::xtra_time_stamp(self.clock().now());
                    self.send_ok(&format!("AT+QGPSXTRATIME=0,\"{}\"", stamp)).await;
                    self.at.transact(&query).await;
                }
                Step::Advance
            }
            GnssStep::XtraInfo => {
                let tx = Transaction::new("AT+QGPSCFG=\"xtra_info\"", "+QGPSCFG:");
                let outcome = self.at.transact(&tx).await;
                if outcome.succeeded() {
                    if let Some(left) = parse::xtra_time_left(&outcome.response) {
                        debug!("Assistance data valid for {} more minutes", left);
                        self.gnss.xtra_expired = left == 0;
                    }
                }
                Step::Advance
            }
            GnssStep::XtraDownload => {
                info!("Downloading assistance data");
                let tx = Transaction::new("AT+QGPSCFG=\"xtra_download\",1", "+QGPSURC:")
                    .timeout_ms(40_000);
                self.at.transact(&tx).await;
                Step::Advance
            }
            GnssStep::Start => {
                self.start_positioning().await;
                Step::Advance
            }
            GnssStep::Poll => self.poll_fix().await,
            GnssStep::Exit => self.leave_gnss().await,
        }
    }

    async fn start_positioning(&mut self) {
        let priority = Transaction::new("AT+QGPSCFG=\"priority\"", "+QGPSCFG:");
        self.send_ok("AT+QGPSCFG=\"priority\",0").await;
        if self.send_ok("AT+QGPS=1,3").await {
            self.at.pause_ms(7200).await;
        } else {
            // a session may still be running from before
            self.at.pause_ms(2000).await;
            self.send_ok("AT+QGPSEND").await;
            self.at.pause_ms(2000).await;
            self.send_ok("AT+QGPS=1,3").await;
            self.at.pause_ms(5000).await;
        }
        self.at.transact(&priority).await;
    }

    async fn poll_fix(&mut self) -> Step {
        self.gnss.last_poll = Some(Instant::now());
        let attempt = self.seq.take_attempt();
        let exhausted = attempt >= self.gnss.backoff.retries();

        let fix = if exhausted {
            None
        } else {
            let tx = Transaction::new("AT+QGPSLOC=2", "+QGPSLOC:").timeout_ms(5000);
            let outcome = self.at.transact(&tx).await;
            if !outcome.succeeded() {
                self.at.pause_ms(3000).await;
                self.refresh_deadline();
                return Step::Stay;
            }
            Some(outcome.response)
        };

        self.send_ok("AT+QGPSEND").await;
        let found = match fix {
            Some(response) => self.apply_fix(&response, Duration::ZERO).await,
            None => false,
        };
        if !found {
            self.gnss.found = false;
            warn!(
                "No position after {} polls (cycle {})",
                attempt, self.gnss.cycles
            );
            if self.gnss.use_xtra_on_search
                && self.gnss.cycles >= XTRA_AFTER_CYCLES
                && !self.gnss.xtra_enabled
            {
                info!("Enabling assistance data for the next search");
                self.gnss.xtra_enabled = true;
                self.restart_modem(true);
                return Step::Stay;
            }
        }
        Step::Advance
    }

    async fn leave_gnss(&mut self) -> Step {
        if !self.net.network_initialized {
            return Step::Enter(ConnectivityState::NetworkInit);
        }
        if self.net.mqtt_connected {
            return Step::Listen;
        }
        let priority = Transaction::new("AT+QGPSCFG=\"priority\",1", "OK").forwarding();
        self.at.transact(&priority).await;
        self.at.pause_ms(1000).await;
        let query = Transaction::new("AT+QGPSCFG=\"priority\"", "+QGPSCFG:").forwarding();
        self.at.transact(&query).await;
        Step::Enter(ConnectivityState::MqttConnect)
    }

    /// Takes a position line, sets the clock from it and posts the position.
    ///
    /// `age` is how long ago the fix was taken.
    pub(crate) async fn apply_fix(&mut self, response: &str, age: Duration) -> bool {
        let Some(fix) = parse::gnss_fix(response) else {
            warn!("Unreadable position: {}", response);
            return false;
        };
        self.gnss.found = true;
        self.gnss.cycles = 0;
        self.gnss.retry_requested = false;
        self.gnss.backoff.reset();

        let age = TimeDelta::from_std(age).unwrap_or(TimeDelta::zero());
        self.clock().set(fix.time + age);
        info!("Position {:.5}, {:.5}", fix.latitude, fix.longitude);

        let position = json!({ "Lat": fix.latitude, "Lon": fix.longitude });
        self.to_incoming(codec::fragment(&MessageType::InsertPos, &position))
            .await;
        true
    }

    /// Forgets the fix and starts over with the base retry budget
    pub(crate) fn reset_gnss(&mut self) {
        self.gnss.found = false;
        self.gnss.skip = false;
        self.gnss.cycles = 0;
        self.gnss.backoff.reset();
        self.timers.gnss_retry = Deadline::new(self.gnss.backoff.window());
    }

    /// Another positioning attempt from the listening phase, with a larger budget
    pub(crate) fn reconnect_gnss(&mut self) {
        self.gnss.backoff.on_failed_cycle(self.gnss.cycles);
        self.enter(ConnectivityState::Gnss);
        self.timers.gnss_retry.set_duration(self.gnss.backoff.window());
        debug!(
            "Positioning retry: {} polls, next window {:?}",
            self.gnss.backoff.retries(),
            self.gnss.backoff.window()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::testing::ScriptedModem;
    use crate::connectivity::backoff::GNSS_BASE_WINDOW;
    use crate::connectivity::supervisor::testing::{drain, harness};
    use crate::hal::DeviceClock;
    use chrono::{TimeZone, Utc};

    const FIX: &str = "+QGPSLOC: 101010.0,59.30000,18.00000,1.0,20.0,2,0.0,0.0,0.0,020325,05";

    #[test]
    fn plan_depends_on_assistance_flags() {
        assert_eq!(plan(false, true).len(), 4);
        assert_eq!(plan(true, false).len(), 6);
        assert_eq!(plan(true, true)[3], GnssStep::XtraDownload);
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_with_assistance_data() {
        let modem = ScriptedModem::new()
            .on(
                "AT+QGPSXTRATIME?",
                &["+QGPSXTRATIME: 0,\"2025/03/01,00:00:00\",10080", "OK"],
            )
            .on("AT+QGPSCFG=\"xtra_info\"", &["+QGPSCFG: \"xtra_info\",120,\"2025/03/01,00:00:00\"", "OK"])
            .on_sequence(
                "AT+QGPSLOC=2",
                &[&["+CME ERROR: 516"], &["+CME ERROR: 516"], &[FIX, "OK"]],
            )
            .default_ok();
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.gnss.xtra_enabled = true;
        s.enter(ConnectivityState::Gnss);

        for _ in 0..20 {
            s.tick().await;
            if s.state != ConnectivityState::Gnss {
                break;
            }
        }

        assert_eq!(s.state, ConnectivityState::NetworkInit);
        assert!(s.gnss.found);
        assert_eq!(s.gnss.cycles, 0);
        assert!(!h.log.contains("AT+QGPSCFG=\"xtra_download\""));
        assert_eq!(h.log.count("AT+QGPSLOC=2"), 3);

        let expected = Utc.with_ymd_and_hms(2025, 3, 2, 10, 10, 10).unwrap();
        assert!((h.clock.now() - expected).num_seconds().abs() <= 2);

        let incoming = drain(&mut h.app.incoming_rx);
        assert_eq!(incoming.len(), 1);
        let position: serde_json::Value = serde_json::from_str(&incoming[0]).unwrap();
        assert_eq!(position["0008"]["Lat"], 59.3);
        assert_eq!(position["0008"]["Lon"], 18.0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_assistance_time_is_injected() {
        let modem = ScriptedModem::new()
            .on_sequence(
                "AT+QGPSXTRATIME?",
                &[
                    &["+QGPSXTRATIME: 0,\"\"", "OK"],
                    &["+QGPSXTRATIME: 0,\"2025/03/01,00:00:00\",10080", "OK"],
                ],
            )
            .default_ok();
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.gnss.xtra_enabled = true;
        s.enter(ConnectivityState::Gnss);
        s.seq.advance();

        assert_eq!(s.gnss_step().await, Step::Advance);
        assert!(h.log.contains("AT+QGPSXTRATIME=0,\""));
        assert_eq!(h.log.count("AT+QGPSXTRATIME?"), 2);
        assert!(s.gnss.xtra_expired);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_search_turns_assistance_back_on() {
        let mut h = harness(ScriptedModem::new().default_ok());
        let s = &mut h.supervisor;
        s.gnss.cycles = 2;
        s.gnss.backoff.set_retries(0);
        s.enter(ConnectivityState::Gnss);

        for _ in 0..3 {
            s.tick().await;
        }

        assert_eq!(s.state, ConnectivityState::ModemRestart);
        assert!(s.gnss.xtra_enabled);
        assert!(s.net.activated_restart);
        assert!(!s.gnss.found);
        assert!(!h.log.contains("AT+QGPSLOC"));
        assert!(h.log.contains("AT+QGPSEND"));
    }

    #[tokio::test(start_paused = true)]
    async fn exit_depends_on_what_is_already_up() {
        let mut h = harness(ScriptedModem::new().default_ok());
        let s = &mut h.supervisor;
        s.net.network_initialized = true;
        assert_eq!(
            s.leave_gnss().await,
            Step::Enter(ConnectivityState::MqttConnect)
        );
        s.net.mqtt_connected = true;
        assert_eq!(s.leave_gnss().await, Step::Listen);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_and_reset_move_the_retry_window() {
        let mut h = harness(ScriptedModem::new());
        let s = &mut h.supervisor;
        s.gnss.cycles = 4;
        s.reconnect_gnss();
        assert_eq!(s.state, ConnectivityState::Gnss);
        assert_eq!(
            s.timers.gnss_retry.duration(),
            GNSS_BASE_WINDOW + Duration::from_secs(40 + 480)
        );
        assert_eq!(s.gnss.backoff.retries(), 82);

        s.reset_gnss();
        assert_eq!(s.timers.gnss_retry.duration(), GNSS_BASE_WINDOW);
        assert_eq!(s.gnss.cycles, 0);
    }
}
