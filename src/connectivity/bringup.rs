//! Modem restart, network registration and operator management.
//!
//! ```text
//! ModemRestart:  gnss config ─► CFUN=1,1 ─► NetworkInit | Gnss
//!
//! NetworkInit:   gnss priority (+ operator rescan on frequent losses)
//!                ─► CCID / carrier ─► CREG ─► CEREG ─► CGREG URCs
//!                ─► wait for service ─► wait for registration
//!                ─► IMSI ─► APN ─► PDP activate ─► IP (+ first NTP)
//!                ─► Gnss | MqttConnect
//! ```

use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, info, warn};

use super::state::{ConnectivityState, Step};
use super::supervisor::Supervisor;
use crate::at::{parse, Transaction, Transport};
use crate::ota;

/// Device time before this year means the clock was never set
const TRUSTED_YEAR: i32 = 2024;
/// Restarts with a stale clock tolerated before positioning is tried first
const STALE_RESTARTS: u32 = 4;
/// Poll budget given to a positioning search forced by a stale clock
const STALE_CLOCK_RETRIES: u32 = 126;
const RESCAN_AFTER: Duration = Duration::from_secs(12 * 3600);
const MAX_SCAN_TRIES: u32 = 3;
const MAX_SELECT_TRIES: u32 = 4;
const SERVICE_BASE_BUDGET: u32 = 13;
const SERVICE_BUDGET_STEP: u32 = 14;
const REGISTRATION_BASE_BUDGET: u32 = 30;
const REGISTRATION_BUDGET_STEP: u32 = 25;
const REGISTRATION_PREFIXES: [&str; 3] = ["+CGREG", "+CEREG", "+CREG"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStep {
    GnssPriority,
    ReadCcid,
    GsmUrc,
    EpsUrc,
    GprsUrc,
    AwaitService,
    AwaitRegistration,
    ReadImsi,
    SetApn,
    ActivatePdp,
    ReadAddress,
}

const INIT_STEPS: [InitStep; 11] = [
    InitStep::GnssPriority,
    InitStep::ReadCcid,
    InitStep::GsmUrc,
    InitStep::EpsUrc,
    InitStep::GprsUrc,
    InitStep::AwaitService,
    InitStep::AwaitRegistration,
    InitStep::ReadImsi,
    InitStep::SetApn,
    InitStep::ActivatePdp,
    InitStep::ReadAddress,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServiceCheck {
    Found,
    NoService,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reselect {
    Selected,
    /// The carrier does not allow manual selection
    Skipped,
    Failed,
}

impl Reselect {
    fn succeeded(self) -> bool {
        matches!(self, Reselect::Selected | Reselect::Skipped)
    }
}

pub(crate) fn clock_is_stale(now: DateTime<Utc>) -> bool {
    now.year() < TRUSTED_YEAR
}

impl<T: Transport> Supervisor<T> {
    /// Plain command expecting OK within the default timeout
    pub(crate) async fn send_ok(&mut self, command: &str) -> bool {
        self.at
            .transact(&Transaction::new(command, "OK"))
            .await
            .succeeded()
    }

    async fn step_or_fall_through(&mut self, done: bool) -> Step {
        if done || self.fall_through().await {
            Step::Advance
        } else {
            Step::Stay
        }
    }

    pub(crate) async fn modem_restart(&mut self) -> Step {
        self.net.mqtt_connected = false;
        self.net.network_initialized = false;

        let stale = clock_is_stale(self.clock().now());
        let restarted_often = stale && {
            let before = self.net.restart_count;
            self.net.restart_count += 1;
            before >= STALE_RESTARTS
        };
        if restarted_often && !self.gnss.found && self.gnss.cycles < 4 {
            self.gnss.xtra_enabled = false;
            self.gnss.backoff.set_retries(STALE_CLOCK_RETRIES);
            self.gnss.search_again = !self.gnss.search_again;
            debug!("Stale clock, search again: {}", self.gnss.search_again);
        } else {
            self.gnss.search_again = false;
        }

        if self.seq.step() == 0 {
            self.send_ok("AT+QGPSCFG=\"gnssconfig\",3").await;
            if self.gnss.xtra_enabled {
                self.send_ok("AT+QGPSXTRA=1").await;
                self.send_ok("AT+QGPSCFG=\"xtrafilesize\",1").await;
            } else {
                self.send_ok("AT+QGPSXTRA=0").await;
            }
            return Step::Advance;
        }

        let reset = Transaction::new("AT+CFUN=1,1", "APP RDY").timeout_ms(80_000);
        if !self.at.transact(&reset).await.succeeded() {
            return Step::Stay;
        }
        self.escalation.clear_unresponsive();
        if self.staged_cleanup {
            self.at.pause_ms(300).await;
            let staging = self.config.update.staging_file.clone();
            self.staged_cleanup = !ota::delete_staged(&mut self.at, &staging).await;
        }
        if self.gnss.search_again {
            Step::Enter(ConnectivityState::Gnss)
        } else {
            Step::Enter(ConnectivityState::NetworkInit)
        }
    }

    pub(crate) async fn network_init(&mut self) -> Step {
        let Some(step) = INIT_STEPS.get(self.seq.step()).copied() else {
            return Step::Enter(ConnectivityState::MqttConnect);
        };
        match step {
            InitStep::GnssPriority => {
                self.send_ok("AT+QGPSCFG=\"priority\",1").await;
                self.at.pause_ms(1000).await;
                self.at
                    .transact(&Transaction::new("AT+QGPSCFG=\"priority\"", "+QGPSCFG:"))
                    .await;
                self.proceed();
                if self.net.activated_restart {
                    self.net.activated_restart = false;
                } else {
                    let tripped = self.losses.record(self.clock().now());
                    if tripped || self.timers.last_connected.is_up() {
                        info!("Connection lost too often, trying another operator");
                        self.losses.clear();
                        self.timers.last_connected.restart();
                        self.reselect_operator().await;
                    }
                }
                Step::Stay
            }
            InitStep::ReadCcid => {
                let outcome = self.at.transact(&Transaction::new("AT+QCCID", "+QCCID:")).await;
                let ccid = outcome
                    .succeeded()
                    .then(|| parse::ccid(&outcome.response))
                    .flatten();
                match ccid {
                    Some(ccid) => {
                        let carrier = self.config.network.carrier_for(&ccid);
                        info!("SIM {} on carrier {}", ccid, carrier.name);
                        self.health.set_ccid(ccid);
                        self.net.carrier = Some(carrier);
                        Step::Advance
                    }
                    None => self.step_or_fall_through(false).await,
                }
            }
            InitStep::GsmUrc => {
                let done = self.send_ok("AT+CREG=2").await;
                self.step_or_fall_through(done).await
            }
            InitStep::EpsUrc => {
                let done = self.net.carrier_locked() || self.send_ok("AT+CEREG=2").await;
                self.step_or_fall_through(done).await
            }
            InitStep::GprsUrc => {
                let done = self.send_ok("AT+CGREG=2").await;
                self.step_or_fall_through(done).await
            }
            InitStep::AwaitService => self.await_service().await,
            InitStep::AwaitRegistration => {
                if self.is_registered().await {
                    return Step::Advance;
                }
                let budget = REGISTRATION_BASE_BUDGET
                    + REGISTRATION_BUDGET_STEP * self.escalation.expiries();
                if self.seq.bump() >= budget {
                    warn!("Not registered after {} polls, continuing", budget);
                    return Step::Advance;
                }
                self.at.pause_ms(8000).await;
                self.refresh_deadline();
                Step::Stay
            }
            InitStep::ReadImsi => {
                let done = self.send_ok("AT+CIMI").await;
                self.step_or_fall_through(done).await
            }
            InitStep::SetApn => {
                let apn = match &self.net.carrier {
                    Some(carrier) => carrier.apn.clone(),
                    None => self.config.network.default_apn.clone(),
                };
                let command = format!("AT+QICSGP=1,1,\"{}\",\"\",\"\",1", apn);
                let done = self.send_ok(&command).await;
                self.step_or_fall_through(done).await
            }
            InitStep::ActivatePdp => {
                let done = self.send_ok("AT+QIACT=1").await;
                self.step_or_fall_through(done).await
            }
            InitStep::ReadAddress => {
                let done = self.query_pdp_address().await;
                if !done && !self.fall_through().await {
                    return Step::Stay;
                }
                if !self.net.ntp_used {
                    let server = self.settings.ntp_server.clone();
                    self.sync_ntp_with(&server, 60_000).await;
                }
                self.net.network_initialized = true;
                self.net.mqtt_connected = false;
                if !self.gnss.found && self.gnss.cycles == 0 {
                    Step::Enter(ConnectivityState::Gnss)
                } else {
                    Step::Enter(ConnectivityState::MqttConnect)
                }
            }
        }
    }

    async fn await_service(&mut self) -> Step {
        self.refresh_deadline();
        self.at.pause_ms(2000).await;

        let mut step = Step::Stay;
        if self.query_network_info().await == ServiceCheck::Found {
            self.at.pause_ms(2000).await;
            self.net.no_service_retries = 0;
            self.net.try_new_operator = false;
            self.operators.scan_tries = 0;
            self.operators.select_tries = 0;
            step = Step::Advance;
        }

        if self.net.no_service_retries >= 2 || self.state == ConnectivityState::Quarantine {
            if self.net.try_new_operator {
                self.net.no_service_retries = 1;
            }
            self.net.no_service_retries += 1;
            if self.net.no_service_retries >= 2 && self.reselect_operator().await.succeeded() {
                self.net.no_service_retries = 0;
                self.net.try_new_operator = !self.net.carrier_locked();
            }
        }
        step
    }

    async fn is_registered(&mut self) -> bool {
        for prefix in REGISTRATION_PREFIXES {
            let command = format!("AT{}?", prefix);
            let expected = format!("{}:", prefix);
            let outcome = self
                .at
                .transact(&Transaction::new(command, expected.clone()))
                .await;
            if !outcome.succeeded() {
                return false;
            }
            if parse::registered(&outcome.response, &expected) {
                debug!("Registered: {}", outcome.response);
                return true;
            }
        }
        false
    }

    /// Reads technology, operator and band; escalates on "No Service"
    pub(crate) async fn query_network_info(&mut self) -> ServiceCheck {
        let tx = Transaction::new("AT+QNWINFO", "+QNWINFO:").forwarding();
        let outcome = self.at.transact(&tx).await;
        if !outcome.succeeded() {
            return ServiceCheck::Failed;
        }
        if parse::no_service(&outcome.response) {
            let attempt = self.seq.take_attempt();
            let budget = SERVICE_BASE_BUDGET + SERVICE_BUDGET_STEP * self.net.no_service_retries;
            if attempt >= budget {
                warn!("No service after {} polls", attempt);
                self.enter(ConnectivityState::Quarantine);
            } else {
                let delay = 4000 + 4000 * u64::from(attempt);
                debug!("No service, next poll in {} ms", delay);
                self.at.pause_ms(delay).await;
            }
            self.refresh_deadline();
            return ServiceCheck::NoService;
        }
        if let Some(info) = parse::network_info(&outcome.response) {
            debug!("On {} via {} ({})", info.operator, info.tech, info.channel);
            self.health.set_network(info);
        }
        ServiceCheck::Found
    }

    pub(crate) async fn query_pdp_address(&mut self) -> bool {
        let tx = Transaction::new("AT+QIACT?", "+QIACT:").forwarding();
        let outcome = self.at.transact(&tx).await;
        if !outcome.succeeded() {
            return false;
        }
        if let Some(ip) = parse::pdp_address(&outcome.response) {
            self.health.set_ip(ip);
        }
        true
    }

    /// True when the signal quality is known
    pub(crate) async fn measure_signal(&mut self) -> bool {
        let tx = Transaction::new("AT+CSQ", "+CSQ:").forwarding();
        let outcome = self.at.transact(&tx).await;
        if !outcome.succeeded() {
            return false;
        }
        match parse::signal_rssi(&outcome.response) {
            Some(rssi) => {
                self.health.set_rssi(rssi);
                if rssi == parse::RSSI_UNKNOWN {
                    self.at.pause_ms(1000).await;
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    pub(crate) async fn sync_ntp(&mut self, timeout_ms: u64) -> bool {
        let server = self.settings.ntp_server.clone();
        self.sync_ntp_with(&server, timeout_ms).await
    }

    /// Asks the modem for network time; the engine sets the clock from the answer
    pub(crate) async fn sync_ntp_with(&mut self, server: &str, timeout_ms: u64) -> bool {
        let command = format!("AT+QNTP=1,\"{}\"", server);
        let tx = Transaction::new(command, "+QNTP:")
            .timeout_ms(timeout_ms)
            .forwarding();
        let outcome = self.at.transact(&tx).await;
        let synced = outcome.confirms("+QNTP: 0,") && parse::ntp_time(&outcome.response).is_some();
        if synced {
            self.net.ntp_used = true;
            info!("Clock synced from {}", server);
        } else {
            warn!("NTP sync with {} failed: {}", server, outcome.response);
        }
        synced
    }

    /// Rebuilds the operator list when it is empty or older than half a day
    pub(crate) async fn scan_operators(&mut self) {
        if self.net.carrier_locked() {
            return;
        }
        let fresh = self
            .operators
            .last_scan
            .is_some_and(|at| at.elapsed() < RESCAN_AFTER);
        if !self.operators.list.is_empty() && fresh {
            return;
        }

        let timeout = 1_600_000 + 300_000 * u64::from(self.operators.scan_tries);
        info!("Scanning operators (up to {} s)", timeout / 1000);
        self.operators.list.clear();
        let tx = Transaction::new("AT+COPS=?", "+COPS:").timeout_ms(timeout);
        let outcome = self.at.transact(&tx).await;
        if outcome.succeeded() {
            self.operators
                .list
                .rebuild(parse::scanned_operators(&outcome.response));
            self.operators.last_scan = Some(tokio::time::Instant::now());
            info!("Found {} operators", self.operators.list.len());
            self.refresh_deadline();
        } else {
            self.operators.scan_tries = (self.operators.scan_tries + 1).min(MAX_SCAN_TRIES);
        }
    }

    /// Manually selects `short_name`; restarts network init on success
    pub(crate) async fn select_operator(&mut self, short_name: &str) -> bool {
        let command = format!("AT+COPS=1,2,\"{}\"", short_name);
        let timeout = 210_000 + 30_000 * u64::from(self.operators.select_tries);
        let tx = Transaction::new(command.clone(), "OK").timeout_ms(timeout);
        if !self.at.transact(&tx).await.succeeded() {
            self.operators.select_tries = (self.operators.select_tries + 1).min(MAX_SELECT_TRIES);
            warn!("Selecting operator {} failed", short_name);
            return false;
        }

        info!("Selected operator {}", short_name);
        self.at.pause_ms(5000).await;
        self.at
            .transact(&Transaction::new("AT+CFUN=1,1", "APP RDY").timeout_ms(60_000))
            .await;
        self.at
            .transact(&Transaction::new(command, "OK").timeout_ms(60_000))
            .await;
        self.at.reset_disconnected();
        self.enter(ConnectivityState::NetworkInit);
        self.net.activated_restart = true;
        true
    }

    /// Scans if needed and tries the next operator of the list
    pub(crate) async fn reselect_operator(&mut self) -> Reselect {
        if self.net.carrier_locked() {
            return Reselect::Skipped;
        }
        self.scan_operators().await;
        let result = match self.operators.list.next_candidate() {
            Some(candidate) => {
                if self.select_operator(&candidate).await {
                    Reselect::Selected
                } else {
                    Reselect::Failed
                }
            }
            None => Reselect::Failed,
        };
        self.at.pause_ms(5000).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::testing::ScriptedModem;
    use crate::connectivity::supervisor::testing::harness;
    use crate::hal::DeviceClock;
    use chrono::TimeZone;

    fn trusted_clock(h: &crate::connectivity::supervisor::testing::Harness) {
        h.clock.set(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_configures_gnss_then_resets() {
        let modem = ScriptedModem::new()
            .default_ok()
            .on("AT+CFUN=1,1", &["OK", "APP RDY"]);
        let mut h = harness(modem);
        trusted_clock(&h);
        let s = &mut h.supervisor;
        s.gnss.xtra_enabled = true;

        s.tick().await;
        assert_eq!(s.seq.step(), 1);
        assert!(h.log.contains("AT+QGPSXTRA=1"));

        s.tick().await;
        assert_eq!(s.state, ConnectivityState::NetworkInit);
        assert!(!s.at.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_clock_toggles_search_again() {
        let mut h = harness(ScriptedModem::new().default_ok());
        h.clock.set(Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());
        let s = &mut h.supervisor;
        s.seq.advance();

        let mut toggles = Vec::new();
        for _ in 0..6 {
            s.modem_restart().await;
            toggles.push(s.gnss.search_again);
        }
        assert_eq!(toggles, [false, false, false, false, true, false]);
        assert_eq!(s.gnss.backoff.retries(), 120);
        assert!(!s.gnss.xtra_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn ccid_selects_the_carrier() {
        let modem = ScriptedModem::new().on("AT+QCCID", &["+QCCID: 89450421180216000000", "OK"]);
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::NetworkInit);
        s.seq.advance();

        assert_eq!(s.network_init().await, Step::Advance);
        assert!(s.net.carrier_locked());
        assert_eq!(s.health.current().ccid, "89450421180216000000");
    }

    #[tokio::test(start_paused = true)]
    async fn locked_carrier_skips_eps_urc_and_scans() {
        let modem = ScriptedModem::new()
            .on("AT+QCCID", &["+QCCID: 89450421180216000000", "OK"])
            .default_ok();
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::NetworkInit);
        s.seq.advance();
        s.network_init().await;
        s.seq.advance();
        s.seq.advance();

        assert_eq!(s.network_init().await, Step::Advance);
        assert!(!h.log.contains("AT+CEREG=2"));
        assert_eq!(s.reselect_operator().await, Reselect::Skipped);
        assert!(!h.log.contains("AT+COPS"));
    }

    #[tokio::test(start_paused = true)]
    async fn no_service_budget_ends_in_quarantine() {
        let modem = ScriptedModem::new().on("AT+QNWINFO", &["+QNWINFO: No Service", "OK"]);
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::NetworkInit);
        for _ in 0..5 {
            s.seq.advance();
        }

        let mut polls = 0;
        while s.state == ConnectivityState::NetworkInit {
            assert_eq!(s.network_init().await, Step::Stay);
            polls += 1;
            assert!(polls <= 14);
        }
        assert_eq!(polls, 14);
        assert_eq!(s.state, ConnectivityState::Quarantine);
    }

    #[tokio::test(start_paused = true)]
    async fn service_found_records_the_network() {
        let modem = ScriptedModem::new()
            .on("AT+QNWINFO", &["+QNWINFO: \"eMTC\",\"24001\",\"LTE BAND 20\",6300", "OK"]);
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::NetworkInit);
        for _ in 0..5 {
            s.seq.advance();
        }
        s.net.no_service_retries = 1;

        assert_eq!(s.network_init().await, Step::Advance);
        assert_eq!(s.health.current().operator, "24001");
        assert_eq!(s.net.no_service_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn address_step_syncs_time_and_picks_the_next_phase() {
        let modem = ScriptedModem::new()
            .on("AT+QIACT?", &["+QIACT: 1,1,1,\"10.64.12.7\"", "OK"])
            .on("AT+QNTP", &["OK", "+QNTP: 0,\"2025/03/01,12:00:00+00\""]);
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::NetworkInit);
        for _ in 0..10 {
            s.seq.advance();
        }

        assert_eq!(s.network_init().await, Step::Enter(ConnectivityState::Gnss));
        assert_eq!(s.health.current().ip, "10.64.12.7");
        assert!(s.net.ntp_used);
        assert!(s.net.network_initialized);

        s.gnss.found = true;
        s.net.ntp_used = true;
        assert_eq!(
            s.network_init().await,
            Step::Enter(ConnectivityState::MqttConnect)
        );
        assert_eq!(h.log.count("AT+QNTP"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_selection_round_robins_and_reinitializes() {
        let scan = "+COPS: (2,\"Telia\",\"Telia\",\"24001\",7),(1,\"Tele2\",\"Tele2\",\"24007\",8),,(0-4),(0-2)";
        let modem = ScriptedModem::new()
            .on("AT+COPS=?", &[scan, "OK"])
            .on("AT+COPS=1,2", &["OK"])
            .on("AT+CFUN=1,1", &["OK", "APP RDY"]);
        let mut h = harness(modem);
        let s = &mut h.supervisor;

        assert_eq!(s.reselect_operator().await, Reselect::Selected);
        assert_eq!(s.state, ConnectivityState::NetworkInit);
        assert!(s.net.activated_restart);
        assert_eq!(s.reselect_operator().await, Reselect::Selected);

        let selects: Vec<_> = h
            .log
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("AT+COPS=1,2"))
            .collect();
        assert_eq!(
            selects,
            [
                "AT+COPS=1,2,\"24001\"",
                "AT+COPS=1,2,\"24001\"",
                "AT+COPS=1,2,\"24007\"",
                "AT+COPS=1,2,\"24007\""
            ]
        );
        // the list was fresh, so only one scan
        assert_eq!(h.log.count("AT+COPS=?"), 1);
    }
}
