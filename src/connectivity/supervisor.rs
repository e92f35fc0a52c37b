//! # Connectivity Supervisor
//!
//! ## Why This Module Exists
//! The modem is slow, stateful and unreliable. Every procedure against it (restart,
//! registration, positioning, session setup) is a sequence of transactions that can each
//! time out, fail or be cut short by a disconnect. The supervisor owns all of that state
//! in one struct and advances it once per tick, so a multi-minute bring-up never blocks
//! message handling for longer than a single transaction.
//!
//! ## Key Abstractions
//! - **Supervisor**: the single owner of the modem, timers, counters and message bus
//! - **Step**: what a phase handler asks for after a tick (stay, advance, leave)
//! - **ConnectivityHandle**: spawned task plus a watch on the published [`LinkStatus`]
//!
//! ## Phase Flow
//!
//! ```text
//!                  ┌──────────────┐ search again ┌──────┐
//!   startup ──────►│ ModemRestart ├─────────────►│ Gnss │
//!                  └──────┬───────┘              └──┬───┘
//!                         ▼                         │
//!                  ┌─────────────┐   no fix yet     │
//!                  │ NetworkInit ├─────────────────►│
//!                  └──────┬──────┘                  │
//!                         ▼                         │
//!                  ┌─────────────┐◄─────────────────┘
//!                  │ MqttConnect │
//!                  └──────┬──────┘
//!                         ▼
//!                  ┌────────────┐ timers  ┌───────────────────┐
//!                  │ MqttListen ├────────►│ CheckSubscription │
//!                  │            │◄────────┤ CheckConnection   │
//!                  └────────────┘         └───────────────────┘
//!
//!   any phase ── deadline expiry ──► ModemRestart (every 4th: Quarantine ──► ModemRestart)
//!   any phase ── disconnect line ──► ModemRestart
//! ```
//!
//! ## Tick Anatomy
//! Each tick first handles at most a few unsolicited lines, then the disconnect flag, the
//! unresponsive-modem check, the state deadline and the periodic NTP resync. Only then is
//! the current phase dispatched. A handler may call [`Supervisor::enter`] itself; the
//! [`Step`] it returns is then ignored because the phase changed underneath it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::{Escalation, GnssBackoff, POWER_DOWN_START};
use super::health::ConnectionHealth;
use super::loss_window::LossWindow;
use super::operators::OperatorList;
use super::state::{ConnectivityState, Step, StepSequencer};
use super::timers::{Deadline, Timers, LISTEN_ENTRY_CHECK};
use crate::at::{AtEngine, Transport, Unsolicited};
use crate::bus::{offer, MessageBus, OFFER_WAIT, PUBLISH_CAPACITY};
use crate::config::{Carrier, DeviceConfig};
use crate::hal::{DeviceClock, ModemPower, Watchdog};
use crate::ota::{self, FirmwareSink};
use crate::persistence::{keys, KeyValueStore, StoreError};
use crate::protocol::{codec, MessageType};

/// Smallest keep-alive the broker session accepts, in seconds
pub const MIN_KEEPALIVE: u32 = 120;
/// Unsolicited lines handled per tick before the phase runs
const UNSOLICITED_PER_TICK: usize = 8;

/// Hardware and storage the supervisor drives
pub struct Collaborators<T: Transport> {
    pub transport: T,
    pub power: Box<dyn ModemPower>,
    pub store: Box<dyn KeyValueStore>,
    pub firmware: Box<dyn FirmwareSink>,
    pub clock: Arc<dyn DeviceClock>,
    pub watchdog: Arc<dyn Watchdog>,
}

/// Why the supervisor loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    /// A new firmware image is active; the process should restart into it
    Restart,
}

/// Summary published to other subsystems after every tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: ConnectivityState,
    pub mqtt_connected: bool,
    pub gnss_found: bool,
}

/// Positioning search state
#[derive(Debug, Clone)]
pub(crate) struct GnssSearch {
    pub found: bool,
    /// Retries given up until the next explicit request
    pub skip: bool,
    /// Consecutive acquisition cycles without a fix
    pub cycles: u32,
    pub backoff: GnssBackoff,
    pub xtra_enabled: bool,
    pub xtra_expired: bool,
    pub use_xtra_on_search: bool,
    /// Route the next modem restart straight to positioning
    pub search_again: bool,
    /// A search was requested over the message protocol and has not produced a fix yet
    pub retry_requested: bool,
    pub last_poll: Option<tokio::time::Instant>,
}

impl Default for GnssSearch {
    fn default() -> Self {
        Self {
            found: false,
            skip: false,
            cycles: 0,
            backoff: GnssBackoff::default(),
            xtra_enabled: false,
            xtra_expired: true,
            use_xtra_on_search: true,
            search_again: false,
            retry_requested: false,
            last_poll: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NetworkFlags {
    pub mqtt_connected: bool,
    pub network_initialized: bool,
    /// The current restart was asked for on purpose; skips the operator rescan check
    pub activated_restart: bool,
    pub ntp_used: bool,
    /// Restarts since the session was last up
    pub restart_count: u32,
    pub no_service_retries: u32,
    pub try_new_operator: bool,
    pub carrier: Option<Carrier>,
}

impl Default for NetworkFlags {
    fn default() -> Self {
        Self {
            mqtt_connected: false,
            network_initialized: false,
            activated_restart: true,
            ntp_used: false,
            restart_count: 0,
            no_service_retries: 0,
            try_new_operator: false,
            carrier: None,
        }
    }
}

impl NetworkFlags {
    pub fn carrier_locked(&self) -> bool {
        self.carrier.as_ref().is_some_and(|c| c.locked)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct OperatorSearch {
    pub list: OperatorList,
    pub scan_tries: u32,
    pub select_tries: u32,
    pub last_scan: Option<tokio::time::Instant>,
}

/// Master/slave role; a slave follows the lux readings of `master_uid`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RoleLink {
    pub is_master: bool,
    pub master_uid: Option<String>,
}

impl RoleLink {
    fn load(store: &dyn KeyValueStore) -> Self {
        Self {
            is_master: store.get_bool(keys::MASTER).unwrap_or(false),
            master_uid: store.get_text(keys::SLAVE_UID).filter(|uid| !uid.is_empty()),
        }
    }

    /// 2 master, 1 slave, 0 standalone
    pub fn status(&self) -> u8 {
        if self.is_master {
            2
        } else if self.master_uid.is_some() {
            1
        } else {
            0
        }
    }

    /// Role as reported upstream: `{"S": status}` plus `"MU"` for a slave
    pub fn report(&self) -> serde_json::Value {
        match (&self.master_uid, self.status()) {
            (Some(master), 1) => serde_json::json!({ "S": 1, "MU": master }),
            (_, status) => serde_json::json!({ "S": status }),
        }
    }
}

/// Persisted session settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Settings {
    pub keepalive: u32,
    pub ntp_server: String,
    pub auto_ntp: bool,
}

impl Settings {
    fn load(store: &dyn KeyValueStore, config: &DeviceConfig) -> Self {
        Self {
            keepalive: store
                .get_u32(keys::KEEPALIVE)
                .filter(|k| *k >= MIN_KEEPALIVE)
                .unwrap_or(config.mqtt.default_keepalive),
            ntp_server: store
                .get_text(keys::NTP_SERVER)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| config.ntp.server.clone()),
            auto_ntp: store.get_bool(keys::AUTO_NTP).unwrap_or(config.ntp.auto_sync),
        }
    }
}

pub struct Supervisor<T: Transport> {
    pub(crate) at: AtEngine<T>,
    pub(crate) power: Box<dyn ModemPower>,
    pub(crate) store: Box<dyn KeyValueStore>,
    pub(crate) firmware: Box<dyn FirmwareSink>,
    pub(crate) bus: MessageBus,
    pub(crate) publish_rx: mpsc::Receiver<String>,
    pub(crate) config: DeviceConfig,
    pub(crate) state: ConnectivityState,
    pub(crate) seq: StepSequencer,
    epoch: u64,
    pub(crate) timers: Timers,
    pub(crate) escalation: Escalation,
    pub(crate) gnss: GnssSearch,
    pub(crate) net: NetworkFlags,
    pub(crate) operators: OperatorSearch,
    pub(crate) losses: LossWindow,
    pub(crate) health: ConnectionHealth,
    pub(crate) link: RoleLink,
    pub(crate) settings: Settings,
    /// First status report after boot carries the version and an update flag
    pub(crate) startup_ack: bool,
    /// Last passthrough command answer, reported on request
    pub(crate) at_response: String,
    /// A staged firmware file is left on the modem and must be deleted after restart
    pub(crate) staged_cleanup: bool,
    pub(crate) exit: Option<Exit>,
    status_tx: watch::Sender<LinkStatus>,
}

impl<T: Transport> Supervisor<T> {
    pub fn new(config: DeviceConfig, parts: Collaborators<T>, bus: MessageBus) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_CAPACITY);
        let at = AtEngine::new(parts.transport, publish_tx, parts.clock, parts.watchdog);
        let escalation = Escalation::default();
        let gnss = GnssSearch::default();
        let timers = Timers::new(escalation.state_timeout(), gnss.backoff.window());
        let settings = Settings::load(parts.store.as_ref(), &config);
        let link = RoleLink::load(parts.store.as_ref());
        let (status_tx, _) = watch::channel(LinkStatus::default());

        debug!(
            "Settings: keepalive {} s, ntp {} (auto {}), role {}",
            settings.keepalive,
            settings.ntp_server,
            settings.auto_ntp,
            link.status()
        );

        Self {
            at,
            power: parts.power,
            store: parts.store,
            firmware: parts.firmware,
            bus,
            publish_rx,
            config,
            state: ConnectivityState::default(),
            seq: StepSequencer::default(),
            epoch: 0,
            timers,
            escalation,
            gnss,
            net: NetworkFlags::default(),
            operators: OperatorSearch::default(),
            losses: LossWindow::default(),
            health: ConnectionHealth::default(),
            link,
            settings,
            startup_ack: true,
            at_response: String::new(),
            staged_cleanup: false,
            exit: None,
            status_tx,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn clock(&self) -> Arc<dyn DeviceClock> {
        self.at.clock().clone()
    }

    /// One-time bring-up before the first tick
    pub async fn startup(&mut self) {
        info!("Connectivity supervisor starting for device {}", self.config.uid);
        self.send_role_status().await;
        self.power_cycle(POWER_DOWN_START, false, true).await;
        let staging = self.config.update.staging_file.clone();
        if !ota::delete_staged(&mut self.at, &staging).await {
            self.staged_cleanup = true;
        }
        self.gnss.xtra_enabled = true;
    }

    /// Runs until cancelled or until a firmware update asks for a restart
    pub async fn run(mut self, cancel: CancellationToken) -> Exit {
        tokio::select! {
            _ = cancel.cancelled() => return Exit::Shutdown,
            _ = self.startup() => {}
        }
        let tick = Duration::from_millis(self.config.runtime.tick_ms);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Connectivity supervisor stopping");
                    return Exit::Shutdown;
                }
                _ = self.tick() => {}
            }
            if let Some(exit) = self.exit.take() {
                info!("Connectivity supervisor exiting: {:?}", exit);
                return exit;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Exit::Shutdown,
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    pub async fn tick(&mut self) {
        self.preamble().await;
        self.at.reset_disconnected();

        let dispatched = self.state;
        let epoch = self.epoch;
        let step = match dispatched {
            ConnectivityState::ModemRestart => self.modem_restart().await,
            ConnectivityState::NetworkInit => self.network_init().await,
            ConnectivityState::Gnss => self.gnss_step().await,
            ConnectivityState::MqttConnect => self.mqtt_connect().await,
            ConnectivityState::MqttListen => self.mqtt_listen().await,
            ConnectivityState::CheckSubscription => self.check_subscription().await,
            ConnectivityState::CheckConnection => self.check_connection().await,
            ConnectivityState::Quarantine => self.quarantine().await,
        };
        if self.epoch == epoch {
            self.apply(step);
        }
        // both phases reboot or reconfigure the modem, which announces itself again
        if matches!(dispatched, ConnectivityState::ModemRestart | ConnectivityState::Gnss) {
            self.at.reset_disconnected();
        }
        self.publish_status();
    }

    async fn preamble(&mut self) {
        for _ in 0..UNSOLICITED_PER_TICK {
            match self.at.poll_unsolicited().await {
                None => break,
                Some(Unsolicited::Disconnect(line)) => info!("Session lost: {}", line),
                Some(_) => {}
            }
        }

        if self.at.is_disconnected() {
            info!("Disconnected flag set in {}", self.state);
            self.restart_modem(false);
        }

        if self.at.is_unresponsive() {
            warn!("Modem unresponsive for {:?}", self.at.silence());
            if self.escalation.on_unresponsive() {
                self.cold_boot().await;
            } else {
                self.power_cycle(POWER_DOWN_START, true, false).await;
            }
            self.net.activated_restart = false;
        }

        if self.timers.state.is_up() {
            let next = self.escalation.on_state_expired();
            warn!(
                "Deadline expired in {} (expiry {}), going to {}",
                self.state,
                self.escalation.expiries(),
                next
            );
            self.enter(next);
            self.net.activated_restart = false;
        }

        if self.settings.auto_ntp
            && self.net.mqtt_connected
            && self.timers.ntp_sync.is_up_then_restart()
            && self.state != ConnectivityState::Gnss
        {
            self.sync_ntp(10_000).await;
        }
    }

    fn publish_status(&self) {
        let status = LinkStatus {
            state: self.state,
            mqtt_connected: self.net.mqtt_connected,
            gnss_found: self.gnss.found,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Switches phase, restarting its step sequence and deadline
    pub(crate) fn enter(&mut self, next: ConnectivityState) {
        if self.state != next {
            info!("Connectivity {} -> {}", self.state, next);
        }
        self.state = next;
        self.seq.reset();
        self.epoch += 1;
        self.refresh_deadline();
    }

    /// Next sub-operation of the current phase
    pub(crate) fn proceed(&mut self) {
        self.seq.advance();
        self.refresh_deadline();
    }

    pub(crate) fn refresh_deadline(&mut self) {
        self.timers.state.restart_with(self.escalation.state_timeout());
    }

    pub(crate) fn restart_modem(&mut self, on_purpose: bool) {
        self.enter(ConnectivityState::ModemRestart);
        self.net.activated_restart = on_purpose;
    }

    /// Enters the listening phase with the first health checks shortly after
    pub(crate) fn enter_listen(&mut self) {
        self.enter(ConnectivityState::MqttListen);
        self.timers.check_subscription = Deadline::new(LISTEN_ENTRY_CHECK);
        self.timers.check_connection = Deadline::new(LISTEN_ENTRY_CHECK);
        self.timers.gnss_retry.restart();
        self.net.mqtt_connected = true;
        self.net.activated_restart = false;
    }

    fn apply(&mut self, step: Step) {
        match step {
            Step::Stay => {}
            Step::Advance => self.proceed(),
            Step::Enter(next) => self.enter(next),
            Step::Listen => self.enter_listen(),
        }
    }

    /// Gives a failed sub-operation a few more tries once restarts have started piling up.
    ///
    /// True when the step should be skipped anyway.
    pub(crate) async fn fall_through(&mut self) -> bool {
        self.at.pause_ms(3000).await;
        if self.escalation.expiries() >= 2 {
            self.refresh_deadline();
            self.seq.bump() >= 4
        } else {
            false
        }
    }

    pub(crate) async fn to_incoming(&mut self, fragment: String) -> bool {
        offer(&self.bus.incoming, fragment, OFFER_WAIT).await
    }

    pub(crate) async fn to_outgoing(&mut self, fragment: String) -> bool {
        offer(&self.bus.outgoing, fragment, OFFER_WAIT).await
    }

    pub(crate) async fn send_role_status(&mut self) {
        let status = serde_json::json!({ "S": self.link.status() });
        self.to_incoming(codec::fragment(&MessageType::SetMasterSlave, &status))
            .await;
    }

    /// Logs a failed store write; the in-memory value stays authoritative
    pub(crate) fn persisted(result: Result<(), StoreError>, key: &str) {
        if let Err(e) = result {
            warn!("Failed to persist {}: {}", key, e);
        }
    }
}

/// A running supervisor task
pub struct ConnectivityHandle {
    status: watch::Receiver<LinkStatus>,
    task: JoinHandle<Exit>,
}

impl ConnectivityHandle {
    pub fn spawn<T: Transport + 'static>(
        supervisor: Supervisor<T>,
        cancel: CancellationToken,
    ) -> Self {
        let status = supervisor.subscribe();
        let task = tokio::spawn(supervisor.run(cancel));
        info!("Connectivity task spawned");
        Self { status, task }
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    pub async fn join(self) -> Exit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!("Connectivity task failed: {}", e);
                Exit::Shutdown
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::at::testing::{ScriptedModem, SentLog};
    use crate::bus::ApplicationEnd;
    use crate::hal::{NoPowerKey, NoWatchdog, SystemClock};
    use crate::ota::testing::MemorySink;
    use crate::persistence::MemoryStore;

    pub struct Harness {
        pub supervisor: Supervisor<ScriptedModem>,
        pub app: ApplicationEnd,
        pub log: SentLog,
        pub sink: MemorySink,
        pub clock: Arc<SystemClock>,
    }

    pub fn config() -> DeviceConfig {
        DeviceConfig {
            uid: "00AA11BB".to_string(),
            ..DeviceConfig::default()
        }
    }

    pub fn harness(modem: ScriptedModem) -> Harness {
        harness_with_store(modem, MemoryStore::new())
    }

    pub fn harness_with_store(modem: ScriptedModem, store: MemoryStore) -> Harness {
        let log = modem.log();
        let sink = MemorySink::default();
        let clock = Arc::new(SystemClock::new());
        let (bus, app) = MessageBus::new(128);
        let parts = Collaborators {
            transport: modem,
            power: Box::new(NoPowerKey),
            store: Box::new(store),
            firmware: Box::new(sink.clone()),
            clock: clock.clone(),
            watchdog: Arc::new(NoWatchdog),
        };
        Harness {
            supervisor: Supervisor::new(config(), parts, bus),
            app,
            log,
            sink,
            clock,
        }
    }

    pub fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::at::testing::ScriptedModem;
    use crate::persistence::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn settings_come_from_the_store() {
        let mut store = MemoryStore::new();
        store.set_u32(keys::KEEPALIVE, 90).unwrap();
        store.set_text(keys::NTP_SERVER, "pool.ntp.org").unwrap();
        store.set_bool(keys::AUTO_NTP, false).unwrap();
        store.set_text(keys::SLAVE_UID, "FF00").unwrap();

        let h = harness_with_store(ScriptedModem::new(), store);
        let s = &h.supervisor;
        // below the minimum, so the default wins
        assert_eq!(s.settings.keepalive, 360);
        assert_eq!(s.settings.ntp_server, "pool.ntp.org");
        assert!(!s.settings.auto_ntp);
        assert_eq!(s.link.master_uid.as_deref(), Some("FF00"));
        assert_eq!(s.link.status(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_escalates_to_quarantine() {
        let mut h = harness(ScriptedModem::new());
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::NetworkInit);

        for expected in [
            ConnectivityState::ModemRestart,
            ConnectivityState::ModemRestart,
            ConnectivityState::ModemRestart,
            ConnectivityState::Quarantine,
        ] {
            s.state = ConnectivityState::NetworkInit;
            tokio::time::advance(s.timers.state.duration()).await;
            s.preamble().await;
            assert_eq!(s.state, expected);
        }
        assert_eq!(s.timers.state.duration(), Duration::from_millis(35_000));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_line_restarts_the_modem() {
        let modem = ScriptedModem::new().unsolicited("+QMTSTAT: 0,1");
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.enter_listen();
        s.preamble().await;
        assert_eq!(s.state, ConnectivityState::ModemRestart);
        assert!(!s.net.activated_restart);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_transitions_win_over_returned_steps() {
        let mut h = harness(ScriptedModem::new());
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::CheckConnection);
        let epoch = s.epoch;
        s.restart_modem(true);
        assert_ne!(epoch, s.epoch);
        assert_eq!(s.seq.step(), 0);
        assert!(s.net.activated_restart);
    }

    #[tokio::test(start_paused = true)]
    async fn listen_entry_arms_health_checks() {
        let mut h = harness(ScriptedModem::new());
        let s = &mut h.supervisor;
        let mut status = s.subscribe();
        s.enter_listen();
        s.publish_status();

        assert!(status.has_changed().unwrap());
        let seen = status.borrow_and_update().clone();
        assert_eq!(seen.state, ConnectivityState::MqttListen);
        assert!(seen.mqtt_connected);

        tokio::time::advance(LISTEN_ENTRY_CHECK).await;
        assert!(s.timers.check_connection.is_up());
        assert!(s.timers.check_subscription.is_up());
    }
}
