//! Inbound message handlers.
//!
//! Each key of an inbound document is handled in document order. Types the core owns act on
//! the supervisor directly and usually queue an acknowledgement on the outgoing channel;
//! the rest travel on unchanged to the incoming channel.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::codec::{self, MAX_DOCUMENT_KEYS};
use super::message_type::MessageType;
use crate::at::{Transaction, Transport};
use crate::connectivity::state::ConnectivityState;
use crate::connectivity::supervisor::{Exit, Supervisor, MIN_KEEPALIVE};
use crate::ota::{self, UpdateRequest};
use crate::persistence::{keys, KeyValueStore};

/// Pause between the keys of one document
const KEY_PAUSE_MS: u64 = 20;
/// Rule slots of the lighting controller; one is reserved
const MAX_RULES: usize = 16;
const MAX_AT_TIMEOUT_S: u32 = 600;
const MAX_AT_RESPONSE: usize = 255;
const NTP_REQUEST_TIMEOUT_MS: u64 = 120_000;

/// Body of a SEND_AT_COMMAND message
#[derive(Debug, Deserialize)]
struct AtPassthrough {
    #[serde(rename = "C")]
    command: String,
    #[serde(rename = "R")]
    expected: String,
    #[serde(rename = "T")]
    timeout_s: u32,
}

impl<T: Transport> Supervisor<T> {
    pub(crate) async fn dispatch_document(&mut self, text: &str) {
        let document = match codec::decode_document(text) {
            Ok(document) => document,
            Err(e) => {
                warn!("Dropping inbound document: {}", e);
                return;
            }
        };

        for (key, payload) in document.into_iter().take(MAX_DOCUMENT_KEYS) {
            let kind = MessageType::from_key(&key);
            debug!("Inbound {}", kind);
            self.dispatch(kind, key, payload).await;
            if self.exit.is_some() {
                return;
            }
            self.at.pause_ms(KEY_PAUSE_MS).await;
        }
    }

    async fn dispatch(&mut self, kind: MessageType, key: String, payload: Value) {
        match kind {
            MessageType::UpdateFirmware => self.run_update(payload).await,
            MessageType::SearchGpsAgain => self.search_position_again(&payload),
            MessageType::SetMasterSlave => self.set_master_slave(&payload).await,
            MessageType::LightSendQueryCommand => {
                self.to_outgoing(codec::raw_fragment(&key, &payload)).await;
            }
            MessageType::SyncWithNtpServer => {
                self.sync_ntp(NTP_REQUEST_TIMEOUT_MS).await;
                self.request_status().await;
            }
            MessageType::SetNtpServer => self.set_ntp_server(&payload).await,
            MessageType::OperatorsReport => {
                self.scan_operators().await;
                self.enter(ConnectivityState::CheckSubscription);
                self.to_outgoing(codec::empty_request(&kind)).await;
            }
            MessageType::SearchAndSelectOperator => {
                self.reselect_operator().await;
                self.request_status().await;
            }
            MessageType::SelectNewOperator => {
                self.select_new_operator(&payload).await;
                self.request_status().await;
            }
            MessageType::SendAtCommand => self.pass_through(payload).await,
            MessageType::ClearDevice | MessageType::ClearAndRestartDevice => {
                info!("Clearing stored settings");
                Self::persisted(self.store.clear(), "store");
                self.at.pause_ms(2500).await;
                self.to_incoming(codec::raw_fragment(&key, &payload)).await;
            }
            MessageType::RestartModem => self.restart_modem(true),
            MessageType::SetAutoNtpServerUpdate => self.set_auto_ntp(&payload).await,
            MessageType::SetKeepalive => self.set_keepalive(&payload).await,
            MessageType::InsertRule => self.insert_rules(&key, &payload).await,
            MessageType::InsertPos => self.insert_position(&key, &payload).await,
            MessageType::HanReport => debug!("Meter report request ignored"),
            kind if kind.is_core_report() => {
                self.to_outgoing(codec::empty_request(&kind)).await;
            }
            _ => {
                self.to_incoming(codec::raw_fragment(&key, &payload)).await;
            }
        }
    }

    async fn request_status(&mut self) {
        self.to_incoming(codec::empty_request(&MessageType::StatusReport))
            .await;
    }

    async fn run_update(&mut self, payload: Value) {
        let request: UpdateRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring update request: {}", e);
                return;
            }
        };
        info!(
            "Firmware update to {} {} {} requested",
            request.product, request.variant, request.version
        );

        self.unsubscribe().await;
        self.to_incoming(codec::empty_request(&MessageType::StoreBurnTimes))
            .await;
        self.at.pause_ms(5000).await;
        self.at.clear();

        let config = self.config.update.clone();
        let result =
            ota::update_firmware(&mut self.at, self.firmware.as_mut(), request.clone(), &config)
                .await;
        match result {
            Ok(()) => {
                info!("Firmware {} installed, restarting", request.version);
                self.exit = Some(Exit::Restart);
            }
            Err(e) => {
                let report = json!({
                    "R": 0,
                    "P": request.product,
                    "v": request.variant,
                    "V": request.version,
                    "E": e.to_string(),
                });
                self.to_outgoing(codec::fragment(&MessageType::UpdateFirmware, &report))
                    .await;
                self.at.pause_ms(6000).await;
                self.restart_modem(true);
            }
        }
    }

    fn search_position_again(&mut self, payload: &Value) {
        self.reset_gnss();
        self.gnss.retry_requested = true;
        self.gnss.use_xtra_on_search = payload.as_f64().is_some_and(|v| v != 0.0);
        self.enter(ConnectivityState::Gnss);
    }

    async fn set_master_slave(&mut self, payload: &Value) {
        let status = payload.get("S").and_then(Value::as_u64);
        if let Some(status) = status {
            let master = status == 2;
            if master != self.link.is_master {
                info!("Master role: {}", master);
                Self::persisted(self.store.set_bool(keys::MASTER, master), keys::MASTER);
            }
            self.link.is_master = master;
        }

        match (status, payload.get("MU").and_then(Value::as_str)) {
            (Some(1), Some(master_uid)) => self.follow_master(master_uid).await,
            _ if self.link.master_uid.is_some() => {
                info!("Leaving master group");
                Self::persisted(self.store.remove(keys::SLAVE_UID), keys::SLAVE_UID);
                self.unsubscribe_group().await;
                self.link.master_uid = None;
                self.restart_modem(true);
            }
            _ => {}
        }

        self.send_role_status().await;
        self.to_outgoing(codec::empty_request(&MessageType::RequestMasterSlave))
            .await;
    }

    /// Links this device as a slave of `master_uid`, re-subscribing as needed
    async fn follow_master(&mut self, master_uid: &str) {
        if master_uid.is_empty() {
            return;
        }
        let restarting = self.state == ConnectivityState::ModemRestart;
        if self.link.master_uid.as_deref() == Some(master_uid) {
            if !restarting {
                self.enter(ConnectivityState::CheckSubscription);
            }
            return;
        }

        info!("Following master {}", master_uid);
        Self::persisted(
            self.store.set_text(keys::SLAVE_UID, master_uid),
            keys::SLAVE_UID,
        );
        if self.link.master_uid.is_some() && !restarting {
            self.unsubscribe_group().await;
            self.restart_modem(true);
        } else if !restarting {
            self.enter(ConnectivityState::CheckSubscription);
        }
        self.link.master_uid = Some(master_uid.to_string());
    }

    async fn set_ntp_server(&mut self, payload: &Value) {
        if let Some(server) = payload.as_str() {
            if server != self.settings.ntp_server
                && self.sync_ntp_with(server, NTP_REQUEST_TIMEOUT_MS).await
            {
                self.settings.ntp_server = server.to_string();
                Self::persisted(
                    self.store.set_text(keys::NTP_SERVER, server),
                    keys::NTP_SERVER,
                );
            }
        }
        self.to_outgoing(codec::empty_request(&MessageType::NtpServerReport))
            .await;
    }

    async fn select_new_operator(&mut self, payload: &Value) {
        let previous = self.health.current().operator.clone();
        let Some(name) = payload.as_str() else {
            return;
        };
        if !self.select_operator(name).await && !previous.is_empty() {
            info!("Falling back to operator {}", previous);
            self.select_operator(&previous).await;
        }
    }

    async fn pass_through(&mut self, payload: Value) {
        let request: AtPassthrough = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring command request: {}", e);
                return;
            }
        };
        if request.timeout_s > MAX_AT_TIMEOUT_S {
            warn!("Command timeout {} s above limit", request.timeout_s);
            return;
        }

        let tx = Transaction::new(request.command, request.expected)
            .timeout_ms(u64::from(request.timeout_s) * 1000);
        let outcome = self.at.transact(&tx).await;
        if outcome.response.is_empty() {
            return;
        }
        let response: String = outcome.response.chars().take(MAX_AT_RESPONSE).collect();
        self.at_response = response.trim_end_matches('\r').to_string();
        self.to_outgoing(codec::empty_request(&MessageType::SendAtCommand))
            .await;
    }

    async fn set_auto_ntp(&mut self, payload: &Value) {
        if let Some(value) = payload.as_u64().filter(|v| *v < 2) {
            let auto = value == 1;
            if auto != self.settings.auto_ntp {
                Self::persisted(self.store.set_bool(keys::AUTO_NTP, auto), keys::AUTO_NTP);
            }
            self.settings.auto_ntp = auto;
        }
        let value = json!(u8::from(self.settings.auto_ntp));
        self.to_outgoing(codec::fragment(&MessageType::SetAutoNtpServerUpdate, &value))
            .await;
    }

    async fn set_keepalive(&mut self, payload: &Value) {
        let requested = payload
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v >= MIN_KEEPALIVE);
        if let Some(keepalive) = requested {
            if keepalive != self.settings.keepalive {
                info!("Keepalive {} -> {} s", self.settings.keepalive, keepalive);
                Self::persisted(
                    self.store.set_u32(keys::KEEPALIVE, keepalive),
                    keys::KEEPALIVE,
                );
                self.settings.keepalive = keepalive;
                self.restart_modem(false);
            }
        }
        let value = json!(self.settings.keepalive);
        self.to_outgoing(codec::fragment(&MessageType::SetKeepalive, &value))
            .await;
    }

    async fn insert_rules(&mut self, key: &str, payload: &Value) {
        let rules: Vec<&Value> = match payload {
            Value::Array(rules) => rules.iter().collect(),
            Value::Object(rules) => rules.values().collect(),
            _ => {
                debug!("Rule payload is not a collection, nothing to insert");
                return;
            }
        };
        for rule in rules.into_iter().take(MAX_RULES - 1) {
            self.to_incoming(codec::raw_fragment(key, rule)).await;
            self.at.pause_ms(10).await;
        }
    }

    async fn insert_position(&mut self, key: &str, payload: &Value) {
        self.to_incoming(codec::raw_fragment(key, payload)).await;
        self.gnss.found = true;
        self.gnss.cycles = 0;
        self.gnss.retry_requested = false;
        if self.gnss.xtra_enabled {
            self.gnss.xtra_enabled = false;
            self.restart_modem(true);
        }
    }
}
