//! Broker session phases.
//!
//! ```text
//! MqttConnect:        keepalive → open → connect → subscribe → signal
//! MqttListen:         health timers, positioning retry, one inbound publish or one
//!                     outbound batch per tick
//! CheckSubscription:  re-subscribe, 3 failures restart the modem
//! CheckConnection:    session state → network info → address → signal
//! ```

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::state::{ConnectivityState, Step};
use super::supervisor::Supervisor;
use super::timers::{CHECK_CONNECTION_INTERVAL, CHECK_SUBSCRIPTION_INTERVAL};
use crate::at::{Transaction, Transport};
use crate::protocol::codec::{self, MAX_DOCUMENT_KEYS};
use crate::protocol::outbound::{lux_relay, OutboundBatch, ReportContext};

const PUBLISH_ATTEMPTS: u32 = 4;
const SUBSCRIBE_FAILURES: u32 = 3;
/// Failed positioning retries from the listening phase before the search is given up
const GNSS_GIVE_UP_CYCLES: u32 = 8;
/// Inbound traffic pushes the next positioning retry back by this much
const GNSS_RETRY_POSTPONE: Duration = Duration::from_secs(5);
/// Wait for each further fragment of an outbound batch
const BATCH_WAIT: Duration = Duration::from_secs(1);

impl<T: Transport> Supervisor<T> {
    pub(crate) async fn mqtt_connect(&mut self) -> Step {
        match self.seq.step() {
            0 => {
                let command = format!("AT+QMTCFG=\"keepalive\",0,{}", self.settings.keepalive);
                self.send_ok(&command).await;
                Step::Advance
            }
            1 => {
                let mqtt = &self.config.mqtt;
                let command = format!("AT+QMTOPEN=0,\"{}\",{}", mqtt.host, mqtt.port);
                let tx = Transaction::new(command, "+QMTOPEN:")
                    .timeout_ms(160_000)
                    .without_ok()
                    .session();
                let outcome = self.at.transact(&tx).await;
                if outcome.confirms("+QMTOPEN: 0,0") {
                    Step::Advance
                } else {
                    warn!("Opening broker connection failed: {}", outcome.response);
                    self.at.pause_ms(2000).await;
                    Step::Stay
                }
            }
            2 => {
                let mqtt = &self.config.mqtt;
                let command = format!(
                    "AT+QMTCONN=0,\"{}\",\"{}\",\"{}\"",
                    mqtt.client_id(&self.config.uid),
                    mqtt.username,
                    mqtt.password
                );
                let tx = Transaction::new(command, "+QMTCONN:")
                    .timeout_ms(80_000)
                    .without_ok()
                    .session();
                let outcome = self.at.transact(&tx).await;
                if outcome.confirms("+QMTCONN: 0,0,0") {
                    info!("Broker session up");
                    Step::Advance
                } else {
                    warn!("Broker connect refused: {}", outcome.response);
                    self.at.pause_ms(2000).await;
                    Step::Stay
                }
            }
            3 => {
                if self.subscribe_topics().await {
                    Step::Advance
                } else {
                    self.at.pause_ms(2000).await;
                    Step::Stay
                }
            }
            4 => {
                if self.measure_signal().await || self.fall_through().await {
                    Step::Advance
                } else {
                    Step::Stay
                }
            }
            _ => Step::Listen,
        }
    }

    pub(crate) async fn mqtt_listen(&mut self) -> Step {
        self.escalation.reset();
        self.net.restart_count = 0;

        if self.timers.check_connection.is_up() {
            return Step::Enter(ConnectivityState::CheckConnection);
        }
        if self.timers.check_subscription.is_up() {
            return Step::Enter(ConnectivityState::CheckSubscription);
        }
        self.timers.last_connected.restart();

        if !self.gnss.skip && !self.gnss.found && self.timers.gnss_retry.is_up() {
            self.retry_positioning();
        } else if let Ok(line) = self.publish_rx.try_recv() {
            self.handle_publish(&line).await;
        } else if let Ok(fragment) = self.bus.outgoing_rx.try_recv() {
            self.publish_outgoing(fragment).await;
        } else {
            self.refresh_deadline();
        }
        Step::Stay
    }

    fn retry_positioning(&mut self) {
        if self.gnss.cycles < GNSS_GIVE_UP_CYCLES {
            self.reconnect_gnss();
            return;
        }
        info!("No position after {} cycles, giving up", self.gnss.cycles);
        self.gnss.cycles = 0;
        self.gnss.skip = true;
        if self.gnss.xtra_enabled {
            self.gnss.xtra_enabled = false;
            self.restart_modem(true);
        }
    }

    async fn handle_publish(&mut self, line: &str) {
        debug!("Inbound: {}", line);
        if !self.gnss.found {
            self.timers.gnss_retry.postpone(GNSS_RETRY_POSTPONE);
        }

        let mqtt = &self.config.mqtt;
        let device_token = format!("{}\",\"", mqtt.downlink_suffix);
        let group_token = format!("{}\",\"", mqtt.group_suffix);
        let payload = codec::publish_payload(line, &device_token).or_else(|e| {
            if self.link.master_uid.is_some() {
                codec::publish_payload(line, &group_token)
            } else {
                Err(e)
            }
        });
        match payload {
            Ok(payload) => self.dispatch_document(payload).await,
            Err(e) => {
                debug!("Ignoring publish: {}", e);
                self.refresh_deadline();
            }
        }
    }

    pub(crate) fn report_context(&self) -> ReportContext {
        ReportContext {
            version: self.config.reported_version(),
            startup_ack: self.startup_ack,
            timestamp: self.clock().now().timestamp(),
            is_master: self.link.is_master,
            role: self.link.report(),
            ntp_server: self.settings.ntp_server.clone(),
            operators: self
                .operators
                .list
                .entries()
                .iter()
                .map(|o| format!("{}, {}", o.long_name, o.short_name))
                .collect(),
            at_response: self.at_response.clone(),
        }
    }

    /// Drains the outgoing channel into one document and publishes it
    async fn publish_outgoing(&mut self, first: String) {
        let context = self.report_context();
        let mut batch = OutboundBatch::new();
        batch.merge(&first, &context, &mut self.health);

        let mut extra = 0;
        while extra < MAX_DOCUMENT_KEYS && batch.has_room() {
            match timeout(BATCH_WAIT, self.bus.outgoing_rx.recv()).await {
                Ok(Some(fragment)) => {
                    batch.merge(&fragment, &context, &mut self.health);
                    extra += 1;
                }
                _ => break,
            }
        }

        if let Some(payload) = batch.to_payload() {
            let topic = self.config.mqtt.uplink_topic(&self.config.uid);
            if self.publish(&topic, &payload).await {
                if batch.status_included() {
                    self.startup_ack = false;
                }
            } else if batch.status_included() {
                self.health.forget_shadow();
            }
        }

        if let Some(reading) = batch.lux() {
            let topic = self.config.mqtt.group_topic(&self.config.uid);
            self.publish(&topic, &lux_relay(&reading)).await;
        }
        self.refresh_deadline();
    }

    /// Publishes `payload` on `topic`; after repeated failures the subscription is checked
    pub(crate) async fn publish(&mut self, topic: &str, payload: &str) -> bool {
        let prompt = Transaction::new(format!("AT+QMTPUB=0,0,0,0,\"{}\"", topic), ">")
            .timeout_ms(40_000)
            .without_ok()
            .session();
        let body = Transaction::new(format!("{}\u{1a}", payload), "+QMTPUB:")
            .timeout_ms(60_000)
            .session();

        for attempt in 1..=PUBLISH_ATTEMPTS {
            if self.at.is_disconnected() {
                break;
            }
            if self.at.transact(&prompt).await.succeeded() {
                let outcome = self.at.transact(&body).await;
                if outcome.confirms("+QMTPUB: 0,0,0") {
                    debug!("Published {} bytes on {}", payload.len(), topic);
                    return true;
                }
                warn!("Publish attempt {} failed: {}", attempt, outcome.response);
            }
            self.at.pause_ms(3000).await;
        }

        self.at.pause_ms(2000).await;
        self.enter(ConnectivityState::CheckSubscription);
        false
    }

    async fn subscribe_topic(&mut self, topic: &str) -> bool {
        let tx = Transaction::new(format!("AT+QMTSUB=0,1,\"{}\",2", topic), "+QMTSUB:")
            .timeout_ms(80_000)
            .session();
        let outcome = self.at.transact(&tx).await;
        let ok = outcome.confirms("+QMTSUB: 0,1,0,2");
        if !ok {
            warn!("Subscribing {} failed: {}", topic, outcome.response);
        }
        ok
    }

    /// Device topic, plus the master's group topic when linked as a slave
    pub(crate) async fn subscribe_topics(&mut self) -> bool {
        let device = self.config.mqtt.device_topic(&self.config.uid);
        if !self.subscribe_topic(&device).await {
            return false;
        }
        match self.link.master_uid.clone() {
            Some(master) => {
                let group = self.config.mqtt.group_topic(&master);
                self.subscribe_topic(&group).await
            }
            None => true,
        }
    }

    async fn unsubscribe_topic(&mut self, topic: &str) -> bool {
        let tx = Transaction::new(format!("AT+QMTUNS=0,1,\"{}\"", topic), "+QMTUNS:")
            .timeout_ms(60_000)
            .without_ok()
            .aborting();
        self.at.transact(&tx).await.confirms("+QMTUNS: 0,1,0")
    }

    pub(crate) async fn unsubscribe_group(&mut self) -> bool {
        match self.link.master_uid.clone() {
            Some(master) => {
                let group = self.config.mqtt.group_topic(&master);
                self.unsubscribe_topic(&group).await
            }
            None => true,
        }
    }

    pub(crate) async fn unsubscribe(&mut self) -> bool {
        let device = self.config.mqtt.device_topic(&self.config.uid);
        let device_ok = self.unsubscribe_topic(&device).await;
        self.unsubscribe_group().await && device_ok
    }

    pub(crate) async fn check_subscription(&mut self) -> Step {
        if self.seq.step() > 0 {
            self.timers
                .check_subscription
                .restart_with(CHECK_SUBSCRIPTION_INTERVAL);
            return Step::Enter(ConnectivityState::MqttListen);
        }
        if self.subscribe_topics().await {
            return Step::Advance;
        }
        if self.seq.bump() >= SUBSCRIBE_FAILURES {
            warn!("Subscription lost, restarting modem");
            self.net.mqtt_connected = false;
            self.net.network_initialized = false;
            self.restart_modem(false);
        }
        self.refresh_deadline();
        self.at.pause_ms(5000).await;
        Step::Stay
    }

    pub(crate) async fn check_connection(&mut self) -> Step {
        match self.seq.step() {
            0 => {
                self.proceed();
                let tx = Transaction::new("AT+QMTCONN?", "+QMTCONN:")
                    .timeout_ms(60_000)
                    .session();
                let outcome = self.at.transact(&tx).await;
                if outcome.succeeded() && !outcome.response.contains("+QMTCONN: 0,3") {
                    warn!("Broker session not connected: {}", outcome.response);
                    self.restart_modem(false);
                }
                Step::Stay
            }
            1 => {
                self.query_network_info().await;
                Step::Advance
            }
            2 => {
                self.query_pdp_address().await;
                Step::Advance
            }
            _ => {
                self.measure_signal().await;
                self.timers
                    .check_connection
                    .restart_with(CHECK_CONNECTION_INTERVAL);
                Step::Enter(ConnectivityState::MqttListen)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::testing::ScriptedModem;
    use crate::connectivity::supervisor::testing::{drain, harness, harness_with_store};
    use crate::persistence::{keys, KeyValueStore, MemoryStore};
    use serde_json::Value;

    const RECV: &str = "+QMTRECV: 0,1,\"lumen/star/devices/eui-00AA11BB/down/push\",";

    fn broker() -> ScriptedModem {
        ScriptedModem::new()
            .on("AT+QMTOPEN=", &["OK", "+QMTOPEN: 0,0"])
            .on("AT+QMTCONN=", &["OK", "+QMTCONN: 0,0,0"])
            .on("AT+QMTSUB=", &["OK", "+QMTSUB: 0,1,0,2"])
            .on("AT+CSQ", &["+CSQ: 20,99", "OK"])
            .on("AT+QMTPUB=", &[">"])
            .on("{", &["OK", "+QMTPUB: 0,0,0"])
            .default_ok()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_runs_through_to_listening() {
        let mut store = MemoryStore::new();
        store.set_text(keys::SLAVE_UID, "FF00").unwrap();
        let mut h = harness_with_store(broker(), store);
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::MqttConnect);

        for _ in 0..6 {
            s.tick().await;
        }

        assert_eq!(s.state, ConnectivityState::MqttListen);
        assert!(s.net.mqtt_connected);
        assert_eq!(s.health.current().rssi, -73);
        assert!(h.log.contains("AT+QMTCFG=\"keepalive\",0,360"));
        assert!(h.log.contains("AT+QMTCONN=0,\"lumen_sw_00AA11BB\""));
        assert!(h.log.contains(
            "AT+QMTSUB=0,1,\"lumen/star/devices/eui-00AA11BB/down/push\",2"
        ));
        assert!(h.log.contains("AT+QMTSUB=0,1,\"lumen/group/devices/eui-FF00/down/lux\",2"));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_open_retries_the_same_step() {
        let modem = ScriptedModem::new()
            .on("AT+QMTOPEN=", &["OK", "+QMTOPEN: 0,3"])
            .default_ok();
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::MqttConnect);

        s.tick().await;
        s.tick().await;
        s.tick().await;
        assert_eq!(s.state, ConnectivityState::MqttConnect);
        assert_eq!(s.seq.step(), 1);
        assert_eq!(h.log.count("AT+QMTOPEN"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_publish_is_dispatched() {
        let line = format!("{}\"{{\"0030\":{{\"A\":1}},\"dl\":2}}\"", RECV);
        let mut h = harness(broker().unsolicited(&line));
        let s = &mut h.supervisor;
        s.gnss.found = true;
        s.enter_listen();

        s.tick().await;

        let incoming = drain(&mut h.app.incoming_rx);
        assert_eq!(incoming, vec![r#"{"0030":{"A":1}}"#, r#"{"dl":2}"#]);
        assert_eq!(s.state, ConnectivityState::MqttListen);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_topics_are_ignored() {
        let line = "+QMTRECV: 0,1,\"some/other/topic\",\"{\"0030\":1}\"";
        let mut h = harness(broker().unsolicited(line));
        let s = &mut h.supervisor;
        s.gnss.found = true;
        s.enter_listen();

        s.tick().await;
        assert!(drain(&mut h.app.incoming_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn outgoing_messages_are_merged_into_one_publish() {
        let mut h = harness(broker());
        let s = &mut h.supervisor;
        s.gnss.found = true;
        s.enter_listen();
        for fragment in [r#"{"0001":{}}"#, r#"{"0030":{"A":1}}"#, r#"{"0030":{"A":2}}"#] {
            h.app.outgoing.send(fragment.to_string()).await.unwrap();
        }

        s.tick().await;

        assert_eq!(h.log.count("AT+QMTPUB=0,0,0,0,\"lumen/star/devices/eui-00AA11BB/up\""), 1);
        let bodies: Vec<String> = h
            .log
            .commands()
            .into_iter()
            .filter(|c| c.starts_with('{'))
            .collect();
        assert_eq!(bodies.len(), 1);
        let document: Value =
            serde_json::from_str(bodies[0].trim_end_matches('\u{1a}')).unwrap();
        assert_eq!(document["0030"]["A"], 2);
        assert_eq!(document["0001"]["U"], 1);
        assert_eq!(document["0002"], Value::String(s.config.reported_version()));
        assert!(!s.startup_ack);
        assert_eq!(s.health.shadow(), s.health.current());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_checks_the_subscription() {
        let modem = ScriptedModem::new()
            .on("AT+QMTPUB=", &[">"])
            .on("{", &["OK", "+QMTPUB: 0,0,2"])
            .default_ok();
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.gnss.found = true;
        s.enter_listen();
        h.app.outgoing.send(r#"{"0001":{}}"#.to_string()).await.unwrap();

        s.tick().await;

        assert_eq!(s.state, ConnectivityState::CheckSubscription);
        assert_eq!(h.log.count("AT+QMTPUB="), 4);
        assert!(s.startup_ack);
        assert_ne!(s.health.shadow(), s.health.current());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_subscribe_failures_restart_the_modem() {
        let modem = ScriptedModem::new()
            .on("AT+QMTSUB=", &["OK", "+QMTSUB: 0,1,128"])
            .default_ok();
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.net.mqtt_connected = true;
        s.net.network_initialized = true;
        s.enter(ConnectivityState::CheckSubscription);

        for _ in 0..3 {
            s.tick().await;
        }
        assert_eq!(s.state, ConnectivityState::ModemRestart);
        assert!(!s.net.mqtt_connected);
        assert!(!s.net.network_initialized);
        assert!(!s.net.activated_restart);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_check_rearms_its_timer() {
        let mut h = harness(broker());
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::CheckSubscription);

        s.tick().await;
        s.tick().await;
        assert_eq!(s.state, ConnectivityState::MqttListen);
        assert_eq!(
            s.timers.check_subscription.duration(),
            CHECK_SUBSCRIPTION_INTERVAL
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connection_check_walks_back_to_listening() {
        let modem = broker()
            .on("AT+QMTCONN?", &["+QMTCONN: 0,3", "OK"])
            .on("AT+QNWINFO", &["+QNWINFO: \"eMTC\",\"24001\",\"LTE BAND 20\",6300", "OK"])
            .on("AT+QIACT?", &["+QIACT: 1,1,1,\"10.64.12.7\"", "OK"]);
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::CheckConnection);

        for _ in 0..4 {
            s.tick().await;
        }
        assert_eq!(s.state, ConnectivityState::MqttListen);
        assert_eq!(s.health.current().ip, "10.64.12.7");
        assert_eq!(s.health.current().operator, "24001");
        assert_eq!(
            s.timers.check_connection.duration(),
            CHECK_CONNECTION_INTERVAL
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lost_session_restarts_the_modem() {
        let modem = ScriptedModem::new()
            .on("AT+QMTCONN?", &["+QMTCONN: 0,1", "OK"])
            .default_ok();
        let mut h = harness(modem);
        let s = &mut h.supervisor;
        s.enter(ConnectivityState::CheckConnection);

        s.tick().await;
        assert_eq!(s.state, ConnectivityState::ModemRestart);
    }

    /// Listening with the health checks pushed out of the way
    fn listen_quietly(s: &mut Supervisor<ScriptedModem>) {
        s.enter_listen();
        s.timers.check_connection.restart_with(CHECK_CONNECTION_INTERVAL);
        s.timers.check_subscription.restart_with(CHECK_SUBSCRIPTION_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn positioning_is_given_up_after_eight_cycles() {
        let mut h = harness(broker());
        let s = &mut h.supervisor;
        listen_quietly(s);
        tokio::time::advance(s.timers.gnss_retry.duration()).await;
        s.refresh_deadline();

        s.tick().await;
        assert_eq!(s.state, ConnectivityState::Gnss);

        listen_quietly(s);
        s.gnss.cycles = 8;
        s.gnss.xtra_enabled = true;
        tokio::time::advance(s.timers.gnss_retry.duration()).await;
        s.refresh_deadline();

        s.tick().await;
        assert!(s.gnss.skip);
        assert!(!s.gnss.xtra_enabled);
        assert_eq!(s.state, ConnectivityState::ModemRestart);
        assert!(s.net.activated_restart);
    }
}
