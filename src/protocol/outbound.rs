//! Outbound batching.
//!
//! Application fragments queued on the outgoing channel are merged into one document per
//! publish. Report requests are filled in from the core's own state while merging, and a
//! STATUS_REPORT pulls in only the link fields that changed since the previous one.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::codec::{self, MAX_DOCUMENT_KEYS};
use super::message_type::MessageType;
use crate::connectivity::health::ConnectionHealth;

/// Legacy lux frame carried next to INSERT_LUX for older receivers
const LUX_FRAME_LEN: usize = 13;
const LUX_FRAME_COMMAND: u8 = 0x18;
const LUX_FRAME_VELOCITY: usize = 2;
const LUX_FRAME_LUX: usize = 6;

/// Core state used to fill report requests
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub version: String,
    /// First status report after boot
    pub startup_ack: bool,
    /// Unix seconds
    pub timestamp: i64,
    pub is_master: bool,
    /// `{"S": 0|1|2, "MU": ...}`
    pub role: Value,
    pub ntp_server: String,
    /// `"<long name>, <short name>"` per scanned operator
    pub operators: Vec<String>,
    pub at_response: String,
}

/// Lux reading a master relays to its group
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LuxReading {
    pub lux: f32,
    pub velocity: f32,
    pub timestamp: u32,
}

/// One outgoing document being assembled
#[derive(Debug, Default)]
pub struct OutboundBatch {
    document: Map<String, Value>,
    status_included: bool,
    lux: Option<LuxReading>,
    merged: usize,
}

impl OutboundBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// The document carries a STATUS_REPORT, so the health shadow moved
    pub fn status_included(&self) -> bool {
        self.status_included
    }

    pub fn lux(&self) -> Option<LuxReading> {
        self.lux
    }

    pub fn is_empty(&self) -> bool {
        self.document.is_empty()
    }

    /// Merges one queued fragment. Later values replace earlier ones for the same key.
    pub fn merge(&mut self, fragment: &str, context: &ReportContext, health: &mut ConnectionHealth) {
        let mut parent = match codec::decode_document(fragment) {
            Ok(parent) => parent,
            Err(e) => {
                debug!("Dropping outgoing fragment {}: {}", fragment, e);
                return;
            }
        };
        let Some(key) = parent.keys().next().cloned() else {
            return;
        };
        if key.len() != 4 {
            debug!("Dropping outgoing fragment with key {}", key);
            return;
        }
        self.merged += 1;

        let kind = MessageType::from_key(&key);
        match kind {
            MessageType::StatusReport => {
                self.fill_status(&mut parent, &key, context, health);
            }
            MessageType::OperatorReport => {
                parent.insert(key, operator_value(health));
            }
            MessageType::IpReport => {
                parent.insert(key, json!(health.current().ip));
            }
            MessageType::RssiReport => {
                parent.insert(key, json!(health.current().rssi));
            }
            MessageType::CcidReport => {
                parent.insert(key, json!(health.current().ccid));
            }
            MessageType::RequestMasterSlave => {
                parent.insert(key, context.role.clone());
            }
            MessageType::NtpServerReport => {
                parent.insert(key, json!(context.ntp_server));
            }
            MessageType::OperatorsReport => {
                parent.insert(key, json!(context.operators));
            }
            MessageType::SendAtCommand => {
                parent.insert(key, json!(context.at_response));
            }
            MessageType::VersionReport => {
                parent.insert(key, json!(context.version));
            }
            MessageType::LuxReport => {
                if context.is_master {
                    if let Some(reading) = parent.get(&key).and_then(lux_reading) {
                        self.lux = Some(reading);
                    }
                }
            }
            MessageType::RuleReport => {
                if let Some(rule) = parent.remove(&key) {
                    self.merge_rule(key, rule);
                }
                return;
            }
            _ => {}
        }

        for (key, value) in parent {
            self.document.insert(key, value);
        }
    }

    fn fill_status(
        &mut self,
        parent: &mut Map<String, Value>,
        key: &str,
        context: &ReportContext,
        health: &mut ConnectionHealth,
    ) {
        let status = parent
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !status.is_object() {
            *status = Value::Object(Map::new());
        }
        if let Value::Object(fields) = status {
            if context.startup_ack {
                fields.insert("U".into(), json!(1));
            }
            fields.insert("T".into(), json!(context.timestamp));
        }
        if context.startup_ack {
            parent.insert(MessageType::VersionReport.key(), json!(context.version));
        }

        let delta = health.status_delta();
        if let Some(ip) = delta.ip {
            parent.insert(MessageType::IpReport.key(), json!(ip));
        }
        if let Some(operator) = delta.operator {
            parent.insert(MessageType::OperatorReport.key(), json!(operator));
        }
        if let Some(rssi) = delta.rssi {
            parent.insert(MessageType::RssiReport.key(), json!(rssi));
        }
        if let Some(ccid) = delta.ccid {
            parent.insert(MessageType::CcidReport.key(), json!(ccid));
        }
        self.status_included = true;
    }

    /// Rules are collected into one array; a rule with the same priority `P` replaces the
    /// earlier one
    fn merge_rule(&mut self, key: String, rule: Value) {
        match self.document.get_mut(&key) {
            Some(Value::Array(rules)) => {
                let priority = rule.get("P").and_then(Value::as_u64);
                let same = |r: &Value| r.get("P").and_then(Value::as_u64) == priority;
                if let Some(index) = rules.iter().position(|r| priority.is_some() && same(r)) {
                    rules.remove(index);
                }
                rules.push(rule);
            }
            Some(other) => *other = Value::Array(vec![rule]),
            None => {
                let rules = if rule.get("P").is_some() {
                    vec![rule]
                } else {
                    Vec::new()
                };
                self.document.insert(key, Value::Array(rules));
            }
        }
    }

    /// Serialized document, or `None` when nothing was merged
    pub fn to_payload(&self) -> Option<String> {
        if self.document.is_empty() {
            return None;
        }
        debug!(
            "Outgoing document from {} fragments, {} keys",
            self.merged,
            self.document.len()
        );
        Some(Value::Object(self.document.clone()).to_string())
    }

    /// Room for more fragments in this batch
    pub fn has_room(&self) -> bool {
        self.merged < MAX_DOCUMENT_KEYS
    }
}

fn operator_value(health: &ConnectionHealth) -> Value {
    json!(health.operator_report())
}

fn lux_reading(report: &Value) -> Option<LuxReading> {
    let set = report.get("S")?.as_f64()?;
    if set == 0.0 {
        return None;
    }
    Some(LuxReading {
        lux: report.get("L")?.as_f64()? as f32,
        velocity: report.get("V")?.as_f64()? as f32,
        timestamp: report.get("T")?.as_f64()? as u32,
    })
}

/// 13-byte legacy frame: command, pad, velocity and lux as little-endian f32
fn lux_frame(reading: &LuxReading) -> [u8; LUX_FRAME_LEN] {
    let mut frame = [0u8; LUX_FRAME_LEN];
    frame[0] = LUX_FRAME_COMMAND;
    frame[LUX_FRAME_VELOCITY..LUX_FRAME_VELOCITY + 4]
        .copy_from_slice(&reading.velocity.to_le_bytes());
    frame[LUX_FRAME_LUX..LUX_FRAME_LUX + 4].copy_from_slice(&reading.lux.to_le_bytes());
    frame
}

/// Document a master publishes on its group topic
pub fn lux_relay(reading: &LuxReading) -> String {
    let mut document = Map::new();
    document.insert(
        MessageType::InsertLux.key(),
        json!({
            "L": f64::from(reading.lux),
            "V": f64::from(reading.velocity),
            "T": reading.timestamp,
        }),
    );
    document.insert(
        "downlinks".to_string(),
        json!([{ "frm_payload": STANDARD.encode(lux_frame(reading)) }]),
    );
    Value::Object(document).to_string()
}
