use serde::Serialize;

use crate::at::parse::{NetworkInfo, RSSI_UNKNOWN};

/// Link measurements as last parsed from the modem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub rssi: i32,
    pub tech: String,
    pub channel: String,
    pub operator: String,
    pub ip: String,
    pub ccid: String,
}

impl LinkSnapshot {
    fn unknown() -> Self {
        Self {
            rssi: RSSI_UNKNOWN,
            tech: " - ".to_string(),
            channel: " - ".to_string(),
            operator: " - ".to_string(),
            ip: "0.0.0.0".to_string(),
            ccid: String::new(),
        }
    }

    /// Never reported; differs from any real measurement
    fn unsent() -> Self {
        Self {
            rssi: 0,
            tech: String::new(),
            channel: String::new(),
            operator: String::new(),
            ip: String::new(),
            ccid: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorReport {
    #[serde(rename = "O")]
    pub operator: String,
    #[serde(rename = "C")]
    pub channel: String,
    #[serde(rename = "T")]
    pub tech: String,
}

/// Fields that changed since the last status report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusDelta {
    pub operator: Option<OperatorReport>,
    pub ip: Option<String>,
    pub rssi: Option<i32>,
    pub ccid: Option<String>,
}

impl StatusDelta {
    pub fn is_empty(&self) -> bool {
        self.operator.is_none() && self.ip.is_none() && self.rssi.is_none() && self.ccid.is_none()
    }
}

/// Current link health plus the copy last sent upstream.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    current: LinkSnapshot,
    shadow: LinkSnapshot,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            current: LinkSnapshot::unknown(),
            shadow: LinkSnapshot::unsent(),
        }
    }
}

impl ConnectionHealth {
    pub fn current(&self) -> &LinkSnapshot {
        &self.current
    }

    pub fn shadow(&self) -> &LinkSnapshot {
        &self.shadow
    }

    pub fn set_rssi(&mut self, rssi: i32) {
        self.current.rssi = rssi;
    }

    pub fn set_network(&mut self, info: NetworkInfo) {
        self.current.tech = info.tech;
        self.current.operator = info.operator;
        self.current.channel = info.channel;
    }

    pub fn set_ip(&mut self, ip: String) {
        self.current.ip = ip;
    }

    pub fn set_ccid(&mut self, ccid: String) {
        self.current.ccid = ccid;
    }

    pub fn operator_report(&self) -> OperatorReport {
        OperatorReport {
            operator: self.current.operator.clone(),
            channel: self.current.channel.clone(),
            tech: self.current.tech.clone(),
        }
    }

    /// Changed fields since the last report. The shadow equals the current state afterwards.
    pub fn status_delta(&mut self) -> StatusDelta {
        let current = &self.current;
        let shadow = &self.shadow;

        let operator_changed = current.operator != shadow.operator
            || current.channel != shadow.channel
            || current.tech != shadow.tech;

        let delta = StatusDelta {
            operator: operator_changed.then(|| self.operator_report()),
            ip: (current.ip != shadow.ip).then(|| current.ip.clone()),
            rssi: (current.rssi != shadow.rssi).then_some(current.rssi),
            ccid: (current.ccid != shadow.ccid).then(|| current.ccid.clone()),
        };
        self.shadow = self.current.clone();
        delta
    }

    /// Drops the shadow so the next report carries every field again
    pub fn forget_shadow(&mut self) {
        self.shadow = LinkSnapshot::unsent();
    }
}
