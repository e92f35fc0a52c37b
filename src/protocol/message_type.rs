use std::fmt;

/// Message types carried as 4-hex-digit keys of a protocol document.
///
/// Keys that are not exactly four hex digits, or that name no known type, stay
/// [`MessageType::Unknown`] and travel through the core untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    StatusReport,
    VersionReport,
    IpReport,
    OperatorReport,
    RssiReport,
    CcidReport,
    UpdateFirmware,
    InsertPos,
    SearchGpsAgain,
    SetMasterSlave,
    RequestMasterSlave,
    SetNtpServer,
    NtpServerReport,
    SyncWithNtpServer,
    OperatorsReport,
    SearchAndSelectOperator,
    SelectNewOperator,
    SendAtCommand,
    ClearDevice,
    ClearAndRestartDevice,
    RestartModem,
    SetAutoNtpServerUpdate,
    SetKeepalive,
    StoreBurnTimes,
    InsertLux,
    LuxReport,
    InsertRule,
    RuleReport,
    LightStatusReport,
    LightConfigReport,
    LightSetConfig,
    LightSendQueryCommand,
    LightFullDiagnostic,
    HanReport,
    Unknown(String),
}

impl MessageType {
    pub fn code(&self) -> Option<u16> {
        let code = match self {
            Self::StatusReport => 0x0001,
            Self::VersionReport => 0x0002,
            Self::IpReport => 0x0003,
            Self::OperatorReport => 0x0004,
            Self::RssiReport => 0x0005,
            Self::CcidReport => 0x0006,
            Self::UpdateFirmware => 0x0007,
            Self::InsertPos => 0x0008,
            Self::SearchGpsAgain => 0x0009,
            Self::SetMasterSlave => 0x000A,
            Self::RequestMasterSlave => 0x000B,
            Self::SetNtpServer => 0x000C,
            Self::NtpServerReport => 0x000D,
            Self::SyncWithNtpServer => 0x000E,
            Self::OperatorsReport => 0x000F,
            Self::SearchAndSelectOperator => 0x0010,
            Self::SelectNewOperator => 0x0011,
            Self::SendAtCommand => 0x0012,
            Self::ClearDevice => 0x0013,
            Self::ClearAndRestartDevice => 0x0014,
            Self::RestartModem => 0x0015,
            Self::SetAutoNtpServerUpdate => 0x0016,
            Self::SetKeepalive => 0x0017,
            Self::StoreBurnTimes => 0x0018,
            Self::InsertLux => 0x0019,
            Self::LuxReport => 0x001A,
            Self::InsertRule => 0x0020,
            Self::RuleReport => 0x0021,
            Self::LightStatusReport => 0x0030,
            Self::LightConfigReport => 0x0031,
            Self::LightSetConfig => 0x0032,
            Self::LightSendQueryCommand => 0x0033,
            Self::LightFullDiagnostic => 0x0034,
            Self::HanReport => 0x0040,
            Self::Unknown(_) => return None,
        };
        Some(code)
    }

    pub fn from_code(code: u16) -> Option<Self> {
        let kind = match code {
            0x0001 => Self::StatusReport,
            0x0002 => Self::VersionReport,
            0x0003 => Self::IpReport,
            0x0004 => Self::OperatorReport,
            0x0005 => Self::RssiReport,
            0x0006 => Self::CcidReport,
            0x0007 => Self::UpdateFirmware,
            0x0008 => Self::InsertPos,
            0x0009 => Self::SearchGpsAgain,
            0x000A => Self::SetMasterSlave,
            0x000B => Self::RequestMasterSlave,
            0x000C => Self::SetNtpServer,
            0x000D => Self::NtpServerReport,
            0x000E => Self::SyncWithNtpServer,
            0x000F => Self::OperatorsReport,
            0x0010 => Self::SearchAndSelectOperator,
            0x0011 => Self::SelectNewOperator,
            0x0012 => Self::SendAtCommand,
            0x0013 => Self::ClearDevice,
            0x0014 => Self::ClearAndRestartDevice,
            0x0015 => Self::RestartModem,
            0x0016 => Self::SetAutoNtpServerUpdate,
            0x0017 => Self::SetKeepalive,
            0x0018 => Self::StoreBurnTimes,
            0x0019 => Self::InsertLux,
            0x001A => Self::LuxReport,
            0x0020 => Self::InsertRule,
            0x0021 => Self::RuleReport,
            0x0030 => Self::LightStatusReport,
            0x0031 => Self::LightConfigReport,
            0x0032 => Self::LightSetConfig,
            0x0033 => Self::LightSendQueryCommand,
            0x0034 => Self::LightFullDiagnostic,
            0x0040 => Self::HanReport,
            _ => return None,
        };
        Some(kind)
    }

    /// Decodes a document key
    pub fn from_key(key: &str) -> Self {
        if key.len() == 4 && key.bytes().all(|b| b.is_ascii_hexdigit()) {
            if let Some(kind) = u16::from_str_radix(key, 16).ok().and_then(Self::from_code) {
                return kind;
            }
        }
        Self::Unknown(key.to_string())
    }

    /// Document key, upper-case hex for known types
    pub fn key(&self) -> String {
        match (self, self.code()) {
            (_, Some(code)) => format!("{:04X}", code),
            (Self::Unknown(raw), None) => raw.clone(),
            (_, None) => String::new(),
        }
    }

    /// Report requests the core answers itself from its own state
    pub fn is_core_report(&self) -> bool {
        matches!(
            self,
            Self::IpReport
                | Self::OperatorReport
                | Self::RssiReport
                | Self::CcidReport
                | Self::VersionReport
                | Self::RequestMasterSlave
                | Self::NtpServerReport
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "Unknown({})", raw),
            known => write!(f, "{:?}({})", known, known.key()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_maps_back() {
        for code in 0..=0x00FF_u16 {
            if let Some(kind) = MessageType::from_code(code) {
                assert_eq!(kind.code(), Some(code));
                assert_eq!(MessageType::from_key(&kind.key()), kind);
            }
        }
        assert_eq!(MessageType::InsertPos.key(), "0008");
        assert_eq!(MessageType::LuxReport.key(), "001A");
    }

    #[test]
    fn keys_decode_case_insensitively() {
        assert_eq!(MessageType::from_key("000a"), MessageType::SetMasterSlave);
        assert_eq!(MessageType::from_key("000A"), MessageType::SetMasterSlave);
    }

    #[test]
    fn foreign_keys_stay_unknown() {
        for key in ["downlinks", "00G1", "0x01", "1", "0050", ""] {
            assert_eq!(
                MessageType::from_key(key),
                MessageType::Unknown(key.to_string())
            );
        }
        assert_eq!(MessageType::Unknown("dl".into()).key(), "dl");
    }
}
