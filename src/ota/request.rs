use serde::Deserialize;

/// Download budget when no or an unknown timeout class is given, in seconds
pub const DEFAULT_DOWNLOAD_SECS: u32 = 5400;

/// Body of an UPDATE_FIRMWARE message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdateRequest {
    #[serde(rename = "P")]
    pub product: String,
    #[serde(rename = "v")]
    pub variant: String,
    #[serde(rename = "V")]
    pub version: String,
    /// Download timeout class, 1 to 7
    #[serde(rename = "TOTI", default)]
    pub timeout_class: Option<u32>,
}

impl UpdateRequest {
    /// Seconds the modem may spend downloading the image
    pub fn download_secs(&self) -> u32 {
        match self.timeout_class {
            Some(1) => 3600,
            Some(2) => 6300,
            Some(3) => 7200,
            Some(4) => 9000,
            Some(5) => 10800,
            Some(6) => 12600,
            Some(7) => 14400,
            _ => DEFAULT_DOWNLOAD_SECS,
        }
    }

    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{}?P={}&v={}&V={}",
            base_url, self.product, self.variant, self.version
        )
    }
}
