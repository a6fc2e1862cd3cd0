//! Pairing payload codec (C3): URL-safe-base64-of-JSON bootstrap payload for
//! out-of-band QR/paste exchange. No signature here — signing is layered on
//! in the subsequent `trust-request` (`[crate::trust]`).

use crate::error::{Error, Result};
use crate::identity::now_ms;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

const FRESHNESS_WINDOW_S: i64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingPayload {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "publicKey")]
    pub public_key: Vec<u8>,
    pub multiaddrs: Vec<String>,
    pub timestamp: i64,
    pub version: String,
}

impl PairingPayload {
    /// URL-safe, unpadded base64 of the canonical JSON.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("PairingPayload is always JSON-serializable");
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    /// Decodes and validates `s`; returns `None` on any structural or
    /// freshness failure, per spec (the decoder never surfaces *why*).
    pub fn decode(s: &str) -> Option<Self> {
        let payload = Self::parse(s)?;
        if !payload.is_fresh(now_ms() / 1000) {
            tracing::debug!(device_id = %payload.device_id, "pairing payload outside freshness window");
            return None;
        }
        Some(payload)
    }

    /// Same validation as [`Self::decode`] but distinguishes a structurally
    /// invalid payload from one that merely expired, for callers (the CLI)
    /// that want to report `PairingInvalid` vs `PairingExpired`.
    pub fn decode_checked(s: &str) -> Result<Self> {
        let payload = Self::parse(s).ok_or_else(|| Error::PairingInvalid(s.to_string()))?;
        if !payload.is_fresh(now_ms() / 1000) {
            return Err(Error::PairingExpired);
        }
        Ok(payload)
    }

    fn parse(s: &str) -> Option<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s).ok()?;
        let payload: Self = serde_json::from_slice(&bytes).ok()?;
        if payload.version != "1" {
            return None;
        }
        Some(payload)
    }

    fn is_fresh(&self, now_s: i64) -> bool {
        (now_s - self.timestamp).abs() <= FRESHNESS_WINDOW_S
    }
}
