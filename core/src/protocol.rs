//! Wire types and framing (C4): clip/trust/history envelopes over a
//! length-delimited frame, generalizing the teacher's `Frame`/`MsgType`.

use crate::error::{Error, Result};
use crate::trust::TrustedDevice;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

pub const CLIP_PROTOCOL: &str = "/clipboard/1.0.0";
pub const TRUST_PROTOCOL: &str = "/clipboard/trust/1.0.0";
pub const HISTORY_PROTOCOL: &str = "/clipboard/history/1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipKind {
    Text,
    Url,
    Image,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ClipKind,
    pub content: String,
    pub timestamp: i64,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRequestPayload {
    pub from: String,
    pub to: String,
    pub payload: TrustedDevice,
    pub sent_at: i64,
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustAckPayload {
    pub accepted: bool,
    pub request: TrustRequestPayload,
    pub responder: TrustedDevice,
}

/// Tagged wire envelope. One per frame, matching the teacher's
/// `#[serde(tag = "type")] enum Message` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    #[serde(rename = "CLIP")]
    Clip { from: String, clip: Clip, sent_at: i64 },

    #[serde(rename = "trust-request")]
    TrustRequest {
        from: String,
        to: String,
        payload: TrustedDevice,
        sent_at: i64,
        sig: Vec<u8>,
    },

    #[serde(rename = "trust-ack")]
    TrustAck {
        from: String,
        to: String,
        payload: TrustAckPayload,
        sent_at: i64,
    },

    #[serde(rename = "sync-history")]
    HistorySync { from: String, payload: Vec<Clip>, sent_at: i64 },
}

impl SyncMessage {
    pub fn from_field(&self) -> &str {
        match self {
            SyncMessage::Clip { from, .. } => from,
            SyncMessage::TrustRequest { from, .. } => from,
            SyncMessage::TrustAck { from, .. } => from,
            SyncMessage::HistorySync { from, .. } => from,
        }
    }
}

/// Canonical bytes signed over a trust-request: `{from,to,payload,sent_at}`.
pub fn trust_request_signing_bytes(
    from: &str,
    to: &str,
    payload: &TrustedDevice,
    sent_at: i64,
) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Signed<'a> {
        from: &'a str,
        to: &'a str,
        payload: &'a TrustedDevice,
        sent_at: i64,
    }
    Ok(serde_json::to_vec(&Signed { from, to, payload, sent_at })?)
}

/// Length-delimited frame: 4-byte big-endian length prefix + UTF-8 JSON body.
pub fn encode_frame(msg: &SyncMessage) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    let mut out = BytesMut::with_capacity(4 + body.len());
    out.put_u32(body.len() as u32);
    out.extend_from_slice(&body);
    Ok(out.to_vec())
}

/// Decode a single length-prefixed frame. Returns `None` on malformed JSON,
/// a missing `type` field, or a `type` mismatch — per spec these are
/// silently dropped rather than propagated as errors.
pub fn decode_frame(mut bytes: &[u8]) -> Option<SyncMessage> {
    if bytes.len() < 4 {
        return None;
    }
    let len = bytes.get_u32() as usize;
    if bytes.len() < len {
        return None;
    }
    serde_json::from_slice(&bytes[..len]).ok()
}

/// Decode a bare JSON body (no length prefix) — used by transports that
/// already frame messages themselves (e.g. one message per stream).
pub fn decode_body(bytes: &[u8]) -> Option<SyncMessage> {
    serde_json::from_slice(bytes).ok()
}

pub fn encode_body(msg: &SyncMessage) -> Result<Vec<u8>> {
    serde_json::to_vec(msg).map_err(Error::from)
}
