//! C4: the wire codec (spec.md §4.4, frame shapes in §6.1). Frames are
//! JSON objects tagged by `type`; `update.delta` carries the opaque CRDT
//! bytes base64-encoded. Parsing is total: any input either decodes to a
//! known `InboundFrame` variant or yields a `ProtocolError`, it never panics.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::domain::User;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundFrame {
    Connect {
        #[serde(rename = "roomId")]
        room_id: String,
        user: User,
        token: Option<String>,
    },
    Update {
        delta: String,
    },
    Presence {
        #[serde(rename = "clientId")]
        client_id: String,
        cursor: Option<Cursor>,
        selection: Option<Vec<String>>,
        viewport: Option<Viewport>,
    },
    Chat {
        #[serde(rename = "userName")]
        user_name: String,
        message: String,
        timestamp: i64,
    },
    Heartbeat {
        timestamp: i64,
    },
    Leave,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundFrame {
    #[serde(rename = "sync-response")]
    SyncResponse {
        #[serde(rename = "snapshotData")]
        snapshot_data: String,
        participants: Vec<WireParticipant>,
    },
    Join {
        user: User,
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "roomId")]
        room_id: String,
    },
    Leave {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    Update {
        delta: String,
        from: String,
    },
    Presence {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cursor: Option<Cursor>,
        #[serde(skip_serializing_if = "Option::is_none")]
        selection: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        viewport: Option<Viewport>,
    },
    Chat {
        #[serde(rename = "userName")]
        user_name: String,
        message: String,
        timestamp: i64,
        #[serde(rename = "clientId")]
        client_id: String,
    },
    Heartbeat {
        timestamp: i64,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WireParticipant {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub user: User,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("delta is not valid base64: {0}")]
    BadBase64(#[from] base64::DecodeError),
}

/// Decodes one text frame, enforcing `max_frame_bytes` first so an
/// oversized payload never reaches the JSON parser.
pub fn decode_inbound(raw: &[u8], max_frame_bytes: usize) -> Result<InboundFrame, CodecError> {
    if raw.len() > max_frame_bytes {
        return Err(CodecError::TooLarge(max_frame_bytes));
    }
    Ok(serde_json::from_slice(raw)?)
}

pub fn encode_outbound(frame: &OutboundFrame) -> Vec<u8> {
    // Every variant here is built from our own types, so serialization
    // cannot fail; a panic would indicate a programmer error in this module.
    serde_json::to_vec(frame).expect("OutboundFrame must always serialize")
}

pub fn decode_delta(delta: &str) -> Result<Vec<u8>, CodecError> {
    Ok(BASE64.decode(delta)?)
}

pub fn encode_delta(payload: &[u8]) -> String {
    BASE64.encode(payload)
}
