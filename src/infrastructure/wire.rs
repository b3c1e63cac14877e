//! TCP wire framing for peer-to-peer traffic (§6). One frame format carries
//! every message type; HMAC covers the payload bytes and rides alongside
//! AES-GCM's own tag when the payload itself is ciphertext.

use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppError, AppResult};
use crate::infrastructure::model::{ChangeEvent, NodeId, VectorClock};

type HmacSha256 = Hmac<Sha256>;

pub const WIRE_MAGIC: u32 = 0x53594e43; // "SYNC"
pub const WIRE_VERSION: u8 = 1;
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    AuthRequest,
    AuthResponse,
    SessionOpen,
    SessionOk,
    PullRequest,
    EventBatch,
    ProcessedAck,
    SnapshotRequest,
    SnapshotReady,
    SnapshotChunk,
    HealthPing,
    HealthPong,
    Error,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Frame {
    pub magic: u32,
    pub version: u8,
    pub session_id: Option<String>,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    pub hmac: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionOpenPayload {
    pub auth_token: String,
    pub key_agreement_blob: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionOkPayload {
    pub session_id: String,
    pub key_agreement_blob: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PullRequestPayload {
    pub since_lamport: u64,
    pub max_batch: u32,
    pub filters: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventBatchPayload {
    pub events: Vec<ChangeEvent>,
    pub has_more: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessedAckPayload {
    pub event_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotRequestPayload {
    pub session_id: String,
    pub last_known_lamport: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotReadyPayload {
    pub filename: String,
    pub bytes: u64,
    pub clock_manifest: std::collections::HashMap<NodeId, u64>,
}

impl SnapshotReadyPayload {
    pub fn manifest_as_vector_clock(&self) -> VectorClock {
        VectorClock(self.clock_manifest.clone())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotChunkPayload {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

fn hmac_bytes(key: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Builds a frame. `session_key` is `None` for the pre-session handshake
/// messages (`AUTH_REQUEST`/`AUTH_RESPONSE`), which carry a zero-length hmac.
pub fn build_frame<T: Serialize>(
    message_type: MessageType,
    session_id: Option<String>,
    payload: &T,
    session_key: Option<&[u8]>,
) -> AppResult<Frame> {
    let payload_bytes = bincode::serialize(payload)
        .map_err(|e| AppError::SerializationError(e.to_string()))?;
    let hmac = match session_key {
        Some(key) => hmac_bytes(key, &payload_bytes),
        None => Vec::new(),
    };
    Ok(Frame {
        magic: WIRE_MAGIC,
        version: WIRE_VERSION,
        session_id,
        message_type,
        payload: payload_bytes,
        hmac,
    })
}

pub fn decode_payload<T: DeserializeOwned>(frame: &Frame) -> AppResult<T> {
    bincode::deserialize(&frame.payload).map_err(|e| AppError::DeserializationError(e.to_string()))
}

/// Verifies the frame's hmac against a session key. Handshake frames with no
/// session key are never passed through this check.
pub fn verify_frame_hmac(session_key: &[u8], frame: &Frame) -> bool {
    hmac_bytes(session_key, &frame.payload) == frame.hmac
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> AppResult<()> {
    let bytes =
        bincode::serialize(frame).map_err(|e| AppError::SerializationError(e.to_string()))?;
    if bytes.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(AppError::Validation("frame exceeds maximum wire size".into()));
    }
    writer
        .write_u32(bytes.len() as u32)
        .await
        .map_err(|e| AppError::Internal(format!("wire write failed: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| AppError::Internal(format!("wire write failed: {}", e)))?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> AppResult<Frame> {
    let len = reader
        .read_u32()
        .await
        .map_err(|e| AppError::Internal(format!("wire read failed: {}", e)))?;
    if len > MAX_FRAME_BYTES {
        return Err(AppError::Validation("incoming frame exceeds maximum wire size".into()));
    }
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| AppError::Internal(format!("wire read failed: {}", e)))?;
    let frame: Frame =
        bincode::deserialize(&buf).map_err(|e| AppError::DeserializationError(e.to_string()))?;
    if frame.magic != WIRE_MAGIC {
        return Err(AppError::Integrity("wire frame magic mismatch".into()));
    }
    if frame.version != WIRE_VERSION {
        return Err(AppError::Validation(format!(
            "unsupported wire version {}",
            frame.version
        )));
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_over_an_in_memory_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let payload = PullRequestPayload {
            since_lamport: 42,
            max_batch: 100,
            filters: None,
        };
        let frame = build_frame(MessageType::PullRequest, Some("sess-1".into()), &payload, None)
            .unwrap();
        write_frame(&mut a, &frame).await.unwrap();
        let decoded = read_frame(&mut b).await.unwrap();
        let decoded_payload: PullRequestPayload = decode_payload(&decoded).unwrap();
        assert_eq!(decoded_payload.since_lamport, 42);
        assert_eq!(decoded.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn hmac_verification_rejects_tampered_payload() {
        let key = b"session-key-bytes-000000000000!";
        let payload = ProcessedAckPayload {
            event_ids: vec!["e1".into()],
        };
        let mut frame =
            build_frame(MessageType::ProcessedAck, None, &payload, Some(key)).unwrap();
        assert!(verify_frame_hmac(key, &frame));
        frame.payload.push(0xFF);
        assert!(!verify_frame_hmac(key, &frame));
    }
}
