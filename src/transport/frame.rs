//! Wire framing and typed protocol messages
//!
//! A frame body is `u32 be header_length || header JSON || payload`. On
//! the wire it is preceded by a `u32 be` length prefix; after the
//! handshake the whole body is AEAD-sealed and the prefix covers the
//! ciphertext. The header always carries an integer `type` code plus the
//! variant's fields; bulk binary data (chunk bytes, image bytes, inline
//! file blobs) rides in the payload.
//!
//! Messages are a tagged sum so the dispatcher is a single `match`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::transfer::FileMetadata;

/// Hard cap on one frame (header + payload) to bound memory.
pub const MAX_FRAME_LEN: u32 = 128 * 1024 * 1024;

/// Framing and header errors. Any of these terminates the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u64),

    #[error("truncated frame")]
    Truncated,

    #[error("malformed header: {0}")]
    Header(#[from] serde_json::Error),

    #[error("header is missing the type code")]
    MissingType,

    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("unexpected message {got} during {phase}")]
    Unexpected { phase: &'static str, got: &'static str },
}

// Fixed wire codes.
const T_HELLO: u8 = 0x01;
const T_CHALLENGE: u8 = 0x02;
const T_RESPONSE: u8 = 0x03;
const T_OK: u8 = 0x04;
const T_PAIR_REQUEST: u8 = 0x05;
const T_PAIR_RESPONSE: u8 = 0x06;
const T_PAIR_CONFIRM: u8 = 0x07;
const T_PAIR_REJECT: u8 = 0x08;
const T_HEARTBEAT: u8 = 0x10;
const T_TEXT: u8 = 0x11;
const T_IMAGE: u8 = 0x12;
const T_FILES_INLINE: u8 = 0x13;
const T_FILE_ANNOUNCE: u8 = 0x14;
const T_FILE_REQUEST: u8 = 0x15;
const T_FILE_CHUNK: u8 = 0x16;
const T_FILE_COMPLETE: u8 = 0x17;
const T_TRANSFER_CANCEL: u8 = 0x18;
const T_TRANSFER_ERROR: u8 = 0x19;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelloHeader {
    /// Connector's fresh handshake nonce, hex
    pub nonce: String,
    pub device_id: String,
    /// False only when both sides run `--no-security`
    #[serde(default = "default_secure")]
    pub secure: bool,
}

fn default_secure() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChallengeHeader {
    /// Acceptor's fresh handshake nonce, hex
    pub nonce: String,
    /// 32 random bytes, hex
    pub challenge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseHeader {
    /// HMAC over challenge and both nonces, hex; empty in plaintext mode
    #[serde(default)]
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairRequestHeader {
    pub device_id: String,
    pub device_name: String,
    /// HKDF salt for the PIN key, hex
    pub salt: String,
    /// Joiner's 32-byte random, hex
    pub random: String,
    /// HMAC under the PIN key, hex
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairResponseHeader {
    pub device_id: String,
    pub device_name: String,
    /// Host's 32-byte random, hex
    pub random: String,
    /// HMAC under the PIN key over the full transcript, hex
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairConfirmHeader {
    /// HMAC under the freshly derived shared secret, hex
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairRejectHeader {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilesInlineHeader {
    /// Payload is the files' bytes concatenated in this order
    pub files: Vec<FileMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnounceHeader {
    pub transfer_id: String,
    pub files: Vec<FileMetadata>,
    /// Seconds the sender will keep the announce requestable
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestHeader {
    pub transfer_id: String,
    /// Byte offset into the transfer's concatenated stream, for
    /// within-session resume
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkHeader {
    pub transfer_id: String,
    pub file_index: u32,
    pub offset: u64,
    pub length: u32,
    /// SHA-256 of this chunk's bytes, hex
    pub chunk_checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompleteHeader {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelHeader {
    pub transfer_id: String,
    #[serde(default)]
    pub reason: String,
}

/// Machine-readable failure codes carried by TRANSFER_ERROR.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferErrorCode {
    /// The transfer id is unknown to the sender or past its deadline
    ExpiredOrUnknown,
    /// Source file could not be read; the receiver may retry
    Read,
    /// Integrity verification failed; not retryable
    Checksum,
    Internal,
}

impl TransferErrorCode {
    /// Transient errors are eligible for the receiver's retry policy.
    pub fn is_transient(self) -> bool {
        matches!(self, TransferErrorCode::Read)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferErrorHeader {
    pub transfer_id: String,
    pub code: TransferErrorCode,
    #[serde(default)]
    pub detail: String,
}

/// One protocol message: header fields plus optional binary payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(HelloHeader),
    Challenge(ChallengeHeader),
    Response(ResponseHeader),
    HandshakeOk,
    PairRequest(PairRequestHeader),
    PairResponse(PairResponseHeader),
    PairConfirm(PairConfirmHeader),
    PairReject(PairRejectHeader),
    Heartbeat,
    Text { content: String },
    Image { header: ImageHeader, payload: Vec<u8> },
    FilesInline { header: FilesInlineHeader, payload: Vec<u8> },
    Announce(AnnounceHeader),
    Request(RequestHeader),
    Chunk { header: ChunkHeader, payload: Vec<u8> },
    Complete(CompleteHeader),
    Cancel(CancelHeader),
    TransferError(TransferErrorHeader),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TextHeader {
    content: String,
}

impl Message {
    /// Fixed integer wire code for this message.
    pub fn code(&self) -> u8 {
        match self {
            Message::Hello(_) => T_HELLO,
            Message::Challenge(_) => T_CHALLENGE,
            Message::Response(_) => T_RESPONSE,
            Message::HandshakeOk => T_OK,
            Message::PairRequest(_) => T_PAIR_REQUEST,
            Message::PairResponse(_) => T_PAIR_RESPONSE,
            Message::PairConfirm(_) => T_PAIR_CONFIRM,
            Message::PairReject(_) => T_PAIR_REJECT,
            Message::Heartbeat => T_HEARTBEAT,
            Message::Text { .. } => T_TEXT,
            Message::Image { .. } => T_IMAGE,
            Message::FilesInline { .. } => T_FILES_INLINE,
            Message::Announce(_) => T_FILE_ANNOUNCE,
            Message::Request(_) => T_FILE_REQUEST,
            Message::Chunk { .. } => T_FILE_CHUNK,
            Message::Complete(_) => T_FILE_COMPLETE,
            Message::Cancel(_) => T_TRANSFER_CANCEL,
            Message::TransferError(_) => T_TRANSFER_ERROR,
        }
    }

    /// Short name for logging and error context.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "HELLO",
            Message::Challenge(_) => "CHALLENGE",
            Message::Response(_) => "RESPONSE",
            Message::HandshakeOk => "OK",
            Message::PairRequest(_) => "PAIR_REQUEST",
            Message::PairResponse(_) => "PAIR_RESPONSE",
            Message::PairConfirm(_) => "PAIR_CONFIRM",
            Message::PairReject(_) => "PAIR_REJECT",
            Message::Heartbeat => "HEARTBEAT",
            Message::Text { .. } => "TEXT",
            Message::Image { .. } => "IMAGE",
            Message::FilesInline { .. } => "FILES_INLINE",
            Message::Announce(_) => "FILE_ANNOUNCE",
            Message::Request(_) => "FILE_REQUEST",
            Message::Chunk { .. } => "FILE_CHUNK",
            Message::Complete(_) => "FILE_COMPLETE",
            Message::Cancel(_) => "TRANSFER_CANCEL",
            Message::TransferError(_) => "TRANSFER_ERROR",
        }
    }

    /// Encode the frame body: `u32 be header_len || header JSON || payload`.
    pub fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        let empty: &[u8] = &[];
        let (mut header, payload): (Value, &[u8]) = match self {
            Message::Hello(h) => (serde_json::to_value(h)?, empty),
            Message::Challenge(h) => (serde_json::to_value(h)?, empty),
            Message::Response(h) => (serde_json::to_value(h)?, empty),
            Message::HandshakeOk => (serde_json::json!({}), empty),
            Message::PairRequest(h) => (serde_json::to_value(h)?, empty),
            Message::PairResponse(h) => (serde_json::to_value(h)?, empty),
            Message::PairConfirm(h) => (serde_json::to_value(h)?, empty),
            Message::PairReject(h) => (serde_json::to_value(h)?, empty),
            Message::Heartbeat => (serde_json::json!({}), empty),
            Message::Text { content } => (
                serde_json::to_value(TextHeader {
                    content: content.clone(),
                })?,
                empty,
            ),
            Message::Image { header, payload } => (serde_json::to_value(header)?, payload),
            Message::FilesInline { header, payload } => {
                (serde_json::to_value(header)?, payload)
            }
            Message::Announce(h) => (serde_json::to_value(h)?, empty),
            Message::Request(h) => (serde_json::to_value(h)?, empty),
            Message::Chunk { header, payload } => (serde_json::to_value(header)?, payload),
            Message::Complete(h) => (serde_json::to_value(h)?, empty),
            Message::Cancel(h) => (serde_json::to_value(h)?, empty),
            Message::TransferError(h) => (serde_json::to_value(h)?, empty),
        };

        match header.as_object_mut() {
            Some(map) => {
                map.insert("type".to_string(), Value::from(self.code()));
            }
            None => return Err(ProtocolError::MissingType),
        }
        let header_bytes = serde_json::to_vec(&header)?;

        let total = 4u64 + header_bytes.len() as u64 + payload.len() as u64;
        if total > MAX_FRAME_LEN as u64 {
            return Err(ProtocolError::FrameTooLarge(total));
        }

        let mut body = Vec::with_capacity(total as usize);
        body.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        body.extend_from_slice(&header_bytes);
        body.extend_from_slice(payload);
        Ok(body)
    }

    /// Decode a frame body produced by [`Message::encode_body`].
    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() as u64 > MAX_FRAME_LEN as u64 {
            return Err(ProtocolError::FrameTooLarge(body.len() as u64));
        }
        if body.len() < 4 {
            return Err(ProtocolError::Truncated);
        }
        let header_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let Some(header_end) = header_len.checked_add(4) else {
            return Err(ProtocolError::Truncated);
        };
        if header_end > body.len() {
            return Err(ProtocolError::Truncated);
        }

        let header: Value = serde_json::from_slice(&body[4..header_end])?;
        let code = header
            .get("type")
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::MissingType)? as u8;
        let payload = &body[header_end..];

        let message = match code {
            T_HELLO => Message::Hello(serde_json::from_value(header)?),
            T_CHALLENGE => Message::Challenge(serde_json::from_value(header)?),
            T_RESPONSE => Message::Response(serde_json::from_value(header)?),
            T_OK => Message::HandshakeOk,
            T_PAIR_REQUEST => Message::PairRequest(serde_json::from_value(header)?),
            T_PAIR_RESPONSE => Message::PairResponse(serde_json::from_value(header)?),
            T_PAIR_CONFIRM => Message::PairConfirm(serde_json::from_value(header)?),
            T_PAIR_REJECT => Message::PairReject(serde_json::from_value(header)?),
            T_HEARTBEAT => Message::Heartbeat,
            T_TEXT => {
                let h: TextHeader = serde_json::from_value(header)?;
                Message::Text { content: h.content }
            }
            T_IMAGE => Message::Image {
                header: serde_json::from_value(header)?,
                payload: payload.to_vec(),
            },
            T_FILES_INLINE => Message::FilesInline {
                header: serde_json::from_value(header)?,
                payload: payload.to_vec(),
            },
            T_FILE_ANNOUNCE => Message::Announce(serde_json::from_value(header)?),
            T_FILE_REQUEST => Message::Request(serde_json::from_value(header)?),
            T_FILE_CHUNK => Message::Chunk {
                header: serde_json::from_value(header)?,
                payload: payload.to_vec(),
            },
            T_FILE_COMPLETE => Message::Complete(serde_json::from_value(header)?),
            T_TRANSFER_CANCEL => Message::Cancel(serde_json::from_value(header)?),
            T_TRANSFER_ERROR => Message::TransferError(serde_json::from_value(header)?),
            other => return Err(ProtocolError::UnknownType(other)),
        };
        Ok(message)
    }
}
