//! Binary protocol for document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The payload is opaque to the envelope: CRDT update bytes for
//! `Update`/`SyncStep2`, an encoded state vector for `SyncStep1`, encoded
//! `PeerInfo` for `Join`/`PeerJoined`, an encoded `RejectReason` for `Reject`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First message on a connection: peer joins a document
    Join = 1,
    /// State vector for the sync handshake
    SyncStep1 = 2,
    /// State diff response
    SyncStep2 = 3,
    /// Incremental CRDT update
    Update = 4,
    /// Peer joined notification
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Terminal server-side refusal of the session
    Reject = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Why the server refused a session.
///
/// All of these are terminal: the session reports `Failed` and never
/// retries past them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The document no longer exists
    DocumentDeleted,
    /// The caller's access to the document was revoked
    AccessRevoked,
    /// The room is at its peer capacity
    RoomFull,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocumentDeleted => write!(f, "document deleted"),
            Self::AccessRevoked => write!(f, "access revoked"),
            Self::RoomFull => write!(f, "room full"),
        }
    }
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Sender-local sequence number for `Update` messages
    pub seq: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create the join message that opens a session on a connection.
    pub fn join(peer_id: Uuid, doc_id: Uuid, info: &PeerInfo) -> Self {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Join,
            peer_id,
            doc_id,
            seq: 0,
            payload,
        }
    }

    /// Create a sync step 1 (state vector exchange).
    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            doc_id,
            seq: 0,
            payload: state_vector,
        }
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, doc_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            doc_id,
            seq: 0,
            payload: state_diff,
        }
    }

    /// Create an incremental update message.
    pub fn update(peer_id: Uuid, doc_id: Uuid, seq: u64, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            peer_id,
            doc_id,
            seq,
            payload: update,
        }
    }

    /// Create a peer joined notification.
    pub fn peer_joined(peer_id: Uuid, doc_id: Uuid, info: &PeerInfo) -> Self {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::PeerJoined,
            peer_id,
            doc_id,
            seq: 0,
            payload,
        }
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            peer_id,
            doc_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a session rejection.
    pub fn reject(doc_id: Uuid, reason: RejectReason) -> Self {
        let payload = bincode::serde::encode_to_vec(&reason, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Reject,
            peer_id: Uuid::nil(),
            doc_id,
            seq: 0,
            payload,
        }
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            doc_id: Uuid::nil(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            doc_id: Uuid::nil(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the peer info payload of a `Join`/`PeerJoined` message.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::Join && self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }

    /// Parse the reason payload of a `Reject` message.
    pub fn reject_reason(&self) -> Result<RejectReason, ProtocolError> {
        if self.msg_type != MessageType::Reject {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (reason, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(reason)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidMessageType,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let peer = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::update(peer, doc, 42, payload.clone());
        let encoded = msg.encode().unwrap();
        let decoded = SyncMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.doc_id, doc);
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_sync_steps_roundtrip() {
        let peer = Uuid::new_v4();
        let doc = Uuid::new_v4();

        let sv = vec![10, 20, 30];
        let msg = SyncMessage::sync_step1(peer, doc, sv.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::SyncStep1);
        assert_eq!(decoded.payload, sv);

        let diff = vec![100, 200];
        let msg = SyncMessage::sync_step2(peer, doc, diff.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::SyncStep2);
        assert_eq!(decoded.payload, diff);
    }

    #[test]
    fn test_join_carries_peer_info() {
        let info = PeerInfo::new("Alice");
        let doc = Uuid::new_v4();

        let msg = SyncMessage::join(info.peer_id, doc, &info);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Join);
        let parsed = decoded.peer_info().unwrap();
        assert_eq!(parsed.name, "Alice");
        assert_eq!(parsed.peer_id, info.peer_id);
    }

    #[test]
    fn test_peer_joined_roundtrip() {
        let info = PeerInfo::new("Bob");
        let doc = Uuid::new_v4();

        let msg = SyncMessage::peer_joined(info.peer_id, doc, &info);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::PeerJoined);
        assert_eq!(decoded.peer_info().unwrap().name, "Bob");
    }

    #[test]
    fn test_peer_left_roundtrip() {
        let peer = Uuid::new_v4();
        let doc = Uuid::new_v4();

        let msg = SyncMessage::peer_left(peer, doc);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::PeerLeft);
        assert_eq!(decoded.peer_id, peer);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_reject_roundtrip() {
        let doc = Uuid::new_v4();

        let msg = SyncMessage::reject(doc, RejectReason::AccessRevoked);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Reject);
        assert_eq!(decoded.reject_reason().unwrap(), RejectReason::AccessRevoked);
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let peer = Uuid::new_v4();

        let ping = SyncMessage::decode(&SyncMessage::ping(peer).encode().unwrap()).unwrap();
        let pong = SyncMessage::decode(&SyncMessage::pong(peer).encode().unwrap()).unwrap();

        assert_eq!(ping.msg_type, MessageType::Ping);
        assert_eq!(pong.msg_type, MessageType::Pong);
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(msg.peer_info().is_err());
        assert!(msg.reject_reason().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_update_size_efficient() {
        let peer = Uuid::new_v4();
        let doc = Uuid::new_v4();
        // Typical small text update: ~50 bytes
        let update = vec![0u8; 50];

        let msg = SyncMessage::update(peer, doc, 1, update);
        let encoded = msg.encode().unwrap();

        // Header is ~41 bytes (1 type + 16 peer + 16 doc + 8 seq)
        // plus payload length prefix; total should be well under 150 bytes
        assert!(
            encoded.len() < 150,
            "Encoded size {} too large for 50-byte update",
            encoded.len()
        );
    }

    #[test]
    fn test_empty_update() {
        let peer = Uuid::new_v4();
        let doc = Uuid::new_v4();

        let msg = SyncMessage::update(peer, doc, 0, Vec::new());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.seq, 0);
    }
}
