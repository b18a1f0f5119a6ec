//! # Wire Protocol
//!
//! Message model and framing for the peer overlay.
//!
//! Every message travels as one frame: a 4-byte big-endian length prefix
//! followed by a UTF-8 JSON object with the fields `type`, `data`,
//! `timestamp` (ISO-8601) and `sender_id`. The same framing is used on every
//! code path, whether a frame is built with [`encode`] or written through
//! [`MessageCodec`] on a live socket.
//!
//! ## Message kinds
//!
//! - `hello` - capability and version announce, mandatory first frame
//! - `peer_list` / `file_list` - directory gossip
//! - `file_request` / `file_response` - hooks for the file-transfer collaborator
//! - `ping` / `pong` - liveness
//! - `goodbye` - orderly shutdown
//! - `db_sync`, `version_*`, `changes_*` - version store replication

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::str::FromStr;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::ProtocolError;

/// Version string announced in `hello`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Capability tags announced in `hello`.
pub const CAPABILITIES: [&str; 3] = ["file_sharing", "peer_discovery", "db_sync"];

/// Hard cap on a frame body. Larger prefixes are rejected before buffering.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Structured message body.
pub type Payload = serde_json::Map<String, Value>;

/// Identifier of a network endpoint, derived from its listening address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// SHA-256 of `"host:port"`, hex encoded.
    pub fn from_address(host: &str, port: u16) -> Self {
        let digest = Sha256::digest(format!("{}:{}", host, port).as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a file or resource in the location directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// SHA-256 of a file name, hex encoded.
    pub fn from_name(name: &str) -> Self {
        Self(hex::encode(Sha256::digest(name.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ContentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A `(host, port)` pair. Serialized as a two-element JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, u16)", into = "(String, u16)")]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_address(&self.host, self.port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<(String, u16)> for PeerAddress {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

impl From<(&str, u16)> for PeerAddress {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new(host, port)
    }
}

impl From<PeerAddress> for (String, u16) {
    fn from(address: PeerAddress) -> Self {
        (address.host, address.port)
    }
}

impl FromStr for PeerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {:?}", s))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in {:?}: {}", s, e))?;
        if host.is_empty() {
            return Err(format!("missing host in {:?}", s));
        }
        Ok(Self::new(host, port))
    }
}

/// Tag of a message, carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Hello,
    PeerList,
    FileList,
    FileRequest,
    FileResponse,
    Ping,
    Pong,
    Goodbye,
    DbSync,
    VersionRequest,
    VersionResponse,
    ChangesRequest,
    ChangesResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 13] = [
        MessageKind::Hello,
        MessageKind::PeerList,
        MessageKind::FileList,
        MessageKind::FileRequest,
        MessageKind::FileResponse,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Goodbye,
        MessageKind::DbSync,
        MessageKind::VersionRequest,
        MessageKind::VersionResponse,
        MessageKind::ChangesRequest,
        MessageKind::ChangesResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Hello => "hello",
            MessageKind::PeerList => "peer_list",
            MessageKind::FileList => "file_list",
            MessageKind::FileRequest => "file_request",
            MessageKind::FileResponse => "file_response",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Goodbye => "goodbye",
            MessageKind::DbSync => "db_sync",
            MessageKind::VersionRequest => "version_request",
            MessageKind::VersionResponse => "version_response",
            MessageKind::ChangesRequest => "changes_request",
            MessageKind::ChangesResponse => "changes_response",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol message. Built by the sender, consumed once by the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: MessageKind,
    payload: Payload,
    timestamp: DateTime<Utc>,
    sender_id: NodeId,
}

/// `peer_list` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: NodeId,
    pub address: PeerAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub address: Option<PeerAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListPayload {
    pub peers: Vec<PeerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListPayload {
    pub files: Vec<ContentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequestPayload {
    pub file_id: ContentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResponsePayload {
    pub file_id: ContentId,
    /// Hex encoded bytes.
    pub data: String,
}

impl FileResponsePayload {
    pub fn bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        hex::decode(&self.data).map_err(|e| ProtocolError::InvalidPayload {
            kind: MessageKind::FileResponse.as_str(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    pub ping_timestamp: String,
    pub pong_timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodbyePayload {
    pub reason: String,
}

impl Message {
    pub fn new(kind: MessageKind, payload: Payload, sender_id: NodeId) -> Self {
        Self::with_timestamp(kind, payload, sender_id, Utc::now())
    }

    pub fn with_timestamp(
        kind: MessageKind,
        payload: Payload,
        sender_id: NodeId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            payload,
            timestamp,
            sender_id,
        }
    }

    pub fn hello(sender: &NodeId, address: &PeerAddress) -> Self {
        Self::new(
            MessageKind::Hello,
            object(json!({
                "version": PROTOCOL_VERSION,
                "capabilities": CAPABILITIES,
                "address": address,
            })),
            sender.clone(),
        )
    }

    pub fn peer_list(sender: &NodeId, peers: &[PeerSummary]) -> Self {
        Self::new(
            MessageKind::PeerList,
            object(json!({ "peers": peers })),
            sender.clone(),
        )
    }

    pub fn file_list(sender: &NodeId, files: &[ContentId]) -> Self {
        Self::new(
            MessageKind::FileList,
            object(json!({ "files": files })),
            sender.clone(),
        )
    }

    pub fn file_request(sender: &NodeId, file_id: &ContentId) -> Self {
        Self::new(
            MessageKind::FileRequest,
            object(json!({ "file_id": file_id })),
            sender.clone(),
        )
    }

    pub fn file_response(sender: &NodeId, file_id: &ContentId, data: &[u8]) -> Self {
        Self::new(
            MessageKind::FileResponse,
            object(json!({ "file_id": file_id, "data": hex::encode(data) })),
            sender.clone(),
        )
    }

    pub fn ping(sender: &NodeId) -> Self {
        Self::new(
            MessageKind::Ping,
            object(json!({ "timestamp": format_timestamp(&Utc::now()) })),
            sender.clone(),
        )
    }

    /// Answer to a ping, echoing its timestamp next to our own.
    pub fn pong(sender: &NodeId, ping_timestamp: &str) -> Self {
        Self::new(
            MessageKind::Pong,
            object(json!({
                "ping_timestamp": ping_timestamp,
                "pong_timestamp": format_timestamp(&Utc::now()),
            })),
            sender.clone(),
        )
    }

    pub fn goodbye(sender: &NodeId) -> Self {
        Self::new(
            MessageKind::Goodbye,
            object(json!({ "reason": "normal_shutdown" })),
            sender.clone(),
        )
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn sender_id(&self) -> &NodeId {
        &self.sender_id
    }

    /// Reads a string field of the payload.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Deserializes the payload into its typed shape.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            ProtocolError::InvalidPayload {
                kind: self.kind.as_str(),
                reason: e.to_string(),
            }
        })
    }
}

/// Wraps a JSON object literal as a payload map.
pub fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parses RFC 3339, falling back to offset-less ISO-8601 read as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ProtocolError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| ProtocolError::InvalidTimestamp(raw.to_string()))
}

/// Serde adapter for record timestamps: written as RFC 3339, read with
/// [`parse_timestamp`] so offset-less ISO-8601 from the authority is accepted.
pub mod timestamp_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(timestamp))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    data: Payload,
    timestamp: String,
    sender_id: String,
}

fn encode_body(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let wire = WireMessage {
        kind: message.kind.as_str().to_string(),
        data: message.payload.clone(),
        timestamp: format_timestamp(&message.timestamp),
        sender_id: message.sender_id.as_str().to_string(),
    };
    Ok(serde_json::to_vec(&wire)?)
}

fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let wire: WireMessage = serde_json::from_slice(body)?;
    let kind = MessageKind::parse(&wire.kind).ok_or(ProtocolError::UnknownType(wire.kind))?;
    let timestamp = parse_timestamp(&wire.timestamp)?;
    Ok(Message {
        kind,
        payload: wire.data,
        timestamp,
        sender_id: NodeId(wire.sender_id),
    })
}

/// Encodes one length-prefixed frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = BytesMut::new();
    MessageCodec::new().encode(message.clone(), &mut frame)?;
    Ok(frame.to_vec())
}

/// Decodes exactly one length-prefixed frame.
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    let Some(declared) = declared_len(frame) else {
        return Err(ProtocolError::Truncated(frame.len()));
    };
    let mut buffer = BytesMut::from(frame);
    match MessageCodec::new().decode(&mut buffer)? {
        Some(message) if buffer.is_empty() => Ok(message),
        _ => Err(ProtocolError::LengthMismatch {
            declared,
            actual: frame.len() - LENGTH_PREFIX,
        }),
    }
}

fn declared_len(buf: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX] = buf.get(..LENGTH_PREFIX)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Streaming form of [`encode`]/[`decode`] for framed sockets.
///
/// Framing is a [`LengthDelimitedCodec`] with a 4-byte big-endian prefix;
/// each frame body is one JSON message.
#[derive(Debug)]
pub struct MessageCodec {
    frames: LengthDelimitedCodec,
    max_frame_len: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        let max_frame_len = max_frame_len.min(MAX_FRAME_LEN);
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_PREFIX)
            .big_endian()
            .max_frame_length(max_frame_len)
            .new_codec();
        Self {
            frames,
            max_frame_len,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

// A clone starts with fresh decode state.
impl Clone for MessageCodec {
    fn clone(&self) -> Self {
        Self::with_max_frame_len(self.max_frame_len)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let declared = declared_len(src);
        match self.frames.decode(src) {
            Ok(Some(body)) => decode_body(&body).map(Some),
            Ok(None) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(ProtocolError::FrameTooLarge {
                len: declared.unwrap_or_default(),
                max: self.max_frame_len,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = encode_body(&message)?;
        if body.len() > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_len,
            });
        }
        self.frames.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}
