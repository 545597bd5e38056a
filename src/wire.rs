//! Wire format for the controller <-> minion (and NMS client) byte streams.
//!
//! Each TCP stream carries length-delimited frames; a frame is a
//! bincode-serialized [`Envelope`]. The body is itself a bincode-serialized
//! [`Message`], optionally gzip-compressed per message at the sender's
//! discretion. Receivers always decompress before app dispatch.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::messages::Message;

/// Maximum frame size accepted off the wire (defensive bound well above any
/// legitimate envelope; topology dumps for large networks fit comfortably).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bodies at or above this size are gzip-compressed when the sender opts in.
pub const COMPRESSION_THRESHOLD: usize = 4096;

/// Addressed message envelope.
///
/// `dest_node` is empty for "the process on the other end of this stream"
/// (minion -> controller) or for a local app (within one process).
/// `sender_node` is filled by brokers when an envelope is relayed on
/// behalf of another peer (e.g. an NMS client addressing a minion), so
/// replies can find their way back; direct senders leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub dest_node: String,
    pub dest_app: String,
    pub sender_node: String,
    pub sender_app: String,
    pub compressed: bool,
    pub body: Vec<u8>,
}

/// Errors from envelope encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("envelope serialization failed: {0}")]
    Serialize(#[source] bincode::Error),
    #[error("envelope deserialization failed: {0}")]
    Deserialize(#[source] bincode::Error),
    #[error("body compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("body decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
}

impl Envelope {
    /// Build an envelope around a message, compressing large bodies when
    /// `compress` is set.
    pub fn new(
        dest_node: impl Into<String>,
        dest_app: impl Into<String>,
        sender_app: impl Into<String>,
        message: &Message,
        compress: bool,
    ) -> Result<Self, WireError> {
        let raw = bincode::serialize(message).map_err(WireError::Serialize)?;
        let (body, compressed) = if compress && raw.len() >= COMPRESSION_THRESHOLD {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&raw).map_err(WireError::Compress)?;
            (enc.finish().map_err(WireError::Compress)?, true)
        } else {
            (raw, false)
        };
        Ok(Self {
            dest_node: dest_node.into(),
            dest_app: dest_app.into(),
            sender_node: String::new(),
            sender_app: sender_app.into(),
            compressed,
            body,
        })
    }

    /// Decode the carried message, decompressing if needed.
    pub fn message(&self) -> Result<Message, WireError> {
        if self.compressed {
            let mut dec = GzDecoder::new(self.body.as_slice());
            let mut raw = Vec::new();
            dec.read_to_end(&mut raw).map_err(WireError::Decompress)?;
            bincode::deserialize(&raw).map_err(WireError::Deserialize)
        } else {
            bincode::deserialize(&self.body).map_err(WireError::Deserialize)
        }
    }

    /// Serialize the whole envelope into one frame body.
    pub fn to_frame(&self) -> Result<Vec<u8>, WireError> {
        bincode::serialize(self).map_err(WireError::Serialize)
    }

    /// Parse an envelope from a frame body.
    pub fn from_frame(frame: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(frame).map_err(WireError::Deserialize)
    }
}

/// Framed transport over a TCP stream.
pub type WireFramed = Framed<TcpStream, LengthDelimitedCodec>;

/// Wrap a TCP stream with the plane's length-delimited codec.
pub fn framed(stream: TcpStream) -> WireFramed {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_framed(stream)
}

// =============================================================================
// Auth metadata blob
// =============================================================================

/// Encode the auth-observation metadata blob exchanged on accept:
/// `[1 byte keylen][key][4 bytes big-endian vallen][value]`.
///
/// The blob is observational only (address logging); acceptance is
/// unconditional.
pub fn auth_meta_blob(key: &str, value: &str) -> Vec<u8> {
    let key = &key.as_bytes()[..key.len().min(255)];
    let value = value.as_bytes();
    let mut blob = Vec::with_capacity(key.len() + value.len() + 5);
    blob.push(key.len() as u8);
    blob.extend_from_slice(key);
    blob.extend_from_slice(&(value.len() as u32).to_be_bytes());
    blob.extend_from_slice(value);
    blob
}

/// Parse an auth metadata blob back into `(key, value)`.
pub fn parse_auth_meta_blob(blob: &[u8]) -> Option<(String, String)> {
    let key_len = *blob.first()? as usize;
    if blob.len() < 1 + key_len + 4 {
        return None;
    }
    let key = String::from_utf8(blob[1..1 + key_len].to_vec()).ok()?;
    let val_len =
        u32::from_be_bytes(blob[1 + key_len..1 + key_len + 4].try_into().ok()?) as usize;
    if blob.len() < 1 + key_len + 4 + val_len {
        return None;
    }
    let value = String::from_utf8(blob[1 + key_len + 4..1 + key_len + 4 + val_len].to_vec()).ok()?;
    Some((key, value))
}

/// Metadata property under which peer addresses are recorded.
pub const IP_ADDRESS_META_PROPERTY: &str = "X-Ip-Address";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{E2eAck, StatusReport};

    #[test]
    fn test_envelope_round_trip_uncompressed() {
        let msg = Message::E2eAck(E2eAck::ok("fine"));
        let env = Envelope::new("node-1", "ctrl-app-STATUS_APP", "minion-app-STATUS_APP", &msg, false)
            .unwrap();
        assert!(!env.compressed);
        let frame = env.to_frame().unwrap();
        let back = Envelope::from_frame(&frame).unwrap();
        assert_eq!(back.dest_node, "node-1");
        assert_eq!(back.message().unwrap(), msg);
    }

    #[test]
    fn test_envelope_compresses_large_bodies() {
        let mut report = StatusReport::default();
        report.config_md5 = "0".repeat(2 * COMPRESSION_THRESHOLD);
        let msg = Message::StatusReport(report);
        let env = Envelope::new("", "a", "b", &msg, true).unwrap();
        assert!(env.compressed);
        // Repetitive payload should actually shrink.
        assert!(env.body.len() < 2 * COMPRESSION_THRESHOLD);
        assert_eq!(env.message().unwrap(), msg);
    }

    #[test]
    fn test_small_bodies_left_alone_even_when_compression_requested() {
        let msg = Message::DealerEcho;
        let env = Envelope::new("", "a", "b", &msg, true).unwrap();
        assert!(!env.compressed);
        assert_eq!(env.message().unwrap(), msg);
    }

    #[test]
    fn test_auth_meta_blob_round_trip() {
        let blob = auth_meta_blob(IP_ADDRESS_META_PROPERTY, "2001:db8::1");
        assert_eq!(blob[0] as usize, IP_ADDRESS_META_PROPERTY.len());
        let (key, value) = parse_auth_meta_blob(&blob).unwrap();
        assert_eq!(key, IP_ADDRESS_META_PROPERTY);
        assert_eq!(value, "2001:db8::1");
    }

    #[test]
    fn test_auth_meta_blob_truncated_input() {
        let blob = auth_meta_blob("k", "value");
        assert!(parse_auth_meta_blob(&blob[..3]).is_none());
        assert!(parse_auth_meta_blob(&[]).is_none());
    }
}
