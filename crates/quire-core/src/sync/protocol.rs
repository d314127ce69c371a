//! Replication protocol messages and framing
//!
//! Messages are serialized with postcard and sent as length-delimited frames
//! over any duplex byte stream.
//!
//! ## Message Flow
//!
//! ```text
//! Peer A                                Peer B
//!   |                                     |
//!   |--- Handshake {nonce, proof} ------->|
//!   |<-- Handshake {nonce, proof} --------|
//!   |                                     |
//!   |--- Offer {W, 2} ------------------->|   B has head(W) = 0
//!   |<-- Request {W, 1} ------------------|
//!   |--- Entry (envelope W#1) ----------->|
//!   |<-- Request {W, 2} ------------------|
//!   |--- Entry (envelope W#2) ----------->|
//!   |                                     |
//!   |<-- Offer {V, 0} --------------------|   push-on-write
//!   |          ...                        |
//!   |--- Keepalive ---------------------->|   nothing sent for a while
//! ```

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use crate::error::SyncError;
use crate::sync::envelope::Envelope;
use crate::types::{DiscoveryKey, WriterKey};

/// Messages exchanged by a replication session, in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Proof of the replication key; must be the first message
    Handshake {
        /// Group the sender wants to replicate
        discovery_key: DiscoveryKey,
        /// Fresh random nonce chosen by the sender
        nonce: [u8; 32],
        /// Keyed hash over (discovery key, sender id, nonce)
        proof: [u8; 32],
    },

    /// "I have an entry at this position"
    Offer { writer: WriterKey, index: u64 },

    /// "Send me that entry"
    Request { writer: WriterKey, index: u64 },

    /// A requested entry
    Entry(Envelope),

    /// Diagnostic: the entry received at this position failed validation
    Invalid {
        writer: WriterKey,
        index: u64,
        reason: String,
    },

    /// Terminal: the sender is closing the session
    Error { reason: String },

    /// Sent when nothing else was for half the idle timeout
    Keepalive,
}

impl ReplicationMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationMessage::Handshake { .. } => "handshake",
            ReplicationMessage::Offer { .. } => "offer",
            ReplicationMessage::Request { .. } => "request",
            ReplicationMessage::Entry(_) => "entry",
            ReplicationMessage::Invalid { .. } => "invalid",
            ReplicationMessage::Error { .. } => "error",
            ReplicationMessage::Keepalive => "keepalive",
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, ReplicationMessage::Handshake { .. })
    }
}

/// Wrapper for versioned messages
///
/// New versions can be added as variants without breaking existing nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Protocol version 1
    V1(ReplicationMessage),
}

impl WireMessage {
    pub fn new(msg: ReplicationMessage) -> Self {
        WireMessage::V1(msg)
    }

    /// Encode wire message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode wire message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    pub fn into_inner(self) -> ReplicationMessage {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}

impl From<ReplicationMessage> for WireMessage {
    fn from(msg: ReplicationMessage) -> Self {
        WireMessage::new(msg)
    }
}

/// Length-delimited postcard codec for [`WireMessage`]
#[derive(Debug)]
pub struct ReplicationCodec {
    frames: LengthDelimitedCodec,
}

impl ReplicationCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(max_message_size)
                .new_codec(),
        }
    }
}

impl Decoder for ReplicationCodec {
    type Item = WireMessage;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => WireMessage::decode(&frame)
                .map(Some)
                .map_err(|e| SyncError::Protocol(format!("Malformed message: {}", e))),
            None => Ok(None),
        }
    }
}

impl Encoder<WireMessage> for ReplicationCodec {
    type Error = SyncError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item
            .encode()
            .map_err(|e| SyncError::Serialization(format!("Failed to encode message: {}", e)))?;
        self.frames.encode(Bytes::from(data), dst)?;
        Ok(())
    }
}

/// Frame a duplex stream for replication
pub fn framed<T>(io: T, max_message_size: usize) -> Framed<T, ReplicationCodec>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, ReplicationCodec::new(max_message_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};

    #[tokio::test]
    async fn test_frames_cross_a_duplex_stream() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = framed(a, 1024 * 1024);
        let mut b = framed(b, 1024 * 1024);

        let offer = ReplicationMessage::Offer {
            writer: WriterKey([1; 32]),
            index: 41,
        };
        a.send(WireMessage::new(offer.clone())).await.unwrap();
        a.send(WireMessage::new(ReplicationMessage::Error {
            reason: "bye".into(),
        }))
        .await
        .unwrap();

        let first = b.next().await.unwrap().unwrap();
        assert_eq!(first.version(), 1);
        assert_eq!(first.into_inner(), offer);
        let second = b.next().await.unwrap().unwrap().into_inner();
        assert_eq!(second.kind(), "error");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut a = framed(a, 1024 * 1024);
        let mut b = framed(b, 1024);

        let huge = ReplicationMessage::Error {
            reason: "x".repeat(4096),
        };
        a.send(WireMessage::new(huge)).await.unwrap();

        assert!(matches!(b.next().await, Some(Err(SyncError::Io(_)))));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_protocol_error() {
        use tokio::io::AsyncWriteExt;

        let (mut a, b) = tokio::io::duplex(4096);
        let mut b = framed(b, 1024);

        // 4-byte big-endian length followed by an unknown variant tag
        a.write_all(&[0, 0, 0, 2, 0xFF, 0xFF]).await.unwrap();

        assert!(matches!(b.next().await, Some(Err(SyncError::Protocol(_)))));
    }
}
