//! Decoded inbound envelopes
//!
//! Envelope encoding belongs to the serialization layer; the transport only
//! needs the fields that drive lane assignment and dispatch.

use crate::demux::PartitionKey;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Recipient actor resolved by the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientRef {
    pub path: String,
    /// Uniqueness token of the recipient's path incarnation
    pub uid: i32,
}

/// Envelope after decoding, before dispatch into the actor runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    /// `None` when the recipient is unknown on this node
    pub recipient: Option<RecipientRef>,
    /// Session token of the originating peer system
    pub origin_uid: u64,
    /// Medium session the envelope arrived on
    pub session_id: i32,
    pub stream_id: i32,
    pub payload: Bytes,
}

impl InboundEnvelope {
    pub fn partition_key(&self) -> Option<PartitionKey> {
        self.recipient.as_ref().map(|recipient| PartitionKey {
            recipient_uid: recipient.uid,
            origin_uid: self.origin_uid,
        })
    }
}

/// Serialization collaborator turning reassembled buffers into envelopes
pub trait EnvelopeDecoder: Send + Sync {
    fn decode(&self, session_id: i32, stream_id: i32, buffer: Bytes) -> Result<InboundEnvelope>;
}

/// Dispatch collaborator delivering envelopes into the actor runtime
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, envelope: InboundEnvelope) -> Result<()>;
}
