//! Wire message shape and codec.
//!
//! A single framed [`WireMessage`] travels per stream; the transport layer
//! below handles framing, so this module only defines the field set and a
//! bounded bincode codec. The field set is fixed (sender, payload, topic,
//! sequence number) and bincode keeps it forward-compatible enough for this
//! protocol's needs.
//!
//! ## Message identity
//!
//! Messages are identified by a 32-byte [`MessageId`] computed as
//! `blake3(sender || seqno)`. The id is always derived locally from the
//! received fields and never trusted off the wire.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::peer::PeerId;

/// Deduplication key for a message: `blake3(sender || seqno)`.
pub type MessageId = [u8; 32];

/// Hard ceiling for deserialization buffers, independent of the configured
/// per-message payload limit. Prevents OOM from a hostile length prefix.
pub const MAX_DESERIALIZE_SIZE: u64 = 2 * 1024 * 1024;

/// Protocol identifier version suffix.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Build the protocol identifier for one realm: `/palaver/<realm>/pubsub/1.0`.
///
/// One identifier per authorization realm the engine serves; the inbound
/// handler registered under it receives one framed message per stream.
pub fn protocol_id(realm: &str) -> String {
    format!("/palaver/{realm}/pubsub/{PROTOCOL_VERSION}")
}

/// A published message as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Originating peer (not necessarily the peer that forwarded to us).
    pub sender: PeerId,
    /// Application payload, opaque to the engine.
    pub payload: Vec<u8>,
    /// Topic name the message was published under.
    pub topic: String,
    /// Sender-scoped sequence number bytes; (sender, seqno) is unique.
    pub seqno: Vec<u8>,
}

impl WireMessage {
    /// Derive the deduplication id from sender and sequence number.
    pub fn id(&self) -> MessageId {
        derive_message_id(&self.sender, &self.seqno)
    }

    /// Approximate in-memory footprint, used for cache accounting in logs.
    pub fn size_bytes(&self) -> usize {
        self.sender.as_str().len() + self.payload.len() + self.topic.len() + self.seqno.len()
    }
}

/// Compute a message id without constructing a full message.
pub fn derive_message_id(sender: &PeerId, seqno: &[u8]) -> MessageId {
    let mut input = Vec::with_capacity(sender.as_str().len() + seqno.len());
    input.extend_from_slice(sender.as_str().as_bytes());
    input.extend_from_slice(seqno);
    *blake3::hash(&input).as_bytes()
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Serialize a value for the wire.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with the size bound enforced. Always use this instead of raw
/// `bincode::deserialize` for data that crossed the network.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}
