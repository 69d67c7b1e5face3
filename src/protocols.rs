//! Capability traits consumed and produced by the gossip engine.
//!
//! The engine is transport-agnostic: everything it needs from the outside
//! world arrives through the small traits defined here, injected at
//! construction. Implementations live elsewhere (a QUIC stack, a test
//! loopback, a simulator).
//!
//! | Trait | Direction | Purpose |
//! |-------|-----------|---------|
//! | [`Transport`] | consumed | framed sends, dials, liveness, inbound registration |
//! | [`MembershipOracle`] | consumed | realm membership admission |
//! | [`PeerEventFeed`] | consumed | connected/disconnected notifications |
//! | [`HealthSink`] | produced | per-send success/failure signals for higher layers |

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::peer::PeerId;

/// One framed message received from a peer on a registered protocol.
#[derive(Debug)]
pub struct InboundFrame {
    /// The immediate peer the frame arrived from (the forwarder, not
    /// necessarily the message's original sender).
    pub from: PeerId,
    /// The complete frame payload; one wire message per frame.
    pub frame: Vec<u8>,
}

/// Byte-level peer transport.
///
/// Streams, framing, and connection management are the implementor's
/// problem; the engine only sends and receives complete frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream to `to` under `protocol`, write one frame, close.
    async fn send_frame(&self, to: &PeerId, protocol: &str, frame: Vec<u8>) -> Result<()>;

    /// Register the inbound handler channel for a protocol identifier.
    /// Frames arriving for `protocol` are delivered to `tx`.
    fn register_inbound(&self, protocol: &str, tx: mpsc::Sender<InboundFrame>);

    /// Whether a live connection to the peer currently exists.
    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Proactively establish a connection to the peer.
    async fn dial(&self, peer: &PeerId) -> Result<()>;

    /// Peers for which the transport holds a reachable address, connected or
    /// not. Used to bootstrap mesh formation before membership propagation
    /// completes.
    fn peers_with_known_addr(&self) -> Vec<PeerId>;

    /// The network address observed for a connected peer, if any. Feeds
    /// colocation scoring; `None` disables the penalty for that peer.
    fn observed_addr(&self, peer: &PeerId) -> Option<String>;
}

/// Membership oracle for one authorization realm.
///
/// Non-system-topic traffic is admitted only from peers the oracle
/// recognizes. The oracle is expected to be cheap to query.
pub trait MembershipOracle: Send + Sync {
    fn is_member(&self, peer: &PeerId) -> bool;
    fn members(&self) -> Vec<PeerId>;
}

/// Connectivity change notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// Subscribable feed of [`PeerEvent`]s.
pub trait PeerEventFeed: Send + Sync {
    /// A fresh receiver observing all future events.
    fn subscribe(&self) -> mpsc::Receiver<PeerEvent>;
}

/// Optional sink for send-level health signals, so higher layers can detect
/// network degradation without scraping logs.
pub trait HealthSink: Send + Sync {
    fn on_send_success(&self, peer: &PeerId);
    fn on_send_error(&self, peer: &PeerId, error: &anyhow::Error);
}
