//! # Palaver - Decentralized PubSub Message Bus
//!
//! Palaver is a GossipSub-style epidemic broadcast engine: nodes join named
//! topics, maintain a bounded-degree mesh of peers per topic, and flood
//! published messages through the mesh with deduplication, admission
//! control, and peer reputation scoring.
//!
//! ## Architecture
//!
//! One [`GossipEngine`] serves one authorization realm. The engine is
//! transport-agnostic: the network, the membership oracle, and the peer
//! connectivity feed are injected as capability traits at construction, so
//! the same engine runs over QUIC in production and over an in-memory
//! loopback in tests.
//!
//! While started, the engine drives three background tasks (inbound
//! processing, peer events, heartbeat maintenance); everything else happens
//! on the caller's task, with per-send fan-out tasks spawned so one slow
//! peer cannot block delivery to the rest.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `engine` | Engine lifecycle, publish/forward pipeline, heartbeat |
//! | `topic` | Topic handles, subscriptions, local delivery |
//! | `mesh` | Per-topic bounded-degree mesh membership |
//! | `score` | Multi-component decaying peer reputation |
//! | `dedup` | Seen-set and bounded message cache |
//! | `validate` | Size/structure/membership/predicate admission |
//! | `backoff` | Exponential backoff for failed graft dials |
//! | `wire` | Wire message shape, ids, bounded codec |
//! | `protocols` | Capability traits (transport, membership, events, health) |
//! | `config` | Tunables and defaults |
//! | `peer` | Peer identifiers |

mod backoff;
mod config;
mod dedup;
mod engine;
mod mesh;
mod peer;
mod protocols;
mod score;
mod topic;
mod validate;
pub mod wire;

pub use config::{GossipConfig, MeshDegree};
pub use engine::{EngineError, EngineParams, GossipEngine, PublishError};
pub use peer::PeerId;
pub use protocols::{HealthSink, InboundFrame, MembershipOracle, PeerEvent, PeerEventFeed, Transport};
pub use score::{PeerScorer, ScoreParams, TopicScoreParams};
pub use topic::{GossipMessage, Subscription, SubscriptionError, Topic, TopicPeerEvent};
pub use validate::{ValidationError, ValidationPredicate};
pub use wire::{derive_message_id, protocol_id, MessageId, WireMessage};
