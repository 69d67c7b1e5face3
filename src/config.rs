//! Engine configuration.
//!
//! All tunable parameters in one place, with named default constants. Topic
//! scoring parameters live in [`crate::score`] next to the code that
//! interprets them; [`GossipConfig`] embeds them.

use std::time::Duration;

use crate::score::ScoreParams;

/// D - target mesh degree per topic.
pub const DEFAULT_MESH_D: usize = 6;

/// D_lo - mesh degree floor; below this the topic is considered starved.
pub const DEFAULT_MESH_D_LO: usize = 4;

/// D_hi - mesh degree hard cap; the add path never exceeds this.
pub const DEFAULT_MESH_D_HI: usize = 12;

/// Interval between heartbeat maintenance rounds.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Deadline for a single fan-out send. Derived from the heartbeat order of
/// magnitude so one unresponsive peer cannot pin a fan-out task for long.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for proactive dials during grafting, deliberately shorter than
/// the steady-state send timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum message payload size (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum number of cached message bodies.
pub const DEFAULT_CACHE_MAX_MESSAGES: usize = 10_000;

/// Time-to-live for cached message bodies.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(120);

/// Time-to-live for seen-set entries. Longer than the cache TTL: duplicate
/// rejection must outlive the message bodies themselves.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(600);

/// Interval between TTL sweeps of cache, seen-set and backoff records.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// First dial-failure backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Dial-failure backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Idle expiry for backoff records.
pub const DEFAULT_BACKOFF_IDLE_EXPIRY: Duration = Duration::from_secs(900);

/// Bounded per-subscription queue depth; pushes drop when full.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

/// Maximum topic name length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Topic names are non-empty printable ASCII of bounded length.
#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

/// Mesh degree policy: target, floor and hard cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshDegree {
    pub d: usize,
    pub d_lo: usize,
    pub d_hi: usize,
}

impl Default for MeshDegree {
    fn default() -> Self {
        Self {
            d: DEFAULT_MESH_D,
            d_lo: DEFAULT_MESH_D_LO,
            d_hi: DEFAULT_MESH_D_HI,
        }
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Mesh degree policy applied to every topic.
    pub degree: MeshDegree,
    /// Interval between heartbeat rounds.
    pub heartbeat_interval: Duration,
    /// Per-send deadline during fan-out.
    pub send_timeout: Duration,
    /// Per-dial deadline during grafting.
    pub dial_timeout: Duration,
    /// Maximum accepted payload size in bytes.
    pub max_message_size: usize,
    /// Message cache capacity.
    pub cache_max_messages: usize,
    /// Message cache TTL.
    pub cache_ttl: Duration,
    /// Seen-set TTL.
    pub seen_ttl: Duration,
    /// Cadence of cache/seen/backoff sweeps (multiple heartbeats).
    pub sweep_interval: Duration,
    /// Initial dial-failure backoff.
    pub backoff_base: Duration,
    /// Dial-failure backoff ceiling.
    pub backoff_max: Duration,
    /// Idle expiry for dial-failure records.
    pub backoff_idle_expiry: Duration,
    /// Per-subscription queue depth.
    pub subscription_buffer: usize,
    /// Topics exempt from sender-membership admission (membership
    /// synchronization bootstrap). The forwarding peer is never exempted.
    pub system_topics: Vec<String>,
    /// Peer scoring parameters.
    pub score: ScoreParams,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            degree: MeshDegree::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            cache_max_messages: DEFAULT_CACHE_MAX_MESSAGES,
            cache_ttl: DEFAULT_CACHE_TTL,
            seen_ttl: DEFAULT_SEEN_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            backoff_idle_expiry: DEFAULT_BACKOFF_IDLE_EXPIRY,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            system_topics: Vec::new(),
            score: ScoreParams::default(),
        }
    }
}

impl GossipConfig {
    /// Whether a topic bypasses sender-membership admission.
    pub fn is_system_topic(&self, topic: &str) -> bool {
        self.system_topics.iter().any(|t| t == topic)
    }
}
