//! Peer reputation scoring.
//!
//! Computes one real-valued score per peer by combining per-topic delivery
//! behaviour with global signals, every counter decaying toward zero over
//! time. The engine consults the score to filter graft candidates, order
//! prune victims, and graylist misbehaving peers.
//!
//! Score composition per peer:
//!
//! | Component | Sign | Source |
//! |-----------|------|--------|
//! | P1 time in mesh | + | capped quotient of mesh time over a quantum |
//! | P2 first deliveries | + | capped decaying counter |
//! | P3 mesh delivery deficit | - | squared shortfall below a threshold, after activation |
//! | P3b mesh failure penalty | - | accrued at prune time from the P3 deficit |
//! | P4 invalid messages | - | squared decaying counter |
//! | P5 application score | +/- | set externally |
//! | P6 address colocation | - | squared excess over the per-address threshold |
//! | P7 behaviour penalty | - | applied only above a threshold |
//!
//! P1 through P4 are weighted per topic and summed across topics; one
//! parameter set applies to every topic.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::peer::PeerId;

/// P1 weight.
pub const DEFAULT_TIME_IN_MESH_WEIGHT: f64 = 1.0;
/// P1 quantum; one point per quantum spent in the mesh.
pub const DEFAULT_TIME_IN_MESH_QUANTUM: Duration = Duration::from_secs(1);
/// P1 contribution cap.
pub const DEFAULT_TIME_IN_MESH_CAP: f64 = 3600.0;

/// P2 weight.
pub const DEFAULT_FIRST_MESSAGE_DELIVERIES_WEIGHT: f64 = 1.0;
/// P2 decay per interval.
pub const DEFAULT_FIRST_MESSAGE_DELIVERIES_DECAY: f64 = 0.9;
/// P2 counter cap.
pub const DEFAULT_FIRST_MESSAGE_DELIVERIES_CAP: f64 = 100.0;

/// P3 weight (0 = disabled).
pub const DEFAULT_MESH_MESSAGE_DELIVERIES_WEIGHT: f64 = 0.0;
/// P3 decay per interval.
pub const DEFAULT_MESH_MESSAGE_DELIVERIES_DECAY: f64 = 0.9;
/// P3 delivery-rate threshold.
pub const DEFAULT_MESH_MESSAGE_DELIVERIES_THRESHOLD: f64 = 1.0;
/// P3 activation delay after graft.
pub const DEFAULT_MESH_MESSAGE_DELIVERIES_ACTIVATION: Duration = Duration::from_secs(60);

/// P3b weight (0 = disabled).
pub const DEFAULT_MESH_FAILURE_PENALTY_WEIGHT: f64 = 0.0;
/// P3b decay per interval.
pub const DEFAULT_MESH_FAILURE_PENALTY_DECAY: f64 = 0.9;

/// P4 weight, strongly negative.
pub const DEFAULT_INVALID_MESSAGE_WEIGHT: f64 = -100.0;
/// P4 decay per interval, deliberately slow.
pub const DEFAULT_INVALID_MESSAGE_DECAY: f64 = 0.99;

/// P5 weight.
pub const DEFAULT_APP_WEIGHT: f64 = 1.0;
/// P6 weight.
pub const DEFAULT_COLOCATION_WEIGHT: f64 = -10.0;
/// P6 per-address peer threshold before the penalty starts.
pub const DEFAULT_COLOCATION_THRESHOLD: usize = 2;

/// P7 weight.
pub const DEFAULT_BEHAVIOUR_WEIGHT: f64 = -10.0;
/// P7 activation threshold; small penalties are forgiven entirely.
pub const DEFAULT_BEHAVIOUR_THRESHOLD: f64 = 6.0;
/// P7 decay per interval.
pub const DEFAULT_BEHAVIOUR_DECAY: f64 = 0.99;
/// P7 increment per failed fan-out send.
pub const DEFAULT_DELIVERY_FAILURE_INCREMENT: f64 = 1.0;

/// Interval between decay applications.
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(10);
/// Counters below this are snapped to zero during decay.
pub const DEFAULT_DECAY_TO_ZERO: f64 = 0.01;
/// How long a disconnected, silent peer's stats are retained.
pub const DEFAULT_SCORE_RETENTION: Duration = Duration::from_secs(3600);

/// Below this a peer is not offered gossip or grafted.
pub const DEFAULT_GOSSIP_THRESHOLD: f64 = -500.0;
/// Below this a peer's messages are not published to.
pub const DEFAULT_PUBLISH_THRESHOLD: f64 = -1000.0;
/// Below this everything from the peer is ignored.
pub const DEFAULT_GRAYLIST_THRESHOLD: f64 = -2500.0;
/// Above this a peer is trusted for peer-exchange style introductions.
pub const DEFAULT_ACCEPT_PX_THRESHOLD: f64 = 100.0;

/// Per-topic scoring weights. One instance applies to all topics.
#[derive(Clone, Debug)]
pub struct TopicScoreParams {
    /// Weight of each topic's contribution in the overall score.
    pub topic_weight: f64,

    // P1
    pub time_in_mesh_weight: f64,
    pub time_in_mesh_quantum: Duration,
    pub time_in_mesh_cap: f64,

    // P2
    pub first_message_deliveries_weight: f64,
    pub first_message_deliveries_decay: f64,
    pub first_message_deliveries_cap: f64,

    // P3
    pub mesh_message_deliveries_weight: f64,
    pub mesh_message_deliveries_decay: f64,
    pub mesh_message_deliveries_threshold: f64,
    pub mesh_message_deliveries_activation: Duration,

    // P3b
    pub mesh_failure_penalty_weight: f64,
    pub mesh_failure_penalty_decay: f64,

    // P4
    pub invalid_message_deliveries_weight: f64,
    pub invalid_message_deliveries_decay: f64,
}

impl Default for TopicScoreParams {
    fn default() -> Self {
        Self {
            topic_weight: 1.0,
            time_in_mesh_weight: DEFAULT_TIME_IN_MESH_WEIGHT,
            time_in_mesh_quantum: DEFAULT_TIME_IN_MESH_QUANTUM,
            time_in_mesh_cap: DEFAULT_TIME_IN_MESH_CAP,
            first_message_deliveries_weight: DEFAULT_FIRST_MESSAGE_DELIVERIES_WEIGHT,
            first_message_deliveries_decay: DEFAULT_FIRST_MESSAGE_DELIVERIES_DECAY,
            first_message_deliveries_cap: DEFAULT_FIRST_MESSAGE_DELIVERIES_CAP,
            mesh_message_deliveries_weight: DEFAULT_MESH_MESSAGE_DELIVERIES_WEIGHT,
            mesh_message_deliveries_decay: DEFAULT_MESH_MESSAGE_DELIVERIES_DECAY,
            mesh_message_deliveries_threshold: DEFAULT_MESH_MESSAGE_DELIVERIES_THRESHOLD,
            mesh_message_deliveries_activation: DEFAULT_MESH_MESSAGE_DELIVERIES_ACTIVATION,
            mesh_failure_penalty_weight: DEFAULT_MESH_FAILURE_PENALTY_WEIGHT,
            mesh_failure_penalty_decay: DEFAULT_MESH_FAILURE_PENALTY_DECAY,
            invalid_message_deliveries_weight: DEFAULT_INVALID_MESSAGE_WEIGHT,
            invalid_message_deliveries_decay: DEFAULT_INVALID_MESSAGE_DECAY,
        }
    }
}

/// Global scoring parameters and thresholds.
#[derive(Clone, Debug)]
pub struct ScoreParams {
    /// Weights applied to every topic.
    pub topic: TopicScoreParams,
    /// P5 weight.
    pub app_weight: f64,
    /// P6 weight.
    pub colocation_weight: f64,
    /// P6: peers per address tolerated before the penalty starts.
    pub colocation_threshold: usize,
    /// Addresses exempt from the colocation penalty.
    pub colocation_whitelist: Vec<String>,
    /// P7 weight.
    pub behaviour_weight: f64,
    /// P7 is applied only while the raw penalty exceeds this.
    pub behaviour_threshold: f64,
    /// P7 decay per interval.
    pub behaviour_decay: f64,
    /// Raw P7 increment per failed send.
    pub delivery_failure_increment: f64,
    /// Interval between decay applications.
    pub decay_interval: Duration,
    /// Counters below this snap to zero.
    pub decay_to_zero: f64,
    /// Retention window for disconnected peers' stats.
    pub retention: Duration,
    pub gossip_threshold: f64,
    pub publish_threshold: f64,
    pub graylist_threshold: f64,
    pub accept_px_threshold: f64,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            topic: TopicScoreParams::default(),
            app_weight: DEFAULT_APP_WEIGHT,
            colocation_weight: DEFAULT_COLOCATION_WEIGHT,
            colocation_threshold: DEFAULT_COLOCATION_THRESHOLD,
            colocation_whitelist: Vec::new(),
            behaviour_weight: DEFAULT_BEHAVIOUR_WEIGHT,
            behaviour_threshold: DEFAULT_BEHAVIOUR_THRESHOLD,
            behaviour_decay: DEFAULT_BEHAVIOUR_DECAY,
            delivery_failure_increment: DEFAULT_DELIVERY_FAILURE_INCREMENT,
            decay_interval: DEFAULT_DECAY_INTERVAL,
            decay_to_zero: DEFAULT_DECAY_TO_ZERO,
            retention: DEFAULT_SCORE_RETENTION,
            gossip_threshold: DEFAULT_GOSSIP_THRESHOLD,
            publish_threshold: DEFAULT_PUBLISH_THRESHOLD,
            graylist_threshold: DEFAULT_GRAYLIST_THRESHOLD,
            accept_px_threshold: DEFAULT_ACCEPT_PX_THRESHOLD,
        }
    }
}

/// Per-(peer, topic) counters.
#[derive(Clone, Debug, Default)]
struct TopicStats {
    in_mesh: bool,
    /// Start of the current mesh stint.
    graft_time: Option<Instant>,
    /// Mesh time accumulated over completed stints.
    mesh_time_accumulated: Duration,
    first_message_deliveries: f64,
    mesh_message_deliveries: f64,
    mesh_failure_penalty: f64,
    invalid_message_deliveries: f64,
}

impl TopicStats {
    fn mesh_time(&self, now: Instant) -> Duration {
        let current = self
            .graft_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        self.mesh_time_accumulated + current
    }

    fn deliveries_active(&self, params: &TopicScoreParams, now: Instant) -> bool {
        match self.graft_time {
            Some(t) if self.in_mesh => {
                now.saturating_duration_since(t) >= params.mesh_message_deliveries_activation
            }
            _ => false,
        }
    }

    fn calculate(&self, params: &TopicScoreParams, now: Instant) -> f64 {
        let mut score = 0.0;

        if self.in_mesh {
            let quanta = self.mesh_time(now).as_secs_f64()
                / params.time_in_mesh_quantum.as_secs_f64();
            score += params.time_in_mesh_weight * quanta.min(params.time_in_mesh_cap);
        }

        score += params.first_message_deliveries_weight
            * self
                .first_message_deliveries
                .min(params.first_message_deliveries_cap);

        if self.deliveries_active(params, now) {
            let deficit =
                params.mesh_message_deliveries_threshold - self.mesh_message_deliveries;
            if deficit > 0.0 {
                score += params.mesh_message_deliveries_weight * deficit * deficit;
            }
        }

        score += params.mesh_failure_penalty_weight * self.mesh_failure_penalty;

        let invalid = self.invalid_message_deliveries;
        score += params.invalid_message_deliveries_weight * invalid * invalid;

        params.topic_weight * score
    }

    fn decay(&mut self, params: &TopicScoreParams, factor_exp: i32, epsilon: f64) {
        let apply = |value: &mut f64, decay: f64| {
            *value *= decay.powi(factor_exp);
            if *value < epsilon {
                *value = 0.0;
            }
        };
        apply(
            &mut self.first_message_deliveries,
            params.first_message_deliveries_decay,
        );
        apply(
            &mut self.mesh_message_deliveries,
            params.mesh_message_deliveries_decay,
        );
        apply(&mut self.mesh_failure_penalty, params.mesh_failure_penalty_decay);
        apply(
            &mut self.invalid_message_deliveries,
            params.invalid_message_deliveries_decay,
        );
    }
}

/// All retained state for one peer.
#[derive(Clone, Debug)]
struct PeerStats {
    connected: bool,
    first_seen: Instant,
    last_seen: Instant,
    app_score: f64,
    behaviour_penalty: f64,
    topics: HashMap<String, TopicStats>,
}

impl PeerStats {
    fn new(now: Instant) -> Self {
        Self {
            connected: true,
            first_seen: now,
            last_seen: now,
            app_score: 0.0,
            behaviour_penalty: 0.0,
            topics: HashMap::new(),
        }
    }
}

/// Peer count per observed network address. Disconnected peers stay
/// registered until their stats are purged, so reconnect churn cannot reset
/// the penalty.
#[derive(Debug, Default)]
struct ColocationTracker {
    addr_peers: HashMap<String, HashSet<PeerId>>,
    peer_addr: HashMap<PeerId, String>,
}

impl ColocationTracker {
    fn register(&mut self, peer: &PeerId, addr: String) {
        if let Some(old) = self.peer_addr.get(peer) {
            if *old == addr {
                return;
            }
            self.unregister(peer);
        }
        self.addr_peers
            .entry(addr.clone())
            .or_default()
            .insert(peer.clone());
        self.peer_addr.insert(peer.clone(), addr);
    }

    fn unregister(&mut self, peer: &PeerId) {
        if let Some(addr) = self.peer_addr.remove(peer) {
            if let Some(peers) = self.addr_peers.get_mut(&addr) {
                peers.remove(peer);
                if peers.is_empty() {
                    self.addr_peers.remove(&addr);
                }
            }
        }
    }

    /// Squared excess over the threshold, zero when whitelisted or unknown.
    fn penalty(&self, peer: &PeerId, threshold: usize, whitelist: &[String]) -> f64 {
        let Some(addr) = self.peer_addr.get(peer) else {
            return 0.0;
        };
        if whitelist.iter().any(|w| w == addr) {
            return 0.0;
        }
        let count = self.addr_peers.get(addr).map_or(0, |p| p.len());
        if count <= threshold {
            return 0.0;
        }
        let excess = (count - threshold) as f64;
        excess * excess
    }
}

#[derive(Debug)]
struct ScorerState {
    peers: HashMap<PeerId, PeerStats>,
    colocation: ColocationTracker,
    last_decay: Instant,
}

/// Event-driven peer scorer.
///
/// All mutation happens through the event methods; `score` and the threshold
/// queries are pure reads. `maintain` applies decay and retention and is
/// driven from the engine heartbeat.
pub struct PeerScorer {
    params: ScoreParams,
    inner: Mutex<ScorerState>,
}

impl PeerScorer {
    pub fn new(params: ScoreParams) -> Self {
        Self {
            params,
            inner: Mutex::new(ScorerState {
                peers: HashMap::new(),
                colocation: ColocationTracker::default(),
                last_decay: Instant::now(),
            }),
        }
    }

    pub fn params(&self) -> &ScoreParams {
        &self.params
    }

    /// A peer connected. Creates stats on first sight and registers the
    /// observed address for colocation accounting.
    pub fn add_peer(&self, peer: &PeerId, addr: Option<String>) {
        let now = Instant::now();
        let mut state = self.lock();
        let stats = state
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerStats::new(now));
        stats.connected = true;
        stats.last_seen = now;
        if let Some(addr) = addr {
            state.colocation.register(peer, addr);
        }
    }

    /// A peer disconnected. Stats are retained for the retention window and
    /// marked so the sweep can purge them later.
    pub fn remove_peer(&self, peer: &PeerId) {
        let mut state = self.lock();
        if let Some(stats) = state.peers.get_mut(peer) {
            stats.connected = false;
            stats.last_seen = Instant::now();
        }
    }

    /// The peer entered a topic's mesh.
    pub fn graft(&self, peer: &PeerId, topic: &str) {
        let now = Instant::now();
        let mut state = self.lock();
        let stats = state
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerStats::new(now));
        stats.last_seen = now;
        let ts = stats.topics.entry(topic.to_string()).or_default();
        ts.in_mesh = true;
        ts.graft_time = Some(now);
    }

    /// The peer left a topic's mesh. If delivery scoring had activated and
    /// the peer was below threshold, the deficit accrues as a lasting
    /// mesh-failure penalty.
    pub fn prune(&self, peer: &PeerId, topic: &str) {
        let now = Instant::now();
        let params = &self.params.topic;
        let mut state = self.lock();
        let Some(stats) = state.peers.get_mut(peer) else {
            return;
        };
        let Some(ts) = stats.topics.get_mut(topic) else {
            return;
        };
        if ts.deliveries_active(params, now) {
            let deficit = params.mesh_message_deliveries_threshold - ts.mesh_message_deliveries;
            if deficit > 0.0 {
                ts.mesh_failure_penalty += deficit * deficit;
                trace!(peer = %peer, topic, deficit, "mesh failure penalty accrued at prune");
            }
        }
        if let Some(t) = ts.graft_time.take() {
            ts.mesh_time_accumulated += now.saturating_duration_since(t);
        }
        ts.in_mesh = false;
        ts.mesh_message_deliveries = 0.0;
    }

    /// The peer was the first valid deliverer of a message on the topic.
    /// Also counts toward the mesh delivery rate while the peer is in mesh.
    pub fn first_message_delivered(&self, peer: &PeerId, topic: &str) {
        let now = Instant::now();
        let mut state = self.lock();
        let stats = state
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerStats::new(now));
        stats.last_seen = now;
        let ts = stats.topics.entry(topic.to_string()).or_default();
        ts.first_message_deliveries += 1.0;
        if ts.in_mesh {
            ts.mesh_message_deliveries += 1.0;
        }
    }

    /// The peer re-delivered a message we had already seen. Duplicates
    /// within the delivery window still count toward the mesh delivery rate.
    pub fn duplicate_message(&self, peer: &PeerId, topic: &str, within_window: bool) {
        let mut state = self.lock();
        let Some(stats) = state.peers.get_mut(peer) else {
            return;
        };
        stats.last_seen = Instant::now();
        if within_window {
            if let Some(ts) = stats.topics.get_mut(topic) {
                if ts.in_mesh {
                    ts.mesh_message_deliveries += 1.0;
                }
            }
        }
    }

    /// The peer delivered a message that failed validation.
    pub fn invalid_message(&self, peer: &PeerId, topic: &str) {
        let now = Instant::now();
        let mut state = self.lock();
        let stats = state
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerStats::new(now));
        stats.last_seen = now;
        let ts = stats.topics.entry(topic.to_string()).or_default();
        ts.invalid_message_deliveries += 1.0;
        debug!(peer = %peer, topic, count = ts.invalid_message_deliveries, "invalid message recorded");
    }

    /// The peer advertised a message it never delivered. Unused without a
    /// gossip-advertisement layer, kept for callers that run one above.
    pub fn broken_promise(&self, peer: &PeerId) {
        self.add_behaviour_penalty(peer, 1.0);
    }

    /// A fan-out send to the peer failed at the transport level.
    pub fn delivery_failed(&self, peer: &PeerId) {
        self.add_behaviour_penalty(peer, self.params.delivery_failure_increment);
    }

    fn add_behaviour_penalty(&self, peer: &PeerId, amount: f64) {
        let now = Instant::now();
        let mut state = self.lock();
        let stats = state
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerStats::new(now));
        stats.last_seen = now;
        stats.behaviour_penalty += amount;
    }

    /// Set the application-level score component for a peer.
    pub fn set_app_score(&self, peer: &PeerId, value: f64) {
        let now = Instant::now();
        let mut state = self.lock();
        let stats = state
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerStats::new(now));
        stats.app_score = value;
    }

    /// Current score for a peer. Unknown peers score zero.
    pub fn score(&self, peer: &PeerId) -> f64 {
        let now = Instant::now();
        let state = self.lock();
        let Some(stats) = state.peers.get(peer) else {
            return 0.0;
        };
        let mut score = 0.0;
        for ts in stats.topics.values() {
            score += ts.calculate(&self.params.topic, now);
        }
        score += self.params.app_weight * stats.app_score;
        score += self.params.colocation_weight
            * state.colocation.penalty(
                peer,
                self.params.colocation_threshold,
                &self.params.colocation_whitelist,
            );
        if stats.behaviour_penalty > self.params.behaviour_threshold {
            score += self.params.behaviour_weight * stats.behaviour_penalty;
        }
        score
    }

    pub fn is_below_gossip_threshold(&self, peer: &PeerId) -> bool {
        self.score(peer) < self.params.gossip_threshold
    }

    pub fn is_below_publish_threshold(&self, peer: &PeerId) -> bool {
        self.score(peer) < self.params.publish_threshold
    }

    pub fn is_below_graylist_threshold(&self, peer: &PeerId) -> bool {
        self.score(peer) < self.params.graylist_threshold
    }

    pub fn is_above_accept_px_threshold(&self, peer: &PeerId) -> bool {
        self.score(peer) > self.params.accept_px_threshold
    }

    /// Sort peers lowest-scored first, for prune victim selection.
    pub fn rank_ascending(&self, peers: &[PeerId]) -> Vec<PeerId> {
        let mut scored: Vec<(f64, PeerId)> =
            peers.iter().map(|p| (self.score(p), p.clone())).collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.into_iter().map(|(_, p)| p).collect()
    }

    /// Apply decay for every full interval elapsed since the last call, then
    /// purge disconnected peers silent past the retention window.
    pub fn maintain(&self, now: Instant) {
        let params = self.params.clone();
        let mut state = self.lock();

        let elapsed = now.saturating_duration_since(state.last_decay);
        let intervals = if params.decay_interval.is_zero() {
            0
        } else {
            (elapsed.as_millis() / params.decay_interval.as_millis()) as i32
        };
        if intervals > 0 {
            let exp = intervals.min(1_000);
            for stats in state.peers.values_mut() {
                for ts in stats.topics.values_mut() {
                    ts.decay(&params.topic, exp, params.decay_to_zero);
                }
                stats.behaviour_penalty *= params.behaviour_decay.powi(exp);
                if stats.behaviour_penalty < params.decay_to_zero {
                    stats.behaviour_penalty = 0.0;
                }
            }
            state.last_decay += params.decay_interval * intervals as u32;
        }

        let stale: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|(_, s)| {
                !s.connected && now.saturating_duration_since(s.last_seen) > params.retention
            })
            .map(|(p, _)| p.clone())
            .collect();
        for peer in &stale {
            state.peers.remove(peer);
            state.colocation.unregister(peer);
        }
        if !stale.is_empty() {
            debug!(purged = stale.len(), remaining = state.peers.len(), "purged stale peer stats");
        }
    }

    /// Peers currently tracked, for introspection.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.lock().peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScorerState> {
        self.inner.lock().expect("scorer lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(i: usize) -> PeerId {
        PeerId::from(format!("peer-{i}"))
    }

    fn scorer() -> PeerScorer {
        PeerScorer::new(ScoreParams::default())
    }

    #[test]
    fn unknown_peer_scores_zero() {
        assert_eq!(scorer().score(&peer(0)), 0.0);
    }

    #[test]
    fn first_deliveries_raise_score_and_cap() {
        let params = ScoreParams {
            topic: TopicScoreParams {
                first_message_deliveries_cap: 3.0,
                time_in_mesh_weight: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let s = PeerScorer::new(params);
        let p = peer(1);
        s.add_peer(&p, None);

        for _ in 0..5 {
            s.first_message_delivered(&p, "t");
        }
        // Counter is 5 but contribution caps at 3.
        assert_eq!(s.score(&p), 3.0);
    }

    #[test]
    fn invalid_messages_penalize_quadratically() {
        let s = scorer();
        let p = peer(1);
        s.add_peer(&p, None);
        s.invalid_message(&p, "t");
        let one = s.score(&p);
        s.invalid_message(&p, "t");
        let two = s.score(&p);

        assert_eq!(one, DEFAULT_INVALID_MESSAGE_WEIGHT);
        assert_eq!(two, DEFAULT_INVALID_MESSAGE_WEIGHT * 4.0);
        assert!(!s.is_below_gossip_threshold(&p), "-400 is still above the gossip threshold");

        for _ in 0..4 {
            s.invalid_message(&p, "t");
        }
        // Six invalid deliveries squared crosses every threshold.
        assert!(s.is_below_gossip_threshold(&p));
        assert!(s.is_below_publish_threshold(&p));
        assert!(s.is_below_graylist_threshold(&p));
    }

    #[test]
    fn behaviour_penalty_gated_by_threshold() {
        let params = ScoreParams {
            behaviour_threshold: 3.0,
            delivery_failure_increment: 1.0,
            ..Default::default()
        };
        let s = PeerScorer::new(params);
        let p = peer(1);
        s.add_peer(&p, None);

        for _ in 0..3 {
            s.delivery_failed(&p);
        }
        assert_eq!(s.score(&p), 0.0, "penalty at threshold is forgiven");

        s.delivery_failed(&p);
        assert_eq!(s.score(&p), DEFAULT_BEHAVIOUR_WEIGHT * 4.0);
    }

    #[test]
    fn colocation_penalty_is_squared_excess() {
        let s = scorer();
        for i in 0..4 {
            s.add_peer(&peer(i), Some("10.0.0.9".to_string()));
        }
        // Four peers, threshold two: penalty is (4 - 2)^2 = 4 per peer.
        assert_eq!(s.score(&peer(0)), DEFAULT_COLOCATION_WEIGHT * 4.0);
        assert_eq!(s.score(&peer(3)), DEFAULT_COLOCATION_WEIGHT * 4.0);

        // A peer on its own address is unaffected.
        s.add_peer(&peer(9), Some("10.0.0.7".to_string()));
        assert_eq!(s.score(&peer(9)), 0.0);
    }

    #[test]
    fn whitelisted_address_has_no_colocation_penalty() {
        let params = ScoreParams {
            colocation_whitelist: vec!["10.0.0.9".to_string()],
            ..Default::default()
        };
        let s = PeerScorer::new(params);
        for i in 0..4 {
            s.add_peer(&peer(i), Some("10.0.0.9".to_string()));
        }
        assert_eq!(s.score(&peer(0)), 0.0);
    }

    #[test]
    fn app_score_is_weighted_in() {
        let s = scorer();
        let p = peer(1);
        s.add_peer(&p, None);
        s.set_app_score(&p, 50.0);
        assert_eq!(s.score(&p), DEFAULT_APP_WEIGHT * 50.0);
        s.set_app_score(&p, -20.0);
        assert_eq!(s.score(&p), DEFAULT_APP_WEIGHT * -20.0);
    }

    #[test]
    fn time_in_mesh_accrues_while_grafted() {
        let params = ScoreParams {
            topic: TopicScoreParams {
                time_in_mesh_quantum: Duration::from_millis(5),
                ..Default::default()
            },
            ..Default::default()
        };
        let s = PeerScorer::new(params);
        let p = peer(1);
        s.add_peer(&p, None);
        s.graft(&p, "t");
        std::thread::sleep(Duration::from_millis(20));
        assert!(s.score(&p) > 0.0, "grafted peer accrues time-in-mesh score");

        s.prune(&p, "t");
        let after_prune = s.score(&p);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(s.score(&p), after_prune, "mesh time stops accruing after prune");
    }

    #[test]
    fn prune_before_activation_carries_no_failure_penalty() {
        let params = ScoreParams {
            topic: TopicScoreParams {
                mesh_failure_penalty_weight: -1.0,
                mesh_message_deliveries_activation: Duration::from_secs(60),
                time_in_mesh_weight: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let s = PeerScorer::new(params);
        let p = peer(1);
        s.add_peer(&p, None);
        s.graft(&p, "t");
        s.prune(&p, "t");
        assert_eq!(s.score(&p), 0.0);
    }

    #[test]
    fn prune_after_activation_accrues_deficit_penalty() {
        let params = ScoreParams {
            topic: TopicScoreParams {
                mesh_failure_penalty_weight: -1.0,
                mesh_message_deliveries_threshold: 3.0,
                mesh_message_deliveries_activation: Duration::from_millis(10),
                time_in_mesh_weight: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let s = PeerScorer::new(params);
        let p = peer(1);
        s.add_peer(&p, None);
        s.graft(&p, "t");
        std::thread::sleep(Duration::from_millis(25));
        s.prune(&p, "t");
        // Deficit 3 squared, weighted -1.
        assert_eq!(s.score(&p), -9.0);
    }

    #[test]
    fn decay_is_monotone_and_snaps_to_zero() {
        let params = ScoreParams {
            decay_interval: Duration::from_secs(1),
            decay_to_zero: 0.5,
            topic: TopicScoreParams {
                first_message_deliveries_decay: 0.5,
                time_in_mesh_weight: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let s = PeerScorer::new(params);
        let p = peer(1);
        s.add_peer(&p, None);
        s.first_message_delivered(&p, "t");
        s.first_message_delivered(&p, "t");
        assert_eq!(s.score(&p), 2.0);

        let start = Instant::now();
        s.maintain(start + Duration::from_secs(1));
        assert_eq!(s.score(&p), 1.0);

        // 1.0 * 0.5 = 0.5 is below decay_to_zero, snaps to nothing.
        s.maintain(start + Duration::from_secs(2));
        assert_eq!(s.score(&p), 0.0);
    }

    #[test]
    fn multiple_elapsed_intervals_compound() {
        let params = ScoreParams {
            decay_interval: Duration::from_secs(1),
            decay_to_zero: 0.001,
            topic: TopicScoreParams {
                first_message_deliveries_decay: 0.5,
                time_in_mesh_weight: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let s = PeerScorer::new(params);
        let p = peer(1);
        s.add_peer(&p, None);
        for _ in 0..8 {
            s.first_message_delivered(&p, "t");
        }

        s.maintain(Instant::now() + Duration::from_secs(3));
        assert_eq!(s.score(&p), 1.0, "three intervals decay 8 down to 1");
    }

    #[test]
    fn disconnected_peers_purged_after_retention() {
        let params = ScoreParams {
            retention: Duration::from_secs(10),
            ..Default::default()
        };
        let s = PeerScorer::new(params);
        let p = peer(1);
        s.add_peer(&p, Some("10.0.0.9".to_string()));
        s.first_message_delivered(&p, "t");
        s.remove_peer(&p);

        s.maintain(Instant::now() + Duration::from_secs(5));
        assert_eq!(s.len(), 1, "within retention, stats survive");

        s.maintain(Instant::now() + Duration::from_secs(11));
        assert!(s.is_empty(), "past retention, stats are purged");
        assert_eq!(s.score(&p), 0.0);
    }

    #[test]
    fn connected_peers_never_purged() {
        let params = ScoreParams {
            retention: Duration::from_millis(1),
            ..Default::default()
        };
        let s = PeerScorer::new(params);
        s.add_peer(&peer(1), None);
        s.maintain(Instant::now() + Duration::from_secs(60));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn rank_ascending_orders_by_score() {
        let s = scorer();
        let good = peer(1);
        let bad = peer(2);
        let neutral = peer(3);
        for p in [&good, &bad, &neutral] {
            s.add_peer(p, None);
        }
        s.set_app_score(&good, 100.0);
        s.invalid_message(&bad, "t");

        let ranked = s.rank_ascending(&[good.clone(), neutral.clone(), bad.clone()]);
        assert_eq!(ranked, vec![bad, neutral, good]);
    }

    #[test]
    fn reconnect_within_retention_keeps_history() {
        let s = scorer();
        let p = peer(1);
        s.add_peer(&p, None);
        s.invalid_message(&p, "t");
        s.remove_peer(&p);
        s.add_peer(&p, None);
        assert!(s.score(&p) < 0.0, "history survives a reconnect");
    }
}
