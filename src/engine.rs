//! The gossip engine: lifecycle, publish and forward pipeline, heartbeat.
//!
//! One [`GossipEngine`] serves one authorization realm. It owns the mesh
//! table, deduplication state, scorer and backoff tracker, and drives three
//! background tasks while started:
//!
//! | Task | Purpose |
//! |------|---------|
//! | inbound loop | decode, dedup, validate, deliver, re-forward |
//! | event loop | react to peer connect/disconnect notifications |
//! | heartbeat loop | mesh rebalancing, scorer decay, TTL sweeps |
//!
//! Locks guard in-memory state only; network sends happen outside any lock
//! as per-send tasks, and fan-out waits for all of them before reporting.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::backoff::ConnectBackoff;
use crate::config::{self, GossipConfig};
use crate::dedup::{MessageCache, SeenSet};
use crate::mesh::MeshTable;
use crate::peer::PeerId;
use crate::protocols::{
    HealthSink, InboundFrame, MembershipOracle, PeerEvent, PeerEventFeed, Transport,
};
use crate::score::PeerScorer;
use crate::topic::{GossipMessage, Topic, TopicPeerEvent, TopicShared};
use crate::validate::{MessageValidator, ValidationError, ValidationPredicate};
use crate::wire::{self, MessageId, WireMessage};

/// Queue depth between the transport's inbound handler and the engine.
const INBOUND_QUEUE: usize = 1024;

/// Lifecycle and topic-management failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotStarted,
    AlreadyStarted,
    InvalidTopicName(String),
    TopicAlreadyJoined(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "engine not started"),
            Self::AlreadyStarted => write!(f, "engine already started"),
            Self::InvalidTopicName(name) => write!(f, "invalid topic name: {name:?}"),
            Self::TopicAlreadyJoined(name) => write!(f, "topic already joined: {name}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Why a publish did not reach the network.
///
/// `NoConnectedPeers` and `AllSendsFailed` are deliberately distinct: the
/// caller must be able to tell "nothing to send to" from "sent to N peers
/// and every send failed". Partial fan-out success is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    NotStarted,
    TopicNotFound(String),
    TopicClosed(String),
    Rejected(ValidationError),
    /// This (sender, seqno) pair was already published.
    DuplicateMessage,
    /// The topic mesh was empty; the message provably never left the node.
    NoConnectedPeers,
    /// The mesh was non-empty but every send failed.
    AllSendsFailed { attempted: usize },
    Codec(String),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "engine not started"),
            Self::TopicNotFound(name) => write!(f, "topic not found: {name}"),
            Self::TopicClosed(name) => write!(f, "topic closed: {name}"),
            Self::Rejected(error) => write!(f, "message rejected: {error}"),
            Self::DuplicateMessage => write!(f, "duplicate message id"),
            Self::NoConnectedPeers => write!(f, "no connected peers in topic mesh"),
            Self::AllSendsFailed { attempted } => {
                write!(f, "all {attempted} sends failed")
            }
            Self::Codec(error) => write!(f, "codec failure: {error}"),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<ValidationError> for PublishError {
    fn from(error: ValidationError) -> Self {
        Self::Rejected(error)
    }
}

/// Everything a [`GossipEngine`] needs at construction.
pub struct EngineParams {
    pub local_peer: PeerId,
    /// Authorization realm this engine serves; determines the protocol id.
    pub realm: String,
    pub config: GossipConfig,
    pub transport: Arc<dyn Transport>,
    pub membership: Arc<dyn MembershipOracle>,
    pub peer_events: Arc<dyn PeerEventFeed>,
    pub health: Option<Arc<dyn HealthSink>>,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct EngineInner {
    local_peer: PeerId,
    protocol: String,
    config: GossipConfig,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn MembershipOracle>,
    peer_events: Arc<dyn PeerEventFeed>,
    health: Option<Arc<dyn HealthSink>>,
    mesh: MeshTable,
    cache: MessageCache,
    seen: SeenSet,
    scorer: PeerScorer,
    backoff: ConnectBackoff,
    validator: MessageValidator,
    topics: Mutex<HashMap<String, Arc<TopicShared>>>,
    seqno: AtomicU64,
    running: Mutex<Option<Running>>,
}

/// Cheap cloneable handle to one engine instance.
#[derive(Clone)]
pub struct GossipEngine {
    inner: Arc<EngineInner>,
}

impl GossipEngine {
    pub fn new(params: EngineParams) -> Self {
        let protocol = wire::protocol_id(&params.realm);
        let validator = MessageValidator::new(
            params.membership.clone(),
            params.config.max_message_size,
            params.config.system_topics.iter().cloned(),
        );
        let inner = Arc::new(EngineInner {
            local_peer: params.local_peer,
            protocol,
            mesh: MeshTable::new(params.config.degree),
            cache: MessageCache::new(params.config.cache_max_messages),
            seen: SeenSet::new(),
            scorer: PeerScorer::new(params.config.score.clone()),
            backoff: ConnectBackoff::new(params.config.backoff_base, params.config.backoff_max),
            validator,
            topics: Mutex::new(HashMap::new()),
            seqno: AtomicU64::new(0),
            running: Mutex::new(None),
            transport: params.transport,
            membership: params.membership,
            peer_events: params.peer_events,
            health: params.health,
            config: params.config,
        });
        Self { inner }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local_peer
    }

    /// Protocol identifier this engine registers with the transport.
    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn is_started(&self) -> bool {
        self.inner.running.lock().expect("running lock poisoned").is_some()
    }

    /// Register the inbound handler and spawn the background tasks.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut running = self.inner.running.lock().expect("running lock poisoned");
        if running.is_some() {
            return Err(EngineError::AlreadyStarted);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        self.inner.transport.register_inbound(&self.inner.protocol, inbound_tx);
        let events_rx = self.inner.peer_events.subscribe();

        let tasks = vec![
            tokio::spawn(inbound_loop(self.inner.clone(), inbound_rx, stop_rx.clone())),
            tokio::spawn(event_loop(self.inner.clone(), events_rx, stop_rx.clone())),
            tokio::spawn(heartbeat_loop(self.inner.clone(), stop_rx)),
        ];
        *running = Some(Running { stop_tx, tasks });
        info!(peer = %self.inner.local_peer, protocol = %self.inner.protocol, "gossip engine started");
        Ok(())
    }

    /// Signal the background tasks to stop and wait for them to exit.
    /// In-flight fan-out sends are allowed to complete.
    pub async fn stop(&self) {
        let running = {
            let mut slot = self.inner.running.lock().expect("running lock poisoned");
            slot.take()
        };
        let Some(running) = running else {
            return;
        };
        let _ = running.stop_tx.send(true);
        for task in running.tasks {
            let _ = task.await;
        }
        info!(peer = %self.inner.local_peer, "gossip engine stopped");
    }

    /// Open a topic and perform one immediate graft pass so the first
    /// publish does not have to wait for a heartbeat.
    pub async fn join(&self, topic: &str) -> Result<Topic, EngineError> {
        if !self.is_started() {
            return Err(EngineError::NotStarted);
        }
        if !config::is_valid_topic(topic) {
            return Err(EngineError::InvalidTopicName(topic.to_string()));
        }
        let shared = {
            let mut topics = self.inner.topics.lock().expect("topic lock poisoned");
            if topics.contains_key(topic) {
                return Err(EngineError::TopicAlreadyJoined(topic.to_string()));
            }
            let shared = Arc::new(TopicShared::new(
                topic.to_string(),
                self.inner.config.subscription_buffer,
            ));
            topics.insert(topic.to_string(), shared.clone());
            shared
        };
        graft_topic(&self.inner, topic, &shared).await;
        info!(topic, members = self.inner.mesh.count(topic), "joined topic");
        Ok(Topic::new(self.clone(), shared))
    }

    /// Publish with an auto-assigned sequence number.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<MessageId, PublishError> {
        let seqno = self.inner.seqno.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish_with_seqno(topic, payload, seqno.to_be_bytes().to_vec()).await
    }

    /// Publish with a caller-supplied sequence number. Re-publishing a
    /// (sender, seqno) pair fails with [`PublishError::DuplicateMessage`].
    pub async fn publish_with_seqno(
        &self,
        topic: &str,
        payload: Vec<u8>,
        seqno: Vec<u8>,
    ) -> Result<MessageId, PublishError> {
        let inner = &self.inner;
        if !self.is_started() {
            return Err(PublishError::NotStarted);
        }
        let shared = {
            let topics = inner.topics.lock().expect("topic lock poisoned");
            topics.get(topic).cloned()
        }
        .ok_or_else(|| PublishError::TopicNotFound(topic.to_string()))?;
        if shared.is_closed() {
            return Err(PublishError::TopicClosed(topic.to_string()));
        }

        let message = WireMessage {
            sender: inner.local_peer.clone(),
            payload,
            topic: topic.to_string(),
            seqno,
        };
        inner.validator.validate(&message)?;

        let id = message.id();
        if !inner.seen.observe(id) {
            return Err(PublishError::DuplicateMessage);
        }
        inner.cache.put(message.clone());
        shared.deliver(GossipMessage::from_wire(&message));

        let recipients = inner.mesh.list(topic);
        if recipients.is_empty() {
            return Err(PublishError::NoConnectedPeers);
        }
        let frame = wire::serialize(&message).map_err(|e| PublishError::Codec(e.to_string()))?;
        let attempted = recipients.len();
        let succeeded = fan_out(inner, frame, recipients).await;
        if succeeded == 0 {
            return Err(PublishError::AllSendsFailed { attempted });
        }
        debug!(topic, succeeded, attempted, "published message");
        Ok(id)
    }

    /// Leave a topic: prune its mesh, drop its subscriptions, remove it from
    /// the registry. Idempotent; re-joining afterwards creates a fresh topic.
    pub fn close_topic(&self, topic: &str) {
        let inner = &self.inner;
        let shared = {
            let mut topics = inner.topics.lock().expect("topic lock poisoned");
            topics.remove(topic)
        };
        let Some(shared) = shared else {
            return;
        };
        for member in inner.mesh.list(topic) {
            inner.scorer.prune(&member, topic);
            shared.notify_peer_event(TopicPeerEvent::Left(member));
        }
        inner.mesh.clear(topic);
        shared.close();
        inner.validator.unregister_predicate(topic);
        info!(topic, "closed topic");
    }

    /// Names of currently open topics.
    pub fn topics(&self) -> Vec<String> {
        let topics = self.inner.topics.lock().expect("topic lock poisoned");
        topics.keys().cloned().collect()
    }

    /// Current mesh members of a topic.
    pub fn topic_peers(&self, topic: &str) -> Vec<PeerId> {
        self.inner.mesh.list(topic)
    }

    /// Register an admission predicate for a topic (last registration wins).
    pub fn register_validator(&self, topic: &str, predicate: ValidationPredicate) {
        self.inner.validator.register_predicate(topic, predicate);
    }

    pub fn unregister_validator(&self, topic: &str) {
        self.inner.validator.unregister_predicate(topic);
    }

    /// Current reputation score for a peer.
    pub fn peer_score(&self, peer: &PeerId) -> f64 {
        self.inner.scorer.score(peer)
    }

    /// Override the application-level score component for a peer.
    pub fn set_app_score(&self, peer: &PeerId, value: f64) {
        self.inner.scorer.set_app_score(peer, value);
    }

    /// Peers with retained score state.
    pub fn scored_peers(&self) -> Vec<PeerId> {
        self.inner.scorer.known_peers()
    }
}

async fn inbound_loop(
    inner: Arc<EngineInner>,
    mut inbound: mpsc::Receiver<InboundFrame>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => handle_inbound(&inner, frame).await,
                None => break,
            },
        }
    }
    trace!("inbound loop exited");
}

async fn event_loop(
    inner: Arc<EngineInner>,
    mut events: mpsc::Receiver<PeerEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            event = events.recv() => match event {
                Some(event) => handle_peer_event(&inner, event),
                None => break,
            },
        }
    }
    trace!("peer event loop exited");
}

async fn heartbeat_loop(inner: Arc<EngineInner>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_sweep = Instant::now();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                run_heartbeat(&inner).await;
                if last_sweep.elapsed() >= inner.config.sweep_interval {
                    inner.cache.cleanup_old(inner.config.cache_ttl);
                    inner.seen.cleanup(inner.config.seen_ttl);
                    inner.backoff.cleanup_expired(Instant::now(), inner.config.backoff_idle_expiry);
                    last_sweep = Instant::now();
                }
            }
        }
    }
    trace!("heartbeat loop exited");
}

/// One maintenance round: liveness re-check, degree rebalancing, decay.
async fn run_heartbeat(inner: &Arc<EngineInner>) {
    let topics: Vec<(String, Arc<TopicShared>)> = {
        let topics = inner.topics.lock().expect("topic lock poisoned");
        topics.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    };
    for (name, shared) in topics {
        if shared.is_closed() {
            continue;
        }
        // Disconnect events should already have removed dead members; this
        // re-check is the fallback for missed events.
        for member in inner.mesh.list(&name) {
            if !inner.transport.is_connected(&member) && inner.mesh.remove(&name, &member) {
                inner.scorer.prune(&member, &name);
                shared.notify_peer_event(TopicPeerEvent::Left(member.clone()));
                debug!(topic = %name, peer = %member, "removed dead mesh member");
            }
        }
        if inner.mesh.need_more_peers(&name) {
            graft_topic(inner, &name, &shared).await;
        }
        if inner.mesh.too_many_peers(&name) {
            prune_topic(inner, &name, &shared);
        }
    }
    inner.scorer.maintain(Instant::now());
}

/// Bring a topic's mesh up toward the target degree.
async fn graft_topic(inner: &Arc<EngineInner>, topic: &str, shared: &Arc<TopicShared>) {
    let need = inner.mesh.degree().d.saturating_sub(inner.mesh.count(topic));
    if need == 0 {
        return;
    }

    // Realm members, plus member peers the transport already knows an
    // address for; the latter bootstraps mesh formation before membership
    // fully propagates.
    let mut candidates: HashSet<PeerId> = inner.membership.members().into_iter().collect();
    for peer in inner.transport.peers_with_known_addr() {
        if inner.membership.is_member(&peer) {
            candidates.insert(peer);
        }
    }
    candidates.remove(&inner.local_peer);
    let candidates: Vec<PeerId> = candidates
        .into_iter()
        .filter(|p| !inner.mesh.has(topic, p))
        .filter(|p| !inner.scorer.is_below_gossip_threshold(p))
        .collect();

    let (mut live, offline): (Vec<PeerId>, Vec<PeerId>) = candidates
        .into_iter()
        .partition(|p| inner.transport.is_connected(p));

    if live.len() < need {
        for peer in offline {
            if live.len() >= need {
                break;
            }
            if inner.backoff.is_in_backoff(&peer, Instant::now()) {
                continue;
            }
            match tokio::time::timeout(inner.config.dial_timeout, inner.transport.dial(&peer)).await
            {
                Ok(Ok(())) => {
                    inner.backoff.clear_on_success(&peer);
                    live.push(peer);
                }
                Ok(Err(error)) => {
                    inner.backoff.record_failure(&peer, Instant::now());
                    debug!(peer = %peer, error = %error, "graft dial failed");
                }
                Err(_) => {
                    inner.backoff.record_failure(&peer, Instant::now());
                    debug!(peer = %peer, "graft dial timed out");
                }
            }
        }
    }

    for peer in inner.mesh.select_peers_to_graft(topic, &live, need) {
        if inner.mesh.add(topic, &peer) {
            inner.scorer.graft(&peer, topic);
            shared.notify_peer_event(TopicPeerEvent::Joined(peer.clone()));
            debug!(topic, peer = %peer, "grafted peer into mesh");
        }
    }
}

/// Bring an over-full mesh back down to the target degree, evicting the
/// lowest-scored members first.
fn prune_topic(inner: &Arc<EngineInner>, topic: &str, shared: &Arc<TopicShared>) {
    let excess = inner.mesh.count(topic).saturating_sub(inner.mesh.degree().d);
    if excess == 0 {
        return;
    }
    let ranked = inner.scorer.rank_ascending(&inner.mesh.list(topic));
    for victim in inner.mesh.select_peers_to_prune(topic, excess, Some(&ranked)) {
        if inner.mesh.remove(topic, &victim) {
            inner.scorer.prune(&victim, topic);
            shared.notify_peer_event(TopicPeerEvent::Left(victim.clone()));
            debug!(topic, peer = %victim, "pruned peer from mesh");
        }
    }
}

/// Full inbound pipeline for one frame.
async fn handle_inbound(inner: &Arc<EngineInner>, frame: InboundFrame) {
    if inner.scorer.is_below_graylist_threshold(&frame.from) {
        trace!(from = %frame.from, "dropping frame from graylisted peer");
        return;
    }
    let message: WireMessage = match wire::deserialize_bounded(&frame.frame) {
        Ok(message) => message,
        Err(error) => {
            warn!(from = %frame.from, error = %error, "dropping undecodable frame");
            return;
        }
    };

    let id = message.id();
    if !inner.seen.observe(id) {
        // Duplicates within the cache window still count toward the
        // forwarder's mesh delivery rate.
        inner.scorer.duplicate_message(&frame.from, &message.topic, inner.cache.has(&id));
        trace!(from = %frame.from, topic = %message.topic, "duplicate message");
        return;
    }
    if let Err(error) = inner.validator.validate(&message) {
        inner.scorer.invalid_message(&frame.from, &message.topic);
        debug!(from = %frame.from, topic = %message.topic, error = %error, "dropping invalid message");
        return;
    }

    inner.scorer.first_message_delivered(&frame.from, &message.topic);
    inner.cache.put(message.clone());

    let shared = {
        let topics = inner.topics.lock().expect("topic lock poisoned");
        topics.get(&message.topic).cloned()
    };
    if let Some(shared) = shared {
        shared.deliver(GossipMessage::from_wire(&message));
    }

    let recipients: Vec<PeerId> = inner
        .mesh
        .list(&message.topic)
        .into_iter()
        .filter(|p| *p != frame.from && *p != message.sender && *p != inner.local_peer)
        .collect();
    if recipients.is_empty() {
        return;
    }
    match wire::serialize(&message) {
        Ok(bytes) => {
            let forwarded = fan_out(inner, bytes, recipients).await;
            trace!(topic = %message.topic, forwarded, "re-forwarded message");
        }
        Err(error) => warn!(error = %error, "failed to re-encode message for forwarding"),
    }
}

fn handle_peer_event(inner: &Arc<EngineInner>, event: PeerEvent) {
    match event {
        PeerEvent::Connected(peer) => {
            let addr = inner.transport.observed_addr(&peer);
            inner.scorer.add_peer(&peer, addr);
            trace!(peer = %peer, "peer connected");
        }
        PeerEvent::Disconnected(peer) => {
            // Remove from every mesh immediately rather than waiting for
            // the heartbeat's liveness re-check.
            let affected = inner.mesh.remove_everywhere(&peer);
            let topics = {
                let topics = inner.topics.lock().expect("topic lock poisoned");
                topics.clone()
            };
            for topic in &affected {
                inner.scorer.prune(&peer, topic);
                if let Some(shared) = topics.get(topic) {
                    shared.notify_peer_event(TopicPeerEvent::Left(peer.clone()));
                }
            }
            inner.scorer.remove_peer(&peer);
            debug!(peer = %peer, meshes = affected.len(), "peer disconnected");
        }
    }
}

/// Send one frame to every recipient concurrently, wait for all results,
/// and return the number of successful sends. Failures feed the scorer and
/// the optional health sink.
async fn fan_out(inner: &Arc<EngineInner>, frame: Vec<u8>, recipients: Vec<PeerId>) -> usize {
    let mut sends = JoinSet::new();
    for peer in recipients {
        let inner = inner.clone();
        let frame = frame.clone();
        sends.spawn(async move {
            let result = tokio::time::timeout(
                inner.config.send_timeout,
                inner.transport.send_frame(&peer, &inner.protocol, frame),
            )
            .await;
            match result {
                Ok(Ok(())) => {
                    if let Some(health) = &inner.health {
                        health.on_send_success(&peer);
                    }
                    true
                }
                Ok(Err(error)) => {
                    inner.scorer.delivery_failed(&peer);
                    if let Some(health) = &inner.health {
                        health.on_send_error(&peer, &error);
                    }
                    warn!(peer = %peer, error = %error, "send failed");
                    false
                }
                Err(_) => {
                    let error =
                        anyhow::anyhow!("send timed out after {:?}", inner.config.send_timeout);
                    inner.scorer.delivery_failed(&peer);
                    if let Some(health) = &inner.health {
                        health.on_send_error(&peer, &error);
                    }
                    warn!(peer = %peer, "send timed out");
                    false
                }
            }
        });
    }
    let mut succeeded = 0;
    while let Some(joined) = sends.join_next().await {
        if matches!(joined, Ok(true)) {
            succeeded += 1;
        }
    }
    succeeded
}
