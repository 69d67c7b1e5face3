//! Per-topic bounded-degree mesh membership.
//!
//! The mesh table tracks, for every topic, the set of peers this node
//! actively forwards to and from. Degree policy lives here (target D,
//! floor Dlo, hard cap Dhi); the engine decides *when* to graft and prune,
//! the table decides *whom* when no better order is supplied.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use rand::seq::SliceRandom;

use crate::config::MeshDegree;
use crate::peer::PeerId;

/// Topic name → current mesh members. One exclusive lock guards the whole
/// table; every operation is O(topic size) at worst.
pub struct MeshTable {
    degree: MeshDegree,
    inner: Mutex<HashMap<String, HashSet<PeerId>>>,
}

impl MeshTable {
    pub fn new(degree: MeshDegree) -> Self {
        Self {
            degree,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn degree(&self) -> MeshDegree {
        self.degree
    }

    /// Insert a peer into a topic's mesh. Rejects (returns false) when the
    /// topic already holds `d_hi` members; adding an existing member is a
    /// no-op success.
    pub fn add(&self, topic: &str, peer: &PeerId) -> bool {
        let mut table = self.lock();
        let members = table.entry(topic.to_string()).or_default();
        if members.contains(peer) {
            return true;
        }
        if members.len() >= self.degree.d_hi {
            return false;
        }
        members.insert(peer.clone());
        true
    }

    /// Idempotent removal. Returns true if the peer was a member.
    pub fn remove(&self, topic: &str, peer: &PeerId) -> bool {
        let mut table = self.lock();
        match table.get_mut(topic) {
            Some(members) => members.remove(peer),
            None => false,
        }
    }

    pub fn has(&self, topic: &str, peer: &PeerId) -> bool {
        let table = self.lock();
        table.get(topic).is_some_and(|m| m.contains(peer))
    }

    pub fn list(&self, topic: &str) -> Vec<PeerId> {
        let table = self.lock();
        table
            .get(topic)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, topic: &str) -> usize {
        let table = self.lock();
        table.get(topic).map_or(0, |m| m.len())
    }

    /// Below the target degree D.
    pub fn need_more_peers(&self, topic: &str) -> bool {
        self.count(topic) < self.degree.d
    }

    /// Above the hard cap Dhi.
    pub fn too_many_peers(&self, topic: &str) -> bool {
        self.count(topic) > self.degree.d_hi
    }

    /// Below the floor Dlo.
    pub fn too_few_peers(&self, topic: &str) -> bool {
        self.count(topic) < self.degree.d_lo
    }

    /// Pick up to `n` of `candidates` that are not already in the topic's
    /// mesh, uniformly at random without replacement. Callers pre-filter
    /// candidates (membership, score, liveness); no further preference is
    /// applied here.
    pub fn select_peers_to_graft(&self, topic: &str, candidates: &[PeerId], n: usize) -> Vec<PeerId> {
        let table = self.lock();
        let empty = HashSet::new();
        let members = table.get(topic).unwrap_or(&empty);
        let eligible: Vec<&PeerId> = candidates.iter().filter(|p| !members.contains(*p)).collect();
        eligible
            .choose_multiple(&mut rand::thread_rng(), n)
            .map(|p| (**p).clone())
            .collect()
    }

    /// Pick up to `n` current members to prune. When `prefer` is supplied,
    /// its order wins (e.g. lowest-scored first) and non-members in it are
    /// skipped; otherwise selection is uniform random.
    pub fn select_peers_to_prune(
        &self,
        topic: &str,
        n: usize,
        prefer: Option<&[PeerId]>,
    ) -> Vec<PeerId> {
        let table = self.lock();
        let Some(members) = table.get(topic) else {
            return Vec::new();
        };
        match prefer {
            Some(order) => order
                .iter()
                .filter(|p| members.contains(*p))
                .take(n)
                .cloned()
                .collect(),
            None => {
                let all: Vec<&PeerId> = members.iter().collect();
                all.choose_multiple(&mut rand::thread_rng(), n)
                    .map(|p| (**p).clone())
                    .collect()
            }
        }
    }

    /// Drop every member of one topic.
    pub fn clear(&self, topic: &str) {
        let mut table = self.lock();
        table.remove(topic);
    }

    /// Remove one peer from every topic, returning the topics it was in.
    /// Used by disconnect handling, which must not wait for the heartbeat.
    pub fn remove_everywhere(&self, peer: &PeerId) -> Vec<String> {
        let mut table = self.lock();
        let mut affected = Vec::new();
        for (topic, members) in table.iter_mut() {
            if members.remove(peer) {
                affected.push(topic.clone());
            }
        }
        affected
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashSet<PeerId>>> {
        self.inner.lock().expect("mesh lock poisoned")
    }
}
