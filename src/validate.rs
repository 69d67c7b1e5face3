//! Message admission control.
//!
//! Every message, locally published or received from the network, passes
//! through one validator before it may produce side effects. Checks run in
//! a fixed order so the cheapest rejections happen first:
//!
//! 1. size bound
//! 2. structural integrity (non-empty sender, payload, topic)
//! 3. system-topic bypass (skips the membership check only)
//! 4. sender membership in the realm
//! 5. per-topic application predicate, if one is registered

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::protocols::MembershipOracle;
use crate::wire::WireMessage;

/// Application-supplied per-topic admission predicate.
pub type ValidationPredicate = Arc<dyn Fn(&WireMessage) -> bool + Send + Sync>;

/// Why a message was refused admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Payload exceeds the configured maximum.
    TooLarge { size: usize, max: usize },
    /// A structurally required field is empty.
    MalformedMessage(&'static str),
    /// The original sender is not a member of the realm.
    NotAMember(String),
    /// The topic's registered predicate returned false.
    PredicateRejected(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { size, max } => {
                write!(f, "message of {size} bytes exceeds maximum of {max}")
            }
            Self::MalformedMessage(field) => write!(f, "malformed message: empty {field}"),
            Self::NotAMember(sender) => write!(f, "sender {sender} is not a realm member"),
            Self::PredicateRejected(topic) => {
                write!(f, "rejected by validation predicate for topic {topic}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Shared admission pipeline for one engine instance.
pub struct MessageValidator {
    membership: Arc<dyn MembershipOracle>,
    max_message_size: usize,
    system_topics: HashSet<String>,
    predicates: Mutex<HashMap<String, ValidationPredicate>>,
}

impl MessageValidator {
    pub fn new(
        membership: Arc<dyn MembershipOracle>,
        max_message_size: usize,
        system_topics: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            membership,
            max_message_size,
            system_topics: system_topics.into_iter().collect(),
            predicates: Mutex::new(HashMap::new()),
        }
    }

    /// Register an admission predicate for a topic. At most one predicate
    /// per topic; a second registration replaces the first.
    pub fn register_predicate(&self, topic: &str, predicate: ValidationPredicate) {
        let mut predicates = self.lock();
        if predicates.insert(topic.to_string(), predicate).is_some() {
            debug!(topic, "replaced existing validation predicate");
        } else {
            trace!(topic, "registered validation predicate");
        }
    }

    /// Remove a topic's predicate, if any.
    pub fn unregister_predicate(&self, topic: &str) {
        self.lock().remove(topic);
    }

    /// Run the full admission pipeline.
    ///
    /// System topics skip the sender-membership check so membership state
    /// can itself propagate over gossip. The check applies to the original
    /// sender only; the forwarding peer is judged by the scorer, not here.
    pub fn validate(&self, message: &WireMessage) -> Result<(), ValidationError> {
        let size = message.size_bytes();
        if size > self.max_message_size {
            return Err(ValidationError::TooLarge {
                size,
                max: self.max_message_size,
            });
        }
        if message.sender.is_empty() {
            return Err(ValidationError::MalformedMessage("sender"));
        }
        if message.payload.is_empty() {
            return Err(ValidationError::MalformedMessage("payload"));
        }
        if message.topic.is_empty() {
            return Err(ValidationError::MalformedMessage("topic"));
        }

        if !self.system_topics.contains(&message.topic)
            && !self.membership.is_member(&message.sender)
        {
            return Err(ValidationError::NotAMember(message.sender.to_string()));
        }

        let predicate = {
            let predicates = self.lock();
            predicates.get(&message.topic).cloned()
        };
        if let Some(predicate) = predicate {
            if !predicate(message) {
                return Err(ValidationError::PredicateRejected(message.topic.clone()));
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ValidationPredicate>> {
        self.predicates.lock().expect("predicate lock poisoned")
    }
}
