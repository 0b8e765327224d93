//! Subscription management for the fixed topic set
//!
//! The table is rebuilt on every connection-established event; broker-side state from
//! a previous connection is never trusted.

use crate::error::SubscribeError;
use crate::transport::Connection;
use rumqttc::QoS;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

/// Acknowledgment state of one topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    Pending,
    Active,
    Failed,
}

/// One entry of the subscription table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub topic: String,
    #[serde(serialize_with = "qos_as_level")]
    pub qos: QoS,
    pub state: AckState,
}

fn qos_as_level<S: Serializer>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(*qos as u8)
}

/// Declares the fixed topic set and tracks per-topic acknowledgment state
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    topics: Vec<String>,
    qos: QoS,
    entries: Vec<Subscription>,
}

impl SubscriptionManager {
    pub fn new(topics: Vec<String>, qos: QoS) -> Self {
        Self {
            topics,
            qos,
            entries: Vec::new(),
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Current table; empty outside Subscribing/Ready
    pub fn entries(&self) -> &[Subscription] {
        &self.entries
    }

    /// Issue a subscribe request for every topic in the set.
    ///
    /// Topics are independent: a failed request marks that topic Failed and the
    /// remaining topics are still requested. Requests that were accepted stay Pending
    /// until [`SubscriptionManager::acknowledge`] resolves them.
    pub fn subscribe_all<C: Connection>(
        &mut self,
        connection: &C,
    ) -> Vec<(String, Result<(), SubscribeError>)> {
        self.entries = self
            .topics
            .iter()
            .map(|topic| Subscription {
                topic: topic.clone(),
                qos: self.qos,
                state: AckState::Pending,
            })
            .collect();

        let mut outcomes = Vec::with_capacity(self.topics.len());
        for index in 0..self.entries.len() {
            let topic = self.entries[index].topic.clone();
            let result = connection.subscribe(&topic, self.qos);
            match &result {
                Ok(()) => debug!(topic = %topic, "Subscribe request accepted"),
                Err(e) => {
                    warn!(topic = %topic, "Subscribe request failed: {}", e);
                    self.entries[index].state = AckState::Failed;
                }
            }
            outcomes.push((topic, result));
        }
        outcomes
    }

    /// Apply a broker answer. Returns false when the topic is not pending.
    pub fn acknowledge(&mut self, topic: &str, result: &Result<(), SubscribeError>) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.topic == topic && entry.state == AckState::Pending)
        else {
            return false;
        };

        entry.state = if result.is_ok() {
            info!(topic = %topic, "Subscribed");
            AckState::Active
        } else {
            AckState::Failed
        };
        true
    }

    /// Mark every still-pending topic Failed and return the errors
    pub fn expire_pending(&mut self) -> Vec<SubscribeError> {
        self.entries
            .iter_mut()
            .filter(|entry| entry.state == AckState::Pending)
            .map(|entry| {
                entry.state = AckState::Failed;
                SubscribeError::Unacknowledged {
                    topic: entry.topic.clone(),
                }
            })
            .collect()
    }

    /// Every topic is Active or Failed
    pub fn all_resolved(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| entry.state != AckState::Pending)
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state == AckState::Active)
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
