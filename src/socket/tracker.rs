//! Topic participation tracking.
//!
//! Two indexes kept side by side: topic → socket ids, and socket id → topics.
//! Socket ids are `userSub:connId`.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::DashMap;
use serde::Serialize;

/// One user's presence on a topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub scid: String,
    pub cids: Vec<String>,
    pub name: String,
    pub role: String,
    pub color: String,
    pub exists: bool,
    pub online: bool,
}

#[derive(Default)]
pub struct TopicTracker {
    topics: DashMap<String, BTreeSet<String>>,
    sockets: DashMap<String, BTreeSet<String>>,
}

impl TopicTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `socket_id` on `topic`. False if it already was.
    pub fn track(&self, topic: &str, socket_id: &str) -> bool {
        let added = self
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(socket_id.to_string());
        self.sockets
            .entry(socket_id.to_string())
            .or_default()
            .insert(topic.to_string());
        added
    }

    pub fn has_tracking(&self, topic: &str, socket_id: &str) -> bool {
        self.topics
            .get(topic)
            .map(|sockets| sockets.contains(socket_id))
            .unwrap_or(false)
    }

    pub fn untrack(&self, topic: &str, socket_id: &str) {
        self.topics.remove_if_mut(topic, |_, sockets| {
            sockets.remove(socket_id);
            sockets.is_empty()
        });
        self.sockets.remove_if_mut(socket_id, |_, topics| {
            topics.remove(topic);
            topics.is_empty()
        });
    }

    /// Socket ids on `topic`.
    pub fn targets(&self, topic: &str) -> Vec<String> {
        self.topics
            .get(topic)
            .map(|sockets| sockets.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topics_of(&self, socket_id: &str) -> Vec<String> {
        self.sockets
            .get(socket_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Does any connection of `user_sub` other than `except` track `topic`?
    pub fn user_tracks(&self, topic: &str, user_sub: &str, except: &str) -> bool {
        self.topics
            .get(topic)
            .map(|sockets| {
                sockets
                    .iter()
                    .any(|id| id != except && user_of(id) == Some(user_sub))
            })
            .unwrap_or(false)
    }

    /// Online participants of `topic`, keyed by user sub.
    pub fn participants(&self, topic: &str) -> BTreeMap<String, Participant> {
        let mut participants: BTreeMap<String, Participant> = BTreeMap::new();
        for socket_id in self.targets(topic) {
            let Some((sub, conn_id)) = socket_id.split_once(':') else {
                continue;
            };
            let participant = participants.entry(sub.to_string()).or_insert_with(|| Participant {
                scid: sub.to_string(),
                online: true,
                ..Default::default()
            });
            participant.cids.push(conn_id.to_string());
        }
        participants
    }
}

fn user_of(socket_id: &str) -> Option<&str> {
    socket_id.split_once(':').map(|(sub, _)| sub)
}
