//! Per-frame socket routing.
//!
//! # Responsibilities
//! - SUBSCRIBE: access check on the topic handle, then track and echo
//! - UNSUBSCRIBE: tell the topic, then drop tracking
//! - LOAD_SUBSCRIBERS / LOAD_MESSAGES: read back participants and history
//! - Everything else: stamp, optionally store, then fan out to the topic
//!
//! Frames from a sender without a subscription record for the topic are
//! dropped without a reply; only SUBSCRIBE may arrive first.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;

use crate::socket::codec::{SocketAction, SocketMessage};
use crate::socket::hub::{Connection, SocketHub};
use crate::socket::store::SocketStoreError;
use crate::socket::tracker::Participant;

/// Largest LOAD_MESSAGES page, also the default.
pub const MAX_PAGE_SIZE: usize = 100;

const MIN_DEADLINE: Duration = Duration::from_millis(250);
const MAX_DEADLINE: Duration = Duration::from_secs(5);

const COLORS: [&str; 8] = [
    "#e57373", "#64b5f6", "#81c784", "#ffb74d", "#ba68c8", "#4db6ac", "#f06292", "#a1887f",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageRequest {
    #[serde(default = "first_page")]
    page: usize,
    #[serde(default = "max_page")]
    page_size: usize,
}

fn first_page() -> usize {
    1
}

fn max_page() -> usize {
    MAX_PAGE_SIZE
}

/// Bound a configured routing deadline to 250 ms..5 s.
pub fn route_deadline(configured_ms: u64) -> Duration {
    Duration::from_millis(configured_ms).clamp(MIN_DEADLINE, MAX_DEADLINE)
}

pub async fn route(
    hub: &SocketHub,
    connection: &Connection,
    message: SocketMessage,
) -> Result<(), SocketStoreError> {
    if message.topic.is_empty() {
        return Ok(());
    }

    if message.action == SocketAction::Subscribe {
        return subscribe(hub, connection, message).await;
    }

    if !hub.has_subscription(&connection.user_sub, &message.topic) {
        tracing::debug!(
            socket_id = %connection.socket_id,
            topic = %message.topic,
            "Dropping frame for unsubscribed topic"
        );
        return Ok(());
    }

    match message.action {
        SocketAction::Unsubscribe => {
            unsubscribe(hub, connection, &message.topic);
            Ok(())
        }
        SocketAction::LoadSubscribers => load_subscribers(hub, connection, &message.topic).await,
        SocketAction::LoadMessages => load_messages(hub, connection, message).await,
        _ => relay(hub, connection, message).await,
    }
}

async fn subscribe(
    hub: &SocketHub,
    connection: &Connection,
    message: SocketMessage,
) -> Result<(), SocketStoreError> {
    let topic = message.topic.as_str();
    if hub.tracker().has_tracking(topic, &connection.socket_id) {
        return Ok(());
    }
    let Some((description, handle)) = topic.rsplit_once(':') else {
        return Ok(());
    };

    if !hub
        .store()
        .allowed(&connection.scope(), description, handle)
        .await?
    {
        tracing::warn!(
            target: crate::observability::AUTH_TARGET,
            user_sub = %connection.user_sub,
            topic,
            "Socket subscription denied"
        );
        return Ok(());
    }

    // The socket may have closed while the allowance was checked.
    if hub.connection(&connection.socket_id).is_none() {
        return Ok(());
    }
    if !hub.tracker().track(topic, &connection.socket_id) {
        return Ok(());
    }
    hub.add_subscription(&connection.user_sub, topic);
    if hub.connection(&connection.socket_id).is_none() {
        hub.tracker().untrack(topic, &connection.socket_id);
        hub.release_subscription(&connection.user_sub, topic, &connection.socket_id);
        return Ok(());
    }
    tracing::debug!(
        socket_id = %connection.socket_id,
        topic,
        participants = hub.tracker().targets(topic).len(),
        "Socket subscribed"
    );

    let echo = SocketMessage::new(SocketAction::Subscribe, topic)
        .with_sender(connection.conn_id.as_str())
        .with_payload(connection.socket_id.as_str());
    hub.send(&connection.socket_id, &echo);
    Ok(())
}

fn unsubscribe(hub: &SocketHub, connection: &Connection, topic: &str) {
    if !hub.tracker().has_tracking(topic, &connection.socket_id) {
        return;
    }
    let notice = SocketMessage::new(SocketAction::Unsubscribe, topic)
        .with_payload(connection.socket_id.as_str());
    hub.broadcast(&hub.tracker().targets(topic), &notice);
    hub.tracker().untrack(topic, &connection.socket_id);
    hub.release_subscription(&connection.user_sub, topic, &connection.socket_id);
}

async fn load_subscribers(
    hub: &SocketHub,
    connection: &Connection,
    topic: &str,
) -> Result<(), SocketStoreError> {
    let scope = connection.scope();
    let mut participants = hub.tracker().participants(topic);

    for (sub, cids) in hub.store().message_participants(&scope, topic).await? {
        participants.entry(sub.clone()).or_insert_with(|| Participant {
            scid: sub,
            cids,
            online: false,
            ..Default::default()
        });
    }

    let subs: Vec<String> = participants.keys().cloned().collect();
    let details = hub.store().participant_details(&scope, &subs).await?;
    for (sub, participant) in participants.iter_mut() {
        participant.color = color_for(sub).to_string();
        if let Some((name, role)) = details.get(sub) {
            participant.name = name.clone();
            participant.role = role.clone();
            participant.exists = true;
        }
    }

    let payload = participants_json(&participants)?;
    let reply = SocketMessage::new(SocketAction::LoadSubscribers, topic).with_payload(payload);
    hub.broadcast(&hub.tracker().targets(topic), &reply);
    Ok(())
}

fn participants_json(participants: &BTreeMap<String, Participant>) -> Result<String, SocketStoreError> {
    serde_json::to_string(participants).map_err(|e| SocketStoreError::Row(e.to_string()))
}

async fn load_messages(
    hub: &SocketHub,
    connection: &Connection,
    message: SocketMessage,
) -> Result<(), SocketStoreError> {
    let request = if message.payload.trim().is_empty() {
        PageRequest {
            page: first_page(),
            page_size: max_page(),
        }
    } else {
        match serde_json::from_str::<PageRequest>(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(socket_id = %connection.socket_id, error = %e, "Bad LOAD_MESSAGES payload");
                return Ok(());
            }
        }
    };
    let page = request.page.max(1);
    let page_size = request.page_size.clamp(1, MAX_PAGE_SIZE);

    let frames = hub
        .store()
        .topic_messages(&connection.scope(), &message.topic, page, page_size)
        .await?;
    let full_page = frames.len() == page_size;

    for frame in frames {
        match hub.codec().decode(frame.as_bytes()) {
            Ok(mut stored) => {
                stored.historical = true;
                hub.send(&connection.socket_id, &stored);
            }
            Err(e) => tracing::warn!(topic = %message.topic, error = %e, "Skipping unreadable stored frame"),
        }
    }

    if full_page {
        let more = SocketMessage::new(SocketAction::HasMoreMessages, message.topic.as_str());
        hub.send(&connection.socket_id, &more);
    }
    Ok(())
}

async fn relay(
    hub: &SocketHub,
    connection: &Connection,
    mut message: SocketMessage,
) -> Result<(), SocketStoreError> {
    message.sender = connection.conn_id.clone();
    if message.timestamp.is_empty() {
        message.timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    }

    if message.store {
        let mut stored = message.clone();
        stored.store = false;
        stored.historical = true;
        if let Some(frame) = hub.encode(&stored) {
            hub.store()
                .store_message(&connection.scope(), &connection.conn_id, &message.topic, frame)
                .await?;
        }
    }

    hub.broadcast(&hub.tracker().targets(&message.topic), &message);
    Ok(())
}

fn color_for(user_sub: &str) -> &'static str {
    let index = user_sub.bytes().map(usize::from).sum::<usize>() % COLORS.len();
    COLORS[index]
}
