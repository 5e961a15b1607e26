//! Live socket connections.
//!
//! # Responsibilities
//! - Issue and redeem single-use connection tickets
//! - Register connections and their outbound queues
//! - Fan frames out to socket ids without blocking on slow consumers
//! - Tear a connection down: unsubscribe it everywhere, drop its records
//! - Deliver role-change notices to every connection of a user
//!
//! # Design Decisions
//! - Each connection owns a bounded queue drained by its writer task; a full
//!   queue drops the frame for that connection only
//! - Subscription records are per user; they are dropped when the user's
//!   last connection leaves the topic

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::config::SocketConfig;
use crate::db::DbScope;
use crate::observability::metrics;
use crate::security::Signer;
use crate::session::{ConcurrentUserSession, RoleChangeObserver};
use crate::socket::codec::{Codec, SocketAction, SocketMessage};
use crate::socket::store::{SocketStore, SocketStoreError};
use crate::socket::tracker::TopicTracker;

/// Signing name for tickets.
pub const TICKET_NAME: &str = "ticket";

/// Topic of role-change notices.
pub const ROLE_CALL_TOPIC: &str = "group:role_call";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TicketError {
    #[error("unknown ticket")]
    Unknown,

    #[error("ticket expired")]
    Expired,

    #[error("ticket signature invalid")]
    BadSignature,
}

/// One registered socket.
pub struct Connection {
    pub conn_id: String,
    pub user_sub: String,
    /// `userSub:connId`
    pub socket_id: String,
    pub session: Arc<ConcurrentUserSession>,
    outbound: mpsc::Sender<Message>,
}

impl Connection {
    pub fn new(
        user_sub: &str,
        conn_id: &str,
        session: Arc<ConcurrentUserSession>,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            user_sub: user_sub.to_string(),
            socket_id: socket_id(user_sub, conn_id),
            session,
            outbound,
        }
    }

    pub fn scope(&self) -> DbScope {
        self.session.read(DbScope::from_session)
    }

    /// Queue a message for the writer; false when the queue is full or closed.
    pub fn push(&self, message: Message) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(socket_id = %self.socket_id, "Outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

pub fn socket_id(user_sub: &str, conn_id: &str) -> String {
    format!("{user_sub}:{conn_id}")
}

pub struct SocketHub {
    config: SocketConfig,
    codec: Codec,
    signer: Signer,
    store: Arc<dyn SocketStore>,
    tracker: TopicTracker,
    connections: DashMap<String, Arc<Connection>>,
    user_sockets: DashMap<String, HashSet<String>>,
    subscriptions: DashMap<String, HashSet<String>>,
    tickets: DashMap<String, Instant>,
}

impl SocketHub {
    pub fn new(config: SocketConfig, signer: Signer, store: Arc<dyn SocketStore>) -> Self {
        Self {
            codec: Codec::new(config.pad_to, config.max_message_bytes),
            config,
            signer,
            store,
            tracker: TopicTracker::new(),
            connections: DashMap::new(),
            user_sockets: DashMap::new(),
            subscriptions: DashMap::new(),
            tickets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn store(&self) -> &Arc<dyn SocketStore> {
        &self.store
    }

    pub fn tracker(&self) -> &TopicTracker {
        &self.tracker
    }

    pub fn connection(&self, socket_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(socket_id).map(|c| c.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Mint a ticket for a fresh connection of `user_sub`.
    pub fn issue_ticket(&self, user_sub: &str) -> String {
        let conn_id = Uuid::new_v4().to_string();
        let ticket = self
            .signer
            .write_signed(TICKET_NAME, &socket_id(user_sub, &conn_id));
        self.tickets.insert(ticket.clone(), Instant::now());
        ticket
    }

    /// Consume a ticket, returning `(user_sub, conn_id)`.
    pub fn redeem_ticket(&self, ticket: &str) -> Result<(String, String), TicketError> {
        let (_, issued_at) = self.tickets.remove(ticket).ok_or(TicketError::Unknown)?;
        if issued_at.elapsed() > self.ticket_ttl() {
            return Err(TicketError::Expired);
        }
        let value = self
            .signer
            .verify_signed(TICKET_NAME, ticket)
            .map_err(|_| TicketError::BadSignature)?;
        let (user_sub, conn_id) = value.rsplit_once(':').ok_or(TicketError::BadSignature)?;
        Ok((user_sub.to_string(), conn_id.to_string()))
    }

    /// Forget tickets nobody redeemed in time.
    pub fn sweep_tickets(&self) -> usize {
        let ttl = self.ticket_ttl();
        let before = self.tickets.len();
        self.tickets.retain(|_, issued_at| issued_at.elapsed() <= ttl);
        before - self.tickets.len()
    }

    /// Run [`SocketHub::sweep_tickets`] on a fixed cadence until shutdown.
    pub fn spawn_ticket_sweep(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = hub.sweep_tickets();
                        if swept > 0 {
                            tracing::debug!(swept, "Expired socket tickets");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.config.ticket_ttl_secs)
    }

    pub async fn register(&self, connection: Arc<Connection>) -> Result<(), SocketStoreError> {
        self.store
            .add_connection(&connection.scope(), &connection.conn_id)
            .await?;
        self.user_sockets
            .entry(connection.user_sub.clone())
            .or_default()
            .insert(connection.socket_id.clone());
        self.connections
            .insert(connection.socket_id.clone(), connection.clone());
        metrics::socket_opened();
        tracing::debug!(socket_id = %connection.socket_id, "Socket registered");
        Ok(())
    }

    pub fn has_subscription(&self, user_sub: &str, topic: &str) -> bool {
        self.subscriptions
            .get(user_sub)
            .map(|topics| topics.contains(topic))
            .unwrap_or(false)
    }

    pub fn add_subscription(&self, user_sub: &str, topic: &str) {
        self.subscriptions
            .entry(user_sub.to_string())
            .or_default()
            .insert(topic.to_string());
    }

    /// Drop `topic` from `socket_id`'s user unless another of their
    /// connections still tracks it.
    pub fn release_subscription(&self, user_sub: &str, topic: &str, socket_id: &str) {
        if self.tracker.user_tracks(topic, user_sub, socket_id) {
            return;
        }
        self.subscriptions.remove_if_mut(user_sub, |_, topics| {
            topics.remove(topic);
            topics.is_empty()
        });
    }

    pub fn encode(&self, message: &SocketMessage) -> Option<String> {
        match self.codec.encode(message) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "Failed to encode socket message");
                None
            }
        }
    }

    /// Queue an encoded frame for one socket.
    pub fn send_frame(&self, socket_id: &str, frame: String) -> bool {
        match self.connections.get(socket_id) {
            Some(connection) => connection.push(Message::Text(frame.into())),
            None => false,
        }
    }

    pub fn send(&self, socket_id: &str, message: &SocketMessage) -> bool {
        self.encode(message)
            .map(|frame| self.send_frame(socket_id, frame))
            .unwrap_or(false)
    }

    /// Queue `message` for every socket in `targets`. Returns how many took it.
    pub fn broadcast(&self, targets: &[String], message: &SocketMessage) -> usize {
        let Some(frame) = self.encode(message) else {
            return 0;
        };
        targets
            .iter()
            .filter(|target| self.send_frame(target, frame.clone()))
            .count()
    }

    /// Remove a connection everywhere. Safe to call more than once.
    pub async fn teardown(&self, socket_id: &str) {
        let Some((_, connection)) = self.connections.remove(socket_id) else {
            return;
        };

        for topic in self.tracker.topics_of(socket_id) {
            let targets: Vec<String> = self
                .tracker
                .targets(&topic)
                .into_iter()
                .filter(|t| t != socket_id)
                .collect();
            let notice = SocketMessage::new(SocketAction::Unsubscribe, topic.as_str())
                .with_payload(socket_id);
            self.broadcast(&targets, &notice);
            self.tracker.untrack(&topic, socket_id);
            self.release_subscription(&connection.user_sub, &topic, socket_id);
        }

        if let Err(e) = self
            .store
            .remove_connection(&connection.scope(), &connection.conn_id)
            .await
        {
            tracing::error!(socket_id, error = %e, "Failed to remove socket connection record");
        }

        self.user_sockets.remove_if_mut(&connection.user_sub, |_, sockets| {
            sockets.remove(socket_id);
            sockets.is_empty()
        });
        metrics::socket_closed();
        tracing::debug!(socket_id, "Socket torn down");
    }

    /// Socket ids of every live connection of `user_sub`.
    pub fn sockets_of(&self, user_sub: &str) -> Vec<String> {
        self.user_sockets
            .get(user_sub)
            .map(|sockets| sockets.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Per-user participant map for `topic`, counting only live sockets.
    pub fn online(&self, topic: &str) -> HashMap<String, Vec<String>> {
        let mut online: HashMap<String, Vec<String>> = HashMap::new();
        for (sub, participant) in self.tracker.participants(topic) {
            online.insert(sub, participant.cids);
        }
        online
    }
}

impl RoleChangeObserver for SocketHub {
    fn role_changed(&self, user_sub: &str) {
        let notice = SocketMessage::new(SocketAction::RoleCall, ROLE_CALL_TOPIC);
        let delivered = self.broadcast(&self.sockets_of(user_sub), &notice);
        tracing::debug!(user_sub, delivered, "Role change delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::UserSession;
    use crate::socket::store::MemorySocketStore;

    fn hub() -> (SocketHub, Arc<MemorySocketStore>) {
        let store = Arc::new(MemorySocketStore::open());
        let hub = SocketHub::new(
            SocketConfig::default(),
            Signer::new("test-signing-key").unwrap(),
            store.clone(),
        );
        (hub, store)
    }

    fn connection(sub: &str, conn: &str) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        let session = Arc::new(ConcurrentUserSession::new(UserSession {
            user_sub: sub.into(),
            ..Default::default()
        }));
        (Arc::new(Connection::new(sub, conn, session, tx)), rx)
    }

    fn text(message: Message) -> String {
        match message {
            Message::Text(text) => text.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_ticket_is_single_use() {
        let (hub, _) = hub();
        let ticket = hub.issue_ticket("user-a");
        let (sub, conn_id) = hub.redeem_ticket(&ticket).unwrap();
        assert_eq!(sub, "user-a");
        assert!(Uuid::parse_str(&conn_id).is_ok());
        assert_eq!(hub.redeem_ticket(&ticket), Err(TicketError::Unknown));
    }

    #[test]
    fn test_expired_ticket_is_rejected() {
        let (mut hub, _) = hub();
        hub.config.ticket_ttl_secs = 0;
        let ticket = hub.issue_ticket("user-a");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(hub.redeem_ticket(&ticket), Err(TicketError::Expired));
    }

    #[tokio::test]
    async fn test_teardown_notifies_peers_once() {
        let (hub, store) = hub();
        let (a, _a_rx) = connection("a", "c1");
        let (b, mut b_rx) = connection("b", "c2");
        hub.register(a.clone()).await.unwrap();
        hub.register(b.clone()).await.unwrap();
        hub.tracker().track("t:1", &a.socket_id);
        hub.tracker().track("t:1", &b.socket_id);
        hub.add_subscription("a", "t:1");

        hub.teardown(&a.socket_id).await;
        hub.teardown(&a.socket_id).await;

        let notice = hub.codec().decode(text(b_rx.recv().await.unwrap()).as_bytes()).unwrap();
        assert_eq!(notice.action, SocketAction::Unsubscribe);
        assert_eq!(notice.payload, "a:c1");
        assert!(b_rx.try_recv().is_err());
        assert!(!hub.has_subscription("a", "t:1"));
        assert!(!store.has_connection("c1"));
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_role_change_reaches_every_connection() {
        let (hub, _) = hub();
        let (c1, mut rx1) = connection("a", "c1");
        let (c2, mut rx2) = connection("a", "c2");
        hub.register(c1).await.unwrap();
        hub.register(c2).await.unwrap();

        hub.role_changed("a");
        for rx in [&mut rx1, &mut rx2] {
            let message = hub.codec().decode(text(rx.recv().await.unwrap()).as_bytes()).unwrap();
            assert_eq!(message.action, SocketAction::RoleCall);
            assert_eq!(message.topic, ROLE_CALL_TOPIC);
        }
    }
}
