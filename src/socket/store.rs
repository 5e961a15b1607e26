//! Durable socket state.
//!
//! # Responsibilities
//! - Connection records, one per live socket
//! - Topic allowances (may this user join this topic handle?)
//! - The per-topic message log behind LOAD_MESSAGES
//! - Participant details (display name, role) for LOAD_SUBSCRIBERS
//!
//! Every call runs under the caller's [`DbScope`] so row-level policies apply.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;

use crate::db::{Database, DbError, DbScope};

#[derive(Debug, Clone, Error)]
pub enum SocketStoreError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("malformed socket row: {0}")]
    Row(String),
}

#[async_trait]
pub trait SocketStore: Send + Sync {
    async fn add_connection(&self, scope: &DbScope, conn_id: &str) -> Result<(), SocketStoreError>;

    /// Drop the record unless the connection has stored messages.
    async fn remove_connection(&self, scope: &DbScope, conn_id: &str) -> Result<(), SocketStoreError>;

    /// May `scope`'s user subscribe to `description:handle`?
    async fn allowed(
        &self,
        scope: &DbScope,
        description: &str,
        handle: &str,
    ) -> Result<bool, SocketStoreError>;

    /// Append an encoded frame to the topic's log.
    async fn store_message(
        &self,
        scope: &DbScope,
        conn_id: &str,
        topic: &str,
        frame: String,
    ) -> Result<(), SocketStoreError>;

    /// Frames for `topic`, newest first. Pages start at 1.
    async fn topic_messages(
        &self,
        scope: &DbScope,
        topic: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<String>, SocketStoreError>;

    /// Users who wrote to `topic`, with the connections they used.
    async fn message_participants(
        &self,
        scope: &DbScope,
        topic: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, SocketStoreError>;

    /// `(name, role)` for each known user sub.
    async fn participant_details(
        &self,
        scope: &DbScope,
        subs: &[String],
    ) -> Result<HashMap<String, (String, String)>, SocketStoreError>;
}

struct StoredMessage {
    user_sub: String,
    conn_id: String,
    frame: String,
}

#[derive(Default)]
struct MemoryState {
    connections: HashMap<String, String>,
    allowances: HashSet<(String, String)>,
    messages: HashMap<String, Vec<StoredMessage>>,
    details: HashMap<String, (String, String)>,
}

/// In-process socket store.
#[derive(Default)]
pub struct MemorySocketStore {
    open: bool,
    state: Mutex<MemoryState>,
}

impl MemorySocketStore {
    /// Store that only admits explicitly allowed `(user_sub, handle)` pairs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that admits every subscription.
    pub fn open() -> Self {
        Self {
            open: true,
            state: Mutex::default(),
        }
    }

    pub fn allow(&self, user_sub: &str, handle: &str) {
        self.state
            .lock()
            .allowances
            .insert((user_sub.to_string(), handle.to_string()));
    }

    pub fn set_details(&self, user_sub: &str, name: &str, role: &str) {
        self.state
            .lock()
            .details
            .insert(user_sub.to_string(), (name.to_string(), role.to_string()));
    }

    pub fn has_connection(&self, conn_id: &str) -> bool {
        self.state.lock().connections.contains_key(conn_id)
    }
}

#[async_trait]
impl SocketStore for MemorySocketStore {
    async fn add_connection(&self, scope: &DbScope, conn_id: &str) -> Result<(), SocketStoreError> {
        self.state
            .lock()
            .connections
            .insert(conn_id.to_string(), scope.user_sub.clone());
        Ok(())
    }

    async fn remove_connection(&self, _scope: &DbScope, conn_id: &str) -> Result<(), SocketStoreError> {
        let mut state = self.state.lock();
        let used = state
            .messages
            .values()
            .flatten()
            .any(|m| m.conn_id == conn_id);
        if !used {
            state.connections.remove(conn_id);
        }
        Ok(())
    }

    async fn allowed(
        &self,
        scope: &DbScope,
        _description: &str,
        handle: &str,
    ) -> Result<bool, SocketStoreError> {
        Ok(self.open
            || self
                .state
                .lock()
                .allowances
                .contains(&(scope.user_sub.clone(), handle.to_string())))
    }

    async fn store_message(
        &self,
        scope: &DbScope,
        conn_id: &str,
        topic: &str,
        frame: String,
    ) -> Result<(), SocketStoreError> {
        self.state
            .lock()
            .messages
            .entry(topic.to_string())
            .or_default()
            .push(StoredMessage {
                user_sub: scope.user_sub.clone(),
                conn_id: conn_id.to_string(),
                frame,
            });
        Ok(())
    }

    async fn topic_messages(
        &self,
        _scope: &DbScope,
        topic: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<String>, SocketStoreError> {
        let state = self.state.lock();
        let offset = page.saturating_sub(1) * page_size;
        Ok(state
            .messages
            .get(topic)
            .map(|log| {
                log.iter()
                    .rev()
                    .skip(offset)
                    .take(page_size)
                    .map(|m| m.frame.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn message_participants(
        &self,
        _scope: &DbScope,
        topic: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, SocketStoreError> {
        let state = self.state.lock();
        let mut participants: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for message in state.messages.get(topic).into_iter().flatten() {
            let cids = participants.entry(message.user_sub.clone()).or_default();
            if !cids.contains(&message.conn_id) {
                cids.push(message.conn_id.clone());
            }
        }
        Ok(participants)
    }

    async fn participant_details(
        &self,
        _scope: &DbScope,
        subs: &[String],
    ) -> Result<HashMap<String, (String, String)>, SocketStoreError> {
        let state = self.state.lock();
        Ok(subs
            .iter()
            .filter_map(|sub| state.details.get(sub).map(|d| (sub.clone(), d.clone())))
            .collect())
    }
}

/// Socket store over the relational database.
pub struct DbSocketStore {
    database: Arc<dyn Database>,
}

impl DbSocketStore {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self { database }
    }

    async fn execute(&self, scope: &DbScope, sql: &str, params: &[Value]) -> Result<(), SocketStoreError> {
        let mut tx = self.database.begin(scope).await?;
        match tx.execute(sql, params).await {
            Ok(_) => Ok(tx.commit().await?),
            Err(e) => {
                tx.rollback().await?;
                Err(e.into())
            }
        }
    }

    async fn query(&self, scope: &DbScope, sql: &str, params: &[Value]) -> Result<Vec<Value>, SocketStoreError> {
        let mut tx = self.database.begin(scope).await?;
        match tx.query_json(sql, params).await {
            Ok(rows) => {
                tx.commit().await?;
                Ok(rows)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e.into())
            }
        }
    }
}

fn text(row: &Value, field: &str) -> Result<String, SocketStoreError> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SocketStoreError::Row(format!("missing {field}")))
}

#[async_trait]
impl SocketStore for DbSocketStore {
    async fn add_connection(&self, scope: &DbScope, conn_id: &str) -> Result<(), SocketStoreError> {
        self.execute(
            scope,
            "INSERT INTO dbtable_schema.sock_connections (created_sub, connection_id) VALUES ($1::uuid, $2)",
            &[json!(scope.user_sub), json!(conn_id)],
        )
        .await
    }

    async fn remove_connection(&self, scope: &DbScope, conn_id: &str) -> Result<(), SocketStoreError> {
        self.execute(
            scope,
            "DELETE FROM dbtable_schema.sock_connections \
             USING dbtable_schema.sock_connections sc \
             LEFT OUTER JOIN dbtable_schema.topic_messages tm ON tm.connection_id = sc.connection_id \
             WHERE dbtable_schema.sock_connections.id = sc.id AND tm.id IS NULL AND sc.connection_id = $1",
            &[json!(conn_id)],
        )
        .await
    }

    async fn allowed(
        &self,
        scope: &DbScope,
        _description: &str,
        handle: &str,
    ) -> Result<bool, SocketStoreError> {
        let rows = self
            .query(
                scope,
                "SELECT EXISTS ( \
                   SELECT 1 FROM dbtable_schema.bookings b \
                   JOIN dbtable_schema.schedule_bracket_slots sbs ON sbs.id = b.schedule_bracket_slot_id \
                   JOIN dbtable_schema.quotes q ON q.id = b.quote_id \
                   WHERE b.id = $2::uuid AND (sbs.created_sub = $1::uuid OR q.created_sub = $1::uuid) \
                 ) AS allowed",
                &[json!(scope.user_sub), json!(handle)],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("allowed"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn store_message(
        &self,
        scope: &DbScope,
        conn_id: &str,
        topic: &str,
        frame: String,
    ) -> Result<(), SocketStoreError> {
        self.execute(
            scope,
            "INSERT INTO dbtable_schema.topic_messages (created_sub, connection_id, topic, message) \
             VALUES ($1::uuid, $2, $3, $4)",
            &[json!(scope.user_sub), json!(conn_id), json!(topic), json!(frame)],
        )
        .await
    }

    async fn topic_messages(
        &self,
        scope: &DbScope,
        topic: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<String>, SocketStoreError> {
        let offset = page.saturating_sub(1) * page_size;
        let rows = self
            .query(
                scope,
                "SELECT message FROM dbtable_schema.topic_messages \
                 WHERE topic = $1 ORDER BY created_on DESC LIMIT $2 OFFSET $3",
                &[json!(topic), json!(page_size as i64), json!(offset as i64)],
            )
            .await?;
        rows.iter().map(|row| text(row, "message")).collect()
    }

    async fn message_participants(
        &self,
        scope: &DbScope,
        topic: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, SocketStoreError> {
        let rows = self
            .query(
                scope,
                "SELECT created_sub::text AS sub, ARRAY_AGG(DISTINCT connection_id) AS cids \
                 FROM dbtable_schema.topic_messages WHERE topic = $1 GROUP BY created_sub",
                &[json!(topic)],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let cids = row
                    .get("cids")
                    .and_then(Value::as_array)
                    .map(|cids| {
                        cids.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Ok((text(row, "sub")?, cids))
            })
            .collect()
    }

    async fn participant_details(
        &self,
        scope: &DbScope,
        subs: &[String],
    ) -> Result<HashMap<String, (String, String)>, SocketStoreError> {
        if subs.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .query(
                scope,
                "SELECT u.sub::text AS sub, LEFT(u.first_name, 1) || LEFT(u.last_name, 1) AS name, r.name AS role \
                 FROM dbtable_schema.users u \
                 JOIN dbtable_schema.group_users gu ON gu.user_id = u.id \
                 JOIN dbtable_schema.group_roles gr ON gr.external_id = gu.external_id \
                 JOIN dbtable_schema.roles r ON r.id = gr.role_id \
                 WHERE u.sub::text IN (SELECT jsonb_array_elements_text($1::jsonb))",
                &[json!(subs)],
            )
            .await?;
        rows.iter()
            .map(|row| Ok((text(row, "sub")?, (text(row, "name")?, text(row, "role")?))))
            .collect()
    }
}
