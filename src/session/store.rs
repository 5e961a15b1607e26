//! Durable session rows.
//!
//! Only part of a [`UserSession`] is persisted: the tokens, their expiry, the
//! client fingerprint, and the group binding. A session rebuilt from a row has
//! no claims (role mask, group paths) and must be refreshed before use.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;

use crate::session::types::UserSession;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("session store error: {0}")]
    Backend(String),

    #[error("session {0} not found")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// The persisted subset of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionRow {
    pub id: String,
    pub sub: String,
    pub id_token: String,
    pub access_token: String,
    pub access_expires_at: i64,
    pub refresh_token: String,
    pub refresh_expires_at: i64,
    pub ip_address: String,
    pub timezone: String,
    pub user_agent: String,
    pub group_id: String,
}

impl From<&UserSession> for SessionRow {
    fn from(session: &UserSession) -> Self {
        Self {
            id: session.id.clone(),
            sub: session.user_sub.clone(),
            id_token: session.id_token.clone(),
            access_token: session.access_token.clone(),
            access_expires_at: session.access_expires_at,
            refresh_token: session.refresh_token.clone(),
            refresh_expires_at: session.refresh_expires_at,
            ip_address: session.anon_ip.clone(),
            timezone: session.timezone.clone(),
            user_agent: session.user_agent.clone(),
            group_id: session.group_id.clone(),
        }
    }
}

impl SessionRow {
    /// Rebuild a partial session. The result has no claims.
    pub fn into_session(self) -> UserSession {
        UserSession {
            id: self.id,
            user_sub: self.sub,
            id_token: self.id_token,
            access_token: self.access_token,
            access_expires_at: self.access_expires_at,
            refresh_token: self.refresh_token,
            refresh_expires_at: self.refresh_expires_at,
            anon_ip: self.ip_address,
            timezone: self.timezone,
            user_agent: self.user_agent,
            group_id: self.group_id,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, row: SessionRow) -> Result<(), StoreError>;

    async fn update(&self, row: SessionRow) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<SessionRow>, StoreError>;

    /// Most recently written session for a subject.
    async fn get_by_sub(&self, sub: &str) -> Result<Option<SessionRow>, StoreError>;

    async fn list_by_group(&self, group_id: &str) -> Result<Vec<SessionRow>, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Session rows kept in process memory.
#[derive(Default)]
pub struct MemorySessionStore {
    rows: DashMap<String, (u64, SessionRow)>,
    writes: std::sync::atomic::AtomicU64,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stamp(&self) -> u64 {
        self.writes.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, row: SessionRow) -> Result<(), StoreError> {
        let stamp = self.stamp();
        self.rows.insert(row.id.clone(), (stamp, row));
        Ok(())
    }

    async fn update(&self, row: SessionRow) -> Result<(), StoreError> {
        let stamp = self.stamp();
        match self.rows.get_mut(&row.id) {
            Some(mut existing) => {
                *existing = (stamp, row);
                Ok(())
            }
            None => Err(StoreError::NotFound(row.id)),
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<SessionRow>, StoreError> {
        Ok(self.rows.get(id).map(|r| r.1.clone()))
    }

    async fn get_by_sub(&self, sub: &str) -> Result<Option<SessionRow>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.1.sub == sub)
            .max_by_key(|r| r.0)
            .map(|r| r.1.clone()))
    }

    async fn list_by_group(&self, group_id: &str) -> Result<Vec<SessionRow>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.1.group_id == group_id)
            .map(|r| r.1.clone())
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.rows.remove(id);
        Ok(())
    }
}

/// Session rows in Postgres (`dbtable_schema.user_sessions`).
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row(row: &sqlx::postgres::PgRow) -> Result<SessionRow, StoreError> {
        Ok(SessionRow {
            id: row.try_get("id")?,
            sub: row.try_get("sub")?,
            id_token: row.try_get("id_token")?,
            access_token: row.try_get("access_token")?,
            access_expires_at: row.try_get("access_expires_at")?,
            refresh_token: row.try_get("refresh_token")?,
            refresh_expires_at: row.try_get("refresh_expires_at")?,
            ip_address: row.try_get("ip_address")?,
            timezone: row.try_get("timezone")?,
            user_agent: row.try_get("user_agent")?,
            group_id: row
                .try_get::<Option<String>, _>("group_id")?
                .unwrap_or_default(),
        })
    }
}

const SESSION_COLUMNS: &str = "id, sub, id_token, access_token, access_expires_at, refresh_token, \
     refresh_expires_at, ip_address, timezone, user_agent, group_id::text AS group_id";

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, row: SessionRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO dbtable_schema.user_sessions (id, sub, id_token, access_token, \
             access_expires_at, refresh_token, refresh_expires_at, ip_address, timezone, \
             user_agent, group_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULLIF($11, '')::uuid)",
        )
        .bind(&row.id)
        .bind(&row.sub)
        .bind(&row.id_token)
        .bind(&row.access_token)
        .bind(row.access_expires_at)
        .bind(&row.refresh_token)
        .bind(row.refresh_expires_at)
        .bind(&row.ip_address)
        .bind(&row.timezone)
        .bind(&row.user_agent)
        .bind(&row.group_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, row: SessionRow) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE dbtable_schema.user_sessions SET id_token = $2, access_token = $3, \
             access_expires_at = $4, refresh_token = $5, refresh_expires_at = $6, \
             ip_address = $7, timezone = $8, user_agent = $9, \
             group_id = NULLIF($10, '')::uuid, updated_on = NOW() \
             WHERE id = $1",
        )
        .bind(&row.id)
        .bind(&row.id_token)
        .bind(&row.access_token)
        .bind(row.access_expires_at)
        .bind(&row.refresh_token)
        .bind(row.refresh_expires_at)
        .bind(&row.ip_address)
        .bind(&row.timezone)
        .bind(&row.user_agent)
        .bind(&row.group_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(row.id));
        }
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<SessionRow>, StoreError> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM dbtable_schema.user_sessions WHERE id = $1");
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row).transpose()
    }

    async fn get_by_sub(&self, sub: &str) -> Result<Option<SessionRow>, StoreError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM dbtable_schema.user_sessions WHERE sub = $1 \
             ORDER BY COALESCE(updated_on, created_on) DESC LIMIT 1"
        );
        let row = sqlx::query(&query).bind(sub).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row).transpose()
    }

    async fn list_by_group(&self, group_id: &str) -> Result<Vec<SessionRow>, StoreError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM dbtable_schema.user_sessions WHERE group_id::text = $1"
        );
        let rows = sqlx::query(&query).bind(group_id).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row).collect()
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM dbtable_schema.user_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
