//! Request executor.
//!
//! Every handler call runs against either a scoped transaction (committed when
//! the handler succeeds, rolled back otherwise) or a deferred batch the
//! handler flushes itself.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderMap, Method, Uri};
use serde_json::Value;
use uuid::Uuid;

use super::{Database, DbError, DbScope, SessionTx, Statement};
use crate::session::{ConcurrentUserSession, UserSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Tx,
    Batch,
}

/// Statements queued by a handler and sent together.
pub struct Batch {
    database: Arc<dyn Database>,
    scope: DbScope,
    queued: Vec<Statement>,
}

impl Batch {
    pub fn new(database: Arc<dyn Database>, scope: DbScope) -> Self {
        Self {
            database,
            scope,
            queued: Vec::new(),
        }
    }

    pub fn add(&mut self, sql: impl Into<String>, params: Vec<Value>) {
        self.queued.push(Statement {
            sql: sql.into(),
            params,
        });
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Flush the queue. Results come back in the order statements were added.
    pub async fn send(&mut self) -> Result<Vec<Vec<Value>>, DbError> {
        if self.queued.is_empty() {
            return Ok(Vec::new());
        }
        let statements = std::mem::take(&mut self.queued);
        self.database.send_batch(&self.scope, statements).await
    }
}

/// The database side of a request.
pub enum DbHandle {
    Tx(Box<dyn SessionTx>),
    Batch(Batch),
    /// The transaction was already released.
    Closed,
}

impl DbHandle {
    /// Open the handle `kind` asks for under `scope`.
    pub async fn open(
        database: &Arc<dyn Database>,
        kind: ExecutorKind,
        scope: DbScope,
    ) -> Result<Self, DbError> {
        match kind {
            ExecutorKind::Tx => Ok(DbHandle::Tx(database.begin(&scope).await?)),
            ExecutorKind::Batch => Ok(DbHandle::Batch(Batch::new(database.clone(), scope))),
        }
    }

    /// Commit on success, roll back otherwise. Batches need no release.
    pub async fn release(&mut self, success: bool) -> Result<(), DbError> {
        match std::mem::replace(self, DbHandle::Closed) {
            DbHandle::Tx(tx) if success => tx.commit().await,
            DbHandle::Tx(tx) => tx.rollback().await,
            other => {
                *self = other;
                Ok(())
            }
        }
    }
}

/// Everything a handler gets besides its decoded input.
pub struct ReqInfo {
    pub request_id: Uuid,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub path_params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub session: Arc<ConcurrentUserSession>,
    pub db: DbHandle,
}

impl ReqInfo {
    pub fn new(session: Arc<ConcurrentUserSession>, db: DbHandle) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method: Method::GET,
            uri: Uri::default(),
            headers: HeaderMap::new(),
            path_params: HashMap::new(),
            query: HashMap::new(),
            session,
            db,
        }
    }

    pub fn session(&self) -> UserSession {
        self.session.snapshot()
    }

    pub fn tx(&mut self) -> Result<&mut dyn SessionTx, DbError> {
        match &mut self.db {
            DbHandle::Tx(tx) => Ok(tx.as_mut()),
            _ => Err(DbError::Unavailable("transaction")),
        }
    }

    pub fn batch(&mut self) -> Result<&mut Batch, DbError> {
        match &mut self.db {
            DbHandle::Batch(batch) => Ok(batch),
            _ => Err(DbError::Unavailable("batch")),
        }
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use serde_json::json;

    fn scope() -> DbScope {
        DbScope {
            user_sub: "u1".into(),
            group_id: "g1".into(),
            role_bits: 0x8,
        }
    }

    #[tokio::test]
    async fn test_tx_commits_on_success() {
        let memory = MemoryDatabase::new();
        let database: Arc<dyn Database> = Arc::new(memory.clone());
        let mut handle = DbHandle::open(&database, ExecutorKind::Tx, scope()).await.unwrap();
        if let DbHandle::Tx(tx) = &mut handle {
            tx.execute("UPDATE t SET a = $1", &[json!(1)]).await.unwrap();
        }
        handle.release(true).await.unwrap();

        assert_eq!(memory.commits(), 1);
        let statements = memory.statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].scope, scope());
    }

    #[tokio::test]
    async fn test_tx_rolls_back_on_failure() {
        let memory = MemoryDatabase::new();
        let database: Arc<dyn Database> = Arc::new(memory.clone());
        let mut handle = DbHandle::open(&database, ExecutorKind::Tx, scope()).await.unwrap();
        if let DbHandle::Tx(tx) = &mut handle {
            tx.execute("DELETE FROM t", &[]).await.unwrap();
        }
        handle.release(false).await.unwrap();
        handle.release(false).await.unwrap();

        assert_eq!(memory.rollbacks(), 1);
        assert!(memory.statements().is_empty());
    }

    #[tokio::test]
    async fn test_batch_flushes_on_send() {
        let memory = MemoryDatabase::new();
        let database: Arc<dyn Database> = Arc::new(memory.clone());
        let mut batch = Batch::new(database, scope());
        batch.add("INSERT INTO t VALUES ($1)", vec![json!("a")]);
        batch.add("INSERT INTO t VALUES ($1)", vec![json!("b")]);
        assert!(memory.statements().is_empty());

        let results = batch.send().await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(batch.is_empty());
        assert_eq!(memory.statements().len(), 2);
    }
}
