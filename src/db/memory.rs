use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{Database, DbError, DbScope, SessionTx, Statement};

/// A statement as the in-process database saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    pub scope: DbScope,
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct Journal {
    statements: Mutex<Vec<RecordedStatement>>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// Database stand-in for single-node development and tests.
///
/// Statements are journaled with the scope they ran under; queries return no
/// rows. A transaction's statements reach the journal only on commit.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    journal: Arc<Journal>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statements(&self) -> Vec<RecordedStatement> {
        self.journal.statements.lock().clone()
    }

    pub fn commits(&self) -> usize {
        self.journal.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.journal.rollbacks.load(Ordering::SeqCst)
    }
}

struct MemoryTx {
    journal: Arc<Journal>,
    scope: DbScope,
    pending: Vec<RecordedStatement>,
}

impl MemoryTx {
    fn record(&mut self, sql: &str, params: &[Value]) {
        self.pending.push(RecordedStatement {
            scope: self.scope.clone(),
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }
}

#[async_trait]
impl SessionTx for MemoryTx {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        self.record(sql, params);
        Ok(0)
    }

    async fn query_json(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Value>, DbError> {
        self.record(sql, params);
        Ok(Vec::new())
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let MemoryTx { journal, pending, .. } = *self;
        journal.statements.lock().extend(pending);
        journal.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.journal.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self, scope: &DbScope) -> Result<Box<dyn SessionTx>, DbError> {
        Ok(Box::new(MemoryTx {
            journal: self.journal.clone(),
            scope: scope.clone(),
            pending: Vec::new(),
        }))
    }

    async fn send_batch(
        &self,
        scope: &DbScope,
        statements: Vec<Statement>,
    ) -> Result<Vec<Vec<Value>>, DbError> {
        let mut tx = self.begin(scope).await?;
        for statement in &statements {
            tx.execute(&statement.sql, &statement.params).await?;
        }
        tx.commit().await?;
        Ok(vec![Vec::new(); statements.len()])
    }
}
