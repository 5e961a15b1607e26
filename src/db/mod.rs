//! Relational store access.
//!
//! # Responsibilities
//! - Scoped transactions that carry the caller's identity as session
//!   variables so row-level policies can see it
//! - Deferred statement batches flushed by the handler
//! - The request executor that hands one of the two to each handler
//!
//! # Design Decisions
//! - Statements and rows cross the trait as `serde_json::Value`; handlers
//!   never see the driver types
//! - A transaction is owned by exactly one request and is `Send` but not
//!   shared

pub mod executor;
mod memory;
mod postgres;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::ApiError;
use crate::session::UserSession;

pub use executor::{Batch, DbHandle, ExecutorKind, ReqInfo};
pub use memory::{MemoryDatabase, RecordedStatement};
pub use postgres::PgDatabase;

#[derive(Debug, Clone, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Backend(String),

    #[error("no {0} available for this request")]
    Unavailable(&'static str),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        DbError::Backend(err.to_string())
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        ApiError::internal(err)
    }
}

/// Identity applied to a transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbScope {
    pub user_sub: String,
    pub group_id: String,
    pub role_bits: i32,
}

impl DbScope {
    pub fn from_session(session: &UserSession) -> Self {
        Self {
            user_sub: session.user_sub.clone(),
            group_id: session.group_id.clone(),
            role_bits: session.role_bits,
        }
    }
}

/// One statement and its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Open a transaction with `scope` applied.
    async fn begin(&self, scope: &DbScope) -> Result<Box<dyn SessionTx>, DbError>;

    /// Run `statements` in order in one scoped transaction and return each
    /// statement's rows.
    async fn send_batch(
        &self,
        scope: &DbScope,
        statements: Vec<Statement>,
    ) -> Result<Vec<Vec<Value>>, DbError>;
}

#[async_trait]
pub trait SessionTx: Send {
    /// Run a statement, returning the affected row count.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError>;

    /// Run a query, returning each row as a JSON object.
    async fn query_json(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Value>, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}
