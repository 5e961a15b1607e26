use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};

use super::{Database, DbError, DbScope, SessionTx, Statement};
use crate::config::DatabaseConfig;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Postgres behind a shared pool.
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lazily connecting pool; the first query opens the first connection.
    pub fn connect_lazy(config: &DatabaseConfig, url: &str) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_lazy(url)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_value<'q>(query: PgQuery<'q>, value: &'q Value) -> PgQuery<'q> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(Json(other)),
    }
}

fn bind_all<'q>(sql: &'q str, params: &'q [Value]) -> PgQuery<'q> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| bind_value(query, value))
}

fn as_json_rows(sql: &str) -> String {
    format!("WITH q AS ({sql}) SELECT row_to_json(q) FROM q")
}

/// Statements that yield rows: queries and writes with `RETURNING`.
fn returns_rows(sql: &str) -> bool {
    let upper = sql.trim_start().to_ascii_uppercase();
    upper.starts_with("SELECT") || upper.starts_with("WITH") || upper.contains(" RETURNING ")
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn open(pool: &PgPool, scope: &DbScope) -> Result<Self, DbError> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            "SELECT set_config('app_session.user_sub', $1, true), \
             set_config('app_session.group_id', $2, true), \
             set_config('app_session.role_bits', $3, true)",
        )
        .bind(&scope.user_sub)
        .bind(&scope.group_id)
        .bind(scope.role_bits.to_string())
        .execute(&mut *tx)
        .await?;
        Ok(Self { tx })
    }
}

#[async_trait]
impl SessionTx for PgTx {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let result = bind_all(sql, params).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn query_json(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Value>, DbError> {
        let wrapped = as_json_rows(sql);
        let rows = bind_all(&wrapped, params).fetch_all(&mut *self.tx).await?;
        rows.iter()
            .map(|row| {
                row.try_get::<Json<Value>, _>(0)
                    .map(|Json(value)| value)
                    .map_err(DbError::from)
            })
            .collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self, scope: &DbScope) -> Result<Box<dyn SessionTx>, DbError> {
        Ok(Box::new(PgTx::open(&self.pool, scope).await?))
    }

    async fn send_batch(
        &self,
        scope: &DbScope,
        statements: Vec<Statement>,
    ) -> Result<Vec<Vec<Value>>, DbError> {
        let mut tx = PgTx::open(&self.pool, scope).await?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in &statements {
            if returns_rows(&statement.sql) {
                results.push(tx.query_json(&statement.sql, &statement.params).await?);
            } else {
                tx.execute(&statement.sql, &statement.params).await?;
                results.push(Vec::new());
            }
        }
        Box::new(tx).commit().await?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_wrapped_as_json() {
        assert_eq!(
            as_json_rows("SELECT id FROM t WHERE a = $1"),
            "WITH q AS (SELECT id FROM t WHERE a = $1) SELECT row_to_json(q) FROM q"
        );
    }

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("  select 1"));
        assert!(returns_rows("INSERT INTO t (a) VALUES ($1) RETURNING id"));
        assert!(!returns_rows("UPDATE t SET a = 1"));
    }
}
