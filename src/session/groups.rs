//! Group metadata sources.
//!
//! A group snapshot merges the relational row (id, code, name, system user)
//! with the provider's sub-group enumeration. Roles are sub-groups of the
//! tenant group at `/<groupName>/<roleName>`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::auth::IdentityProvider;
use crate::session::types::{CachedGroup, CachedSubGroup};
use crate::session::SessionError;

#[async_trait]
pub trait GroupSource: Send + Sync {
    async fn load_group(&self, group_path: &str) -> Result<CachedGroup, SessionError>;

    async fn load_sub_group(
        &self,
        group: &CachedGroup,
        sub_group_path: &str,
        role_name: &str,
    ) -> Result<CachedSubGroup, SessionError>;
}

/// Groups from Postgres, roles from the identity provider.
pub struct DirectoryGroupSource {
    pool: PgPool,
    provider: Arc<dyn IdentityProvider>,
}

impl DirectoryGroupSource {
    pub fn new(pool: PgPool, provider: Arc<dyn IdentityProvider>) -> Self {
        Self { pool, provider }
    }
}

#[async_trait]
impl GroupSource for DirectoryGroupSource {
    async fn load_group(&self, group_path: &str) -> Result<CachedGroup, SessionError> {
        let name = group_path.trim_start_matches('/');
        let row = sqlx::query(
            "SELECT g.id::text AS id, g.external_id, g.code, g.name, g.ai, u.sub \
             FROM dbtable_schema.groups g \
             JOIN dbtable_schema.users u ON u.username = CONCAT('system_group_', g.id) \
             WHERE g.name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SessionError::Group(e.to_string()))?
        .ok_or_else(|| SessionError::Group(format!("unknown group {group_path}")))?;

        let get = |col: &str| -> Result<String, SessionError> {
            row.try_get::<String, _>(col)
                .map_err(|e| SessionError::Group(e.to_string()))
        };

        let external_id = get("external_id")?;
        let sub_groups = self.provider.sub_groups(&external_id).await?;

        Ok(CachedGroup {
            id: get("id")?,
            path: group_path.to_string(),
            external_id,
            sub: get("sub")?,
            name: get("name")?,
            code: get("code")?,
            ai: row.try_get("ai").unwrap_or(false),
            sub_group_paths: sub_groups.into_iter().map(|g| g.path).collect(),
        })
    }

    async fn load_sub_group(
        &self,
        group: &CachedGroup,
        sub_group_path: &str,
        role_name: &str,
    ) -> Result<CachedSubGroup, SessionError> {
        let found = self
            .provider
            .sub_groups(&group.external_id)
            .await?
            .into_iter()
            .find(|g| g.path == sub_group_path)
            .ok_or_else(|| SessionError::Group(format!("unknown sub-group {sub_group_path}")))?;

        Ok(CachedSubGroup {
            path: sub_group_path.to_string(),
            external_id: found.id,
            name: role_name.to_string(),
            group_path: group.path.clone(),
        })
    }
}

/// Fixed group table held in memory; counts loads.
#[derive(Default)]
pub struct StaticGroupSource {
    groups: DashMap<String, CachedGroup>,
    sub_groups: DashMap<String, CachedSubGroup>,
    loads: AtomicUsize,
}

impl StaticGroupSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a group together with its roles.
    pub fn put_group(&self, group: CachedGroup, roles: &[(&str, &str)]) {
        for (role_name, external_id) in roles {
            let path = format!("{}/{}", group.path, role_name);
            self.sub_groups.insert(
                path.clone(),
                CachedSubGroup {
                    path,
                    external_id: external_id.to_string(),
                    name: role_name.to_string(),
                    group_path: group.path.clone(),
                },
            );
        }
        self.groups.insert(group.path.clone(), group);
    }

    pub fn rename_group(&self, group_path: &str, name: &str) {
        if let Some(mut group) = self.groups.get_mut(group_path) {
            group.name = name.to_string();
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GroupSource for StaticGroupSource {
    async fn load_group(&self, group_path: &str) -> Result<CachedGroup, SessionError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.groups
            .get(group_path)
            .map(|g| g.clone())
            .ok_or_else(|| SessionError::Group(format!("unknown group {group_path}")))
    }

    async fn load_sub_group(
        &self,
        _group: &CachedGroup,
        sub_group_path: &str,
        _role_name: &str,
    ) -> Result<CachedSubGroup, SessionError> {
        self.sub_groups
            .get(sub_group_path)
            .map(|g| g.clone())
            .ok_or_else(|| SessionError::Group(format!("unknown sub-group {sub_group_path}")))
    }
}
