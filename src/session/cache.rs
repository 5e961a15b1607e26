//! In-process session caches.
//!
//! # Responsibilities
//! - Pending logins keyed by `state`, consumed exactly once
//! - Live sessions keyed by session id, plus the `userSub → sessionId` index
//! - Group and sub-group snapshots behind a singleflight [`LoadOrSetMap`]
//! - The per-group session version vector
//!
//! # Design Decisions
//! - DashMap everywhere; no lock spans more than one map operation
//! - Loads are shared futures so concurrent misses on one key hit the
//!   provider once, and a failed load leaves the key empty

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::session::types::{
    CachedGroup, CachedSubGroup, ConcurrentUserSession, TempAuthSession,
};

type SharedLoad<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// Concurrent map whose misses are filled by at most one loader per key.
pub struct LoadOrSetMap<K, V, E>
where
    K: Eq + Hash,
{
    values: DashMap<K, V>,
    inflight: DashMap<K, SharedLoad<V, E>>,
}

impl<K, V, E> Default for LoadOrSetMap<K, V, E>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            values: DashMap::new(),
            inflight: DashMap::new(),
        }
    }
}

impl<K, V, E> LoadOrSetMap<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.values.get(key).map(|v| v.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        self.values.insert(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.values.remove(key).map(|(_, v)| v)
    }

    /// Remove every entry matching `predicate`.
    pub fn remove_where(&self, mut predicate: impl FnMut(&K, &V) -> bool) {
        self.values.retain(|k, v| !predicate(k, v));
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Return the cached value or run `loader`, sharing one in-flight load
    /// among all concurrent callers for `key`.
    pub async fn load_or_set<F, Fut>(&self, key: K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let load = match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // Someone may have finished between the read above and here.
                if let Some(value) = self.get(&key) {
                    return Ok(value);
                }
                let shared = loader().boxed().shared();
                entry.insert(shared.clone());
                shared
            }
        };

        let result = load.clone().await;
        if let Ok(value) = &result {
            self.values.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self.inflight.remove_if(&key, |_, current| current.ptr_eq(&load));
        result
    }
}

/// Monotonic per-group session versions.
#[derive(Default)]
pub struct GroupVersions {
    versions: DashMap<String, i64>,
}

impl GroupVersions {
    pub fn get(&self, group_id: &str) -> i64 {
        self.versions.get(group_id).map(|v| *v).unwrap_or(0)
    }

    /// Record `candidate` on first sight of a group.
    pub fn init(&self, group_id: &str, candidate: i64) -> i64 {
        *self
            .versions
            .entry(group_id.to_string())
            .or_insert(candidate)
    }

    /// Advance the version to `candidate`, or one past the current value if
    /// `candidate` would not move it forward.
    pub fn bump(&self, group_id: &str, candidate: i64) -> i64 {
        let mut entry = self.versions.entry(group_id.to_string()).or_insert(0);
        *entry = candidate.max(entry.saturating_add(1));
        *entry
    }
}

/// Error type cached loads resolve to.
pub type LoadError = crate::session::SessionError;

/// The bundle of caches the session manager works against.
#[derive(Default)]
pub struct SessionCache {
    pub temp_auth: DashMap<String, TempAuthSession>,
    pub user_sessions: DashMap<String, Arc<ConcurrentUserSession>>,
    pub user_session_ids: DashMap<String, String>,
    pub groups: LoadOrSetMap<String, Arc<CachedGroup>, LoadError>,
    pub sub_groups: LoadOrSetMap<String, Arc<CachedSubGroup>, LoadError>,
    pub group_versions: GroupVersions,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return a pending login. Only one caller can win.
    pub fn take_temp_auth(&self, state: &str) -> Option<TempAuthSession> {
        self.temp_auth.remove(state).map(|(_, temp)| temp)
    }

    /// Drop pending logins older than `max_age`.
    pub fn sweep_temp_auth(&self, max_age: Duration) -> usize {
        let before = self.temp_auth.len();
        self.temp_auth.retain(|_, temp| temp.created_at.elapsed() <= max_age);
        before - self.temp_auth.len()
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<ConcurrentUserSession>> {
        self.user_sessions.get(session_id).map(|s| s.clone())
    }

    pub fn session_for_sub(&self, user_sub: &str) -> Option<Arc<ConcurrentUserSession>> {
        let id = self.user_session_ids.get(user_sub).map(|id| id.clone())?;
        self.session(&id)
    }

    /// Remove a session and its sub index entry if it still points here.
    pub fn remove_session(&self, session_id: &str) -> Option<Arc<ConcurrentUserSession>> {
        let (_, session) = self.user_sessions.remove(session_id)?;
        let sub = session.user_sub();
        self.user_session_ids.remove_if(&sub, |_, id| id == session_id);
        Some(session)
    }

    /// Evict a group's snapshots so the next lookup reloads them.
    pub fn evict_group(&self, group_id: &str) {
        let mut paths = Vec::new();
        self.groups.remove_where(|path, group| {
            let hit = group.id == group_id;
            if hit {
                paths.push(path.clone());
            }
            hit
        });
        if paths.is_empty() {
            return;
        }
        self.sub_groups.remove_where(|_, sub| paths.contains(&sub.group_path));
    }
}
