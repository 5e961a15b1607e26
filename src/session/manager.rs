//! OIDC session manager.
//!
//! # Responsibilities
//! - Start a login (PKCE parameters, pending-login record)
//! - Finish a login (code exchange, token validation, signed cookie)
//! - Resolve the session behind a request, rebuilding it from the store on
//!   a cache miss
//! - Refresh sessions near access expiry or behind their group's version
//! - Invalidate every session of a group after a role or group change
//!
//! # Design Decisions
//! - At most one refresh per session is in flight: callers take the session's
//!   refresh gate and re-check before calling the provider
//! - A session rebuilt from a row carries no claims, so it is forced through a
//!   refresh before it is handed out
//! - A failed refresh deletes only the session being refreshed

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

use crate::auth::pkce;
use crate::auth::{IdentityProvider, TokenValidator};
use crate::config::{AuthConfig, SessionConfig};
use crate::observability::metrics;
use crate::security::cookies;
use crate::security::Signer;
use crate::session::cache::SessionCache;
use crate::session::groups::GroupSource;
use crate::session::store::{SessionRow, SessionStore, StoreError};
use crate::session::types::{
    anon_ip, now_nanos, split_sub_group_path, CachedGroup, CachedSubGroup,
    ConcurrentUserSession, TempAuthSession, UserSession,
};
use crate::session::SessionError;

/// Cookie carrying the signed session id.
pub const SESSION_COOKIE: &str = "session_id";

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Told when a user's roles or group may have changed.
pub trait RoleChangeObserver: Send + Sync {
    fn role_changed(&self, user_sub: &str);
}

pub struct SessionManager {
    auth: AuthConfig,
    timings: SessionConfig,
    signer: Signer,
    validator: Arc<TokenValidator>,
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn SessionStore>,
    groups: Arc<dyn GroupSource>,
    cache: SessionCache,
    observer: OnceLock<Arc<dyn RoleChangeObserver>>,
}

impl SessionManager {
    pub fn new(
        auth: AuthConfig,
        timings: SessionConfig,
        signer: Signer,
        validator: Arc<TokenValidator>,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn SessionStore>,
        groups: Arc<dyn GroupSource>,
    ) -> Self {
        Self {
            auth,
            timings,
            signer,
            validator,
            provider,
            store,
            groups,
            cache: SessionCache::new(),
            observer: OnceLock::new(),
        }
    }

    /// Install the role-change observer. Only the first call takes effect.
    pub fn set_observer(&self, observer: Arc<dyn RoleChangeObserver>) {
        if self.observer.set(observer).is_err() {
            tracing::warn!("Role change observer already installed");
        }
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Create a pending login and return the encoded authorization query.
    ///
    /// Both the timezone and user agent are required; without them the result
    /// is empty and nothing is recorded.
    pub fn generate_login_params(&self, timezone: Option<&str>, user_agent: Option<&str>) -> String {
        let (Some(timezone), Some(user_agent)) = (
            timezone.filter(|t| !t.is_empty()),
            user_agent.filter(|u| !u.is_empty()),
        ) else {
            return String::new();
        };

        let code_verifier = pkce::generate_code_verifier();
        let code_challenge = pkce::generate_code_challenge(&code_verifier);
        let state = pkce::generate_state();

        self.cache.temp_auth.insert(
            state.clone(),
            TempAuthSession {
                code_verifier,
                state: state.clone(),
                created_at: Instant::now(),
                timezone: timezone.to_string(),
                user_agent: user_agent.to_string(),
            },
        );

        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.auth.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.auth.redirect_uri())
            .append_pair("scope", &self.auth.scope)
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &state)
            .finish()
    }

    /// Full provider URL for a login started with `params`.
    pub fn login_url(&self, params: &str) -> String {
        format!("{}?{}", self.provider.authorization_endpoint(), params)
    }

    /// Complete a login. Returns the `Set-Cookie` value for the new session.
    pub async fn handle_callback(
        &self,
        code: &str,
        state: &str,
        client_addr: &str,
    ) -> Result<String, SessionError> {
        let temp = self
            .cache
            .take_temp_auth(state)
            .ok_or(SessionError::InvalidState)?;
        if temp.created_at.elapsed() > self.temp_auth_ttl() {
            return Err(SessionError::InvalidState);
        }

        let tokens = self.provider.exchange_code(code, &temp.code_verifier).await?;
        let session = self.validator.validate(
            &tokens,
            &temp.user_agent,
            &temp.timezone,
            &anon_ip(client_addr),
        )?;

        let stored = self.store_session(session).await?;
        let (id, sub) = stored.read(|s| (s.id.clone(), s.user_sub.clone()));
        tracing::info!(target: "auth", user_sub = %sub, "Login completed");

        Ok(cookies::set_cookie(
            SESSION_COOKIE,
            &self.signer.write_signed(SESSION_COOKIE, &id),
            tokens.refresh_expires_in,
        ))
    }

    /// Hydrate group metadata, persist, and publish a session.
    ///
    /// A session without an id is new and gets one; otherwise its row is
    /// updated. Publishing replaces the contents of an already cached session
    /// in place so existing holders observe the update.
    pub async fn store_session(
        &self,
        mut session: UserSession,
    ) -> Result<Arc<ConcurrentUserSession>, SessionError> {
        if let Some(path) = session.sub_group_paths.first().cloned() {
            let (group, sub_group) = self.get_cached_groups(&path).await?;
            let version = self.cache.group_versions.get(&group.id);
            session.apply_group(&group, &sub_group, version);
        }

        if session.id.is_empty() {
            session.id = pkce::generate_session_id();
            self.store.insert(SessionRow::from(&session)).await?;
        } else {
            match self.store.update(SessionRow::from(&session)).await {
                Err(StoreError::NotFound(_)) => {
                    self.store.insert(SessionRow::from(&session)).await?
                }
                other => other?,
            }
        }

        let id = session.id.clone();
        let sub = session.user_sub.clone();
        let shared = match self.cache.user_sessions.entry(id.clone()) {
            Entry::Occupied(entry) => {
                entry.get().replace(session);
                entry.get().clone()
            }
            Entry::Vacant(entry) => entry
                .insert(Arc::new(ConcurrentUserSession::new(session)))
                .clone(),
        };
        self.cache.user_session_ids.insert(sub, id);
        Ok(shared)
    }

    /// Refresh a session's tokens and republish it.
    ///
    /// Callers hold the session's refresh gate.
    pub async fn refresh_session(&self, session: &ConcurrentUserSession) -> Result<(), SessionError> {
        let (id, refresh_token, user_agent, timezone, ip, previous_expiry) = session.read(|s| {
            (
                s.id.clone(),
                s.refresh_token.clone(),
                s.user_agent.clone(),
                s.timezone.clone(),
                s.anon_ip.clone(),
                s.access_expires_at,
            )
        });
        if refresh_token.is_empty() {
            return Err(SessionError::NoRefreshToken);
        }

        let result = async {
            let tokens = self.provider.refresh(&refresh_token).await?;
            let mut next = self.validator.validate(&tokens, &user_agent, &timezone, &ip)?;
            next.id = id;
            if next.access_expires_at <= previous_expiry {
                next.access_expires_at = previous_expiry + 1;
            }
            self.store_session(next).await.map(|_| ())
        }
        .await;

        metrics::record_session_refresh(result.is_ok());
        result
    }

    /// Return `session` if usable, refreshing it first when the access token
    /// is close to expiry or its group version is stale. `None` means the
    /// refresh failed and the session was deleted.
    pub async fn check_session_expiry(
        &self,
        session: Arc<ConcurrentUserSession>,
    ) -> Option<Arc<ConcurrentUserSession>> {
        if !self.needs_refresh(&session) {
            return Some(session);
        }

        let holder = session.clone();
        let _gate = holder.refresh_gate().lock().await;
        if !self.needs_refresh(&session) {
            return Some(session);
        }

        let id = session.id();
        match self.refresh_session(&session).await {
            Ok(()) => Some(session),
            Err(e) => {
                tracing::warn!(target: "auth", error = %e, "Session refresh failed");
                self.delete_session(&id).await;
                None
            }
        }
    }

    fn needs_refresh(&self, session: &ConcurrentUserSession) -> bool {
        let skew = (self.timings.refresh_skew_secs as i64).saturating_mul(NANOS_PER_SEC);
        let (expires, group_id, version) = session.read(|s| {
            (s.access_expires_at, s.group_id.clone(), s.group_session_version)
        });
        if access_due(now_nanos(), skew, expires) {
            return true;
        }
        !group_id.is_empty() && version < self.cache.group_versions.get(&group_id)
    }

    /// Resolve the session named by the signed cookie in `headers`, refreshed
    /// if it was due.
    pub async fn session_from_headers(
        &self,
        headers: &HeaderMap,
    ) -> Result<Arc<ConcurrentUserSession>, SessionError> {
        let signed = cookies::read_cookie(headers, SESSION_COOKIE).ok_or(SessionError::NoSession)?;
        let id = self
            .signer
            .verify_signed(SESSION_COOKIE, &signed)
            .map_err(|_| SessionError::NoSession)?;
        self.session_by_id(&id).await
    }

    pub async fn session_by_id(&self, id: &str) -> Result<Arc<ConcurrentUserSession>, SessionError> {
        let session = match self.cache.session(id) {
            Some(session) => session,
            None => {
                let row = self.store.get_by_id(id).await?.ok_or(SessionError::NoSession)?;
                self.reconstruct(row)
            }
        };
        self.check_session_expiry(session)
            .await
            .ok_or(SessionError::NoSession)
    }

    /// Latest session for a subject.
    pub async fn session_for_sub(&self, user_sub: &str) -> Result<Arc<ConcurrentUserSession>, SessionError> {
        let session = match self.cache.session_for_sub(user_sub) {
            Some(session) => session,
            None => {
                let row = self
                    .store
                    .get_by_sub(user_sub)
                    .await?
                    .ok_or(SessionError::NoSession)?;
                self.reconstruct(row)
            }
        };
        self.check_session_expiry(session)
            .await
            .ok_or(SessionError::NoSession)
    }

    /// Publish a session rebuilt from its row. Concurrent rebuilds of one id
    /// converge on a single shared session.
    fn reconstruct(&self, row: SessionRow) -> Arc<ConcurrentUserSession> {
        let mut session = row.into_session();
        // Rebuilt sessions have no claims; force the refresh path.
        session.access_expires_at = 0;

        let id = session.id.clone();
        let sub = session.user_sub.clone();
        let shared = self
            .cache
            .user_sessions
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ConcurrentUserSession::new(session)))
            .clone();
        self.cache.user_session_ids.entry(sub).or_insert(id);
        shared
    }

    /// Fill in group metadata when the session's binding is missing or stale.
    pub async fn hydrate_group(&self, session: &ConcurrentUserSession) -> Result<(), SessionError> {
        let (path, group_id, version) = session.read(|s| {
            (
                s.sub_group_paths.first().cloned(),
                s.group_id.clone(),
                s.group_session_version,
            )
        });
        let Some(path) = path else {
            return Ok(());
        };
        if !group_id.is_empty() && version >= self.cache.group_versions.get(&group_id) {
            return Ok(());
        }

        let (group, sub_group) = self.get_cached_groups(&path).await?;
        let version = self.cache.group_versions.get(&group.id);
        session.write(|s| s.apply_group(&group, &sub_group, version));
        Ok(())
    }

    /// Group and role snapshots for `/<group>/<role>`, loaded at most once
    /// per key however many callers miss concurrently.
    pub async fn get_cached_groups(
        &self,
        sub_group_path: &str,
    ) -> Result<(Arc<CachedGroup>, Arc<CachedSubGroup>), SessionError> {
        let (group_name, role_name) = split_sub_group_path(sub_group_path)
            .ok_or_else(|| SessionError::Group(format!("bad sub-group path {sub_group_path}")))?;
        let group_path = format!("/{group_name}");

        let source = self.groups.clone();
        let key = group_path.clone();
        let group = self
            .cache
            .groups
            .load_or_set(group_path, move || async move {
                source.load_group(&key).await.map(Arc::new)
            })
            .await?;

        let source = self.groups.clone();
        let parent = group.clone();
        let path = sub_group_path.to_string();
        let role = role_name.to_string();
        let sub_group = self
            .cache
            .sub_groups
            .load_or_set(sub_group_path.to_string(), move || async move {
                source.load_sub_group(&parent, &path, &role).await.map(Arc::new)
            })
            .await?;

        self.cache.group_versions.init(&group.id, now_nanos());
        Ok((group, sub_group))
    }

    /// Invalidate every session bound to `group_id`.
    ///
    /// Bumps the group version, drops the group snapshots, refreshes each
    /// cached member session, and notifies the observer once per user.
    pub async fn reset_group_session(&self, group_id: &str) -> Result<(), SessionError> {
        let version = self.cache.group_versions.bump(group_id, now_nanos());
        self.cache.evict_group(group_id);

        let rows = self.store.list_by_group(group_id).await?;
        let mut notified = HashSet::new();
        for row in rows {
            if let Some(session) = self.cache.session(&row.id) {
                let _gate = session.refresh_gate().lock().await;
                if session.group_session_version() < version {
                    if let Err(e) = self.refresh_session(&session).await {
                        tracing::warn!(target: "auth", error = %e, session = %row.id, "Group reset refresh failed");
                        self.delete_session(&row.id).await;
                    }
                }
            }

            if notified.insert(row.sub.clone()) {
                if let Some(observer) = self.observer.get() {
                    observer.role_changed(&row.sub);
                }
            }
        }

        tracing::info!(target: "auth", group_id, version, users = notified.len(), "Group sessions reset");
        Ok(())
    }

    /// Remove a session from the store and the cache.
    pub async fn delete_session(&self, id: &str) {
        if let Err(e) = self.store.delete(id).await {
            tracing::error!(target: "auth", error = %e, "Failed to delete session row");
        }
        self.cache.remove_session(id);
    }

    /// End the session named by `headers`, if any. Returns the clearing cookie.
    pub async fn logout(&self, headers: &HeaderMap) -> String {
        let id = cookies::read_cookie(headers, SESSION_COOKIE)
            .and_then(|signed| self.signer.verify_signed(SESSION_COOKIE, &signed).ok());
        if let Some(id) = id {
            self.delete_session(&id).await;
            tracing::info!(target: "auth", "Logout completed");
        }
        cookies::clear_cookie(SESSION_COOKIE)
    }

    fn temp_auth_ttl(&self) -> Duration {
        Duration::from_secs(self.timings.temp_auth_ttl_secs)
    }

    /// Sweep expired pending logins until shutdown.
    pub fn spawn_temp_auth_sweep(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let every = Duration::from_secs(self.timings.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = manager.cache.sweep_temp_auth(manager.temp_auth_ttl());
                        if swept > 0 {
                            tracing::debug!(swept, "Expired pending logins");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

/// True once `now + skew` has passed the access expiry.
fn access_due(now: i64, skew: i64, access_expires_at: i64) -> bool {
    now.saturating_add(skew) > access_expires_at
}
