//! Session data types.

use std::net::IpAddr;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Pending login, keyed by `state` until the callback consumes it.
#[derive(Debug, Clone)]
pub struct TempAuthSession {
    pub code_verifier: String,
    pub state: String,
    pub created_at: Instant,
    pub timezone: String,
    pub user_agent: String,
}

/// Long-lived identity minted at callback.
///
/// Timestamps are nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSession {
    pub id: String,
    pub user_sub: String,
    pub user_email: String,
    pub id_token: String,
    pub access_token: String,
    pub access_expires_at: i64,
    pub refresh_token: String,
    pub refresh_expires_at: i64,
    pub anon_ip: String,
    pub timezone: String,
    pub user_agent: String,
    pub sub_group_paths: Vec<String>,
    pub role_bits: i32,

    pub group_id: String,
    pub group_path: String,
    pub group_code: String,
    pub group_name: String,
    pub group_external_id: String,
    pub group_sub: String,
    pub group_ai: bool,
    pub sub_group_path: String,
    pub sub_group_name: String,
    pub sub_group_external_id: String,
    pub group_session_version: i64,
}

impl UserSession {
    /// Copy group metadata onto the session.
    pub fn apply_group(
        &mut self,
        group: &CachedGroup,
        sub_group: &CachedSubGroup,
        version: i64,
    ) {
        self.group_id = group.id.clone();
        self.group_path = group.path.clone();
        self.group_code = group.code.clone();
        self.group_name = group.name.clone();
        self.group_external_id = group.external_id.clone();
        self.group_sub = group.sub.clone();
        self.group_ai = group.ai;
        self.sub_group_path = sub_group.path.clone();
        self.sub_group_name = sub_group.name.clone();
        self.sub_group_external_id = sub_group.external_id.clone();
        self.group_session_version = version;
    }

    pub fn needs_group(&self) -> bool {
        !self.sub_group_paths.is_empty()
    }
}

/// A [`UserSession`] shared between HTTP handlers, socket readers, and group
/// invalidation.
///
/// Readers take the shared lock, writers the exclusive one. Accessors take
/// closures so no guard outlives the field access; nothing here holds a lock
/// across an await point.
#[derive(Debug)]
pub struct ConcurrentUserSession {
    inner: RwLock<UserSession>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl ConcurrentUserSession {
    pub fn new(session: UserSession) -> Self {
        Self {
            inner: RwLock::new(session),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&UserSession) -> R) -> R {
        f(&self.inner.read())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut UserSession) -> R) -> R {
        f(&mut self.inner.write())
    }

    pub fn snapshot(&self) -> UserSession {
        self.inner.read().clone()
    }

    /// Supersede the whole session in one exclusive section.
    pub fn replace(&self, session: UserSession) {
        *self.inner.write() = session;
    }

    /// Serializes refreshes of this session.
    pub fn refresh_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.refresh_gate
    }

    pub fn id(&self) -> String {
        self.read(|s| s.id.clone())
    }

    pub fn user_sub(&self) -> String {
        self.read(|s| s.user_sub.clone())
    }

    pub fn group_id(&self) -> String {
        self.read(|s| s.group_id.clone())
    }

    pub fn role_bits(&self) -> i32 {
        self.read(|s| s.role_bits)
    }

    pub fn group_session_version(&self) -> i64 {
        self.read(|s| s.group_session_version)
    }
}

/// Snapshot of a tenant group, keyed by `/<groupName>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedGroup {
    pub id: String,
    pub path: String,
    pub external_id: String,
    pub sub: String,
    pub name: String,
    pub code: String,
    pub ai: bool,
    pub sub_group_paths: Vec<String>,
}

/// Snapshot of a role inside a group, keyed by `/<groupName>/<roleName>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedSubGroup {
    pub path: String,
    pub external_id: String,
    pub name: String,
    pub group_path: String,
}

/// Split `/<groupName>/<roleName>` into its parts.
pub fn split_sub_group_path(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.strip_prefix('/')?.splitn(2, '/');
    let group = parts.next().filter(|g| !g.is_empty())?;
    let role = parts.next().filter(|r| !r.is_empty() && !r.contains('/'))?;
    Some((group, role))
}

/// Zero the last octet of an IPv4 address; other inputs yield "".
pub fn anon_ip(addr: &str) -> String {
    let host = addr
        .parse::<std::net::SocketAddr>()
        .map(|a| a.ip())
        .or_else(|_| addr.parse::<IpAddr>());
    match host {
        Ok(IpAddr::V4(ip)) => {
            let [a, b, c, _] = ip.octets();
            format!("{a}.{b}.{c}.0")
        }
        _ => String::new(),
    }
}

pub fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}
