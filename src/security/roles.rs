//! Site roles.
//!
//! A site role is one bit in the session's role mask. The identity provider
//! grants roles as strings under `resource_access[<client>].roles`; the table
//! below is the single mapping between those names and their bits.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SiteRole {
    Unrestricted = 0,
    AppRoleCall = 0x1,
    AppGroupAdmin = 0x2,
    AppGroupBookings = 0x4,
    AppGroupUsers = 0x8,
    AppGroupSchedules = 0x10,
    AppGroupServices = 0x20,
    AppGroupScheduleKeys = 0x40,
    AppGroupRoles = 0x80,
    AppGroupPermissions = 0x100,
}

const ROLE_TABLE: &[(SiteRole, &str)] = &[
    (SiteRole::Unrestricted, "UNRESTRICTED"),
    (SiteRole::AppRoleCall, "APP_ROLE_CALL"),
    (SiteRole::AppGroupAdmin, "APP_GROUP_ADMIN"),
    (SiteRole::AppGroupBookings, "APP_GROUP_BOOKINGS"),
    (SiteRole::AppGroupUsers, "APP_GROUP_USERS"),
    (SiteRole::AppGroupSchedules, "APP_GROUP_SCHEDULES"),
    (SiteRole::AppGroupServices, "APP_GROUP_SERVICES"),
    (SiteRole::AppGroupScheduleKeys, "APP_GROUP_SCHEDULE_KEYS"),
    (SiteRole::AppGroupRoles, "APP_GROUP_ROLES"),
    (SiteRole::AppGroupPermissions, "APP_GROUP_PERMISSIONS"),
];

impl SiteRole {
    pub fn bits(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        ROLE_TABLE
            .iter()
            .find(|(role, _)| *role == self)
            .map(|(_, name)| *name)
            .unwrap_or("UNRESTRICTED")
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ROLE_TABLE
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(role, _)| *role)
    }

    pub fn from_bits(bits: i32) -> Option<Self> {
        ROLE_TABLE
            .iter()
            .find(|(role, _)| role.bits() == bits)
            .map(|(role, _)| *role)
    }

    /// True when `mask` satisfies this role. `Unrestricted` always passes.
    pub fn allowed_by(self, mask: i32) -> bool {
        self == SiteRole::Unrestricted || mask & self.bits() != 0
    }
}

impl fmt::Display for SiteRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fold provider role names into a bitmask; unknown names are ignored.
pub fn role_bits<S: AsRef<str>>(names: &[S]) -> i32 {
    names
        .iter()
        .filter_map(|n| SiteRole::from_name(n.as_ref()))
        .fold(0, |mask, role| mask | role.bits())
}
