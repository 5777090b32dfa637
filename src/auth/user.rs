use crate::error::{Result, SchedulerError};

/// Permission bits stored in `users.permissions`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const CAN_ADD: Permissions = Permissions(1);
    pub const CAN_RENDER: Permissions = Permissions(1 << 1);
    pub const ADMIN: Permissions = Permissions(1 << 2);
    /// The UI frontend; trusted to forward end-user cookies.
    pub const FRONTEND: Permissions = Permissions(1 << 3);

    pub const fn from_bits(bits: u32) -> Self {
        Permissions(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Permissions) -> Permissions {
        Permissions(self.0 | other.0)
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        self.union(rhs)
    }
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = [
            (Permissions::CAN_ADD, "add"),
            (Permissions::CAN_RENDER, "render"),
            (Permissions::ADMIN, "admin"),
            (Permissions::FRONTEND, "frontend"),
        ]
        .iter()
        .filter(|(p, _)| self.contains(*p))
        .map(|(_, n)| *n)
        .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    /// Stable OIDC subject. Worker certificates carry it as their CN.
    pub subject: String,
    pub email: String,
    pub permissions: Permissions,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.permissions.contains(Permissions::ADMIN)
    }

    pub fn is_frontend(&self) -> bool {
        self.permissions.contains(Permissions::FRONTEND)
    }

    pub fn require(&self, permission: Permissions) -> Result<()> {
        if self.permissions.contains(permission) {
            Ok(())
        } else {
            Err(SchedulerError::PermissionDenied(format!(
                "user {} lacks {} permission",
                self.id, permission
            )))
        }
    }

    /// Admins see everything; others see what they hold or own.
    pub fn can_see(&self, holder_id: i64, owner_id: i64) -> bool {
        self.is_admin() || self.id == holder_id || self.id == owner_id
    }
}
