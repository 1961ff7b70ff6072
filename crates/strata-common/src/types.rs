//! Permission and role scales
//!
//! Wire messages carry these as plain integers; the typed forms keep the
//! ordering comparisons honest.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-bucket permission level, ordered: None < Read < Write < Owner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    /// Any valid token passes; no bucket grant required.
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
    Owner = 3,
}

impl Permission {
    /// Wire representation
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for Permission {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            3 => Ok(Self::Owner),
            other => Err(Error::invalid_argument(format!(
                "permission out of range: {other}"
            ))),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Owner => write!(f, "owner"),
        }
    }
}

/// Account role. Superusers bypass bucket grants and may register users.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Super = 0,
    Ordinary = 1,
}

impl TryFrom<i64> for Role {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::Super),
            1 => Ok(Self::Ordinary),
            other => Err(Error::invalid_argument(format!("role out of range: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_ordering() {
        assert!(Permission::None < Permission::Read);
        assert!(Permission::Read < Permission::Write);
        assert!(Permission::Write < Permission::Owner);
    }

    #[test]
    fn test_permission_round_trip() {
        for level in [
            Permission::None,
            Permission::Read,
            Permission::Write,
            Permission::Owner,
        ] {
            assert_eq!(Permission::try_from(level.as_i64()).unwrap(), level);
        }
        assert!(Permission::try_from(4).is_err());
        assert!(Permission::try_from(-1).is_err());
    }

    #[test]
    fn test_role_from_wire() {
        assert_eq!(Role::try_from(0).unwrap(), Role::Super);
        assert_eq!(Role::try_from(1).unwrap(), Role::Ordinary);
        assert!(Role::try_from(7).is_err());
    }
}
