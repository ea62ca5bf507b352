//! Member roles and the inheritance lattice.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A member's role within one group.
///
/// Invite roles are held by throwaway agents minted for invite links;
/// they convert to their concrete counterpart when accepted and are never
/// inherited across group extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "admin")]
    Admin,
    #[serde(rename = "writer")]
    Writer,
    #[serde(rename = "reader")]
    Reader,
    #[serde(rename = "writeOnly")]
    WriteOnly,
    #[serde(rename = "adminInvite")]
    AdminInvite,
    #[serde(rename = "writerInvite")]
    WriterInvite,
    #[serde(rename = "readerInvite")]
    ReaderInvite,
    #[serde(rename = "writeOnlyInvite")]
    WriteOnlyInvite,
    #[serde(rename = "revoked")]
    Revoked,
}

impl Role {
    /// May this role decrypt group content?
    pub fn can_read(&self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::Reader)
    }

    /// May this role append to group-owned covalues?
    pub fn can_write(&self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::WriteOnly)
    }

    /// May this role administer the group itself?
    pub fn can_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Is this an invite placeholder role?
    pub fn is_invite(&self) -> bool {
        matches!(
            self,
            Role::AdminInvite | Role::WriterInvite | Role::ReaderInvite | Role::WriteOnlyInvite
        )
    }

    /// The concrete role an invite converts to on acceptance.
    pub fn invite_grants(&self) -> Option<Role> {
        match self {
            Role::AdminInvite => Some(Role::Admin),
            Role::WriterInvite => Some(Role::Writer),
            Role::ReaderInvite => Some(Role::Reader),
            Role::WriteOnlyInvite => Some(Role::WriteOnly),
            _ => None,
        }
    }

    /// The invite variant granting this role.
    pub fn invite_variant(&self) -> Option<Role> {
        match self {
            Role::Admin => Some(Role::AdminInvite),
            Role::Writer => Some(Role::WriterInvite),
            Role::Reader => Some(Role::ReaderInvite),
            Role::WriteOnly => Some(Role::WriteOnlyInvite),
            _ => None,
        }
    }

    /// Comparative strength, for refusing downgrades.
    pub fn strength(&self) -> u8 {
        match self {
            Role::Admin => 4,
            Role::Writer => 3,
            Role::Reader => 2,
            Role::WriteOnly => 1,
            _ => 0,
        }
    }

    /// Fold a role inherited from a parent group into the role so far.
    ///
    /// The asymmetry is deliberate: admin always wins, writer upgrades
    /// anything below writer except writeOnly, reader fills only a void,
    /// and invites and writeOnly never cross the extension edge. A direct
    /// revocation in this group blocks inheritance entirely.
    pub fn inherit(current: Option<Role>, from_parent: Option<Role>) -> Option<Role> {
        if current == Some(Role::Revoked) {
            return current;
        }
        let Some(parent) = from_parent else {
            return current;
        };
        if parent.is_invite() || parent == Role::WriteOnly || parent == Role::Revoked {
            return current;
        }

        match parent {
            Role::Admin => {
                if current == Some(Role::Admin) {
                    current
                } else {
                    Some(Role::Admin)
                }
            }
            Role::Writer => match current {
                Some(Role::Admin) | Some(Role::Writer) | Some(Role::WriteOnly) => current,
                _ => Some(Role::Writer),
            },
            Role::Reader => {
                if current.is_none() {
                    Some(Role::Reader)
                } else {
                    current
                }
            }
            _ => current,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Admin => "admin",
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::WriteOnly => "writeOnly",
            Role::AdminInvite => "adminInvite",
            Role::WriterInvite => "writerInvite",
            Role::ReaderInvite => "readerInvite",
            Role::WriteOnlyInvite => "writeOnlyInvite",
            Role::Revoked => "revoked",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "writer" => Ok(Role::Writer),
            "reader" => Ok(Role::Reader),
            "writeOnly" => Ok(Role::WriteOnly),
            "adminInvite" => Ok(Role::AdminInvite),
            "writerInvite" => Ok(Role::WriterInvite),
            "readerInvite" => Ok(Role::ReaderInvite),
            "writeOnlyInvite" => Ok(Role::WriteOnlyInvite),
            "revoked" => Ok(Role::Revoked),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        assert!(Role::Admin.can_read() && Role::Admin.can_write() && Role::Admin.can_admin());
        assert!(Role::Writer.can_read() && Role::Writer.can_write());
        assert!(Role::Reader.can_read() && !Role::Reader.can_write());
        assert!(!Role::WriteOnly.can_read() && Role::WriteOnly.can_write());
        assert!(!Role::Revoked.can_read() && !Role::Revoked.can_write());
    }

    #[test]
    fn test_invite_conversion() {
        assert_eq!(Role::WriterInvite.invite_grants(), Some(Role::Writer));
        assert_eq!(Role::Writer.invite_variant(), Some(Role::WriterInvite));
        assert_eq!(Role::Revoked.invite_grants(), None);
    }

    #[test]
    fn test_inherit_admin_wins() {
        assert_eq!(
            Role::inherit(Some(Role::Reader), Some(Role::Admin)),
            Some(Role::Admin)
        );
        assert_eq!(
            Role::inherit(Some(Role::Admin), Some(Role::Admin)),
            Some(Role::Admin)
        );
    }

    #[test]
    fn test_inherit_writer_upgrades_reader() {
        assert_eq!(
            Role::inherit(Some(Role::Reader), Some(Role::Writer)),
            Some(Role::Writer)
        );
        // ...but never downgrades, and leaves writeOnly alone.
        assert_eq!(
            Role::inherit(Some(Role::Admin), Some(Role::Writer)),
            Some(Role::Admin)
        );
        assert_eq!(
            Role::inherit(Some(Role::WriteOnly), Some(Role::Writer)),
            Some(Role::WriteOnly)
        );
    }

    #[test]
    fn test_inherit_reader_fills_void_only() {
        assert_eq!(Role::inherit(None, Some(Role::Reader)), Some(Role::Reader));
        assert_eq!(
            Role::inherit(Some(Role::WriteOnly), Some(Role::Reader)),
            Some(Role::WriteOnly)
        );
    }

    #[test]
    fn test_invites_and_write_only_never_inherited() {
        assert_eq!(Role::inherit(None, Some(Role::AdminInvite)), None);
        assert_eq!(Role::inherit(None, Some(Role::WriteOnly)), None);
    }

    #[test]
    fn test_revoked_blocks_inheritance() {
        assert_eq!(
            Role::inherit(Some(Role::Revoked), Some(Role::Admin)),
            Some(Role::Revoked)
        );
    }

    #[test]
    fn test_role_string_roundtrip() {
        for role in [
            Role::Admin,
            Role::Writer,
            Role::Reader,
            Role::WriteOnly,
            Role::AdminInvite,
            Role::WriterInvite,
            Role::ReaderInvite,
            Role::WriteOnlyInvite,
            Role::Revoked,
        ] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
    }
}
