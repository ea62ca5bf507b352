//! Ruleset validation for group-owned covalues.

use weft_core::{CoValueHeader, Ruleset, TxValidator, ValidTransaction};

use crate::group::{GroupResolver, GroupView};

/// Validator for covalues with an `ownedByGroup` ruleset.
///
/// A transaction folds into content only if its author held a writing
/// role in the owning group at the time it was made; revoking a member
/// invalidates their future writes without erasing their past ones.
pub struct OwnedByGroupValidator<'a> {
    pub group: &'a GroupView,
    pub groups: &'a dyn GroupResolver,
}

impl TxValidator for OwnedByGroupValidator<'_> {
    fn allows(&self, header: &CoValueHeader, tx: &ValidTransaction) -> bool {
        match &header.ruleset {
            Ruleset::UnsafeAllowAll => true,
            // A group's own log is gated during the group fold.
            Ruleset::Group => true,
            Ruleset::OwnedByGroup { .. } => self
                .group
                .role_of_at(&tx.author, tx.made_at, self.groups)
                .is_some_and(|role| role.can_write()),
        }
    }
}
