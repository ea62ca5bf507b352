//! # weft-perms
//!
//! The group permission layer: roles, encrypted read keys and invites,
//! all encoded as ordinary covalue content.
//!
//! ## Overview
//!
//! A group is a map-shaped covalue with reserved keys for member roles,
//! the current read key, sealed key revelations and re-encryption edges.
//! Replaying a group's own transaction log yields a [`GroupView`];
//! [`GroupMutator`] appends the transactions that change it.
//!
//! ## Key model
//!
//! Content is encrypted under a symmetric read key. Each member gets the
//! key sealed to their X25519 key. On every membership removal the key is
//! rotated: the new key is sealed to the remaining members, and the old
//! key is stored encrypted under the new one, so holders of the newest
//! key keep history readable while revoked members can never step
//! forward to a newer key.

pub mod error;
pub mod group;
pub mod invite;
pub mod role;
pub mod validate;

pub use error::{PermError, Result};
pub use group::{
    GroupKeys, GroupMutator, GroupResolver, GroupView, MemberResolver, NoGroups, Rotation,
    READ_KEY,
};
pub use invite::InviteSecret;
pub use role::Role;
pub use validate::OwnedByGroupValidator;
