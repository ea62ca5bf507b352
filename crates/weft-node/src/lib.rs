//! # weft-node
//!
//! The per-account runtime: a [`LocalNode`] owns the in-memory covalue
//! store, the controlled account's keys, and the peer connections
//! (network and storage), exposing create/load/subscribe/edit
//! operations over them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use weft_node::LocalNode;
//! use weft_core::CoValueKind;
//! use weft_perms::Role;
//!
//! # async fn example() -> weft_node::Result<()> {
//! let (node, _credentials) = LocalNode::with_new_account("alice").await?;
//!
//! let team = node.create_group().await?;
//! let doc = node.create_covalue(CoValueKind::Map, Some(&team)).await?;
//! node.edit(&doc, vec![weft_core::MapOp::set("title", "notes".into())])
//!     .await?;
//!
//! let invite = node.create_invite(&team, Role::Writer).await?;
//! let link = weft_node::format_invite_link("https://example.app", None, &team, &invite);
//! # let _ = link;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod link;
pub mod node;
pub mod store;

pub use error::{NodeError, Result};
pub use link::{format_invite_link, parse_invite_link, InviteLink};
pub use node::{AccountCredentials, LocalNode, DEFAULT_LOAD_TIMEOUT};
pub use store::{agent_from_header, CoValueEntry, NodeStore};
