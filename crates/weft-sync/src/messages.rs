//! Sync protocol message types.
//!
//! Four messages carried as JSON over any ordered, reliable byte stream:
//! `load` asks for a covalue, `content` pushes transactions, `known`
//! acknowledges or corrects state, `done` ends interest.

use serde::{Deserialize, Serialize};

use weft_core::{CoId, KnownState, NewContent};

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SyncMessage {
    /// Request a covalue, declaring what we already have.
    Load(KnownState),

    /// Declare or acknowledge state. `is_correction` marks a reply to
    /// content that assumed more than we actually hold.
    #[serde(rename_all = "camelCase")]
    Known {
        #[serde(flatten)]
        known: KnownState,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_correction: bool,
    },

    /// Push header and/or new transactions.
    Content(NewContent),

    /// No further messages for this covalue.
    Done { id: CoId },
}

impl SyncMessage {
    /// The covalue this message is about.
    pub fn co_id(&self) -> &CoId {
        match self {
            SyncMessage::Load(known) => &known.id,
            SyncMessage::Known { known, .. } => &known.id,
            SyncMessage::Content(content) => &content.id,
            SyncMessage::Done { id } => id,
        }
    }
}

/// Out-of-band stream values that end a peer's incoming loop without an
/// error being thrown across the sync boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerSignal {
    Disconnected,
    PingTimeout,
}

/// What arrives on a peer's incoming stream: either a protocol message
/// or a terminal signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerEvent {
    Signal(PeerSignal),
    Message(SyncMessage),
}

impl From<SyncMessage> for PeerEvent {
    fn from(msg: SyncMessage) -> Self {
        PeerEvent::Message(msg)
    }
}
