//! # sync-core
//!
//! Pure logic for conversation sync (no I/O, instant tests).
//!
//! This crate implements the decisions behind multi-device sync without any
//! database or network access:
//! - [`reminder::derive`] turns delivered messages into reminder drafts
//! - [`reaction::toggle`] decides what a reaction toggle does to a row
//! - [`offsets`] filters history by consumed offsets and codes `last_msg_seqs`
//! - [`staging::StagedBatch`] accumulates what a device was sent but has not acked
//! - [`state::DeviceSyncState`] is the per-device sync state machine
//!
//! The server crate performs the I/O these modules describe.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod offsets;
pub mod reaction;
pub mod reminder;
pub mod staging;
pub mod state;

pub use offsets::{decode_last_msg_seqs, encode_last_msg_seqs, OffsetWindow};
pub use reaction::{toggle, ExistingReaction, ReactionChange};
pub use reminder::{derive, ReminderDraft, GROUP_MEMBER_INVITE};
pub use staging::StagedBatch;
pub use state::{Action, DeviceSyncState, SyncEvent};
