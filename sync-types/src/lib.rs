//! # sync-types
//!
//! Wire format types for the multi-device conversation sync service.
//!
//! This crate provides the vocabulary shared by every other crate:
//! - [`Version`], [`ChannelType`], [`ChannelKey`], [`ReminderType`] - identity and ordering
//! - [`fake_channel_id`], [`ShardIndex`] - channel addressing and uid partitioning
//! - [`engine`] - payloads exchanged with the external IM engine
//! - [`api`] - HTTP request and response bodies
//! - [`SyncError`] - validation errors

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
mod channel;
pub mod engine;
mod error;
mod ids;

pub use channel::{
    fake_channel_id, is_fake_channel, peer_of, stable_hash, validate_uid, ShardIndex,
};
pub use engine::{EngineMessage, PullMode};
pub use error::SyncError;
pub use ids::{ChannelKey, ChannelType, ReminderType, Version};
