//! # convsync-server
//!
//! Multi-device conversation and message sync service.
//!
//! This crate sits between chat clients and an external IM engine that owns
//! raw message storage and fan-out. It:
//! - Serves conversation deltas per device, filtered by consumed offsets
//! - Advances offsets and version watermarks only when a device acks
//! - Keeps mutable message facts (revoke, edit, pin, reads, deletes)
//! - Keeps reactions, reminders and per-conversation UI state
//!
//! ## Architecture
//!
//! ```text
//! Device ──HTTP──► convsync-server ──HTTP──► IM engine
//!                  │
//!                  ├─ SyncCoordinator (staging per uid/device)
//!                  ├─ MessageActions / ReminderEngine
//!                  └─ SQLite (offsets, extras, reactions, reminders, watermarks)
//! ```
//!
//! ## Sync cycle
//!
//! - `POST /v1/conversation/sync` returns conversations newer than the
//!   device's baseline and stages the returned high-water marks
//! - `POST /v1/conversation/syncack` persists the staged marks in one
//!   transaction
//! - A device that never acks receives the same (or a superset) batch next time

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actions;
pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod http;
pub mod limits;
pub mod reminders;
pub mod server;
pub mod storage;
pub mod watermarks;
