//! Per-device sync state machine.
//!
//! Each (uid, device) pair moves through
//! `ColdStart → AwaitingAck → Streaming → AwaitingAck → ...`, or falls to
//! `Stale` when an ack never arrives. The machine is pure: it returns the
//! actions the coordinator must perform, and the coordinator reports back
//! what happened.

use convsync_types::Version;

/// Sync lifecycle of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSyncState {
    /// Never synced since this process started.
    #[default]
    ColdStart,
    /// Last batch was acknowledged; nothing is staged.
    Streaming {
        /// Highest conversation version the device acked.
        acked: Version,
    },
    /// A batch was returned and is staged waiting for an ack.
    AwaitingAck {
        /// Highest conversation version staged.
        staged: Version,
    },
    /// The ack timed out and staged data was dropped.
    Stale,
}

/// Something that happened to a device's sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A sync request arrived (before the baseline is resolved).
    SyncRequested,
    /// A sync response was built and its marks staged.
    SyncServed {
        /// Highest conversation version in the response.
        version: Version,
    },
    /// The device acknowledged the batch (before persistence).
    AckRequested,
    /// The staged batch was committed.
    AckPersisted {
        /// Version that was committed.
        version: Version,
    },
    /// Persisting the staged batch failed and was rolled back.
    AckFailed,
    /// No ack arrived within the configured timeout.
    AckTimedOut,
}

/// Work the coordinator performs for a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Drop cached watermarks so the baseline is re-derived from persisted state.
    InvalidateWatermark,
    /// Merge the response's marks into the staged batch.
    StageBatch,
    /// Persist the staged batch transactionally.
    PersistStaged,
    /// Remove the staged batch.
    ClearStaging,
    /// Raise the device's cached max-version watermark.
    AdvanceWatermark(Version),
}

impl DeviceSyncState {
    /// Create a state machine in the ColdStart state.
    pub fn new() -> Self {
        Self::ColdStart
    }

    /// Whether a batch is staged and waiting.
    pub fn is_awaiting_ack(&self) -> bool {
        matches!(self, Self::AwaitingAck { .. })
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: SyncEvent) -> (Self, Vec<Action>) {
        match (self, event) {
            (Self::Stale, SyncEvent::SyncRequested) => {
                (Self::Stale, vec![Action::InvalidateWatermark])
            }
            (state, SyncEvent::SyncRequested) => (state, vec![]),

            (Self::AwaitingAck { staged }, SyncEvent::SyncServed { version }) => (
                Self::AwaitingAck {
                    staged: staged.max(version),
                },
                vec![Action::StageBatch],
            ),
            (_, SyncEvent::SyncServed { version }) => (
                Self::AwaitingAck { staged: version },
                vec![Action::StageBatch],
            ),

            (Self::AwaitingAck { staged }, SyncEvent::AckRequested) => {
                (Self::AwaitingAck { staged }, vec![Action::PersistStaged])
            }
            // Nothing staged: a repeated ack is a no-op.
            (state, SyncEvent::AckRequested) => (state, vec![]),

            (Self::AwaitingAck { .. }, SyncEvent::AckPersisted { version }) => (
                Self::Streaming { acked: version },
                vec![Action::ClearStaging, Action::AdvanceWatermark(version)],
            ),
            (Self::AwaitingAck { staged }, SyncEvent::AckFailed) => {
                (Self::AwaitingAck { staged }, vec![])
            }
            (Self::AwaitingAck { .. }, SyncEvent::AckTimedOut) => {
                (Self::Stale, vec![Action::ClearStaging])
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }
}
