//! Error types for conversation sync wire data.

use thiserror::Error;

/// Errors raised while decoding or validating wire data.
///
/// All of these are caller mistakes: they are reported before any side effect
/// and never retried server-side.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Unknown channel type discriminator
    #[error("invalid channel type: {0}")]
    InvalidChannelType(u8),

    /// Unknown reminder type discriminator
    #[error("invalid reminder type: {0}")]
    InvalidReminderType(u8),

    /// Unknown pull mode discriminator
    #[error("invalid pull mode: {0}")]
    InvalidPullMode(u8),

    /// A required field was missing or blank
    #[error("{0} must not be empty")]
    MissingField(&'static str),

    /// A uid that cannot be addressed (contains the fake channel separator)
    #[error("invalid uid: {0}")]
    InvalidUid(String),

    /// Malformed `last_msg_seqs` entry
    #[error("invalid last_msg_seqs entry: {0}")]
    InvalidLastMsgSeqs(String),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::InvalidChannelType(99);
        assert_eq!(err.to_string(), "invalid channel type: 99");
        assert_eq!(
            SyncError::MissingField("channel_id").to_string(),
            "channel_id must not be empty"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}
