//! Identity and ordering types for conversation sync.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A monotonically increasing version issued by the version sequencer.
///
/// Versions order mutations within one scope (a channel's message extras, a
/// user's reminders, ...). They are used purely as incremental-pull
/// watermarks and are never compared against wall-clock time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Create a new Version with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this Version.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Create a Version representing "nothing seen yet" (cold start).
    pub fn zero() -> Self {
        Self(0)
    }

    /// Whether this is the cold-start baseline.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Database representation (SQLite integers are signed).
    pub fn as_i64(&self) -> i64 {
        self.0.min(i64::MAX as u64) as i64
    }

    /// Build a Version from a database integer, clamping negatives to zero.
    pub fn from_i64(value: i64) -> Self {
        Self(value.max(0) as u64)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

/// Channel kind, numbered the way the IM engine numbers it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChannelType {
    /// Unspecified.
    None,
    /// One-to-one chat.
    Person,
    /// Group chat.
    Group,
    /// Customer service session.
    CustomerService,
    /// Community.
    Community,
    /// Topic inside a community.
    CommunityTopic,
    /// Information/notification channel.
    Info,
}

impl ChannelType {
    /// Numeric wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Person => 1,
            Self::Group => 2,
            Self::CustomerService => 3,
            Self::Community => 4,
            Self::CommunityTopic => 5,
            Self::Info => 6,
        }
    }

    /// Whether history filtering by offsets applies to this kind of channel.
    pub fn is_offset_filtered(self) -> bool {
        matches!(self, Self::Person | Self::Group)
    }
}

impl TryFrom<u8> for ChannelType {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Person),
            2 => Ok(Self::Group),
            3 => Ok(Self::CustomerService),
            4 => Ok(Self::Community),
            5 => Ok(Self::CommunityTopic),
            6 => Ok(Self::Info),
            other => Err(SyncError::InvalidChannelType(other)),
        }
    }
}

impl From<ChannelType> for u8 {
    fn from(value: ChannelType) -> Self {
        value.as_u8()
    }
}

/// Address of a channel: id plus kind.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Channel identifier (peer uid or fake channel id for person chats).
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
}

impl ChannelKey {
    /// Create a channel key.
    pub fn new(channel_id: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_type,
        }
    }

    /// Shorthand for a person channel.
    pub fn person(channel_id: impl Into<String>) -> Self {
        Self::new(channel_id, ChannelType::Person)
    }

    /// Shorthand for a group channel.
    pub fn group(channel_id: impl Into<String>) -> Self {
        Self::new(channel_id, ChannelType::Group)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.channel_type.as_u8())
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelKey({self})")
    }
}

/// Kind of reminder shown to a user.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ReminderType {
    /// Someone mentioned the user (or everyone).
    MentionMe,
    /// Someone asked to join a group the user moderates.
    ApplyJoinGroup,
}

impl ReminderType {
    /// Numeric wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::MentionMe => 1,
            Self::ApplyJoinGroup => 2,
        }
    }

    /// Default display text.
    pub fn text(self) -> &'static str {
        match self {
            Self::MentionMe => "[mentioned you]",
            Self::ApplyJoinGroup => "[join request]",
        }
    }
}

impl TryFrom<u8> for ReminderType {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::MentionMe),
            2 => Ok(Self::ApplyJoinGroup),
            other => Err(SyncError::InvalidReminderType(other)),
        }
    }
}

impl From<ReminderType> for u8 {
    fn from(value: ReminderType) -> Self {
        value.as_u8()
    }
}
