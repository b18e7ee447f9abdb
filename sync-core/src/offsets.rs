//! Offset filtering and the `last_msg_seqs` wire codec.
//!
//! An offset is the highest message seq already consumed in some scope
//! (channel-wide clear, one device). Anything at or below the applicable
//! offset must never be sent again.

use convsync_types::{ChannelKey, ChannelType, SyncError};

/// Visibility floor for one channel.
///
/// Combines the user's channel offset and the device offset; the larger wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffsetWindow {
    channel_offset: Option<u64>,
    device_offset: Option<u64>,
}

impl OffsetWindow {
    /// Build a window from the offsets that exist for the channel.
    pub fn new(channel_offset: Option<u64>, device_offset: Option<u64>) -> Self {
        Self {
            channel_offset,
            device_offset,
        }
    }

    /// Window that admits everything.
    pub fn open() -> Self {
        Self::default()
    }

    /// Highest consumed seq (0 when nothing is consumed).
    pub fn floor(&self) -> u64 {
        self.channel_offset
            .unwrap_or(0)
            .max(self.device_offset.unwrap_or(0))
    }

    /// Whether a message at `seq` may be sent.
    pub fn admits(&self, seq: u64) -> bool {
        seq > self.floor()
    }

    /// Keep only items whose seq is above the floor, preserving order.
    pub fn retain<T>(&self, items: Vec<T>, seq_of: impl Fn(&T) -> u64) -> Vec<T> {
        let floor = self.floor();
        items.into_iter().filter(|item| seq_of(item) > floor).collect()
    }
}

/// Decode `channel_id:channel_type:seq|...`.
///
/// Channel ids may themselves contain `:`, so each entry is split from the
/// right. Empty input decodes to an empty list.
pub fn decode_last_msg_seqs(encoded: &str) -> Result<Vec<(ChannelKey, u64)>, SyncError> {
    let mut entries = Vec::new();
    for raw in encoded.split('|').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = raw.rsplitn(3, ':');
        let (Some(seq), Some(channel_type), Some(channel_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(SyncError::InvalidLastMsgSeqs(raw.to_string()));
        };
        if channel_id.is_empty() {
            return Err(SyncError::InvalidLastMsgSeqs(raw.to_string()));
        }
        let seq: u64 = seq
            .parse()
            .map_err(|_| SyncError::InvalidLastMsgSeqs(raw.to_string()))?;
        let channel_type: u8 = channel_type
            .parse()
            .map_err(|_| SyncError::InvalidLastMsgSeqs(raw.to_string()))?;
        entries.push((
            ChannelKey::new(channel_id, ChannelType::try_from(channel_type)?),
            seq,
        ));
    }
    Ok(entries)
}

/// Encode entries as `channel_id:channel_type:seq|...`.
pub fn encode_last_msg_seqs<'a>(entries: impl IntoIterator<Item = (&'a ChannelKey, u64)>) -> String {
    entries
        .into_iter()
        .map(|(channel, seq)| {
            format!(
                "{}:{}:{}",
                channel.channel_id,
                channel.channel_type.as_u8(),
                seq
            )
        })
        .collect::<Vec<_>>()
        .join("|")
}
