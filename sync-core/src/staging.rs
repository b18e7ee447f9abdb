//! Staged (sent but unacknowledged) sync batches.
//!
//! After a sync response is built, the highest message seq returned per
//! channel and the highest conversation version are staged. Nothing is
//! durable until the device acks; every merge here is a max, so staging the
//! same or an older batch twice never lowers a mark.

use convsync_types::{ChannelKey, Version};
use std::collections::HashMap;

/// Channel high-water marks returned to one device and not yet acked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedBatch {
    channel_seqs: HashMap<ChannelKey, u64>,
    version: Version,
}

impl StagedBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that messages up to `seq` were returned for `channel`.
    pub fn record_channel(&mut self, channel: ChannelKey, seq: u64) {
        let entry = self.channel_seqs.entry(channel).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Record a conversation version returned to the device.
    pub fn record_version(&mut self, version: Version) {
        if version > self.version {
            self.version = version;
        }
    }

    /// Fold another batch into this one.
    pub fn merge(&mut self, other: StagedBatch) {
        for (channel, seq) in other.channel_seqs {
            self.record_channel(channel, seq);
        }
        self.record_version(other.version);
    }

    /// Highest conversation version staged.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Staged seq for a channel.
    pub fn channel_seq(&self, channel: &ChannelKey) -> Option<u64> {
        self.channel_seqs.get(channel).copied()
    }

    /// Number of channels staged.
    pub fn len(&self) -> usize {
        self.channel_seqs.len()
    }

    /// Whether the batch carries nothing to persist.
    pub fn is_empty(&self) -> bool {
        self.channel_seqs.is_empty() && self.version.is_zero()
    }

    /// Staged offsets sorted by channel, ready to persist.
    pub fn offsets(&self) -> Vec<(ChannelKey, u64)> {
        let mut offsets: Vec<(ChannelKey, u64)> = self
            .channel_seqs
            .iter()
            .map(|(channel, seq)| (channel.clone(), *seq))
            .collect();
        offsets.sort_by(|a, b| {
            (a.0.channel_id.as_str(), a.0.channel_type.as_u8())
                .cmp(&(b.0.channel_id.as_str(), b.0.channel_type.as_u8()))
        });
        offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_batch_is_empty() {
        let batch = StagedBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.version(), Version::zero());
    }

    #[test]
    fn record_channel_keeps_max() {
        let mut batch = StagedBatch::new();
        batch.record_channel(ChannelKey::group("g1"), 10);
        batch.record_channel(ChannelKey::group("g1"), 7);
        assert_eq!(batch.channel_seq(&ChannelKey::group("g1")), Some(10));

        batch.record_channel(ChannelKey::group("g1"), 12);
        assert_eq!(batch.channel_seq(&ChannelKey::group("g1")), Some(12));
    }

    #[test]
    fn version_only_batch_is_not_empty() {
        let mut batch = StagedBatch::new();
        batch.record_version(Version::new(3));
        assert!(!batch.is_empty());
    }

    #[test]
    fn merge_is_order_independent() {
        let mut a = StagedBatch::new();
        a.record_channel(ChannelKey::group("g1"), 5);
        a.record_channel(ChannelKey::person("u2"), 9);
        a.record_version(Version::new(100));

        let mut b = StagedBatch::new();
        b.record_channel(ChannelKey::group("g1"), 8);
        b.record_version(Version::new(90));

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);

        assert_eq!(ab, ba);
        assert_eq!(ab.channel_seq(&ChannelKey::group("g1")), Some(8));
        assert_eq!(ab.version(), Version::new(100));
    }

    #[test]
    fn offsets_are_sorted() {
        let mut batch = StagedBatch::new();
        batch.record_channel(ChannelKey::person("zed"), 1);
        batch.record_channel(ChannelKey::group("alpha"), 2);
        let offsets = batch.offsets();
        assert_eq!(offsets[0].0, ChannelKey::group("alpha"));
        assert_eq!(offsets[1].0, ChannelKey::person("zed"));
    }
}
