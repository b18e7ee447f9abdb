//! Channel addressing: fake channel ids for person chats and uid sharding.

use crate::error::SyncError;
use crate::ids::{ChannelKey, ChannelType};
use sha2::{Digest, Sha256};

const FAKE_CHANNEL_SEPARATOR: char = '@';

/// Stable 32-bit hash of an identifier.
///
/// First four bytes (big-endian) of SHA-256. Used for shard selection and for
/// ordering the participants of a fake channel id, so it must never change.
pub fn stable_hash(value: &str) -> u32 {
    let digest = Sha256::digest(value.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Deterministic channel id for a person-to-person chat between `a` and `b`.
///
/// Both participants derive the same id regardless of which one is "self".
pub fn fake_channel_id(a: &str, b: &str) -> String {
    let (ha, hb) = (stable_hash(a), stable_hash(b));
    if ha > hb || (ha == hb && a >= b) {
        format!("{a}{FAKE_CHANNEL_SEPARATOR}{b}")
    } else {
        format!("{b}{FAKE_CHANNEL_SEPARATOR}{a}")
    }
}

/// Reject uids that would be ambiguous inside a fake channel id.
///
/// A uid containing the separator would be split in the wrong place by
/// [`peer_of`] and would turn a peer-addressed person channel into what looks
/// like a fake id, so per-side data would never meet under the shared key.
pub fn validate_uid(uid: &str) -> Result<(), SyncError> {
    if uid.trim().is_empty() {
        return Err(SyncError::MissingField("uid"));
    }
    if uid.contains(FAKE_CHANNEL_SEPARATOR) {
        return Err(SyncError::InvalidUid(uid.to_string()));
    }
    Ok(())
}

/// Whether `channel_id` is a fake (two-party) channel id.
pub fn is_fake_channel(channel_id: &str) -> bool {
    channel_id.contains(FAKE_CHANNEL_SEPARATOR)
}

/// The other participant of a fake channel as seen by `uid`.
///
/// Returns `None` when `uid` is not one of the two participants.
pub fn peer_of<'a>(fake_id: &'a str, uid: &str) -> Option<&'a str> {
    let (left, right) = fake_id.split_once(FAKE_CHANNEL_SEPARATOR)?;
    if left == uid {
        Some(right)
    } else if right == uid {
        Some(left)
    } else {
        None
    }
}

impl ChannelKey {
    /// Key under which channel-global data (extras, reactions) is stored.
    ///
    /// A person channel addressed by the peer's uid becomes the fake channel
    /// id shared by both participants; every other channel is unchanged.
    pub fn storage_key(&self, uid: &str) -> ChannelKey {
        if self.channel_type == ChannelType::Person && !is_fake_channel(&self.channel_id) {
            ChannelKey::person(fake_channel_id(uid, &self.channel_id))
        } else {
            self.clone()
        }
    }

    /// Inverse of [`ChannelKey::storage_key`]: the key `uid` uses for this channel.
    pub fn client_key(&self, uid: &str) -> ChannelKey {
        if self.channel_type == ChannelType::Person {
            if let Some(peer) = peer_of(&self.channel_id, uid) {
                return ChannelKey::person(peer);
            }
        }
        self.clone()
    }
}

/// Index of one hash partition of a sharded table.
///
/// Partition `0` uses the bare table name, partition `n` appends `n`
/// (`channel_offset`, `channel_offset1`, ...). Always derive it with
/// [`ShardIndex::of`] so reads and writes agree on the partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardIndex(u32);

impl ShardIndex {
    /// Partition that owns `uid` when the table is split `shard_count` ways.
    pub fn of(uid: &str, shard_count: u32) -> Self {
        Self(stable_hash(uid) % shard_count.max(1))
    }

    /// Numeric partition index.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Physical table name of `base` in this partition.
    pub fn table(self, base: &str) -> String {
        if self.0 == 0 {
            base.to_string()
        } else {
            format!("{base}{}", self.0)
        }
    }

    /// Every partition index for `shard_count` partitions.
    pub fn all(shard_count: u32) -> impl Iterator<Item = ShardIndex> {
        (0..shard_count.max(1)).map(ShardIndex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_channel_is_perspective_independent() {
        assert_eq!(fake_channel_id("alice", "bob"), fake_channel_id("bob", "alice"));
    }

    #[test]
    fn fake_channel_contains_both_participants() {
        let id = fake_channel_id("alice", "bob");
        assert!(is_fake_channel(&id));
        assert_eq!(peer_of(&id, "alice"), Some("bob"));
        assert_eq!(peer_of(&id, "bob"), Some("alice"));
        assert_eq!(peer_of(&id, "carol"), None);
    }

    #[test]
    fn uids_with_the_separator_are_rejected() {
        assert!(validate_uid("alice").is_ok());
        assert!(matches!(
            validate_uid("alice@example.com"),
            Err(SyncError::InvalidUid(uid)) if uid == "alice@example.com"
        ));
        assert!(matches!(validate_uid(" "), Err(SyncError::MissingField("uid"))));
    }

    #[test]
    fn plain_ids_are_not_fake() {
        assert!(!is_fake_channel("group-1"));
        assert_eq!(peer_of("group-1", "alice"), None);
    }

    #[test]
    fn storage_key_round_trips_through_client_key() {
        let key = ChannelKey::person("bob");
        let stored = key.storage_key("alice");
        assert!(is_fake_channel(&stored.channel_id));
        assert_eq!(stored, ChannelKey::person("bob").storage_key("alice"));
        assert_eq!(stored, ChannelKey::person("alice").storage_key("bob"));
        assert_eq!(stored.client_key("alice"), key);
        assert_eq!(stored.client_key("bob"), ChannelKey::person("alice"));
    }

    #[test]
    fn group_keys_are_untouched() {
        let key = ChannelKey::group("g1");
        assert_eq!(key.storage_key("alice"), key);
        assert_eq!(key.client_key("alice"), key);
    }

    #[test]
    fn shard_index_is_stable_and_bounded() {
        for uid in ["a", "b", "user-123", "日本"] {
            let first = ShardIndex::of(uid, 5);
            assert_eq!(first, ShardIndex::of(uid, 5));
            assert!(first.value() < 5);
        }
    }

    #[test]
    fn shard_table_naming() {
        let names: Vec<String> = ShardIndex::all(3)
            .map(|s| s.table("channel_offset"))
            .collect();
        assert_eq!(
            names,
            vec!["channel_offset", "channel_offset1", "channel_offset2"]
        );
    }

    #[test]
    fn zero_shard_count_is_treated_as_one() {
        assert_eq!(ShardIndex::of("anyone", 0).value(), 0);
        assert_eq!(ShardIndex::all(0).count(), 1);
    }
}
