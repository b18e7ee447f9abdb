//! Reaction toggle decision.
//!
//! There is at most one row per (message, user). Toggling never deletes the
//! row physically; retraction is a soft-delete flag so incremental sync can
//! carry it to other devices.

/// Current state of a user's reaction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingReaction<'a> {
    /// Emoji on the row.
    pub emoji: &'a str,
    /// Whether the row is retracted.
    pub is_deleted: bool,
}

/// What a toggle does to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionChange {
    /// No row yet: insert a live one.
    Insert,
    /// Row was retracted: make it live with the requested emoji.
    Revive,
    /// Row is live with another emoji: switch emoji, stay live.
    Replace,
    /// Row is live with the same emoji: retract it.
    Retract,
}

impl ReactionChange {
    /// Whether the row ends up retracted.
    pub fn leaves_deleted(self) -> bool {
        matches!(self, Self::Retract)
    }
}

/// Decide how toggling `emoji` changes `existing`.
pub fn toggle(existing: Option<ExistingReaction<'_>>, emoji: &str) -> ReactionChange {
    match existing {
        None => ReactionChange::Insert,
        Some(row) if row.is_deleted => ReactionChange::Revive,
        Some(row) if row.emoji == emoji => ReactionChange::Retract,
        Some(_) => ReactionChange::Replace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(emoji: &str, is_deleted: bool) -> Option<ExistingReaction<'_>> {
        Some(ExistingReaction { emoji, is_deleted })
    }

    #[test]
    fn first_toggle_inserts() {
        assert_eq!(toggle(None, "👍"), ReactionChange::Insert);
    }

    #[test]
    fn same_emoji_retracts() {
        let change = toggle(row("👍", false), "👍");
        assert_eq!(change, ReactionChange::Retract);
        assert!(change.leaves_deleted());
    }

    #[test]
    fn retracted_row_revives_with_any_emoji() {
        assert_eq!(toggle(row("👍", true), "👍"), ReactionChange::Revive);
        assert_eq!(toggle(row("👍", true), "🎉"), ReactionChange::Revive);
    }

    #[test]
    fn different_emoji_replaces() {
        let change = toggle(row("👍", false), "🎉");
        assert_eq!(change, ReactionChange::Replace);
        assert!(!change.leaves_deleted());
    }

    #[test]
    fn repeated_toggles_alternate() {
        // Simulate three toggles of the same emoji on one row.
        let mut state: Option<(String, bool)> = None;
        let mut deleted_flags = Vec::new();
        for _ in 0..3 {
            let existing = state.as_ref().map(|(e, d)| ExistingReaction {
                emoji: e.as_str(),
                is_deleted: *d,
            });
            let change = toggle(existing, "👍");
            state = Some(("👍".to_string(), change.leaves_deleted()));
            deleted_flags.push(change.leaves_deleted());
        }
        assert_eq!(deleted_flags, vec![false, true, false]);
    }
}
