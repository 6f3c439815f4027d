//! Delete propagation from the primary version relation to the mirror.
//!
//! The database runs this as a trigger procedure after each deleted version
//! row. [`decide`] is the same decision expressed as a pure function; the
//! Postgres adapter generates its trigger body from the same [`HistoryMode`]
//! split, and backends without triggers call [`decide`] from their delete
//! path.

use crate::types::HistoryMode;

/// Presence of an object's row in the durable mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorPresence {
    Absent,
    Present,
}

/// What the trigger does to the mirror row of the deleted version's object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAction {
    RemoveMirrorRow,
    KeepMirrorRow,
}

/// A physically deleted primary version row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedVersion {
    pub object_id: i64,
    pub version_id: i64,
}

/// Decide the mirror effect of deleting `deleted`.
///
/// `current_version` is the object's current-version pointer as seen after
/// the delete; it is ignored in history-free mode.
pub fn decide(
    mode: HistoryMode,
    deleted: DeletedVersion,
    current_version: Option<i64>,
) -> DeleteAction {
    match mode {
        HistoryMode::HistoryFree => DeleteAction::RemoveMirrorRow,
        HistoryMode::HistoryPreserving => match current_version {
            None => DeleteAction::RemoveMirrorRow,
            Some(tid) if tid == deleted.version_id => DeleteAction::RemoveMirrorRow,
            Some(_) => DeleteAction::KeepMirrorRow,
        },
    }
}

/// Apply a delete action to a presence state.
///
/// The trigger only ever moves `Present` to `Absent`; rows appear through the
/// merge protocol alone.
pub fn transition(presence: MirrorPresence, action: DeleteAction) -> MirrorPresence {
    match action {
        DeleteAction::RemoveMirrorRow => MirrorPresence::Absent,
        DeleteAction::KeepMirrorRow => presence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(version_id: i64) -> DeletedVersion {
        DeletedVersion {
            object_id: 42,
            version_id,
        }
    }

    #[test]
    fn history_free_always_removes() {
        assert_eq!(
            decide(HistoryMode::HistoryFree, v(1), None),
            DeleteAction::RemoveMirrorRow
        );
        // A stale pointer is irrelevant without history.
        assert_eq!(
            decide(HistoryMode::HistoryFree, v(1), Some(2)),
            DeleteAction::RemoveMirrorRow
        );
    }

    #[test]
    fn history_preserving_without_pointer_removes() {
        assert_eq!(
            decide(HistoryMode::HistoryPreserving, v(1), None),
            DeleteAction::RemoveMirrorRow
        );
    }

    #[test]
    fn history_preserving_current_version_removes() {
        assert_eq!(
            decide(HistoryMode::HistoryPreserving, v(2), Some(2)),
            DeleteAction::RemoveMirrorRow
        );
    }

    #[test]
    fn history_preserving_old_version_keeps() {
        assert_eq!(
            decide(HistoryMode::HistoryPreserving, v(1), Some(2)),
            DeleteAction::KeepMirrorRow
        );
    }

    #[test]
    fn trigger_never_creates_rows() {
        for action in [DeleteAction::RemoveMirrorRow, DeleteAction::KeepMirrorRow] {
            assert_eq!(
                transition(MirrorPresence::Absent, action),
                MirrorPresence::Absent
            );
        }
        assert_eq!(
            transition(MirrorPresence::Present, DeleteAction::KeepMirrorRow),
            MirrorPresence::Present
        );
        assert_eq!(
            transition(MirrorPresence::Present, DeleteAction::RemoveMirrorRow),
            MirrorPresence::Absent
        );
    }
}
