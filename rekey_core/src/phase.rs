//! The orchestrator's position in the migration protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phases of a migration run.
///
/// ```text
/// Planned -> ShadowColumnsAdded -> Backfilling -> Verified
///         -> SwappedIn -> IndexesRebuilt -> Complete
/// ```
///
/// `Aborted` is reachable from every non-terminal phase. Aborting before
/// `SwappedIn` leaves the old columns untouched; aborting at or after it
/// requires an operator, the renamed columns are never rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// Plan accepted, nothing touched yet.
    Planned,
    /// Shadow columns exist on every table.
    ShadowColumnsAdded,
    /// Pre-existing rows have been backfilled.
    Backfilling,
    /// Catch-up done and all consistency checks passed.
    Verified,
    /// Old columns dropped and shadows renamed into place.
    SwappedIn,
    /// Keys, uniqueness and foreign keys restored on the new columns.
    IndexesRebuilt,
    /// Final checks passed.
    Complete,
    /// The run stopped early.
    Aborted,
}

impl MigrationPhase {
    /// The phase that follows this one on the happy path.
    pub fn next(self) -> Option<MigrationPhase> {
        use MigrationPhase::*;
        match self {
            Planned => Some(ShadowColumnsAdded),
            ShadowColumnsAdded => Some(Backfilling),
            Backfilling => Some(Verified),
            Verified => Some(SwappedIn),
            SwappedIn => Some(IndexesRebuilt),
            IndexesRebuilt => Some(Complete),
            Complete | Aborted => None,
        }
    }

    /// Whether `to` is a legal transition from this phase.
    pub fn can_transition_to(self, to: MigrationPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == MigrationPhase::Aborted || self.next() == Some(to)
    }

    /// `Complete` and `Aborted` end a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationPhase::Complete | MigrationPhase::Aborted)
    }

    /// Whether the old columns are gone once this phase has been reached.
    pub fn is_past_point_of_no_return(self) -> bool {
        matches!(
            self,
            MigrationPhase::SwappedIn | MigrationPhase::IndexesRebuilt | MigrationPhase::Complete
        )
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationPhase::Planned => "planned",
            MigrationPhase::ShadowColumnsAdded => "shadow_columns_added",
            MigrationPhase::Backfilling => "backfilling",
            MigrationPhase::Verified => "verified",
            MigrationPhase::SwappedIn => "swapped_in",
            MigrationPhase::IndexesRebuilt => "indexes_rebuilt",
            MigrationPhase::Complete => "complete",
            MigrationPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_every_phase_in_order() {
        let mut phase = MigrationPhase::Planned;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(phase.can_transition_to(next));
            phase = next;
            seen.push(phase);
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(phase, MigrationPhase::Complete);
    }

    #[test]
    fn phases_cannot_be_skipped() {
        assert!(!MigrationPhase::ShadowColumnsAdded.can_transition_to(MigrationPhase::SwappedIn));
        assert!(!MigrationPhase::Planned.can_transition_to(MigrationPhase::Verified));
    }

    #[test]
    fn abort_is_reachable_until_terminal() {
        assert!(MigrationPhase::Planned.can_transition_to(MigrationPhase::Aborted));
        assert!(MigrationPhase::SwappedIn.can_transition_to(MigrationPhase::Aborted));
        assert!(!MigrationPhase::Complete.can_transition_to(MigrationPhase::Aborted));
        assert!(!MigrationPhase::Aborted.can_transition_to(MigrationPhase::Aborted));
    }

    #[test]
    fn point_of_no_return_starts_at_swap() {
        assert!(!MigrationPhase::Verified.is_past_point_of_no_return());
        assert!(MigrationPhase::SwappedIn.is_past_point_of_no_return());
    }
}
