use std::cell::Cell;
use std::rc::Rc;

use crate::error::TidepoolError;
use crate::savepoint::{Savepoint, SavepointId, SavepointState};

struct TrackedSavepoint {
    seq: u64,
    state: Rc<Cell<SavepointState>>,
}

/// Tracks the caller's live savepoints in creation order and owns the
/// validity cells their handles share. Validation happens before the
/// control statement goes to the server; handle invalidation happens after
/// it succeeds, so a failed round trip leaves the stack untouched.
pub struct SavepointHandler {
    stack: Vec<TrackedSavepoint>,
    next_seq: u64,
    next_numeric: u64,
}

impl SavepointHandler {
    pub fn new() -> Self {
        SavepointHandler {
            stack: Vec::new(),
            next_seq: 0,
            next_numeric: 0,
        }
    }

    fn track(&mut self, id: SavepointId) -> Savepoint {
        self.next_seq += 1;
        let state = Rc::new(Cell::new(SavepointState::Active));
        self.stack.push(TrackedSavepoint {
            seq: self.next_seq,
            state: state.clone(),
        });
        Savepoint::new(self.next_seq, id, state)
    }

    pub fn track_named(&mut self, name: &str) -> Savepoint {
        self.track(SavepointId::Named(name.to_string()))
    }

    pub fn track_numeric(&mut self) -> Savepoint {
        self.next_numeric += 1;
        self.track(SavepointId::Numeric(self.next_numeric))
    }

    /// Undoes a `track_*` whose SAVEPOINT round trip failed.
    pub fn untrack(&mut self, savepoint: &Savepoint) {
        if let Some(position) = self.stack.iter().position(|t| t.seq == savepoint.seq) {
            let tracked = self.stack.remove(position);
            tracked.state.set(SavepointState::RolledBack);
        }
    }

    fn position_of(&self, savepoint: &Savepoint) -> Result<usize, TidepoolError> {
        if savepoint.state() != SavepointState::Active {
            return Err(TidepoolError::SavepointInvalid(
                "savepoint was invalidated by an earlier rollback, release or transaction end"
                    .to_string(),
            ));
        }
        self.stack
            .iter()
            .position(|tracked| tracked.seq == savepoint.seq)
            .ok_or_else(|| {
                TidepoolError::SavepointInvalid(
                    "savepoint belongs to an ended transaction".to_string(),
                )
            })
    }

    pub fn validate(&self, savepoint: &Savepoint) -> Result<(), TidepoolError> {
        self.position_of(savepoint).map(|_| ())
    }

    /// Rollback succeeded on the server: invalidate everything established
    /// after the target. The target stays active, so repeated rollbacks to
    /// the same savepoint are legal.
    pub fn complete_rollback(&mut self, savepoint: &Savepoint) {
        if let Some(position) = self.stack.iter().position(|t| t.seq == savepoint.seq) {
            for tracked in self.stack.drain(position + 1..) {
                tracked.state.set(SavepointState::RolledBack);
            }
        }
    }

    /// Release succeeded on the server: invalidate the target and everything
    /// established after it.
    pub fn complete_release(&mut self, savepoint: &Savepoint) {
        if let Some(position) = self.stack.iter().position(|t| t.seq == savepoint.seq) {
            for tracked in self.stack.drain(position..) {
                tracked.state.set(SavepointState::Released);
            }
        }
    }

    /// Transaction end invalidates every outstanding handle.
    pub fn invalidate_all(&mut self, state: SavepointState) {
        for tracked in self.stack.drain(..) {
            tracked.state.set(state);
        }
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

impl Default for SavepointHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_assigns_increasing_numeric_ids() {
        let mut handler = SavepointHandler::new();
        let sp1 = handler.track_numeric();
        let sp2 = handler.track_numeric();
        assert_eq!(sp1.numeric_id().unwrap(), 1);
        assert_eq!(sp2.numeric_id().unwrap(), 2);
        assert_eq!(handler.len(), 2);
    }

    #[test]
    fn test_rollback_invalidates_later_savepoints() {
        let mut handler = SavepointHandler::new();
        let sp1 = handler.track_numeric();
        let sp2 = handler.track_named("sp2");
        let sp3 = handler.track_named("sp3");

        handler.validate(&sp1).unwrap();
        handler.complete_rollback(&sp1);
        assert_eq!(sp1.state(), SavepointState::Active);
        assert_eq!(sp2.state(), SavepointState::RolledBack);
        assert_eq!(sp3.state(), SavepointState::RolledBack);
        assert_eq!(handler.len(), 1);

        assert!(matches!(
            handler.validate(&sp2),
            Err(TidepoolError::SavepointInvalid(_))
        ));
    }

    #[test]
    fn test_repeated_rollback_to_same_savepoint() {
        let mut handler = SavepointHandler::new();
        let sp = handler.track_named("sp");
        for _ in 0..3 {
            handler.validate(&sp).unwrap();
            handler.complete_rollback(&sp);
        }
        assert_eq!(sp.state(), SavepointState::Active);
    }

    #[test]
    fn test_release_invalidates_target_and_later() {
        let mut handler = SavepointHandler::new();
        let sp1 = handler.track_named("sp1");
        let sp2 = handler.track_named("sp2");

        handler.validate(&sp1).unwrap();
        handler.complete_release(&sp1);
        assert_eq!(sp1.state(), SavepointState::Released);
        assert_eq!(sp2.state(), SavepointState::Released);
        assert!(handler.is_empty());

        assert!(matches!(
            handler.validate(&sp1),
            Err(TidepoolError::SavepointInvalid(_))
        ));
    }

    #[test]
    fn test_untrack_failed_creation() {
        let mut handler = SavepointHandler::new();
        let sp = handler.track_named("sp");
        handler.untrack(&sp);
        assert!(handler.is_empty());
        assert!(matches!(
            handler.validate(&sp),
            Err(TidepoolError::SavepointInvalid(_))
        ));
    }

    #[test]
    fn test_invalidate_all_on_transaction_end() {
        let mut handler = SavepointHandler::new();
        let sp = handler.track_named("sp");
        handler.invalidate_all(SavepointState::RolledBack);
        assert_eq!(sp.state(), SavepointState::RolledBack);
        assert!(handler.is_empty());
    }
}
