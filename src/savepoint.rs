use std::cell::Cell;
use std::rc::Rc;

use crate::error::TidepoolError;
use crate::parser::quote_ident;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointState {
    Active,
    Released,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SavepointId {
    Named(String),
    Numeric(u64),
}

/// Caller-facing rollback point handle. A savepoint is either named or
/// numeric, never both; validity is shared with the session's savepoint
/// tracker, so rolling back past a savepoint or releasing it invalidates
/// every outstanding handle to it. Sessions are single-threaded, hence the
/// `Rc<Cell<_>>` validity link.
#[derive(Debug, Clone)]
pub struct Savepoint {
    pub(crate) seq: u64,
    id: SavepointId,
    state: Rc<Cell<SavepointState>>,
}

impl Savepoint {
    pub(crate) fn new(seq: u64, id: SavepointId, state: Rc<Cell<SavepointState>>) -> Self {
        Savepoint { seq, id, state }
    }

    pub fn state(&self) -> SavepointState {
        self.state.get()
    }

    fn check_active(&self) -> Result<(), TidepoolError> {
        match self.state.get() {
            SavepointState::Active => Ok(()),
            SavepointState::Released => Err(TidepoolError::SavepointInvalid(
                "cannot reference a savepoint after it has been released".to_string(),
            )),
            SavepointState::RolledBack => Err(TidepoolError::SavepointInvalid(
                "cannot reference a savepoint after rolling back past it or ending the transaction"
                    .to_string(),
            )),
        }
    }

    pub fn name(&self) -> Result<&str, TidepoolError> {
        self.check_active()?;
        match &self.id {
            SavepointId::Named(name) => Ok(name),
            SavepointId::Numeric(_) => Err(TidepoolError::WrongSavepointKind(
                "cannot retrieve the name of an unnamed savepoint".to_string(),
            )),
        }
    }

    pub fn numeric_id(&self) -> Result<u64, TidepoolError> {
        self.check_active()?;
        match &self.id {
            SavepointId::Numeric(id) => Ok(*id),
            SavepointId::Named(_) => Err(TidepoolError::WrongSavepointKind(
                "cannot retrieve the id of a named savepoint".to_string(),
            )),
        }
    }

    /// Identifier as it appears in emitted SQL. Named savepoints are quoted
    /// as needed; unnamed ones use a generated identifier.
    pub(crate) fn sql_ident(&self) -> String {
        match &self.id {
            SavepointId::Named(name) => quote_ident(name),
            SavepointId::Numeric(id) => format!("tidepool_sp_{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> Savepoint {
        Savepoint::new(
            1,
            SavepointId::Named(name.to_string()),
            Rc::new(Cell::new(SavepointState::Active)),
        )
    }

    fn numeric(id: u64) -> Savepoint {
        Savepoint::new(
            1,
            SavepointId::Numeric(id),
            Rc::new(Cell::new(SavepointState::Active)),
        )
    }

    #[test]
    fn test_named_savepoint_accessors() {
        let sp = named("sp1");
        assert_eq!(sp.name().unwrap(), "sp1");
        assert!(matches!(
            sp.numeric_id(),
            Err(TidepoolError::WrongSavepointKind(_))
        ));
    }

    #[test]
    fn test_numeric_savepoint_accessors() {
        let sp = numeric(7);
        assert_eq!(sp.numeric_id().unwrap(), 7);
        assert!(matches!(sp.name(), Err(TidepoolError::WrongSavepointKind(_))));
    }

    #[test]
    fn test_invalidated_savepoint_fails_accessors() {
        let state = Rc::new(Cell::new(SavepointState::Active));
        let sp = Savepoint::new(1, SavepointId::Named("sp1".to_string()), state.clone());
        assert!(sp.name().is_ok());

        state.set(SavepointState::Released);
        assert!(matches!(sp.name(), Err(TidepoolError::SavepointInvalid(_))));

        state.set(SavepointState::RolledBack);
        assert!(matches!(sp.name(), Err(TidepoolError::SavepointInvalid(_))));
    }

    #[test]
    fn test_sql_ident() {
        assert_eq!(named("sp1").sql_ident(), "sp1");
        assert_eq!(numeric(3).sql_ident(), "tidepool_sp_3");
        assert_eq!(
            named("name with spaces").sql_ident(),
            "\"name with spaces\""
        );
    }
}
