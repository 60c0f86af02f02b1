/// Server-visible transaction status of the session, as reflected by the
/// ReadyForQuery indicator: no transaction, transaction in progress, or
/// failed transaction awaiting rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Open,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TransactionStateHandler {
    state: TransactionState,
}

impl TransactionStateHandler {
    pub fn new() -> Self {
        Self {
            state: TransactionState::Idle,
        }
    }

    pub fn get_state(&self) -> TransactionState {
        self.state
    }

    pub fn in_transaction(&self) -> bool {
        self.state != TransactionState::Idle
    }

    /// First statement of a non-autocommit transaction opened the block.
    pub fn on_begin(&mut self) {
        if self.state == TransactionState::Idle {
            self.state = TransactionState::Open;
        }
    }

    /// A failure poisoned the transaction; only rollback or commit are
    /// accepted until the block ends.
    pub fn on_poison(&mut self) {
        if self.state == TransactionState::Open {
            self.state = TransactionState::Failed;
        }
    }

    /// Rollback to a savepoint cleared the poisoned state without ending the
    /// transaction block.
    pub fn on_recover(&mut self) {
        if self.state == TransactionState::Failed {
            self.state = TransactionState::Open;
        }
    }

    /// Commit or rollback ended the transaction block.
    pub fn on_finish(&mut self) {
        self.state = TransactionState::Idle;
    }
}

impl Default for TransactionStateHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let handler = TransactionStateHandler::new();
        assert_eq!(handler.get_state(), TransactionState::Idle);
        assert!(!handler.in_transaction());
    }

    #[test]
    fn test_transaction_cycle() {
        let mut handler = TransactionStateHandler::new();
        handler.on_begin();
        assert_eq!(handler.get_state(), TransactionState::Open);
        handler.on_finish();
        assert_eq!(handler.get_state(), TransactionState::Idle);
    }

    #[test]
    fn test_poison_and_recover() {
        let mut handler = TransactionStateHandler::new();
        handler.on_begin();
        handler.on_poison();
        assert_eq!(handler.get_state(), TransactionState::Failed);

        handler.on_recover();
        assert_eq!(handler.get_state(), TransactionState::Open);

        handler.on_poison();
        handler.on_finish();
        assert_eq!(handler.get_state(), TransactionState::Idle);
    }

    #[test]
    fn test_poison_outside_transaction_is_ignored() {
        let mut handler = TransactionStateHandler::new();
        handler.on_poison();
        assert_eq!(handler.get_state(), TransactionState::Idle);
    }
}
