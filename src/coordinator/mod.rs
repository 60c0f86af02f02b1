mod savepoint_handler;
mod state_handler;

pub use savepoint_handler::SavepointHandler;
pub use state_handler::{TransactionState, TransactionStateHandler};

use crate::backend::Backend;
use crate::config::{AutoSaveMode, SessionConfig};
use crate::error::{ServerError, TidepoolError};
use crate::savepoint::{Savepoint, SavepointState};
use crate::sqlstate::{classify, InvalidationEvent};
use crate::statement_cache::{StatementCache, StatementHandle};

/// Identifier of the implicit recovery savepoint. Re-establishing it before
/// each guarded statement shadows the previous one.
const AUTOSAVE_SAVEPOINT: &str = "tidepool_autosave";

/// How a classified failure was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Rolled back to the recovery savepoint; the transaction stays usable
    /// but the statement's own error still surfaces.
    Recovered,
    /// Stale cached state was discarded (and the recovery savepoint rolled
    /// back to, if inside a transaction); the caller may re-prepare and
    /// retry exactly once.
    Retry,
    /// The transaction is poisoned; only rollback or commit will be accepted.
    Poisoned,
    /// Nothing to recover and nothing to poison; the error passes through.
    Surfaced,
}

/// Per-session transaction recovery coordinator. Owns the transaction state
/// and the savepoint bookkeeping for one logical session, decides when to
/// interpose the autosave savepoint, and classifies failures into recovery
/// actions. Invoked strictly sequentially by its owning session.
pub struct RecoveryCoordinator {
    config: SessionConfig,
    state: TransactionStateHandler,
    savepoints: SavepointHandler,
    /// A recovery savepoint was established for the statement in flight.
    autosave_armed: bool,
    /// One implicit recovery per failure; a second failure propagates.
    recovery_spent: bool,
}

impl RecoveryCoordinator {
    pub fn new(config: SessionConfig) -> Self {
        RecoveryCoordinator {
            config,
            state: TransactionStateHandler::new(),
            savepoints: SavepointHandler::new(),
            autosave_armed: false,
            recovery_spent: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.state.get_state()
    }

    pub fn in_transaction(&self) -> bool {
        self.state.in_transaction()
    }

    /// Fail-fast gate: while the transaction is poisoned, everything except
    /// rollback and commit is rejected without a round trip.
    pub fn check_ready(&self, allowed_in_failed: bool) -> Result<(), TidepoolError> {
        if self.state.get_state() == TransactionState::Failed && !allowed_in_failed {
            return Err(TidepoolError::InFailedTransaction);
        }
        Ok(())
    }

    /// Opens the transaction block before the first statement of a
    /// non-autocommit session. No-op under autocommit.
    pub fn begin_if_needed<B: Backend>(
        &mut self,
        backend: &mut B,
        autocommit: bool,
    ) -> Result<(), TidepoolError> {
        if autocommit || self.state.get_state() != TransactionState::Idle {
            return Ok(());
        }
        backend.execute("BEGIN")?;
        self.state.on_begin();
        Ok(())
    }

    /// Establishes the recovery savepoint when the configured mode calls for
    /// one. Savepoints need an open transaction, so autocommit statements
    /// are never guarded.
    pub fn before_execute<B: Backend>(
        &mut self,
        backend: &mut B,
        risky: bool,
    ) -> Result<(), TidepoolError> {
        self.autosave_armed = false;
        self.recovery_spent = false;
        if self.state.get_state() != TransactionState::Open {
            return Ok(());
        }
        let wants_savepoint = match self.config.autosave {
            AutoSaveMode::Always => true,
            AutoSaveMode::Conservative => risky,
            AutoSaveMode::Never => false,
        };
        if !wants_savepoint {
            return Ok(());
        }
        backend
            .execute(&format!("SAVEPOINT {}", AUTOSAVE_SAVEPOINT))
            .map_err(|e| TidepoolError::Protocol(format!("autosave savepoint failed: {}", e)))?;
        self.autosave_armed = true;
        Ok(())
    }

    /// Post-statement bookkeeping: with `cleanup_savepoints` the recovery
    /// savepoint is released instead of accumulating shadowed entries on the
    /// server until transaction end.
    pub fn after_execute_success<B: Backend>(
        &mut self,
        backend: &mut B,
    ) -> Result<(), TidepoolError> {
        if self.autosave_armed && self.config.cleanup_savepoints {
            backend
                .execute(&format!("RELEASE SAVEPOINT {}", AUTOSAVE_SAVEPOINT))
                .map_err(|e| {
                    TidepoolError::Protocol(format!("autosave savepoint release failed: {}", e))
                })?;
        }
        self.autosave_armed = false;
        Ok(())
    }

    /// Classifies a failed statement and resolves it: recovery rollback,
    /// cache invalidation with a single retry, transaction poisoning, or
    /// plain pass-through. Classification is local; the only extra round
    /// trip is the recovery rollback itself.
    pub fn after_execute_failure<B: Backend>(
        &mut self,
        backend: &mut B,
        cache: &mut StatementCache,
        handle: Option<&StatementHandle>,
        error: &ServerError,
    ) -> Result<Recovery, TidepoolError> {
        let in_tx = self.state.get_state() == TransactionState::Open;
        let may_recover = !self.recovery_spent;

        match classify(&error.code) {
            Some(InvalidationEvent::TransactionAborted) => {
                if in_tx && self.autosave_armed && may_recover {
                    self.rollback_to_autosave(backend)?;
                    self.recovery_spent = true;
                    log::debug!(
                        "recovered from {} via rollback to {}",
                        error.code.code(),
                        AUTOSAVE_SAVEPOINT
                    );
                    Ok(Recovery::Recovered)
                } else if in_tx {
                    self.state.on_poison();
                    Ok(Recovery::Poisoned)
                } else {
                    Ok(Recovery::Surfaced)
                }
            }
            Some(InvalidationEvent::StatementDeallocated) => {
                // The server told us a statement name is gone; every cached
                // entry is suspect, not just the one that failed.
                cache.invalidate_all();
                log::debug!("statement cache invalidated after {}", error.code.code());
                if in_tx && self.autosave_armed && may_recover {
                    self.rollback_to_autosave(backend)?;
                    self.recovery_spent = true;
                    Ok(Recovery::Retry)
                } else if in_tx {
                    self.state.on_poison();
                    Ok(Recovery::Poisoned)
                } else if may_recover {
                    self.recovery_spent = true;
                    Ok(Recovery::Retry)
                } else {
                    Ok(Recovery::Surfaced)
                }
            }
            Some(InvalidationEvent::PlanShapeChanged) => {
                if let Some(handle) = handle {
                    let entry = cache.get_mut(handle)?;
                    entry.valid = false;
                    entry.server_prepared = false;
                }
                if in_tx && self.autosave_armed && may_recover {
                    self.rollback_to_autosave(backend)?;
                    self.recovery_spent = true;
                    Ok(Recovery::Retry)
                } else if in_tx {
                    self.state.on_poison();
                    Ok(Recovery::Poisoned)
                } else if may_recover {
                    self.recovery_spent = true;
                    Ok(Recovery::Retry)
                } else {
                    Ok(Recovery::Surfaced)
                }
            }
            None => {
                if in_tx {
                    self.state.on_poison();
                    Ok(Recovery::Poisoned)
                } else {
                    Ok(Recovery::Surfaced)
                }
            }
        }
    }

    fn rollback_to_autosave<B: Backend>(&mut self, backend: &mut B) -> Result<(), TidepoolError> {
        backend
            .execute(&format!("ROLLBACK TO SAVEPOINT {}", AUTOSAVE_SAVEPOINT))
            .map_err(|e| TidepoolError::Protocol(format!("recovery rollback failed: {}", e)))?;
        self.state.on_recover();
        Ok(())
    }

    /// Establishes a caller-visible savepoint. Requires a transaction, which
    /// is opened on demand; under autocommit this is a user error.
    pub fn set_savepoint<B: Backend>(
        &mut self,
        backend: &mut B,
        autocommit: bool,
        name: Option<&str>,
    ) -> Result<Savepoint, TidepoolError> {
        if autocommit {
            return Err(TidepoolError::NoActiveTransaction(
                "cannot establish a savepoint in autocommit mode".to_string(),
            ));
        }
        self.check_ready(false)?;
        self.begin_if_needed(backend, autocommit)?;
        let savepoint = match name {
            Some(name) => self.savepoints.track_named(name),
            None => self.savepoints.track_numeric(),
        };
        match backend.execute(&format!("SAVEPOINT {}", savepoint.sql_ident())) {
            Ok(_) => Ok(savepoint),
            Err(e) => {
                self.savepoints.untrack(&savepoint);
                Err(e.into())
            }
        }
    }

    /// Rolls back to a caller-visible savepoint, recovering a failed
    /// transaction and invalidating every savepoint established after the
    /// target.
    pub fn rollback_to_savepoint<B: Backend>(
        &mut self,
        backend: &mut B,
        savepoint: &Savepoint,
    ) -> Result<(), TidepoolError> {
        self.savepoints.validate(savepoint)?;
        backend.execute(&format!("ROLLBACK TO SAVEPOINT {}", savepoint.sql_ident()))?;
        self.savepoints.complete_rollback(savepoint);
        self.state.on_recover();
        Ok(())
    }

    pub fn release_savepoint<B: Backend>(
        &mut self,
        backend: &mut B,
        savepoint: &Savepoint,
    ) -> Result<(), TidepoolError> {
        self.check_ready(false)?;
        self.savepoints.validate(savepoint)?;
        backend.execute(&format!("RELEASE SAVEPOINT {}", savepoint.sql_ident()))?;
        self.savepoints.complete_release(savepoint);
        Ok(())
    }

    /// Ends the transaction block. In a failed transaction COMMIT degrades
    /// to rollback on the server and still succeeds here.
    pub fn commit<B: Backend>(&mut self, backend: &mut B) -> Result<(), TidepoolError> {
        match self.state.get_state() {
            TransactionState::Idle => Ok(()),
            TransactionState::Open => {
                if self.autosave_armed {
                    let release = format!("RELEASE SAVEPOINT {}", AUTOSAVE_SAVEPOINT);
                    if self.config.cleanup_savepoints {
                        backend.execute(&release).map_err(|e| {
                            TidepoolError::Protocol(format!(
                                "autosave savepoint release failed: {}",
                                e
                            ))
                        })?;
                    } else if let Err(e) = backend.execute(&release) {
                        log::warn!("ignoring savepoint release failure at commit: {}", e);
                    }
                }
                backend.execute("COMMIT")?;
                self.finish_transaction(SavepointState::Released);
                Ok(())
            }
            TransactionState::Failed => {
                backend.execute("COMMIT")?;
                self.finish_transaction(SavepointState::RolledBack);
                Ok(())
            }
        }
    }

    pub fn rollback<B: Backend>(&mut self, backend: &mut B) -> Result<(), TidepoolError> {
        if self.state.get_state() == TransactionState::Idle {
            return Ok(());
        }
        backend.execute("ROLLBACK")?;
        self.finish_transaction(SavepointState::RolledBack);
        Ok(())
    }

    fn finish_transaction(&mut self, savepoint_state: SavepointState) {
        self.state.on_finish();
        self.savepoints.invalidate_all(savepoint_state);
        self.autosave_armed = false;
        self.recovery_spent = false;
    }

    /// Flush tracking: the session itself executed DEALLOCATE/DISCARD, so
    /// every cached statement is gone server-side. Invalidating here means
    /// the next prepared execution re-prepares instead of hitting 26000.
    pub fn on_deallocate_observed(&mut self, cache: &mut StatementCache) {
        log::debug!("deallocate observed; flushing statement cache");
        cache.invalidate_all();
    }

    /// Hook for DDL observed on tables with live cached plans; feeds the
    /// conservative risk classification.
    pub fn on_schema_invalidating_ddl(&mut self, cache: &mut StatementCache, table: &str) {
        log::debug!("marking cached plans on {:?} as suspect", table);
        cache.mark_plan_suspect(table);
    }

    /// Raw-SQL rollback-to-savepoint observed on the session; clears the
    /// poisoned state like its API counterpart.
    pub fn on_raw_rollback_to_savepoint(&mut self) {
        self.state.on_recover();
    }
}
