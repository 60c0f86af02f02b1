pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod parser;
pub mod result;
pub mod savepoint;
pub mod sqlstate;
pub mod statement_cache;


pub use backend::{Backend, InMemoryBackend};
pub use config::{AutoSaveMode, SessionConfig};
pub use coordinator::{RecoveryCoordinator, TransactionState};
pub use error::{ServerError, TidepoolError};
pub use result::{DataValue, Row, TidepoolResult};
pub use savepoint::{Savepoint, SavepointState};
pub use sqlstate::{InvalidationEvent, SqlState};
pub use statement_cache::StatementHandle;

use coordinator::Recovery;
use parser::Statement;
use statement_cache::StatementCache;

/// One logical session over a single backend connection. Owns the recovery
/// coordinator, the prepared-statement cache and the autocommit flag, and is
/// the single caller of both. Not safe for concurrent use; one session maps
/// to one connection used by one thread at a time.
pub struct Session<B: Backend> {
    id: u64,
    autocommit: bool,
    coordinator: RecoveryCoordinator,
    cache: StatementCache,
    backend: B,
}

impl Session<InMemoryBackend> {
    pub fn in_memory() -> Self {
        Session::new(InMemoryBackend::new(), SessionConfig::default())
    }

    pub fn in_memory_with_config(config: SessionConfig) -> Self {
        Session::new(InMemoryBackend::new(), config)
    }
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B, config: SessionConfig) -> Self {
        Session {
            id: rand::random::<u64>(),
            autocommit: config.autocommit,
            coordinator: RecoveryCoordinator::new(config),
            cache: StatementCache::new(),
            backend,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.coordinator.transaction_state()
    }

    pub fn config(&self) -> &SessionConfig {
        self.coordinator.config()
    }

    /// Runtime toggle mirroring the connection property; affects only how
    /// future DEALLOCATE/DISCARD executions are tracked.
    pub fn set_flush_cache_on_deallocate(&mut self, on: bool) {
        self.coordinator.config_mut().flush_cache_on_deallocate = on;
    }

    /// Turning autocommit on while a transaction is open commits it first.
    pub fn set_autocommit(&mut self, on: bool) -> Result<(), TidepoolError> {
        if on == self.autocommit {
            return Ok(());
        }
        if on && self.coordinator.in_transaction() {
            self.coordinator.commit(&mut self.backend)?;
        }
        self.autocommit = on;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), TidepoolError> {
        if self.autocommit {
            return Err(TidepoolError::NoActiveTransaction(
                "cannot commit when autocommit is enabled".to_string(),
            ));
        }
        self.coordinator.commit(&mut self.backend)
    }

    pub fn rollback(&mut self) -> Result<(), TidepoolError> {
        if self.autocommit {
            return Err(TidepoolError::NoActiveTransaction(
                "cannot rollback when autocommit is enabled".to_string(),
            ));
        }
        self.coordinator.rollback(&mut self.backend)
    }

    pub fn set_savepoint(&mut self) -> Result<Savepoint, TidepoolError> {
        self.coordinator
            .set_savepoint(&mut self.backend, self.autocommit, None)
    }

    pub fn set_savepoint_named(&mut self, name: &str) -> Result<Savepoint, TidepoolError> {
        self.coordinator
            .set_savepoint(&mut self.backend, self.autocommit, Some(name))
    }

    pub fn rollback_to(&mut self, savepoint: &Savepoint) -> Result<(), TidepoolError> {
        self.coordinator
            .rollback_to_savepoint(&mut self.backend, savepoint)
    }

    pub fn release_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), TidepoolError> {
        self.coordinator
            .release_savepoint(&mut self.backend, savepoint)
    }

    /// Liveness check over the simple protocol; succeeds on a live
    /// connection even while the transaction is failed or the statement
    /// cache is stale.
    pub fn is_valid(&mut self) -> bool {
        self.backend.ping()
    }

    /// Registers a statement for prepared execution. The statement is
    /// executed as plain text until its use count reaches the configured
    /// prepare threshold, then server-prepared.
    pub fn prepare(&mut self, sql: &str) -> Result<StatementHandle, TidepoolError> {
        let statement = Statement::parse(sql)?;
        Ok(self.cache.intern(sql.to_string(), statement))
    }

    /// Executes a statement through the simple protocol, with transaction
    /// bookkeeping and autosave recovery.
    pub fn execute(&mut self, sql: &str) -> Result<TidepoolResult, TidepoolError> {
        match Statement::parse(sql) {
            Ok(stmt) => self.execute_classified(sql, stmt),
            // Statements outside the classifier's grammar still go to the
            // server; its response decides.
            Err(_) => self.execute_data(sql, None),
        }
    }

    fn execute_classified(
        &mut self,
        sql: &str,
        stmt: Statement,
    ) -> Result<TidepoolResult, TidepoolError> {
        match &stmt {
            Statement::Begin => {
                if self.transaction_state() == TransactionState::Failed {
                    // the server warns and leaves the failed transaction as is
                    return Ok(TidepoolResult::Begin);
                }
                self.coordinator.begin_if_needed(&mut self.backend, false)?;
                Ok(TidepoolResult::Begin)
            }
            Statement::Commit => {
                self.coordinator.commit(&mut self.backend)?;
                Ok(TidepoolResult::Commit)
            }
            Statement::Rollback => {
                self.coordinator.rollback(&mut self.backend)?;
                Ok(TidepoolResult::Rollback)
            }
            Statement::Savepoint(_) => {
                self.coordinator.check_ready(false)?;
                self.coordinator
                    .begin_if_needed(&mut self.backend, self.autocommit)?;
                self.backend.execute(sql).map_err(TidepoolError::from)
            }
            Statement::RollbackToSavepoint(_) => {
                let result = self.backend.execute(sql).map_err(TidepoolError::from)?;
                self.coordinator.on_raw_rollback_to_savepoint();
                Ok(result)
            }
            Statement::ReleaseSavepoint(_) => {
                self.coordinator.check_ready(false)?;
                self.backend.execute(sql).map_err(TidepoolError::from)
            }
            _ => self.execute_data(sql, Some(&stmt)),
        }
    }

    fn execute_data(
        &mut self,
        sql: &str,
        stmt: Option<&Statement>,
    ) -> Result<TidepoolResult, TidepoolError> {
        self.coordinator.check_ready(false)?;
        self.coordinator
            .begin_if_needed(&mut self.backend, self.autocommit)?;
        self.coordinator.before_execute(&mut self.backend, false)?;

        match self.backend.execute(sql) {
            Ok(result) => {
                self.coordinator.after_execute_success(&mut self.backend)?;
                if let Some(stmt) = stmt {
                    if stmt.invalidates_statement_cache()
                        && self.coordinator.config().flush_cache_on_deallocate
                    {
                        self.coordinator.on_deallocate_observed(&mut self.cache);
                    }
                    if let Some(table) = stmt.altered_table() {
                        self.coordinator
                            .on_schema_invalidating_ddl(&mut self.cache, table);
                    }
                }
                Ok(result)
            }
            Err(e) => {
                // text statements are never retried; recovery only decides
                // whether the transaction survives
                let _ = self.coordinator.after_execute_failure(
                    &mut self.backend,
                    &mut self.cache,
                    None,
                    &e,
                )?;
                Err(e.into())
            }
        }
    }

    /// Executes a registered statement, re-preparing on demand and applying
    /// the single-retry recovery contract for invalidation-class failures.
    pub fn execute_prepared(
        &mut self,
        handle: &StatementHandle,
    ) -> Result<TidepoolResult, TidepoolError> {
        self.coordinator.check_ready(false)?;
        self.coordinator
            .begin_if_needed(&mut self.backend, self.autocommit)?;

        let threshold = self.coordinator.config().prepare_threshold;
        let (sql, server_name, risky, server_prepared, valid, use_count) = {
            let entry = self.cache.get_mut(handle)?;
            entry.use_count += 1;
            (
                entry.sql.clone(),
                entry.server_name.clone(),
                entry.risky(),
                entry.server_prepared,
                entry.valid,
                entry.use_count,
            )
        };

        // below the prepare threshold the statement goes over the simple
        // protocol and cannot hit stale server-side state
        if !server_prepared && use_count < threshold.max(1) {
            return self.execute_data(&sql, None);
        }

        self.coordinator.before_execute(&mut self.backend, risky)?;

        if !server_prepared || !valid {
            if let Err(e) = self.backend.prepare(&server_name, &sql) {
                let _ = self.coordinator.after_execute_failure(
                    &mut self.backend,
                    &mut self.cache,
                    Some(handle),
                    &e,
                )?;
                return Err(e.into());
            }
            self.mark_prepared(handle)?;
        }

        match self.backend.execute_prepared(&server_name) {
            Ok(result) => self.finish_prepared_success(handle, result),
            Err(e) => {
                let recovery = self.coordinator.after_execute_failure(
                    &mut self.backend,
                    &mut self.cache,
                    Some(handle),
                    &e,
                )?;
                if recovery != Recovery::Retry {
                    return Err(e.into());
                }
                log::debug!("retrying {} after cache invalidation", server_name);
                if let Err(e2) = self.backend.prepare(&server_name, &sql) {
                    let _ = self.coordinator.after_execute_failure(
                        &mut self.backend,
                        &mut self.cache,
                        Some(handle),
                        &e2,
                    )?;
                    return Err(e2.into());
                }
                self.mark_prepared(handle)?;
                match self.backend.execute_prepared(&server_name) {
                    Ok(result) => self.finish_prepared_success(handle, result),
                    Err(e2) => {
                        // second failure on the same statement propagates
                        let _ = self.coordinator.after_execute_failure(
                            &mut self.backend,
                            &mut self.cache,
                            Some(handle),
                            &e2,
                        )?;
                        Err(e2.into())
                    }
                }
            }
        }
    }

    fn mark_prepared(&mut self, handle: &StatementHandle) -> Result<(), TidepoolError> {
        let entry = self.cache.get_mut(handle)?;
        entry.server_prepared = true;
        entry.valid = true;
        entry.plan_suspect = false;
        Ok(())
    }

    fn finish_prepared_success(
        &mut self,
        handle: &StatementHandle,
        result: TidepoolResult,
    ) -> Result<TidepoolResult, TidepoolError> {
        self.coordinator.after_execute_success(&mut self.backend)?;
        // a successful execution clears any schema-change suspicion
        self.cache.get_mut(handle)?.plan_suspect = false;
        Ok(result)
    }
}
