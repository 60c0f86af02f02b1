use std::collections::HashMap;

use crate::backend::Backend;
use crate::error::ServerError;
use crate::parser::{ColumnDef, Expr, Projection, Statement};
use crate::result::{DataValue, Row, TidepoolResult};
use crate::sqlstate::SqlState;

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<ColumnDef>,
    rows: Vec<Row>,
    /// Bumped by schema-changing DDL; cached plans compare against it.
    generation: u64,
}

#[derive(Debug, Clone, Default)]
struct TableSet {
    tables: HashMap<String, Table>,
}

impl TableSet {
    fn new() -> Self {
        TableSet::default()
    }

    fn restore_from(&mut self, other: &TableSet) {
        self.tables = other.tables.clone();
    }
}

#[derive(Debug, Clone)]
struct PreparedStatement {
    statement: Statement,
    /// Schema generations of referenced tables at plan time.
    generations: HashMap<String, u64>,
}

#[derive(Debug)]
struct TxState {
    snapshot: TableSet,
    savepoints: Vec<(String, TableSet)>,
    failed: bool,
}

/// In-memory stand-in for a PostgreSQL-compatible server, covering the
/// session semantics the recovery coordinator depends on: transaction
/// poisoning, savepoint stacks, prepared-statement lifetime across
/// DEALLOCATE/DISCARD, and plan-shape invalidation after DDL.
pub struct InMemoryBackend {
    tables: TableSet,
    prepared: HashMap<String, PreparedStatement>,
    tx: Option<TxState>,
    backend_pid: u32,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend {
            tables: TableSet::new(),
            prepared: HashMap::new(),
            tx: None,
            backend_pid: rand::random::<u32>(),
        }
    }

    pub fn backend_pid(&self) -> u32 {
        self.backend_pid
    }

    fn poison(&mut self) {
        if let Some(tx) = &mut self.tx {
            tx.failed = true;
        }
    }

    fn in_failed_tx(&self) -> bool {
        self.tx.as_ref().map(|tx| tx.failed).unwrap_or(false)
    }

    fn failed_tx_error() -> ServerError {
        ServerError::new(
            SqlState::InFailedSqlTransaction,
            "current transaction is aborted, commands ignored until end of transaction block",
        )
    }

    fn dispatch(&mut self, stmt: Statement) -> Result<TidepoolResult, ServerError> {
        match stmt {
            Statement::Begin => {
                if self.tx.is_none() {
                    self.tx = Some(TxState {
                        snapshot: self.tables.clone(),
                        savepoints: Vec::new(),
                        failed: false,
                    });
                }
                Ok(TidepoolResult::Begin)
            }
            Statement::Commit => match self.tx.take() {
                Some(tx) if tx.failed => {
                    self.tables.restore_from(&tx.snapshot);
                    Ok(TidepoolResult::Rollback)
                }
                _ => Ok(TidepoolResult::Commit),
            },
            Statement::Rollback => {
                if let Some(tx) = self.tx.take() {
                    self.tables.restore_from(&tx.snapshot);
                }
                Ok(TidepoolResult::Rollback)
            }
            Statement::Savepoint(name) => {
                let snapshot = self.tables.clone();
                let tx = self.tx.as_mut().ok_or_else(|| {
                    ServerError::new(
                        SqlState::NoActiveSqlTransaction,
                        "SAVEPOINT can only be used in transaction blocks",
                    )
                })?;
                tx.savepoints.push((name, snapshot));
                Ok(TidepoolResult::Savepoint)
            }
            Statement::RollbackToSavepoint(name) => {
                let tx = self.tx.as_mut().ok_or_else(|| {
                    ServerError::new(
                        SqlState::NoActiveSqlTransaction,
                        "ROLLBACK TO SAVEPOINT can only be used in transaction blocks",
                    )
                })?;
                let position = tx
                    .savepoints
                    .iter()
                    .rposition(|(sp_name, _)| sp_name == &name)
                    .ok_or_else(|| {
                        ServerError::new(
                            SqlState::InvalidSavepointSpecification,
                            format!("savepoint \"{}\" does not exist", name),
                        )
                    })?;
                let snapshot = tx.savepoints[position].1.clone();
                tx.savepoints.truncate(position + 1);
                tx.failed = false;
                self.tables.restore_from(&snapshot);
                Ok(TidepoolResult::RollbackToSavepoint)
            }
            Statement::ReleaseSavepoint(name) => {
                let tx = self.tx.as_mut().ok_or_else(|| {
                    ServerError::new(
                        SqlState::NoActiveSqlTransaction,
                        "RELEASE SAVEPOINT can only be used in transaction blocks",
                    )
                })?;
                let position = tx
                    .savepoints
                    .iter()
                    .rposition(|(sp_name, _)| sp_name == &name)
                    .ok_or_else(|| {
                        ServerError::new(
                            SqlState::InvalidSavepointSpecification,
                            format!("savepoint \"{}\" does not exist", name),
                        )
                    })?;
                tx.savepoints.truncate(position);
                Ok(TidepoolResult::ReleaseSavepoint)
            }
            Statement::DeallocateAll => {
                self.prepared.clear();
                Ok(TidepoolResult::Deallocate)
            }
            Statement::DiscardAll => {
                if self.tx.is_some() {
                    return Err(ServerError::new(
                        SqlState::ActiveSqlTransaction,
                        "DISCARD ALL cannot run inside a transaction block",
                    ));
                }
                self.prepared.clear();
                Ok(TidepoolResult::Discard)
            }
            Statement::CreateTable { table, columns } => {
                if self.tables.tables.contains_key(&table) {
                    return Err(ServerError::new(
                        SqlState::DuplicateTable,
                        format!("relation \"{}\" already exists", table),
                    ));
                }
                self.tables.tables.insert(
                    table,
                    Table {
                        columns,
                        rows: Vec::new(),
                        generation: 0,
                    },
                );
                Ok(TidepoolResult::CreateTable)
            }
            Statement::DropTable { table } => {
                self.tables.tables.remove(&table).ok_or_else(|| {
                    ServerError::new(
                        SqlState::UndefinedTable,
                        format!("relation \"{}\" does not exist", table),
                    )
                })?;
                Ok(TidepoolResult::DropTable)
            }
            Statement::AlterTableAddColumn { table, column } => {
                let entry = self.tables.tables.get_mut(&table).ok_or_else(|| {
                    ServerError::new(
                        SqlState::UndefinedTable,
                        format!("relation \"{}\" does not exist", table),
                    )
                })?;
                entry.columns.push(column);
                for row in &mut entry.rows {
                    row.push(DataValue::Null);
                }
                entry.generation += 1;
                Ok(TidepoolResult::AlterTable)
            }
            Statement::Insert {
                table,
                columns,
                values,
            } => self.exec_insert(&table, columns.as_deref(), &values),
            Statement::Select { projection, table } => {
                self.exec_select(&projection, table.as_deref())
            }
            Statement::Update { table, assignments } => self.exec_update(&table, &assignments),
            Statement::Delete { table } => {
                let entry = self.tables.tables.get_mut(&table).ok_or_else(|| {
                    ServerError::new(
                        SqlState::UndefinedTable,
                        format!("relation \"{}\" does not exist", table),
                    )
                })?;
                let count = entry.rows.len();
                entry.rows.clear();
                Ok(TidepoolResult::Delete(count))
            }
        }
    }

    fn eval_expr(expr: &Expr, ctx: Option<(&[ColumnDef], &Row)>) -> Result<DataValue, ServerError> {
        match expr {
            Expr::Integer(n) => Ok(DataValue::Integer(*n)),
            Expr::Text(s) => Ok(DataValue::Text(s.clone())),
            Expr::Null => Ok(DataValue::Null),
            Expr::Column(name) => {
                let (columns, row) = ctx.ok_or_else(|| {
                    ServerError::new(
                        SqlState::UndefinedColumn,
                        format!("column \"{}\" does not exist", name),
                    )
                })?;
                let position = columns
                    .iter()
                    .position(|c| &c.name == name)
                    .ok_or_else(|| {
                        ServerError::new(
                            SqlState::UndefinedColumn,
                            format!("column \"{}\" does not exist", name),
                        )
                    })?;
                Ok(row[position].clone())
            }
            Expr::Div(lhs, rhs) => {
                let lhs = Self::eval_expr(lhs, ctx)?;
                let rhs = Self::eval_expr(rhs, ctx)?;
                match (lhs, rhs) {
                    (DataValue::Integer(_), DataValue::Integer(0)) => Err(ServerError::new(
                        SqlState::DivisionByZero,
                        "division by zero",
                    )),
                    (DataValue::Integer(a), DataValue::Integer(b)) => {
                        Ok(DataValue::Integer(a / b))
                    }
                    _ => Err(ServerError::new(
                        SqlState::Other("42883".to_string()),
                        "operator does not exist: / on non-integer operands",
                    )),
                }
            }
        }
    }

    fn exec_insert(
        &mut self,
        table: &str,
        columns: Option<&[String]>,
        values: &[Expr],
    ) -> Result<TidepoolResult, ServerError> {
        let mut evaluated = Vec::with_capacity(values.len());
        for value in values {
            evaluated.push(Self::eval_expr(value, None)?);
        }

        let entry = self.tables.tables.get_mut(table).ok_or_else(|| {
            ServerError::new(
                SqlState::UndefinedTable,
                format!("relation \"{}\" does not exist", table),
            )
        })?;

        let row = match columns {
            Some(names) => {
                if names.len() != evaluated.len() {
                    return Err(ServerError::new(
                        SqlState::SyntaxError,
                        "INSERT has more expressions than target columns",
                    ));
                }
                let mut row = vec![DataValue::Null; entry.columns.len()];
                for (name, value) in names.iter().zip(evaluated) {
                    let position =
                        entry.columns.iter().position(|c| &c.name == name).ok_or_else(|| {
                            ServerError::new(
                                SqlState::UndefinedColumn,
                                format!(
                                    "column \"{}\" of relation \"{}\" does not exist",
                                    name, table
                                ),
                            )
                        })?;
                    row[position] = value;
                }
                row
            }
            None => {
                if evaluated.len() != entry.columns.len() {
                    return Err(ServerError::new(
                        SqlState::SyntaxError,
                        "INSERT has more expressions than target columns",
                    ));
                }
                evaluated
            }
        };

        for (position, column) in entry.columns.iter().enumerate() {
            if column.primary_key {
                let duplicate = entry.rows.iter().any(|existing| {
                    existing[position] != DataValue::Null && existing[position] == row[position]
                });
                if duplicate {
                    return Err(ServerError::new(
                        SqlState::UniqueViolation,
                        format!(
                            "duplicate key value violates unique constraint \"{}_pkey\"",
                            table
                        ),
                    ));
                }
            }
        }

        entry.rows.push(row);
        Ok(TidepoolResult::Insert(1))
    }

    fn exec_select(
        &mut self,
        projection: &Projection,
        table: Option<&str>,
    ) -> Result<TidepoolResult, ServerError> {
        let entry = match table {
            Some(name) => Some(self.tables.tables.get(name).ok_or_else(|| {
                ServerError::new(
                    SqlState::UndefinedTable,
                    format!("relation \"{}\" does not exist", name),
                )
            })?),
            None => None,
        };

        match (projection, entry) {
            (Projection::Star, Some(entry)) => Ok(TidepoolResult::Select(entry.rows.clone())),
            (Projection::CountStar, Some(entry)) => Ok(TidepoolResult::Select(vec![vec![
                DataValue::Integer(entry.rows.len() as i64),
            ]])),
            (Projection::Items(items), Some(entry)) => {
                let mut rows = Vec::with_capacity(entry.rows.len());
                for row in &entry.rows {
                    let mut projected = Vec::with_capacity(items.len());
                    for item in items {
                        projected
                            .push(Self::eval_expr(item, Some((entry.columns.as_slice(), row)))?);
                    }
                    rows.push(projected);
                }
                Ok(TidepoolResult::Select(rows))
            }
            (Projection::Items(items), None) => {
                let mut projected = Vec::with_capacity(items.len());
                for item in items {
                    projected.push(Self::eval_expr(item, None)?);
                }
                Ok(TidepoolResult::Select(vec![projected]))
            }
            (_, None) => Err(ServerError::new(
                SqlState::SyntaxError,
                "SELECT * requires a FROM clause",
            )),
        }
    }

    fn exec_update(
        &mut self,
        table: &str,
        assignments: &[(String, Expr)],
    ) -> Result<TidepoolResult, ServerError> {
        let entry = self.tables.tables.get_mut(table).ok_or_else(|| {
            ServerError::new(
                SqlState::UndefinedTable,
                format!("relation \"{}\" does not exist", table),
            )
        })?;

        let mut targets = Vec::with_capacity(assignments.len());
        for (name, _) in assignments {
            let position = entry
                .columns
                .iter()
                .position(|c| &c.name == name)
                .ok_or_else(|| {
                    ServerError::new(
                        SqlState::UndefinedColumn,
                        format!("column \"{}\" does not exist", name),
                    )
                })?;
            targets.push(position);
        }

        let columns = entry.columns.clone();
        let count = entry.rows.len();
        for row in &mut entry.rows {
            let mut updated = row.clone();
            for (position, (_, value)) in targets.iter().zip(assignments) {
                updated[*position] = Self::eval_expr(value, Some((columns.as_slice(), &*row)))?;
            }
            *row = updated;
        }
        Ok(TidepoolResult::Update(count))
    }

    fn check_plan_shape(&self, prepared: &PreparedStatement) -> Result<(), ServerError> {
        let shape_dependent = matches!(
            prepared.statement,
            Statement::Select {
                projection: Projection::Star,
                ..
            }
        );
        if !shape_dependent {
            return Ok(());
        }
        for (table, generation) in &prepared.generations {
            if let Some(entry) = self.tables.tables.get(table) {
                if entry.generation != *generation {
                    return Err(ServerError::new(
                        SqlState::NotImplemented,
                        "cached plan must not change result type",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for InMemoryBackend {
    fn execute(&mut self, sql: &str) -> Result<TidepoolResult, ServerError> {
        let stmt = match Statement::parse(sql) {
            Ok(stmt) => stmt,
            Err(e) => {
                if self.in_failed_tx() {
                    return Err(Self::failed_tx_error());
                }
                self.poison();
                return Err(ServerError::new(SqlState::SyntaxError, e.to_string()));
            }
        };
        if self.in_failed_tx() && !stmt.allowed_in_failed_transaction() {
            return Err(Self::failed_tx_error());
        }
        let result = self.dispatch(stmt);
        if result.is_err() {
            self.poison();
        }
        result
    }

    fn prepare(&mut self, name: &str, sql: &str) -> Result<(), ServerError> {
        if self.in_failed_tx() {
            return Err(Self::failed_tx_error());
        }
        let result = (|| {
            let stmt = Statement::parse(sql)
                .map_err(|e| ServerError::new(SqlState::SyntaxError, e.to_string()))?;
            let mut generations = HashMap::new();
            if let Some(table) = stmt.referenced_table() {
                let entry = self.tables.tables.get(table).ok_or_else(|| {
                    ServerError::new(
                        SqlState::UndefinedTable,
                        format!("relation \"{}\" does not exist", table),
                    )
                })?;
                generations.insert(table.to_string(), entry.generation);
            }
            self.prepared.insert(
                name.to_string(),
                PreparedStatement {
                    statement: stmt,
                    generations,
                },
            );
            Ok(())
        })();
        if result.is_err() {
            self.poison();
        }
        result
    }

    fn execute_prepared(&mut self, name: &str) -> Result<TidepoolResult, ServerError> {
        if self.in_failed_tx() {
            return Err(Self::failed_tx_error());
        }
        let result = (|| {
            let prepared = self.prepared.get(name).cloned().ok_or_else(|| {
                ServerError::new(
                    SqlState::InvalidSqlStatementName,
                    format!("prepared statement \"{}\" does not exist", name),
                )
            })?;
            self.check_plan_shape(&prepared)?;
            self.dispatch(prepared.statement)
        })();
        if result.is_err() {
            self.poison();
        }
        result
    }

    fn ping(&mut self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_with_table() -> InMemoryBackend {
        let mut backend = InMemoryBackend::new();
        backend
            .execute("create table rollbacktest (a int, str text)")
            .unwrap();
        backend
            .execute("insert into rollbacktest(a, str) values (0, 'test')")
            .unwrap();
        backend
    }

    fn count(backend: &mut InMemoryBackend) -> i64 {
        backend
            .execute("select count(*) from rollbacktest")
            .unwrap()
            .scalar()
            .unwrap()
    }

    #[test]
    fn test_transaction_rollback_restores_snapshot() {
        let mut backend = backend_with_table();
        backend.execute("BEGIN").unwrap();
        backend
            .execute("insert into rollbacktest(a, str) values (1, 'x')")
            .unwrap();
        assert_eq!(count(&mut backend), 2);
        backend.execute("ROLLBACK").unwrap();
        assert_eq!(count(&mut backend), 1);
    }

    #[test]
    fn test_error_poisons_transaction_until_rollback() {
        let mut backend = backend_with_table();
        backend.execute("BEGIN").unwrap();
        let err = backend.execute("select 1/0").unwrap_err();
        assert_eq!(err.code, SqlState::DivisionByZero);

        let err = backend.execute("select count(*) from rollbacktest").unwrap_err();
        assert_eq!(err.code, SqlState::InFailedSqlTransaction);

        backend.execute("ROLLBACK").unwrap();
        assert_eq!(count(&mut backend), 1);
    }

    #[test]
    fn test_commit_in_failed_transaction_degrades_to_rollback() {
        let mut backend = backend_with_table();
        backend.execute("BEGIN").unwrap();
        backend
            .execute("insert into rollbacktest(a, str) values (1, 'x')")
            .unwrap();
        backend.execute("select 1/0").unwrap_err();
        assert_eq!(backend.execute("COMMIT").unwrap(), TidepoolResult::Rollback);
        assert_eq!(count(&mut backend), 1);
    }

    #[test]
    fn test_savepoint_stack_restores_and_truncates() {
        let mut backend = backend_with_table();
        backend.execute("BEGIN").unwrap();
        backend.execute("SAVEPOINT sp1").unwrap();
        backend
            .execute("insert into rollbacktest(a, str) values (1, 'x')")
            .unwrap();
        backend.execute("SAVEPOINT sp2").unwrap();
        backend
            .execute("insert into rollbacktest(a, str) values (2, 'y')")
            .unwrap();
        assert_eq!(count(&mut backend), 3);

        backend.execute("ROLLBACK TO SAVEPOINT sp2").unwrap();
        assert_eq!(count(&mut backend), 2);
        backend.execute("ROLLBACK TO SAVEPOINT sp1").unwrap();
        assert_eq!(count(&mut backend), 1);

        let err = backend.execute("ROLLBACK TO SAVEPOINT sp2").unwrap_err();
        assert_eq!(err.code, SqlState::InvalidSavepointSpecification);
    }

    #[test]
    fn test_rollback_to_savepoint_clears_failed_state() {
        let mut backend = backend_with_table();
        backend.execute("BEGIN").unwrap();
        backend.execute("SAVEPOINT sp1").unwrap();
        backend.execute("select 1/0").unwrap_err();
        assert!(backend.in_failed_tx());

        backend.execute("ROLLBACK TO SAVEPOINT sp1").unwrap();
        assert!(!backend.in_failed_tx());
        assert_eq!(count(&mut backend), 1);
    }

    #[test]
    fn test_savepoint_requires_transaction() {
        let mut backend = backend_with_table();
        let err = backend.execute("SAVEPOINT sp1").unwrap_err();
        assert_eq!(err.code, SqlState::NoActiveSqlTransaction);
    }

    #[test]
    fn test_savepoint_shadowing_resolves_to_latest() {
        let mut backend = backend_with_table();
        backend.execute("BEGIN").unwrap();
        backend.execute("SAVEPOINT sp").unwrap();
        backend
            .execute("insert into rollbacktest(a, str) values (1, 'x')")
            .unwrap();
        backend.execute("SAVEPOINT sp").unwrap();
        backend
            .execute("insert into rollbacktest(a, str) values (2, 'y')")
            .unwrap();

        backend.execute("ROLLBACK TO SAVEPOINT sp").unwrap();
        // the later savepoint wins: only the second insert is undone
        assert_eq!(count(&mut backend), 2);
    }

    #[test]
    fn test_release_savepoint_drops_later_entries() {
        let mut backend = backend_with_table();
        backend.execute("BEGIN").unwrap();
        backend.execute("SAVEPOINT sp1").unwrap();
        backend.execute("SAVEPOINT sp2").unwrap();
        backend.execute("RELEASE SAVEPOINT sp1").unwrap();

        let err = backend.execute("ROLLBACK TO SAVEPOINT sp2").unwrap_err();
        assert_eq!(err.code, SqlState::InvalidSavepointSpecification);
    }

    #[test]
    fn test_deallocate_all_drops_prepared_statements() {
        let mut backend = backend_with_table();
        backend
            .prepare("s1", "select a, str from rollbacktest")
            .unwrap();
        backend.execute_prepared("s1").unwrap();

        backend.execute("DEALLOCATE ALL").unwrap();
        let err = backend.execute_prepared("s1").unwrap_err();
        assert_eq!(err.code, SqlState::InvalidSqlStatementName);
    }

    #[test]
    fn test_discard_all_rejected_inside_transaction() {
        let mut backend = backend_with_table();
        backend.execute("BEGIN").unwrap();
        let err = backend.execute("DISCARD ALL").unwrap_err();
        assert_eq!(err.code, SqlState::ActiveSqlTransaction);
        // the failure aborted the transaction
        let err = backend.execute("select 1").unwrap_err();
        assert_eq!(err.code, SqlState::InFailedSqlTransaction);
        backend.execute("ROLLBACK").unwrap();
    }

    #[test]
    fn test_alter_breaks_wildcard_plans_only() {
        let mut backend = backend_with_table();
        backend.prepare("star", "select * from rollbacktest").unwrap();
        backend
            .prepare("exact", "select a, str from rollbacktest")
            .unwrap();
        backend.execute_prepared("star").unwrap();
        backend.execute_prepared("exact").unwrap();

        backend.execute("alter table rollbacktest add q int").unwrap();

        let err = backend.execute_prepared("star").unwrap_err();
        assert_eq!(err.code, SqlState::NotImplemented);
        assert!(backend.execute_prepared("exact").is_ok());
    }

    #[test]
    fn test_duplicate_primary_key() {
        let mut backend = InMemoryBackend::new();
        backend
            .execute("create table savepointtable (id int primary key)")
            .unwrap();
        backend
            .execute("insert into savepointtable values (1)")
            .unwrap();
        let err = backend
            .execute("insert into savepointtable values (1)")
            .unwrap_err();
        assert_eq!(err.code, SqlState::UniqueViolation);
    }

    #[test]
    fn test_insert_with_division_by_zero() {
        let mut backend = backend_with_table();
        let err = backend
            .execute("insert into rollbacktest(a, str) values (1/0, 'test')")
            .unwrap_err();
        assert_eq!(err.code, SqlState::DivisionByZero);
        assert_eq!(count(&mut backend), 1);
    }

    #[test]
    fn test_touch_update_counts_rows() {
        let mut backend = backend_with_table();
        assert_eq!(
            backend.execute("update rollbacktest set a=a").unwrap(),
            TidepoolResult::Update(1)
        );
    }

    #[test]
    fn test_ping_survives_failed_transaction() {
        let mut backend = backend_with_table();
        backend.execute("BEGIN").unwrap();
        backend.execute("select 1/0").unwrap_err();
        assert!(backend.ping());
    }
}
