#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Integer(i64),
    Text(String),
    Null,
}

pub type Row = Vec<DataValue>;

/// Outcome of a successfully executed statement, mirroring the command tag
/// the server reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TidepoolResult {
    Select(Vec<Row>),
    Insert(usize),
    Update(usize),
    Delete(usize),
    CreateTable,
    AlterTable,
    DropTable,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    RollbackToSavepoint,
    ReleaseSavepoint,
    Deallocate,
    Discard,
}

impl TidepoolResult {
    /// Row count of a SELECT result; None for non-query outcomes.
    pub fn row_count(&self) -> Option<usize> {
        match self {
            TidepoolResult::Select(rows) => Some(rows.len()),
            _ => None,
        }
    }

    /// Single-cell integer result, e.g. from `SELECT count(*)`.
    pub fn scalar(&self) -> Option<i64> {
        match self {
            TidepoolResult::Select(rows) => match rows.first().and_then(|r| r.first()) {
                Some(DataValue::Integer(n)) => Some(*n),
                _ => None,
            },
            _ => None,
        }
    }
}
