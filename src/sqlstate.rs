use std::collections::HashMap;

use lazy_static::lazy_static;

/// SQLSTATE codes the session raises or expects from the server. Codes are
/// never invented on the client side; locally-raised errors use the code the
/// server would have reported for the same condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlState {
    /// 22012
    DivisionByZero,
    /// 23505
    UniqueViolation,
    /// 25001, e.g. DISCARD ALL inside a transaction block
    ActiveSqlTransaction,
    /// 25P01, e.g. SAVEPOINT outside a transaction block
    NoActiveSqlTransaction,
    /// 25P02, statements in an aborted transaction
    InFailedSqlTransaction,
    /// 26000, prepared statement does not exist
    InvalidSqlStatementName,
    /// 0A000, cached plan must not change result type
    NotImplemented,
    /// 3B001, rollback to an unknown or invalidated savepoint
    InvalidSavepointSpecification,
    /// 42601
    SyntaxError,
    /// 42703
    UndefinedColumn,
    /// 42809, wrong-kind savepoint accessor
    WrongObjectType,
    /// 42P01
    UndefinedTable,
    /// 42P07
    DuplicateTable,
    Other(String),
}

impl SqlState {
    pub fn code(&self) -> &str {
        match self {
            SqlState::DivisionByZero => "22012",
            SqlState::UniqueViolation => "23505",
            SqlState::ActiveSqlTransaction => "25001",
            SqlState::NoActiveSqlTransaction => "25P01",
            SqlState::InFailedSqlTransaction => "25P02",
            SqlState::InvalidSqlStatementName => "26000",
            SqlState::NotImplemented => "0A000",
            SqlState::InvalidSavepointSpecification => "3B001",
            SqlState::SyntaxError => "42601",
            SqlState::UndefinedColumn => "42703",
            SqlState::WrongObjectType => "42809",
            SqlState::UndefinedTable => "42P01",
            SqlState::DuplicateTable => "42P07",
            SqlState::Other(code) => code,
        }
    }

    pub fn from_code(code: &str) -> SqlState {
        match code {
            "22012" => SqlState::DivisionByZero,
            "23505" => SqlState::UniqueViolation,
            "25001" => SqlState::ActiveSqlTransaction,
            "25P01" => SqlState::NoActiveSqlTransaction,
            "25P02" => SqlState::InFailedSqlTransaction,
            "26000" => SqlState::InvalidSqlStatementName,
            "0A000" => SqlState::NotImplemented,
            "3B001" => SqlState::InvalidSavepointSpecification,
            "42601" => SqlState::SyntaxError,
            "42703" => SqlState::UndefinedColumn,
            "42809" => SqlState::WrongObjectType,
            "42P01" => SqlState::UndefinedTable,
            "42P07" => SqlState::DuplicateTable,
            other => SqlState::Other(other.to_string()),
        }
    }
}

/// Server-side event that made client-cached state stale, derived from the
/// SQLSTATE of a failed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationEvent {
    /// The server no longer knows a statement we believe is prepared
    /// (DEALLOCATE/DISCARD happened behind our back).
    StatementDeallocated,
    /// A cached plan's result shape no longer matches the table (DDL on a
    /// table referenced by the plan).
    PlanShapeChanged,
    /// A statement-local failure that, absent recovery, poisons every
    /// subsequent statement until rollback.
    TransactionAborted,
}

lazy_static! {
    static ref CODE_CLASSES: HashMap<&'static str, InvalidationEvent> = {
        let mut m = HashMap::new();
        m.insert("26000", InvalidationEvent::StatementDeallocated);
        m.insert("0A000", InvalidationEvent::PlanShapeChanged);
        m.insert("22012", InvalidationEvent::TransactionAborted);
        m.insert("23505", InvalidationEvent::TransactionAborted);
        m
    };
}

/// Maps a server error code onto the invalidation event it represents, if
/// any. Exact codes are looked up first; the data-exception (22) and
/// integrity-violation (23) classes fall back to `TransactionAborted`.
/// Unmapped codes are not classified and poison the transaction unless the
/// session is in autocommit.
pub fn classify(state: &SqlState) -> Option<InvalidationEvent> {
    let code = state.code();
    if let Some(event) = CODE_CLASSES.get(code) {
        return Some(*event);
    }
    if code.starts_with("22") || code.starts_with("23") {
        return Some(InvalidationEvent::TransactionAborted);
    }
    None
}
