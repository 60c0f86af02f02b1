use std::fmt;

use thiserror::Error;

use crate::sqlstate::SqlState;

/// Structured error response from the server: an SQLSTATE code plus the
/// human-readable message, exactly as reported on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    pub code: SqlState,
    pub message: String,
}

impl ServerError {
    pub fn new(code: SqlState, message: impl Into<String>) -> Self {
        ServerError {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TidepoolError {
    /// Server-reported failure, passed through with its original SQLSTATE.
    #[error("server error {0}")]
    Server(ServerError),

    /// Savepoint or commit issued while no transaction can be open.
    #[error("no active transaction: {0}")]
    NoActiveTransaction(String),

    /// Savepoint handle referenced after release, rollback past it, or
    /// transaction end.
    #[error("savepoint is no longer valid: {0}")]
    SavepointInvalid(String),

    /// Cross-type savepoint accessor: id of a named savepoint or name of an
    /// unnamed one.
    #[error("{0}")]
    WrongSavepointKind(String),

    /// The transaction is poisoned; only rollback or commit are accepted.
    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    InFailedTransaction,

    /// Control-statement round trip (savepoint creation, recovery rollback)
    /// failed; never swallowed.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl TidepoolError {
    /// SQLSTATE surfaced to the caller, if this error carries one. Server
    /// errors keep their originating code; locally-raised user errors map to
    /// the code the server would have used.
    pub fn sqlstate(&self) -> Option<SqlState> {
        match self {
            TidepoolError::Server(e) => Some(e.code.clone()),
            TidepoolError::NoActiveTransaction(_) => Some(SqlState::NoActiveSqlTransaction),
            TidepoolError::SavepointInvalid(_) => Some(SqlState::InvalidSavepointSpecification),
            TidepoolError::WrongSavepointKind(_) => Some(SqlState::WrongObjectType),
            TidepoolError::InFailedTransaction => Some(SqlState::InFailedSqlTransaction),
            TidepoolError::Protocol(_) | TidepoolError::Config(_) | TidepoolError::Parse(_) => {
                None
            }
        }
    }
}

impl From<ServerError> for TidepoolError {
    fn from(err: ServerError) -> Self {
        TidepoolError::Server(err)
    }
}
