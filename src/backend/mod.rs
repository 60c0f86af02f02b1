pub mod memory;

pub use memory::InMemoryBackend;

use crate::error::ServerError;
use crate::result::TidepoolResult;

/// Transport seam between the session and the server. Implementations are
/// synchronous; every call blocks on one server round trip. Errors are
/// structured responses carrying the server's SQLSTATE.
pub trait Backend {
    /// Executes a statement through the simple protocol.
    fn execute(&mut self, sql: &str) -> Result<TidepoolResult, ServerError>;

    /// Parses and plans `sql` under a server-side statement name.
    fn prepare(&mut self, name: &str, sql: &str) -> Result<(), ServerError>;

    /// Executes a previously prepared statement by name.
    fn execute_prepared(&mut self, name: &str) -> Result<TidepoolResult, ServerError>;

    /// Transport-level liveness check; bypasses transaction machinery, so it
    /// succeeds even while the transaction is failed.
    fn ping(&mut self) -> bool;
}
