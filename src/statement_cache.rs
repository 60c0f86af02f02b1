use std::collections::HashMap;

use crate::error::TidepoolError;
use crate::parser::{Projection, Statement};

/// Opaque handle returned by `Session::prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementHandle(pub(crate) u64);

/// Maps a logical statement handle to its server-side resources. Once
/// invalidated, an entry must be re-prepared before reuse.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub(crate) sql: String,
    pub(crate) statement: Statement,
    pub(crate) server_name: String,
    /// The server holds a prepared statement under `server_name`.
    pub(crate) server_prepared: bool,
    /// False after a deallocate/discard-class invalidation; the server-side
    /// resource is gone even though `server_name` is still reserved.
    pub(crate) valid: bool,
    /// Set when DDL touched a table this plan references; the plan may still
    /// execute, but its result shape is no longer trustworthy.
    pub(crate) plan_suspect: bool,
    pub(crate) use_count: u32,
}

impl CacheEntry {
    /// A statement whose result shape depends on the table definition at
    /// plan time. Exact-column projections survive column additions.
    pub(crate) fn plan_shape_dependent(&self) -> bool {
        matches!(
            self.statement,
            Statement::Select {
                projection: Projection::Star,
                ..
            }
        )
    }

    /// Whether executing this entry reuses server-side state that may have
    /// gone stale since it was prepared.
    pub(crate) fn risky(&self) -> bool {
        (self.server_prepared && self.valid) || self.plan_suspect
    }
}

#[derive(Debug, Default)]
pub struct StatementCache {
    entries: HashMap<u64, CacheEntry>,
    next_id: u64,
}

impl StatementCache {
    pub fn new() -> Self {
        StatementCache {
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn intern(&mut self, sql: String, statement: Statement) -> StatementHandle {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            CacheEntry {
                sql,
                statement,
                server_name: format!("tidepool_s{}", id),
                server_prepared: false,
                valid: false,
                plan_suspect: false,
                use_count: 0,
            },
        );
        StatementHandle(id)
    }

    pub fn get(&self, handle: &StatementHandle) -> Result<&CacheEntry, TidepoolError> {
        self.entries
            .get(&handle.0)
            .ok_or_else(|| TidepoolError::Protocol(format!("unknown statement handle {}", handle.0)))
    }

    pub(crate) fn get_mut(
        &mut self,
        handle: &StatementHandle,
    ) -> Result<&mut CacheEntry, TidepoolError> {
        self.entries
            .get_mut(&handle.0)
            .ok_or_else(|| TidepoolError::Protocol(format!("unknown statement handle {}", handle.0)))
    }

    /// Marks every entry as needing re-preparation. Used when the server has
    /// dropped its prepared statements (DEALLOCATE/DISCARD observed, or a
    /// "prepared statement does not exist" response).
    pub(crate) fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.valid = false;
            entry.server_prepared = false;
        }
    }

    /// Marks plans referencing `table` as suspect after schema-changing DDL.
    pub(crate) fn mark_plan_suspect(&mut self, table: &str) {
        for entry in self.entries.values_mut() {
            if entry.statement.referenced_table() == Some(table) {
                entry.plan_suspect = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_star(cache: &mut StatementCache) -> StatementHandle {
        let sql = "select * from rollbacktest";
        cache.intern(sql.to_string(), Statement::parse(sql).unwrap())
    }

    #[test]
    fn test_intern_assigns_server_names() {
        let mut cache = StatementCache::new();
        let h1 = select_star(&mut cache);
        let h2 = select_star(&mut cache);
        assert_ne!(
            cache.get(&h1).unwrap().server_name,
            cache.get(&h2).unwrap().server_name
        );
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_invalidate_all() {
        let mut cache = StatementCache::new();
        let handle = select_star(&mut cache);
        {
            let entry = cache.get_mut(&handle).unwrap();
            entry.server_prepared = true;
            entry.valid = true;
        }
        assert!(cache.get(&handle).unwrap().risky());

        cache.invalidate_all();
        let entry = cache.get(&handle).unwrap();
        assert!(!entry.valid);
        assert!(!entry.server_prepared);
        assert!(!entry.risky());
    }

    #[test]
    fn test_mark_plan_suspect_only_hits_referencing_entries() {
        let mut cache = StatementCache::new();
        let hit = select_star(&mut cache);
        let sql = "select count(*) from other";
        let miss = cache.intern(sql.to_string(), Statement::parse(sql).unwrap());

        cache.mark_plan_suspect("rollbacktest");
        assert!(cache.get(&hit).unwrap().plan_suspect);
        assert!(!cache.get(&miss).unwrap().plan_suspect);
    }

    #[test]
    fn test_plan_shape_dependency() {
        let mut cache = StatementCache::new();
        let star = select_star(&mut cache);
        let sql = "select a, str from rollbacktest";
        let exact = cache.intern(sql.to_string(), Statement::parse(sql).unwrap());

        assert!(cache.get(&star).unwrap().plan_shape_dependent());
        assert!(!cache.get(&exact).unwrap().plan_shape_dependent());
    }
}
