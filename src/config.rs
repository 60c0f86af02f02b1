use serde::Deserialize;

use crate::error::TidepoolError;

/// Controls when the session wraps statements in an implicit savepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoSaveMode {
    /// No implicit savepoints; failures poison the transaction.
    Never,
    /// Savepoint only before statements that reuse potentially-stale
    /// server-prepared state.
    Conservative,
    /// Savepoint before every statement executed inside a transaction.
    Always,
}

impl Default for AutoSaveMode {
    fn default() -> Self {
        AutoSaveMode::Never
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub autosave: AutoSaveMode,
    /// Release the autosave savepoint after each successful statement instead
    /// of letting shadowed savepoints accumulate until transaction end.
    pub cleanup_savepoints: bool,
    /// Invalidate the statement cache when the session itself executes
    /// DEALLOCATE ALL / DISCARD ALL.
    pub flush_cache_on_deallocate: bool,
    /// Number of executions before a statement is server-prepared.
    pub prepare_threshold: u32,
    pub autocommit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            autosave: AutoSaveMode::Never,
            cleanup_savepoints: false,
            flush_cache_on_deallocate: true,
            prepare_threshold: 5,
            autocommit: true,
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: &str) -> Result<Self, TidepoolError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TidepoolError::Config(format!("failed to read {}: {}", path, e)))?;
        let cfg: SessionConfig = serde_yaml::from_str(&content)
            .map_err(|e| TidepoolError::Config(format!("failed to parse {}: {}", path, e)))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.autosave, AutoSaveMode::Never);
        assert!(!cfg.cleanup_savepoints);
        assert!(cfg.flush_cache_on_deallocate);
        assert_eq!(cfg.prepare_threshold, 5);
        assert!(cfg.autocommit);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "autosave: conservative").unwrap();
        writeln!(file, "cleanup_savepoints: true").unwrap();
        writeln!(file, "prepare_threshold: 1").unwrap();

        let cfg = SessionConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.autosave, AutoSaveMode::Conservative);
        assert!(cfg.cleanup_savepoints);
        assert_eq!(cfg.prepare_threshold, 1);
        // unset keys keep their defaults
        assert!(cfg.flush_cache_on_deallocate);
        assert!(cfg.autocommit);
    }

    #[test]
    fn test_from_file_missing() {
        let result = SessionConfig::from_file("/nonexistent/session.yaml");
        assert!(matches!(result, Err(TidepoolError::Config(_))));
    }

    #[test]
    fn test_autosave_mode_names() {
        let cfg: SessionConfig = serde_yaml::from_str("autosave: always").unwrap();
        assert_eq!(cfg.autosave, AutoSaveMode::Always);
        let cfg: SessionConfig = serde_yaml::from_str("autosave: never").unwrap();
        assert_eq!(cfg.autosave, AutoSaveMode::Never);
        assert!(serde_yaml::from_str::<SessionConfig>("autosave: sometimes").is_err());
    }
}
