//! Configuration for reconciliation and batch runs
//!
//! Every key has a default; a TOML file only needs the keys it overrides.

use crate::error::CoreError;
use crate::models::RoleSets;
use crate::store::{ReadOptions, ReadPreference};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Collection names in the document store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Collections {
    pub chats: String,
    pub usages: String,
    pub bot_responses: String,
    pub customers: String,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            chats: "chats".to_string(),
            usages: "usages".to_string(),
            bot_responses: "botresponses".to_string(),
            customers: "customers".to_string(),
        }
    }
}

/// Batch workflow defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Concurrent workers (1..=2)
    pub workers: usize,
    /// Additional attempts per failed task (0..=5)
    pub max_retries: u32,
    /// Pause after each task
    pub pause_ms: u64,
    /// Backoff unit; attempt `n` waits `n * retry_base_ms`
    pub retry_base_ms: u64,
    pub customer_batch_size: usize,
    pub channel_chunk_size: usize,
    /// Global row cap
    pub row_limit: usize,
    /// Page size used while draining a single task
    pub task_page_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 2,
            pause_ms: 200,
            retry_base_ms: 300,
            customer_batch_size: 200,
            channel_chunk_size: 25,
            row_limit: 5_000,
            task_page_size: 500,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    /// Ceiling applied to every datastore operation
    pub query_timeout_ms: u64,
    pub primary_reads: bool,
    pub default_page_size: usize,
    pub default_match_window_sec: u64,
    /// Padding around the caller's range for usage and bot-response reads
    pub usage_padding_sec: i64,
    /// Backward window of the nearby usage tier
    pub nearby_window_sec: i64,
    pub collections: Collections,
    pub roles: RoleSets,
    pub batch: BatchConfig,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 30_000,
            primary_reads: false,
            default_page_size: 100,
            default_match_window_sec: 60,
            usage_padding_sec: 300,
            nearby_window_sec: 300,
            collections: Collections::default(),
            roles: RoleSets::default(),
            batch: BatchConfig::default(),
        }
    }
}

pub const MIN_PAGE_SIZE: usize = 1;
pub const MAX_PAGE_SIZE: usize = 1_000;
pub const MIN_MATCH_WINDOW_SEC: u64 = 1;
pub const MAX_MATCH_WINDOW_SEC: u64 = 300;
pub const MAX_WORKERS: usize = 2;
pub const MAX_RETRIES: u32 = 5;
pub const MAX_CUSTOMER_BATCH: usize = 500;
pub const MAX_CHANNEL_CHUNK: usize = 100;
pub const MAX_ROW_LIMIT: usize = 50_000;

impl ReconConfig {
    /// Load from a TOML file and validate
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| CoreError::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, CoreError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.query_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig {
                message: "query_timeout_ms must be greater than zero".to_string(),
            });
        }
        if self.roles.question.is_empty() || self.roles.answer.is_empty() {
            return Err(CoreError::InvalidConfig {
                message: "roles.question and roles.answer must not be empty".to_string(),
            });
        }
        if self.usage_padding_sec < 0 || self.nearby_window_sec < 0 {
            return Err(CoreError::InvalidConfig {
                message: "padding and nearby windows must not be negative".to_string(),
            });
        }
        Ok(())
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            timeout: Duration::from_millis(self.query_timeout_ms),
            read_preference: if self.primary_reads {
                ReadPreference::Primary
            } else {
                ReadPreference::SecondaryPreferred
            },
        }
    }

    pub fn clamp_page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }

    pub fn clamp_match_window(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_match_window_sec)
            .clamp(MIN_MATCH_WINDOW_SEC, MAX_MATCH_WINDOW_SEC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReconConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch.workers, 2);
        assert_eq!(config.batch.max_retries, 2);
        assert_eq!(config.read_options().timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
query_timeout_ms = 5000

[collections]
chats = "messages"

[batch]
pause_ms = 0
"#
        )
        .unwrap();

        let config = ReconConfig::load(file.path()).unwrap();
        assert_eq!(config.query_timeout_ms, 5000);
        assert_eq!(config.collections.chats, "messages");
        assert_eq!(config.collections.usages, "usages");
        assert_eq!(config.batch.pause_ms, 0);
        assert_eq!(config.batch.max_retries, 2);
    }

    #[test]
    fn test_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "query_timeout_ms = \"soon\"").unwrap();
        let err = ReconConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, CoreError::ConfigParse { .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ReconConfig {
            query_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_clamps() {
        let config = ReconConfig::default();
        assert_eq!(config.clamp_page_size(None), 100);
        assert_eq!(config.clamp_page_size(Some(0)), 1);
        assert_eq!(config.clamp_page_size(Some(10_000)), 1_000);
        assert_eq!(config.clamp_match_window(None), 60);
        assert_eq!(config.clamp_match_window(Some(0)), 1);
        assert_eq!(config.clamp_match_window(Some(900)), 300);
    }
}
