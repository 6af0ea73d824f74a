//! Configuration for the MarrowDB engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Construction parameters for a database instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the database file.
    pub db_path: PathBuf,
    /// Path to the write-ahead log file.
    pub log_path: PathBuf,
    /// Number of frames in the buffer pool.
    pub buffer_pool_frames: usize,
    /// Enable write-ahead logging and the background flush thread.
    pub logging_enabled: bool,
    /// Enforce strict 2PL: locks release only at commit/abort.
    pub strict_two_phase_locking: bool,
    /// Maximum entries per extendible hash bucket before a split.
    pub hash_bucket_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./marrow.db"),
            log_path: PathBuf::from("./marrow.log"),
            buffer_pool_frames: 1024,
            logging_enabled: true,
            strict_two_phase_locking: false,
            hash_bucket_size: 64,
        }
    }
}

impl EngineConfig {
    /// Places both the database and log file under the given directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            db_path: dir.join("marrow.db"),
            log_path: dir.join("marrow.log"),
            ..Default::default()
        }
    }
}
