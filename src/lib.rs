pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{CredentialProvider, StaticCredentials, SyncSettings};
pub use core::{
    Action, ActionKind, Baseline, PlanSummary, ProgressEvent, Propagator, Reconciler, RunStatus,
    Snapshot, SyncReport, SyncSession, TreeWalker,
};
pub use error::{StorageError, SyncError};

/// 平台相关目录（基于环境变量）
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }
}
