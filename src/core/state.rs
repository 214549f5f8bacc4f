//! 基线持久化与运行锁
//!
//! 基线写入必须原子：先写临时文件再重命名覆盖，崩溃不会留下半写的
//! 基线。无法解析的基线按缺失处理（退化为全量对比），绝不中止运行。

use crate::core::snapshot::{Baseline, BASELINE_FORMAT};
use crate::error::SyncError;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 基线存储：一个同步对（本地根 + 远端目标）对应一个基线文件
pub struct BaselineStore {
    path: PathBuf,
}

impl BaselineStore {
    /// `key` 是同步对的稳定标识（配置哈希）
    pub fn new(state_dir: &Path, key: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("无法创建状态目录: {}", state_dir.display()))?;
        Ok(Self {
            path: state_dir.join(format!("baseline_{}.json", key)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取基线；文件缺失或损坏时返回 None（按首次同步处理）
    pub fn load(&self) -> Option<Baseline> {
        if !self.path.exists() {
            debug!("基线文件不存在，按首次同步处理: {}", self.path.display());
            return None;
        }

        let data = match std::fs::read(&self.path) {
            Ok(d) => d,
            Err(e) => {
                warn!("读取基线文件失败，按首次同步处理: {}", e);
                return None;
            }
        };

        let baseline: Baseline = match serde_json::from_slice(&data) {
            Ok(b) => b,
            Err(e) => {
                // 基线损坏：丢弃并退化为全量对比
                warn!("基线文件损坏，按首次同步处理: {}", e);
                let _ = std::fs::remove_file(&self.path);
                return None;
            }
        };

        if baseline.format != BASELINE_FORMAT {
            warn!(
                "基线格式版本不匹配 ({} != {})，按首次同步处理",
                baseline.format, BASELINE_FORMAT
            );
            let _ = std::fs::remove_file(&self.path);
            return None;
        }

        info!("已加载基线: {} 个条目", baseline.len());
        Some(baseline)
    }

    /// 原子写入：先写临时文件再重命名
    pub fn save(&self, baseline: &Baseline) -> Result<()> {
        let data = serde_json::to_vec_pretty(baseline)?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, &data)
            .with_context(|| format!("无法写入临时基线文件: {}", temp_path.display()))?;

        // 重命名失败时清理临时文件
        let cleanup = scopeguard::guard(temp_path.clone(), |p| {
            let _ = std::fs::remove_file(&p);
        });
        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("无法替换基线文件: {}", self.path.display()))?;
        scopeguard::ScopeGuard::into_inner(cleanup);

        info!("已保存基线: {} 个条目 -> {}", baseline.len(), self.path.display());
        Ok(())
    }
}

/// 运行锁：同一状态目录上同一同步对只允许一个进程运行
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(state_dir: &Path, key: &str) -> Result<Self, SyncError> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| SyncError::Internal(anyhow::anyhow!("无法创建状态目录: {}", e)))?;

        let path = state_dir.join(format!("sync_{}.lock", key));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SyncError::Internal(anyhow::anyhow!("无法打开锁文件: {}", e)))?;

        file.try_lock_exclusive()
            .map_err(|_| SyncError::AlreadyRunning(path.display().to_string()))?;

        // 记录持有者 pid，便于排查（尽力而为）
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        debug!("已获取运行锁: {}", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("已释放运行锁: {}", self.path.display());
    }
}
