//! 目录树遍历：生成单侧快照

use crate::core::snapshot::Snapshot;
use crate::error::StorageError;
use crate::storage::{EntryKind, Storage, StorageResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// 小于该值的文件做完整哈希
const FULL_HASH_LIMIT: u64 = 64 * 1024;
/// 采样哈希的分块大小
const SAMPLE_CHUNK: u64 = 16 * 1024;

/// 遍历配置
#[derive(Debug, Clone)]
pub struct WalkConfig {
    /// 排除规则（glob patterns）
    pub exclude_patterns: Vec<String>,
    /// 最大文件大小（0 表示不限制）
    pub max_file_size: u64,
    /// 是否为文件计算内容哈希（本地侧开启；远端由 etag 提供标识）
    pub compute_hashes: bool,
    /// 哈希计算的最大并发数
    pub max_concurrent: usize,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: vec![
                // 常见的排除模式
                ".git/**".to_string(),
                ".svn/**".to_string(),
                "node_modules/**".to_string(),
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                "*.tmp".to_string(),
                "*.temp".to_string(),
                "~*".to_string(),
            ],
            max_file_size: 0,
            compute_hashes: false,
            max_concurrent: 8,
        }
    }
}

/// 遍历结果：快照 + 逐条目警告
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub snapshot: Snapshot,
    pub warnings: Vec<String>,
}

/// 目录树遍历器
pub struct TreeWalker {
    config: WalkConfig,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl TreeWalker {
    pub fn new(config: WalkConfig) -> Self {
        Self {
            config,
            cancel_flag: None,
        }
    }

    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(cancel_flag);
        self
    }

    /// 检查是否已取消
    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// 检查路径是否应该被排除
    fn should_exclude(&self, path: &str) -> bool {
        self.config
            .exclude_patterns
            .iter()
            .any(|pattern| Self::matches_pattern(path, pattern))
    }

    /// 简单的 glob 模式匹配
    fn matches_pattern(path: &str, pattern: &str) -> bool {
        let path = path.to_lowercase();
        let pattern = pattern.to_lowercase();

        // 处理 ** 通配符
        if pattern.contains("**") {
            let parts: Vec<&str> = pattern.split("**").collect();
            if parts.len() == 2 {
                let prefix = parts[0].trim_end_matches('/');
                let suffix = parts[1].trim_start_matches('/');

                if prefix.is_empty() && suffix.is_empty() {
                    return true;
                }

                if !prefix.is_empty() && !path.starts_with(prefix) {
                    return false;
                }

                if !suffix.is_empty() && !path.ends_with(suffix) {
                    return false;
                }

                return true;
            }
        }

        // 处理 * 通配符
        if pattern.contains('*') {
            let regex_pattern = pattern.replace('.', "\\.").replace('*', ".*");

            if let Ok(re) = regex::Regex::new(&format!("^{}$", regex_pattern)) {
                return re.is_match(&path);
            }
        }

        // 精确匹配
        path == pattern || path.ends_with(&format!("/{}", pattern))
    }

    /// 遍历存储，产出该侧快照
    pub async fn walk(&self, storage: Arc<dyn Storage>) -> StorageResult<WalkOutcome> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        info!("开始扫描: {}", storage.name());

        let listing = storage.list_files(None).await?;
        debug!(
            "list_files 返回 {} 个条目, {} 条警告",
            listing.entries.len(),
            listing.warnings.len()
        );

        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let mut outcome = WalkOutcome {
            snapshot: Snapshot::new(),
            warnings: listing.warnings,
        };
        let mut excluded_count = 0;

        for entry in listing.entries {
            // 每处理一定数量检查一次取消状态
            if outcome.snapshot.len() % 100 == 0 && self.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            if self.should_exclude(&entry.path) {
                debug!("排除条目: {}", entry.path);
                excluded_count += 1;
                continue;
            }

            if self.config.max_file_size > 0
                && !entry.is_dir()
                && entry.size > self.config.max_file_size
            {
                debug!("跳过大文件: {} ({})", entry.path, entry.size);
                excluded_count += 1;
                continue;
            }

            if let Some(old) = outcome.snapshot.insert(entry) {
                outcome
                    .warnings
                    .push(format!("重复路径，保留后出现的条目: {}", old.path));
            }
        }

        if self.config.compute_hashes {
            self.hash_files(storage.clone(), &mut outcome).await?;
        }

        info!(
            "扫描完成: {} - {} 个条目, {} 个被排除, {} 条警告",
            storage.name(),
            outcome.snapshot.len(),
            excluded_count,
            outcome.warnings.len()
        );

        Ok(outcome)
    }

    /// 为快照中没有内容标识的文件并发计算采样哈希
    async fn hash_files(
        &self,
        storage_arc: Arc<dyn Storage>,
        outcome: &mut WalkOutcome,
    ) -> StorageResult<()> {
        let pending: Vec<(String, u64)> = outcome
            .snapshot
            .iter()
            .filter(|(_, e)| e.kind == EntryKind::File && e.content_id.is_none())
            .map(|(p, e)| (p.clone(), e.size))
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        debug!("计算 {} 个文件的内容哈希...", pending.len());

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut handles = Vec::new();

        for (path, size) in pending {
            if self.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let storage = storage_arc.clone();

            let handle = tokio::spawn(async move {
                let result = sampled_hash(storage.as_ref(), &path, size).await;
                drop(permit);
                (path, result)
            });

            handles.push(handle);
        }

        for handle in handles {
            match handle.await {
                Ok((path, Ok(hash))) => {
                    if let Some(entry) = outcome.snapshot.get(&path) {
                        let mut entry = entry.clone();
                        entry.content_id = Some(hash);
                        outcome.snapshot.insert(entry);
                    }
                }
                Ok((path, Err(e))) => {
                    // 读不了的文件从快照剔除，不中断整个遍历
                    warn!("读取文件失败，跳过: {} - {}", path, e);
                    outcome.warnings.push(format!("读取失败: {} - {}", path, e));
                    outcome.snapshot.remove(&path);
                }
                Err(e) => {
                    outcome.warnings.push(format!("哈希任务失败: {}", e));
                }
            }
        }

        Ok(())
    }
}

impl Default for TreeWalker {
    fn default() -> Self {
        Self::new(WalkConfig::default())
    }
}

/// 计算内容的快速哈希（完整内容，截断十六进制）
pub fn quick_hash(data: &[u8]) -> String {
    let len = data.len() as u64;
    if len <= FULL_HASH_LIMIT {
        return hash_bytes(data);
    }

    // 大文件：采样哈希（头部 + 中部 + 尾部 + 大小）
    let chunk = SAMPLE_CHUNK as usize;
    let mid = data.len() / 2;
    let mut hasher = blake3::Hasher::new();
    hasher.update(&data[..chunk]);
    hasher.update(&data[mid - chunk / 2..mid + chunk / 2]);
    hasher.update(&data[data.len() - chunk..]);
    hasher.update(&len.to_le_bytes());
    hasher.finalize().to_hex()[..32].to_string()
}

/// 完整 blake3 哈希（只取前 32 个十六进制字符，足够检测变化）
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex()[..32].to_string()
}

/// 通过范围读取计算采样哈希，与 [`quick_hash`] 对同一内容产出相同结果
pub async fn sampled_hash(storage: &dyn Storage, path: &str, size: u64) -> StorageResult<String> {
    if size <= FULL_HASH_LIMIT {
        let data = storage.read(path).await?;
        return Ok(hash_bytes(&data));
    }

    let mid = size / 2;
    let head = storage.read_range(path, 0, SAMPLE_CHUNK).await?;
    let middle = storage
        .read_range(path, mid - SAMPLE_CHUNK / 2, SAMPLE_CHUNK)
        .await?;
    let tail = storage
        .read_range(path, size - SAMPLE_CHUNK, SAMPLE_CHUNK)
        .await?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(&head);
    hasher.update(&middle);
    hasher.update(&tail);
    hasher.update(&size.to_le_bytes());
    Ok(hasher.finalize().to_hex()[..32].to_string())
}
