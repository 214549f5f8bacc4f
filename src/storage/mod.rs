pub mod local;
pub mod webdav;

use crate::error::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use local::LocalStorage;
pub use webdav::WebDavStorage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// 单侧条目（文件或目录）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// 相对路径，/ 分隔，不带前导斜杠
    pub path: String,
    pub kind: EntryKind,
    /// 字节数，目录为 0
    pub size: u64,
    /// 修改时间（Unix 秒，各侧时钟独立）
    pub modified: i64,
    /// 内容标识：本地为 blake3 快速哈希，远端为 etag，可能缺失
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    /// unix 权限位（尽力而为，非权威）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// 路径深度（根下第一层为 1）
    pub fn depth(&self) -> usize {
        path_depth(&self.path)
    }
}

/// 列表结果：成功条目与逐条失败的警告
#[derive(Debug, Default)]
pub struct Listing {
    pub entries: Vec<Entry>,
    pub warnings: Vec<String>,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// 存储抽象接口
#[async_trait]
pub trait Storage: Send + Sync {
    /// 递归列出所有条目
    async fn list_files(&self, prefix: Option<&str>) -> StorageResult<Listing>;

    /// 获取单个条目元数据，不存在时返回 None
    async fn stat(&self, path: &str) -> StorageResult<Option<Entry>>;

    /// 读取整个文件
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// 读取文件的一部分（用于采样哈希）
    async fn read_range(&self, path: &str, offset: u64, length: u64) -> StorageResult<Vec<u8>>;

    /// 写入整个文件
    async fn write(&self, path: &str, data: Vec<u8>) -> StorageResult<()>;

    /// 删除文件或目录
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// 创建目录
    async fn create_dir(&self, path: &str) -> StorageResult<()>;

    /// 重命名（默认实现：复制后删除）
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let data = self.read(from).await?;
        self.write(to, data).await?;
        self.delete(from).await
    }

    /// 检查条目是否存在
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 规范化相对路径：统一使用 /，去掉前后斜杠
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

/// 路径深度（根下第一层为 1，空路径为 0）
pub fn path_depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.matches('/').count() + 1
    }
}

/// 路径的父目录（根下条目返回 None）
pub fn parent_path(path: &str) -> Option<&str> {
    path.rfind('/').map(|i| &path[..i])
}
