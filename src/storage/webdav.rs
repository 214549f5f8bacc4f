use super::{
    normalize_path, parent_path, Entry, EntryKind, Listing, Storage, StorageResult,
    IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use crate::config::CredentialProvider;
use crate::error::StorageError;
use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::{Metakey, Operator};
use std::future::Future;
use std::time::Duration;

/// WebDAV 存储（经由 opendal）
///
/// 凭据由调用方显式传入，认证与 TLS 信任在 HTTP 层之下处理。
pub struct WebDavStorage {
    operator: Operator,
    name: String,
}

impl WebDavStorage {
    pub async fn new(
        endpoint: &str,
        credentials: &dyn CredentialProvider,
        root: Option<String>,
    ) -> StorageResult<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(&credentials.username())
            .password(&credentials.password());

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        if let Some(fp) = credentials.ssl_fingerprint() {
            // 证书校验发生在 HTTP 栈内部，这里只记录配置了指纹覆盖
            tracing::debug!("已配置 SSL 指纹覆盖: {}", fp);
        }

        let operator = Operator::new(builder)
            .map_err(StorageError::from)?
            .finish();

        let name = format!(
            "webdav://{}{}",
            endpoint.trim_end_matches('/'),
            root.as_deref()
                .map(|r| format!("/{}", r.trim_matches('/')))
                .unwrap_or_default()
        );

        Ok(Self { operator, name })
    }

    fn entry_from_meta(path: String, meta: &opendal::Metadata) -> Entry {
        Entry {
            path,
            kind: if meta.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            size: if meta.is_dir() { 0 } else { meta.content_length() },
            modified: meta.last_modified().map_or(0, |t| t.timestamp()),
            content_id: meta.etag().map(|s| s.trim_matches('"').to_string()),
            permissions: None,
        }
    }

    /// 给单次远端调用加超时
    async fn with_timeout<T, F>(secs: u64, what: &str, fut: F) -> StorageResult<T>
    where
        F: Future<Output = Result<T, opendal::Error>>,
    {
        match tokio::time::timeout(Duration::from_secs(secs), fut).await {
            Ok(result) => result.map_err(StorageError::from),
            Err(_) => Err(StorageError::Timeout(what.to_string())),
        }
    }

    /// 确保父目录存在（逐级创建，已存在的错误忽略）
    async fn ensure_parents(&self, path: &str) -> StorageResult<()> {
        if let Some(parent) = parent_path(path) {
            let mut current = String::new();
            for part in parent.split('/').filter(|s| !s.is_empty()) {
                current.push_str(part);
                current.push('/');
                let _ = self.operator.create_dir(&current).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for WebDavStorage {
    async fn list_files(&self, prefix: Option<&str>) -> StorageResult<Listing> {
        let path = prefix.unwrap_or("");
        let mut listing = Listing::default();

        let mut lister = Self::with_timeout(OP_TIMEOUT_SECS, "list", async {
            self.operator
                .lister_with(path)
                .recursive(true)
                .metakey(
                    Metakey::ContentLength | Metakey::LastModified | Metakey::Mode | Metakey::Etag,
                )
                .await
        })
        .await?;

        loop {
            let next = tokio::time::timeout(Duration::from_secs(OP_TIMEOUT_SECS), lister.try_next())
                .await
                .map_err(|_| StorageError::Timeout("list".to_string()))?;

            let entry = match next.map_err(StorageError::from)? {
                Some(e) => e,
                None => break,
            };

            let raw = entry.path().to_string();
            // 跳过根目录
            if raw.is_empty() || raw == "/" {
                continue;
            }

            let meta = entry.metadata();
            listing
                .entries
                .push(Self::entry_from_meta(normalize_path(&raw), meta));
        }

        Ok(listing)
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<Entry>> {
        match tokio::time::timeout(
            Duration::from_secs(OP_TIMEOUT_SECS),
            self.operator.stat(path),
        )
        .await
        {
            Ok(Ok(meta)) => Ok(Some(Self::entry_from_meta(normalize_path(path), &meta))),
            Ok(Err(e)) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(StorageError::Timeout(format!("stat {}", path))),
        }
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let data = Self::with_timeout(IO_TIMEOUT_SECS, "read", self.operator.read(path)).await?;
        Ok(data.to_vec())
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> StorageResult<Vec<u8>> {
        let data = Self::with_timeout(IO_TIMEOUT_SECS, "read_range", async {
            self.operator
                .read_with(path)
                .range(offset..offset + length)
                .await
        })
        .await?;
        Ok(data.to_vec())
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        let path = normalize_path(path);
        self.ensure_parents(&path).await?;
        Self::with_timeout(IO_TIMEOUT_SECS, "write", self.operator.write(&path, data)).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        // 目录路径由调用方以 / 结尾传入（部分服务器要求）
        match Self::with_timeout(OP_TIMEOUT_SECS, "delete", self.operator.delete(path)).await {
            Ok(_) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_dir(&self, path: &str) -> StorageResult<()> {
        let dir_path = if path.is_empty() || path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        self.ensure_parents(&dir_path).await?;
        Self::with_timeout(
            OP_TIMEOUT_SECS,
            "create_dir",
            self.operator.create_dir(&dir_path),
        )
        .await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        match Self::with_timeout(OP_TIMEOUT_SECS, "rename", self.operator.rename(from, to)).await
        {
            Ok(_) => Ok(()),
            // 服务器不支持 MOVE 时退化为复制加删除
            Err(StorageError::Remote { code, .. }) if code.contains("Unsupported") => {
                let data = self.read(from).await?;
                self.write(to, data).await?;
                self.delete(from).await
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
