use super::{normalize_path, Entry, EntryKind, Listing, Storage, StorageResult};
use crate::error::StorageError;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use walkdir::WalkDir;

/// 本地文件系统存储
pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: &str) -> StorageResult<Self> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", path);
        Ok(Self { base_path, name })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    fn map_io(path: &str, e: std::io::Error) -> StorageError {
        match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                StorageError::Unauthorized(format!("{}: {}", path, e))
            }
            _ => StorageError::Io(e),
        }
    }

    fn entry_from_metadata(path: String, metadata: &std::fs::Metadata) -> Entry {
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode() & 0o7777)
        };
        #[cfg(not(unix))]
        let permissions = None;

        Entry {
            path,
            kind: if metadata.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified,
            content_id: None,
            permissions,
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn list_files(&self, prefix: Option<&str>) -> StorageResult<Listing> {
        let base = prefix.map_or_else(|| self.base_path.clone(), |p| self.resolve_path(p));

        if !base.exists() {
            return Ok(Listing::default());
        }

        let base_path = self.base_path.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let listing = tokio::task::spawn_blocking(move || -> StorageResult<Listing> {
            let mut listing = Listing::default();

            for item in WalkDir::new(&base).follow_links(false) {
                let entry = match item {
                    Ok(e) => e,
                    // 根目录本身不可读必须失败，否则会被误判成空树
                    Err(e) if e.depth() == 0 => {
                        return Err(match e.into_io_error() {
                            Some(io) => Self::map_io(&base.display().to_string(), io),
                            None => StorageError::NotFound(base.display().to_string()),
                        });
                    }
                    Err(e) => {
                        // 单个条目不可读不中断整个遍历
                        listing.warnings.push(format!("无法访问条目: {}", e));
                        continue;
                    }
                };

                let path = entry.path();
                let relative = match path.strip_prefix(&base_path).ok().and_then(|p| p.to_str()) {
                    Some(p) => normalize_path(p),
                    None => {
                        listing
                            .warnings
                            .push(format!("路径无法转换为 UTF-8: {}", path.display()));
                        continue;
                    }
                };

                // 跳过根目录本身
                if relative.is_empty() {
                    continue;
                }

                // 符号链接不跟随，跳过并警告（避免环）
                if entry.file_type().is_symlink() {
                    listing
                        .warnings
                        .push(format!("跳过符号链接: {}", relative));
                    continue;
                }

                match entry.metadata() {
                    Ok(metadata) => listing
                        .entries
                        .push(Self::entry_from_metadata(relative, &metadata)),
                    Err(e) => {
                        listing
                            .warnings
                            .push(format!("读取元数据失败: {} - {}", relative, e));
                    }
                }
            }

            Ok(listing)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;

        Ok(listing)
    }

    async fn stat(&self, path: &str) -> StorageResult<Option<Entry>> {
        let full_path = self.resolve_path(path);

        match fs::metadata(&full_path).await {
            Ok(metadata) => Ok(Some(Self::entry_from_metadata(
                normalize_path(path),
                &metadata,
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::map_io(path, e)),
        }
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        fs::read(self.resolve_path(path))
            .await
            .map_err(|e| Self::map_io(path, e))
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> StorageResult<Vec<u8>> {
        let full_path = self.resolve_path(path);
        let mut file = fs::File::open(&full_path)
            .await
            .map_err(|e| Self::map_io(path, e))?;

        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; length as usize];
        match file.read_exact(&mut buffer).await {
            Ok(_) => Ok(buffer),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // 文件剩余内容不足 length，读取实际可用的数据
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buffer = Vec::new();
                file.read_to_end(&mut buffer).await?;
                Ok(buffer)
            }
            Err(e) => Err(Self::map_io(path, e)),
        }
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        let full_path = self.resolve_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 先写临时文件再原子重命名，崩溃不会留下半写的文件
        let temp_path = full_path.with_extension("davsync-tmp");
        fs::write(&temp_path, data)
            .await
            .map_err(|e| Self::map_io(path, e))?;
        fs::rename(&temp_path, &full_path)
            .await
            .map_err(|e| Self::map_io(path, e))?;

        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let full_path = self.resolve_path(path);

        if !full_path.exists() {
            return Ok(());
        }

        if full_path.is_dir() {
            fs::remove_dir_all(&full_path)
                .await
                .map_err(|e| Self::map_io(path, e))?;
        } else {
            fs::remove_file(&full_path)
                .await
                .map_err(|e| Self::map_io(path, e))?;
        }

        Ok(())
    }

    async fn create_dir(&self, path: &str) -> StorageResult<()> {
        fs::create_dir_all(self.resolve_path(path))
            .await
            .map_err(|e| Self::map_io(path, e))?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let to_path = self.resolve_path(to);
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.resolve_path(from), &to_path)
            .await
            .map_err(|e| Self::map_io(from, e))?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &tempfile::TempDir) -> LocalStorage {
        LocalStorage::new(dir.path().to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(&dir);

        s.write("sub/a.txt", b"hello".to_vec()).await.unwrap();
        assert_eq!(s.read("sub/a.txt").await.unwrap(), b"hello");

        // 临时文件不应残留
        let listing = s.list_files(None).await.unwrap();
        assert!(listing
            .entries
            .iter()
            .all(|e| !e.path.ends_with("davsync-tmp")));
    }

    #[tokio::test]
    async fn test_list_includes_dirs_and_normalized_paths() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(&dir);
        s.write("a/b/c.txt", b"x".to_vec()).await.unwrap();

        let listing = s.list_files(None).await.unwrap();
        let mut paths: Vec<_> = listing.entries.iter().map(|e| e.path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec!["a", "a/b", "a/b/c.txt"]);

        let dir_entry = listing.entries.iter().find(|e| e.path == "a").unwrap();
        assert!(dir_entry.is_dir());
        assert_eq!(dir_entry.size, 0);
    }

    #[tokio::test]
    async fn test_stat_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(&dir);
        assert!(s.stat("nope.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_range_clamps_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(&dir);
        s.write("r.bin", b"0123456789".to_vec()).await.unwrap();

        assert_eq!(s.read_range("r.bin", 2, 3).await.unwrap(), b"234");
        assert_eq!(s.read_range("r.bin", 8, 100).await.unwrap(), b"89");
    }

    #[tokio::test]
    async fn test_rename_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(&dir);
        s.write("x.txt", b"v".to_vec()).await.unwrap();
        s.rename("x.txt", "kept/x.txt.conflict-20250101-000000")
            .await
            .unwrap();

        assert!(s.stat("x.txt").await.unwrap().is_none());
        assert_eq!(
            s.read("kept/x.txt.conflict-20250101-000000").await.unwrap(),
            b"v"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_skipped_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(&dir);
        s.write("real.txt", b"x".to_vec()).await.unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let listing = s.list_files(None).await.unwrap();
        assert!(listing.entries.iter().all(|e| e.path != "link.txt"));
        assert!(listing.warnings.iter().any(|w| w.contains("link.txt")));
    }
}
