//! 快照与基线数据模型

use crate::storage::{Entry, EntryKind};
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;

/// 修改时间容差（秒），兼容低分辨率文件系统
pub const TIME_TOLERANCE_SECS: i64 = 2;

/// 基线文件格式版本，不匹配时按基线缺失处理
pub const BASELINE_FORMAT: u32 = 1;

/// 单侧快照：按路径有序，路径唯一
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    entries: BTreeMap<String, Entry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入条目，返回被替换的旧条目（路径重复时）
    pub fn insert(&mut self, entry: Entry) -> Option<Entry> {
        self.entries.insert(entry.path.clone(), entry)
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Entry> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// 指定路径的所有后代（不含自身），按路径有序
    pub fn descendants<'a>(&'a self, path: &str) -> impl Iterator<Item = &'a Entry> {
        let prefix = format!("{}/", path);
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(p, _)| p.starts_with(&prefix))
            .map(|(_, e)| e)
    }
}

impl FromIterator<Entry> for Snapshot {
    fn from_iter<T: IntoIterator<Item = Entry>>(iter: T) -> Self {
        let mut snapshot = Snapshot::new();
        for entry in iter {
            snapshot.insert(entry);
        }
        snapshot
    }
}

/// 基线条目：上次成功同步结束时两侧的观测
///
/// 内容标识两侧各自独立（本地哈希与远端 etag 永远不可互比），
/// 变化判定只在同侧之间进行。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineEntry {
    pub kind: EntryKind,
    /// 本地侧大小与修改时间
    pub size: u64,
    pub modified: i64,
    /// 本地内容标识（blake3 快速哈希）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    /// 远端内容标识（etag）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// 远端侧大小与修改时间（etag 缺失时的退化标识）
    pub remote_size: u64,
    pub remote_modified: i64,
}

impl BaselineEntry {
    /// 由两侧当前观测构造
    pub fn from_sides(local: &Entry, remote: &Entry) -> Self {
        Self {
            kind: local.kind,
            size: local.size,
            modified: local.modified,
            local_id: local.content_id.clone(),
            remote_id: remote.content_id.clone(),
            remote_size: remote.size,
            remote_modified: remote.modified,
        }
    }

    /// 本地侧相对基线是否已变化（哈希优先，退化为大小+时间）
    pub fn local_changed(&self, current: &Entry) -> bool {
        if current.kind != self.kind {
            return true;
        }
        if current.kind == EntryKind::Directory {
            return false;
        }
        match (&current.content_id, &self.local_id) {
            (Some(a), Some(b)) => a != b,
            _ => {
                current.size != self.size
                    || (current.modified - self.modified).abs() > TIME_TOLERANCE_SECS
            }
        }
    }

    /// 远端侧相对基线是否已变化
    pub fn remote_changed(&self, current: &Entry) -> bool {
        if current.kind != self.kind {
            return true;
        }
        if current.kind == EntryKind::Directory {
            return false;
        }
        match (&current.content_id, &self.remote_id) {
            (Some(a), Some(b)) => a != b,
            _ => {
                current.size != self.remote_size
                    || (current.modified - self.remote_modified).abs() > TIME_TOLERANCE_SECS
            }
        }
    }
}

/// 基线：上次成功同步的两侧清单，三向对比的参照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    /// 格式版本
    pub format: u32,
    /// 保存时间（Unix 秒）
    pub saved_at: i64,
    entries: BTreeMap<String, BaselineEntry>,
}

impl Default for Baseline {
    fn default() -> Self {
        Self {
            format: BASELINE_FORMAT,
            saved_at: 0,
            entries: BTreeMap::new(),
        }
    }
}

impl Baseline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&BaselineEntry> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, path: String, entry: BaselineEntry) {
        self.entries.insert(path, entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<BaselineEntry> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, BaselineEntry> {
        self.entries.iter()
    }
}
