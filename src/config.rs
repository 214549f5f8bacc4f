//! 运行配置与凭据
//!
//! 凭据解析发生在引擎之外：配置文件、命令行与环境变量合并为
//! [`SyncSettings`]，引擎本身从不交互式询问。凭据通过
//! [`CredentialProvider`] 显式传入传输层构造，不使用全局状态。

use crate::core::propagator::PropagateConfig;
use crate::core::walker::WalkConfig;
use crate::error::SyncError;
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 日志与调试输出里代替密码的占位串
pub const PASSWORD_SAFE: &str = "********";

/// 密码的环境变量来源
pub const PASSWORD_ENV: &str = "DAVSYNC_PASSWORD";

/// 凭据提供者
pub trait CredentialProvider: Send + Sync {
    fn username(&self) -> String;
    fn password(&self) -> String;
    fn ssl_fingerprint(&self) -> Option<String>;
}

/// 静态凭据（由配置解析得到）
#[derive(Clone)]
pub struct StaticCredentials {
    pub username: String,
    pub password: String,
    pub ssl_fingerprint: Option<String>,
}

impl CredentialProvider for StaticCredentials {
    fn username(&self) -> String {
        self.username.clone()
    }

    fn password(&self) -> String {
        self.password.clone()
    }

    fn ssl_fingerprint(&self) -> Option<String> {
        self.ssl_fingerprint.clone()
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("username", &self.username)
            .field("password", &PASSWORD_SAFE)
            .field("ssl_fingerprint", &self.ssl_fingerprint)
            .finish()
    }
}

fn default_dav_path() -> String {
    "remote.php/webdav".to_string()
}

fn default_dst() -> String {
    "clientsync".to_string()
}

fn default_auto_create_remote() -> bool {
    true
}

/// 同步设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// 服务器地址，例如 https://cloud.example.org
    pub url: String,
    /// 服务器上的 DAV 路径
    pub dav_path: String,
    /// 服务器用户名
    pub user: String,
    /// 密码；也可由环境变量提供
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// 本地同步目录
    pub src: String,
    /// 服务器上的目标目录
    pub dst: String,
    /// SSL 指纹覆盖
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_fingerprint: Option<String>,
    /// 额外的排除规则
    pub exclude: Vec<String>,
    /// 跳过超过该大小的文件（0 表示不限制）
    pub max_file_size: u64,
    /// 远端目标目录缺失时是否自动创建
    pub auto_create_remote: bool,
    /// 传输参数
    pub transfer: PropagateConfig,
    /// 日志配置
    pub log: LogConfig,
    /// 状态与日志目录覆盖
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// 只计算并展示计划，不执行
    #[serde(skip)]
    pub dry_run: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            dav_path: default_dav_path(),
            user: String::new(),
            password: None,
            src: String::new(),
            dst: default_dst(),
            ssl_fingerprint: None,
            exclude: Vec::new(),
            max_file_size: 0,
            auto_create_remote: default_auto_create_remote(),
            transfer: PropagateConfig::default(),
            log: LogConfig::default(),
            data_dir: None,
            dry_run: false,
        }
    }
}

impl SyncSettings {
    /// 从配置文件加载；`path` 为空时尝试默认位置，文件缺失时返回默认值
    pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (
                crate::dirs::config_dir()
                    .map(|d| d.join("davsync").join("config.json"))
                    .unwrap_or_else(|| PathBuf::from(".davsync/config.json")),
                false,
            ),
        };

        if !file.exists() {
            if required {
                return Err(SyncError::Config(format!(
                    "配置文件不存在: {}",
                    file.display()
                )));
            }
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&file)
            .map_err(|e| SyncError::Config(format!("无法读取配置文件 {}: {}", file.display(), e)))?;
        let settings: SyncSettings = serde_json::from_str(&content)
            .map_err(|e| SyncError::Config(format!("配置文件格式错误 {}: {}", file.display(), e)))?;

        tracing::debug!("已加载配置文件: {}", file.display());
        Ok(settings)
    }

    /// 应用环境变量（环境变量优先于配置文件）
    pub fn apply_env(&mut self) {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            tracing::debug!("密码来自环境变量 {}", PASSWORD_ENV);
            self.password = Some(password);
        }
    }

    /// 校验必填项
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.url.is_empty() {
            return Err(SyncError::Config(
                "必须指定服务器地址（--url 或配置文件 url）".to_string(),
            ));
        }
        if self.user.is_empty() {
            return Err(SyncError::Config(
                "必须指定用户名（--user 或配置文件 user）".to_string(),
            ));
        }
        if self.src.is_empty() {
            return Err(SyncError::Config(
                "必须指定本地目录（--src 或配置文件 src）".to_string(),
            ));
        }
        if self.dst.is_empty() {
            return Err(SyncError::Config("远端目录不能为空".to_string()));
        }
        if self.password.as_deref().unwrap_or("").is_empty() {
            return Err(SyncError::Config(format!(
                "必须提供密码（--pass、配置文件 password 或环境变量 {}）",
                PASSWORD_ENV
            )));
        }
        Ok(())
    }

    /// 拼接 DAV 端点：地址与 DAV 路径之间恰好一个斜杠，末尾不带斜杠
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            self.dav_path.trim_matches('/')
        )
    }

    /// 远端根目录（opendal root 形式）
    pub fn remote_root(&self) -> String {
        format!("/{}", self.dst.trim_matches('/'))
    }

    pub fn credentials(&self) -> StaticCredentials {
        StaticCredentials {
            username: self.user.clone(),
            password: self.password.clone().unwrap_or_default(),
            ssl_fingerprint: self.ssl_fingerprint.clone(),
        }
    }

    /// 同步对的稳定标识（基线与锁文件按它分键）
    pub fn pair_key(&self) -> String {
        let input = format!("{}|{}|{}", self.endpoint(), self.dst, self.src);
        blake3::hash(input.as_bytes()).to_hex()[..16].to_string()
    }

    /// 状态与日志的根目录
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            crate::dirs::config_dir()
                .map(|d| d.join("davsync"))
                .unwrap_or_else(|| PathBuf::from(".davsync"))
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir().join("state")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    /// 遍历配置：默认排除规则加上用户配置的规则
    pub fn walk_config(&self, compute_hashes: bool) -> WalkConfig {
        let mut config = WalkConfig {
            compute_hashes,
            max_file_size: self.max_file_size,
            ..Default::default()
        };
        config.exclude_patterns.extend(self.exclude.iter().cloned());
        config
    }
}
