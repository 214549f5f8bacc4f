//! 错误类型与进程退出码

use thiserror::Error;

/// 存储层错误（本地与远端共用）
#[derive(Debug, Error)]
pub enum StorageError {
    /// 凭据被服务器拒绝
    #[error("认证失败: {0}")]
    Unauthorized(String),
    /// 路径不存在
    #[error("路径不存在: {0}")]
    NotFound(String),
    /// 单次调用超时
    #[error("操作超时: {0}")]
    Timeout(String),
    /// 服务器限流
    #[error("请求被限流: {0}")]
    RateLimited(String),
    /// 其他远端错误
    #[error("远端错误 ({code}): {message}")]
    Remote { code: String, message: String },
    /// 本地 IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
    /// 操作已取消
    #[error("操作已取消")]
    Cancelled,
}

impl StorageError {
    /// 是否属于可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Timeout(_) | StorageError::RateLimited(_) => true,
            StorageError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::WouldBlock
            ),
            StorageError::Remote { message, .. } => {
                // 服务器端临时故障按瞬时处理
                let m = message.to_lowercase();
                m.contains("500")
                    || m.contains("502")
                    || m.contains("503")
                    || m.contains("504")
                    || m.contains("connection")
                    || m.contains("reset by peer")
                    || m.contains("broken pipe")
            }
            _ => false,
        }
    }
}

impl From<opendal::Error> for StorageError {
    fn from(e: opendal::Error) -> Self {
        use opendal::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(e.to_string()),
            ErrorKind::PermissionDenied => StorageError::Unauthorized(e.to_string()),
            ErrorKind::RateLimited => StorageError::RateLimited(e.to_string()),
            kind => StorageError::Remote {
                code: kind.to_string(),
                message: e.to_string(),
            },
        }
    }
}

/// 会话级错误：仅用于在任何传播动作开始前中止整个运行
#[derive(Debug, Error)]
pub enum SyncError {
    /// 配置缺失或不合法
    #[error("配置错误: {0}")]
    Config(String),
    /// 服务器拒绝了凭据
    #[error("认证失败: {0}")]
    Auth(String),
    /// 远端整体不可达（连接、超时、目录缺失且无法创建）
    #[error("远端不可达: {0}")]
    RemoteUnreachable(String),
    /// 同一状态目录上已有同步进程
    #[error("另一个同步进程正在运行 (锁文件: {0})")]
    AlreadyRunning(String),
    /// 其他意外错误
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// 进程退出码
pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_AUTH: i32 = 3;
pub const EXIT_UNREACHABLE: i32 = 4;
pub const EXIT_PARTIAL: i32 = 5;

impl SyncError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Config(_) => EXIT_CONFIG,
            SyncError::Auth(_) => EXIT_AUTH,
            SyncError::RemoteUnreachable(_) => EXIT_UNREACHABLE,
            SyncError::AlreadyRunning(_) | SyncError::Internal(_) => EXIT_FAILURE,
        }
    }

    /// 把远端探测阶段的存储错误归类为会话级错误
    pub fn from_remote_probe(e: StorageError) -> Self {
        match e {
            StorageError::Unauthorized(msg) => SyncError::Auth(msg),
            other => SyncError::RemoteUnreachable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Timeout("stat".into()).is_transient());
        assert!(StorageError::RateLimited("429".into()).is_transient());
        assert!(StorageError::Remote {
            code: "Unexpected".into(),
            message: "HTTP 503 Service Unavailable".into()
        }
        .is_transient());
        assert!(!StorageError::NotFound("a.txt".into()).is_transient());
        assert!(!StorageError::Unauthorized("401".into()).is_transient());
        assert!(!StorageError::Remote {
            code: "Unexpected".into(),
            message: "HTTP 400 Bad Request".into()
        }
        .is_transient());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SyncError::Config("x".into()).exit_code(), EXIT_CONFIG);
        assert_eq!(SyncError::Auth("x".into()).exit_code(), EXIT_AUTH);
        assert_eq!(
            SyncError::RemoteUnreachable("x".into()).exit_code(),
            EXIT_UNREACHABLE
        );
        assert_eq!(
            SyncError::AlreadyRunning("LOCK".into()).exit_code(),
            EXIT_FAILURE
        );
    }

    #[test]
    fn test_remote_probe_mapping() {
        let auth = SyncError::from_remote_probe(StorageError::Unauthorized("401".into()));
        assert!(matches!(auth, SyncError::Auth(_)));

        let timeout = SyncError::from_remote_probe(StorageError::Timeout("connect".into()));
        assert!(matches!(timeout, SyncError::RemoteUnreachable(_)));
    }
}
