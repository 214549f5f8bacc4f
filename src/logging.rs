//! 日志初始化

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// 是否启用日志记录
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 初始化日志系统：文件按天滚动，控制台输出到 stderr。
/// 返回的 guard 需要持有到进程结束，否则缓冲日志会丢失。
pub fn init_logging(
    config: &LogConfig,
    log_dir: &Path,
    debug: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    if !config.enabled && !debug {
        // 日志已禁用，只挂一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let level = if debug {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };

    let env_filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap())
        .add_directive("opendal=warn".parse().unwrap());

    if std::fs::create_dir_all(log_dir).is_ok() {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);

        let file_appender = tracing_appender::rolling::daily(log_dir, "davsync.log");
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(false);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
        Some(guard)
    } else {
        // 文件日志目录创建失败，回退到控制台
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_level_parsing() {
        let mut config = LogConfig::default();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
        config.level = "debug".to_string();
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        config.level = "bogus".to_string();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }
}
