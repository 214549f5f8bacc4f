//! davsync 命令行入口
//!
//! 命令行只做薄薄一层：合并配置、初始化日志、启动会话并把
//! 运行结果映射为退出码。优先级：命令行参数 > 环境变量 > 配置文件。

use clap::Parser;
use davsync::config::SyncSettings;
use davsync::core::{ProgressEvent, RunStatus, SyncSession};
use davsync::logging;
use std::path::PathBuf;
use tracing::{error, warn};

/// 通过 WebDAV 服务器在机器之间同步目录
#[derive(Parser)]
#[command(name = "davsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 配置文件路径（JSON）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 服务器用户名
    #[arg(short, long)]
    user: Option<String>,

    /// 服务器密码（也可用环境变量 DAVSYNC_PASSWORD 提供）
    #[arg(short, long)]
    pass: Option<String>,

    /// 服务器地址
    #[arg(long)]
    url: Option<String>,

    /// 本地同步目录
    #[arg(short, long)]
    src: Option<String>,

    /// 服务器上的目标目录
    #[arg(short, long)]
    dst: Option<String>,

    /// 接受的服务器 SSL 指纹
    #[arg(long = "ssl")]
    ssl_fingerprint: Option<String>,

    /// 只计算并展示计划，不执行任何动作
    #[arg(long)]
    dry_run: bool,

    /// 输出调试日志
    #[arg(long)]
    debug: bool,

    /// 以 JSON 形式输出最终报告
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let mut settings = match SyncSettings::load(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e);
            return e.exit_code();
        }
    };

    // 环境变量覆盖配置文件，命令行参数覆盖两者
    settings.apply_env();
    if let Some(user) = cli.user {
        settings.user = user;
    }
    if let Some(pass) = cli.pass {
        settings.password = Some(pass);
    }
    if let Some(url) = cli.url {
        settings.url = url;
    }
    if let Some(src) = cli.src {
        settings.src = src;
    }
    if let Some(dst) = cli.dst {
        settings.dst = dst;
    }
    if let Some(fp) = cli.ssl_fingerprint {
        settings.ssl_fingerprint = Some(fp);
    }
    settings.dry_run = cli.dry_run;

    let _log_guard = logging::init_logging(&settings.log, &settings.log_dir(), cli.debug);

    if let Err(e) = settings.validate() {
        error!("{}", e);
        return e.exit_code();
    }

    let session = SyncSession::new(settings);

    // Ctrl-C 触发取消：停止下发新动作，进行中的动作完成后收尾
    let cancel_flag = session.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消同步...");
            cancel_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    // 进度事件：人类可读输出走 stdout，日志走 stderr 与文件
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ProgressEvent>(64);
    let json = cli.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if json {
                // JSON 模式只输出最终报告
                continue;
            }
            match event {
                ProgressEvent::Planned { summary, actions } => {
                    println!("计划 {} 个动作:", summary.total_actions());
                    for action in &actions {
                        match &action.conflict_name {
                            Some(name) => {
                                println!("  {:<16} {} -> {}", action.kind.to_string(), action.path, name)
                            }
                            None => println!("  {:<16} {}", action.kind.to_string(), action.path),
                        }
                    }
                }
                ProgressEvent::ActionCommitted { path, kind } => {
                    println!("完成 {:<16} {}", kind.to_string(), path);
                }
                ProgressEvent::ActionFailed { path, kind, reason } => {
                    println!("失败 {:<16} {} ({})", kind.to_string(), path, reason);
                }
                _ => {}
            }
        }
    });

    let result = session.run(Some(tx)).await;
    let _ = printer.await;

    match result {
        Ok(report) => {
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(s) => println!("{}", s),
                    Err(e) => error!("序列化报告失败: {}", e),
                }
            } else {
                let label = match report.status {
                    RunStatus::Completed => "同步完成",
                    RunStatus::Partial => "部分失败",
                    RunStatus::Cancelled => "已取消",
                    RunStatus::DryRun => "dry-run 结束",
                };
                println!(
                    "{}: 提交 {}, 失败 {}, 跳过 {}, 冲突 {}, 传输 {} 字节",
                    label,
                    report.committed,
                    report.failed,
                    report.skipped,
                    report.conflicts,
                    report.bytes_transferred
                );
            }
            report.exit_code()
        }
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}
