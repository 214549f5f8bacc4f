//! 计划执行：按序传播动作，容忍部分失败
//!
//! 计划本身已经是拓扑有序的；执行只在同一（阶段, 深度）波次内并行，
//! 波与波之间有屏障，保证祖先条目先于后代提交。同一路径上的连续
//! 动作（冲突改名 + 写入）在一个任务里顺序执行。

use crate::core::reconciler::{Action, ActionKind};
use crate::core::session::ProgressEvent;
use crate::core::snapshot::{Baseline, BaselineEntry};
use crate::core::walker::quick_hash;
use crate::error::StorageError;
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

/// 执行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PropagateConfig {
    /// 最大并发传输数
    pub max_concurrent_transfers: usize,
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    pub retry_base_delay_ms: u64,
}

impl Default for PropagateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            max_retries: 5,
            retry_base_delay_ms: 2000,
        }
    }
}

/// 单个动作的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOutcome {
    Committed,
    Failed,
    Skipped,
}

/// 单个动作的执行结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub path: String,
    pub kind: ActionKind,
    pub outcome: ActionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 整个计划执行后的汇总
#[derive(Debug)]
pub struct PropagateOutcome {
    pub results: Vec<ActionResult>,
    pub committed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub bytes_transferred: u64,
    /// 提交动作后的工作基线
    pub baseline: Baseline,
}

impl PropagateOutcome {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// 动作提交后对工作基线的变更
enum BaselineUpdate {
    Upsert(String, BaselineEntry),
    Remove(String),
    Keep,
}

struct ActionDelta {
    bytes: u64,
    update: BaselineUpdate,
}

/// 传输统计
#[derive(Debug, Default)]
struct TransferStats {
    committed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    bytes_transferred: AtomicU64,
}

/// 计划执行器
pub struct Propagator {
    config: PropagateConfig,
    cancelled: Arc<AtomicBool>,
}

impl Propagator {
    pub fn new(config: PropagateConfig, cancelled: Arc<AtomicBool>) -> Self {
        Self { config, cancelled }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 按计划顺序执行全部动作
    pub async fn propagate(
        &self,
        plan: Vec<Action>,
        local: Arc<dyn Storage>,
        remote: Arc<dyn Storage>,
        working: Baseline,
        events: Option<mpsc::Sender<ProgressEvent>>,
    ) -> PropagateOutcome {
        let stats = Arc::new(TransferStats::default());
        let results = Arc::new(RwLock::new(Vec::<ActionResult>::new()));
        let baseline = Arc::new(RwLock::new(working));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_transfers));

        for wave in Self::waves(plan) {
            let mut handles = Vec::new();

            for group in wave {
                if self.is_cancelled() {
                    // 取消后不再下发新动作，已在执行的动作自然完成
                    Self::record_group_skipped(&group, "同步已取消", &stats, &results).await;
                    continue;
                }

                let permit = semaphore.clone().acquire_owned().await.unwrap();
                let local = local.clone();
                let remote = remote.clone();
                let config = self.config.clone();
                let cancelled = self.cancelled.clone();
                let stats = stats.clone();
                let results = results.clone();
                let baseline = baseline.clone();
                let events = events.clone();

                let handle = tokio::spawn(async move {
                    Self::run_group(
                        group, local, remote, config, cancelled, stats, results, baseline, events,
                    )
                    .await;
                    drop(permit);
                });

                handles.push(handle);
            }

            // 波屏障：本波全部结束后才进入下一深度
            for handle in handles {
                let _ = handle.await;
            }
        }

        let results = match Arc::try_unwrap(results) {
            Ok(lock) => lock.into_inner(),
            Err(arc) => arc.read().await.clone(),
        };
        let baseline = match Arc::try_unwrap(baseline) {
            Ok(lock) => lock.into_inner(),
            Err(arc) => arc.read().await.clone(),
        };

        PropagateOutcome {
            committed: stats.committed.load(Ordering::Relaxed) as u32,
            failed: stats.failed.load(Ordering::Relaxed) as u32,
            skipped: stats.skipped.load(Ordering::Relaxed) as u32,
            bytes_transferred: stats.bytes_transferred.load(Ordering::Relaxed),
            results,
            baseline,
        }
    }

    /// 把有序计划切成执行波：同（阶段, 深度）为一波，
    /// 波内按路径聚成组（同路径动作必须顺序执行）。
    fn waves(plan: Vec<Action>) -> Vec<Vec<Vec<Action>>> {
        let mut waves: Vec<Vec<Vec<Action>>> = Vec::new();
        let mut current_key: Option<(bool, usize)> = None;

        for action in plan {
            let key = (action.kind.is_deletion(), action.depth());
            if current_key != Some(key) {
                waves.push(Vec::new());
                current_key = Some(key);
            }
            let wave = waves.last_mut().unwrap();
            match wave.last_mut() {
                Some(group) if group[0].path == action.path => group.push(action),
                _ => wave.push(vec![action]),
            }
        }

        waves
    }

    /// 顺序执行同一路径上的动作组
    #[allow(clippy::too_many_arguments)]
    async fn run_group(
        group: Vec<Action>,
        local: Arc<dyn Storage>,
        remote: Arc<dyn Storage>,
        config: PropagateConfig,
        cancelled: Arc<AtomicBool>,
        stats: Arc<TransferStats>,
        results: Arc<RwLock<Vec<ActionResult>>>,
        baseline: Arc<RwLock<Baseline>>,
        events: Option<mpsc::Sender<ProgressEvent>>,
    ) {
        let mut abandoned = false;

        for action in group {
            if abandoned {
                // 同一路径的前置动作失败后绝不继续覆盖写入
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                results.write().await.push(ActionResult {
                    path: action.path.clone(),
                    kind: action.kind,
                    outcome: ActionOutcome::Skipped,
                    error: Some("同路径前置动作未完成".to_string()),
                });
                continue;
            }

            Self::send_event(
                &events,
                ProgressEvent::ActionStarted {
                    path: action.path.clone(),
                    kind: action.kind,
                },
            )
            .await;

            match Self::execute_with_retry(&action, local.as_ref(), remote.as_ref(), &config, &cancelled)
                .await
            {
                Ok(delta) => {
                    stats.committed.fetch_add(1, Ordering::Relaxed);
                    stats
                        .bytes_transferred
                        .fetch_add(delta.bytes, Ordering::Relaxed);

                    {
                        let mut working = baseline.write().await;
                        match delta.update {
                            BaselineUpdate::Upsert(path, entry) => working.insert(path, entry),
                            BaselineUpdate::Remove(path) => {
                                working.remove(&path);
                            }
                            BaselineUpdate::Keep => {}
                        }
                    }

                    results.write().await.push(ActionResult {
                        path: action.path.clone(),
                        kind: action.kind,
                        outcome: ActionOutcome::Committed,
                        error: None,
                    });

                    Self::send_event(
                        &events,
                        ProgressEvent::ActionCommitted {
                            path: action.path.clone(),
                            kind: action.kind,
                        },
                    )
                    .await;
                }
                Err(StorageError::Cancelled) => {
                    stats.skipped.fetch_add(1, Ordering::Relaxed);
                    results.write().await.push(ActionResult {
                        path: action.path.clone(),
                        kind: action.kind,
                        outcome: ActionOutcome::Skipped,
                        error: Some("同步已取消".to_string()),
                    });
                    abandoned = true;
                }
                Err(e) => {
                    error!("动作最终失败: {} {} - {}", action.kind, action.path, e);
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    results.write().await.push(ActionResult {
                        path: action.path.clone(),
                        kind: action.kind,
                        outcome: ActionOutcome::Failed,
                        error: Some(e.to_string()),
                    });

                    Self::send_event(
                        &events,
                        ProgressEvent::ActionFailed {
                            path: action.path.clone(),
                            kind: action.kind,
                            reason: e.to_string(),
                        },
                    )
                    .await;

                    abandoned = true;
                }
            }
        }
    }

    /// 带重试的动作执行：瞬时错误指数退避，非瞬时错误立即放弃
    async fn execute_with_retry(
        action: &Action,
        local: &dyn Storage,
        remote: &dyn Storage,
        config: &PropagateConfig,
        cancelled: &AtomicBool,
    ) -> Result<ActionDelta, StorageError> {
        for attempt in 0..=config.max_retries {
            if cancelled.load(Ordering::SeqCst) {
                return Err(StorageError::Cancelled);
            }

            match Self::execute_action(action, local, remote).await {
                Ok(delta) => return Ok(delta),
                Err(e) => {
                    if attempt < config.max_retries && e.is_transient() {
                        // 指数退避
                        let delay = config.retry_base_delay_ms * 2_u64.pow(attempt);
                        warn!(
                            "动作失败，{}ms 后重试 ({}/{}): {} - {}",
                            delay,
                            attempt + 1,
                            config.max_retries,
                            action.path,
                            e
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(StorageError::Cancelled)
    }

    /// 执行单个动作并产出对工作基线的变更
    async fn execute_action(
        action: &Action,
        local: &dyn Storage,
        remote: &dyn Storage,
    ) -> Result<ActionDelta, StorageError> {
        match action.kind {
            ActionKind::CreateRemote | ActionKind::UpdateRemote => {
                if action.entry.is_dir() {
                    remote.create_dir(&action.path).await?;
                    return Ok(ActionDelta {
                        bytes: 0,
                        update: BaselineUpdate::Upsert(
                            action.path.clone(),
                            BaselineEntry::from_sides(&action.entry, &action.entry),
                        ),
                    });
                }

                let data = local.read(&action.path).await?;
                let hash = quick_hash(&data);
                let size = data.len() as u64;

                debug!("上传: {} ({} 字节)", action.path, size);
                remote.write(&action.path, data).await?;

                // 写入后回读远端元数据，记录新的 etag
                let remote_entry = match remote.stat(&action.path).await {
                    Ok(Some(e)) => e,
                    Ok(None) | Err(_) => {
                        warn!("写入后无法读取远端元数据: {}", action.path);
                        let mut e = action.entry.clone();
                        e.size = size;
                        e.content_id = None;
                        e
                    }
                };

                let mut local_entry = action.entry.clone();
                local_entry.size = size;
                local_entry.content_id = Some(hash);

                Ok(ActionDelta {
                    bytes: size,
                    update: BaselineUpdate::Upsert(
                        action.path.clone(),
                        BaselineEntry::from_sides(&local_entry, &remote_entry),
                    ),
                })
            }

            ActionKind::CreateLocal | ActionKind::UpdateLocal => {
                if action.entry.is_dir() {
                    local.create_dir(&action.path).await?;
                    return Ok(ActionDelta {
                        bytes: 0,
                        update: BaselineUpdate::Upsert(
                            action.path.clone(),
                            BaselineEntry::from_sides(&action.entry, &action.entry),
                        ),
                    });
                }

                let data = remote.read(&action.path).await?;
                let hash = quick_hash(&data);
                let size = data.len() as u64;

                debug!("下载: {} ({} 字节)", action.path, size);
                local.write(&action.path, data).await?;

                // 写入后读取本地元数据（拿到落盘后的修改时间）
                let mut local_entry = match local.stat(&action.path).await {
                    Ok(Some(e)) => e,
                    Ok(None) | Err(_) => {
                        let mut e = action.entry.clone();
                        e.size = size;
                        e
                    }
                };
                local_entry.content_id = Some(hash);

                Ok(ActionDelta {
                    bytes: size,
                    update: BaselineUpdate::Upsert(
                        action.path.clone(),
                        BaselineEntry::from_sides(&local_entry, &action.entry),
                    ),
                })
            }

            ActionKind::DeleteLocal => {
                debug!("删除本地: {}", action.path);
                local.delete(&Self::delete_target(action)).await?;
                Ok(ActionDelta {
                    bytes: 0,
                    update: BaselineUpdate::Remove(action.path.clone()),
                })
            }

            ActionKind::DeleteRemote => {
                debug!("删除远端: {}", action.path);
                remote.delete(&Self::delete_target(action)).await?;
                Ok(ActionDelta {
                    bytes: 0,
                    update: BaselineUpdate::Remove(action.path.clone()),
                })
            }

            ActionKind::ConflictRename => {
                let Some(target) = action.conflict_name.as_deref() else {
                    return Err(StorageError::Remote {
                        code: "plan".to_string(),
                        message: format!("冲突动作缺少保留名: {}", action.path),
                    });
                };
                info!("冲突保留: {} -> {}", action.path, target);
                remote.rename(&action.path, target).await?;
                Ok(ActionDelta {
                    bytes: 0,
                    update: BaselineUpdate::Keep,
                })
            }
        }
    }

    /// 目录删除统一以 / 结尾（部分 WebDAV 服务器要求）
    fn delete_target(action: &Action) -> String {
        if action.entry.is_dir() {
            format!("{}/", action.path)
        } else {
            action.path.clone()
        }
    }

    async fn record_group_skipped(
        group: &[Action],
        reason: &str,
        stats: &TransferStats,
        results: &RwLock<Vec<ActionResult>>,
    ) {
        let mut guard = results.write().await;
        for action in group {
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            guard.push(ActionResult {
                path: action.path.clone(),
                kind: action.kind,
                outcome: ActionOutcome::Skipped,
                error: Some(reason.to_string()),
            });
        }
    }

    async fn send_event(tx: &Option<mpsc::Sender<ProgressEvent>>, event: ProgressEvent) {
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}
