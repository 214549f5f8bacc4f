//! 同步会话：编排 遍历 → 对比 → 传播
//!
//! 一次运行持有全部快照与计划的生命周期；基线只在传播器确认提交
//! 之后、由本模块在运行结尾一次性写回。配置/认证/远端整体不可达
//! 在任何传播动作开始之前中止运行，此时基线保持原样。

use crate::config::SyncSettings;
use crate::core::propagator::{ActionOutcome, Propagator};
use crate::core::reconciler::{Action, ActionKind, PlanSummary, Reconciler};
use crate::core::snapshot::{Baseline, BaselineEntry, Snapshot};
use crate::core::state::{BaselineStore, RunLock};
use crate::core::walker::TreeWalker;
use crate::error::{StorageError, SyncError, EXIT_FAILURE, EXIT_OK, EXIT_PARTIAL};
use crate::storage::{LocalStorage, Storage, WebDavStorage};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 计划里的一条动作（事件用的轻量形式）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedAction {
    pub path: String,
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_name: Option<String>,
}

/// 进度事件：每个动作一条 start/committed/failed，外加阶段与总结
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum ProgressEvent {
    Started {
        run_id: String,
    },
    Scanning,
    Planned {
        summary: PlanSummary,
        actions: Vec<PlannedAction>,
    },
    ActionStarted {
        path: String,
        kind: ActionKind,
    },
    ActionCommitted {
        path: String,
        kind: ActionKind,
    },
    ActionFailed {
        path: String,
        kind: ActionKind,
        reason: String,
    },
    Finished {
        report: SyncReport,
    },
}

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    /// 运行完成但有动作失败
    Partial,
    Cancelled,
    DryRun,
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: String,
    pub status: RunStatus,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: u64,
    pub entries_local: u32,
    pub entries_remote: u32,
    pub committed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub conflicts: u32,
    pub bytes_transferred: u64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed | RunStatus::DryRun => EXIT_OK,
            RunStatus::Partial => EXIT_PARTIAL,
            RunStatus::Cancelled => EXIT_FAILURE,
        }
    }
}

/// 同步会话
pub struct SyncSession {
    settings: SyncSettings,
    cancelled: Arc<AtomicBool>,
}

impl SyncSession {
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 取消信号（可交给 Ctrl-C 处理等外部持有者）
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 运行一次完整同步
    pub async fn run(
        &self,
        events: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<SyncReport, SyncError> {
        let start_time = Utc::now().timestamp();
        let run_id = uuid::Uuid::new_v4().to_string();

        self.settings.validate()?;

        info!(
            "开始同步: {} <-> {}{} (用户 {})",
            self.settings.src,
            self.settings.endpoint(),
            self.settings.remote_root(),
            self.settings.user
        );

        // 运行锁与基线句柄在会话开始获取，所有退出路径上随作用域释放
        let state_dir = self.settings.state_dir();
        let pair_key = self.settings.pair_key();
        let _lock = RunLock::acquire(&state_dir, &pair_key)?;
        let store = BaselineStore::new(&state_dir, &pair_key)?;

        Self::send_event(&events, ProgressEvent::Started {
            run_id: run_id.clone(),
        })
        .await;

        // 构建两侧存储；凭据显式传入远端构造
        let local: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(&self.settings.src)
                .map_err(|e| SyncError::Config(format!("本地目录不可用 {}: {}", self.settings.src, e)))?,
        );
        let credentials = self.settings.credentials();
        let remote: Arc<dyn Storage> = Arc::new(
            WebDavStorage::new(
                &self.settings.endpoint(),
                &credentials,
                Some(self.settings.remote_root()),
            )
            .await
            .map_err(SyncError::from_remote_probe)?,
        );

        self.preflight_remote(remote.as_ref()).await?;

        if self.is_cancelled() {
            return Ok(Self::cancelled_report(run_id, start_time));
        }

        // 基线缺失或损坏时退化为全量对比
        let baseline = store.load().unwrap_or_default();

        // 两侧扫描相互独立，并行执行
        Self::send_event(&events, ProgressEvent::Scanning).await;
        let local_walker =
            TreeWalker::new(self.settings.walk_config(true)).with_cancel(self.cancelled.clone());
        let remote_walker =
            TreeWalker::new(self.settings.walk_config(false)).with_cancel(self.cancelled.clone());

        let (local_walk, remote_walk) = tokio::join!(
            local_walker.walk(local.clone()),
            remote_walker.walk(remote.clone())
        );

        let local_walk = match local_walk {
            Ok(w) => w,
            Err(StorageError::Cancelled) => return Ok(Self::cancelled_report(run_id, start_time)),
            Err(e) => return Err(SyncError::Config(format!("扫描本地目录失败: {}", e))),
        };
        let remote_walk = match remote_walk {
            Ok(w) => w,
            Err(StorageError::Cancelled) => return Ok(Self::cancelled_report(run_id, start_time)),
            Err(e) => return Err(SyncError::from_remote_probe(e)),
        };

        let mut warnings = local_walk.warnings;
        warnings.extend(remote_walk.warnings);
        for warning in &warnings {
            warn!("{}", warning);
        }

        debug!(
            "扫描完成: 本地 {} 个条目, 远端 {} 个条目",
            local_walk.snapshot.len(),
            remote_walk.snapshot.len()
        );

        // 三向对比
        let plan = Reconciler::new().reconcile(&baseline, &local_walk.snapshot, &remote_walk.snapshot);
        let summary = Reconciler::summarize(&plan);
        info!(
            "计划: {} 个动作 (下行 {}/{}, 上行 {}/{}, 删除 {}/{}, 冲突 {})",
            summary.total_actions(),
            summary.create_local,
            summary.update_local,
            summary.create_remote,
            summary.update_remote,
            summary.delete_local,
            summary.delete_remote,
            summary.conflicts
        );

        Self::send_event(&events, ProgressEvent::Planned {
            summary: summary.clone(),
            actions: plan
                .iter()
                .map(|a| PlannedAction {
                    path: a.path.clone(),
                    kind: a.kind,
                    conflict_name: a.conflict_name.clone(),
                })
                .collect(),
        })
        .await;

        if self.settings.dry_run {
            info!("dry-run: 不执行任何动作");
            let report = SyncReport {
                run_id,
                status: RunStatus::DryRun,
                start_time,
                end_time: Utc::now().timestamp(),
                duration: 0,
                entries_local: local_walk.snapshot.len() as u32,
                entries_remote: remote_walk.snapshot.len() as u32,
                committed: 0,
                failed: 0,
                skipped: plan.len() as u32,
                conflicts: summary.conflicts as u32,
                bytes_transferred: 0,
                warnings,
                errors: Vec::new(),
            };
            Self::send_event(&events, ProgressEvent::Finished {
                report: report.clone(),
            })
            .await;
            return Ok(report);
        }

        // 没有动作的路径先按当前观测刷新（采纳、双删、容差内漂移）
        let working = Self::seed_working(
            &baseline,
            &local_walk.snapshot,
            &remote_walk.snapshot,
            &plan,
        );

        // 传播
        let propagator = Propagator::new(self.settings.transfer.clone(), self.cancelled.clone());
        let outcome = propagator
            .propagate(plan, local.clone(), remote.clone(), working, events.clone())
            .await;

        // 已提交的动作是真实的：除整体中止外总是写回基线
        let mut errors: Vec<String> = outcome
            .results
            .iter()
            .filter(|r| r.outcome == ActionOutcome::Failed)
            .map(|r| {
                format!(
                    "{} {}: {}",
                    r.kind,
                    r.path,
                    r.error.as_deref().unwrap_or("未知错误")
                )
            })
            .collect();

        let mut final_baseline = outcome.baseline;
        final_baseline.saved_at = Utc::now().timestamp();
        if let Err(e) = store.save(&final_baseline) {
            error!("保存基线失败: {}", e);
            errors.push(format!("保存基线失败: {}", e));
        }

        let conflicts = outcome
            .results
            .iter()
            .filter(|r| r.kind == ActionKind::ConflictRename && r.outcome == ActionOutcome::Committed)
            .count() as u32;

        let status = if outcome.failed > 0 {
            RunStatus::Partial
        } else if self.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        let end_time = Utc::now().timestamp();
        let report = SyncReport {
            run_id,
            status,
            start_time,
            end_time,
            duration: (end_time - start_time) as u64,
            entries_local: local_walk.snapshot.len() as u32,
            entries_remote: remote_walk.snapshot.len() as u32,
            committed: outcome.committed,
            failed: outcome.failed,
            skipped: outcome.skipped,
            conflicts,
            bytes_transferred: outcome.bytes_transferred,
            warnings,
            errors,
        };

        info!(
            "同步结束: {:?} - 提交 {}, 失败 {}, 跳过 {}, 冲突 {}, 传输 {} 字节",
            report.status,
            report.committed,
            report.failed,
            report.skipped,
            report.conflicts,
            report.bytes_transferred
        );

        Self::send_event(&events, ProgressEvent::Finished {
            report: report.clone(),
        })
        .await;

        Ok(report)
    }

    /// 探测远端目标目录：区分认证失败、不可达与目录缺失
    async fn preflight_remote(&self, remote: &dyn Storage) -> Result<(), SyncError> {
        match remote.stat("/").await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                if self.settings.auto_create_remote {
                    debug!("远端目标目录不存在，尝试自动创建");
                    remote
                        .create_dir("/")
                        .await
                        .map_err(SyncError::from_remote_probe)?;
                    Ok(())
                } else {
                    Err(SyncError::RemoteUnreachable(
                        "远端目标目录不存在，请先在服务器上创建，或开启 autoCreateRemote"
                            .to_string(),
                    ))
                }
            }
            Err(e) => Err(SyncError::from_remote_probe(e)),
        }
    }

    /// 为本次运行生成工作基线：有动作的路径保持旧记录（由传播器在
    /// 提交时更新），无动作的路径按当前观测刷新或清除。
    pub(crate) fn seed_working(
        baseline: &Baseline,
        local: &Snapshot,
        remote: &Snapshot,
        plan: &[Action],
    ) -> Baseline {
        let mut working = baseline.clone();
        let planned: HashSet<&str> = plan.iter().map(|a| a.path.as_str()).collect();

        let paths: BTreeSet<&String> = baseline
            .paths()
            .chain(local.paths())
            .chain(remote.paths())
            .collect();

        for path in paths {
            if planned.contains(path.as_str()) {
                continue;
            }
            match (local.get(path), remote.get(path)) {
                // 双方都在且无动作：采纳/未变，刷新观测
                (Some(l), Some(r)) => working.insert(path.clone(), BaselineEntry::from_sides(l, r)),
                // 双方都已删除：基线条目清除
                (None, None) => {
                    working.remove(path);
                }
                // 单侧存在但无动作：保持旧记录
                _ => {}
            }
        }

        working
    }

    fn cancelled_report(run_id: String, start_time: i64) -> SyncReport {
        let end_time = Utc::now().timestamp();
        SyncReport {
            run_id,
            status: RunStatus::Cancelled,
            start_time,
            end_time,
            duration: (end_time - start_time) as u64,
            entries_local: 0,
            entries_remote: 0,
            committed: 0,
            failed: 0,
            skipped: 0,
            conflicts: 0,
            bytes_transferred: 0,
            warnings: Vec::new(),
            errors: vec!["同步已取消".to_string()],
        }
    }

    async fn send_event(tx: &Option<mpsc::Sender<ProgressEvent>>, event: ProgressEvent) {
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::propagator::{PropagateConfig, PropagateOutcome};
    use crate::core::walker::WalkConfig;
    use chrono::TimeZone;

    /// 本地目录对本地目录跑一遍完整管线（遍历→对比→播种→传播→存基线），
    /// 与真实会话的区别仅在远端侧也是本地存储。
    async fn run_pipeline(
        local_dir: &std::path::Path,
        remote_dir: &std::path::Path,
        store: &BaselineStore,
    ) -> (Vec<Action>, PropagateOutcome) {
        let local: Arc<dyn Storage> =
            Arc::new(LocalStorage::new(local_dir.to_str().unwrap()).unwrap());
        let remote: Arc<dyn Storage> =
            Arc::new(LocalStorage::new(remote_dir.to_str().unwrap()).unwrap());

        let walker = || {
            TreeWalker::new(WalkConfig {
                compute_hashes: true,
                ..Default::default()
            })
        };

        let baseline = store.load().unwrap_or_default();
        let local_walker = walker();
        let remote_walker = walker();
        let (local_walk, remote_walk) =
            tokio::join!(local_walker.walk(local.clone()), remote_walker.walk(remote.clone()));
        let local_walk = local_walk.unwrap();
        let remote_walk = remote_walk.unwrap();

        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let plan = Reconciler::new().reconcile_at(
            &baseline,
            &local_walk.snapshot,
            &remote_walk.snapshot,
            now,
        );

        let working = SyncSession::seed_working(
            &baseline,
            &local_walk.snapshot,
            &remote_walk.snapshot,
            &plan,
        );

        let propagator = Propagator::new(
            PropagateConfig {
                retry_base_delay_ms: 1,
                ..Default::default()
            },
            Arc::new(AtomicBool::new(false)),
        );
        let outcome = propagator
            .propagate(plan.clone(), local, remote, working, None)
            .await;

        store.save(&outcome.baseline).unwrap();
        (plan, outcome)
    }

    fn write(dir: &std::path::Path, rel: &str, data: &[u8]) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn read(dir: &std::path::Path, rel: &str) -> Option<Vec<u8>> {
        std::fs::read(dir.join(rel)).ok()
    }

    struct Fixture {
        _root: tempfile::TempDir,
        local: std::path::PathBuf,
        remote: std::path::PathBuf,
        store: BaselineStore,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let local = root.path().join("local");
        let remote = root.path().join("remote");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&remote).unwrap();
        let store = BaselineStore::new(&root.path().join("state"), "test").unwrap();
        Fixture {
            local,
            remote,
            store,
            _root: root,
        }
    }

    #[tokio::test]
    async fn test_first_sync_merges_and_is_idempotent() {
        let f = fixture();
        write(&f.local, "a.txt", b"from-local");
        write(&f.remote, "b.txt", b"from-remote");

        let (plan, outcome) = run_pipeline(&f.local, &f.remote, &f.store).await;
        assert_eq!(plan.len(), 2);
        assert_eq!(outcome.failed, 0);

        // 两侧都包含两个文件
        assert_eq!(read(&f.remote, "a.txt").unwrap(), b"from-local");
        assert_eq!(read(&f.local, "b.txt").unwrap(), b"from-remote");

        // 基线包含两条记录
        let baseline = f.store.load().unwrap();
        assert!(baseline.get("a.txt").is_some());
        assert!(baseline.get("b.txt").is_some());

        // 无外部变化时第二次运行产出空计划
        let (plan, _) = run_pipeline(&f.local, &f.remote, &f.store).await;
        assert!(plan.is_empty(), "第二次运行不应有动作: {:?}", plan);
    }

    #[tokio::test]
    async fn test_local_edit_propagates_to_remote() {
        let f = fixture();
        write(&f.local, "f.txt", b"v1");
        run_pipeline(&f.local, &f.remote, &f.store).await;

        write(&f.local, "f.txt", b"v2-edited");
        let (plan, outcome) = run_pipeline(&f.local, &f.remote, &f.store).await;

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].kind, ActionKind::UpdateRemote);
        assert_eq!(outcome.committed, 1);
        assert_eq!(read(&f.remote, "f.txt").unwrap(), b"v2-edited");

        let (plan, _) = run_pipeline(&f.local, &f.remote, &f.store).await;
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_deletion_propagates() {
        let f = fixture();
        write(&f.local, "dir/keep.txt", b"k");
        write(&f.local, "dir/gone.txt", b"g");
        run_pipeline(&f.local, &f.remote, &f.store).await;

        std::fs::remove_file(f.local.join("dir/gone.txt")).unwrap();
        let (plan, outcome) = run_pipeline(&f.local, &f.remote, &f.store).await;

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].kind, ActionKind::DeleteRemote);
        assert_eq!(outcome.committed, 1);
        assert!(read(&f.remote, "dir/gone.txt").is_none());
        assert_eq!(read(&f.remote, "dir/keep.txt").unwrap(), b"k");
        assert!(f.store.load().unwrap().get("dir/gone.txt").is_none());
    }

    #[tokio::test]
    async fn test_divergent_edits_preserve_both_versions() {
        let f = fixture();
        write(&f.local, "f.txt", b"base");
        run_pipeline(&f.local, &f.remote, &f.store).await;

        write(&f.local, "f.txt", b"local-edit");
        write(&f.remote, "f.txt", b"remote-edit-longer");

        let (plan, outcome) = run_pipeline(&f.local, &f.remote, &f.store).await;
        assert_eq!(plan[0].kind, ActionKind::ConflictRename);
        assert_eq!(plan[1].kind, ActionKind::UpdateRemote);
        assert_eq!(outcome.failed, 0);

        // 远端：本地内容获胜，分歧内容保留在 conflict 副本里
        assert_eq!(read(&f.remote, "f.txt").unwrap(), b"local-edit");
        assert_eq!(
            read(&f.remote, "f.txt.conflict-20250601-120000").unwrap(),
            b"remote-edit-longer"
        );

        // 下一次运行把 conflict 副本当作新远端文件下载到本地
        let (plan, _) = run_pipeline(&f.local, &f.remote, &f.store).await;
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].kind, ActionKind::CreateLocal);
        assert_eq!(plan[0].path, "f.txt.conflict-20250601-120000");
    }

    #[tokio::test]
    async fn test_modified_file_survives_remote_tree_deletion() {
        let f = fixture();
        write(&f.local, "d/f.txt", b"v1");
        run_pipeline(&f.local, &f.remote, &f.store).await;

        // 远端整个目录被删，同时本地修改了文件
        std::fs::remove_dir_all(f.remote.join("d")).unwrap();
        write(&f.local, "d/f.txt", b"v2-important");

        let (_, outcome) = run_pipeline(&f.local, &f.remote, &f.store).await;
        assert_eq!(outcome.failed, 0);

        // 修改获胜：本地文件保留并重新上传
        assert_eq!(read(&f.local, "d/f.txt").unwrap(), b"v2-important");
        assert_eq!(read(&f.remote, "d/f.txt").unwrap(), b"v2-important");
    }

    #[test]
    fn test_seed_working_refreshes_unplanned_paths() {
        use crate::storage::{Entry, EntryKind};

        let file = |path: &str, id: &str| Entry {
            path: path.to_string(),
            kind: EntryKind::File,
            size: 1,
            modified: 0,
            content_id: Some(id.to_string()),
            permissions: None,
        };

        let mut baseline = Baseline::new();
        let old = file("stale.txt", "h0");
        baseline.insert("stale.txt".to_string(), BaselineEntry::from_sides(&old, &old));

        let local: Snapshot = [file("adopted.txt", "h1")].into_iter().collect();
        let remote: Snapshot = [file("adopted.txt", "e1")].into_iter().collect();

        let working = SyncSession::seed_working(&baseline, &local, &remote, &[]);

        // 双侧采纳的新对进入基线
        let adopted = working.get("adopted.txt").unwrap();
        assert_eq!(adopted.local_id.as_deref(), Some("h1"));
        assert_eq!(adopted.remote_id.as_deref(), Some("e1"));
        // 双侧都消失的路径被清除
        assert!(working.get("stale.txt").is_none());
    }

    #[test]
    fn test_report_exit_codes() {
        let mut report = SyncSession::cancelled_report("id".to_string(), 0);
        assert_eq!(report.exit_code(), EXIT_FAILURE);
        report.status = RunStatus::Completed;
        assert_eq!(report.exit_code(), EXIT_OK);
        report.status = RunStatus::Partial;
        assert_eq!(report.exit_code(), EXIT_PARTIAL);
    }
}
