//! 三向对比：由基线、本地、远端三个快照推导同步计划
//!
//! 对比是纯函数：相同输入（含时间戳）产出相同的有序计划。
//! 排序约定：创建/更新按路径深度升序（父先于子），删除按深度降序
//! （子先于父），同深度内按字典序。

use crate::core::snapshot::{Baseline, BaselineEntry, Snapshot};
use crate::storage::{path_depth, Entry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// 同步动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    CreateLocal,
    CreateRemote,
    UpdateLocal,
    UpdateRemote,
    DeleteLocal,
    DeleteRemote,
    /// 冲突物化：把远端的分歧内容改名保留
    ConflictRename,
}

impl ActionKind {
    pub fn is_deletion(self) -> bool {
        matches!(self, ActionKind::DeleteLocal | ActionKind::DeleteRemote)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::CreateLocal => "create_local",
            ActionKind::CreateRemote => "create_remote",
            ActionKind::UpdateLocal => "update_local",
            ActionKind::UpdateRemote => "update_remote",
            ActionKind::DeleteLocal => "delete_local",
            ActionKind::DeleteRemote => "delete_remote",
            ActionKind::ConflictRename => "conflict_rename",
        };
        write!(f, "{}", s)
    }
}

/// 一条同步决策
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub path: String,
    pub kind: ActionKind,
    /// 驱动该动作的条目（删除动作为被删一侧的当前条目）
    pub entry: Entry,
    /// 冲突物化时的保留名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_name: Option<String>,
}

impl Action {
    fn new(kind: ActionKind, entry: &Entry) -> Self {
        Self {
            path: entry.path.clone(),
            kind,
            entry: entry.clone(),
            conflict_name: None,
        }
    }

    pub fn depth(&self) -> usize {
        path_depth(&self.path)
    }
}

/// 计划统计
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub create_local: usize,
    pub create_remote: usize,
    pub update_local: usize,
    pub update_remote: usize,
    pub delete_local: usize,
    pub delete_remote: usize,
    pub conflicts: usize,
    /// 预计传输字节数
    pub transfer_bytes: u64,
}

impl PlanSummary {
    pub fn total_actions(&self) -> usize {
        self.create_local
            + self.create_remote
            + self.update_local
            + self.update_remote
            + self.delete_local
            + self.delete_remote
            + self.conflicts
    }
}

/// 三向对比器
#[derive(Debug, Default)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    /// 对比三个快照，产出有序的同步计划
    pub fn reconcile(&self, baseline: &Baseline, local: &Snapshot, remote: &Snapshot) -> Vec<Action> {
        self.reconcile_at(baseline, local, remote, Utc::now())
    }

    /// 与 [`reconcile`](Self::reconcile) 相同，但冲突保留名的时间戳由调用方注入
    pub fn reconcile_at(
        &self,
        baseline: &Baseline,
        local: &Snapshot,
        remote: &Snapshot,
        now: DateTime<Utc>,
    ) -> Vec<Action> {
        let stamp = now.format("%Y%m%d-%H%M%S").to_string();

        let mut creates: Vec<Action> = Vec::new();
        let mut deletes: Vec<Action> = Vec::new();

        let paths: BTreeSet<&String> = baseline
            .paths()
            .chain(local.paths())
            .chain(remote.paths())
            .collect();

        for path in paths {
            let b = baseline.get(path);
            let l = local.get(path);
            let r = remote.get(path);

            match (b, l, r) {
                // 双方都不存在：基线残留，保存新基线时自然清除
                (_, None, None) => {}

                // 本地新增
                (None, Some(l), None) => creates.push(Action::new(ActionKind::CreateRemote, l)),

                // 远端新增
                (None, None, Some(r)) => creates.push(Action::new(ActionKind::CreateLocal, r)),

                // 两侧同时出现，没有基线可参照
                (None, Some(l), Some(r)) => {
                    Self::classify_both_new(l, r, false, &stamp, &mut creates)
                }

                // 远端删除
                (Some(b), Some(l), None) => {
                    if b.local_changed(l) {
                        // 一侧修改一侧删除：修改获胜，重新上传
                        creates.push(Action::new(ActionKind::CreateRemote, l));
                    } else {
                        deletes.push(Action::new(ActionKind::DeleteLocal, l));
                    }
                }

                // 本地删除
                (Some(b), None, Some(r)) => {
                    if b.remote_changed(r) {
                        creates.push(Action::new(ActionKind::CreateLocal, r));
                    } else {
                        deletes.push(Action::new(ActionKind::DeleteRemote, r));
                    }
                }

                // 三方都存在：标准三向判定
                (Some(b), Some(l), Some(r)) => {
                    Self::classify_tracked(b, l, r, &stamp, &mut creates)
                }
            }
        }

        // 删除先排序（子先于父），目录删除需要知道后代的去留
        deletes.sort_by(|a, b| {
            b.depth()
                .cmp(&a.depth())
                .then_with(|| a.path.cmp(&b.path))
        });

        let (deletes, resurrected) = Self::filter_dir_deletes(deletes, local, remote);
        creates.extend(resurrected);

        // 创建/更新按父先于子排序；冲突改名排在同路径的写入之前
        creates.sort_by(|a, b| {
            let seq = |x: &Action| usize::from(x.kind != ActionKind::ConflictRename);
            a.depth()
                .cmp(&b.depth())
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| seq(a).cmp(&seq(b)))
        });

        creates.extend(deletes);
        creates
    }

    /// 两侧都有、没有基线（或基线类型已失效）时的判定
    fn classify_both_new(
        l: &Entry,
        r: &Entry,
        tracked: bool,
        stamp: &str,
        creates: &mut Vec<Action>,
    ) {
        if l.kind != r.kind {
            // 类型分歧一律按冲突处理
            Self::materialize_conflict(l, r, tracked, stamp, creates);
            return;
        }
        if l.is_dir() {
            return;
        }
        if l.size == r.size {
            // 跨侧标识不可互比，大小一致视为同一内容，静默采纳
            debug!("两侧内容一致，采纳为已同步: {}", l.path);
            return;
        }
        Self::materialize_conflict(l, r, tracked, stamp, creates);
    }

    /// 三方都存在时的判定
    fn classify_tracked(
        b: &BaselineEntry,
        l: &Entry,
        r: &Entry,
        stamp: &str,
        creates: &mut Vec<Action>,
    ) {
        if l.kind != r.kind {
            Self::materialize_conflict(l, r, true, stamp, creates);
            return;
        }
        if b.kind != l.kind {
            // 两侧类型一致但与基线不同：基线失效，按无基线判定
            Self::classify_both_new(l, r, true, stamp, creates);
            return;
        }
        if l.is_dir() {
            return;
        }

        let local_changed = b.local_changed(l);
        let remote_changed = b.remote_changed(r);

        match (local_changed, remote_changed) {
            (false, false) => {}
            (true, false) => creates.push(Action::new(ActionKind::UpdateRemote, l)),
            (false, true) => creates.push(Action::new(ActionKind::UpdateLocal, r)),
            (true, true) => {
                if l.size == r.size {
                    // 两侧做了等价修改
                    debug!("两侧修改后内容一致，采纳为已同步: {}", l.path);
                } else {
                    Self::materialize_conflict(l, r, true, stamp, creates);
                }
            }
        }
    }

    /// 冲突物化：远端分歧内容改名保留，本地内容随后写入。
    /// 两条动作共享路径，排序保证改名先执行。
    fn materialize_conflict(
        l: &Entry,
        r: &Entry,
        tracked: bool,
        stamp: &str,
        creates: &mut Vec<Action>,
    ) {
        let conflict_name = format!("{}.conflict-{}", r.path, stamp);
        debug!("冲突: {} -> 远端保留为 {}", r.path, conflict_name);

        let mut rename = Action::new(ActionKind::ConflictRename, r);
        rename.conflict_name = Some(conflict_name);
        creates.push(rename);

        let winner_kind = if tracked {
            ActionKind::UpdateRemote
        } else {
            ActionKind::CreateRemote
        };
        creates.push(Action::new(winner_kind, l));
    }

    /// 目录删除过滤：有后代在本侧存活的目录不删除，
    /// 改为在已删除的另一侧重建该目录。
    fn filter_dir_deletes(
        deletes: Vec<Action>,
        local: &Snapshot,
        remote: &Snapshot,
    ) -> (Vec<Action>, Vec<Action>) {
        let mut kept = Vec::new();
        let mut resurrected = Vec::new();
        let mut deleted_local: HashSet<String> = HashSet::new();
        let mut deleted_remote: HashSet<String> = HashSet::new();

        // 入参已按子先父排序，处理到目录时后代的去留已确定
        for action in deletes {
            let (snapshot, deleted, resurrect_kind) = match action.kind {
                ActionKind::DeleteLocal => (local, &mut deleted_local, ActionKind::CreateRemote),
                ActionKind::DeleteRemote => (remote, &mut deleted_remote, ActionKind::CreateLocal),
                _ => {
                    kept.push(action);
                    continue;
                }
            };

            if action.entry.is_dir() {
                let survivor = snapshot
                    .descendants(&action.path)
                    .find(|e| !deleted.contains(&e.path));
                if let Some(s) = survivor {
                    debug!(
                        "目录下仍有保留内容，跳过删除并重建: {} (保留 {})",
                        action.path, s.path
                    );
                    resurrected.push(Action::new(resurrect_kind, &action.entry));
                    continue;
                }
            }

            deleted.insert(action.path.clone());
            kept.push(action);
        }

        (kept, resurrected)
    }

    /// 统计计划中的各类动作
    pub fn summarize(plan: &[Action]) -> PlanSummary {
        let mut summary = PlanSummary::default();

        for action in plan {
            match action.kind {
                ActionKind::CreateLocal => summary.create_local += 1,
                ActionKind::CreateRemote => summary.create_remote += 1,
                ActionKind::UpdateLocal => summary.update_local += 1,
                ActionKind::UpdateRemote => summary.update_remote += 1,
                ActionKind::DeleteLocal => summary.delete_local += 1,
                ActionKind::DeleteRemote => summary.delete_remote += 1,
                ActionKind::ConflictRename => summary.conflicts += 1,
            }

            if !action.entry.is_dir() && !action.kind.is_deletion() {
                if let ActionKind::CreateLocal
                | ActionKind::CreateRemote
                | ActionKind::UpdateLocal
                | ActionKind::UpdateRemote = action.kind
                {
                    summary.transfer_bytes += action.entry.size;
                }
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EntryKind;
    use chrono::TimeZone;

    fn file(path: &str, size: u64, modified: i64, id: &str) -> Entry {
        Entry {
            path: path.to_string(),
            kind: EntryKind::File,
            size,
            modified,
            content_id: Some(id.to_string()),
            permissions: None,
        }
    }

    fn dir(path: &str) -> Entry {
        Entry {
            path: path.to_string(),
            kind: EntryKind::Directory,
            size: 0,
            modified: 0,
            content_id: None,
            permissions: None,
        }
    }

    fn snap(entries: &[Entry]) -> Snapshot {
        entries.iter().cloned().collect()
    }

    fn baseline_of(pairs: &[(&Entry, &Entry)]) -> Baseline {
        let mut baseline = Baseline::new();
        for (l, r) in pairs {
            baseline.insert(l.path.clone(), BaselineEntry::from_sides(l, r));
        }
        baseline
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn plan(baseline: &Baseline, local: &Snapshot, remote: &Snapshot) -> Vec<Action> {
        Reconciler::new().reconcile_at(baseline, local, remote, fixed_now())
    }

    fn kinds(plan: &[Action]) -> Vec<(ActionKind, String)> {
        plan.iter().map(|a| (a.kind, a.path.clone())).collect()
    }

    #[test]
    fn test_first_run_creates_both_directions() {
        // 基线为空：本地 a.txt、远端 b.txt → 互相创建
        let local = snap(&[file("a.txt", 3, 10, "ha")]);
        let remote = snap(&[file("b.txt", 4, 11, "eb")]);

        let actions = plan(&Baseline::new(), &local, &remote);
        assert_eq!(
            kinds(&actions),
            vec![
                (ActionKind::CreateRemote, "a.txt".to_string()),
                (ActionKind::CreateLocal, "b.txt".to_string()),
            ]
        );
    }

    #[test]
    fn test_local_edit_updates_remote() {
        let l0 = file("f.txt", 5, 10, "h1");
        let r0 = file("f.txt", 5, 12, "e1");
        let baseline = baseline_of(&[(&l0, &r0)]);

        let local = snap(&[file("f.txt", 6, 20, "h2")]);
        let remote = snap(&[r0.clone()]);

        let actions = plan(&baseline, &local, &remote);
        assert_eq!(
            kinds(&actions),
            vec![(ActionKind::UpdateRemote, "f.txt".to_string())]
        );
    }

    #[test]
    fn test_remote_edit_updates_local() {
        let l0 = file("f.txt", 5, 10, "h1");
        let r0 = file("f.txt", 5, 12, "e1");
        let baseline = baseline_of(&[(&l0, &r0)]);

        let local = snap(&[l0.clone()]);
        let remote = snap(&[file("f.txt", 7, 30, "e2")]);

        let actions = plan(&baseline, &local, &remote);
        assert_eq!(
            kinds(&actions),
            vec![(ActionKind::UpdateLocal, "f.txt".to_string())]
        );
    }

    #[test]
    fn test_unchanged_deletion_propagates() {
        let l0 = file("gone.txt", 5, 10, "h1");
        let r0 = file("gone.txt", 5, 12, "e1");
        let baseline = baseline_of(&[(&l0, &r0)]);

        // 远端删除，本地未变 → 删除本地
        let actions = plan(&baseline, &snap(&[l0.clone()]), &Snapshot::new());
        assert_eq!(
            kinds(&actions),
            vec![(ActionKind::DeleteLocal, "gone.txt".to_string())]
        );

        // 本地删除，远端未变 → 删除远端
        let actions = plan(&baseline, &Snapshot::new(), &snap(&[r0.clone()]));
        assert_eq!(
            kinds(&actions),
            vec![(ActionKind::DeleteRemote, "gone.txt".to_string())]
        );
    }

    #[test]
    fn test_modification_wins_over_deletion() {
        let l0 = file("keep.txt", 5, 10, "h1");
        let r0 = file("keep.txt", 5, 12, "e1");
        let baseline = baseline_of(&[(&l0, &r0)]);

        // 远端删除但本地已修改：重新上传而不是删除本地
        let local = snap(&[file("keep.txt", 9, 50, "h2")]);
        let actions = plan(&baseline, &local, &Snapshot::new());
        assert_eq!(
            kinds(&actions),
            vec![(ActionKind::CreateRemote, "keep.txt".to_string())]
        );

        // 对称：本地删除但远端已修改
        let remote = snap(&[file("keep.txt", 9, 50, "e2")]);
        let actions = plan(&baseline, &Snapshot::new(), &remote);
        assert_eq!(
            kinds(&actions),
            vec![(ActionKind::CreateLocal, "keep.txt".to_string())]
        );
    }

    #[test]
    fn test_divergent_edits_materialize_conflict() {
        let l0 = file("f.txt", 5, 10, "h1");
        let r0 = file("f.txt", 5, 12, "e1");
        let baseline = baseline_of(&[(&l0, &r0)]);

        let local = snap(&[file("f.txt", 6, 20, "h2")]);
        let remote = snap(&[file("f.txt", 7, 30, "e3")]);

        let actions = plan(&baseline, &local, &remote);
        assert_eq!(
            kinds(&actions),
            vec![
                (ActionKind::ConflictRename, "f.txt".to_string()),
                (ActionKind::UpdateRemote, "f.txt".to_string()),
            ]
        );
        // 改名目标带时间戳，保留的是远端条目
        assert_eq!(
            actions[0].conflict_name.as_deref(),
            Some("f.txt.conflict-20250601-120000")
        );
        assert_eq!(actions[0].entry.content_id.as_deref(), Some("e3"));
        assert_eq!(actions[1].entry.content_id.as_deref(), Some("h2"));
    }

    #[test]
    fn test_both_new_same_size_adopted() {
        let local = snap(&[file("same.txt", 5, 10, "h1")]);
        let remote = snap(&[file("same.txt", 5, 99, "e1")]);
        assert!(plan(&Baseline::new(), &local, &remote).is_empty());
    }

    #[test]
    fn test_both_new_different_content_conflicts() {
        let local = snap(&[file("x.txt", 5, 10, "h1")]);
        let remote = snap(&[file("x.txt", 9, 10, "e1")]);

        let actions = plan(&Baseline::new(), &local, &remote);
        assert_eq!(
            kinds(&actions),
            vec![
                (ActionKind::ConflictRename, "x.txt".to_string()),
                (ActionKind::CreateRemote, "x.txt".to_string()),
            ]
        );
    }

    #[test]
    fn test_type_change_is_conflict() {
        let local = snap(&[dir("thing")]);
        let remote = snap(&[file("thing", 4, 10, "e1")]);

        let actions = plan(&Baseline::new(), &local, &remote);
        assert_eq!(actions[0].kind, ActionKind::ConflictRename);
        assert_eq!(actions[1].kind, ActionKind::CreateRemote);
        assert!(actions[1].entry.is_dir());
    }

    #[test]
    fn test_equivalent_edits_adopted() {
        let l0 = file("f.txt", 5, 10, "h1");
        let r0 = file("f.txt", 5, 12, "e1");
        let baseline = baseline_of(&[(&l0, &r0)]);

        // 两侧都变了但大小一致：视为等价修改
        let local = snap(&[file("f.txt", 8, 20, "h2")]);
        let remote = snap(&[file("f.txt", 8, 30, "e2")]);
        assert!(plan(&baseline, &local, &remote).is_empty());
    }

    #[test]
    fn test_creation_order_parents_first() {
        let local = snap(&[
            file("a/b/c.txt", 1, 0, "h1"),
            dir("a/b"),
            dir("a"),
            file("a/z.txt", 1, 0, "h2"),
        ]);

        let actions = plan(&Baseline::new(), &local, &Snapshot::new());
        let paths: Vec<_> = actions.iter().map(|a| a.path.clone()).collect();
        assert_eq!(paths, vec!["a", "a/b", "a/z.txt", "a/b/c.txt"]);
        assert!(actions.iter().all(|a| a.kind == ActionKind::CreateRemote));
    }

    #[test]
    fn test_deletion_order_children_first() {
        let ld = dir("d");
        let lf = file("d/f.txt", 1, 0, "h1");
        let rd = dir("d");
        let rf = file("d/f.txt", 1, 0, "e1");
        let baseline = baseline_of(&[(&ld, &rd), (&lf, &rf)]);

        let local = snap(&[ld.clone(), lf.clone()]);
        let actions = plan(&baseline, &local, &Snapshot::new());
        assert_eq!(
            kinds(&actions),
            vec![
                (ActionKind::DeleteLocal, "d/f.txt".to_string()),
                (ActionKind::DeleteLocal, "d".to_string()),
            ]
        );
    }

    #[test]
    fn test_dir_delete_suppressed_when_child_survives() {
        let ld = dir("d");
        let lf = file("d/f.txt", 1, 0, "h1");
        let rd = dir("d");
        let rf = file("d/f.txt", 1, 0, "e1");
        let baseline = baseline_of(&[(&ld, &rd), (&lf, &rf)]);

        // 远端整个目录被删，但本地文件已修改：目录不删，远端重建
        let local = snap(&[ld.clone(), file("d/f.txt", 9, 50, "h2")]);
        let actions = plan(&baseline, &local, &Snapshot::new());
        assert_eq!(
            kinds(&actions),
            vec![
                (ActionKind::CreateRemote, "d".to_string()),
                (ActionKind::CreateRemote, "d/f.txt".to_string()),
            ]
        );
    }

    #[test]
    fn test_reconcile_is_deterministic() {
        let l0 = file("f.txt", 5, 10, "h1");
        let r0 = file("f.txt", 5, 12, "e1");
        let baseline = baseline_of(&[(&l0, &r0)]);

        let local = snap(&[
            file("f.txt", 6, 20, "h2"),
            file("new/x.txt", 1, 0, "h3"),
            dir("new"),
        ]);
        let remote = snap(&[file("f.txt", 7, 30, "e3"), file("other.txt", 2, 0, "e4")]);

        let a = plan(&baseline, &local, &remote);
        let b = plan(&baseline, &local, &remote);
        assert_eq!(a, b);
    }

    #[test]
    fn test_summary_counts() {
        let local = snap(&[file("a.txt", 3, 10, "ha"), dir("d"), file("d/b.txt", 7, 0, "hb")]);
        let remote = snap(&[file("c.txt", 4, 11, "ec")]);

        let actions = plan(&Baseline::new(), &local, &remote);
        let summary = Reconciler::summarize(&actions);
        assert_eq!(summary.create_remote, 3);
        assert_eq!(summary.create_local, 1);
        assert_eq!(summary.conflicts, 0);
        assert_eq!(summary.transfer_bytes, 3 + 7 + 4);
        assert_eq!(summary.total_actions(), 4);
    }
}
