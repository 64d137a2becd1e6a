//! 迁移会话模型
//!
//! 迁移状态机的阶段定义、阶段记录以及传输进度

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::lock::Lock;
use super::node::Node;

/// 迁移阶段
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Idle,
    Selecting,
    Locking,
    Cloning,
    Verifying,
    CuttingOver,
    Bootstrapping,
    Completed,
    Failed,
    Aborted,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Idle => "idle",
            MigrationPhase::Selecting => "selecting",
            MigrationPhase::Locking => "locking",
            MigrationPhase::Cloning => "cloning",
            MigrationPhase::Verifying => "verifying",
            MigrationPhase::CuttingOver => "cutting_over",
            MigrationPhase::Bootstrapping => "bootstrapping",
            MigrationPhase::Completed => "completed",
            MigrationPhase::Failed => "failed",
            MigrationPhase::Aborted => "aborted",
        }
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationPhase::Completed | MigrationPhase::Failed | MigrationPhase::Aborted
        )
    }

    /// 是否仍处于切换之前（可取消）
    pub fn is_before_cutover(&self) -> bool {
        matches!(
            self,
            MigrationPhase::Idle
                | MigrationPhase::Selecting
                | MigrationPhase::Locking
                | MigrationPhase::Cloning
                | MigrationPhase::Verifying
        )
    }

    /// 状态转换表
    pub fn allows(&self, next: MigrationPhase) -> bool {
        use MigrationPhase::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) => true,
            (from, Aborted) => from.is_before_cutover(),
            (Idle, Selecting) => true,
            (Selecting, Locking) => true,
            (Locking, Cloning) | (Locking, Selecting) => true,
            (Cloning, Verifying) => true,
            (Verifying, CuttingOver) | (Verifying, Cloning) => true,
            (CuttingOver, Bootstrapping) => true,
            (Bootstrapping, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段结果
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Running,
    Success,
    Failed,
}

/// 单个阶段的执行记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: MigrationPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub outcome: PhaseOutcome,
    pub message: Option<String>,
}

impl PhaseRecord {
    fn start(phase: MigrationPhase, now: DateTime<Utc>) -> Self {
        Self {
            phase,
            started_at: now,
            finished_at: None,
            duration_ms: None,
            outcome: PhaseOutcome::Running,
            message: None,
        }
    }

    fn finish(&mut self, success: bool, message: Option<String>, now: DateTime<Utc>) {
        self.finished_at = Some(now);
        self.outcome = if success {
            PhaseOutcome::Success
        } else {
            PhaseOutcome::Failed
        };
        self.message = message;
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }
}

/// 非法状态转换
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid migration transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: MigrationPhase,
    pub to: MigrationPhase,
}

/// 传输进度
///
/// 记录已完成的层级和流式目录，重试时跳过
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferProgress {
    pub bulk_complete: bool,
    pub streams_complete: BTreeSet<String>,
    /// 各层执行次数
    pub bulk_runs: u32,
    pub stream_runs: u32,
}

impl TransferProgress {
    pub fn is_complete(&self, stream_dirs: &[String]) -> bool {
        self.bulk_complete && stream_dirs.iter().all(|d| self.streams_complete.contains(d))
    }

    /// 校验失败后重新克隆：所有层重新执行（rsync 仍按增量续传）
    pub fn reset(&mut self) {
        self.bulk_complete = false;
        self.streams_complete.clear();
    }
}

/// 迁移会话
#[derive(Clone, Debug, Serialize)]
pub struct MigrationSession {
    pub id: Uuid,
    pub source_id: Option<String>,
    pub source_address: Option<String>,
    pub target: Option<Node>,
    pub phase: MigrationPhase,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub phases: Vec<PhaseRecord>,
    pub verified: bool,
    pub cut_over: bool,
    pub clone_attempts: u32,
    pub reclones: u32,
    /// 本次会话中已排除的候选节点
    pub excluded: BTreeSet<String>,
    pub progress: TransferProgress,
    #[serde(skip)]
    pub lock: Option<Lock>,
}

impl MigrationSession {
    pub fn new(source_id: Option<String>, source_address: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            source_address,
            target: None,
            phase: MigrationPhase::Idle,
            started_at: now,
            ended_at: None,
            error: None,
            phases: Vec::new(),
            verified: false,
            cut_over: false,
            clone_attempts: 0,
            reclones: 0,
            excluded: BTreeSet::new(),
            progress: TransferProgress::default(),
            lock: None,
        }
    }

    /// 进入下一阶段
    ///
    /// 未经校验通过不能进入 CuttingOver
    pub fn enter(&mut self, next: MigrationPhase, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        let invalid = InvalidTransition {
            from: self.phase,
            to: next,
        };
        if !self.phase.allows(next) {
            return Err(invalid);
        }
        if next == MigrationPhase::CuttingOver && !self.verified {
            return Err(invalid);
        }
        if next == MigrationPhase::Cloning {
            // 重新进入克隆阶段需要重新校验
            self.verified = false;
        }

        let success = !matches!(next, MigrationPhase::Failed | MigrationPhase::Aborted);
        let message = if success { None } else { self.error.clone() };
        if let Some(record) = self.phases.last_mut().filter(|r| r.outcome == PhaseOutcome::Running) {
            record.finish(success, message, now);
        }

        self.phase = next;
        if next.is_terminal() {
            self.ended_at = Some(now);
        } else {
            self.phases.push(PhaseRecord::start(next, now));
        }
        Ok(())
    }

    /// 以失败（或取消）结束会话
    pub fn finish_with_error(&mut self, error: String, aborted: bool, now: DateTime<Utc>) {
        self.error = Some(error);
        let next = if aborted && self.phase.is_before_cutover() {
            MigrationPhase::Aborted
        } else {
            MigrationPhase::Failed
        };
        // 已处于终止状态时保持不变
        let _ = self.enter(next, now);
    }

    pub fn exclude(&mut self, node_id: &str) {
        self.excluded.insert(node_id.to_string());
    }

    pub fn target_address(&self) -> Option<&str> {
        self.target.as_ref().map(|n| n.address.as_str())
    }

    /// 某阶段是否成功完成过
    pub fn phase_succeeded(&self, phase: MigrationPhase) -> bool {
        self.phases
            .iter()
            .any(|r| r.phase == phase && r.outcome == PhaseOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MigrationPhase::*;

    fn walk(session: &mut MigrationSession, phases: &[MigrationPhase]) {
        for p in phases {
            session.enter(*p, Utc::now()).unwrap();
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut s = MigrationSession::new(None, None, Utc::now());
        walk(&mut s, &[Selecting, Locking, Cloning, Verifying]);
        s.verified = true;
        walk(&mut s, &[CuttingOver, Bootstrapping, Completed]);

        assert_eq!(s.phase, Completed);
        assert!(s.ended_at.is_some());
        assert_eq!(s.phases.len(), 6);
        assert!(s.phases.iter().all(|r| r.outcome == PhaseOutcome::Success));
        assert!(s.phases.iter().all(|r| r.duration_ms.is_some()));
    }

    #[test]
    fn test_cutover_requires_verification() {
        let mut s = MigrationSession::new(None, None, Utc::now());
        walk(&mut s, &[Selecting, Locking, Cloning, Verifying]);
        assert_eq!(
            s.enter(CuttingOver, Utc::now()),
            Err(InvalidTransition {
                from: Verifying,
                to: CuttingOver
            })
        );

        // 回到克隆会清除校验标记
        s.verified = true;
        s.enter(Cloning, Utc::now()).unwrap();
        assert!(!s.verified);
    }

    #[test]
    fn test_skipping_phases_is_rejected() {
        assert!(!Selecting.allows(Cloning));
        assert!(!Cloning.allows(CuttingOver));
        assert!(!Locking.allows(Verifying));
        assert!(!Completed.allows(Failed));
    }

    #[test]
    fn test_abort_only_before_cutover() {
        assert!(Cloning.allows(Aborted));
        assert!(Verifying.allows(Aborted));
        assert!(!CuttingOver.allows(Aborted));
        assert!(!Bootstrapping.allows(Aborted));
        assert!(Bootstrapping.allows(Failed));
    }

    #[test]
    fn test_finish_with_error_records_failed_phase() {
        let mut s = MigrationSession::new(None, None, Utc::now());
        walk(&mut s, &[Selecting, Locking, Cloning]);
        s.finish_with_error("rsync exited with 12".into(), false, Utc::now());

        assert_eq!(s.phase, Failed);
        let last = s.phases.last().unwrap();
        assert_eq!(last.phase, Cloning);
        assert_eq!(last.outcome, PhaseOutcome::Failed);
        assert_eq!(last.message.as_deref(), Some("rsync exited with 12"));
    }

    #[test]
    fn test_abort_after_cutover_becomes_failure() {
        let mut s = MigrationSession::new(None, None, Utc::now());
        walk(&mut s, &[Selecting, Locking, Cloning, Verifying]);
        s.verified = true;
        walk(&mut s, &[CuttingOver, Bootstrapping]);
        s.finish_with_error("cancelled".into(), true, Utc::now());
        assert_eq!(s.phase, Failed);
    }

    #[test]
    fn test_progress_completion() {
        let dirs = vec!["/var/lib/app".to_string()];
        let mut p = TransferProgress::default();
        assert!(!p.is_complete(&dirs));
        p.bulk_complete = true;
        assert!(!p.is_complete(&dirs));
        p.streams_complete.insert("/var/lib/app".into());
        assert!(p.is_complete(&dirs));
        p.reset();
        assert!(!p.is_complete(&[]));
    }
}
