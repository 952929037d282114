//! 流水线变体 (PipelineDAG) 与逐会话驱动 (PipelineRunner).
//!
//! 每个变体是一个固定顺序的阶段列表, 只在少数二元条件上分支
//! (见 [`dwi::Features`]). 阶段列表在声明时就完成命名和坐标空间记账:
//! 任何空间不一致都会在第一个阶段运行之前以 [`PipelineError::Plan`] 报告.
//!
//! [`PipelineRunner`] 逐个会话顺序执行阶段列表. 一个阶段失败只终止该会话的剩余阶段.

use crate::dataset::{Discovery, Session};
use crate::error::{PipelineError, StageError};
use crate::naming::SessionTree;
use crate::space::SpaceTracker;
use crate::stage::{StageDescriptor, StageOutcome, StageRunner};
use crate::tool::ToolRunner;
use std::path::PathBuf;
use tracing::{error, info, info_span};

pub mod atlas;
pub mod dwi;

/// 一个会话的执行计划.
#[derive(Debug)]
pub struct SessionPlan<'a> {
    /// 输出所在的会话目录树.
    pub tree: SessionTree,

    /// 声明阶段时使用的坐标空间记账.
    pub tracker: SpaceTracker,

    /// 按依赖顺序排列的阶段.
    pub stages: Vec<StageDescriptor<'a>>,
}

impl SessionPlan<'_> {
    /// 阶段名, 按执行顺序.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

/// 会话的最终状态.
#[derive(Debug)]
pub enum SessionStatus {
    /// 全部阶段完成或跳过 (dry run 时为计划完成).
    Success,

    /// 某个阶段失败, 其后的阶段未运行.
    PartialFailure {
        /// 失败的阶段.
        stage: String,

        /// 失败原因.
        error: StageError,
    },

    /// 会话缺少必需输入, 未运行.
    SkippedNoInputs,
}

impl SessionStatus {
    /// 是否失败?
    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::PartialFailure { .. })
    }
}

/// 单个阶段的结果摘要.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSummary {
    /// 阶段名.
    pub stage: String,

    /// [`StageOutcome::label`].
    pub outcome: &'static str,
}

/// 单个会话的报告.
#[derive(Debug)]
pub struct SessionReport {
    /// 会话 id.
    pub session: String,

    /// 最终状态.
    pub status: SessionStatus,

    /// 已运行 (或跳过) 的阶段.
    pub stages: Vec<StageSummary>,

    /// 输出目录. 未运行的会话为 `None`.
    pub output_dir: Option<PathBuf>,
}

/// 一次批处理的报告.
#[derive(Debug)]
pub struct BatchReport {
    /// 受试者.
    pub subject: String,

    /// 各会话的报告, 按会话 id 字典序.
    pub sessions: Vec<SessionReport>,
}

impl BatchReport {
    /// 进程退出码: 任一会话失败为 1, 否则为 0.
    pub fn exit_code(&self) -> i32 {
        if self.sessions.iter().any(|s| s.status.is_failure()) {
            1
        } else {
            0
        }
    }

    /// 某个会话的报告.
    pub fn session(&self, id: &str) -> Option<&SessionReport> {
        self.sessions.iter().find(|s| s.session == id)
    }
}

/// 逐会话驱动阶段列表.
pub struct PipelineRunner<'r> {
    tools: &'r dyn ToolRunner,
    dry_run: bool,
}

impl<'r> PipelineRunner<'r> {
    /// 以给定的工具执行者构造.
    pub fn new(tools: &'r dyn ToolRunner) -> Self {
        Self {
            tools,
            dry_run: false,
        }
    }

    /// 设置 dry run.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// 按顺序运行一个会话的全部阶段. 第一个失败的阶段终止该会话.
    pub fn run_session(&self, plan: SessionPlan) -> (SessionStatus, Vec<StageSummary>) {
        let runner = StageRunner::new(self.tools, plan.tree.staging_root()).dry_run(self.dry_run);
        let mut summaries = vec![];
        for stage in plan.stages {
            let name = stage.name().to_string();
            if self.dry_run {
                for out in stage.declared_outputs() {
                    let space = plan.tracker.find(out).and_then(|h| plan.tracker.space(h).ok());
                    if let Some(space) = space {
                        info!(stage = %name, output = %out.display(), %space, "planned output");
                    }
                }
            }
            let outcome = runner.run(stage);
            summaries.push(StageSummary {
                stage: name.clone(),
                outcome: outcome.label(),
            });
            if let StageOutcome::Failed(e) = outcome {
                error!(stage = %name, "{e}");
                return (SessionStatus::PartialFailure { stage: name, error: e }, summaries);
            }
        }
        (SessionStatus::Success, summaries)
    }

    /// 运行发现的全部会话.
    ///
    /// `planner` 为每个会话声明阶段列表. 声明阶段时的错误 ([`PipelineError::Plan`])
    /// 只使该会话失败; 其它错误终止整个批处理.
    pub fn run_batch<'a, I, F>(
        &self,
        subject: &str,
        discovery: Discovery<I>,
        mut planner: F,
    ) -> Result<BatchReport, PipelineError>
    where
        F: FnMut(&Session<I>) -> Result<SessionPlan<'a>, PipelineError>,
    {
        let mut reports: Vec<SessionReport> = discovery
            .warnings
            .into_iter()
            .map(|w| SessionReport {
                session: w.session,
                status: SessionStatus::SkippedNoInputs,
                stages: vec![],
                output_dir: None,
            })
            .collect();

        for session in discovery.sessions.iter() {
            let _span = info_span!("session", subject, session = %session.session).entered();
            let report = match planner(session) {
                Ok(plan) => {
                    info!(stages = plan.stages.len(), "session planned");
                    let output_dir = Some(plan.tree.dir().to_path_buf());
                    let (status, stages) = self.run_session(plan);
                    SessionReport {
                        session: session.session.clone(),
                        status,
                        stages,
                        output_dir,
                    }
                }
                Err(PipelineError::Plan { stage, source }) => {
                    error!(stage = %stage, "{source}");
                    SessionReport {
                        session: session.session.clone(),
                        status: SessionStatus::PartialFailure {
                            stage,
                            error: source,
                        },
                        stages: vec![],
                        output_dir: None,
                    }
                }
                Err(e) => return Err(e),
            };
            match &report.status {
                SessionStatus::Success => info!("session finished"),
                SessionStatus::PartialFailure { stage, .. } => {
                    error!(stage = %stage, "session failed")
                }
                SessionStatus::SkippedNoInputs => {}
            }
            reports.push(report);
        }

        reports.sort_by(|a, b| a.session.cmp(&b.session));
        Ok(BatchReport {
            subject: subject.to_string(),
            sessions: reports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DiscoveryWarning;
    use crate::naming::DerivativeTree;
    use crate::tool::{ToolError, ToolInvocation};
    use std::fs;

    struct Nothing;

    impl ToolRunner for Nothing {
        fn run(&self, _: &ToolInvocation) -> Result<(), ToolError> {
            Ok(())
        }
    }

    fn plan_for<'a>(tree: &DerivativeTree, session: &str, fail: bool) -> SessionPlan<'a> {
        let ses = tree.session("1", session).unwrap();
        let out = ses.dir().join("out.txt");
        let ok = StageDescriptor::new("write", {
            let out = out.clone();
            move |ctx| {
                let staged = ctx.staged(&out);
                ctx.in_process("write", || {
                    fs::write(&staged, b"x").map_err(StageError::io_at(&staged))
                })
            }
        })
        .output(out);
        let mut stages = vec![ok];
        if fail {
            stages.push(StageDescriptor::new("broken", |_| Ok(())).output(ses.dir().join("never")));
            stages.push(StageDescriptor::new("after", |_| Ok(())));
        }
        SessionPlan {
            tree: ses,
            tracker: SpaceTracker::new(),
            stages,
        }
    }

    #[test]
    fn test_failure_is_local_to_session() {
        let root = tempfile::tempdir().unwrap();
        let tree = DerivativeTree::new(root.path(), "t").unwrap();
        let discovery = Discovery {
            sessions: ["A", "B"]
                .into_iter()
                .map(|s| Session {
                    subject: "1".to_string(),
                    session: s.to_string(),
                    inputs: (),
                })
                .collect(),
            warnings: vec![DiscoveryWarning {
                session: "0".into(),
                missing: vec!["dwi".into()],
            }],
        };
        let report = PipelineRunner::new(&Nothing)
            .run_batch("1", discovery, |s| Ok(plan_for(&tree, &s.session, s.session == "A")))
            .unwrap();

        assert_eq!(report.exit_code(), 1);
        let ids: Vec<&str> = report.sessions.iter().map(|s| s.session.as_str()).collect();
        assert_eq!(ids, ["0", "A", "B"]);
        assert!(matches!(report.session("0").unwrap().status, SessionStatus::SkippedNoInputs));

        let a = report.session("A").unwrap();
        assert!(matches!(&a.status, SessionStatus::PartialFailure { stage, .. } if stage == "broken"));
        assert_eq!(a.stages.len(), 2);
        assert!(matches!(report.session("B").unwrap().status, SessionStatus::Success));
    }

    #[test]
    fn test_plan_error_fails_only_that_session() {
        let root = tempfile::tempdir().unwrap();
        let tree = DerivativeTree::new(root.path(), "t").unwrap();
        let discovery = Discovery {
            sessions: ["A", "B"]
                .into_iter()
                .map(|s| Session {
                    subject: "1".to_string(),
                    session: s.to_string(),
                    inputs: (),
                })
                .collect(),
            warnings: vec![],
        };
        let report = PipelineRunner::new(&Nothing)
            .run_batch("1", discovery, |s| {
                if s.session == "A" {
                    Err(PipelineError::plan("tensor_fit")(StageError::MissingInput {
                        stage: "tensor_fit".into(),
                        path: "x".into(),
                    }))
                } else {
                    Ok(plan_for(&tree, &s.session, false))
                }
            })
            .unwrap();
        assert!(report.session("A").unwrap().status.is_failure());
        assert!(matches!(report.session("B").unwrap().status, SessionStatus::Success));
    }

    #[test]
    fn test_only_skipped_sessions_exit_zero() {
        let report = PipelineRunner::new(&Nothing)
            .run_batch(
                "1",
                Discovery::<()> {
                    sessions: vec![],
                    warnings: vec![DiscoveryWarning {
                        session: "Day14".into(),
                        missing: vec!["bvec".into()],
                    }],
                },
                |_| unreachable!(),
            )
            .unwrap();
        assert_eq!(report.exit_code(), 0);
    }
}
