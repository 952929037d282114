//! 检查点引擎.
//!
//! 一个阶段 ([`StageDescriptor`]) 声明输入, 输出和一个动作. [`StageRunner::run`]:
//!
//! 1. 若声明的输出全部存在, 跳过, 不调用动作;
//! 2. 检查声明的输入是否全部存在;
//! 3. 清空该阶段的暂存目录, 调用动作. 动作把输出写入暂存目录 ([`StageContext::staged`]);
//! 4. 动作成功后, 把暂存目录中的输出逐个 rename 到最终位置;
//! 5. 再次检查声明的输出是否全部存在, 否则以 [`StageError::IncompleteOutput`] 失败.
//!
//! 因此文件系统就是执行日志: 存在的输出一定是某次成功运行完整写出的.
//!
//! # 注意
//!
//! 人工审阅掩膜的阶段在编辑器进程退出时即视为完成, 无法验证编辑本身是否正确.

use crate::error::StageError;
use crate::tool::{ToolInvocation, ToolRunner};
use itertools::Itertools;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 阶段动作.
pub type StageAction<'a> = Box<dyn FnOnce(&StageContext) -> Result<(), StageError> + 'a>;

/// 阶段描述.
pub struct StageDescriptor<'a> {
    name: String,
    inputs: Vec<PathBuf>,
    outputs: Vec<PathBuf>,
    action: StageAction<'a>,
}

impl std::fmt::Debug for StageDescriptor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl<'a> StageDescriptor<'a> {
    /// 以名字和动作构造. 输入输出通过构造器方法追加.
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce(&StageContext) -> Result<(), StageError> + 'a,
    {
        Self {
            name: name.into(),
            inputs: vec![],
            outputs: vec![],
            action: Box::new(action),
        }
    }

    /// 追加一个必需输入.
    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    /// 追加若干必需输入.
    pub fn inputs<I: IntoIterator<Item = PathBuf>>(mut self, paths: I) -> Self {
        self.inputs.extend(paths);
        self
    }

    /// 追加一个声明输出.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// 追加若干声明输出.
    pub fn outputs<I: IntoIterator<Item = PathBuf>>(mut self, paths: I) -> Self {
        self.outputs.extend(paths);
        self
    }

    /// 阶段名.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 必需输入.
    #[inline]
    pub fn declared_inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    /// 声明输出.
    #[inline]
    pub fn declared_outputs(&self) -> &[PathBuf] {
        &self.outputs
    }

    /// 所有声明输出是否都已存在?
    pub fn is_complete(&self) -> bool {
        self.outputs.iter().all(|p| p.exists())
    }
}

/// 阶段结果.
#[derive(Debug)]
pub enum StageOutcome {
    /// 输出已存在, 动作未被调用.
    Skipped,

    /// 动作成功, 输出已全部就位.
    Completed,

    /// dry run: 只记录计划, 未调用任何工具.
    Planned,

    /// 失败.
    Failed(StageError),
}

impl StageOutcome {
    /// 是否失败?
    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// 简短名称, 用于日志和汇总.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Completed => "completed",
            Self::Planned => "planned",
            Self::Failed(_) => "failed",
        }
    }
}

/// 动作的执行环境. 动作的所有副作用都应通过它完成, 从而在 dry run 时被替换为日志.
pub struct StageContext<'r> {
    stage: String,
    staging_dir: PathBuf,
    tools: &'r dyn ToolRunner,
    dry_run: bool,
}

impl<'r> StageContext<'r> {
    /// 阶段名.
    #[inline]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// 暂存目录.
    #[inline]
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// 是否为 dry run?
    #[inline]
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// 最终输出 `path` 在暂存目录中的对应路径. dry run 时原样返回.
    pub fn staged(&self, path: &Path) -> PathBuf {
        match (self.dry_run, path.file_name()) {
            (false, Some(name)) => self.staging_dir.join(name),
            _ => path.to_path_buf(),
        }
    }

    /// 暂存目录中的临时文件 (不会被提升到最终位置).
    pub fn scratch(&self, file_name: &str) -> PathBuf {
        self.staging_dir.join(file_name)
    }

    /// 调用外部工具. dry run 时只记录命令行.
    pub fn invoke(&self, invocation: &ToolInvocation) -> Result<(), StageError> {
        if self.dry_run {
            info!(stage = %self.stage, command = %invocation, "would run");
            return Ok(());
        }
        info!(stage = %self.stage, tool = invocation.tool(), "running");
        self.tools.invoke(invocation)?;
        Ok(())
    }

    /// 执行一个进程内步骤. dry run 时只记录描述.
    pub fn in_process<F>(&self, description: &str, op: F) -> Result<(), StageError>
    where
        F: FnOnce() -> Result<(), StageError>,
    {
        if self.dry_run {
            info!(stage = %self.stage, "would {description}");
            return Ok(());
        }
        debug!(stage = %self.stage, "{description}");
        op()
    }

    /// 复制文件.
    pub fn copy(&self, from: &Path, to: &Path) -> Result<(), StageError> {
        self.in_process(&format!("copy `{}` to `{}`", from.display(), to.display()), || {
            fs::copy(from, to).map_err(StageError::io_at(from))?;
            Ok(())
        })
    }

    /// 移动文件.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<(), StageError> {
        self.in_process(&format!("rename `{}` to `{}`", from.display(), to.display()), || {
            fs::rename(from, to).map_err(StageError::io_at(from))
        })
    }
}

/// 阶段执行者.
pub struct StageRunner<'r> {
    tools: &'r dyn ToolRunner,
    staging_root: PathBuf,
    dry_run: bool,
}

impl<'r> StageRunner<'r> {
    /// 每个阶段在 `staging_root/<阶段名>` 中暂存输出.
    pub fn new(tools: &'r dyn ToolRunner, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            tools,
            staging_root: staging_root.into(),
            dry_run: false,
        }
    }

    /// 设置 dry run.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// 执行一个阶段.
    pub fn run(&self, stage: StageDescriptor) -> StageOutcome {
        if stage.is_complete() {
            info!(stage = stage.name(), "outputs exist, skipping");
            return StageOutcome::Skipped;
        }
        if self.dry_run {
            info!(
                stage = stage.name(),
                inputs = %stage.inputs.iter().map(|p| p.display()).join(", "),
                outputs = %stage.outputs.iter().map(|p| p.display()).join(", "),
                "planned"
            );
            let ctx = StageContext {
                stage: stage.name.clone(),
                staging_dir: self.staging_root.join(&stage.name),
                tools: self.tools,
                dry_run: true,
            };
            return match (stage.action)(&ctx) {
                Ok(()) => StageOutcome::Planned,
                Err(e) => StageOutcome::Failed(e),
            };
        }
        match self.execute(stage) {
            Ok(()) => StageOutcome::Completed,
            Err(e) => StageOutcome::Failed(e),
        }
    }

    fn execute(&self, stage: StageDescriptor) -> Result<(), StageError> {
        if let Some(missing) = stage.inputs.iter().find(|p| !p.exists()) {
            return Err(StageError::MissingInput {
                stage: stage.name.clone(),
                path: missing.clone(),
            });
        }

        let staging_dir = self.staging_root.join(&stage.name);
        if staging_dir.exists() {
            debug!(stage = stage.name(), "clearing leftovers of an earlier attempt");
            fs::remove_dir_all(&staging_dir).map_err(StageError::io_at(&staging_dir))?;
        }
        fs::create_dir_all(&staging_dir).map_err(StageError::io_at(&staging_dir))?;

        info!(stage = stage.name(), "starting");
        let ctx = StageContext {
            stage: stage.name.clone(),
            staging_dir: staging_dir.clone(),
            tools: self.tools,
            dry_run: false,
        };
        let StageDescriptor {
            name,
            outputs,
            action,
            ..
        } = stage;
        action(&ctx)?;

        // 提升: 暂存目录 -> 最终位置
        for output in outputs.iter() {
            let Some(file_name) = output.file_name() else {
                continue;
            };
            let staged = staging_dir.join(file_name);
            if !staged.exists() {
                continue;
            }
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent).map_err(StageError::io_at(parent))?;
            }
            fs::rename(&staged, output).map_err(StageError::io_at(&staged))?;
        }

        let missing = outputs.iter().filter(|p| !p.exists()).cloned().collect_vec();
        if !missing.is_empty() {
            return Err(StageError::IncompleteOutput {
                stage: name,
                missing,
            });
        }

        if let Err(e) = fs::remove_dir_all(&staging_dir) {
            warn!(stage = %name, error = %e, "cannot remove staging directory");
        }
        info!(stage = %name, "completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 按期望输出写入占位文件.
    struct Touch(AtomicUsize);

    impl ToolRunner for Touch {
        fn run(&self, invocation: &ToolInvocation) -> Result<(), ToolError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            for p in invocation.expected_outputs() {
                fs::write(p, b"x").unwrap();
            }
            Ok(())
        }
    }

    fn touch() -> Touch {
        Touch(AtomicUsize::new(0))
    }

    #[test]
    fn test_run_then_skip() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("dwi").join("a.nii.gz");
        let tools = touch();
        let runner = StageRunner::new(&tools, dir.path().join(".staging"));

        let make = |out: PathBuf| {
            let target = out.clone();
            StageDescriptor::new("denoise", move |ctx| {
                let inv = ToolInvocation::new("dwidenoise", "dwidenoise")
                    .output_arg(&ctx.staged(&target));
                ctx.invoke(&inv)
            })
            .output(out)
        };

        assert!(matches!(runner.run(make(out.clone())), StageOutcome::Completed));
        assert!(out.exists());
        assert!(!dir.path().join(".staging").join("denoise").exists());
        assert!(matches!(runner.run(make(out.clone())), StageOutcome::Skipped));
        assert_eq!(tools.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_incomplete_output() {
        let dir = tempfile::tempdir().unwrap();
        let tools = touch();
        let runner = StageRunner::new(&tools, dir.path().join(".staging"));
        let stage = StageDescriptor::new("noop", |_| Ok(()))
            .output(dir.path().join("never.nii.gz"));
        match runner.run(stage) {
            StageOutcome::Failed(StageError::IncompleteOutput { stage, missing }) => {
                assert_eq!(stage, "noop");
                assert_eq!(missing.len(), 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_missing_input_does_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let tools = touch();
        let runner = StageRunner::new(&tools, dir.path().join(".staging"));
        let stage = StageDescriptor::new("needs", |_| -> Result<(), StageError> {
            panic!("action must not run")
        })
        .input(dir.path().join("absent.nii.gz"))
        .output(dir.path().join("out.nii.gz"));
        assert!(matches!(
            runner.run(stage),
            StageOutcome::Failed(StageError::MissingInput { .. })
        ));
    }

    #[test]
    fn test_failed_action_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.nii.gz");
        let tools = touch();
        let runner = StageRunner::new(&tools, dir.path().join(".staging"));
        let target = out.clone();
        let stage = StageDescriptor::new("half", move |ctx| {
            fs::write(ctx.staged(&target), b"partial").map_err(StageError::io_at(&target))?;
            Err(StageError::Tool(ToolError::Exit {
                tool: "x".into(),
                code: Some(1),
                stderr_tail: String::new(),
            }))
        })
        .output(out.clone());
        assert!(runner.run(stage).is_failed());
        assert!(!out.exists());
    }

    #[test]
    fn test_dry_run_plans_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.nii.gz");
        let tools = touch();
        let runner = StageRunner::new(&tools, dir.path().join(".staging")).dry_run(true);
        let target = out.clone();
        let stage = StageDescriptor::new("plan", move |ctx| {
            assert_eq!(ctx.staged(&target), target);
            ctx.invoke(&ToolInvocation::new("t", "t").output_arg(&target))
        })
        .output(out.clone());
        assert!(matches!(runner.run(stage), StageOutcome::Planned));
        assert!(!out.exists());
        assert_eq!(tools.0.load(Ordering::SeqCst), 0);
    }
}
