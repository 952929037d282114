//! 外部工具适配层.
//!
//! 所有外部程序 (MRtrix3, ANTs, FSL 包装脚本, 交互式掩膜编辑器, 配准脚本)
//! 都经由 [`ToolRunner::invoke`] 调用. 该方法阻塞到进程退出, 并把
//! "非零退出码" 和 "退出码为 0 但声明的输出不存在" 统一转换为 [`ToolError`].
//! 本层不做任何重试.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub mod commands;
mod process;

pub use commands::Toolbox;
pub use process::{ProcessRunner, DEFAULT_TAIL_LINES};

/// 外部工具调用失败.
#[derive(Debug, Error)]
pub enum ToolError {
    /// 无法启动进程, 或等待进程时出错.
    #[error("cannot run `{tool}`: {source}")]
    Spawn {
        /// 工具名.
        tool: String,

        /// 底层错误.
        #[source]
        source: io::Error,
    },

    /// 非零退出码. `code` 为 `None` 代表被信号终止.
    #[error("`{tool}` failed with {}{}", display_code(.code), display_tail(.stderr_tail))]
    Exit {
        /// 工具名.
        tool: String,

        /// 退出码.
        code: Option<i32>,

        /// stderr 的最后若干行.
        stderr_tail: String,
    },

    /// 退出码为 0, 但声明的输出不存在.
    #[error("`{tool}` exited successfully but did not produce `{}`", .path.display())]
    MissingOutput {
        /// 工具名.
        tool: String,

        /// 缺失的输出.
        path: PathBuf,
    },

    /// 退出码为 0, 但产生了调用方无法对应的输出 (例如多出的变换文件).
    #[error("`{tool}` produced `{}` which the invocation does not account for", .path.display())]
    UnexpectedOutput {
        /// 工具名.
        tool: String,

        /// 多出的输出.
        path: PathBuf,
    },

    /// 超时, 进程已被终止.
    #[error("`{tool}` timed out after {}s and was killed", .after.as_secs())]
    TimedOut {
        /// 工具名.
        tool: String,

        /// 超时时长.
        after: Duration,
    },
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "a signal".to_string(),
    }
}

fn display_tail(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(":\n{tail}")
    }
}

impl ToolError {
    /// 出错的工具名.
    pub fn tool(&self) -> &str {
        match self {
            Self::Spawn { tool, .. }
            | Self::Exit { tool, .. }
            | Self::MissingOutput { tool, .. }
            | Self::UnexpectedOutput { tool, .. }
            | Self::TimedOut { tool, .. } => tool,
        }
    }
}

/// 一次外部工具调用的完整描述.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ToolInvocation {
    tool: String,
    program: PathBuf,
    args: Vec<String>,
    expected_outputs: Vec<PathBuf>,
    interactive: bool,
}

impl ToolInvocation {
    /// `tool` 是日志和错误中使用的逻辑名, `program` 是实际执行的程序.
    pub fn new(tool: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: vec![],
            expected_outputs: vec![],
            interactive: false,
        }
    }

    /// 追加一个参数.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// 追加若干参数.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// 追加一个路径参数.
    pub fn path_arg(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// 追加一个路径参数, 并将其登记为期望输出.
    pub fn output_arg(self, path: &Path) -> Self {
        self.path_arg(path).expect_output(path)
    }

    /// 登记一个期望输出 (不追加参数).
    pub fn expect_output(mut self, path: &Path) -> Self {
        self.expected_outputs.push(path.to_path_buf());
        self
    }

    /// 标记为交互式: 继承终端的标准输入输出, 不收集日志.
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// 逻辑名.
    #[inline]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// 程序路径.
    #[inline]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// 参数列表.
    #[inline]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// 期望输出.
    #[inline]
    pub fn expected_outputs(&self) -> &[PathBuf] {
        &self.expected_outputs
    }

    /// 是否交互式?
    #[inline]
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// 检查所有期望输出是否存在. 返回第一个缺失的输出对应的错误.
    pub fn check_outputs(&self) -> Result<(), ToolError> {
        match self.expected_outputs.iter().find(|p| !p.exists()) {
            Some(path) => Err(ToolError::MissingOutput {
                tool: self.tool.clone(),
                path: path.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// 以 shell 风格展示的命令行, 用于日志和 dry run.
impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program.to_string_lossy()))?;
        for arg in self.args.iter() {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// 外部工具的执行者.
///
/// 生产环境使用 [`ProcessRunner`]; 测试中可以实现一个按脚本生成输出的假执行者,
/// 从而在没有外部工具的机器上运行完整的流水线.
pub trait ToolRunner: Send + Sync {
    /// 运行进程并等待其退出. 非零退出码必须返回 [`ToolError::Exit`].
    fn run(&self, invocation: &ToolInvocation) -> Result<(), ToolError>;

    /// 运行进程, 然后检查期望输出是否全部存在.
    fn invoke(&self, invocation: &ToolInvocation) -> Result<(), ToolError> {
        self.run(invocation)?;
        invocation.check_outputs()
    }
}

impl<T: ToolRunner + ?Sized> ToolRunner for &T {
    fn run(&self, invocation: &ToolInvocation) -> Result<(), ToolError> {
        (**self).run(invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// 只记录调用, 什么也不执行.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ToolRunner for Recorder {
        fn run(&self, invocation: &ToolInvocation) -> Result<(), ToolError> {
            self.0.lock().unwrap().push(invocation.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_display_quotes() {
        let inv = ToolInvocation::new("mrconvert", "mrconvert")
            .path_arg(Path::new("/a b/t1.nii.gz"))
            .args(["-coord", "3", "0"])
            .arg("it's");
        assert_eq!(
            inv.to_string(),
            r"mrconvert '/a b/t1.nii.gz' -coord 3 0 'it'\''s'"
        );
    }

    #[test]
    fn test_missing_output_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("never.nii.gz");
        let inv = ToolInvocation::new("dwiextract", "dwiextract").output_arg(&out);
        let runner = Recorder::default();
        let err = runner.invoke(&inv).unwrap_err();
        assert!(matches!(err, ToolError::MissingOutput { ref path, .. } if *path == out));
        assert_eq!(err.tool(), "dwiextract");
        assert_eq!(runner.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_exit_message() {
        let err = ToolError::Exit {
            tool: "dwidenoise".into(),
            code: Some(2),
            stderr_tail: "bad input".into(),
        };
        assert_eq!(err.to_string(), "`dwidenoise` failed with exit code 2:\nbad input");
    }
}
