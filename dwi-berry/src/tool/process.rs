//! 基于 `std::process` 的工具执行者.

use super::{ToolError, ToolInvocation, ToolRunner};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 轮询子进程状态的间隔.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 默认保留的 stderr 行数.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// 以子进程方式运行外部工具.
///
/// 非交互式调用时, stdout / stderr 被逐行转发到日志 (target 为 `tool`),
/// stderr 的最后若干行会附在失败错误中.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
    tail_lines: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            timeout: None,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

impl ProcessRunner {
    /// 不限时, 保留默认行数的 stderr.
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置超时. 超时后子进程被杀死, 返回 [`ToolError::TimedOut`].
    /// 交互式调用不受超时限制.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// 设置错误中保留的 stderr 行数.
    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    fn command(invocation: &ToolInvocation) -> Command {
        let mut cmd = Command::new(invocation.program());
        cmd.args(invocation.arguments());
        cmd
    }

    fn spawn_error(invocation: &ToolInvocation) -> impl FnOnce(std::io::Error) -> ToolError + '_ {
        move |source| ToolError::Spawn {
            tool: invocation.tool().to_string(),
            source,
        }
    }

    /// 阻塞在交互式进程上, 直到其退出.
    fn run_interactive(&self, invocation: &ToolInvocation) -> Result<ExitStatus, ToolError> {
        info!(tool = invocation.tool(), "waiting for interactive program to exit");
        Self::command(invocation)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(Self::spawn_error(invocation))
    }

    /// 等待子进程退出, 超时则杀死.
    fn wait(&self, child: &mut Child, invocation: &ToolInvocation) -> Result<ExitStatus, ToolError> {
        let Some(timeout) = self.timeout else {
            return child.wait().map_err(Self::spawn_error(invocation));
        };
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait().map_err(Self::spawn_error(invocation))? {
                return Ok(status);
            }
            if start.elapsed() >= timeout {
                Self::kill(child);
                return Err(ToolError::TimedOut {
                    tool: invocation.tool().to_string(),
                    after: timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// 杀死子进程及其派生的所有进程.
    ///
    /// # 注意
    ///
    /// 包装脚本派生的进程同样持有输出管道, 只杀死直接子进程时转发线程会一直阻塞.
    /// unix 上子进程是自身进程组的组长, 因此向整个进程组发送 `SIGKILL`.
    fn kill(child: &mut Child) {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                // 进程组可能恰好在此刻全部退出, 失败不影响结果
                let _ = unsafe { libc::killpg(child.id() as libc::pid_t, libc::SIGKILL) };
            } else {
                let _ = child.kill();
            }
        }
        let _ = child.wait();
    }

    /// 逐行转发输出到日志. 若给定 `tail`, 则同时保留最后若干行.
    fn forward<R: Read>(tool: &str, stream: R, tail: Option<(&Mutex<VecDeque<String>>, usize)>) {
        for line in BufReader::new(stream).lines().map_while(Result::ok) {
            if line.trim().is_empty() {
                continue;
            }
            info!(target: "tool", tool, "{line}");
            if let Some((tail, cap)) = tail {
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == cap {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        }
    }

    fn run_captured(&self, invocation: &ToolInvocation) -> Result<(ExitStatus, String), ToolError> {
        let mut cmd = Self::command(invocation);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Self::spawn_error(invocation))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let tail = Mutex::new(VecDeque::with_capacity(self.tail_lines));
        let tool = invocation.tool();

        let status = thread::scope(|s| {
            if let Some(out) = stdout {
                s.spawn(move || Self::forward(tool, out, None));
            }
            if let Some(err) = stderr {
                let tail = &tail;
                let cap = self.tail_lines.max(1);
                s.spawn(move || Self::forward(tool, err, Some((tail, cap))));
            }
            self.wait(&mut child, invocation)
        })?;

        let tail = tail
            .into_inner()
            .map(|lines| lines.into_iter().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();
        Ok((status, tail))
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<(), ToolError> {
        debug!(tool = invocation.tool(), command = %invocation, "invoking");
        let started = Instant::now();
        let (status, stderr_tail) = if invocation.is_interactive() {
            (self.run_interactive(invocation)?, String::new())
        } else {
            self.run_captured(invocation)?
        };
        debug!(
            tool = invocation.tool(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            code = status.code(),
            "finished"
        );
        if status.success() {
            Ok(())
        } else {
            Err(ToolError::Exit {
                tool: invocation.tool().to_string(),
                code: status.code(),
                stderr_tail,
            })
        }
    }
}
