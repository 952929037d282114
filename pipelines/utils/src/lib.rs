//! 各流水线入口依赖的通用组件.

use dwi_berry::pipeline::{BatchReport, SessionStatus};
use std::process::ExitCode;

pub mod cli;
pub mod logging;

const SEP: &str = "--------------------------------------------------------";

/// 简单分隔线.
#[inline]
pub fn sep() {
    println!("{SEP}");
}

fn status_label(status: &SessionStatus) -> String {
    match status {
        SessionStatus::Success => "success".to_string(),
        SessionStatus::PartialFailure { stage, .. } => format!("failed at `{stage}`"),
        SessionStatus::SkippedNoInputs => "skipped (missing inputs)".to_string(),
    }
}

/// 打印批处理汇总: 每个会话的状态与输出目录.
pub fn print_summary(report: &BatchReport) {
    sep();
    for s in report.sessions.iter() {
        let status = status_label(&s.status);
        match &s.output_dir {
            Some(dir) => println!(
                "sub-{} ses-{}: {status} -> {}",
                report.subject,
                s.session,
                dir.display()
            ),
            None => println!("sub-{} ses-{}: {status}", report.subject, s.session),
        }
    }
    sep();
}

/// 把一次调用的结果转成进程退出码.
///
/// 成功时打印汇总; 出错时向 stderr 输出一行错误信息, 退出码为 1.
pub fn finish(result: anyhow::Result<BatchReport>) -> ExitCode {
    match result {
        Ok(report) => {
            print_summary(&report);
            ExitCode::from(report.exit_code() as u8)
        }
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dwi_berry::error::StageError;

    #[test]
    fn test_status_label() {
        assert_eq!(status_label(&SessionStatus::Success), "success");
        let failed = SessionStatus::PartialFailure {
            stage: "tensor_fit".into(),
            error: StageError::MissingInput {
                stage: "tensor_fit".into(),
                path: "mask.nii.gz".into(),
            },
        };
        assert_eq!(status_label(&failed), "failed at `tensor_fit`");
    }
}
