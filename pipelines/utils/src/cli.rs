//! 共用的命令行参数.
//!
//! 长参数名沿用数据集脚本的下划线风格, 例如 `--bids_dataset`.

use anyhow::Context;
use clap::{Args, Parser};
use dwi_berry::config::PipelineConfig;
use dwi_berry::data::Reorientation;
use dwi_berry::dataset::{check_dataset_root, SessionFilter};
use dwi_berry::error::PipelineError;
use dwi_berry::naming::DerivativeTree;
use std::path::PathBuf;
use std::process;

/// 所有流水线共有的参数.
#[derive(Args, Clone, Debug)]
pub struct CommonArgs {
    /// BIDS 数据集根目录.
    #[arg(long = "bids_dataset", value_name = "PATH")]
    pub bids_dataset: PathBuf,

    /// 受试者 id (不带 `sub-` 前缀).
    #[arg(long, value_name = "ID")]
    pub subject: String,

    /// 会话 id (不带 `ses-` 前缀), 或 `all`.
    #[arg(long, value_name = "ID", default_value = "all")]
    pub session: String,

    /// 衍生目录名. 默认值因流水线而异.
    #[arg(long = "deriv_name", value_name = "NAME")]
    pub deriv_name: Option<String>,

    /// 配置文件.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// 只打印计划, 不运行任何工具.
    #[arg(long = "dry_run")]
    pub dry_run: bool,

    /// 默认日志级别. `RUST_LOG` 优先.
    #[arg(long = "log_level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// 以 JSON 行输出日志.
    #[arg(long = "log_json")]
    pub log_json: bool,
}

impl CommonArgs {
    /// 初始化日志.
    pub fn init_logging(&self) {
        crate::logging::init(&self.log_level, self.log_json);
    }

    /// 会话过滤条件.
    pub fn session_filter(&self) -> Result<SessionFilter, PipelineError> {
        self.session.parse()
    }

    /// 检查数据集根目录, 得到衍生目录树. 未指定名字时使用 `default_name`.
    pub fn derivative_tree(&self, default_name: &str) -> Result<DerivativeTree, PipelineError> {
        check_dataset_root(&self.bids_dataset)?;
        let name = self.deriv_name.as_deref().unwrap_or(default_name);
        Ok(DerivativeTree::new(&self.bids_dataset, name)?)
    }

    /// 加载配置.
    pub fn load_config(&self) -> anyhow::Result<PipelineConfig> {
        PipelineConfig::load(self.config.as_deref()).context("cannot load pipeline configuration")
    }
}

/// 体素重定向参数.
#[derive(Args, Clone, Debug, Default)]
pub struct ReorientArgs {
    /// 坐标轴置换, 例如 `0,2,1`.
    #[arg(long = "permute_axes", value_name = "a,b,c")]
    pub permute_axes: Option<String>,

    /// 翻转的坐标轴, 例如 `0` 或 `0,2`.
    #[arg(long = "flip_axes", value_name = "AXES")]
    pub flip_axes: Option<String>,
}

impl ReorientArgs {
    /// 解析为重定向操作.
    pub fn reorientation(&self) -> Result<Reorientation, PipelineError> {
        Reorientation::parse(self.permute_axes.as_deref(), self.flip_axes.as_deref())
            .map_err(|e| PipelineError::Argument(e.to_string()))
    }
}

/// 解析命令行. 参数错误 (包括未知参数) 打印用法并以 1 退出; `--help` 以 0 退出.
pub fn parse_or_exit<T: Parser>() -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            process::exit(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser, Debug)]
    struct Demo {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        reorient: ReorientArgs,
    }

    #[test]
    fn test_underscore_flags_and_defaults() {
        let args = Demo::try_parse_from([
            "demo",
            "--bids_dataset",
            "/data",
            "--subject",
            "9116",
            "--dry_run",
            "--permute_axes",
            "0,2,1",
        ])
        .unwrap();
        assert_eq!(args.common.session, "all");
        assert_eq!(args.common.session_filter().unwrap(), SessionFilter::All);
        assert!(args.common.dry_run);
        assert!(!args.reorient.reorientation().unwrap().is_identity());
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let err = Demo::try_parse_from(["demo", "--bids_dataset", "/d", "--subject", "1", "--bogus"])
            .unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn test_bad_reorientation_is_argument_error() {
        let r = ReorientArgs {
            permute_axes: Some("0,0,1".into()),
            flip_axes: None,
        };
        assert!(matches!(r.reorientation(), Err(PipelineError::Argument(_))));
    }

    #[test]
    fn test_missing_dataset_root() {
        let args = Demo::try_parse_from([
            "demo",
            "--bids_dataset",
            "/definitely/not/here",
            "--subject",
            "1",
        ])
        .unwrap();
        assert!(matches!(
            args.common.derivative_tree("pdti2"),
            Err(PipelineError::DatasetRoot(_))
        ));
    }
}
