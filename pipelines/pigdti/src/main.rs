//! 原生空间 DTI 流水线: 在 DWI 网格上拟合张量, 可使用人工掩膜,
//! 可选地把 T1 刚体配准到 DWI.

use clap::Parser;
use dwi_berry::pipeline::dwi;
use dwi_berry::prelude::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use utils::cli::{parse_or_exit, CommonArgs, ReorientArgs};

#[derive(Parser, Debug)]
#[command(name = "pigdti", version, about = "Native-space DTI pipeline")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    reorient: ReorientArgs,

    /// 不打开掩膜编辑器, 直接采用生成的掩膜.
    #[arg(long = "skip_review")]
    skip_review: bool,

    /// 人工脑掩膜, 须与 DWI 同网格. 给出时不再由平均 b0 生成. 需要同时指定 `--session`.
    #[arg(long, value_name = "PATH")]
    mask: Option<PathBuf>,

    /// 额外把 T1 刚体配准到 DWI.
    #[arg(long = "register_t1")]
    register_t1: bool,
}

/// 人工掩膜只对应一个会话的 DWI 网格, 因此必须指定会话, 且文件必须存在.
fn check_manual_mask(mask: Option<&Path>, filter: &SessionFilter) -> Result<(), PipelineError> {
    let Some(mask) = mask else {
        return Ok(());
    };
    if *filter == SessionFilter::All {
        return Err(PipelineError::Argument(
            "--mask requires an explicit --session".to_string(),
        ));
    }
    if !mask.is_file() {
        return Err(PipelineError::Argument(format!(
            "mask `{}` does not exist",
            mask.display()
        )));
    }
    Ok(())
}

fn run(cli: &Cli) -> anyhow::Result<BatchReport> {
    let variant = DtiVariant::Native;
    let cfg = cli.common.load_config()?;
    let tree = cli.common.derivative_tree(variant.default_deriv_name())?;
    let filter = cli.common.session_filter()?;
    check_manual_mask(cli.mask.as_deref(), &filter)?;
    let mut opts = DtiOptions::new(variant);
    opts.reorientation = cli.reorient.reorientation()?;
    opts.skip_review = cli.skip_review;
    opts.manual_mask = cli.mask.clone();
    opts.t1_to_dwi = cli.register_t1;

    let probe = RawDwiProbe::new(&cli.common.bids_dataset, &cfg.phase_encoding);
    let discovery = discover(&probe, &cli.common.subject, &filter)?;
    let tb = Toolbox::new(&cfg, None);
    let tools = cfg.process_runner();
    let report = PipelineRunner::new(&tools)
        .dry_run(cli.common.dry_run)
        .run_batch(&cli.common.subject, discovery, |s| {
            dwi::plan(&tb, &tree, s, &opts)
        })?;
    Ok(report)
}

fn main() -> ExitCode {
    let cli: Cli = parse_or_exit();
    cli.common.init_logging();
    utils::finish(run(&cli))
}
