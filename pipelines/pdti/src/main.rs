//! T1 空间 DTI 流水线: DWI 刚体配准到 T1, 在 T1 网格上拟合张量.

use clap::Parser;
use dwi_berry::pipeline::dwi;
use dwi_berry::prelude::*;
use std::process::ExitCode;
use utils::cli::{parse_or_exit, CommonArgs, ReorientArgs};

#[derive(Parser, Debug)]
#[command(name = "pdti", version, about = "T1-space DTI pipeline")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    reorient: ReorientArgs,

    /// 不打开掩膜编辑器, 直接采用生成的掩膜.
    #[arg(long = "skip_review")]
    skip_review: bool,
}

fn run(cli: &Cli) -> anyhow::Result<BatchReport> {
    let variant = DtiVariant::T1Space;
    let cfg = cli.common.load_config()?;
    let tree = cli.common.derivative_tree(variant.default_deriv_name())?;
    let filter = cli.common.session_filter()?;
    let mut opts = DtiOptions::new(variant);
    opts.reorientation = cli.reorient.reorientation()?;
    opts.skip_review = cli.skip_review;

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
