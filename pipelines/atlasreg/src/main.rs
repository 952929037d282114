//! 图谱配准流水线: 把上游衍生目录中的解剖像或 DTI 标量图配准到图谱模板,
//! 并在图谱空间中按 ROI 统计标量图.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use dwi_berry::consts::{ATLAS_DERIV_NAME, NATIVE_DERIV_NAME};
use dwi_berry::pipeline::atlas::{self, find_template};
use dwi_berry::prelude::*;
use dwi_berry::roi;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use utils::cli::{parse_or_exit, CommonArgs, ReorientArgs};

/// 配准对象.
#[derive(Copy, Clone, Debug, ValueEnum)]
enum Target {
    /// T1 解剖像.
    Anat,

    /// FA (MD / AD / RD 随之重采样).
    Scalar,
}

impl From<Target> for AtlasTarget {
    fn from(t: Target) -> Self {
        match t {
            Target::Anat => AtlasTarget::Anat,
            Target::Scalar => AtlasTarget::Scalar,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "atlasreg", version, about = "Atlas registration of DTI derivatives")]
struct Cli {
    /// `--deriv_name` 为输入衍生目录 (默认 `pigdti`).
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    reorient: ReorientArgs,

    /// 输出衍生目录名.
    #[arg(long = "out_deriv", value_name = "NAME", default_value = ATLAS_DERIV_NAME)]
    out_deriv: String,

    /// 图谱目录, 包含模板和 ROI 子目录.
    #[arg(long = "atlas_dir", value_name = "PATH")]
    atlas_dir: PathBuf,

    /// 变换类型, 例如 `SyN`, `QuickRigid`. 默认取配置文件.
    #[arg(long = "transform_type", value_name = "NAME")]
    transform_type: Option<String>,

    /// 运行配准脚本的 Python 虚拟环境.
    #[arg(long = "python_venv", value_name = "PATH")]
    python_venv: Option<PathBuf>,

    /// 配准对象.
    #[arg(long, value_enum, default_value = "scalar")]
    target: Target,

    /// 模板. 默认在图谱目录中查找.
    #[arg(long, value_name = "PATH")]
    template: Option<PathBuf>,
}

/// 检查图谱目录并确定模板: 显式给出的模板必须存在, 否则在图谱目录中查找.
fn resolve_template(
    atlas_dir: &Path,
    explicit: Option<&Path>,
    target: AtlasTarget,
) -> Result<PathBuf, PipelineError> {
    if !atlas_dir.is_dir() {
        return Err(PipelineError::Argument(format!(
            "atlas directory `{}` does not exist",
            atlas_dir.display()
        )));
    }
    match explicit {
        Some(t) if t.is_file() => Ok(t.to_path_buf()),
        Some(t) => Err(PipelineError::Argument(format!(
            "template `{}` does not exist",
            t.display()
        ))),
        None => find_template(atlas_dir, target).ok_or_else(|| {
            PipelineError::Argument(format!("no template found in `{}`", atlas_dir.display()))
        }),
    }
}

fn run(cli: &Cli) -> anyhow::Result<BatchReport> {
    let cfg = cli.common.load_config()?;
    let input = cli.common.derivative_tree(NATIVE_DERIV_NAME)?;
    let output = DerivativeTree::new(&cli.common.bids_dataset, &cli.out_deriv)?;
    let filter = cli.common.session_filter()?;
    let target = AtlasTarget::from(cli.target);

    let template = resolve_template(&cli.atlas_dir, cli.template.as_deref(), target)?;
    let rois = match target {
        AtlasTarget::Scalar => roi::atlas_masks(&cli.atlas_dir, &cfg.roi_dir_name, &cfg.tpm_dir_name)
            .with_context(|| format!("cannot list ROIs in `{}`", cli.atlas_dir.display()))?,
        AtlasTarget::Anat => vec![],
    };
    info!(template = %template.display(), rois = rois.len(), "atlas resolved");

    let opts = AtlasOptions {
        target,
        template,
        transform_type: cli
            .transform_type
            .clone()
            .unwrap_or_else(|| cfg.transform_type.clone()),
        reorientation: cli.reorient.reorientation()?,
        rois,
    };

    let probe = DerivativeProbe::new(input, target);
    let discovery = discover(&probe, &cli.common.subject, &filter)?;
    let tb = Toolbox::new(&cfg, cli.python_venv.as_deref());
    let tools = cfg.process_runner();
    let report = PipelineRunner::new(&tools)
        .dry_run(cli.common.dry_run)
        .run_batch(&cli.common.subject, discovery, |s| {
            atlas::plan(&tb, &output, s, &opts)
        })?;
    Ok(report)
}

fn main() -> ExitCode {
    let cli: Cli = parse_or_exit();
    cli.common.init_logging();
    utils::finish(run(&cli))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_resolve_template() {
        let dir = tempfile::tempdir().unwrap();
        let atlas = dir.path().join("atlas");
        fs::create_dir_all(&atlas).unwrap();
        let missing = atlas.join("mine.nii.gz");
        assert!(matches!(
            resolve_template(&atlas, Some(&missing), AtlasTarget::Scalar),
            Err(PipelineError::Argument(_))
        ));
        assert!(matches!(
            resolve_template(&atlas, None, AtlasTarget::Scalar),
            Err(PipelineError::Argument(_))
        ));

        fs::write(&missing, b"x").unwrap();
        assert_eq!(
            resolve_template(&atlas, Some(&missing), AtlasTarget::Scalar).unwrap(),
            missing
        );
        let fa = atlas.join("template_FA.nii.gz");
        fs::write(&fa, b"x").unwrap();
        assert_eq!(resolve_template(&atlas, None, AtlasTarget::Scalar).unwrap(), fa);
    }

    #[test]
    fn test_missing_atlas_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_template(&dir.path().join("nope"), None, AtlasTarget::Anat),
            Err(PipelineError::Argument(_))
        ));
    }
}
