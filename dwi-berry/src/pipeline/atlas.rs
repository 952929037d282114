//! 图谱配准流水线 (`atlasreg`).
//!
//! 运动图像 (T1 或 FA) 被非线性配准到图谱模板, 同网格的其它图像
//! (MD / AD / RD) 随同一变换重采样, 掩膜以最近邻插值单独重采样.
//! 标量图在图谱空间中按 ROI 统计, 写成 CSV.

use super::SessionPlan;
use crate::consts::ATLAS_APPLY_SUFFIX;
use crate::data::Reorientation;
use crate::dataset::{AtlasInputs, AtlasTarget, RankedLookup, Session};
use crate::error::{PipelineError, StageError};
use crate::naming::{insert_suffix, ArtifactName, Datatype, DerivativeTree, Extension, NamingError};
use crate::roi;
use crate::space::{ImageHandle, Space, SpaceTracker, TransformHandle};
use crate::stage::StageDescriptor;
use crate::tool::commands::{forward_transforms, Interpolation, RegistrationRequest};
use crate::tool::{ToolError, Toolbox};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// 阶段名.
pub mod stages {
    #![allow(missing_docs)]

    pub const REORIENT_INPUTS: &str = "reorient_inputs";
    pub const ATLAS_REGISTER: &str = "atlas_register";
    pub const ATLAS_APPLY_LABELS: &str = "atlas_apply_labels";
    pub const ATLAS_RESAMPLE_ROIS: &str = "atlas_resample_rois";
    pub const ROI_METRICS: &str = "roi_metrics";
}

use stages::*;

/// 图谱配准选项.
#[derive(Clone, Debug)]
pub struct AtlasOptions {
    /// 配准对象.
    pub target: AtlasTarget,

    /// 图谱模板 (固定图像).
    pub template: PathBuf,

    /// 变换类型, 例如 `SyN`.
    pub transform_type: String,

    /// 配准前对输入做的体素重定向.
    pub reorientation: Reorientation,

    /// 图谱空间中的 ROI 掩膜 `(名字, 路径)`. 为空时不统计.
    pub rois: Vec<(String, PathBuf)>,
}

/// 在图谱目录中查找模板.
///
/// 解剖像使用 `template_T1w` 或 `template`, 标量图使用 `template_FA`;
/// 均接受 `.nii.gz` 和 `.nii`.
pub fn find_template(atlas_dir: &Path, target: AtlasTarget) -> Option<PathBuf> {
    let stems: &[&str] = match target {
        AtlasTarget::Anat => &["template_T1w", "template"],
        AtlasTarget::Scalar => &["template_FA"],
    };
    let names = stems
        .iter()
        .flat_map(|s| [format!("{s}.nii.gz"), format!("{s}.nii")]);
    RankedLookup::exact(names).find(atlas_dir)
}

/// 一个输入图像: 句柄, 当前路径, 以及决定输出名的原始逻辑名.
#[derive(Clone, Debug)]
struct Tracked {
    handle: ImageHandle,
    path: PathBuf,
    origin: ArtifactName,
}

fn parse_name(path: &Path) -> Result<ArtifactName, StageError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| NamingError::Unparsable(path.display().to_string()))?;
    Ok(ArtifactName::parse(file_name)?)
}

/// 配准协作者在 `dir` 中实际写出的正向变换 `reg_fwd_<i>_*`, 按编号排列.
///
/// # 注意
///
/// 个数必须与 `expected` 一致: 缺少时返回 [`ToolError::MissingOutput`],
/// 多出时返回 [`ToolError::UnexpectedOutput`].
fn forward_outputs(dir: &Path, expected: usize) -> Result<Vec<PathBuf>, StageError> {
    let mut found: Vec<(usize, String)> = fs::read_dir(dir)
        .map_err(StageError::io_at(dir))?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|n| {
            let index = n.strip_prefix("reg_fwd_")?.split('_').next()?.parse().ok()?;
            Some((index, n))
        })
        .collect();
    found.sort();
    if let Some((_, extra)) = found.get(expected) {
        return Err(ToolError::UnexpectedOutput {
            tool: "ANTsReg".to_string(),
            path: dir.join(extra),
        }
        .into());
    }
    (0..expected)
        .map(|i| match found.get(i) {
            Some((index, name)) if *index == i => Ok(dir.join(name)),
            _ => Err(ToolError::MissingOutput {
                tool: "ANTsReg".to_string(),
                path: dir.join(format!("reg_fwd_{i}_*")),
            }
            .into()),
        })
        .collect()
}

/// 配准协作者对 `image` 重采样后的文件名.
fn applied_name(out_dir: &Path, image: &Path) -> Result<PathBuf, StageError> {
    let applied = insert_suffix(image, ATLAS_APPLY_SUFFIX)?;
    let name = applied
        .file_name()
        .ok_or_else(|| NamingError::UnsupportedExtension(image.to_path_buf()))?;
    Ok(out_dir.join(name))
}

struct AtlasBuilder<'a> {
    tb: &'a Toolbox<'a>,
    ses: crate::naming::SessionTree,
    datatype: Datatype,
    tracker: SpaceTracker,
    stages: Vec<StageDescriptor<'a>>,
}

impl<'a> AtlasBuilder<'a> {
    fn step<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> Result<T, StageError>,
    ) -> Result<T, PipelineError> {
        f(self).map_err(PipelineError::plan(name))
    }

    /// 输出路径: 沿用原始逻辑名的描述符与后缀, 空间取自 `space`.
    fn output(
        &self,
        origin: &ArtifactName,
        space: Option<&str>,
        desc: Option<&str>,
    ) -> Result<PathBuf, StageError> {
        let mut name = self
            .ses
            .name(origin.suffix(), Extension::NiiGz)?
            .with_space(space)?;
        if let Some(desc) = desc.or(origin.desc()) {
            name = name.with_desc(desc)?;
        }
        Ok(self.ses.path(self.datatype, &name))
    }

    fn transform_path(&self, index: usize, extension: Extension) -> Result<PathBuf, StageError> {
        let name = self
            .ses
            .name("xfm", extension)?
            .with_desc(&format!("toAtlas{index}"))?;
        Ok(self.ses.path(self.datatype, &name))
    }

    /// 所有输入一次性重定向. 同一网格上的输入经同一重定向后仍共享网格.
    fn reorient(&mut self, images: &mut [Tracked], op: &Reorientation) -> Result<(), PipelineError> {
        self.step(REORIENT_INPUTS, |b| {
            let mut pairs = vec![];
            for image in images.iter_mut() {
                let desc = format!("{}reoriented", image.origin.desc().unwrap_or_default());
                let out = b.output(&image.origin, image.origin.space(), Some(&desc))?;
                pairs.push((image.path.clone(), out.clone()));
                image.handle = b.tracker.reorient(image.handle, out.clone(), op.clone())?;
                image.path = out;
            }
            let (inputs, outputs): (Vec<_>, Vec<_>) = pairs.iter().cloned().unzip();
            let op = op.clone();
            b.stages.push(
                StageDescriptor::new(REORIENT_INPUTS, move |ctx| {
                    for (i, o) in pairs.iter() {
                        let staged = ctx.staged(o);
                        ctx.in_process(&format!("reorient `{}` ({op})", i.display()), || {
                            Ok(op.apply_file(i, &staged)?)
                        })?;
                    }
                    Ok(())
                })
                .inputs(inputs)
                .outputs(outputs),
            );
            Ok(())
        })
    }

    /// 配准运动图像, 并用同一变换重采样 `apply`.
    ///
    /// # 返回值
    ///
    /// `(变换, 形变后的运动图像, 重采样后的图像)`.
    fn register(
        &mut self,
        template: ImageHandle,
        moving: &Tracked,
        moving_mask: Option<&Path>,
        apply: &[Tracked],
        transform_type: &str,
    ) -> Result<(TransformHandle, Tracked, Vec<Tracked>), PipelineError> {
        let tb = self.tb;
        self.step(ATLAS_REGISTER, |b| {
            let atlas = b.tracker.space(template)?.label().map(str::to_string);
            let atlas = atlas.as_deref();
            let fixed = b.tracker.path(template)?.to_path_buf();

            let warped = b.output(&moving.origin, atlas, None)?;
            let xfms = forward_transforms(transform_type)
                .iter()
                .enumerate()
                .map(|(i, ext)| b.transform_path(i, *ext))
                .collect::<Result<Vec<_>, _>>()?;
            let applied = apply
                .iter()
                .map(|a| b.output(&a.origin, atlas, None))
                .collect::<Result<Vec<_>, _>>()?;

            let (warped_h, tf) = b
                .tracker
                .register(moving.handle, template, warped.clone(), xfms.clone())?;
            let mut applied_tracked = vec![];
            for (a, out) in apply.iter().zip(applied.iter()) {
                applied_tracked.push(Tracked {
                    handle: b.tracker.apply(tf, a.handle, out.clone())?,
                    path: out.clone(),
                    origin: parse_name(out)?,
                });
            }

            let apply_in: Vec<PathBuf> = apply.iter().map(|a| a.path.clone()).collect();
            let mut inputs = vec![fixed.clone(), moving.path.clone()];
            inputs.extend(moving_mask.map(Path::to_path_buf));
            inputs.extend(apply_in.iter().cloned());

            let request = RegistrationRequest {
                fixed,
                moving: Some(moving.path.clone()),
                moving_mask: moving_mask.map(Path::to_path_buf),
                transform_type: transform_type.to_string(),
                apply_images: apply_in.clone(),
                apply_suffix: ATLAS_APPLY_SUFFIX.to_string(),
                is_label: false,
                ..Default::default()
            };
            let (w, x, outs) = (warped.clone(), xfms.clone(), applied.clone());
            b.stages.push(
                StageDescriptor::new(ATLAS_REGISTER, move |ctx| {
                    let out_dir = ctx.scratch("applied");
                    let request = RegistrationRequest {
                        output_prefix: ctx.scratch("reg"),
                        apply_out_dir: Some(out_dir.clone()),
                        ..request
                    };
                    ctx.invoke(&tb.register(&request))?;
                    if ctx.is_dry_run() {
                        return Ok(());
                    }
                    ctx.rename(&ctx.scratch("reg_warped.nii.gz"), &ctx.staged(&w))?;
                    for (found, xfm) in forward_outputs(ctx.staging_dir(), x.len())?.iter().zip(x.iter()) {
                        ctx.rename(found, &ctx.staged(xfm))?;
                    }
                    for (image, out) in apply_in.iter().zip(outs.iter()) {
                        ctx.rename(&applied_name(&out_dir, image)?, &ctx.staged(out))?;
                    }
                    Ok(())
                })
                .inputs(inputs)
                .output(warped.clone())
                .outputs(xfms)
                .outputs(applied),
            );

            let warped_tracked = Tracked {
                handle: warped_h,
                origin: parse_name(&warped)?,
                path: warped,
            };
            Ok((tf, warped_tracked, applied_tracked))
        })
    }

    /// 以最近邻插值把标签图像重采样到图谱空间, 复用已有变换.
    fn apply_labels(
        &mut self,
        template: ImageHandle,
        tf: TransformHandle,
        labels: &[Tracked],
        transform_type: &str,
    ) -> Result<(), PipelineError> {
        let tb = self.tb;
        self.step(ATLAS_APPLY_LABELS, |b| {
            let atlas = b.tracker.space(template)?.label().map(str::to_string);
            let fixed = b.tracker.path(template)?.to_path_buf();
            let xfms = b.tracker.transform_files(tf)?.to_vec();
            let mut outs = vec![];
            for label in labels.iter() {
                let out = b.output(&label.origin, atlas.as_deref(), None)?;
                b.tracker.apply(tf, label.handle, out.clone())?;
                outs.push(out);
            }

            let label_in: Vec<PathBuf> = labels.iter().map(|l| l.path.clone()).collect();
            let request = RegistrationRequest {
                fixed: fixed.clone(),
                transform_type: transform_type.to_string(),
                transform_files: xfms.clone(),
                apply_images: label_in.clone(),
                apply_suffix: ATLAS_APPLY_SUFFIX.to_string(),
                is_label: true,
                ..Default::default()
            };
            let staged_outs = outs.clone();
            b.stages.push(
                StageDescriptor::new(ATLAS_APPLY_LABELS, move |ctx| {
                    let out_dir = ctx.scratch("applied");
                    let request = RegistrationRequest {
                        output_prefix: ctx.scratch("labels"),
                        apply_out_dir: Some(out_dir.clone()),
                        ..request
                    };
                    ctx.invoke(&tb.register(&request))?;
                    if ctx.is_dry_run() {
                        return Ok(());
                    }
                    for (image, out) in label_in.iter().zip(staged_outs.iter()) {
                        ctx.rename(&applied_name(&out_dir, image)?, &ctx.staged(out))?;
                    }
                    Ok(())
                })
                .input(fixed)
                .inputs(xfms)
                .inputs(labels.iter().map(|l| l.path.clone()))
                .outputs(outs),
            );
            Ok(())
        })
    }

    /// 以最近邻插值把图谱 ROI 掩膜重采样到模板网格.
    ///
    /// # 返回值
    ///
    /// `(名字, 重采样后的路径, 句柄)`, 与 `rois` 同序.
    fn resample_rois(
        &mut self,
        template: ImageHandle,
        rois: &[(String, PathBuf)],
    ) -> Result<Vec<(String, PathBuf, ImageHandle)>, PipelineError> {
        let tb = self.tb;
        self.step(ATLAS_RESAMPLE_ROIS, |b| {
            let atlas = b.tracker.space(template)?.label().map(str::to_string);
            let fixed = b.tracker.path(template)?.to_path_buf();
            let mut resampled = vec![];
            for (i, (name, path)) in rois.iter().enumerate() {
                let out = b.ses.path(
                    Datatype::Work,
                    &b.ses
                        .name("mask", Extension::NiiGz)?
                        .with_space(atlas.as_deref())?
                        .with_desc(&format!("roi{i}"))?,
                );
                let source = b.tracker.source(path, Space::Atlas);
                let handle = b.tracker.resample_to(source, template, out.clone())?;
                resampled.push((name.clone(), out, handle));
            }

            let jobs: Vec<(PathBuf, PathBuf)> = rois
                .iter()
                .zip(resampled.iter())
                .map(|((_, i), (_, o, _))| (i.clone(), o.clone()))
                .collect();
            let reference = fixed.clone();
            b.stages.push(
                StageDescriptor::new(ATLAS_RESAMPLE_ROIS, move |ctx| {
                    for (roi, out) in jobs.iter() {
                        ctx.invoke(&tb.ants_apply(
                            roi,
                            &reference,
                            &[],
                            Interpolation::NearestNeighbor,
                            false,
                            &ctx.staged(out),
                        ))?;
                    }
                    Ok(())
                })
                .input(fixed)
                .inputs(rois.iter().map(|(_, p)| p.clone()))
                .outputs(resampled.iter().map(|(_, p, _)| p.clone())),
            );
            Ok(resampled)
        })
    }

    /// 每张图谱空间标量图一个 CSV.
    fn roi_metrics(
        &mut self,
        scalars: &[Tracked],
        rois: &[(String, PathBuf, ImageHandle)],
    ) -> Result<(), PipelineError> {
        self.step(ROI_METRICS, |b| {
            let mut jobs = vec![];
            for (_, _, roi) in rois.iter() {
                for scalar in scalars.iter() {
                    b.tracker.assert_same_space(scalar.handle, *roi)?;
                }
            }
            for scalar in scalars.iter() {
                let mut name = b
                    .ses
                    .name("metrics", Extension::Csv)?
                    .with_space(scalar.origin.space())?;
                if let Some(desc) = scalar.origin.desc() {
                    name = name.with_desc(desc)?;
                }
                jobs.push((scalar.path.clone(), b.ses.path(Datatype::Dwi, &name)));
            }

            let outputs: Vec<PathBuf> = jobs.iter().map(|(_, csv)| csv.clone()).collect();
            let inputs: Vec<PathBuf> = jobs
                .iter()
                .map(|(s, _)| s.clone())
                .chain(rois.iter().map(|(_, p, _)| p.clone()))
                .collect();
            let rois: Vec<(String, PathBuf)> =
                rois.iter().map(|(n, p, _)| (n.clone(), p.clone())).collect();
            b.stages.push(
                StageDescriptor::new(ROI_METRICS, move |ctx| {
                    for (scalar, csv) in jobs.iter() {
                        let staged = ctx.staged(csv);
                        ctx.in_process(&format!("extract ROI metrics of `{}`", scalar.display()), || {
                            let table = roi::extract(scalar, &rois)?;
                            info!(scalar = %scalar.display(), rois = table.rois.len(), "ROI metrics extracted");
                            fs::write(&staged, table.to_csv()).map_err(StageError::io_at(&staged))
                        })?;
                    }
                    Ok(())
                })
                .inputs(inputs)
                .outputs(outputs),
            );
            Ok(())
        })
    }
}

/// 为一个会话声明图谱配准流水线的阶段列表. 输出写入 `tree`.
///
/// # 注意
///
/// 所有输入 (运动图像, 重采样图像, 标签, 病灶掩膜) 都视为与运动图像同网格.
pub fn plan<'a>(
    tb: &'a Toolbox<'a>,
    tree: &DerivativeTree,
    session: &Session<AtlasInputs>,
    opts: &AtlasOptions,
) -> Result<SessionPlan<'a>, PipelineError> {
    let ses = tree.session(&session.subject, &session.session)?;
    let inputs = &session.inputs;
    let mut b = AtlasBuilder {
        tb,
        ses,
        datatype: match opts.target {
            AtlasTarget::Anat => Datatype::Anat,
            AtlasTarget::Scalar => Datatype::Dwi,
        },
        tracker: SpaceTracker::new(),
        stages: vec![],
    };

    let template = b.tracker.source(&opts.template, Space::Atlas);
    let moving_h = b.tracker.source(&inputs.moving, Space::Native);
    let mut images = vec![Tracked {
        handle: moving_h,
        path: inputs.moving.clone(),
        origin: parse_name(&inputs.moving).map_err(PipelineError::plan(ATLAS_REGISTER))?,
    }];
    let same_grid = inputs
        .apply
        .iter()
        .chain(inputs.labels.iter())
        .chain(inputs.moving_mask.iter());
    for path in same_grid {
        let step = |b: &mut AtlasBuilder| -> Result<Tracked, StageError> {
            Ok(Tracked {
                handle: b.tracker.derive(moving_h, path.clone())?,
                path: path.clone(),
                origin: parse_name(path)?,
            })
        };
        images.push(step(&mut b).map_err(PipelineError::plan(ATLAS_REGISTER))?);
    }

    if !opts.reorientation.is_identity() {
        b.reorient(&mut images, &opts.reorientation)?;
    }

    let n_apply = inputs.apply.len();
    let n_labels = inputs.labels.len();
    let moving = &images[0];
    let apply = &images[1..1 + n_apply];
    let labels = &images[1 + n_apply..1 + n_apply + n_labels];
    let moving_mask = images.get(1 + n_apply + n_labels).map(|m| m.path.clone());

    let (tf, warped, applied) = b.register(
        template,
        moving,
        moving_mask.as_deref(),
        apply,
        &opts.transform_type,
    )?;
    if !labels.is_empty() {
        b.apply_labels(template, tf, labels, &opts.transform_type)?;
    }
    if opts.target == AtlasTarget::Scalar && !opts.rois.is_empty() {
        let mut scalars = vec![warped];
        scalars.extend(applied);
        let rois = b.resample_rois(template, &opts.rois)?;
        b.roi_metrics(&scalars, &rois)?;
    }

    Ok(SessionPlan {
        tree: b.ses,
        tracker: b.tracker,
        stages: b.stages,
    })
}
