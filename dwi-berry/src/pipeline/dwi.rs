//! DTI 流水线的两个变体: T1 空间 (`pdti`) 和原生空间 (`pigdti`).
//!
//! 两个变体共享 T1 预处理链和 DWI 预处理链, 区别在于脑掩膜的来源
//! 以及张量拟合所在的网格.

use super::SessionPlan;
use crate::consts::DTI_METRICS;
use crate::data::{is_4d, Reorientation};
use crate::dataset::{DwiInputs, Session};
use crate::error::{PipelineError, StageError};
use crate::naming::{
    insert_suffix, ArtifactName, Datatype, DerivativeTree, Extension, NamingError, SessionTree,
};
use crate::space::{ImageHandle, Space, SpaceTracker, TransformHandle};
use crate::stage::StageDescriptor;
use crate::tool::commands::{Gradients, Interpolation, PhaseCorrection, QuickTransform};
use crate::tool::Toolbox;
use crate::MaskVolume;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 阶段名.
pub mod stages {
    #![allow(missing_docs)]

    pub const T1_SELECT_FRAME: &str = "t1_select_frame";
    pub const T1_REORIENT: &str = "t1_reorient";
    pub const T1_BIAS_CORRECT: &str = "t1_bias_correct";
    pub const BRAIN_MASK: &str = "brain_mask";
    pub const MASK_REVIEW: &str = "mask_review";
    pub const MASK_POLISH: &str = "mask_polish";
    pub const DWI_DENOISE: &str = "dwi_denoise";
    pub const DWI_DEGIBBS: &str = "dwi_degibbs";
    pub const DWI_PREPROC: &str = "dwi_preproc";
    pub const DWI_BIAS_CORRECT: &str = "dwi_bias_correct";
    pub const DWI_MEAN_B0: &str = "dwi_mean_b0";
    pub const DWI_TO_T1: &str = "dwi_to_t1";
    pub const DWI_RESAMPLE_T1: &str = "dwi_resample_t1";
    pub const TENSOR_FIT: &str = "tensor_fit";
    pub const T1_TO_DWI: &str = "t1_to_dwi";
}

use stages::*;

/// DTI 流水线变体.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DtiVariant {
    /// DWI 刚体配准到 T1, 在 T1 网格上拟合张量; 掩膜由 T1 生成.
    T1Space,

    /// 在 DWI 原生网格上拟合张量; 掩膜由平均 b0 生成或由用户提供.
    Native,
}

impl DtiVariant {
    /// 默认的衍生目录名.
    pub const fn default_deriv_name(&self) -> &'static str {
        match self {
            Self::T1Space => crate::consts::T1_SPACE_DERIV_NAME,
            Self::Native => crate::consts::NATIVE_DERIV_NAME,
        }
    }
}

/// DTI 流水线选项 (来自命令行).
#[derive(Clone, Debug)]
pub struct DtiOptions {
    /// 变体.
    pub variant: DtiVariant,

    /// T1 的体素重定向. 恒等时不产生重定向阶段.
    pub reorientation: Reorientation,

    /// 跳过交互式审阅, 直接采用生成的掩膜.
    pub skip_review: bool,

    /// 用户提供的原始掩膜 (仅原生变体), 须与 DWI 同网格.
    pub manual_mask: Option<PathBuf>,

    /// 额外把 T1 刚体配准到 DWI (仅原生变体).
    pub t1_to_dwi: bool,
}

impl DtiOptions {
    /// 给定变体的默认选项.
    pub fn new(variant: DtiVariant) -> Self {
        Self {
            variant,
            reorientation: Reorientation::identity(),
            skip_review: false,
            manual_mask: None,
            t1_to_dwi: false,
        }
    }
}

/// 决定阶段列表形状的二元条件.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Features {
    /// 存在场图对: `-rpe_pair`, 否则 `-rpe_none`.
    pub has_fieldmap: bool,

    /// T1 是 4D 的: 先取第一帧.
    pub t1_is_4d: bool,

    /// 需要重定向 T1.
    pub reorient: bool,

    /// 需要 T1 到 DWI 的配准.
    pub t1_to_dwi: bool,
}

impl Features {
    /// 由会话输入和选项得出. 需要读取 T1 的 header.
    pub fn detect(inputs: &DwiInputs, opts: &DtiOptions) -> Result<Self, StageError> {
        Ok(Self {
            has_fieldmap: inputs.fieldmap.is_some(),
            t1_is_4d: is_4d(&inputs.t1w)?,
            reorient: !opts.reorientation.is_identity(),
            t1_to_dwi: opts.variant == DtiVariant::Native && opts.t1_to_dwi,
        })
    }
}

/// 预处理后的 DWI 及其梯度表.
#[derive(Clone, Debug)]
struct DwiState {
    image: ImageHandle,
    bvec: PathBuf,
    bval: PathBuf,
}

impl DwiState {
    fn gradients(&self) -> Gradients<'_> {
        Gradients {
            bvec: &self.bvec,
            bval: &self.bval,
        }
    }
}

/// 阶段列表的构造器. 每一步都在声明时完成命名与空间记账.
struct DagBuilder<'a> {
    tb: &'a Toolbox<'a>,
    ses: SessionTree,
    tracker: SpaceTracker,
    stages: Vec<StageDescriptor<'a>>,
}

impl<'a> DagBuilder<'a> {
    fn new(tb: &'a Toolbox<'a>, ses: SessionTree) -> Self {
        Self {
            tb,
            ses,
            tracker: SpaceTracker::new(),
            stages: vec![],
        }
    }

    /// 在声明阶段 `name` 时运行 `f`, 把错误附上阶段名.
    fn step<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> Result<T, StageError>,
    ) -> Result<T, PipelineError> {
        f(self).map_err(PipelineError::plan(name))
    }

    /// 与 `parent` 同网格的产物路径.
    fn same_grid(
        &self,
        parent: ImageHandle,
        datatype: Datatype,
        desc: &str,
        suffix: &str,
    ) -> Result<PathBuf, StageError> {
        let tag = self.tracker.resolve_space_tag(parent)?;
        Ok(self.ses.nifti(datatype, tag, desc, suffix)?)
    }

    /// 被移到 `target` 网格上的产物路径.
    fn onto_grid(
        &self,
        target: ImageHandle,
        datatype: Datatype,
        desc: &str,
        suffix: &str,
    ) -> Result<PathBuf, StageError> {
        let tag = self.tracker.space(target)?.label();
        Ok(self.ses.nifti(datatype, tag, desc, suffix)?)
    }

    /// 梯度表路径 `(bvec, bval)`.
    fn gradient_paths(&self, image: &Path) -> Result<(PathBuf, PathBuf), StageError> {
        let file_name = image
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| NamingError::Unparsable(image.display().to_string()))?;
        let name = ArtifactName::parse(file_name)?;
        let dir = self.ses.datatype_dir(Datatype::Dwi);
        Ok((
            dir.join(name.clone().with_extension(Extension::Bvec).file_name()),
            dir.join(name.with_extension(Extension::Bval).file_name()),
        ))
    }

    fn transform_path(&self, datatype: Datatype, desc: &str) -> Result<PathBuf, StageError> {
        let name = self.ses.name("xfm", Extension::Mat)?.with_desc(desc)?;
        Ok(self.ses.path(datatype, &name))
    }

    fn finish(self) -> SessionPlan<'a> {
        SessionPlan {
            tree: self.ses,
            tracker: self.tracker,
            stages: self.stages,
        }
    }

    /// T1 链: [取第一帧] -> [重定向] -> 偏置场校正.
    fn t1_chain(
        &mut self,
        inputs: &DwiInputs,
        opts: &DtiOptions,
        features: &Features,
    ) -> Result<ImageHandle, PipelineError> {
        let tb = self.tb;
        let mut t1 = self.tracker.source(&inputs.t1w, Space::T1w);
        let mut t1_path = inputs.t1w.clone();

        if features.t1_is_4d {
            t1 = self.step(T1_SELECT_FRAME, |b| {
                let out = b.same_grid(t1, Datatype::Anat, "frame0", "T1w")?;
                let (i, o) = (t1_path.clone(), out.clone());
                b.stages.push(
                    StageDescriptor::new(T1_SELECT_FRAME, move |ctx| {
                        ctx.invoke(&tb.select_first_frame(&i, &ctx.staged(&o)))
                    })
                    .input(t1_path.clone())
                    .output(out.clone()),
                );
                t1_path = out.clone();
                Ok(b.tracker.derive(t1, out)?)
            })?;
        }

        if features.reorient {
            let r = opts.reorientation.clone();
            t1 = self.step(T1_REORIENT, |b| {
                let out = b.same_grid(t1, Datatype::Anat, "reoriented", "T1w")?;
                let (i, o, op) = (t1_path.clone(), out.clone(), r.clone());
                b.stages.push(
                    StageDescriptor::new(T1_REORIENT, move |ctx| {
                        let staged = ctx.staged(&o);
                        ctx.in_process(&format!("reorient ({op})"), || {
                            Ok(op.apply_file(&i, &staged)?)
                        })
                    })
                    .input(t1_path.clone())
                    .output(out.clone()),
                );
                t1_path = out.clone();
                Ok(b.tracker.reorient(t1, out, r)?)
            })?;
        }

        self.step(T1_BIAS_CORRECT, |b| {
            let out = b.same_grid(t1, Datatype::Anat, "biascorr", "T1w")?;
            let (i, o) = (t1_path.clone(), out.clone());
            b.stages.push(
                StageDescriptor::new(T1_BIAS_CORRECT, move |ctx| {
                    ctx.invoke(&tb.n4(&i, &ctx.staged(&o)))
                })
                .input(t1_path.clone())
                .output(out.clone()),
            );
            Ok(b.tracker.derive(t1, out)?)
        })
    }

    /// DWI 链: 去噪 -> 去 Gibbs -> 失真校正 -> 偏置场校正 -> 平均 b0.
    ///
    /// # 返回值
    ///
    /// `(预处理后的 DWI, 平均 b0)`.
    fn dwi_chain(&mut self, inputs: &DwiInputs) -> Result<(DwiState, ImageHandle), PipelineError> {
        let tb = self.tb;
        let raw = self.tracker.source(&inputs.dwi, Space::Dwi);

        let denoised = self.step(DWI_DENOISE, |b| {
            let out = b.same_grid(raw, Datatype::Dwi, "denoised", "dwi")?;
            let (i, o) = (inputs.dwi.clone(), out.clone());
            b.stages.push(
                StageDescriptor::new(DWI_DENOISE, move |ctx| {
                    ctx.invoke(&tb.dwidenoise(&i, &ctx.staged(&o)))
                })
                .input(inputs.dwi.clone())
                .output(out.clone()),
            );
            Ok(b.tracker.derive(raw, out)?)
        })?;

        let degibbs = self.step(DWI_DEGIBBS, |b| {
            let input = b.tracker.path(denoised)?.to_path_buf();
            let out = b.same_grid(denoised, Datatype::Dwi, "degibbs", "dwi")?;
            let (i, o) = (input.clone(), out.clone());
            b.stages.push(
                StageDescriptor::new(DWI_DEGIBBS, move |ctx| {
                    ctx.invoke(&tb.mrdegibbs(&i, &ctx.staged(&o)))
                })
                .input(input)
                .output(out.clone()),
            );
            Ok(b.tracker.derive(denoised, out)?)
        })?;

        let preproc = self.step(DWI_PREPROC, |b| {
            let input = b.tracker.path(degibbs)?.to_path_buf();
            let out = b.same_grid(degibbs, Datatype::Dwi, "preproc", "dwi")?;
            let (bvec, bval) = b.gradient_paths(&out)?;
            let (raw_bvec, raw_bval) = (inputs.bvec.clone(), inputs.bval.clone());
            let json = inputs.json.clone();
            let fieldmap = inputs.fieldmap.clone();

            let mut stage = StageDescriptor::new(DWI_PREPROC, {
                let (i, o, bvec, bval) = (input.clone(), out.clone(), bvec.clone(), bval.clone());
                let (raw_bvec, raw_bval) = (raw_bvec.clone(), raw_bval.clone());
                let (json, fieldmap) = (json.clone(), fieldmap.clone());
                move |ctx| {
                    let se_epi = ctx.scratch("se_epi_pair.nii.gz");
                    let correction = match &fieldmap {
                        Some(pair) => {
                            ctx.invoke(&tb.concat(
                                &[pair.forward.as_path(), pair.reverse.as_path()],
                                &se_epi,
                            ))?;
                            PhaseCorrection::RpePair(&se_epi)
                        }
                        None => PhaseCorrection::RpeNone,
                    };
                    let (staged_bvec, staged_bval) = (ctx.staged(&bvec), ctx.staged(&bval));
                    ctx.invoke(&tb.dwifslpreproc(
                        &i,
                        Gradients {
                            bvec: &raw_bvec,
                            bval: &raw_bval,
                        },
                        json.as_deref(),
                        correction,
                        &ctx.staged(&o),
                        Gradients {
                            bvec: &staged_bvec,
                            bval: &staged_bval,
                        },
                    ))
                }
            })
            .inputs([input, raw_bvec, raw_bval])
            .inputs(json)
            .outputs([out.clone(), bvec.clone(), bval.clone()]);
            if let Some(pair) = fieldmap {
                stage = stage.inputs([pair.forward, pair.reverse]);
            }
            b.stages.push(stage);
            Ok(DwiState {
                image: b.tracker.derive(degibbs, out)?,
                bvec,
                bval,
            })
        })?;

        let corrected = self.step(DWI_BIAS_CORRECT, |b| {
            let input = b.tracker.path(preproc.image)?.to_path_buf();
            let out = b.same_grid(preproc.image, Datatype::Dwi, "biascorr", "dwi")?;
            let (i, o, grad) = (input.clone(), out.clone(), preproc.clone());
            b.stages.push(
                StageDescriptor::new(DWI_BIAS_CORRECT, move |ctx| {
                    ctx.invoke(&tb.dwibiascorrect(&i, grad.gradients(), &ctx.staged(&o)))
                })
                .inputs([input, preproc.bvec.clone(), preproc.bval.clone()])
                .output(out.clone()),
            );
            Ok(DwiState {
                image: b.tracker.derive(preproc.image, out)?,
                ..preproc.clone()
            })
        })?;

        let b0 = self.step(DWI_MEAN_B0, |b| {
            let input = b.tracker.path(corrected.image)?.to_path_buf();
            let out = b.same_grid(corrected.image, Datatype::Dwi, "meanb0", "dwi")?;
            let (i, o, grad) = (input.clone(), out.clone(), corrected.clone());
            b.stages.push(
                StageDescriptor::new(DWI_MEAN_B0, move |ctx| {
                    let b0s = ctx.scratch("b0s.nii.gz");
                    ctx.invoke(&tb.extract_b0(&i, grad.gradients(), &b0s))?;
                    ctx.invoke(&tb.mean_over_volumes(&b0s, &ctx.staged(&o)))
                })
                .inputs([input, corrected.bvec.clone(), corrected.bval.clone()])
                .output(out.clone()),
            );
            Ok(b.tracker.derive(corrected.image, out)?)
        })?;

        Ok((corrected, b0))
    }

    /// 对 `gray` 做颅骨剥离, 得到原始脑掩膜 (与 `gray` 同网格).
    /// 给出 `brain_suffix` 时剥离后的图像也作为产物保留.
    fn bet_mask(
        &mut self,
        gray: ImageHandle,
        datatype: Datatype,
        brain_suffix: Option<&str>,
    ) -> Result<ImageHandle, PipelineError> {
        let tb = self.tb;
        self.step(BRAIN_MASK, |b| {
            let input = b.tracker.path(gray)?.to_path_buf();
            let raw = b.same_grid(gray, datatype, "brainraw", "mask")?;
            let brain = match brain_suffix {
                Some(suffix) => Some(b.same_grid(gray, datatype, "brain", suffix)?),
                None => None,
            };
            let (i, o, brain_out) = (input.clone(), raw.clone(), brain.clone());
            b.stages.push(
                StageDescriptor::new(BRAIN_MASK, move |ctx| {
                    let staged_brain = match &brain_out {
                        Some(p) => ctx.staged(p),
                        None => ctx.scratch("brain.nii.gz"),
                    };
                    let bet_mask = insert_suffix(&staged_brain, "_mask")?;
                    ctx.invoke(&tb.bet(&i, &staged_brain, &bet_mask))?;
                    ctx.rename(&bet_mask, &ctx.staged(&o))
                })
                .input(input)
                .output(raw.clone())
                .outputs(brain.clone()),
            );
            if let Some(brain) = brain {
                b.tracker.derive(gray, brain)?;
            }
            Ok(b.tracker.derive(gray, raw)?)
        })
    }

    /// 用户提供的原始掩膜, 视为与 `grid_of` 同网格.
    fn seeded_mask(
        &mut self,
        manual: &Path,
        grid_of: ImageHandle,
        datatype: Datatype,
    ) -> Result<ImageHandle, PipelineError> {
        self.step(BRAIN_MASK, |b| {
            let raw = b.same_grid(grid_of, datatype, "brainraw", "mask")?;
            let (i, o) = (manual.to_path_buf(), raw.clone());
            b.stages.push(
                StageDescriptor::new(BRAIN_MASK, move |ctx| ctx.copy(&i, &ctx.staged(&o)))
                    .input(manual.to_path_buf())
                    .output(raw.clone()),
            );
            Ok(b.tracker.derive(grid_of, raw)?)
        })
    }

    /// 审阅 -> 精修. 返回精修后的掩膜.
    fn review_and_polish(
        &mut self,
        raw: ImageHandle,
        gray: ImageHandle,
        datatype: Datatype,
        skip_review: bool,
    ) -> Result<ImageHandle, PipelineError> {
        let tb = self.tb;
        let reviewed = self.step(MASK_REVIEW, |b| {
            b.tracker.assert_same_space(raw, gray)?;
            let (raw_path, gray_path) = (
                b.tracker.path(raw)?.to_path_buf(),
                b.tracker.path(gray)?.to_path_buf(),
            );
            let out = b.same_grid(raw, datatype, "brainreviewed", "mask")?;
            let (r, g, o) = (raw_path.clone(), gray_path.clone(), out.clone());
            b.stages.push(
                StageDescriptor::new(MASK_REVIEW, move |ctx| {
                    let staged = ctx.staged(&o);
                    ctx.copy(&r, &staged)?;
                    if skip_review {
                        info!(stage = ctx.stage(), "review skipped, using the generated mask");
                        return Ok(());
                    }
                    // 编辑器退出即视为审阅完成
                    ctx.invoke(&tb.edit_mask(&g, &staged))
                })
                .inputs([raw_path, gray_path])
                .output(out.clone()),
            );
            Ok(b.tracker.derive(raw, out)?)
        })?;

        self.step(MASK_POLISH, |b| {
            let input = b.tracker.path(reviewed)?.to_path_buf();
            let out = b.same_grid(reviewed, datatype, "brain", "mask")?;
            let (i, o) = (input.clone(), out.clone());
            b.stages.push(
                StageDescriptor::new(MASK_POLISH, move |ctx| {
                    let staged = ctx.staged(&o);
                    ctx.in_process("polish mask", || {
                        let (mask, report) = MaskVolume::open(&i)?.polished();
                        info!(
                            rounds = report.rounds,
                            converged = report.converged,
                            before = report.foreground_before,
                            after = report.foreground_after,
                            "mask polished"
                        );
                        if mask.is_empty() {
                            warn!(mask = %i.display(), "mask is empty");
                        }
                        Ok(mask.save(&staged)?)
                    })
                })
                .input(input)
                .output(out.clone()),
            );
            Ok(b.tracker.derive(reviewed, out)?)
        })
    }

    /// ANTs 快速刚体配准 `moving` -> `fixed`. 变换与形变结果都作为产物保留.
    fn rigid(
        &mut self,
        name: &str,
        moving: ImageHandle,
        fixed: ImageHandle,
        outputs: (Datatype, &str, &str, &str),
    ) -> Result<(ImageHandle, TransformHandle), PipelineError> {
        let tb = self.tb;
        let (datatype, xfm_desc, desc, suffix) = outputs;
        let stage = name.to_string();
        self.step(name, |b| {
            let (m, f) = (
                b.tracker.path(moving)?.to_path_buf(),
                b.tracker.path(fixed)?.to_path_buf(),
            );
            let xfm = b.transform_path(datatype, xfm_desc)?;
            let warped = b.onto_grid(fixed, datatype, desc, suffix)?;
            let (mi, fi, xo, wo) = (m.clone(), f.clone(), xfm.clone(), warped.clone());
            b.stages.push(
                StageDescriptor::new(stage, move |ctx| {
                    let prefix = ctx.scratch("rigid_");
                    let prefix_str = prefix.to_string_lossy().into_owned();
                    ctx.invoke(&tb.ants_quick(&fi, &mi, &prefix, QuickTransform::Rigid))?;
                    ctx.rename(
                        Path::new(&format!("{prefix_str}0GenericAffine.mat")),
                        &ctx.staged(&xo),
                    )?;
                    ctx.rename(Path::new(&format!("{prefix_str}Warped.nii.gz")), &ctx.staged(&wo))
                })
                .inputs([m, f])
                .outputs([xfm.clone(), warped.clone()]),
            );
            Ok(b.tracker.register(moving, fixed, warped, vec![xfm])?)
        })
    }

    /// 张量拟合, 输出 FA / MD / AD / RD, 与 `dwi` 同网格.
    fn tensor_fit(&mut self, dwi: &DwiState, mask: ImageHandle) -> Result<(), PipelineError> {
        let tb = self.tb;
        self.step(TENSOR_FIT, |b| {
            b.tracker.assert_same_space(dwi.image, mask)?;
            let input = b.tracker.path(dwi.image)?.to_path_buf();
            let mask_path = b.tracker.path(mask)?.to_path_buf();
            let metrics = DTI_METRICS
                .iter()
                .map(|m| b.same_grid(dwi.image, Datatype::Dwi, m, "dwi"))
                .collect::<Result<Vec<_>, _>>()?;
            let (i, mp, grad, outs) = (input.clone(), mask_path.clone(), dwi.clone(), metrics.clone());
            b.stages.push(
                StageDescriptor::new(TENSOR_FIT, move |ctx| {
                    let tensor = ctx.scratch("tensor.nii.gz");
                    ctx.invoke(&tb.dwi2tensor(&i, &mp, grad.gradients(), &tensor))?;
                    let [fa, md, ad, rd] = [0, 1, 2, 3].map(|i| ctx.staged(&outs[i]));
                    ctx.invoke(&tb.tensor2metric(
                        &tensor,
                        &mp,
                        [fa.as_path(), md.as_path(), ad.as_path(), rd.as_path()],
                    ))
                })
                .inputs([input, mask_path, dwi.bvec.clone(), dwi.bval.clone()])
                .outputs(metrics.clone()),
            );
            for m in metrics {
                b.tracker.derive(dwi.image, m)?;
            }
            Ok(())
        })
    }
}

/// 为一个会话声明 DTI 流水线的阶段列表.
///
/// # 注意
///
/// 声明时会读取 T1 的 header 以判断是否为 4D.
pub fn plan<'a>(
    tb: &'a Toolbox<'a>,
    tree: &DerivativeTree,
    session: &Session<DwiInputs>,
    opts: &DtiOptions,
) -> Result<SessionPlan<'a>, PipelineError> {
    let ses = tree.session(&session.subject, &session.session)?;
    let inputs = &session.inputs;
    let features = Features::detect(inputs, opts).map_err(PipelineError::plan(T1_SELECT_FRAME))?;
    let mut b = DagBuilder::new(tb, ses);

    let t1 = b.t1_chain(inputs, opts, &features)?;
    match opts.variant {
        DtiVariant::T1Space => {
            let raw = b.bet_mask(t1, Datatype::Anat, Some("T1w"))?;
            let mask = b.review_and_polish(raw, t1, Datatype::Anat, opts.skip_review)?;
            let (dwi, b0) = b.dwi_chain(inputs)?;
            let (_, xfm) = b.rigid(
                DWI_TO_T1,
                b0,
                t1,
                (Datatype::Dwi, "dwiToT1w", "meanb0", "dwi"),
            )?;
            let resampled = b.step(DWI_RESAMPLE_T1, |b| {
                let input = b.tracker.path(dwi.image)?.to_path_buf();
                let reference = b.tracker.path(t1)?.to_path_buf();
                let xfms = b.tracker.transform_files(xfm)?.to_vec();
                let out = b.onto_grid(t1, Datatype::Dwi, "biascorr", "dwi")?;
                let (i, r, x, o) = (input.clone(), reference.clone(), xfms.clone(), out.clone());
                b.stages.push(
                    StageDescriptor::new(DWI_RESAMPLE_T1, move |ctx| {
                        let transforms: Vec<(&Path, bool)> =
                            x.iter().map(|p| (p.as_path(), false)).collect();
                        ctx.invoke(&tb.ants_apply(
                            &i,
                            &r,
                            &transforms,
                            Interpolation::Linear,
                            true,
                            &ctx.staged(&o),
                        ))
                    })
                    .inputs([input, reference])
                    .inputs(xfms)
                    .output(out.clone()),
                );
                Ok(DwiState {
                    image: b.tracker.apply(xfm, dwi.image, out)?,
                    ..dwi.clone()
                })
            })?;
            b.tensor_fit(&resampled, mask)?;
        }
        DtiVariant::Native => {
            let (dwi, b0) = b.dwi_chain(inputs)?;
            let raw = match opts.manual_mask.as_deref() {
                Some(manual) => b.seeded_mask(manual, b0, Datatype::Dwi)?,
                None => b.bet_mask(b0, Datatype::Dwi, None)?,
            };
            let mask = b.review_and_polish(raw, b0, Datatype::Dwi, opts.skip_review)?;
            b.tensor_fit(&dwi, mask)?;
            if features.t1_to_dwi {
                b.rigid(
                    T1_TO_DWI,
                    t1,
                    b0,
                    (Datatype::Anat, "T1wTodwi", "biascorr", "T1w"),
                )?;
            }
        }
    }
    Ok(b.finish())
}
