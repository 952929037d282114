//! 各外部工具的命令行构造.
//!
//! 这里只拼接参数并登记期望输出, 不执行任何命令.

use super::ToolInvocation;
use crate::config::PipelineConfig;
use crate::naming::Extension;
use std::path::{Path, PathBuf};

/// 梯度表 (FSL 格式).
#[derive(Clone, Copy, Debug)]
pub struct Gradients<'a> {
    /// `.bvec` 文件.
    pub bvec: &'a Path,

    /// `.bval` 文件.
    pub bval: &'a Path,
}

impl Gradients<'_> {
    fn fslgrad(&self) -> [String; 3] {
        [
            "-fslgrad".to_string(),
            self.bvec.to_string_lossy().into_owned(),
            self.bval.to_string_lossy().into_owned(),
        ]
    }
}

/// `dwifslpreproc` 的失真校正方式.
#[derive(Clone, Copy, Debug)]
pub enum PhaseCorrection<'a> {
    /// 有一对相反相位编码的自旋回波 b0 (已拼接为一个文件).
    RpePair(&'a Path),

    /// 没有场图.
    RpeNone,
}

/// 插值方式.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interpolation {
    /// 线性插值, 用于灰度图.
    Linear,

    /// 最近邻插值, 用于掩膜 / 标签.
    NearestNeighbor,
}

impl Interpolation {
    fn ants_name(&self) -> &'static str {
        match self {
            Self::Linear => "Linear",
            Self::NearestNeighbor => "NearestNeighbor",
        }
    }
}

/// ANTs 快速配准的变换类型.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuickTransform {
    /// 刚体.
    Rigid,

    /// 仿射.
    Affine,
}

impl QuickTransform {
    fn flag(&self) -> &'static str {
        match self {
            Self::Rigid => "r",
            Self::Affine => "a",
        }
    }
}

/// 配准协作脚本的一次调用参数.
#[derive(Clone, Debug, Default)]
pub struct RegistrationRequest {
    /// 固定图像 (图谱模板).
    pub fixed: PathBuf,

    /// 运动图像. 为 `None` 时使用 `transform_files`.
    pub moving: Option<PathBuf>,

    /// 运动图像上的病灶掩膜.
    pub moving_mask: Option<PathBuf>,

    /// 输出前缀.
    pub output_prefix: PathBuf,

    /// 变换类型, 例如 `SyN`.
    pub transform_type: String,

    /// 预先计算好的变换.
    pub transform_files: Vec<PathBuf>,

    /// 需要重采样到固定图像网格的图像.
    pub apply_images: Vec<PathBuf>,

    /// 重采样结果目录.
    pub apply_out_dir: Option<PathBuf>,

    /// 重采样结果文件名后缀.
    pub apply_suffix: String,

    /// 是否为标签图像 (最近邻插值).
    pub is_label: bool,
}

/// 配准协作者对 `transform_type` 产生的正向变换, 按编号给出各自的扩展名.
///
/// 1. 纯形变类 (`SyNOnly`, `TV[n]`) 只有形变场;
/// 2. 其余 SyN 家族为形变场 + 仿射;
/// 3. 线性类 (`Rigid`, `Affine`, `QuickRigid` 等) 只有仿射.
pub fn forward_transforms(transform_type: &str) -> &'static [Extension] {
    const WARP: &[Extension] = &[Extension::NiiGz];
    const WARP_AFFINE: &[Extension] = &[Extension::NiiGz, Extension::Mat];
    const AFFINE: &[Extension] = &[Extension::Mat];
    match transform_type {
        "SyNOnly" => WARP,
        t if t.starts_with("TV") => WARP,
        t if t.starts_with("SyN") || t.starts_with("ElasticSyN") => WARP_AFFINE,
        _ => AFFINE,
    }
}

/// 外部工具命令的构造器.
#[derive(Clone, Debug)]
pub struct Toolbox<'a> {
    config: &'a PipelineConfig,
    python: PathBuf,
}

impl<'a> Toolbox<'a> {
    /// 使用 `python_venv/bin/python` 运行配准脚本; 未给出虚拟环境时使用 `python3`.
    pub fn new(config: &'a PipelineConfig, python_venv: Option<&Path>) -> Self {
        let python = match python_venv {
            Some(venv) => venv.join("bin").join("python"),
            None => PathBuf::from("python3"),
        };
        Self { config, python }
    }

    /// 所用配置.
    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        self.config
    }

    /// 追加 `-nthreads` (若已配置).
    fn threads(&self, inv: ToolInvocation) -> ToolInvocation {
        match self.config.nthreads {
            Some(n) => inv.args(["-nthreads".to_string(), n.to_string()]),
            None => inv,
        }
    }

    /// MRtrix3 命令.
    fn mrtrix(&self, tool: &str, program: &Path) -> ToolInvocation {
        self.threads(ToolInvocation::new(tool, program))
    }

    /// 取 4D 图像的第一帧.
    pub fn select_first_frame(&self, input: &Path, output: &Path) -> ToolInvocation {
        self.mrtrix("mrconvert", &self.config.tools.mrconvert)
            .path_arg(input)
            .output_arg(output)
            .args(["-coord", "3", "0", "-axes", "0,1,2"])
    }

    /// 拼接若干图像 (沿第四维).
    pub fn concat(&self, inputs: &[&Path], output: &Path) -> ToolInvocation {
        inputs
            .iter()
            .fold(self.mrtrix("mrcat", &self.config.tools.mrcat), |inv, p| inv.path_arg(p))
            .output_arg(output)
            .args(["-axis", "3"])
    }

    /// N4 偏置场校正.
    pub fn n4(&self, input: &Path, output: &Path) -> ToolInvocation {
        ToolInvocation::new("N4BiasFieldCorrection", &self.config.tools.n4)
            .args(["-d", "3", "-i"])
            .path_arg(input)
            .arg("-o")
            .output_arg(output)
    }

    /// 颅骨剥离. `bet` 会额外生成 `<brain>_mask.nii.gz`.
    pub fn bet(&self, input: &Path, brain: &Path, mask: &Path) -> ToolInvocation {
        ToolInvocation::new("bet", &self.config.tools.bet)
            .path_arg(input)
            .output_arg(brain)
            .args(["-m", "-f", "0.3"])
            .expect_output(mask)
    }

    /// MP-PCA 去噪.
    pub fn dwidenoise(&self, input: &Path, output: &Path) -> ToolInvocation {
        self.mrtrix("dwidenoise", &self.config.tools.dwidenoise)
            .path_arg(input)
            .output_arg(output)
    }

    /// Gibbs 振铃去除.
    pub fn mrdegibbs(&self, input: &Path, output: &Path) -> ToolInvocation {
        self.mrtrix("mrdegibbs", &self.config.tools.mrdegibbs)
            .path_arg(input)
            .output_arg(output)
    }

    /// 涡流 / 运动 / 磁化率失真校正. 校正后的梯度表写到 `out_grad`.
    pub fn dwifslpreproc(
        &self,
        input: &Path,
        grad: Gradients,
        json: Option<&Path>,
        correction: PhaseCorrection,
        output: &Path,
        out_grad: Gradients,
    ) -> ToolInvocation {
        let mut inv = self
            .mrtrix("dwifslpreproc", &self.config.tools.dwifslpreproc)
            .path_arg(input)
            .output_arg(output)
            .args(grad.fslgrad())
            .args(["-pe_dir", self.config.phase_encoding.as_str()]);
        inv = match correction {
            PhaseCorrection::RpePair(se_epi) => inv.args(["-rpe_pair", "-se_epi"]).path_arg(se_epi),
            PhaseCorrection::RpeNone => inv.arg("-rpe_none"),
        };
        if let Some(json) = json {
            inv = inv.arg("-json_import").path_arg(json);
        }
        if !self.config.eddy_options.trim().is_empty() {
            inv = inv.arg("-eddy_options").arg(self.config.eddy_options.clone());
        }
        inv.arg("-export_grad_fsl")
            .output_arg(out_grad.bvec)
            .output_arg(out_grad.bval)
    }

    /// DWI 偏置场校正 (ANTs 算法).
    pub fn dwibiascorrect(&self, input: &Path, grad: Gradients, output: &Path) -> ToolInvocation {
        // 算法名必须是第一个参数
        let inv = ToolInvocation::new("dwibiascorrect", &self.config.tools.dwibiascorrect).arg("ants");
        self.threads(inv)
            .path_arg(input)
            .output_arg(output)
            .args(grad.fslgrad())
    }

    /// 抽取所有 b0 体积.
    pub fn extract_b0(&self, dwi: &Path, grad: Gradients, output: &Path) -> ToolInvocation {
        self.mrtrix("dwiextract", &self.config.tools.dwiextract)
            .path_arg(dwi)
            .output_arg(output)
            .arg("-bzero")
            .args(grad.fslgrad())
    }

    /// 沿第四维求均值.
    pub fn mean_over_volumes(&self, input: &Path, output: &Path) -> ToolInvocation {
        self.mrtrix("mrmath", &self.config.tools.mrmath)
            .path_arg(input)
            .arg("mean")
            .output_arg(output)
            .args(["-axis", "3"])
    }

    /// ANTs 快速配准. 输出 `<prefix>0GenericAffine.mat` 和 `<prefix>Warped.nii.gz`.
    pub fn ants_quick(
        &self,
        fixed: &Path,
        moving: &Path,
        prefix: &Path,
        transform: QuickTransform,
    ) -> ToolInvocation {
        let prefix_str = prefix.to_string_lossy();
        let affine = PathBuf::from(format!("{prefix_str}0GenericAffine.mat"));
        let warped = PathBuf::from(format!("{prefix_str}Warped.nii.gz"));
        ToolInvocation::new("antsRegistrationSyNQuick", &self.config.tools.ants_quick)
            .args(["-d", "3", "-f"])
            .path_arg(fixed)
            .arg("-m")
            .path_arg(moving)
            .arg("-o")
            .path_arg(prefix)
            .args(["-t", transform.flag()])
            .expect_output(&affine)
            .expect_output(&warped)
    }

    /// 用已有变换把 `input` 重采样到 `reference` 的网格. `time_series` 为 `true`
    /// 时逐帧处理 4D 图像. 每个变换可以指定是否取逆.
    pub fn ants_apply(
        &self,
        input: &Path,
        reference: &Path,
        transforms: &[(&Path, bool)],
        interpolation: Interpolation,
        time_series: bool,
        output: &Path,
    ) -> ToolInvocation {
        let mut inv = ToolInvocation::new("antsApplyTransforms", &self.config.tools.ants_apply)
            .args(["-d", "3"]);
        if time_series {
            inv = inv.args(["-e", "3"]);
        }
        inv = inv
            .arg("-i")
            .path_arg(input)
            .arg("-r")
            .path_arg(reference)
            .args(["-n", interpolation.ants_name()]);
        for (path, inverse) in transforms {
            let t = if *inverse {
                format!("[{},1]", path.display())
            } else {
                path.to_string_lossy().into_owned()
            };
            inv = inv.args(["-t".to_string(), t]);
        }
        inv.arg("-o").output_arg(output)
    }

    /// 张量拟合.
    pub fn dwi2tensor(&self, dwi: &Path, mask: &Path, grad: Gradients, tensor: &Path) -> ToolInvocation {
        self.mrtrix("dwi2tensor", &self.config.tools.dwi2tensor)
            .path_arg(dwi)
            .output_arg(tensor)
            .arg("-mask")
            .path_arg(mask)
            .args(grad.fslgrad())
    }

    /// 由张量计算 FA / MD / AD / RD. `metrics` 的顺序与 `DTI_METRICS` 一致.
    pub fn tensor2metric(&self, tensor: &Path, mask: &Path, metrics: [&Path; 4]) -> ToolInvocation {
        let [fa, md, ad, rd] = metrics;
        self.mrtrix("tensor2metric", &self.config.tools.tensor2metric)
            .path_arg(tensor)
            .arg("-mask")
            .path_arg(mask)
            .arg("-fa")
            .output_arg(fa)
            .arg("-adc")
            .output_arg(md)
            .arg("-ad")
            .output_arg(ad)
            .arg("-rd")
            .output_arg(rd)
    }

    /// 交互式掩膜编辑器. 编辑器直接覆盖 `mask`.
    pub fn edit_mask(&self, gray: &Path, mask: &Path) -> ToolInvocation {
        ToolInvocation::new("itksnap", &self.config.tools.editor)
            .arg("-g")
            .path_arg(gray)
            .arg("-s")
            .output_arg(mask)
            .interactive()
    }

    /// 配准协作脚本. 只登记 `<prefix>_warped.nii.gz` (有运动图像时) 和重采样结果为期望输出;
    /// 变换文件名由脚本决定, 调用方自行收集.
    pub fn register(&self, req: &RegistrationRequest) -> ToolInvocation {
        let mut inv = ToolInvocation::new("ANTsReg", &self.python)
            .path_arg(&self.config.tools.registration_script)
            .arg("--fixed_image")
            .path_arg(&req.fixed)
            .arg("--output_prefix")
            .path_arg(&req.output_prefix)
            .args(["--transform_type", req.transform_type.as_str()]);
        if let Some(moving) = req.moving.as_deref() {
            let warped = PathBuf::from(format!("{}_warped.nii.gz", req.output_prefix.display()));
            inv = inv.arg("--moving_image").path_arg(moving).expect_output(&warped);
        }
        if let Some(mask) = req.moving_mask.as_deref() {
            inv = inv.arg("--moving_mask").path_arg(mask);
        }
        if !req.transform_files.is_empty() {
            inv = req
                .transform_files
                .iter()
                .fold(inv.arg("--transform_files"), |inv, p| inv.path_arg(p));
        }
        if !req.apply_images.is_empty() {
            inv = req
                .apply_images
                .iter()
                .fold(inv.arg("--apply_images"), |inv, p| inv.path_arg(p));
            if let Some(dir) = req.apply_out_dir.as_deref() {
                inv = inv.arg("--apply_out_dir").path_arg(dir);
                for image in req.apply_images.iter() {
                    if let Ok(out) = crate::naming::insert_suffix(image, &req.apply_suffix) {
                        if let Some(name) = out.file_name() {
                            inv = inv.expect_output(&dir.join(name));
                        }
                    }
                }
            }
            inv = inv.args(["--apply_suffix", req.apply_suffix.as_str()]);
        }
        if req.is_label {
            inv = inv.arg("--is_label");
        }
        inv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preproc_rpe_none() {
        let cfg = PipelineConfig::default();
        let tb = Toolbox::new(&cfg, None);
        let grad = Gradients {
            bvec: Path::new("in.bvec"),
            bval: Path::new("in.bval"),
        };
        let out_grad = Gradients {
            bvec: Path::new("out.bvec"),
            bval: Path::new("out.bval"),
        };
        let inv = tb.dwifslpreproc(
            Path::new("in.nii.gz"),
            grad,
            None,
            PhaseCorrection::RpeNone,
            Path::new("out.nii.gz"),
            out_grad,
        );
        let args = inv.arguments().join(" ");
        assert!(args.contains("-rpe_none"));
        assert!(!args.contains("-se_epi"));
        assert!(args.contains("-fslgrad in.bvec in.bval"));
        assert!(args.contains("-export_grad_fsl out.bvec out.bval"));
        assert_eq!(inv.expected_outputs().len(), 3);
    }

    #[test]
    fn test_nthreads_only_for_mrtrix() {
        let cfg = PipelineConfig {
            nthreads: Some(2),
            ..Default::default()
        };
        let tb = Toolbox::new(&cfg, None);
        let denoise = tb.dwidenoise(Path::new("a.nii.gz"), Path::new("b.nii.gz"));
        assert_eq!(&denoise.arguments()[..2], &["-nthreads", "2"]);
        let n4 = tb.n4(Path::new("a.nii.gz"), Path::new("b.nii.gz"));
        assert!(!n4.arguments().iter().any(|a| a == "-nthreads"));
    }

    #[test]
    fn test_ants_apply_inverse() {
        let cfg = PipelineConfig::default();
        let tb = Toolbox::new(&cfg, None);
        let inv = tb.ants_apply(
            Path::new("t1.nii.gz"),
            Path::new("b0.nii.gz"),
            &[(Path::new("x0GenericAffine.mat"), true)],
            Interpolation::Linear,
            false,
            Path::new("out.nii.gz"),
        );
        assert!(inv.arguments().iter().any(|a| a == "[x0GenericAffine.mat,1]"));
        assert_eq!(inv.expected_outputs(), &[PathBuf::from("out.nii.gz")]);
    }

    #[test]
    fn test_register_contract() {
        let cfg = PipelineConfig::default();
        let tb = Toolbox::new(&cfg, Some(Path::new("/venv")));
        let req = RegistrationRequest {
            fixed: "atlas.nii.gz".into(),
            moving: Some("t1.nii.gz".into()),
            output_prefix: "/w/reg".into(),
            transform_type: "SyN".into(),
            apply_images: vec!["/d/fa.nii.gz".into(), "/d/md.nii".into()],
            apply_out_dir: Some("/w/applied".into()),
            apply_suffix: "_space-Atlas".into(),
            ..Default::default()
        };
        let inv = tb.register(&req);
        assert_eq!(inv.program(), Path::new("/venv/bin/python"));
        assert_eq!(
            inv.expected_outputs(),
            &[
                PathBuf::from("/w/reg_warped.nii.gz"),
                PathBuf::from("/w/applied/fa_space-Atlas.nii.gz"),
                PathBuf::from("/w/applied/md_space-Atlas.nii"),
            ]
        );
        assert!(!inv.arguments().iter().any(|a| a == "--is_label"));
    }

    #[test]
    fn test_forward_transforms() {
        assert_eq!(forward_transforms("SyNAggro"), &[Extension::NiiGz, Extension::Mat]);
        assert_eq!(forward_transforms("ElasticSyN"), &[Extension::NiiGz, Extension::Mat]);
        assert_eq!(forward_transforms("SyNOnly"), &[Extension::NiiGz]);
        assert_eq!(forward_transforms("TV[2]"), &[Extension::NiiGz]);
        assert_eq!(forward_transforms("QuickRigid"), &[Extension::Mat]);
    }
}
