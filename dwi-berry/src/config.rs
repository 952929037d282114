//! 流水线配置.
//!
//! 配置文件为 TOML 格式, 所有键均可省略 (省略时取默认值). 查找顺序:
//!
//! 1. 命令行 `--config PATH`;
//! 2. `{用户配置目录}/dwi-berry/pipeline.toml` (若存在);
//! 3. 内置默认值.
//!
//! ```toml
//! timeout_secs = 7200
//! phase_encoding = "AP"
//!
//! [tools]
//! dwifslpreproc = "/opt/mrtrix3/bin/dwifslpreproc"
//! editor = "itksnap"
//! ```

use crate::error::PipelineError;
use crate::tool::ProcessRunner;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认配置文件名.
pub const CONFIG_FILE_NAME: &str = "pipeline.toml";

/// 获取 `{用户配置目录}/dwi-berry/pipeline.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    let mut ans = dirs::config_dir()?;
    ans.push("dwi-berry");
    ans.push(CONFIG_FILE_NAME);
    Some(ans)
}

/// 外部工具的程序名或路径. 程序名会在 `PATH` 中查找.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    /// MRtrix3 `dwidenoise`.
    pub dwidenoise: PathBuf,
    /// MRtrix3 `mrdegibbs`.
    pub mrdegibbs: PathBuf,
    /// MRtrix3 `dwifslpreproc` (FSL eddy / topup 包装).
    pub dwifslpreproc: PathBuf,
    /// MRtrix3 `dwibiascorrect`.
    pub dwibiascorrect: PathBuf,
    /// ANTs `N4BiasFieldCorrection`.
    pub n4: PathBuf,
    /// MRtrix3 `mrconvert`.
    pub mrconvert: PathBuf,
    /// MRtrix3 `dwiextract`.
    pub dwiextract: PathBuf,
    /// MRtrix3 `mrmath`.
    pub mrmath: PathBuf,
    /// MRtrix3 `mrcat`.
    pub mrcat: PathBuf,
    /// FSL `bet`.
    pub bet: PathBuf,
    /// MRtrix3 `dwi2tensor`.
    pub dwi2tensor: PathBuf,
    /// MRtrix3 `tensor2metric`.
    pub tensor2metric: PathBuf,
    /// ANTs `antsRegistrationSyNQuick.sh`.
    pub ants_quick: PathBuf,
    /// ANTs `antsApplyTransforms`.
    pub ants_apply: PathBuf,
    /// 交互式掩膜编辑器.
    pub editor: PathBuf,
    /// 配准协作脚本.
    pub registration_script: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            dwidenoise: "dwidenoise".into(),
            mrdegibbs: "mrdegibbs".into(),
            dwifslpreproc: "dwifslpreproc".into(),
            dwibiascorrect: "dwibiascorrect".into(),
            n4: "N4BiasFieldCorrection".into(),
            mrconvert: "mrconvert".into(),
            dwiextract: "dwiextract".into(),
            mrmath: "mrmath".into(),
            mrcat: "mrcat".into(),
            bet: "bet".into(),
            dwi2tensor: "dwi2tensor".into(),
            tensor2metric: "tensor2metric".into(),
            ants_quick: "antsRegistrationSyNQuick.sh".into(),
            ants_apply: "antsApplyTransforms".into(),
            editor: "itksnap".into(),
            registration_script: "ANTsReg.py".into(),
        }
    }
}

/// 流水线配置.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// 外部工具.
    pub tools: ToolsConfig,

    /// 相位编码方向, 传给 `dwifslpreproc -pe_dir`.
    pub phase_encoding: String,

    /// 额外的 eddy 选项, 传给 `dwifslpreproc -eddy_options`.
    pub eddy_options: String,

    /// 图谱配准默认的变换类型.
    pub transform_type: String,

    /// 外部工具超时 (秒). 省略则不限时.
    pub timeout_secs: Option<u64>,

    /// 错误信息中保留的 stderr 行数.
    pub stderr_tail_lines: usize,

    /// 图谱目录中 ROI 掩膜所在的子目录名.
    pub roi_dir_name: String,

    /// 图谱目录中组织概率图 (TPM) 所在的子目录名. 其中每张图与 ROI 一样参与指标统计.
    pub tpm_dir_name: String,

    /// 外部工具线程数, 传给支持 `-nthreads` 的 MRtrix3 命令. 省略则由工具自行决定.
    pub nthreads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tools: ToolsConfig::default(),
            phase_encoding: "AP".to_string(),
            eddy_options: " --slm=linear".to_string(),
            transform_type: "SyN".to_string(),
            timeout_secs: None,
            stderr_tail_lines: crate::tool::DEFAULT_TAIL_LINES,
            roi_dir_name: "ROIs".to_string(),
            tpm_dir_name: "Tissue_Probability_Maps".to_string(),
            nthreads: None,
        }
    }
}

impl PipelineConfig {
    /// 从 TOML 字符串解析.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, PipelineError> {
        toml::from_str(text).map_err(|e| PipelineError::Config {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// 读取给定的配置文件. 文件必须存在.
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(PipelineError::io_at(path))?;
        Self::from_toml(&text, path)
    }

    /// 按查找顺序加载配置. 显式给出的文件必须存在; 默认位置的文件不存在时使用内置默认值.
    pub fn load(explicit: Option<&Path>) -> Result<Self, PipelineError> {
        if let Some(path) = explicit {
            tracing::debug!(path = %path.display(), "loading configuration");
            return Self::from_file(path);
        }
        match default_config_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "loading configuration");
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// 外部工具超时.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// 按配置构造进程执行者.
    pub fn process_runner(&self) -> ProcessRunner {
        ProcessRunner::new()
            .with_timeout(self.timeout())
            .with_tail_lines(self.stderr_tail_lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg = PipelineConfig::from_toml(
            r#"
            timeout_secs = 30
            [tools]
            editor = "/usr/local/bin/itksnap"
            "#,
            Path::new("inline.toml"),
        )
        .unwrap();
        assert_eq!(cfg.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.tools.editor, PathBuf::from("/usr/local/bin/itksnap"));
        assert_eq!(cfg.tools.dwidenoise, PathBuf::from("dwidenoise"));
        assert_eq!(cfg.transform_type, "SyN");
        assert_eq!(cfg.roi_dir_name, "ROIs");
        assert_eq!(cfg.tpm_dir_name, "Tissue_Probability_Maps");
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = PipelineConfig::from_toml("timeout_secs = \"soon\"", Path::new("x.toml"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config { .. }));
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            PipelineConfig::load(Some(&missing)),
            Err(PipelineError::Io { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "phase_encoding = \"PA\"\nnthreads = 4\n").unwrap();
        let cfg = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.phase_encoding, "PA");
        assert_eq!(cfg.nthreads, Some(4));
    }
}
