//! 集成测试共用的数据集构造和假工具.

#![allow(dead_code)]

use dwi_berry::naming::{raw_session_dir, Extension};
use dwi_berry::tool::commands::forward_transforms;
use dwi_berry::tool::{ToolError, ToolInvocation, ToolRunner};
use dwi_berry::MaskVolume;
use ndarray::Array3;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 所有假体数据的形状.
pub const SHAPE: (usize, usize, usize) = (4, 4, 4);

/// 写一个全前景的小体数据.
pub fn write_volume(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    MaskVolume::fake(Array3::ones(SHAPE)).save(path).unwrap();
}

fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"x").unwrap();
}

fn is_nifti(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".nii.gz") || name.ends_with(".nii")
}

/// 按期望输出生成文件的假工具. nifti 输出写成合法的小体数据, 其它输出写占位内容.
///
/// 配准协作者的变换文件名不在期望输出中, 这里按协作者的命名规则额外生成.
#[derive(Default)]
pub struct ScriptedTools {
    calls: Mutex<Vec<String>>,
    fail: Option<String>,
}

impl ScriptedTools {
    /// 所有工具都成功.
    pub fn new() -> Self {
        Self::default()
    }

    /// 名为 `tool` 的工具以退出码 1 失败.
    pub fn failing(tool: &str) -> Self {
        Self {
            calls: Mutex::new(vec![]),
            fail: Some(tool.to_string()),
        }
    }

    /// 已调用的工具名, 按调用顺序.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn registration_transforms(invocation: &ToolInvocation) {
        let args = invocation.arguments();
        let after = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };
        if !args.iter().any(|a| a == "--moving_image") {
            return;
        }
        let prefix = after("--output_prefix").unwrap();
        let forward = forward_transforms(&after("--transform_type").unwrap());
        let files = forward.iter().enumerate().map(|(i, ext)| match ext {
            Extension::Mat => format!("_fwd_{i}_0GenericAffine.mat"),
            _ => format!("_fwd_{i}_1Warp.nii.gz"),
        });
        for f in files {
            let p = PathBuf::from(format!("{prefix}{f}"));
            if is_nifti(&p) {
                write_volume(&p);
            } else {
                touch(&p);
            }
        }
    }
}

impl ToolRunner for ScriptedTools {
    fn run(&self, invocation: &ToolInvocation) -> Result<(), ToolError> {
        self.calls.lock().unwrap().push(invocation.tool().to_string());
        if self.fail.as_deref() == Some(invocation.tool()) {
            return Err(ToolError::Exit {
                tool: invocation.tool().to_string(),
                code: Some(1),
                stderr_tail: "scripted failure".to_string(),
            });
        }
        for p in invocation.expected_outputs() {
            if is_nifti(p) {
                write_volume(p);
            } else {
                touch(p);
            }
        }
        if invocation.tool() == "ANTsReg" {
            Self::registration_transforms(invocation);
        }
        Ok(())
    }
}

/// 在原始数据集中创建一个会话. `skip` 中的文件名后缀不会被创建.
pub fn raw_session(root: &Path, subject: &str, session: &str, skip: &[&str]) -> PathBuf {
    let ses = raw_session_dir(root, subject, session);
    let base = format!("sub-{subject}_ses-{session}");
    let t1 = ses.join(format!("anat/{base}_T1w.nii.gz"));
    if !skip.iter().any(|s| "_T1w.nii.gz".ends_with(s)) {
        write_volume(&t1);
    }
    for ext in ["_dwi.nii.gz", "_dwi.bval", "_dwi.bvec"] {
        if !skip.iter().any(|s| ext.ends_with(s)) {
            touch(&ses.join(format!("dwi/{base}{ext}")));
        }
    }
    ses
}

/// 在 `root/atlas` 下创建模板和 ROI 目录.
pub fn atlas_dir(root: &Path, rois: &[&str]) -> PathBuf {
    let dir = root.join("atlas");
    write_volume(&dir.join("template_FA.nii.gz"));
    for roi in rois {
        write_volume(&dir.join("ROIs").join(format!("{roi}_thr0.nii.gz")));
    }
    dir
}

/// 在图谱目录下创建组织概率图.
pub fn tissue_maps(atlas_dir: &Path, tpms: &[&str]) {
    for tpm in tpms {
        write_volume(&atlas_dir.join("Tissue_Probability_Maps").join(format!("{tpm}.nii.gz")));
    }
}
