//! 会话输入检查.
//!
//! 文件查找以 [`RankedLookup`] 表达: 先按优先级尝试精确文件名, 再按字典序找第一个
//! 匹配后缀的文件. 不使用 shell glob.

use super::SessionProbe;
use crate::naming::{raw_session_dir, strip_nifti_ext, Datatype, DerivativeTree, NamingResult};
use std::fs;
use std::path::{Path, PathBuf};

/// 按优先级排列的文件候选.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RankedLookup {
    exact: Vec<String>,
    prefix: String,
    suffixes: Vec<String>,
}

impl RankedLookup {
    /// 只有精确候选的查找.
    pub fn exact<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exact: names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// 追加后备规则: 以 `prefix` 开头并以 `suffixes` 之一结尾的文件.
    /// 后缀按给定顺序逐个尝试, 同一后缀下取字典序最小者.
    pub fn or_matching<I, S>(mut self, prefix: &str, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix = prefix.to_string();
        self.suffixes = suffixes.into_iter().map(Into::into).collect();
        self
    }

    /// 在 `dir` 中查找.
    pub fn find(&self, dir: &Path) -> Option<PathBuf> {
        if let Some(hit) = self.exact.iter().map(|n| dir.join(n)).find(|p| p.is_file()) {
            return Some(hit);
        }
        if self.suffixes.is_empty() {
            return None;
        }

        let mut names: Vec<String> = fs::read_dir(dir)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.starts_with(&self.prefix))
            .collect();
        names.sort();
        self.suffixes
            .iter()
            .find_map(|suffix| names.iter().find(|n| n.ends_with(suffix.as_str())))
            .map(|n| dir.join(n))
    }
}

/// 把 nifti 文件的扩展名替换为 `ext` (带点).
fn companion(path: &Path, ext: &str) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = strip_nifti_ext(name)?;
    Some(path.with_file_name(format!("{stem}{ext}")))
}

/// 相反的相位编码方向, 例如 `AP` -> `PA`. 只支持两个字母的方向.
fn reverse_direction(pe: &str) -> Option<String> {
    let b = pe.as_bytes();
    match b {
        [x, y] if x.is_ascii_alphabetic() && y.is_ascii_alphabetic() => {
            Some(format!("{}{}", *y as char, *x as char))
        }
        _ => None,
    }
}

/// 一对相反相位编码的自旋回波 b0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldmapPair {
    /// 与 DWI 相同的相位编码方向.
    pub forward: PathBuf,

    /// 相反的相位编码方向.
    pub reverse: PathBuf,
}

/// 原始 DWI 会话的输入.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DwiInputs {
    /// T1 加权像.
    pub t1w: PathBuf,

    /// 弥散像.
    pub dwi: PathBuf,

    /// b 值.
    pub bval: PathBuf,

    /// b 向量.
    pub bvec: PathBuf,

    /// 采集参数 (可选).
    pub json: Option<PathBuf>,

    /// 场图对 (可选). 决定 `-rpe_pair` 还是 `-rpe_none`.
    pub fieldmap: Option<FieldmapPair>,
}

/// 检查原始数据集中 DWI 流水线所需的输入.
///
/// 必需: `dwi/` 下的弥散像及其 `.bval` / `.bvec`, `anat/` 下的 T1 加权像.
/// 可选: 弥散像的 `.json`, `fmap/` 下一对 `dir-<PE>` / `dir-<反向>` 的 `_epi` 图像.
#[derive(Clone, Debug)]
pub struct RawDwiProbe {
    root: PathBuf,
    phase_encoding: String,
}

impl RawDwiProbe {
    /// `phase_encoding` 用于匹配场图对, 例如 `AP`.
    pub fn new(dataset_root: impl Into<PathBuf>, phase_encoding: &str) -> Self {
        Self {
            root: dataset_root.into(),
            phase_encoding: phase_encoding.to_string(),
        }
    }

    fn nifti_lookup(prefix: &str, suffix: &str) -> RankedLookup {
        RankedLookup::exact([
            format!("{prefix}{suffix}.nii.gz"),
            format!("{prefix}{suffix}.nii"),
        ])
        .or_matching(prefix, [format!("_{suffix}.nii.gz"), format!("_{suffix}.nii")])
    }

    fn fieldmap(&self, fmap_dir: &Path, prefix: &str) -> Option<FieldmapPair> {
        let reverse = reverse_direction(&self.phase_encoding)?;
        let find = |dir: &str| {
            RankedLookup::exact([
                format!("{prefix}dir-{dir}_epi.nii.gz"),
                format!("{prefix}dir-{dir}_epi.nii"),
            ])
            .or_matching(
                prefix,
                [format!("dir-{dir}_epi.nii.gz"), format!("dir-{dir}_epi.nii")],
            )
            .find(fmap_dir)
        };
        Some(FieldmapPair {
            forward: find(self.phase_encoding.as_str())?,
            reverse: find(&reverse)?,
        })
    }
}

impl SessionProbe for RawDwiProbe {
    type Inputs = DwiInputs;

    fn subject_dir(&self, subject: &str) -> PathBuf {
        self.root.join(format!("sub-{subject}"))
    }

    fn probe(&self, subject: &str, session: &str) -> Result<DwiInputs, Vec<String>> {
        let ses_dir = raw_session_dir(&self.root, subject, session);
        if !ses_dir.is_dir() {
            return Err(vec![format!("session directory {}", ses_dir.display())]);
        }
        let prefix = format!("sub-{subject}_ses-{session}_");
        let mut missing = vec![];

        let dwi = Self::nifti_lookup(&prefix, "dwi").find(&ses_dir.join("dwi"));
        let (bval, bvec) = match dwi.as_deref() {
            Some(dwi) => {
                let bval = companion(dwi, ".bval").filter(|p| p.is_file());
                let bvec = companion(dwi, ".bvec").filter(|p| p.is_file());
                if bval.is_none() {
                    missing.push(format!("b-values (.bval) for {}", dwi.display()));
                }
                if bvec.is_none() {
                    missing.push(format!("b-vectors (.bvec) for {}", dwi.display()));
                }
                (bval, bvec)
            }
            None => {
                missing.push("diffusion image dwi/*_dwi.nii[.gz]".to_string());
                (None, None)
            }
        };
        let t1w = Self::nifti_lookup(&prefix, "T1w").find(&ses_dir.join("anat"));
        if t1w.is_none() {
            missing.push("anatomical image anat/*_T1w.nii[.gz]".to_string());
        }

        match (t1w, dwi, bval, bvec) {
            (Some(t1w), Some(dwi), Some(bval), Some(bvec)) if missing.is_empty() => {
                let json = companion(&dwi, ".json").filter(|p| p.is_file());
                let fieldmap = self.fieldmap(&ses_dir.join("fmap"), &prefix);
                Ok(DwiInputs {
                    t1w,
                    dwi,
                    bval,
                    bvec,
                    json,
                    fieldmap,
                })
            }
            _ => Err(missing),
        }
    }
}

/// 图谱配准的对象.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AtlasTarget {
    /// 解剖像 (T1).
    Anat,

    /// DTI 标量图 (FA 为运动图像, MD / AD / RD 随之重采样).
    Scalar,
}

/// 一个会话的图谱配准输入, 全部来自上游衍生目录.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AtlasInputs {
    /// 运动图像.
    pub moving: PathBuf,

    /// 运动图像上的病灶掩膜 (可选).
    pub moving_mask: Option<PathBuf>,

    /// 与运动图像同网格, 用同一变换重采样的图像.
    pub apply: Vec<PathBuf>,

    /// 与运动图像同网格的标签图像 (最近邻插值).
    pub labels: Vec<PathBuf>,
}

/// 检查上游衍生目录中图谱配准所需的输入.
#[derive(Clone, Debug)]
pub struct DerivativeProbe {
    tree: DerivativeTree,
    target: AtlasTarget,
}

impl DerivativeProbe {
    /// 在衍生目录 `tree` 中查找 `target` 的输入.
    pub fn new(tree: DerivativeTree, target: AtlasTarget) -> Self {
        Self { tree, target }
    }

    /// 按优先级排列的 `(数据类型, 空间, 描述符, 后缀)` 候选中第一个存在的文件.
    fn first_existing(
        &self,
        subject: &str,
        session: &str,
        candidates: &[(Datatype, Option<&str>, &str, &str)],
    ) -> NamingResult<Option<(usize, PathBuf)>> {
        let ses = self.tree.session(subject, session)?;
        for (rank, (datatype, space, desc, suffix)) in candidates.iter().enumerate() {
            let p = ses.nifti(*datatype, *space, desc, suffix)?;
            if p.is_file() {
                return Ok(Some((rank, p)));
            }
        }
        Ok(None)
    }

    fn probe_anat(&self, subject: &str, session: &str) -> NamingResult<Result<AtlasInputs, Vec<String>>> {
        let moving = self.first_existing(
            subject,
            session,
            &[
                (Datatype::Anat, None, "brain", "T1w"),
                (Datatype::Anat, None, "biascorr", "T1w"),
            ],
        )?;
        let Some((_, moving)) = moving else {
            return Ok(Err(vec!["anat/*_desc-{brain,biascorr}_T1w.nii.gz".to_string()]));
        };
        let mask = self.first_existing(subject, session, &[(Datatype::Anat, None, "brain", "mask")])?;
        let lesion = self.first_existing(subject, session, &[(Datatype::Anat, None, "lesion", "mask")])?;
        Ok(Ok(AtlasInputs {
            moving,
            moving_mask: lesion.map(|(_, p)| p),
            apply: vec![],
            labels: mask.map(|(_, p)| p).into_iter().collect(),
        }))
    }

    fn probe_scalar(&self, subject: &str, session: &str) -> NamingResult<Result<AtlasInputs, Vec<String>>> {
        // 原生空间 (pigdti) 优先, 其次 T1 空间 (pdti)
        let spaces = [(Datatype::Dwi, None), (Datatype::Anat, Some("T1w"))];
        let fa = self.first_existing(
            subject,
            session,
            &[
                (Datatype::Dwi, spaces[0].1, "FA", "dwi"),
                (Datatype::Dwi, spaces[1].1, "FA", "dwi"),
            ],
        )?;
        let Some((rank, moving)) = fa else {
            return Ok(Err(vec!["dwi/*_desc-FA_dwi.nii.gz".to_string()]));
        };
        let space = spaces[rank].1;
        let mask_dir = spaces[rank].0;

        let ses = self.tree.session(subject, session)?;
        let mut apply = vec![];
        let mut missing = vec![];
        for metric in ["MD", "AD", "RD"] {
            let p = ses.nifti(Datatype::Dwi, space, metric, "dwi")?;
            if p.is_file() {
                apply.push(p);
            } else {
                missing.push(p.display().to_string());
            }
        }
        if !missing.is_empty() {
            return Ok(Err(missing));
        }
        let mask = self.first_existing(subject, session, &[(mask_dir, None, "brain", "mask")])?;
        let lesion = self.first_existing(subject, session, &[(mask_dir, None, "lesion", "mask")])?;
        Ok(Ok(AtlasInputs {
            moving,
            moving_mask: lesion.map(|(_, p)| p),
            apply,
            labels: mask.map(|(_, p)| p).into_iter().collect(),
        }))
    }
}

impl SessionProbe for DerivativeProbe {
    type Inputs = AtlasInputs;

    fn subject_dir(&self, subject: &str) -> PathBuf {
        self.tree.subject_dir(subject)
    }

    fn probe(&self, subject: &str, session: &str) -> Result<AtlasInputs, Vec<String>> {
        let found = match self.target {
            AtlasTarget::Anat => self.probe_anat(subject, session),
            AtlasTarget::Scalar => self.probe_scalar(subject, session),
        };
        found.unwrap_or_else(|e| Err(vec![e.to_string()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(p: &Path) {
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, b"").unwrap();
    }

    fn raw_session(root: &Path, skip: &[&str]) -> PathBuf {
        let ses = raw_session_dir(root, "9116", "Day14");
        for f in [
            "anat/sub-9116_ses-Day14_T1w.nii.gz",
            "dwi/sub-9116_ses-Day14_dwi.nii.gz",
            "dwi/sub-9116_ses-Day14_dwi.bval",
            "dwi/sub-9116_ses-Day14_dwi.bvec",
            "dwi/sub-9116_ses-Day14_dwi.json",
        ] {
            if !skip.iter().any(|s| f.ends_with(s)) {
                touch(&ses.join(f));
            }
        }
        ses
    }

    #[test]
    fn test_complete_session() {
        let root = tempfile::tempdir().unwrap();
        let ses = raw_session(root.path(), &[]);
        let inputs = RawDwiProbe::new(root.path(), "AP").probe("9116", "Day14").unwrap();
        assert_eq!(inputs.dwi, ses.join("dwi/sub-9116_ses-Day14_dwi.nii.gz"));
        assert_eq!(inputs.bvec, ses.join("dwi/sub-9116_ses-Day14_dwi.bvec"));
        assert!(inputs.json.is_some());
        assert!(inputs.fieldmap.is_none());
    }

    #[test]
    fn test_missing_bvec_excludes() {
        let root = tempfile::tempdir().unwrap();
        raw_session(root.path(), &[".bvec"]);
        let missing = RawDwiProbe::new(root.path(), "AP")
            .probe("9116", "Day14")
            .unwrap_err();
        assert_eq!(missing.len(), 1);
        assert!(missing[0].contains(".bvec"));
    }

    #[test]
    fn test_fallback_and_fieldmap() {
        let root = tempfile::tempdir().unwrap();
        let ses = raw_session(root.path(), &["_dwi.nii.gz", ".bval", ".bvec", ".json"]);
        for f in [
            "dwi/sub-9116_ses-Day14_acq-b1000_dwi.nii",
            "dwi/sub-9116_ses-Day14_acq-b1000_dwi.bval",
            "dwi/sub-9116_ses-Day14_acq-b1000_dwi.bvec",
            "fmap/sub-9116_ses-Day14_dir-AP_epi.nii.gz",
            "fmap/sub-9116_ses-Day14_dir-PA_epi.nii.gz",
        ] {
            touch(&ses.join(f));
        }
        let inputs = RawDwiProbe::new(root.path(), "AP").probe("9116", "Day14").unwrap();
        assert_eq!(inputs.dwi, ses.join("dwi/sub-9116_ses-Day14_acq-b1000_dwi.nii"));
        assert!(inputs.json.is_none());
        let pair = inputs.fieldmap.unwrap();
        assert!(pair.forward.ends_with("sub-9116_ses-Day14_dir-AP_epi.nii.gz"));
        assert!(pair.reverse.ends_with("sub-9116_ses-Day14_dir-PA_epi.nii.gz"));
    }

    #[test]
    fn test_ranked_exact_beats_fallback() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a_x_T1w.nii.gz"));
        touch(&dir.path().join("a_T1w.nii"));
        let found = RankedLookup::exact(["a_T1w.nii.gz", "a_T1w.nii"])
            .or_matching("a_", ["_T1w.nii.gz"])
            .find(dir.path());
        assert_eq!(found, Some(dir.path().join("a_T1w.nii")));
    }

    #[test]
    fn test_scalar_inputs_from_native_tree() {
        let root = tempfile::tempdir().unwrap();
        let tree = DerivativeTree::new(root.path(), "pigdti").unwrap();
        let ses = tree.session("9116", "Day14").unwrap();
        for m in ["FA", "MD", "AD", "RD"] {
            touch(&ses.nifti(Datatype::Dwi, None, m, "dwi").unwrap());
        }
        touch(&ses.nifti(Datatype::Dwi, None, "brain", "mask").unwrap());

        let probe = DerivativeProbe::new(tree.clone(), AtlasTarget::Scalar);
        let inputs = probe.probe("9116", "Day14").unwrap();
        assert!(inputs.moving.ends_with("sub-9116_ses-Day14_desc-FA_dwi.nii.gz"));
        assert_eq!(inputs.apply.len(), 3);
        assert_eq!(inputs.labels.len(), 1);
        assert!(inputs.moving_mask.is_none());

        fs::remove_file(ses.nifti(Datatype::Dwi, None, "RD", "dwi").unwrap()).unwrap();
        assert!(probe.probe("9116", "Day14").is_err());
    }
}
