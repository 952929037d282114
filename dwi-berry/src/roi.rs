//! 图谱空间 ROI 指标提取.
//!
//! 对每张图谱空间的标量图和图谱中的每个 ROI 掩膜 (包括组织概率图), 在
//! `mask > 0.5 && value > 0` 的体素上统计均值, 总体标准差, 最小值, 最大值和中位数.
//! 选区为空时五项均为 NaN.
//!
//! 输出为 CSV: 第一列 `metric`, 之后每个 ROI 一列, 每个统计量一行.

use crate::consts::gray::MASK_THRESHOLD;
use crate::data::{ScalarVolume, VolumeError, VolumeResult};
use crate::naming::strip_nifti_ext;
use crate::NiftiHeaderAttr;
use ndarray::{ArrayView3, Zip};
use ordered_float::OrderedFloat;
use std::fmt::Write;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    }
}

/// 统计量名, 即 CSV 的行名, 顺序固定.
pub const STAT_NAMES: [&str; 5] = ["mean", "std", "min", "max", "median"];

/// 一个 ROI 上的统计量.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RoiStats {
    /// 均值.
    pub mean: f64,
    /// 总体标准差.
    pub std: f64,
    /// 最小值.
    pub min: f64,
    /// 最大值.
    pub max: f64,
    /// 中位数. 偶数个样本时取中间两个的平均.
    pub median: f64,
}

impl RoiStats {
    /// 空选区.
    pub const EMPTY: Self = Self {
        mean: f64::NAN,
        std: f64::NAN,
        min: f64::NAN,
        max: f64::NAN,
        median: f64::NAN,
    };

    /// 由样本计算. 样本为空时返回 [`Self::EMPTY`].
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        if samples.is_empty() {
            return Self::EMPTY;
        }
        samples.sort_unstable_by_key(|v| OrderedFloat(*v));
        let n = samples.len();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            samples[n / 2]
        } else {
            (samples[n / 2 - 1] + samples[n / 2]) / 2.0
        };
        Self {
            mean,
            std: var.sqrt(),
            min: samples[0],
            max: samples[n - 1],
            median,
        }
    }

    /// 按 [`STAT_NAMES`] 的顺序.
    pub fn as_array(&self) -> [f64; 5] {
        [self.mean, self.std, self.min, self.max, self.median]
    }
}

/// 在 `mask > 0.5 && value > 0` 的体素上统计. 两者形状必须一致 (调用方保证).
pub fn roi_stats(values: ArrayView3<f32>, mask: ArrayView3<f32>) -> RoiStats {
    let mut samples = vec![];
    Zip::from(&values).and(&mask).for_each(|&v, &m| {
        if m > MASK_THRESHOLD && v > 0.0 {
            samples.push(v as f64);
        }
    });
    RoiStats::from_samples(samples)
}

/// ROI 名: 去掉 nifti 扩展名和 `_thr0`.
pub fn roi_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    Some(strip_nifti_ext(file_name)?.replace("_thr0", ""))
}

/// 列出 `dir` 中的所有 nifti ROI 掩膜, 按 ROI 名排序.
pub fn list_rois(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut rois = vec![];
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = roi_name(&path) {
            rois.push((name, path));
        }
    }
    rois.sort();
    Ok(rois)
}

/// 图谱目录中参与统计的所有掩膜: 先是 `roi_dir` 中的 ROI, 再是 `tpm_dir` 中的组织概率图.
///
/// # 注意
///
/// 1. 不存在的子目录视为空.
/// 2. 组织概率图与某个 ROI 同名时, 取代该 ROI 但保留其位置.
pub fn atlas_masks(atlas_dir: &Path, roi_dir: &str, tpm_dir: &str) -> io::Result<Vec<(String, PathBuf)>> {
    let listed = |name: &str| -> io::Result<Vec<(String, PathBuf)>> {
        let dir = atlas_dir.join(name);
        if dir.is_dir() {
            list_rois(&dir)
        } else {
            Ok(vec![])
        }
    };
    let mut masks = listed(roi_dir)?;
    for (name, path) in listed(tpm_dir)? {
        match masks.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = path,
            None => masks.push((name, path)),
        }
    }
    Ok(masks)
}

/// 一张标量图在所有 ROI 上的统计结果.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricTable {
    /// `(ROI 名, 统计量)`, 顺序与输入一致.
    pub rois: Vec<(String, RoiStats)>,
}

impl MetricTable {
    /// 生成 CSV 文本. NaN 写作空字段.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("metric");
        for (name, _) in self.rois.iter() {
            out.push(',');
            out.push_str(name);
        }
        out.push('\n');
        for (row, stat) in STAT_NAMES.iter().enumerate() {
            out.push_str(stat);
            for (_, stats) in self.rois.iter() {
                let v = stats.as_array()[row];
                if v.is_nan() {
                    out.push(',');
                } else {
                    let _ = write!(out, ",{v}");
                }
            }
            out.push('\n');
        }
        out
    }
}

fn load_checked(scalar: &ScalarVolume, scalar_path: &Path, roi: &Path) -> VolumeResult<ScalarVolume> {
    let mask = ScalarVolume::open(roi)?;
    if !scalar.same_shape(&mask) {
        return Err(VolumeError::ShapeMismatch {
            left_path: scalar_path.to_path_buf(),
            left: scalar.header_shape(),
            right_path: roi.to_path_buf(),
            right: mask.header_shape(),
        });
    }
    Ok(mask)
}

/// 读取标量图 `scalar_path`, 在每个 ROI 上统计.
///
/// # 注意
///
/// ROI 掩膜与标量图形状不一致时返回 [`VolumeError::ShapeMismatch`].
pub fn extract(scalar_path: &Path, rois: &[(String, PathBuf)]) -> VolumeResult<MetricTable> {
    let mut scalar = ScalarVolume::open(scalar_path)?;
    scalar.sanitize();

    let one = |(name, path): &(String, PathBuf)| -> VolumeResult<(String, RoiStats)> {
        let mask = load_checked(&scalar, scalar_path, path)?;
        Ok((name.clone(), roi_stats(scalar.data(), mask.data())))
    };

    #[cfg(feature = "rayon")]
    let rois = rois.par_iter().map(one).collect::<VolumeResult<Vec<_>>>()?;
    #[cfg(not(feature = "rayon"))]
    let rois = rois.iter().map(one).collect::<VolumeResult<Vec<_>>>()?;

    Ok(MetricTable { rois })
}
