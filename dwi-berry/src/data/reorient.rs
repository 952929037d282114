//! 体素级重定向: 先置换坐标轴, 再翻转.
//!
//! 仿射 / 方向信息保持不变, 不做任何补偿. 因此重定向后图像在物理空间中的朝向会改变,
//! 这正是用来修正扫描时方向记录错误的手段.

use super::{ScalarVolume, VolumeResult};
use ndarray::Axis;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// 重定向参数错误.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReorientError {
    /// 置换不是 `0, 1, 2` 的一个排列.
    #[error("permute axes must be a permutation of 0,1,2, got `{0}`")]
    InvalidPermutation(String),

    /// 翻转轴不在 `{0, 1, 2}` 中.
    #[error("flip axes must be 0, 1 or 2, got `{0}`")]
    InvalidFlipAxis(String),
}

/// 体素重定向操作: 可选的置换, 之后依次翻转的若干轴.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reorientation {
    permute: Option<[usize; 3]>,
    flips: Vec<usize>,
}

/// 解析 `"a,b,c"` 形式的整数列表. 空白项被忽略.
fn parse_int_list(s: &str) -> Option<Vec<usize>> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(|x| x.parse().ok())
        .collect()
}

impl Reorientation {
    /// 恒等操作.
    #[inline]
    pub fn identity() -> Self {
        Self::default()
    }

    /// 由命令行形式的字符串构造, 例如 `permute = "0,2,1"`, `flip = "2"`.
    pub fn parse(permute: Option<&str>, flip: Option<&str>) -> Result<Self, ReorientError> {
        let permute = match permute.map(str::trim).filter(|s| !s.is_empty()) {
            None => None,
            Some(s) => {
                let err = || ReorientError::InvalidPermutation(s.to_string());
                let axes = parse_int_list(s).ok_or_else(err)?;
                let mut sorted = axes.clone();
                sorted.sort_unstable();
                if sorted != [0, 1, 2] {
                    return Err(err());
                }
                Some([axes[0], axes[1], axes[2]])
            }
        };
        let flips = match flip.map(str::trim).filter(|s| !s.is_empty()) {
            None => vec![],
            Some(s) => {
                let axes =
                    parse_int_list(s).ok_or_else(|| ReorientError::InvalidFlipAxis(s.to_string()))?;
                if let Some(bad) = axes.iter().find(|a| **a > 2) {
                    return Err(ReorientError::InvalidFlipAxis(bad.to_string()));
                }
                axes
            }
        };
        Ok(Self { permute, flips })
    }

    /// 是否为恒等操作?
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.flips.is_empty() && self.permute.map_or(true, |p| p == [0, 1, 2])
    }

    /// 置换.
    #[inline]
    pub fn permute(&self) -> Option<[usize; 3]> {
        self.permute
    }

    /// 翻转轴.
    #[inline]
    pub fn flips(&self) -> &[usize] {
        &self.flips
    }

    /// 对标量图原地执行重定向. 非有限值先被替换为 0.
    pub fn apply(&self, volume: &mut ScalarVolume) {
        let replaced = volume.sanitize();
        if replaced > 0 {
            tracing::debug!(replaced, "replaced non-finite voxels with 0");
        }
        let mut data = std::mem::take(&mut volume.data);
        if let Some(p) = self.permute {
            data = data.permuted_axes(p);
        }
        for ax in self.flips.iter() {
            data.invert_axis(Axis(*ax));
        }
        volume.replace_data(data.as_standard_layout().into_owned());
    }

    /// 读取 `input`, 重定向后写入 `output`. 输出为 `f32`, header 仿射沿用输入.
    pub fn apply_file(&self, input: &Path, output: &Path) -> VolumeResult<()> {
        let mut volume = ScalarVolume::open(input)?;
        self.apply(&mut volume);
        volume.save(output)
    }
}

impl fmt::Display for Reorientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.permute {
            Some([a, b, c]) => write!(f, "permute={a},{b},{c}")?,
            None => write!(f, "permute=none")?,
        }
        write!(f, " flip=")?;
        if self.flips.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", itertools::join(&self.flips, ","))
        }
    }
}

impl FromStr for Reorientation {
    type Err = ReorientError;

    /// 解析 `"<permute>;<flip>"`, 任一部分可以为空.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (permute, flip) = s.split_once(';').unwrap_or((s, ""));
        Self::parse(Some(permute), Some(flip))
    }
}
