//! 坐标空间记账.
//!
//! 每个图像句柄记录它所在的网格 ([`GridId`]), 空间标签 ([`Space`]),
//! 以及产生它的一系列空间操作. 本模块不重新计算任何几何信息:
//! 两个图像 "在同一空间" 当且仅当它们由构造保证共享同一个网格,
//! 即它们源自同一个重采样 / 配准步骤, 或者一个是另一个的同网格衍生物.

use crate::data::Reorientation;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 空间标签. 写入文件名的 `space-<label>` 实体.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Space {
    /// 采集时的原生空间. 文件名中不出现 `space-` 实体.
    Native,

    /// 受试者 T1w 解剖空间.
    T1w,

    /// 受试者 DWI 空间.
    Dwi,

    /// 图谱模板空间.
    Atlas,

    /// 其它具名空间.
    Other(String),
}

impl Space {
    /// 文件名中使用的标签. 原生空间返回 `None`.
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Native => None,
            Self::T1w => Some("T1w"),
            Self::Dwi => Some("dwi"),
            Self::Atlas => Some("Atlas"),
            Self::Other(s) => Some(s.as_str()),
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label().unwrap_or(crate::naming::NATIVE_SPACE))
    }
}

/// 网格标识. 不同的重定向 / 配准步骤产生不同的网格.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GridId(u32);

/// 图像句柄.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct ImageHandle(usize);

/// 变换句柄.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct TransformHandle(usize);

/// 空间操作.
#[derive(Clone, Debug, PartialEq)]
pub enum SpaceOp {
    /// 体素重定向. 产生新网格, 空间标签不变.
    Reorient(Reorientation),

    /// 重采样到参考图像的网格.
    Resample {
        /// 参考图像.
        reference: ImageHandle,
    },

    /// 配准到固定图像, 并以配准结果的形式重采样.
    Register {
        /// 固定图像.
        fixed: ImageHandle,

        /// 得到的变换.
        transform: TransformHandle,
    },

    /// 应用已有变换.
    Apply {
        /// 所用变换.
        transform: TransformHandle,
    },
}

/// 空间记账错误.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpaceError {
    /// 要求共享网格的两个图像不在同一网格上.
    #[error(
        "`{}` (space {left_space}) and `{}` (space {right_space}) do not share a grid",
        .left.display(),
        .right.display()
    )]
    SpaceMismatch {
        /// 左侧图像.
        left: PathBuf,

        /// 左侧空间.
        left_space: String,

        /// 右侧图像.
        right: PathBuf,

        /// 右侧空间.
        right_space: String,
    },

    /// 句柄不属于此记账器.
    #[error("unknown image handle #{0}")]
    UnknownImage(usize),

    /// 句柄不属于此记账器.
    #[error("unknown transform handle #{0}")]
    UnknownTransform(usize),

    /// 变换被应用到与其运动图像不同网格的图像上.
    #[error("transform from `{}` cannot be applied to `{}`: different source grid", .moving.display(), .image.display())]
    TransformSourceMismatch {
        /// 变换的运动图像.
        moving: PathBuf,

        /// 被应用的图像.
        image: PathBuf,
    },
}

/// 单个图像的记录.
#[derive(Clone, Debug)]
struct ImageRecord {
    path: PathBuf,
    space: Space,
    grid: GridId,
    history: Vec<SpaceOp>,
}

/// 变换的记录.
#[derive(Clone, Debug)]
struct TransformRecord {
    moving: ImageHandle,
    fixed: ImageHandle,
    files: Vec<PathBuf>,
}

/// 坐标空间记账器. 每个会话一个.
#[derive(Clone, Debug, Default)]
pub struct SpaceTracker {
    images: Vec<ImageRecord>,
    transforms: Vec<TransformRecord>,
    reoriented: Vec<(GridId, Reorientation, GridId)>,
    next_grid: u32,
}

impl SpaceTracker {
    /// 空记账器.
    pub fn new() -> Self {
        Self::default()
    }

    fn new_grid(&mut self) -> GridId {
        let id = GridId(self.next_grid);
        self.next_grid += 1;
        id
    }

    fn record(&self, h: ImageHandle) -> Result<&ImageRecord, SpaceError> {
        self.images.get(h.0).ok_or(SpaceError::UnknownImage(h.0))
    }

    fn transform(&self, t: TransformHandle) -> Result<&TransformRecord, SpaceError> {
        self.transforms.get(t.0).ok_or(SpaceError::UnknownTransform(t.0))
    }

    fn push(&mut self, record: ImageRecord) -> ImageHandle {
        self.images.push(record);
        ImageHandle(self.images.len() - 1)
    }

    /// 登记一个原始输入图像. 每个原始图像拥有自己的网格, `space`
    /// 是其它图像被重采样 / 配准到该网格后使用的空间标签.
    pub fn source(&mut self, path: impl Into<PathBuf>, space: Space) -> ImageHandle {
        let grid = self.new_grid();
        self.push(ImageRecord {
            path: path.into(),
            space,
            grid,
            history: vec![],
        })
    }

    /// 登记一个与 `parent` 同网格的衍生图像 (例如去噪结果, 由其生成的掩膜).
    pub fn derive(
        &mut self,
        parent: ImageHandle,
        path: impl Into<PathBuf>,
    ) -> Result<ImageHandle, SpaceError> {
        let p = self.record(parent)?;
        let record = ImageRecord {
            path: path.into(),
            space: p.space.clone(),
            grid: p.grid,
            history: p.history.clone(),
        };
        Ok(self.push(record))
    }

    /// 登记一次体素重定向的结果: 新网格, 空间标签不变.
    ///
    /// 同一网格上的图像经过同一重定向后仍共享网格.
    pub fn reorient(
        &mut self,
        parent: ImageHandle,
        path: impl Into<PathBuf>,
        op: Reorientation,
    ) -> Result<ImageHandle, SpaceError> {
        let p = self.record(parent)?.clone();
        let known = self
            .reoriented
            .iter()
            .find(|(from, o, _)| *from == p.grid && *o == op)
            .map(|(_, _, to)| *to);
        let grid = match known {
            Some(grid) => grid,
            None => {
                let grid = self.new_grid();
                self.reoriented.push((p.grid, op.clone(), grid));
                grid
            }
        };
        let mut history = p.history;
        history.push(SpaceOp::Reorient(op));
        Ok(self.push(ImageRecord {
            path: path.into(),
            space: p.space,
            grid,
            history,
        }))
    }

    /// 登记一次重采样的结果: 获得参考图像的网格与空间标签.
    pub fn resample_to(
        &mut self,
        image: ImageHandle,
        reference: ImageHandle,
        path: impl Into<PathBuf>,
    ) -> Result<ImageHandle, SpaceError> {
        let mut history = self.record(image)?.history.clone();
        let r = self.record(reference)?;
        let (space, grid) = (r.space.clone(), r.grid);
        history.push(SpaceOp::Resample { reference });
        Ok(self.push(ImageRecord {
            path: path.into(),
            space,
            grid,
            history,
        }))
    }

    /// 登记一次配准: `moving` 被配准到 `fixed`, 得到变换 (文件为 `files`)
    /// 和形变后的运动图像 `warped` (固定图像的网格与空间标签).
    pub fn register(
        &mut self,
        moving: ImageHandle,
        fixed: ImageHandle,
        warped: impl Into<PathBuf>,
        files: Vec<PathBuf>,
    ) -> Result<(ImageHandle, TransformHandle), SpaceError> {
        let mut history = self.record(moving)?.history.clone();
        let f = self.record(fixed)?;
        let (space, grid) = (f.space.clone(), f.grid);
        self.transforms.push(TransformRecord {
            moving,
            fixed,
            files,
        });
        let transform = TransformHandle(self.transforms.len() - 1);
        history.push(SpaceOp::Register { fixed, transform });
        let warped = self.push(ImageRecord {
            path: warped.into(),
            space,
            grid,
            history,
        });
        Ok((warped, transform))
    }

    /// 对 `image` 应用变换. `image` 必须与变换的运动图像共享网格;
    /// 结果获得固定图像的网格与空间标签.
    pub fn apply(
        &mut self,
        transform: TransformHandle,
        image: ImageHandle,
        path: impl Into<PathBuf>,
    ) -> Result<ImageHandle, SpaceError> {
        let t = self.transform(transform)?;
        let (moving, fixed) = (self.record(t.moving)?, self.record(t.fixed)?);
        let img = self.record(image)?;
        if img.grid != moving.grid {
            return Err(SpaceError::TransformSourceMismatch {
                moving: moving.path.clone(),
                image: img.path.clone(),
            });
        }
        let (space, grid) = (fixed.space.clone(), fixed.grid);
        let mut history = img.history.clone();
        history.push(SpaceOp::Apply { transform });
        Ok(self.push(ImageRecord {
            path: path.into(),
            space,
            grid,
            history,
        }))
    }

    /// 断言两个图像共享网格.
    pub fn assert_same_space(&self, a: ImageHandle, b: ImageHandle) -> Result<(), SpaceError> {
        let (ra, rb) = (self.record(a)?, self.record(b)?);
        if ra.grid == rb.grid {
            Ok(())
        } else {
            Err(SpaceError::SpaceMismatch {
                left: ra.path.clone(),
                left_space: ra.space.to_string(),
                right: rb.path.clone(),
                right_space: rb.space.to_string(),
            })
        }
    }

    /// 文件名中的空间标签.
    ///
    /// 仍处于自身采集空间的图像 (只经过同网格衍生或重定向) 返回 `None`;
    /// 经过重采样 / 配准 / 应用变换的图像返回其所在网格的空间标签.
    pub fn resolve_space_tag(&self, h: ImageHandle) -> Result<Option<&str>, SpaceError> {
        let r = self.record(h)?;
        let moved = r
            .history
            .iter()
            .any(|op| !matches!(op, SpaceOp::Reorient(_)));
        Ok(if moved { r.space.label() } else { None })
    }

    /// 空间.
    pub fn space(&self, h: ImageHandle) -> Result<&Space, SpaceError> {
        Ok(&self.record(h)?.space)
    }

    /// 网格.
    pub fn grid(&self, h: ImageHandle) -> Result<GridId, SpaceError> {
        Ok(self.record(h)?.grid)
    }

    /// 文件路径.
    pub fn path(&self, h: ImageHandle) -> Result<&Path, SpaceError> {
        Ok(&self.record(h)?.path)
    }

    /// 产生该图像的空间操作序列.
    pub fn history(&self, h: ImageHandle) -> Result<&[SpaceOp], SpaceError> {
        Ok(&self.record(h)?.history)
    }

    /// 变换文件.
    pub fn transform_files(&self, t: TransformHandle) -> Result<&[PathBuf], SpaceError> {
        Ok(&self.transform(t)?.files)
    }

    /// 最近一次登记在 `path` 上的图像.
    pub fn find(&self, path: &Path) -> Option<ImageHandle> {
        self.images
            .iter()
            .rposition(|r| r.path == path)
            .map(ImageHandle)
    }

    /// 已登记的图像个数.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// 是否尚未登记任何图像?
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_shares_grid() {
        let mut t = SpaceTracker::new();
        let dwi = t.source("dwi.nii.gz", Space::Dwi);
        let den = t.derive(dwi, "den.nii.gz").unwrap();
        let t1 = t.source("t1.nii.gz", Space::T1w);
        assert!(t.assert_same_space(dwi, den).is_ok());
        assert!(matches!(
            t.assert_same_space(dwi, t1),
            Err(SpaceError::SpaceMismatch { .. })
        ));
        assert_eq!(t.resolve_space_tag(den).unwrap(), None);
    }

    #[test]
    fn test_reorient_new_grid_same_label() {
        let mut t = SpaceTracker::new();
        let t1 = t.source("t1.nii.gz", Space::T1w);
        let r = Reorientation::parse(Some("0,2,1"), None).unwrap();
        let re = t.reorient(t1, "t1_re.nii.gz", r.clone()).unwrap();
        assert_eq!(t.space(re).unwrap(), &Space::T1w);
        assert_eq!(t.resolve_space_tag(re).unwrap(), None);
        assert_ne!(t.grid(re).unwrap(), t.grid(t1).unwrap());
        assert_eq!(t.history(re).unwrap(), &[SpaceOp::Reorient(r.clone())]);

        let mask = t.derive(t1, "mask.nii.gz").unwrap();
        let mask_re = t.reorient(mask, "mask_re.nii.gz", r).unwrap();
        assert!(t.assert_same_space(re, mask_re).is_ok());
        let other = Reorientation::parse(None, Some("0")).unwrap();
        let flipped = t.reorient(t1, "t1_flip.nii.gz", other).unwrap();
        assert!(t.assert_same_space(re, flipped).is_err());
    }

    #[test]
    fn test_register_then_apply() {
        let mut t = SpaceTracker::new();
        let atlas = t.source("atlas.nii.gz", Space::Atlas);
        let moving = t.source("t1.nii.gz", Space::Native);
        let fa = t.derive(moving, "fa.nii.gz").unwrap();
        let other = t.source("unrelated.nii.gz", Space::Native);

        let (warped, tf) = t
            .register(moving, atlas, "warped.nii.gz", vec!["fwd0.nii.gz".into()])
            .unwrap();
        let fa_atlas = t.apply(tf, fa, "fa_atlas.nii.gz").unwrap();
        assert!(t.assert_same_space(warped, fa_atlas).is_ok());
        assert!(t.assert_same_space(atlas, fa_atlas).is_ok());
        assert_eq!(t.resolve_space_tag(fa_atlas).unwrap(), Some("Atlas"));
        assert_eq!(t.transform_files(tf).unwrap().len(), 1);

        assert!(matches!(
            t.apply(tf, other, "bad.nii.gz"),
            Err(SpaceError::TransformSourceMismatch { .. })
        ));
    }

    #[test]
    fn test_resample_takes_reference() {
        let mut t = SpaceTracker::new();
        let t1 = t.source("t1.nii.gz", Space::T1w);
        let dwi = t.source("dwi.nii.gz", Space::Native);
        let out = t.resample_to(dwi, t1, "dwi_t1.nii.gz").unwrap();
        assert!(t.assert_same_space(out, t1).is_ok());
        assert_eq!(t.resolve_space_tag(out).unwrap(), Some("T1w"));
        assert_eq!(t.find(Path::new("dwi_t1.nii.gz")), Some(out));
        assert_eq!(t.find(Path::new("missing.nii.gz")), None);
    }

    #[test]
    fn test_unknown_handle() {
        let t = SpaceTracker::new();
        assert_eq!(
            t.space(ImageHandle(3)).unwrap_err(),
            SpaceError::UnknownImage(3)
        );
    }
}
