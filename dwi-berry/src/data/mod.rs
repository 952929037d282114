use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayD, ArrayView, ArrayViewMut, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiError, NiftiHeader, NiftiObject, ReaderOptions};
use thiserror::Error;

use crate::consts::gray::*;
use crate::Idx3d;

pub mod morph_3d;
pub mod reorient;

pub use reorient::{Reorientation, ReorientError};

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 体数据读写错误.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// nifti 读写失败.
    #[error("cannot read or write nifti `{}`: {source}", .path.display())]
    Nifti {
        /// 文件路径.
        path: PathBuf,

        /// 底层错误.
        #[source]
        source: NiftiError,
    },

    /// 数据不是三维的 (允许末尾单例的第四维).
    #[error("`{}` has shape {shape:?}; expected a 3D volume", .path.display())]
    NotThreeD {
        /// 文件路径.
        path: PathBuf,

        /// 实际形状.
        shape: Vec<usize>,
    },

    /// 重定向参数不合法.
    #[error(transparent)]
    Reorient(#[from] ReorientError),

    /// 两个体数据的网格形状不一致.
    #[error("grid mismatch: `{}` has shape {left:?} but `{}` has shape {right:?}", .left_path.display(), .right_path.display())]
    ShapeMismatch {
        /// 左侧文件.
        left_path: PathBuf,

        /// 左侧形状.
        left: Idx3d,

        /// 右侧文件.
        right_path: PathBuf,

        /// 右侧形状.
        right: Idx3d,
    },
}

impl VolumeError {
    fn nifti_at(path: &Path) -> impl FnOnce(NiftiError) -> Self + '_ {
        move |source| Self::Nifti {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// 体数据读写结果.
pub type VolumeResult<T> = Result<T, VolumeError>;

/// 只读取 header, 判断文件是否是真正的 4D 体数据 (第四维长度大于 1).
pub fn is_4d(path: impl AsRef<Path>) -> VolumeResult<bool> {
    let path = path.as_ref();
    let header = NiftiHeader::from_file(path).map_err(VolumeError::nifti_at(path))?;
    let [rank, _, _, _, t, ..] = header.dim;
    Ok(rank >= 4 && t > 1)
}

/// 去掉长度为 1 的第四维.
fn squeeze_singleton_4th(data: ArrayD<f32>) -> ArrayD<f32> {
    if data.ndim() == 4 && data.shape()[3] == 1 {
        data.index_axis_move(Axis(3), 0)
    } else {
        data
    }
}

/// 读取 nii 文件为 `(i, j, k)` 顺序的 `f32` 三维数组.
fn read_3d(path: &Path) -> VolumeResult<(BoxedHeader, Array3<f32>)> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(VolumeError::nifti_at(path))?;
    let header = Box::new(obj.header().clone());

    let data = obj
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(VolumeError::nifti_at(path))?;
    let data = squeeze_singleton_4th(data);
    let shape = data.shape().to_vec();
    let data = data
        .into_dimensionality::<Ix3>()
        .map_err(|_| VolumeError::NotThreeD {
            path: path.to_path_buf(),
            shape,
        })?;
    Ok((header, data))
}

/// 写出时使用的 header: 去掉强度缩放, 其余 (尤其是仿射) 保持不变.
fn output_header(reference: &NiftiHeader) -> NiftiHeader {
    let mut header = reference.clone();
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    header
}

/// 获取 header 中 `(i, j, k)` 三个维度的体素个数.
#[inline]
fn get_shape_from_header(h: &NiftiHeader) -> Idx3d {
    let [_, i, j, k, ..] = h.dim;
    (i as usize, j as usize, k as usize)
}

/// nii 文件 header 的共用属性和部分通用操作.
pub trait NiftiHeaderAttr {
    /// 获取 header 部分.
    fn header(&self) -> &NiftiHeader;

    /// header 记录的数据形状 `(i, j, k)`.
    #[inline]
    fn header_shape(&self) -> Idx3d {
        get_shape_from_header(self.header())
    }

    /// 获取单个体素分辨率 `(i, j, k)`, 以毫米为单位.
    #[inline]
    fn pix_dim(&self) -> [f64; 3] {
        let [_, i, j, k, ..] = self.header().pixdim;
        [i as f64, j as f64, k as f64]
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    fn voxel(&self) -> f64 {
        self.pix_dim().iter().product()
    }
}

/// 两种体数据共用的只读方法.
macro_rules! impl_volume_common {
    ($volume: ty, $elem: ty) => {
        impl NiftiHeaderAttr for $volume {
            #[inline]
            fn header(&self) -> &NiftiHeader {
                &self.header
            }
        }

        impl Index<Idx3d> for $volume {
            type Output = $elem;

            #[inline]
            fn index(&self, index: Idx3d) -> &Self::Output {
                &self.data[index]
            }
        }

        impl IndexMut<Idx3d> for $volume {
            #[inline]
            fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
                &mut self.data[index]
            }
        }

        impl $volume {
            /// 以给定 header 和数据直接构造. 数据按 `(i, j, k)` 顺序组织.
            #[inline]
            pub fn with_header(header: &NiftiHeader, data: Array3<$elem>) -> Self {
                Self {
                    header: Box::new(header.clone()),
                    data,
                }
            }

            /// 数据形状 `(i, j, k)`.
            #[inline]
            pub fn shape(&self) -> Idx3d {
                self.data.dim()
            }

            /// 体素个数.
            #[inline]
            pub fn size(&self) -> usize {
                self.data.len()
            }

            /// 检查索引是否合法.
            #[inline]
            pub fn check(&self, (i0, j0, k0): &Idx3d) -> bool {
                let (i, j, k) = self.shape();
                *i0 < i && *j0 < j && *k0 < k
            }

            /// 获得数据的一份不可变 shallow copy.
            #[inline]
            pub fn data(&self) -> ArrayView<'_, $elem, Ix3> {
                self.data.view()
            }

            /// 获得数据的一份可变 shallow copy.
            #[inline]
            pub fn data_mut(&mut self) -> ArrayViewMut<'_, $elem, Ix3> {
                self.data.view_mut()
            }

            /// 消费自身, 获得底层数据.
            #[inline]
            pub fn into_data(self) -> Array3<$elem> {
                self.data
            }

            /// 替换底层数据, 保留 header. 形状可以改变 (例如重定向之后).
            #[inline]
            pub fn replace_data(&mut self, data: Array3<$elem>) {
                self.data = data;
            }

            /// 以 header 为参照写出 nii 文件. 扩展名为 `.nii.gz` 时自动压缩.
            /// 仿射信息保持不变.
            pub fn save(&self, path: impl AsRef<Path>) -> VolumeResult<()> {
                let path = path.as_ref();
                let header = output_header(&self.header);
                WriterOptions::new(path)
                    .reference_header(&header)
                    .write_nifti(&self.data)
                    .map_err(VolumeError::nifti_at(path))
            }

            /// 与另一个体数据形状是否一致.
            #[inline]
            pub fn same_shape<V: NiftiHeaderAttr>(&self, other: &V) -> bool {
                self.shape() == other.header_shape()
            }
        }
    };
}

/// nii 格式的三维标量图 (例如 FA), 以 `f32` 保存.
#[derive(Debug, Clone)]
pub struct ScalarVolume {
    header: BoxedHeader,
    data: Array3<f32>,
}

impl_volume_common!(ScalarVolume, f32);

impl ScalarVolume {
    /// 打开 nii 文件. 末尾长度为 1 的第四维会被去掉, 其它非三维数据返回 `Err`.
    pub fn open(path: impl AsRef<Path>) -> VolumeResult<Self> {
        let (header, data) = read_3d(path.as_ref())?;
        Ok(Self { header, data })
    }

    /// 将 NaN 和正负无穷替换为 0. 返回被替换的体素个数.
    pub fn sanitize(&mut self) -> usize {
        let mut cnt = 0usize;
        self.data
            .iter_mut()
            .filter(|v| !v.is_finite())
            .for_each(|v| {
                cnt += 1;
                *v = 0.0;
            });
        cnt
    }
}

/// nii 格式的三维二值掩膜. 体素值只有 `MASK_BACKGROUND` 和 `MASK_FOREGROUND`.
#[derive(Debug, Clone)]
pub struct MaskVolume {
    header: BoxedHeader,
    data: Array3<u8>,
}

impl_volume_common!(MaskVolume, u8);

impl MaskVolume {
    /// 打开 nii 文件格式的掩膜. 无论磁盘上的数据类型是什么,
    /// 严格大于 `MASK_THRESHOLD` 的体素视为前景.
    pub fn open(path: impl AsRef<Path>) -> VolumeResult<Self> {
        let (header, data) = read_3d(path.as_ref())?;
        let data = data.mapv(|v| {
            if v > MASK_THRESHOLD {
                MASK_FOREGROUND
            } else {
                MASK_BACKGROUND
            }
        });
        Ok(Self { header, data })
    }

    /// 根据裸数据直接创建掩膜, header 取默认值 (各向同性 1mm).
    /// 非零体素视为前景.
    ///
    /// # 注意
    ///
    /// 该方法创建的实体没有有效的空间信息, 你应仅将其用于实验和测试目的.
    pub fn fake(data: Array3<u8>) -> Self {
        let mut header = Box::<NiftiHeader>::default();
        let (i, j, k) = data.dim();
        header.dim = [3, i as u16, j as u16, k as u16, 1, 1, 1, 1];
        header.pixdim = [1.0; 8];
        header.intent_name[..4].copy_from_slice(b"fake");
        let data = data.mapv(|v| if v != 0 { MASK_FOREGROUND } else { MASK_BACKGROUND });
        Self { header, data }
    }

    /// 前景体素个数.
    #[inline]
    pub fn count_foreground(&self) -> usize {
        self.data.iter().filter(|p| is_foreground(**p)).count()
    }

    /// 是否为全背景?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.iter().copied().all(is_background)
    }

    /// 收集所有前景体素的索引, 按 `(i, j, k)` 行优先顺序.
    pub fn foreground_pos(&self) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(pos, p)| is_foreground(*p).then_some(pos))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_fake_mask_binarizes() {
        let mut data = Array3::<u8>::zeros((3, 4, 5));
        data[(0, 0, 0)] = 7;
        data[(2, 3, 4)] = 1;
        let mask = MaskVolume::fake(data);
        assert_eq!(mask.shape(), (3, 4, 5));
        assert_eq!(mask.header_shape(), (3, 4, 5));
        assert_eq!(mask.count_foreground(), 2);
        assert_eq!(mask[(0, 0, 0)], MASK_FOREGROUND);
        assert_eq!(mask.foreground_pos(), vec![(0, 0, 0), (2, 3, 4)]);
        assert!(!mask.is_empty());
    }

    #[test]
    fn test_mask_save_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.nii.gz");
        let mut data = Array3::<u8>::zeros((4, 5, 6));
        data[(1, 2, 3)] = 1;
        data[(3, 4, 5)] = 1;
        MaskVolume::fake(data.clone()).save(&path).unwrap();

        let back = MaskVolume::open(&path).unwrap();
        assert_eq!(back.shape(), (4, 5, 6));
        assert_eq!(back.data(), data.view());
        assert!(!is_4d(&path).unwrap());
    }

    #[test]
    fn test_scalar_sanitize() {
        let mask = MaskVolume::fake(Array3::zeros((2, 2, 2)));
        let mut data = Array3::<f32>::zeros((2, 2, 2));
        data[(0, 0, 0)] = f32::NAN;
        data[(1, 1, 1)] = f32::NEG_INFINITY;
        data[(1, 0, 1)] = 2.5;
        let mut scalar = ScalarVolume::with_header(mask.header(), data);
        assert_eq!(scalar.sanitize(), 2);
        assert_eq!(scalar[(0, 0, 0)], 0.0);
        assert_eq!(scalar[(1, 0, 1)], 2.5);
    }
}
