//! 二值掩膜的 3 x 3 x 3 中值滤波.

use crate::consts::{gray::*, ElemType, MEDIAN_KERNEL_LEN};
use crate::{Idx3d, MaskVolume};
use ndarray::{Array3, ArrayView3, Zip};

/// 以 `(i, j, k)` 为中心的 3 x 3 x 3 邻域中前景体素的个数. 越界部分视为背景.
fn kernel_foreground(data: &ArrayView3<u8>, (i, j, k): Idx3d) -> usize {
    let (si, sj, sk) = data.dim();
    let range = |c: usize, len: usize| c.saturating_sub(1)..(c + 2).min(len);
    let mut cnt = 0usize;
    for ii in range(i, si) {
        for jj in range(j, sj) {
            for kk in range(k, sk) {
                if ElemType::from(data[(ii, jj, kk)]).is_foreground() {
                    cnt += 1;
                }
            }
        }
    }
    cnt
}

/// 二值中值: 27 个体素中前景过半则为前景.
#[inline]
fn median_at(data: &ArrayView3<u8>, pos: Idx3d) -> u8 {
    if 2 * kernel_foreground(data, pos) > MEDIAN_KERNEL_LEN {
        MASK_FOREGROUND
    } else {
        MASK_BACKGROUND
    }
}

impl MaskVolume {
    /// 计算中值滤波的结果, 不修改自身.
    pub fn median_smoothed(&self) -> Array3<u8> {
        let src = self.data.view();
        let mut out = Array3::<u8>::zeros(self.shape());
        #[cfg(feature = "rayon")]
        Zip::indexed(&mut out).par_for_each(|pos, v| *v = median_at(&src, pos));
        #[cfg(not(feature = "rayon"))]
        Zip::indexed(&mut out).for_each(|pos, v| *v = median_at(&src, pos));
        out
    }

    /// 对掩膜进行 3 x 3 x 3 中值滤波.
    ///
    /// # 注意
    ///
    /// 如果滤波会把掩膜变为全背景, 则保持原样不变.
    ///
    /// # 返回值
    ///
    /// 如果以此法修改了掩膜则返回 `true`, 否则返回 `false`.
    pub fn median_filter(&mut self) -> bool {
        let out = self.median_smoothed();
        if out.iter().copied().all(is_background) || out == self.data {
            return false;
        }
        self.data = out;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_removes_spike() {
        let mut data = Array3::<u8>::zeros((9, 9, 9));
        data.slice_mut(ndarray::s![2..7, 2..7, 2..7]).fill(1);
        data[(1, 4, 4)] = 1;
        let mut mask = MaskVolume::fake(data);
        assert!(mask.median_filter());
        assert_eq!(mask[(1, 4, 4)], MASK_BACKGROUND);
        assert_eq!(mask[(4, 4, 4)], MASK_FOREGROUND);
    }

    #[test]
    fn test_median_never_erases() {
        let mut data = Array3::<u8>::zeros((4, 4, 4));
        data[(1, 1, 1)] = 1;
        let mut mask = MaskVolume::fake(data.clone());
        assert!(!mask.median_filter());
        assert_eq!(mask.data(), data.view());
    }

    #[test]
    fn test_boundary_counts_as_background() {
        let data = Array3::<u8>::ones((3, 3, 3));
        let mask = MaskVolume::fake(data);
        let out = mask.median_smoothed();
        // 角点: 邻域内只有 8 个体素在体数据内
        assert_eq!(out[(0, 0, 0)], MASK_BACKGROUND);
        // 面中心: 18 个
        assert_eq!(out[(0, 1, 1)], MASK_FOREGROUND);
        assert_eq!(out[(1, 1, 1)], MASK_FOREGROUND);
    }
}
