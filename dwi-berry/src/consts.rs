//! 通用常量.

/// 二值掩膜的体素值.
pub mod gray {
    /// 掩膜背景的体素值.
    pub const MASK_BACKGROUND: u8 = 0;

    /// 掩膜前景的体素值.
    pub const MASK_FOREGROUND: u8 = 1;

    /// 浮点掩膜二值化阈值. 严格大于该值才视为前景.
    pub const MASK_THRESHOLD: f32 = 0.5;

    /// 体素是否是前景?
    #[inline]
    pub const fn is_foreground(p: u8) -> bool {
        matches!(p, MASK_FOREGROUND)
    }

    /// 体素是否是背景?
    #[inline]
    pub const fn is_background(p: u8) -> bool {
        matches!(p, MASK_BACKGROUND)
    }
}

/// 张量拟合产生的四个标量图描述符, 顺序固定.
pub const DTI_METRICS: [&str; 4] = ["FA", "MD", "AD", "RD"];

/// T1 空间 DTI 流水线的默认衍生目录名.
pub const T1_SPACE_DERIV_NAME: &str = "pdti2";

/// 原生空间 DTI 流水线的默认衍生目录名.
pub const NATIVE_DERIV_NAME: &str = "pigdti";

/// 图谱配准流水线的默认输出衍生目录名.
pub const ATLAS_DERIV_NAME: &str = "atlas_space";

/// 图谱配准时, 配准协作者给重采样结果追加的文件名后缀.
pub const ATLAS_APPLY_SUFFIX: &str = "_space-Atlas";

/// 掩膜精修的最大迭代轮数.
pub const MAX_POLISH_ROUNDS: usize = 32;

/// 中值滤波核内体素个数 (3 x 3 x 3).
pub const MEDIAN_KERNEL_LEN: usize = 27;

/// 体素类型.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ElemType {
    /// `MASK_BACKGROUND`, 代表背景.
    Background,

    /// `MASK_FOREGROUND`, 代表前景.
    Foreground,
}

impl ElemType {
    /// 是否为前景.
    #[inline]
    pub fn is_foreground(&self) -> bool {
        matches!(self, Self::Foreground)
    }

    /// 是否为背景.
    #[inline]
    pub fn is_background(&self) -> bool {
        !self.is_foreground()
    }
}

impl From<u8> for ElemType {
    #[inline]
    fn from(value: u8) -> Self {
        if gray::is_foreground(value) {
            Self::Foreground
        } else {
            Self::Background
        }
    }
}
