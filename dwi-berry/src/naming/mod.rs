//! 输出命名与路径推导 (PathScheme).
//!
//! 该模块没有任何副作用. 同一个逻辑元组
//! `(subject, session, space?, descriptor?, suffix, extension)`
//! 在任何一次运行, 任何一种流水线变体下都得到同一个文件名; 反之文件名也可以解析回元组.
//!
//! 文件名格式为 `sub-<S>_ses-<T>[_space-<X>][_desc-<D>]_<suffix><ext>`.
//! 每个实体值只允许 ASCII 字母和数字, 因此 `_` 和 `-` 可以无歧义地作为分隔符,
//! 不同元组不可能折叠到同一文件名.
//!
//! 缺省空间即 "native": 原生空间的输出不带 `space-` 实体.

mod tree;

pub use tree::{raw_session_dir, DerivativeTree, SessionTree};

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 原生空间的名字. 显式传入时等价于不写空间.
pub const NATIVE_SPACE: &str = "native";

/// 命名错误.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NamingError {
    /// 实体值包含不能安全用于路径构造的字符.
    #[error("invalid {entity} tag `{value}`: only ASCII letters and digits are allowed")]
    InvalidTag {
        /// 实体名, 例如 `desc`.
        entity: &'static str,

        /// 原始值.
        value: String,
    },

    /// 文件名不符合命名规则.
    #[error("`{0}` does not follow the sub-<id>_ses-<id>[_space-<x>][_desc-<y>]_<suffix><ext> pattern")]
    Unparsable(String),

    /// 仅支持 `.nii` 和 `.nii.gz`.
    #[error("unsupported extension (need .nii or .nii.gz): `{}`", .0.display())]
    UnsupportedExtension(PathBuf),

    /// 衍生目录名不合法.
    #[error("invalid derivative name `{0}`")]
    InvalidDerivativeName(String),
}

/// 命名结果.
pub type NamingResult<T> = Result<T, NamingError>;

/// 检查实体值: 非空, 且仅由 ASCII 字母数字组成.
pub fn validate_tag(entity: &'static str, value: &str) -> NamingResult<()> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(NamingError::InvalidTag {
            entity,
            value: value.to_string(),
        })
    }
}

/// 衍生目录下的数据类型子目录.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Datatype {
    /// 解剖像.
    Anat,

    /// 弥散像及其标量图.
    Dwi,

    /// 中间结果与暂存区.
    Work,
}

impl Datatype {
    /// 子目录名.
    pub const fn dir_name(&self) -> &'static str {
        match self {
            Datatype::Anat => "anat",
            Datatype::Dwi => "dwi",
            Datatype::Work => "work",
        }
    }
}

/// 已知的文件扩展名.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Extension {
    /// `.nii.gz`
    NiiGz,

    /// `.nii`
    Nii,

    /// `.bval`
    Bval,

    /// `.bvec`
    Bvec,

    /// `.json`
    Json,

    /// `.mat`, ITK 线性变换.
    Mat,

    /// `.csv`
    Csv,
}

impl Extension {
    /// 全部扩展名. 解析时按此顺序匹配, 所以 `.nii.gz` 必须在 `.nii` 之前.
    pub const ALL: [Extension; 7] = [
        Extension::NiiGz,
        Extension::Nii,
        Extension::Bval,
        Extension::Bvec,
        Extension::Json,
        Extension::Mat,
        Extension::Csv,
    ];

    /// 带点的扩展名字符串.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Extension::NiiGz => ".nii.gz",
            Extension::Nii => ".nii",
            Extension::Bval => ".bval",
            Extension::Bvec => ".bvec",
            Extension::Json => ".json",
            Extension::Mat => ".mat",
            Extension::Csv => ".csv",
        }
    }

    /// 从文件名尾部识别扩展名, 返回 (去掉扩展名的主干, 扩展名).
    pub fn split(file_name: &str) -> Option<(&str, Extension)> {
        Self::ALL.into_iter().find_map(|ext| {
            file_name
                .strip_suffix(ext.as_str())
                .filter(|stem| !stem.is_empty())
                .map(|stem| (stem, ext))
        })
    }
}

/// 单个衍生产物的逻辑名. 构造时即校验全部实体.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArtifactName {
    subject: String,
    session: String,
    space: Option<String>,
    desc: Option<String>,
    suffix: String,
    extension: Extension,
}

impl ArtifactName {
    /// 以受试者, 会话, 后缀 (模态) 和扩展名构造, 空间为原生, 无描述符.
    pub fn new(
        subject: &str,
        session: &str,
        suffix: &str,
        extension: Extension,
    ) -> NamingResult<Self> {
        validate_tag("sub", subject)?;
        validate_tag("ses", session)?;
        validate_tag("suffix", suffix)?;
        Ok(Self {
            subject: subject.to_string(),
            session: session.to_string(),
            space: None,
            desc: None,
            suffix: suffix.to_string(),
            extension,
        })
    }

    /// 设置坐标空间标签. `None` 或 `"native"` 代表原生空间.
    pub fn with_space(mut self, space: Option<&str>) -> NamingResult<Self> {
        self.space = match space {
            None | Some(NATIVE_SPACE) => None,
            Some(label) => {
                validate_tag("space", label)?;
                Some(label.to_string())
            }
        };
        Ok(self)
    }

    /// 设置内容描述符.
    pub fn with_desc(mut self, desc: &str) -> NamingResult<Self> {
        validate_tag("desc", desc)?;
        self.desc = Some(desc.to_string());
        Ok(self)
    }

    /// 替换扩展名. 用于同一产物的伴随文件 (例如 `.bval` / `.bvec`).
    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extension = extension;
        self
    }

    /// 受试者.
    #[inline]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// 会话.
    #[inline]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// 空间标签. 原生空间返回 `None`.
    #[inline]
    pub fn space(&self) -> Option<&str> {
        self.space.as_deref()
    }

    /// 描述符.
    #[inline]
    pub fn desc(&self) -> Option<&str> {
        self.desc.as_deref()
    }

    /// 后缀 (模态).
    #[inline]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// 扩展名.
    #[inline]
    pub fn extension(&self) -> Extension {
        self.extension
    }

    /// 生成文件名.
    pub fn file_name(&self) -> String {
        self.to_string()
    }

    /// 从文件名解析逻辑名. 与 [`Self::file_name`] 互逆.
    pub fn parse(file_name: &str) -> NamingResult<Self> {
        let unparsable = || NamingError::Unparsable(file_name.to_string());
        let (stem, extension) = Extension::split(file_name).ok_or_else(unparsable)?;

        let mut parts = stem.split('_').peekable();
        let mut entity = |key: &str| -> Option<String> {
            let value = parts.peek()?.strip_prefix(key)?.strip_prefix('-')?.to_string();
            parts.next();
            Some(value)
        };
        let subject = entity("sub").ok_or_else(unparsable)?;
        let session = entity("ses").ok_or_else(unparsable)?;
        let space = entity("space");
        let desc = entity("desc");
        let suffix = parts.next().ok_or_else(unparsable)?;
        if parts.next().is_some() {
            return Err(unparsable());
        }

        let mut name = Self::new(&subject, &session, suffix, extension)?;
        if let Some(space) = space {
            validate_tag("space", &space)?;
            name.space = Some(space);
        }
        if let Some(desc) = desc {
            name = name.with_desc(&desc)?;
        }
        Ok(name)
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}_ses-{}", self.subject, self.session)?;
        if let Some(space) = &self.space {
            write!(f, "_space-{space}")?;
        }
        if let Some(desc) = &self.desc {
            write!(f, "_desc-{desc}")?;
        }
        write!(f, "_{}{}", self.suffix, self.extension.as_str())
    }
}

/// 去掉 `.nii.gz` / `.nii` 扩展名. 其它扩展名返回 `None`.
pub fn strip_nifti_ext(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(Extension::NiiGz.as_str())
        .or_else(|| file_name.strip_suffix(Extension::Nii.as_str()))
}

/// 在 nifti 路径的扩展名之前插入 `suffix`, 例如
/// `a/b.nii.gz` + `_reoriented` -> `a/b_reoriented.nii.gz`.
pub fn insert_suffix(path: &Path, suffix: &str) -> NamingResult<PathBuf> {
    let unsupported = || NamingError::UnsupportedExtension(path.to_path_buf());
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(unsupported)?;
    let ext = if file_name.ends_with(Extension::NiiGz.as_str()) {
        Extension::NiiGz
    } else if file_name.ends_with(Extension::Nii.as_str()) {
        Extension::Nii
    } else {
        return Err(unsupported());
    };
    let stem = strip_nifti_ext(file_name).ok_or_else(unsupported)?;
    Ok(path.with_file_name(format!("{stem}{suffix}{}", ext.as_str())))
}
