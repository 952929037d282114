//! 原始数据集和衍生目录树的路径布局.
//!
//! 原始数据集: `<root>/sub-<S>/ses-<T>/{anat,dwi,fmap}/`, 只读.
//!
//! 衍生目录: `<root>/derivatives/<name>/sub-<S>/ses-<T>/{anat,dwi,work}/`,
//! 首次写入时创建, 不要求预先存在.

use super::{validate_tag, ArtifactName, Datatype, Extension, NamingError, NamingResult};
use std::path::{Path, PathBuf};

/// 原始数据集中某个会话的目录.
pub fn raw_session_dir(dataset_root: &Path, subject: &str, session: &str) -> PathBuf {
    dataset_root
        .join(format!("sub-{subject}"))
        .join(format!("ses-{session}"))
}

/// 一个具名的衍生目录树.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivativeTree {
    base: PathBuf,
    name: String,
}

impl DerivativeTree {
    /// 在 `dataset_root/derivatives/name` 处构造衍生目录树.
    ///
    /// `name` 不能为空, 不能包含路径分隔符, 也不能是 `.` 或 `..`.
    pub fn new(dataset_root: impl AsRef<Path>, name: &str) -> NamingResult<Self> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
        if !valid {
            return Err(NamingError::InvalidDerivativeName(name.to_string()));
        }
        Ok(Self {
            base: dataset_root.as_ref().join("derivatives").join(name),
            name: name.to_string(),
        })
    }

    /// 衍生目录名.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 衍生目录根路径.
    #[inline]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// 某个受试者的目录.
    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.base.join(format!("sub-{subject}"))
    }

    /// 获取某个会话的子树视图. 受试者和会话标签在这里校验.
    pub fn session(&self, subject: &str, session: &str) -> NamingResult<SessionTree> {
        validate_tag("sub", subject)?;
        validate_tag("ses", session)?;
        Ok(SessionTree {
            dir: self.subject_dir(subject).join(format!("ses-{session}")),
            subject: subject.to_string(),
            session: session.to_string(),
        })
    }
}

/// 衍生目录树中某个会话的视图, 负责把 [`ArtifactName`] 落到具体路径上.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionTree {
    dir: PathBuf,
    subject: String,
    session: String,
}

impl SessionTree {
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

    /// 会话目录.
    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 数据类型子目录.
    pub fn datatype_dir(&self, datatype: Datatype) -> PathBuf {
        self.dir.join(datatype.dir_name())
    }

    /// 各阶段暂存目录的父目录.
    pub fn staging_root(&self) -> PathBuf {
        self.datatype_dir(Datatype::Work).join(".staging")
    }

    /// 以本会话的受试者 / 会话预填一个逻辑名.
    pub fn name(&self, suffix: &str, extension: Extension) -> NamingResult<ArtifactName> {
        ArtifactName::new(&self.subject, &self.session, suffix, extension)
    }

    /// 逻辑名对应的完整路径.
    pub fn path(&self, datatype: Datatype, name: &ArtifactName) -> PathBuf {
        debug_assert_eq!(name.subject(), self.subject);
        debug_assert_eq!(name.session(), self.session);
        self.datatype_dir(datatype).join(name.file_name())
    }

    /// 常用的 nifti 产物路径: `space` 为 `None` 代表原生空间.
    pub fn nifti(
        &self,
        datatype: Datatype,
        space: Option<&str>,
        desc: &str,
        suffix: &str,
    ) -> NamingResult<PathBuf> {
        let name = self
            .name(suffix, Extension::NiiGz)?
            .with_space(space)?
            .with_desc(desc)?;
        Ok(self.path(datatype, &name))
    }
}
