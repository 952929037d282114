//! 会话发现 (SessionDiscovery).
//!
//! 扫描 `<root>/sub-<S>/` 下的 `ses-*` 目录, 用 [`SessionProbe`] 逐个检查必需输入.
//! 缺少必需输入的会话以 [`DiscoveryWarning`] 记录并排除, 不会中止批处理.
//!
//! # 注意
//!
//! 1. 会话按 id 字典序排列, 保证多次运行顺序一致.
//! 2. 显式指定会话 id 时不枚举其它会话, 但仍检查该会话的必需输入.

use crate::error::PipelineError;
use crate::naming::validate_tag;
use itertools::Itertools;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

pub mod probe;

pub use probe::{
    AtlasInputs, AtlasTarget, DerivativeProbe, DwiInputs, FieldmapPair, RankedLookup, RawDwiProbe,
};

/// 会话过滤条件.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionFilter {
    /// 枚举受试者目录下的全部会话.
    All,

    /// 只处理给定会话.
    Only(String),
}

impl FromStr for SessionFilter {
    type Err = PipelineError;

    /// `all` 代表全部会话; 其余值视为会话 id (不带 `ses-` 前缀).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(Self::All);
        }
        validate_tag("ses", s)?;
        Ok(Self::Only(s.to_string()))
    }
}

/// 检查会话并收集其必需输入.
pub trait SessionProbe {
    /// 收集到的输入.
    type Inputs;

    /// 枚举会话时扫描的受试者目录.
    fn subject_dir(&self, subject: &str) -> PathBuf;

    /// 检查一个会话. 失败时返回缺失项的描述列表.
    fn probe(&self, subject: &str, session: &str) -> Result<Self::Inputs, Vec<String>>;
}

/// 一个通过检查的会话.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session<I> {
    /// 受试者 id.
    pub subject: String,

    /// 会话 id.
    pub session: String,

    /// 必需输入.
    pub inputs: I,
}

/// 被排除的会话. 这是一个警告, 不是错误.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryWarning {
    /// 会话 id.
    pub session: String,

    /// 缺失项.
    pub missing: Vec<String>,
}

impl fmt::Display for DiscoveryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session `{}` excluded, missing: {}",
            self.session,
            self.missing.iter().join(", ")
        )
    }
}

/// 一次发现的结果.
#[derive(Clone, Debug)]
pub struct Discovery<I> {
    /// 通过检查的会话, 按 id 字典序.
    pub sessions: Vec<Session<I>>,

    /// 被排除的会话.
    pub warnings: Vec<DiscoveryWarning>,
}

/// 数据集根目录必须是一个已存在的目录.
pub fn check_dataset_root(root: &Path) -> Result<(), PipelineError> {
    if root.is_dir() {
        Ok(())
    } else {
        Err(PipelineError::DatasetRoot(root.to_path_buf()))
    }
}

fn check_subject_dir(subject_dir: &Path) -> Result<(), PipelineError> {
    if subject_dir.is_dir() {
        Ok(())
    } else {
        Err(PipelineError::Argument(format!(
            "subject directory `{}` does not exist",
            subject_dir.display()
        )))
    }
}

/// 列出受试者目录下所有合法的会话 id, 按字典序.
pub fn list_sessions(subject_dir: &Path) -> Result<Vec<String>, PipelineError> {
    check_subject_dir(subject_dir)?;
    let entries = fs::read_dir(subject_dir).map_err(PipelineError::io_at(subject_dir))?;
    let mut sessions = vec![];
    for entry in entries {
        let entry = entry.map_err(PipelineError::io_at(subject_dir))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(|n| n.strip_prefix("ses-")) else {
            continue;
        };
        if validate_tag("ses", id).is_ok() {
            sessions.push(id.to_string());
        } else {
            debug!(dir = %entry.path().display(), "ignoring malformed session directory");
        }
    }
    sessions.sort();
    Ok(sessions)
}

/// 发现受试者 `subject` 下满足 `filter` 且具备必需输入的会话.
///
/// # 返回值
///
/// 受试者 id 非法, 或受试者目录不存在, 返回 `Err`; 单个会话缺少输入只产生警告.
pub fn discover<P: SessionProbe>(
    probe: &P,
    subject: &str,
    filter: &SessionFilter,
) -> Result<Discovery<P::Inputs>, PipelineError> {
    validate_tag("sub", subject)?;
    let candidates = match filter {
        SessionFilter::All => list_sessions(&probe.subject_dir(subject))?,
        SessionFilter::Only(session) => {
            check_subject_dir(&probe.subject_dir(subject))?;
            vec![session.clone()]
        }
    };

    let mut sessions = vec![];
    let mut warnings = vec![];
    for session in candidates {
        match probe.probe(subject, &session) {
            Ok(inputs) => {
                debug!(subject, session = %session, "session admitted");
                sessions.push(Session {
                    subject: subject.to_string(),
                    session,
                    inputs,
                });
            }
            Err(missing) => {
                let w = DiscoveryWarning { session, missing };
                warn!(subject, "{w}");
                warnings.push(w);
            }
        }
    }
    Ok(Discovery { sessions, warnings })
}
