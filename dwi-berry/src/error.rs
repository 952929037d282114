//! 运行时错误.
//!
//! 各组件的底层错误 ([`ToolError`], [`SpaceError`], [`NamingError`], [`VolumeError`])
//! 定义在各自模块里; 这里汇总出阶段级别的 [`StageError`] 和批处理级别的 [`PipelineError`].
//!
//! 传播策略:
//!
//! 1. [`StageError`] 只终止当前会话的剩余阶段, 不影响同批次的其它会话.
//! 2. [`PipelineError`] 中的参数错误和数据集根目录错误会在任何会话开始前终止整个调用.

use crate::data::VolumeError;
use crate::naming::NamingError;
use crate::space::SpaceError;
use crate::tool::ToolError;
use itertools::Itertools;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 以 `a, b, c` 的形式展示一组路径.
fn display_paths(paths: &[PathBuf]) -> String {
    paths.iter().map(|p| p.display()).join(", ")
}

/// 单个阶段运行失败的原因.
#[derive(Debug, Error)]
pub enum StageError {
    /// 外部工具失败 (非零退出, 超时, 或声明的输出缺失).
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// 动作返回成功, 但声明的输出并未全部出现.
    #[error("stage `{stage}` reported success but outputs are missing: {}", display_paths(.missing))]
    IncompleteOutput {
        /// 阶段名.
        stage: String,

        /// 缺失的输出.
        missing: Vec<PathBuf>,
    },

    /// 阶段开始前, 其声明的输入不存在.
    #[error("stage `{stage}` requires `{}` which does not exist", .path.display())]
    MissingInput {
        /// 阶段名.
        stage: String,

        /// 缺失的输入.
        path: PathBuf,
    },

    /// 两个本应共享网格的图像不在同一空间.
    #[error(transparent)]
    Space(#[from] SpaceError),

    /// 命名输入不合法.
    #[error(transparent)]
    Naming(#[from] NamingError),

    /// 进程内读写 / 变换体数据失败.
    #[error(transparent)]
    Volume(#[from] VolumeError),

    /// 文件系统错误.
    #[error("I/O error at `{}`: {source}", .path.display())]
    Io {
        /// 出错的路径.
        path: PathBuf,

        /// 底层错误.
        #[source]
        source: io::Error,
    },
}

impl StageError {
    /// 构造一个带路径的 I/O 错误转换器, 便于配合 `map_err` 使用.
    pub fn io_at(path: impl AsRef<Path>) -> impl FnOnce(io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| Self::Io { path, source }
    }
}

/// 批处理级别的错误.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 命令行参数错误. 致命, 任何会话开始前终止.
    #[error("argument error: {0}")]
    Argument(String),

    /// 数据集根目录不存在或不是目录. 致命.
    #[error("dataset root `{}` is not a directory", .0.display())]
    DatasetRoot(PathBuf),

    /// 声明阶段时发现的问题, 例如空间不一致或命名非法.
    #[error("cannot plan stage `{stage}`: {source}")]
    Plan {
        /// 正在声明的阶段.
        stage: String,

        /// 底层原因.
        #[source]
        source: StageError,
    },

    /// 命名输入不合法.
    #[error(transparent)]
    Naming(#[from] NamingError),

    /// 配置文件错误.
    #[error("configuration error in `{}`: {message}", .path.display())]
    Config {
        /// 配置文件路径.
        path: PathBuf,

        /// 错误描述.
        message: String,
    },

    /// 文件系统错误.
    #[error("I/O error at `{}`: {source}", .path.display())]
    Io {
        /// 出错的路径.
        path: PathBuf,

        /// 底层错误.
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    /// 构造一个带路径的 I/O 错误转换器.
    pub fn io_at(path: impl AsRef<Path>) -> impl FnOnce(io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| Self::Io { path, source }
    }

    /// 给声明阶段时的错误附上阶段名.
    pub fn plan(stage: &str) -> impl FnOnce(StageError) -> Self + '_ {
        move |source| Self::Plan {
            stage: stage.to_string(),
            source,
        }
    }
}
