#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 以检查点 (checkpoint) 方式编排 BIDS 数据集上的弥散 / 解剖 MRI 多阶段处理流水线.
//!
//! 该 crate 本身不实现任何信号处理算法. 去噪, 涡流校正, 张量拟合, 配准等步骤均交给外部工具,
//! 这里只负责: 会话发现, 阶段依赖顺序, 跳过已完成工作, 坐标空间记账, 输出命名,
//! 以及唯一一个进程内算法: 掩膜精修 (mask polishing).
//!
//! # 注意
//!
//! 1. 文件系统即执行日志: 一个阶段是否完成, 唯一的判据是其声明的输出文件是否全部存在.
//! 2. 所有阶段先写入暂存目录, 成功后再整体 rename 到最终位置,
//!   因此 "存在" 的输出一定是完整的.
//! 3. 人工审阅掩膜的阶段只等待编辑器进程退出, 程序无法验证编辑是否正确. 这是一条信任边界.
//!
//! # 组件 (依赖顺序, 叶子在前)
//!
//! ### PathScheme ✅
//!
//! 纯函数式的命名 / 路径推导. 实现位于 `dwi-berry/src/naming`.
//!
//! ### SessionDiscovery ✅
//!
//! 找出某个受试者下具备必需原始输入的会话. 实现位于 `dwi-berry/src/dataset`.
//!
//! ### ExternalToolAdapter ✅
//!
//! 以统一接口调用外部工具, 并把退出码 / 缺失输出转换为显式错误.
//! 实现位于 `dwi-berry/src/tool`.
//!
//! ### MaskPolisher ✅
//!
//! 最大连通域过滤, 中值平滑, 空洞填充. 实现位于 `dwi-berry/src/data/morph_3d`.
//!
//! ### CoordinateSpaceTracker ✅
//!
//! 记录每个图像经过的重定向 / 重采样 / 配准操作. 实现位于 `dwi-berry/src/space`.
//!
//! ### StageRunner ✅
//!
//! 检查点引擎. 实现位于 `dwi-berry/src/stage`.
//!
//! ### PipelineDAG / PipelineRunner ✅
//!
//! 三种流水线变体的阶段列表, 以及逐会话的批量驱动. 实现位于 `dwi-berry/src/pipeline`.
//!
//! ### ROI 指标提取 ✅
//!
//! 在图谱空间内按 ROI 统计标量图的均值 / 标准差 / 极值 / 中位数.
//! 实现位于 `dwi-berry/src/roi.rs`.

/// 三维索引, 按 nifti 的 `(i, j, k)` 顺序.
pub type Idx3d = (usize, usize, usize);

/// nii 格式 3D 体数据的读写.
pub mod data;

pub use data::{MaskVolume, NiftiHeaderAttr, ScalarVolume};

pub mod config;
pub mod consts;
pub mod dataset;
pub mod error;
pub mod naming;
pub mod pipeline;
pub mod prelude;
pub mod roi;
pub mod space;
pub mod stage;
pub mod tool;
