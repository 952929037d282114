//! 3D 形态学操作: 掩膜精修.
//!
//! 每一轮依次执行:
//!
//! 1. 保留 6-相邻意义下最大的前景连通区域;
//! 2. 3 x 3 x 3 二值中值滤波;
//! 3. 重新二值化 (只保留平滑后最大的连通区域) 并填充背景空洞.
//!
//! 每一轮的输出都恰好有一个连通区域且没有空洞. 轮次重复直到不动点,
//! 因此收敛的结果再次精修时保持不变.

use crate::consts::MAX_POLISH_ROUNDS;
use crate::MaskVolume;

mod components;
mod median;

pub use components::{Area3d, Areas3d, Predicate};

/// 一次精修的统计信息.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PolishReport {
    /// 实际执行的轮数.
    pub rounds: usize,

    /// 是否在轮数上限内到达不动点.
    pub converged: bool,

    /// 精修前的前景体素个数.
    pub foreground_before: usize,

    /// 精修后的前景体素个数.
    pub foreground_after: usize,
}

impl MaskVolume {
    /// 执行一轮精修. 如果本轮修改了掩膜则返回 `true`.
    fn polish_round(&mut self) -> bool {
        let mut changed = self.keep_largest_component();
        changed |= self.median_filter();
        changed |= self.keep_largest_component();
        changed |= self.fill_holes();
        changed
    }

    /// 精修掩膜 (原地修改).
    ///
    /// # 注意
    ///
    /// 1. 全背景的掩膜原样返回.
    /// 2. 对非空输入, 结果恰好有一个前景连通区域且没有背景空洞.
    /// 3. 若 `converged` 为 `true`, 结果是单轮精修的不动点, 再次精修不会有任何变化.
    ///
    /// # 返回值
    ///
    /// 精修统计信息.
    pub fn polish(&mut self) -> PolishReport {
        let foreground_before = self.count_foreground();
        let mut report = PolishReport {
            foreground_before,
            ..Default::default()
        };
        if foreground_before == 0 {
            report.converged = true;
            return report;
        }

        while report.rounds < MAX_POLISH_ROUNDS {
            report.rounds += 1;
            if !self.polish_round() {
                report.converged = true;
                break;
            }
        }
        if !report.converged {
            tracing::warn!(
                rounds = report.rounds,
                "mask polishing did not reach a fixed point"
            );
        }
        report.foreground_after = self.count_foreground();
        report
    }

    /// 返回精修后的副本, 不修改自身.
    pub fn polished(&self) -> (Self, PolishReport) {
        let mut out = self.clone();
        let report = out.polish();
        (out, report)
    }
}
