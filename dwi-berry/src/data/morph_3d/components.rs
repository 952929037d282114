//! 6-相邻连通区域, 最大连通区域保留, 背景空洞填充.

use crate::consts::gray::*;
use crate::{Idx3d, MaskVolume};
use ndarray::{Array3, Axis};
use std::collections::VecDeque;

/// 一个三维连通区域. 第一个元素是该区域按 `(i, j, k)` 行优先顺序最靠前的体素.
pub type Area3d = Vec<Idx3d>;

/// 若干三维连通区域.
pub type Areas3d = Vec<Area3d>;

/// 体素谓词.
pub type Predicate = fn(u8) -> bool;

impl MaskVolume {
    /// 获取 `pos` 前后上下左右六个点的坐标.
    ///
    /// 在数据范围外的坐标会被过滤掉, 不会包含在返回值中.
    pub(crate) fn diamond_neighbours(&self, (i, j, k): Idx3d) -> Vec<Idx3d> {
        self.check_collect([
            (i.wrapping_sub(1), j, k),
            (i.saturating_add(1), j, k),
            (i, j.wrapping_sub(1), k),
            (i, j.saturating_add(1), k),
            (i, j, k.wrapping_sub(1)),
            (i, j, k.saturating_add(1)),
        ])
    }

    /// 收集 `data` 中不越界的索引.
    #[inline]
    fn check_collect<B: FromIterator<Idx3d>, const N: usize>(&self, data: [Idx3d; N]) -> B {
        data.into_iter().filter(|p| self.check(p)).collect()
    }

    /// 按照 6-相邻规则获取所有满足谓词 `pred` 的连通区域.
    ///
    /// # 返回值
    ///
    /// 区域按其首个体素的行优先顺序排列, 因此对同一输入的结果是稳定的.
    pub fn areas(&self, pred: Predicate) -> Areas3d {
        let mut ans = Areas3d::new();
        let mut visited = Array3::<bool>::from_elem(self.shape(), false);
        let mut bfs_q = VecDeque::with_capacity(64);

        for (pos, p) in self.data.indexed_iter() {
            if visited[pos] || !pred(*p) {
                continue;
            }
            visited[pos] = true;
            bfs_q.push_back(pos);
            let mut this_area = Area3d::with_capacity(16);
            while let Some(cur_pos) = bfs_q.pop_front() {
                this_area.push(cur_pos);
                for neigh in self.diamond_neighbours(cur_pos) {
                    if !visited[neigh] && pred(self[neigh]) {
                        visited[neigh] = true;
                        bfs_q.push_back(neigh);
                    }
                }
            }
            ans.push(this_area);
        }
        ans
    }

    /// 按照 6-相邻规则获得所有前景区域.
    #[inline]
    pub fn foreground_areas(&self) -> Areas3d {
        self.areas(is_foreground)
    }

    /// 只保留体素数最多的前景连通区域, 其余前景置为背景.
    /// 体素数相同时, 保留首个体素行优先顺序最靠前的区域.
    ///
    /// 如果以此法修改了掩膜则返回 `true`, 否则返回 `false`.
    pub fn keep_largest_component(&mut self) -> bool {
        let areas = self.foreground_areas();
        if areas.len() <= 1 {
            return false;
        }
        let largest = areas
            .iter()
            .enumerate()
            .fold(0usize, |best, (idx, area)| {
                if area.len() > areas[best].len() {
                    idx
                } else {
                    best
                }
            });
        for (_, area) in areas.iter().enumerate().filter(|(idx, _)| *idx != largest) {
            for pos in area {
                self[*pos] = MASK_BACKGROUND;
            }
        }
        true
    }

    /// 将背景空洞 (即无法经由 6-相邻背景路径到达体数据边界的背景体素)
    /// 填充为前景. 如果以此法修改了掩膜则返回 `true`, 否则返回 `false`.
    pub fn fill_holes(&mut self) -> bool {
        let shape = self.shape();
        let mut outside = Array3::<bool>::from_elem(shape, false);
        let mut bfs_q = VecDeque::with_capacity(256);

        // 从六个表面上的背景体素出发
        for axis in 0..3 {
            let len = self.data.len_of(Axis(axis));
            if len == 0 {
                return false;
            }
            for index in [0, len - 1] {
                for (sub, p) in self.data.index_axis(Axis(axis), index).indexed_iter() {
                    if !is_background(*p) {
                        continue;
                    }
                    let pos = match axis {
                        0 => (index, sub.0, sub.1),
                        1 => (sub.0, index, sub.1),
                        _ => (sub.0, sub.1, index),
                    };
                    if !outside[pos] {
                        outside[pos] = true;
                        bfs_q.push_back(pos);
                    }
                }
            }
        }

        while let Some(cur_pos) = bfs_q.pop_front() {
            for neigh in self.diamond_neighbours(cur_pos) {
                if !outside[neigh] && is_background(self[neigh]) {
                    outside[neigh] = true;
                    bfs_q.push_back(neigh);
                }
            }
        }

        let mut non_trivial = false;
        ndarray::Zip::from(&mut self.data)
            .and(&outside)
            .for_each(|p, reached| {
                if is_background(*p) && !*reached {
                    *p = MASK_FOREGROUND;
                    non_trivial = true;
                }
            });
        non_trivial
    }
}
