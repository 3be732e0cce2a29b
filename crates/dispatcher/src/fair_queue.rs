//! 按优先级分级的公平队列
//!
//! 每个级别一个FIFO队列，出队时在非空级别之间做平滑加权轮询：
//! 在任意有界窗口内，各级别的出队次数之比接近其权重之比，低优先级不会被饿死。

use std::collections::VecDeque;

use scheduler_core::{Priority, PriorityWeights, TaskId};

use crate::task::ScheduledTask;

const LEVELS: usize = Priority::ALL.len();

pub struct FairQueue {
    levels: [VecDeque<ScheduledTask>; LEVELS],
    weights: [i64; LEVELS],
    current: [i64; LEVELS],
    len: usize,
}

impl FairQueue {
    pub fn new(weights: &PriorityWeights) -> Self {
        let mut level_weights = [1; LEVELS];
        for priority in Priority::ALL {
            level_weights[priority.index()] = i64::from(weights.weight(priority).max(1));
        }
        Self {
            levels: std::array::from_fn(|_| VecDeque::new()),
            weights: level_weights,
            current: [0; LEVELS],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn level_len(&self, priority: Priority) -> usize {
        self.levels[priority.index()].len()
    }

    pub fn push(&mut self, task: ScheduledTask) {
        let level = task.priority().index();
        if self.levels[level].is_empty() {
            self.reset_rotation();
        }
        self.levels[level].push_back(task);
        self.len += 1;
    }

    /// 非空级别的集合变化时从头开始轮询，各级别的累计值之和保持为零
    fn reset_rotation(&mut self) {
        self.current = [0; LEVELS];
    }

    pub fn pop(&mut self) -> Option<ScheduledTask> {
        let total: i64 = (0..LEVELS)
            .filter(|&level| !self.levels[level].is_empty())
            .map(|level| self.weights[level])
            .sum();
        if total == 0 {
            return None;
        }

        let mut selected: Option<usize> = None;
        for level in 0..LEVELS {
            if self.levels[level].is_empty() {
                continue;
            }
            self.current[level] += self.weights[level];
            // 并列时取更高的优先级（更小的下标）
            if selected.map_or(true, |best| self.current[level] > self.current[best]) {
                selected = Some(level);
            }
        }

        let level = selected?;
        self.current[level] -= total;
        let task = self.levels[level].pop_front();
        if self.levels[level].is_empty() {
            self.reset_rotation();
        }
        if task.is_some() {
            self.len -= 1;
        }
        task
    }

    /// 取消时从队列中移除
    pub fn remove(&mut self, id: TaskId) -> Option<ScheduledTask> {
        for level in self.levels.iter_mut() {
            if let Some(position) = level.iter().position(|task| task.id() == id) {
                let removed = level.remove(position);
                let emptied = level.is_empty();
                self.len -= 1;
                if emptied {
                    self.current = [0; LEVELS];
                }
                return removed;
            }
        }
        None
    }

    pub fn drain(&mut self) -> Vec<ScheduledTask> {
        self.len = 0;
        self.reset_rotation();
        self.levels.iter_mut().flat_map(|level| level.drain(..)).collect()
    }
}
