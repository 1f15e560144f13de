//! Token 预算控制
//!
//! 每种任务类型对应固定的估算成本；派发前预留成本，超出剩余预算的任务直接跳过且不计费。
//! 消耗只增不减。

use std::collections::HashMap;

use crate::cowork::types::TaskType;

/// 未知类型的基线成本（与 general 相同）
pub const BASELINE_TASK_COST: u64 = 4_000;

/// 任务类型 -> 估算 token 成本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCostTable {
    costs: HashMap<TaskType, u64>,
}

impl Default for TaskCostTable {
    fn default() -> Self {
        let costs = HashMap::from([
            (TaskType::Coding, 8_000),
            (TaskType::Research, 6_000),
            (TaskType::Review, 4_000),
            (TaskType::Test, 5_000),
            (TaskType::Document, 6_000),
            (TaskType::General, BASELINE_TASK_COST),
        ]);
        Self { costs }
    }
}

impl TaskCostTable {
    /// 在默认表上覆盖配置中的条目；键按 `TaskType::from_label` 宽松解析
    pub fn with_overrides(overrides: &HashMap<String, u64>) -> Self {
        let mut table = Self::default();
        for (label, cost) in overrides {
            table.costs.insert(TaskType::from_label(label), *cost);
        }
        table
    }

    pub fn cost(&self, task_type: TaskType) -> u64 {
        self.costs
            .get(&task_type)
            .copied()
            .unwrap_or(BASELINE_TASK_COST)
    }
}

/// 会话级预算：上限与已消耗
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    total: u64,
    consumed: u64,
}

impl TokenBudget {
    pub fn new(total: u64) -> Self {
        Self { total, consumed: 0 }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.consumed)
    }

    /// 预算足够时扣除 cost 并返回 true；否则不做任何改动
    pub fn try_reserve(&mut self, cost: u64) -> bool {
        match self.consumed.checked_add(cost) {
            Some(next) if next <= self.total => {
                self.consumed = next;
                true
            }
            _ => false,
        }
    }
}
