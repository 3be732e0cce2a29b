use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SchedulerError};

/// 任务优先级
///
/// 变体按从低到高声明，派生的 `Ord` 即为优先级顺序：
/// `RealTime > Highest > High > Normal > Low > Lowest > Optional`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Optional,
    Lowest,
    Low,
    Normal,
    High,
    Highest,
    RealTime,
}

impl Priority {
    /// 从高到低排列的全部优先级
    pub const ALL: [Priority; 7] = [
        Priority::RealTime,
        Priority::Highest,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Lowest,
        Priority::Optional,
    ];

    /// 数值等级，越大越优先
    pub fn value(self) -> i32 {
        match self {
            Priority::RealTime => 7,
            Priority::Highest => 6,
            Priority::High => 5,
            Priority::Normal => 4,
            Priority::Low => 3,
            Priority::Lowest => 2,
            Priority::Optional => 1,
        }
    }

    /// 在 `ALL` 中的下标，0 为最高优先级
    pub fn index(self) -> usize {
        (Priority::RealTime.value() - self.value()) as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::RealTime => "real_time",
            Priority::Highest => "highest",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Lowest => "lowest",
            Priority::Optional => "optional",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| SchedulerError::Configuration(format!("未知的优先级: {s}")))
    }
}

/// 可进行加权比较的优先级
///
/// 加权比较返回差值的大小而不仅是符号，`|a.weighted_compare(b)| == |b.weighted_compare(a)|`。
/// 不同族的优先级之间比较属于编程错误，第一次比较即返回错误。
pub trait PriorityOrdering: fmt::Debug + Send + Sync {
    /// 优先级族名称，只有同族的优先级才能比较
    fn family(&self) -> &'static str;

    /// 族内的数值等级
    fn level(&self) -> i32;

    fn weighted_compare(&self, other: &dyn PriorityOrdering) -> Result<i32> {
        if self.family() != other.family() {
            return Err(SchedulerError::IncompatiblePriority {
                left: format!("{}:{:?}", self.family(), self),
                right: format!("{}:{:?}", other.family(), other),
            });
        }
        Ok(self.level() - other.level())
    }
}

impl PriorityOrdering for Priority {
    fn family(&self) -> &'static str {
        "standard"
    }

    fn level(&self) -> i32 {
        self.value()
    }
}
