//! Task priority

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task priority - 3 is highest (critical), 0 is lowest
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskPriority {
    /// Background work
    Low = 0,
    /// Default
    #[default]
    Normal = 1,
    /// Ahead of normal work
    High = 2,
    /// Drop everything
    Critical = 3,
}

impl TaskPriority {
    /// Number of priority levels
    pub const COUNT: usize = 4;

    /// Get numeric value (0-3)
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Create from numeric value
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TaskPriority::Low),
            1 => Some(TaskPriority::Normal),
            2 => Some(TaskPriority::High),
            3 => Some(TaskPriority::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    /// All priorities in scheduling order (highest first)
    pub fn descending() -> &'static [TaskPriority] {
        &[
            TaskPriority::Critical,
            TaskPriority::High,
            TaskPriority::Normal,
            TaskPriority::Low,
        ]
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "0" | "low" => Ok(TaskPriority::Low),
            "1" | "normal" => Ok(TaskPriority::Normal),
            "2" | "high" => Ok(TaskPriority::High),
            "3" | "critical" => Ok(TaskPriority::Critical),
            _ => Err(ParsePriorityError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid priority
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid priority '{0}', expected 0-3 or low/normal/high/critical")]
pub struct ParsePriorityError(pub String);
