//! Task prioritization.

use serde::{Deserialize, Serialize};

/// Dispatch priority. Higher runs first; ties run in submission order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Priority = Priority(-10);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(10);
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}
