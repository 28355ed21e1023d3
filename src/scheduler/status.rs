use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status shared by jobs and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Waiting,
    Running,
    Success,
    Failed,
    Killed,
    Cancelled,
}

impl Status {
    /// Status every record starts in.
    pub const INITIAL: Status = Status::Waiting;

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failed | Status::Killed | Status::Cancelled
        )
    }

    /// Whether `next` is reachable from `self` under the lifecycle order.
    ///
    /// Re-reporting the same non-terminal status is allowed so parties can
    /// refresh info fields; terminal statuses accept nothing.
    pub fn can_transition_to(self, next: Status) -> bool {
        match self {
            Status::Waiting => matches!(
                next,
                Status::Waiting | Status::Running | Status::Cancelled | Status::Killed
            ),
            Status::Running => !matches!(next, Status::Waiting),
            Status::Success | Status::Failed | Status::Killed | Status::Cancelled => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Waiting => write!(f, "waiting"),
            Status::Running => write!(f, "running"),
            Status::Success => write!(f, "success"),
            Status::Failed => write!(f, "failed"),
            Status::Killed => write!(f, "killed"),
            Status::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(Status::Waiting),
            "running" => Ok(Status::Running),
            "success" => Ok(Status::Success),
            "failed" => Ok(Status::Failed),
            "killed" => Ok(Status::Killed),
            "cancelled" | "canceled" => Ok(Status::Cancelled),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}
