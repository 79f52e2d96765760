use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Shared job status vocabulary. Every adaptor maps its native states onto it.
///
/// Pending flow: CREATED → PREPARED → QUEUED → RUNNING → COMPLETED → TERMINATED.
/// TERMINATED, CANCELLED and ERROR are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Undefined,
    Created,
    Prepared,
    Queued,
    Running,
    Suspended,
    Completed,
    Terminated,
    Cancelled,
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [
        JobStatus::Undefined,
        JobStatus::Created,
        JobStatus::Prepared,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Suspended,
        JobStatus::Completed,
        JobStatus::Terminated,
        JobStatus::Cancelled,
        JobStatus::Error,
    ];

    /// Statuses in which a job may be cancelled unless an adaptor narrows the set.
    pub const CANCELLABLE: [JobStatus; 6] = [
        JobStatus::Undefined,
        JobStatus::Created,
        JobStatus::Prepared,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Suspended,
    ];

    /// Legacy numeric code, kept stable for exports.
    pub fn code(self) -> i32 {
        match self {
            JobStatus::Undefined => -1,
            JobStatus::Created => 0,
            JobStatus::Prepared => 1,
            JobStatus::Queued => 2,
            JobStatus::Running => 3,
            JobStatus::Suspended => 4,
            JobStatus::Completed => 5,
            JobStatus::Terminated => 6,
            JobStatus::Cancelled => 7,
            JobStatus::Error => 9,
        }
    }

    /// Human readable label used in history messages and notifications.
    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Undefined => "Unknown",
            JobStatus::Created => "Created",
            JobStatus::Prepared => "Prepared for run",
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Suspended => "Suspended",
            JobStatus::Completed => "Completed",
            JobStatus::Terminated => "Finished",
            JobStatus::Cancelled => "Cancelled",
            JobStatus::Error => "In Error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Terminated | JobStatus::Cancelled | JobStatus::Error
        )
    }

    /// Whether the runner may move a job from `self` to `to` on an adaptor response.
    ///
    /// Explicit user actions (cancel, re-run) are checked separately and are
    /// not expressed here.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;

        if self == to || self.is_terminal() {
            return false;
        }
        if to == Error {
            return true;
        }
        match (self, to) {
            (Created, Prepared) | (Created, Cancelled) => true,
            (Prepared, Queued) | (Prepared, Cancelled) => true,
            (Queued, Running | Suspended | Completed | Cancelled | Undefined) => true,
            (Running, Suspended | Completed | Cancelled | Undefined) => true,
            (Suspended, Running | Completed | Cancelled | Undefined) => true,
            (Undefined, Queued | Running | Suspended | Completed | Cancelled) => true,
            (Completed, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Undefined => "UNDEFINED",
            JobStatus::Created => "CREATED",
            JobStatus::Prepared => "PREPARED",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Suspended => "SUSPENDED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Terminated => "TERMINATED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}
