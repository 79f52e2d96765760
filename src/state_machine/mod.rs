mod job;
mod state;
mod status;

#[cfg(test)]
pub use job::ParamType;
pub use job::{
    ActionOutcome, FailureKind, HistoryEntry, InputType, Job, JobInput, JobOutput, RetryConfig,
    STDERR_FILE, STDOUT_FILE, new_slug,
};
pub use state::{LifecycleAction, StateMachine, Transition};
pub use status::JobStatus;
