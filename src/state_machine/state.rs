use std::fmt;

use chrono::Utc;

use super::job::{ActionOutcome, FailureKind, Job, RetryConfig};
use super::status::JobStatus;
use crate::error::WavesError;

/// Adaptor lifecycle steps the runner and the user actions can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Prepare,
    Run,
    Status,
    Results,
    RunDetails,
    Cancel,
}

impl LifecycleAction {
    /// Statuses a job must be in for this step to make sense.
    pub fn allowed_from(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            LifecycleAction::Prepare => &[Created],
            LifecycleAction::Run => &[Prepared],
            LifecycleAction::Status => &[Undefined, Queued, Running, Suspended, Completed],
            LifecycleAction::Results => &[Completed],
            LifecycleAction::RunDetails => &[Completed, Terminated, Error],
            LifecycleAction::Cancel => &JobStatus::CANCELLABLE,
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleAction::Prepare => "prepare",
            LifecycleAction::Run => "run",
            LifecycleAction::Status => "status",
            LifecycleAction::Results => "results",
            LifecycleAction::RunDetails => "run_details",
            LifecycleAction::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// What applying an outcome did to the job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The job moved to a new status.
    Next(JobStatus),
    /// The step succeeded and the status did not change.
    Unchanged,
    /// The adaptor reported a status that is not reachable from the current one.
    Ignored { reported: JobStatus },
    /// The step failed transiently and will be retried after `delay_ms`.
    Retry {
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    /// The job was forced into ERROR.
    Fail { from: JobStatus, reason: String },
}

/// Applies adaptor outcomes and user actions to a `Job`.
pub struct StateMachine;

impl StateMachine {
    /// Refuses a lifecycle step the job's current status does not allow.
    pub fn check_action(job: &Job, action: LifecycleAction) -> Result<(), WavesError> {
        Self::check_allowed(job, action, action.allowed_from())
    }

    fn check_allowed(
        job: &Job,
        action: LifecycleAction,
        allowed: &[JobStatus],
    ) -> Result<(), WavesError> {
        if allowed.contains(&job.status) {
            Ok(())
        } else {
            Err(WavesError::InconsistentState {
                slug: job.slug.clone(),
                status: job.status,
                action: action.to_string(),
            })
        }
    }

    /// Applies the outcome of an adaptor step.
    ///
    /// - A success moving to a reachable status advances the job and resets
    ///   the retry counter.
    /// - A success reporting an unreachable status is ignored.
    /// - UNDEFINED is recorded but counts as a transient failure.
    /// - A transient failure consumes one retry; past `max_retry` it fails the job.
    /// - A fatal failure fails the job immediately.
    pub fn apply(job: &mut Job, outcome: ActionOutcome, retry: &RetryConfig) -> Transition {
        let transition = match outcome {
            ActionOutcome::Success(JobStatus::Undefined) => {
                if job.status.can_transition_to(JobStatus::Undefined) {
                    job.status = JobStatus::Undefined;
                }
                Self::handle_failure(
                    job,
                    FailureKind::Transient("remote job status could not be determined".into()),
                    retry,
                )
            }
            ActionOutcome::Success(reported) if reported == job.status => {
                Self::reset_retry(job);
                Transition::Unchanged
            }
            ActionOutcome::Success(reported) if job.status.can_transition_to(reported) => {
                Self::reset_retry(job);
                job.status = reported;
                Transition::Next(reported)
            }
            ActionOutcome::Success(reported) => {
                Self::reset_retry(job);
                Transition::Ignored { reported }
            }
            ActionOutcome::Failure(kind) => Self::handle_failure(job, kind, retry),
        };

        job.touch();
        transition
    }

    /// Explicit cancel, restricted to `allowed` (the adaptor's cancel statuses).
    pub fn cancel(job: &mut Job, allowed: &[JobStatus]) -> Result<(), WavesError> {
        Self::check_allowed(job, LifecycleAction::Cancel, allowed)?;
        job.status = JobStatus::Cancelled;
        job.message = Some("Job cancelled".to_string());
        job.next_attempt_at = None;
        job.touch();
        Ok(())
    }

    /// Puts a job back to CREATED so the runner executes it again from scratch.
    pub fn rerun(job: &mut Job) -> Result<(), WavesError> {
        if !job.allow_rerun() {
            return Err(WavesError::InconsistentState {
                slug: job.slug.clone(),
                status: job.status,
                action: "rerun".to_string(),
            });
        }
        job.status = JobStatus::Created;
        job.nb_retry = 0;
        job.next_attempt_at = None;
        job.remote_job_id = None;
        job.remote_history_id = None;
        job.exit_code = 0;
        job.results_available = false;
        job.status_notified = None;
        job.message = Some("Job marked for re-run".to_string());
        job.touch();
        Ok(())
    }

    fn reset_retry(job: &mut Job) {
        job.nb_retry = 0;
        job.next_attempt_at = None;
    }

    fn handle_failure(job: &mut Job, kind: FailureKind, retry: &RetryConfig) -> Transition {
        let from = job.status;
        match kind {
            FailureKind::Transient(reason) => {
                job.nb_retry += 1;
                if job.nb_retry <= retry.max_retry {
                    let delay_ms = retry.delay_for_attempt(job.nb_retry);
                    job.next_attempt_at =
                        Some(Utc::now() + chrono::Duration::milliseconds(delay_ms as i64));
                    job.message = Some(reason.clone());
                    Transition::Retry {
                        attempt: job.nb_retry,
                        delay_ms,
                        reason,
                    }
                } else {
                    let reason = format!("Job error (too many errors)\n{reason}");
                    Self::fail(job, from, reason)
                }
            }
            FailureKind::Fatal(reason) => Self::fail(job, from, reason),
        }
    }

    fn fail(job: &mut Job, from: JobStatus, reason: String) -> Transition {
        job.status = JobStatus::Error;
        job.next_attempt_at = None;
        job.message = Some(reason.clone());
        Transition::Fail { from, reason }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::state_machine::job::new_slug;

    fn make_job(status: JobStatus) -> Job {
        let mut job = Job::new(new_slug(), "mock".into(), PathBuf::from("/tmp/w"));
        job.status = status;
        job
    }

    fn retry(max_retry: u32) -> RetryConfig {
        RetryConfig {
            max_retry,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    fn transient(msg: &str) -> ActionOutcome {
        ActionOutcome::Failure(FailureKind::Transient(msg.into()))
    }

    #[test]
    fn happy_path_walks_all_states() {
        let mut job = make_job(JobStatus::Created);
        let cfg = retry(3);
        for next in [
            JobStatus::Prepared,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Terminated,
        ] {
            let t = StateMachine::apply(&mut job, ActionOutcome::Success(next), &cfg);
            assert_eq!(t, Transition::Next(next));
        }
        assert_eq!(job.status, JobStatus::Terminated);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn same_status_is_unchanged_and_resets_retry() {
        let mut job = make_job(JobStatus::Running);
        job.nb_retry = 2;
        let t = StateMachine::apply(&mut job, ActionOutcome::Success(JobStatus::Running), &retry(5));
        assert_eq!(t, Transition::Unchanged);
        assert_eq!(job.nb_retry, 0);
    }

    #[test]
    fn unreachable_status_is_ignored() {
        let mut job = make_job(JobStatus::Running);
        let t = StateMachine::apply(&mut job, ActionOutcome::Success(JobStatus::Created), &retry(5));
        assert_eq!(
            t,
            Transition::Ignored {
                reported: JobStatus::Created
            }
        );
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn transient_failure_retries_then_fails() {
        let mut job = make_job(JobStatus::Queued);
        let cfg = retry(2);

        let t = StateMachine::apply(&mut job, transient("connection refused"), &cfg);
        assert!(matches!(t, Transition::Retry { attempt: 1, .. }));
        assert_eq!(job.status, JobStatus::Queued);

        let t = StateMachine::apply(&mut job, transient("connection refused"), &cfg);
        assert!(matches!(t, Transition::Retry { attempt: 2, .. }));

        let t = StateMachine::apply(&mut job, transient("still refused"), &cfg);
        match t {
            Transition::Fail { from, reason } => {
                assert_eq!(from, JobStatus::Queued);
                assert!(reason.starts_with("Job error (too many errors)"));
                assert!(reason.contains("still refused"));
            }
            other => panic!("expected Fail, got {other:?}"),
        }
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.message.as_deref().unwrap().contains("still refused"));
    }

    #[test]
    fn zero_retries_fails_immediately() {
        let mut job = make_job(JobStatus::Created);
        let t = StateMachine::apply(&mut job, transient("down"), &retry(0));
        assert!(matches!(t, Transition::Fail { .. }));
        assert_eq!(job.status, JobStatus::Error);
    }

    #[test]
    fn fatal_failure_skips_retry() {
        let mut job = make_job(JobStatus::Prepared);
        let t = StateMachine::apply(
            &mut job,
            ActionOutcome::Failure(FailureKind::Fatal("missing command".into())),
            &retry(5),
        );
        assert_eq!(
            t,
            Transition::Fail {
                from: JobStatus::Prepared,
                reason: "missing command".into()
            }
        );
        assert_eq!(job.nb_retry, 0);
    }

    #[test]
    fn retry_then_succeed_resets_counter() {
        let mut job = make_job(JobStatus::Created);
        let cfg = RetryConfig {
            max_retry: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        };
        let t = StateMachine::apply(&mut job, transient("network error"), &cfg);
        assert_eq!(
            t,
            Transition::Retry {
                attempt: 1,
                delay_ms: 1000,
                reason: "network error".into()
            }
        );
        assert!(job.next_attempt_at.is_some());
        assert!(!job.is_due(Utc::now()));

        let t = StateMachine::apply(&mut job, ActionOutcome::Success(JobStatus::Prepared), &cfg);
        assert_eq!(t, Transition::Next(JobStatus::Prepared));
        assert_eq!(job.nb_retry, 0);
        assert!(job.next_attempt_at.is_none());
    }

    #[test]
    fn undefined_consumes_retries() {
        let mut job = make_job(JobStatus::Running);
        let cfg = retry(1);
        let t = StateMachine::apply(&mut job, ActionOutcome::Success(JobStatus::Undefined), &cfg);
        assert!(matches!(t, Transition::Retry { attempt: 1, .. }));
        assert_eq!(job.status, JobStatus::Undefined);

        let t = StateMachine::apply(&mut job, ActionOutcome::Success(JobStatus::Undefined), &cfg);
        assert!(matches!(
            t,
            Transition::Fail {
                from: JobStatus::Undefined,
                ..
            }
        ));
        assert_eq!(job.status, JobStatus::Error);
    }

    #[test]
    fn check_action_guards_lifecycle() {
        let job = make_job(JobStatus::Created);
        assert!(StateMachine::check_action(&job, LifecycleAction::Prepare).is_ok());
        let err = StateMachine::check_action(&job, LifecycleAction::Run).unwrap_err();
        assert!(matches!(err, WavesError::InconsistentState { .. }));

        let job = make_job(JobStatus::Completed);
        assert!(StateMachine::check_action(&job, LifecycleAction::Results).is_ok());
        assert!(StateMachine::check_action(&job, LifecycleAction::Status).is_ok());
    }

    #[test]
    fn cancel_respects_allowed_statuses() {
        let mut job = make_job(JobStatus::Running);
        StateMachine::cancel(&mut job, &JobStatus::CANCELLABLE).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        let mut done = make_job(JobStatus::Terminated);
        assert!(StateMachine::cancel(&mut done, &JobStatus::CANCELLABLE).is_err());
        assert_eq!(done.status, JobStatus::Terminated);

        let mut queued = make_job(JobStatus::Queued);
        assert!(StateMachine::cancel(&mut queued, &[JobStatus::Created]).is_err());
    }

    #[test]
    fn rerun_resets_job() {
        let mut job = make_job(JobStatus::Error);
        job.nb_retry = 4;
        job.remote_job_id = Some("1234".into());
        job.exit_code = 2;
        StateMachine::rerun(&mut job).unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.nb_retry, 0);
        assert!(job.remote_job_id.is_none());
        assert_eq!(job.exit_code, 0);

        assert!(StateMachine::rerun(&mut job).is_err());
    }

    #[test]
    fn action_display() {
        assert_eq!(LifecycleAction::Prepare.to_string(), "prepare");
        assert_eq!(LifecycleAction::RunDetails.to_string(), "run_details");
    }
}
