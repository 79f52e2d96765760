//! Queue runner and user actions.
//!
//! [`Runner::process_job`] performs one dispatch for one job: it picks the
//! lifecycle step matching the job's status, runs it on the job's adaptor,
//! applies the outcome through [`StateMachine`] and records the result
//! (history, notification, saved record).

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::fs;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::adaptors::shell::is_reserved_name;
use crate::adaptors::{Adaptor, AdaptorProvider, RunDetails, StepOutput, execute};
use crate::config::{PurgeConfig, QueueConfig};
use crate::error::{AdaptorError, WavesError};
use crate::notify::Notifications;
use crate::state_machine::{
    ActionOutcome, FailureKind, HistoryEntry, InputType, Job, JobInput, JobOutput, JobStatus,
    LifecycleAction, RetryConfig, StateMachine, Transition, new_slug,
};
use crate::store::{JobStore, RUN_DETAILS_FILE, check_file_name};

/// Lines of stderr kept as the message of a failed job.
const STDERR_TAIL_LINES: usize = 10;

/// A job as submitted by a user, in JSON or TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub title: Option<String>,
    pub adaptor: String,
    #[serde(default)]
    pub email_to: Option<String>,
    /// File input values are paths, relative to the definition file; they
    /// are copied into the working dir at submission.
    #[serde(default)]
    pub inputs: Vec<JobInput>,
    #[serde(default)]
    pub outputs: Vec<JobOutput>,
}

impl JobDefinition {
    /// Reads a definition; `.json` files are JSON, anything else TOML.
    pub fn from_file(path: &Path) -> Result<Self, WavesError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WavesError::InvalidInput(format!("cannot read {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(toml::from_str(&contents)?)
        }
    }
}

pub struct Runner {
    store: JobStore,
    adaptors: Box<dyn AdaptorProvider>,
    notifications: Notifications,
    retry: RetryConfig,
    sleep: Duration,
    purge: PurgeConfig,
}

impl Runner {
    pub fn new(
        store: JobStore,
        adaptors: Box<dyn AdaptorProvider>,
        notifications: Notifications,
        queue: &QueueConfig,
    ) -> Self {
        Self {
            store,
            adaptors,
            notifications,
            retry: queue.retry_config(),
            sleep: queue.sleep(),
            purge: PurgeConfig::default(),
        }
    }

    pub fn with_purge(mut self, purge: PurgeConfig) -> Self {
        self.purge = purge;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Runs one dispatch for `job` and persists the outcome.
    pub async fn process_job(&self, job: &mut Job) -> Result<Transition, WavesError> {
        if job.status.is_terminal() {
            return Err(WavesError::InconsistentState {
                slug: job.slug.clone(),
                status: job.status,
                action: "process".to_string(),
            });
        }
        let mut adaptor = match self.adaptors.adaptor_for(job) {
            Ok(adaptor) => adaptor,
            Err(e) => {
                warn!(slug = %job.slug, adaptor = %job.adaptor, error = %e, "adaptor unavailable");
                return self
                    .advance(job, ActionOutcome::Failure(e.failure_kind()))
                    .await;
            }
        };

        match job.status {
            JobStatus::Created => {
                self.step(adaptor.as_mut(), job, LifecycleAction::Prepare, JobStatus::Prepared)
                    .await
            }
            JobStatus::Prepared => {
                self.step(adaptor.as_mut(), job, LifecycleAction::Run, JobStatus::Queued)
                    .await
            }
            JobStatus::Completed => self.fetch_results(adaptor.as_mut(), job).await,
            _ => self.poll(adaptor.as_mut(), job).await,
        }
    }

    async fn step(
        &self,
        adaptor: &mut dyn Adaptor,
        job: &mut Job,
        action: LifecycleAction,
        target: JobStatus,
    ) -> Result<Transition, WavesError> {
        StateMachine::check_action(job, action)?;
        let outcome = match execute(adaptor, job, action).await {
            Ok(_) => ActionOutcome::Success(target),
            Err(e) => step_failed(job, action, &e),
        };
        self.advance(job, outcome).await
    }

    /// Polls the back-end; a COMPLETED answer fetches results in the same pass.
    async fn poll(&self, adaptor: &mut dyn Adaptor, job: &mut Job) -> Result<Transition, WavesError> {
        StateMachine::check_action(job, LifecycleAction::Status)?;
        let outcome = match execute(adaptor, job, LifecycleAction::Status).await {
            Ok(StepOutput::Status(status)) => {
                debug!(slug = %job.slug, current = %job.status, reported = %status, "polled");
                ActionOutcome::Success(status)
            }
            Ok(other) => ActionOutcome::Failure(FailureKind::Fatal(format!(
                "status poll returned {other:?}"
            ))),
            Err(e) => step_failed(job, LifecycleAction::Status, &e),
        };

        let transition = self.advance(job, outcome).await?;
        match transition {
            Transition::Next(JobStatus::Completed) => self.fetch_results(adaptor, job).await,
            Transition::Fail {
                from: JobStatus::Undefined,
                ..
            } => {
                self.cancel_remote(adaptor, job).await;
                Ok(transition)
            }
            other => Ok(other),
        }
    }

    async fn fetch_results(
        &self,
        adaptor: &mut dyn Adaptor,
        job: &mut Job,
    ) -> Result<Transition, WavesError> {
        StateMachine::check_action(job, LifecycleAction::Results)?;
        let outcome = match execute(adaptor, job, LifecycleAction::Results).await {
            Ok(StepOutput::Results(true)) => {
                job.results_available = true;
                self.collect_run_details(adaptor, job).await;
                // anything on stderr fails the job, whatever the exit code
                match stderr_tail(job).await {
                    Some(tail) => ActionOutcome::Failure(FailureKind::Fatal(tail)),
                    None if job.exit_code != 0 => ActionOutcome::Failure(FailureKind::Fatal(
                        format!("Job exited with code {}", job.exit_code),
                    )),
                    None => ActionOutcome::Success(JobStatus::Terminated),
                }
            }
            // results not there yet; stays COMPLETED
            Ok(_) => ActionOutcome::Success(JobStatus::Completed),
            Err(e) => step_failed(job, LifecycleAction::Results, &e),
        };
        self.advance(job, outcome).await
    }

    /// Asks the adaptor for run details unless they are already cached.
    async fn collect_run_details(&self, adaptor: &mut dyn Adaptor, job: &mut Job) {
        match self.store.run_details(job).await {
            Ok(Some(_)) => {
                debug!(slug = %job.slug, "run details already cached");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(slug = %job.slug, error = %e, "unreadable run details cache"),
        }
        let details = match execute(adaptor, job, LifecycleAction::RunDetails).await {
            Ok(StepOutput::Details(details)) => details,
            Ok(_) => RunDetails::defaults(job),
            Err(e) => {
                warn!(slug = %job.slug, error = %e, "run details unavailable, using defaults");
                RunDetails::defaults(job)
            }
        };
        if let Err(e) = self.store.save_run_details(job, &details).await {
            warn!(slug = %job.slug, error = %e, "cannot cache run details");
        }
    }

    /// Best-effort back-end cancel for jobs given up on.
    async fn cancel_remote(&self, adaptor: &mut dyn Adaptor, job: &mut Job) {
        if job.remote_job_id.is_none() {
            return;
        }
        match execute(adaptor, job, LifecycleAction::Cancel).await {
            Ok(_) => info!(slug = %job.slug, "remote job cancelled"),
            Err(e) => warn!(slug = %job.slug, error = %e, "remote cancel failed"),
        }
    }

    /// Applies `outcome`, then writes history, notifies and saves.
    async fn advance(&self, job: &mut Job, outcome: ActionOutcome) -> Result<Transition, WavesError> {
        let before = job.message.clone();
        let transition = StateMachine::apply(job, outcome, &self.retry);

        match &transition {
            Transition::Next(to) => {
                if job.message == before {
                    job.message = Some(format!("Job {}", to.label().to_lowercase()));
                }
                info!(slug = %job.slug, adaptor = %job.adaptor, status = %to, "status changed");
                let message = job.message.clone().unwrap_or_default();
                self.store
                    .append_history(&job.slug, &HistoryEntry::new(*to, message))
                    .await?;
            }
            Transition::Unchanged => {
                debug!(slug = %job.slug, status = %job.status, "status unchanged");
            }
            Transition::Ignored { reported } => {
                warn!(
                    slug = %job.slug,
                    status = %job.status,
                    reported = %reported,
                    "ignoring unreachable status"
                );
            }
            Transition::Retry {
                attempt,
                delay_ms,
                reason,
            } => {
                warn!(
                    slug = %job.slug,
                    attempt,
                    max = self.retry.max_retry,
                    delay_ms,
                    "{reason}"
                );
                let message = format!("Retry {attempt}/{}: {reason}", self.retry.max_retry);
                self.store
                    .append_history(&job.slug, &HistoryEntry::admin(job.status, message))
                    .await?;
            }
            Transition::Fail { from, reason } => {
                error!(slug = %job.slug, adaptor = %job.adaptor, from = %from, "job failed: {reason}");
                self.store
                    .append_history(&job.slug, &HistoryEntry::admin(JobStatus::Error, reason.clone()))
                    .await?;
            }
        }

        self.notifications.job_changed(job).await;
        self.store.save(job).await?;
        Ok(transition)
    }

    /// One queue pass over the due, non-terminal jobs, oldest first.
    ///
    /// Returns how many jobs were dispatched.
    pub async fn run_once(&self) -> Result<usize, WavesError> {
        let now = Utc::now();
        let mut processed = 0;
        for mut job in self.store.pending().await? {
            if !job.is_due(now) {
                debug!(slug = %job.slug, "backing off");
                continue;
            }
            match self.process_job(&mut job).await {
                Ok(_) => processed += 1,
                Err(e) => error!(slug = %job.slug, error = %e, "job processing failed"),
            }
        }
        Ok(processed)
    }

    /// Runs passes until `shutdown` resolves; the signal is checked between passes.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(sleep_secs = self.sleep.as_secs(), "queue runner started");
        let mut last_purge: Option<Instant> = None;
        loop {
            match self.run_once().await {
                Ok(n) => debug!(processed = n, "queue pass done"),
                Err(e) => error!(error = %e, "queue pass failed"),
            }
            if last_purge.is_none_or(|at| at.elapsed() >= self.purge.interval()) {
                if let Err(e) = self.purge(Utc::now()).await {
                    error!(error = %e, "purge failed");
                }
                last_purge = Some(Instant::now());
            }
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = sleep(self.sleep) => {}
            }
        }
        info!("queue runner stopped");
    }

    /// Runs until Ctrl-C.
    pub async fn run_forever(&self) {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    }

    /// Deletes finished jobs not updated within their retention period.
    ///
    /// Returns the removed slugs.
    pub async fn purge(&self, now: DateTime<Utc>) -> Result<Vec<String>, WavesError> {
        let mut removed = Vec::new();
        for job in self.store.list().await? {
            if !job.status.is_terminal() {
                continue;
            }
            let Some(keep) = self.purge.retention(&job) else {
                continue;
            };
            if job.updated + keep > now {
                continue;
            }
            match self.store.remove(&job.slug).await {
                Ok(()) => {
                    info!(slug = %job.slug, created = %job.created, "job purged");
                    removed.push(job.slug);
                }
                Err(e) => warn!(slug = %job.slug, error = %e, "cannot purge job"),
            }
        }
        Ok(removed)
    }

    /// Job count per status.
    pub async fn summary(&self) -> Result<BTreeMap<JobStatus, usize>, WavesError> {
        let mut counts = BTreeMap::new();
        for job in self.store.list().await? {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Creates a job in CREATED from `definition`.
    ///
    /// `base_dir` resolves relative input file paths.
    pub async fn submit(&self, definition: JobDefinition, base_dir: &Path) -> Result<Job, WavesError> {
        let slug = new_slug();
        let working_dir = self.store.job_dir(&slug);
        let mut job = Job::new(slug, definition.adaptor, working_dir);
        job.title = definition.title;
        job.email_to = definition.email_to;
        job.inputs = definition.inputs;
        job.outputs = definition.outputs;
        job.add_default_outputs();

        // fails on unknown adaptors and bad adaptor params
        self.adaptors.adaptor_for(&job)?;
        job.command_args()?;
        for output in &job.outputs {
            job_file_name(&output.value)
                .map_err(|e| WavesError::InvalidInput(format!("output '{}': {e}", output.name)))?;
        }

        let mut sources = Vec::new();
        for (index, input) in job.inputs.iter().enumerate() {
            if input.input_type != InputType::File {
                continue;
            }
            let Some(value) = input.raw_value() else {
                continue;
            };
            let source = base_dir.join(value);
            if !source.is_file() {
                return Err(WavesError::InvalidInput(format!(
                    "input '{}': no such file {}",
                    input.name,
                    source.display()
                )));
            }
            let Some(file_name) = source.file_name().map(PathBuf::from) else {
                return Err(WavesError::InvalidInput(format!(
                    "input '{}': '{value}' is not a file name",
                    input.name
                )));
            };
            job_file_name(&file_name.to_string_lossy())
                .map_err(|e| WavesError::InvalidInput(format!("input '{}': {e}", input.name)))?;
            sources.push((index, source, file_name));
        }

        fs::create_dir_all(&job.working_dir).await?;
        for (index, source, file_name) in sources {
            fs::copy(&source, job.working_dir.join(&file_name)).await?;
            job.inputs[index].value = Some(file_name.to_string_lossy().into_owned());
        }
        for output in &job.outputs {
            let path = output.file_path(&job.working_dir);
            if !path.exists() {
                fs::File::create(&path).await?;
            }
        }

        job.message = Some("Job submitted".to_string());
        self.store.create(&job).await?;
        self.store
            .append_history(&job.slug, &HistoryEntry::new(JobStatus::Created, "Job submitted"))
            .await?;
        self.notifications.job_changed(&mut job).await;
        self.store.save(&job).await?;

        info!(slug = %job.slug, adaptor = %job.adaptor, "job submitted");
        Ok(job)
    }

    /// Cancels a job, calling the back-end when the job was launched.
    pub async fn cancel(&self, slug: &str) -> Result<Job, WavesError> {
        let mut job = self.store.resolve(slug).await?;
        let mut adaptor = self.adaptors.adaptor_for(&job)?;
        StateMachine::cancel(&mut job, adaptor.cancel_statuses())?;

        if job.remote_job_id.is_some() {
            if let Err(e) = execute(adaptor.as_mut(), &mut job, LifecycleAction::Cancel).await {
                warn!(slug = %job.slug, error = %e, "remote cancel failed");
                self.store
                    .append_history(
                        &job.slug,
                        &HistoryEntry::admin(JobStatus::Cancelled, format!("Remote cancel failed: {e}")),
                    )
                    .await?;
            }
        }

        self.store
            .append_history(&job.slug, &HistoryEntry::new(JobStatus::Cancelled, "Job cancelled"))
            .await?;
        self.notifications.job_changed(&mut job).await;
        self.store.save(&job).await?;
        info!(slug = %job.slug, "job cancelled");
        Ok(job)
    }

    /// Puts a finished job back to CREATED with empty outputs.
    pub async fn rerun(&self, slug: &str) -> Result<Job, WavesError> {
        let mut job = self.store.resolve(slug).await?;
        StateMachine::rerun(&mut job)?;

        for output in &job.outputs {
            let path = output.file_path(&job.working_dir);
            if path.exists() {
                fs::File::create(&path).await?;
            }
        }
        match fs::remove_file(job.working_dir.join(RUN_DETAILS_FILE)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        self.store
            .append_history(
                &job.slug,
                &HistoryEntry::new(JobStatus::Created, "Job marked for re-run"),
            )
            .await?;
        self.notifications.job_changed(&mut job).await;
        self.store.save(&job).await?;
        info!(slug = %job.slug, "job marked for re-run");
        Ok(job)
    }

    /// Drives one job until it is terminal, calling `on_step` after every dispatch.
    pub async fn follow<F>(&self, slug: &str, mut on_step: F) -> Result<Job, WavesError>
    where
        F: FnMut(&Job, &Transition),
    {
        let mut job = self.store.resolve(slug).await?;
        while !job.status.is_terminal() {
            let now = Utc::now();
            if let Some(at) = job.next_attempt_at.filter(|at| *at > now) {
                sleep((at - now).to_std().unwrap_or_default()).await;
            }

            let transition = self.process_job(&mut job).await?;
            on_step(&job, &transition);

            let waiting = matches!(transition, Transition::Unchanged | Transition::Ignored { .. });
            if waiting && !job.status.is_terminal() {
                sleep(self.sleep).await;
            }
        }
        Ok(job)
    }
}

fn step_failed(job: &Job, action: LifecycleAction, e: &AdaptorError) -> ActionOutcome {
    warn!(slug = %job.slug, adaptor = %job.adaptor, action = %action, error = %e, "adaptor step failed");
    ActionOutcome::Failure(e.failure_kind())
}

/// Accepts a name for a file in the job working dir.
fn job_file_name(name: &str) -> Result<(), String> {
    match check_file_name(name) {
        Err(WavesError::InvalidInput(reason)) => Err(reason),
        Err(e) => Err(e.to_string()),
        Ok(()) if is_reserved_name(name) => Err(format!("'{name}' is reserved for the job script")),
        Ok(()) => Ok(()),
    }
}

/// Last non-blank lines of the job's stderr.
async fn stderr_tail(job: &Job) -> Option<String> {
    let bytes = fs::read(job.stderr_path()).await.ok()?;
    let contents = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    Some(lines[start..].join("\n"))
}
