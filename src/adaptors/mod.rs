//! Execution back-ends behind a single lifecycle contract.
//!
//! Every back-end implements [`Adaptor`]: connect, disconnect, prepare, run,
//! cancel, status, results and run details. Back-ends speak their own status
//! vocabulary ([`RemoteState`]) which is mapped onto [`JobStatus`].

pub mod galaxy;
mod mock;
mod params;
pub mod shell;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AdaptorError, WavesError};
use crate::state_machine::{Job, JobStatus, LifecycleAction};

pub use mock::MockAdaptor;
pub use params::{InitParams, redact};

/// A back-end's native job state.
pub trait RemoteState: fmt::Debug {
    fn job_status(&self) -> JobStatus;
}

/// Execution facts collected once a job has finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetails {
    pub slug: String,
    pub remote_job_id: Option<String>,
    pub name: String,
    pub exit_code: i32,
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl RunDetails {
    /// Details derived from the job record alone, used when the back-end has none.
    pub fn defaults(job: &Job) -> Self {
        Self {
            slug: job.slug.clone(),
            remote_job_id: job.remote_job_id.clone(),
            name: job.display_name().to_string(),
            exit_code: job.exit_code,
            created: Some(job.created),
            started: None,
            finished: Some(job.updated),
            hosts: Vec::new(),
        }
    }
}

/// Lifecycle contract every execution back-end implements.
///
/// Steps other than connect/disconnect expect a connected adaptor; use
/// [`execute`] to get the connect → step → disconnect sequence.
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Display name of the back-end kind.
    fn name(&self) -> &'static str;

    fn connected(&self) -> bool;

    async fn connect(&mut self) -> Result<(), AdaptorError>;

    async fn disconnect(&mut self) -> Result<(), AdaptorError>;

    /// Stages whatever the back-end needs before launch (scripts, uploads, histories).
    async fn prepare(&self, job: &mut Job) -> Result<(), AdaptorError>;

    /// Launches a prepared job and records its remote identifier.
    async fn run(&self, job: &mut Job) -> Result<(), AdaptorError>;

    async fn cancel(&self, job: &mut Job) -> Result<(), AdaptorError>;

    /// Polls the back-end and maps its answer onto [`JobStatus`].
    async fn status(&self, job: &mut Job) -> Result<JobStatus, AdaptorError>;

    /// Retrieves outputs; returns whether results are available.
    async fn results(&self, job: &mut Job) -> Result<bool, AdaptorError>;

    async fn run_details(&self, job: &Job) -> Result<RunDetails, AdaptorError>;

    /// Statuses from which this back-end can cancel a job.
    fn cancel_statuses(&self) -> &'static [JobStatus] {
        &JobStatus::CANCELLABLE
    }

    /// Configuration summary with credentials redacted.
    fn dump_config(&self) -> String;
}

/// What a lifecycle step returned.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Done,
    Status(JobStatus),
    Results(bool),
    Details(RunDetails),
}

/// Runs one lifecycle step wrapped in connect/disconnect.
///
/// Disconnect runs even when the step fails; a step error wins over a
/// disconnect error.
pub async fn execute(
    adaptor: &mut dyn Adaptor,
    job: &mut Job,
    action: LifecycleAction,
) -> Result<StepOutput, AdaptorError> {
    debug!(adaptor = adaptor.name(), slug = %job.slug, action = %action, "adaptor step");
    if !adaptor.connected() {
        adaptor.connect().await?;
    }

    let result = match action {
        LifecycleAction::Prepare => adaptor.prepare(job).await.map(|_| StepOutput::Done),
        LifecycleAction::Run => adaptor.run(job).await.map(|_| StepOutput::Done),
        LifecycleAction::Cancel => adaptor.cancel(job).await.map(|_| StepOutput::Done),
        LifecycleAction::Status => adaptor.status(job).await.map(StepOutput::Status),
        LifecycleAction::Results => adaptor.results(job).await.map(StepOutput::Results),
        LifecycleAction::RunDetails => adaptor.run_details(job).await.map(StepOutput::Details),
    };

    let disconnected = adaptor.disconnect().await;
    match (result, disconnected) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Ok(out), Ok(())) => Ok(out),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdaptorKind {
    /// Fork on the runner host.
    Local,
    /// Fork on a remote host over SSH.
    Ssh,
    /// SGE cluster reachable from the runner host.
    Sge,
    /// SGE cluster submitted to over SSH.
    SshSge,
    Galaxy,
    Mock,
}

impl fmt::Display for AdaptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdaptorKind::Local => "local",
            AdaptorKind::Ssh => "ssh",
            AdaptorKind::Sge => "sge",
            AdaptorKind::SshSge => "ssh-sge",
            AdaptorKind::Galaxy => "galaxy",
            AdaptorKind::Mock => "mock",
        };
        f.write_str(s)
    }
}

/// A named adaptor configuration: back-end kind plus its init parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct AdaptorConfig {
    pub kind: AdaptorKind,
    #[serde(flatten)]
    pub params: BTreeMap<String, toml::Value>,
}

impl AdaptorConfig {
    pub fn build(&self) -> Result<Box<dyn Adaptor>, AdaptorError> {
        let params = InitParams::from_toml(&self.params)?;
        let adaptor: Box<dyn Adaptor> = match self.kind {
            AdaptorKind::Local => Box::new(shell::ForkAdaptor::local(params)?),
            AdaptorKind::Ssh => Box::new(shell::ForkAdaptor::ssh(params)?),
            AdaptorKind::Sge => Box::new(shell::SgeAdaptor::local(params)?),
            AdaptorKind::SshSge => Box::new(shell::SgeAdaptor::ssh(params)?),
            AdaptorKind::Galaxy => Box::new(galaxy::GalaxyAdaptor::from_params(params)?),
            AdaptorKind::Mock => Box::new(MockAdaptor::from_params(params)?),
        };
        Ok(adaptor)
    }
}

/// Hands the runner an adaptor for a job.
pub trait AdaptorProvider: Send + Sync {
    fn adaptor_for(&self, job: &Job) -> Result<Box<dyn Adaptor>, WavesError>;
}

/// Builds adaptors from the `[adaptors.*]` configuration.
#[derive(Debug, Clone, Default)]
pub struct AdaptorRegistry {
    configs: BTreeMap<String, AdaptorConfig>,
}

impl AdaptorRegistry {
    pub fn new(configs: BTreeMap<String, AdaptorConfig>) -> Self {
        Self { configs }
    }

    pub fn build(&self, name: &str) -> Result<Box<dyn Adaptor>, WavesError> {
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| WavesError::UnknownAdaptor(name.to_string()))?;
        Ok(config.build()?)
    }
}

impl AdaptorProvider for AdaptorRegistry {
    fn adaptor_for(&self, job: &Job) -> Result<Box<dyn Adaptor>, WavesError> {
        self.build(&job.adaptor)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::state_machine::new_slug;

    fn registry(toml_str: &str) -> AdaptorRegistry {
        let configs: BTreeMap<String, AdaptorConfig> = toml::from_str(toml_str).unwrap();
        AdaptorRegistry::new(configs)
    }

    #[test]
    fn builds_every_kind() {
        let reg = registry(
            r#"
            [local]
            kind = "local"
            command = "echo"

            [remote]
            kind = "ssh"
            command = "echo"
            host = "h.example.org"
            user_id = "waves"

            [sge]
            kind = "sge"
            command = "echo"
            queue = "all.q"

            [cluster]
            kind = "ssh-sge"
            command = "echo"
            host = "h.example.org"
            user_id = "waves"

            [galaxy]
            kind = "galaxy"
            host = "http://localhost"
            app_key = "k"
            remote_tool_id = "cat1"

            [mock]
            kind = "mock"
            "#,
        );
        for name in ["local", "remote", "sge", "cluster", "galaxy", "mock"] {
            let adaptor = reg.build(name).unwrap();
            assert!(!adaptor.connected(), "{name} starts disconnected");
        }
    }

    #[test]
    fn unknown_adaptor_name() {
        let reg = registry("[mock]\nkind = \"mock\"\n");
        assert!(reg.build("mock").is_ok());
        assert!(matches!(reg.build("nope"), Err(WavesError::UnknownAdaptor(_))));
    }

    #[test]
    fn unexpected_param_is_rejected() {
        let reg = registry("[local]\nkind = \"local\"\ncommand = \"echo\"\nflavour = \"x\"\n");
        let err = reg.build("local").err().unwrap();
        assert!(matches!(
            err,
            WavesError::Adaptor(AdaptorError::UnexpectedParam(ref k)) if k == "flavour"
        ));
    }

    #[test]
    fn missing_param_is_rejected() {
        let reg = registry("[local]\nkind = \"local\"\n");
        assert!(matches!(
            reg.build("local"),
            Err(WavesError::Adaptor(AdaptorError::Init(_)))
        ));
    }

    #[tokio::test]
    async fn execute_wraps_connection() {
        let mut adaptor = MockAdaptor::from_params(InitParams::default()).unwrap();
        let mut job = Job::new(new_slug(), "mock".into(), PathBuf::from("/tmp/w"));
        job.status = JobStatus::Queued;
        let out = execute(&mut adaptor, &mut job, LifecycleAction::Status)
            .await
            .unwrap();
        assert_eq!(out, StepOutput::Status(JobStatus::Completed));
        assert!(!adaptor.connected());
    }

    #[tokio::test]
    async fn execute_disconnects_on_failure() {
        let mut adaptor =
            MockAdaptor::from_params(InitParams::from_pairs([("fail_on", "run")])).unwrap();
        let mut job = Job::new(new_slug(), "mock".into(), PathBuf::from("/tmp/w"));
        let err = execute(&mut adaptor, &mut job, LifecycleAction::Run)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!adaptor.connected());
    }

    #[test]
    fn default_run_details() {
        let mut job = Job::new(new_slug(), "mock".into(), PathBuf::from("/tmp/w"));
        job.title = Some("blast run".into());
        job.exit_code = 3;
        let details = RunDetails::defaults(&job);
        assert_eq!(details.name, "blast run");
        assert_eq!(details.exit_code, 3);
        assert_eq!(details.created, Some(job.created));
    }
}
