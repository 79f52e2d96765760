use async_trait::async_trait;
use tracing::info;

use super::script::{self, Probe};
use super::transport::{LocalTransport, SshTransport, Transport};
use super::{collect_results, dir_arg, marker_details, probe, stage_job};
use crate::adaptors::{Adaptor, InitParams, RemoteState, RunDetails};
use crate::error::AdaptorError;
use crate::state_machine::{Job, JobStatus};

/// Native states of a forked wrapper process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Unknown,
    New,
    Pending,
    Running,
    Suspended,
    Canceled,
    Done,
    Failed,
}

impl ShellState {
    pub fn from_probe(probe: &Probe) -> Self {
        if probe.missing {
            ShellState::Unknown
        } else if probe.cancelled {
            ShellState::Canceled
        } else if probe.exit_code.is_some() {
            ShellState::Done
        } else if probe.alive && probe.is_stopped() {
            ShellState::Suspended
        } else if probe.alive && probe.started.is_some() {
            ShellState::Running
        } else if probe.alive {
            ShellState::Pending
        } else if !probe.launched {
            ShellState::New
        } else if probe.started.is_some() {
            // wrapper died before recording an exit code
            ShellState::Failed
        } else {
            ShellState::Unknown
        }
    }
}

impl RemoteState for ShellState {
    fn job_status(&self) -> JobStatus {
        match self {
            ShellState::Unknown => JobStatus::Undefined,
            ShellState::New => JobStatus::Created,
            ShellState::Pending => JobStatus::Queued,
            ShellState::Running => JobStatus::Running,
            ShellState::Suspended => JobStatus::Suspended,
            ShellState::Canceled => JobStatus::Cancelled,
            ShellState::Done => JobStatus::Completed,
            ShellState::Failed => JobStatus::Error,
        }
    }
}

/// Runs the adaptor command as a detached process, locally or over SSH.
#[derive(Debug)]
pub struct ForkAdaptor {
    kind: &'static str,
    command: String,
    transport: Box<dyn Transport>,
    connected: bool,
}

impl ForkAdaptor {
    pub fn local(mut params: InitParams) -> Result<Self, AdaptorError> {
        let command = params.required("command")?;
        params.finish()?;
        Ok(Self::with_transport("local", command, Box::new(LocalTransport)))
    }

    pub fn ssh(mut params: InitParams) -> Result<Self, AdaptorError> {
        let command = params.required("command")?;
        let transport = SshTransport::from_params(&mut params)?;
        params.finish()?;
        Ok(Self::with_transport("ssh", command, Box::new(transport)))
    }

    fn with_transport(kind: &'static str, command: String, transport: Box<dyn Transport>) -> Self {
        Self {
            kind,
            command,
            transport,
            connected: false,
        }
    }
}

#[async_trait]
impl Adaptor for ForkAdaptor {
    fn name(&self) -> &'static str {
        self.kind
    }

    fn connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), AdaptorError> {
        self.transport.open().await?;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AdaptorError> {
        self.connected = false;
        self.transport.close().await
    }

    async fn prepare(&self, job: &mut Job) -> Result<(), AdaptorError> {
        stage_job(self.transport.as_ref(), &self.command, job).await?;
        Ok(())
    }

    async fn run(&self, job: &mut Job) -> Result<(), AdaptorError> {
        let dir = self.transport.job_dir(&job.slug, &job.working_dir);
        let out = self
            .transport
            .exec(&script::launch_script(&dir_arg(&dir)))
            .await?
            .check("launch")?;
        let pid = out.trim();
        if pid.is_empty() || pid.parse::<u32>().is_err() {
            return Err(AdaptorError::Exec(format!("launch returned no pid: {pid:?}")));
        }
        info!(slug = %job.slug, pid, "job launched");
        job.remote_job_id = Some(pid.to_string());
        Ok(())
    }

    async fn cancel(&self, job: &mut Job) -> Result<(), AdaptorError> {
        let dir = self.transport.job_dir(&job.slug, &job.working_dir);
        self.transport
            .exec(&script::kill_script(
                &dir_arg(&dir),
                job.remote_job_id.as_deref(),
            ))
            .await?
            .check("cancel")?;
        Ok(())
    }

    async fn status(&self, job: &mut Job) -> Result<JobStatus, AdaptorError> {
        let probe = probe(self.transport.as_ref(), job).await?;
        Ok(ShellState::from_probe(&probe).job_status())
    }

    async fn results(&self, job: &mut Job) -> Result<bool, AdaptorError> {
        collect_results(self.transport.as_ref(), job).await
    }

    async fn run_details(&self, job: &Job) -> Result<RunDetails, AdaptorError> {
        marker_details(self.transport.as_ref(), job).await
    }

    fn dump_config(&self) -> String {
        format!(
            "{}: command={} host={}",
            self.kind,
            self.command,
            self.transport.describe()
        )
    }
}
