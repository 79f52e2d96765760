use async_trait::async_trait;
use tracing::{info, warn};

use super::script::{self, CANCELLED_MARKER, Probe, SCRIPT_FILE};
use super::transport::{LocalTransport, SshTransport, Transport};
use super::{collect_results, dir_arg, marker_details, probe, stage_job};
use crate::adaptors::{Adaptor, InitParams, RemoteState, RunDetails};
use crate::error::AdaptorError;
use crate::state_machine::{Job, JobStatus};

/// SGE job states as reported by `qstat`, plus the outcomes read from the
/// wrapper markers once the job has left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgeState {
    Pending,
    Held,
    Running,
    Suspended,
    Failed,
    Deleted,
    Done,
    Undetermined,
}

impl SgeState {
    /// Maps a `qstat` state column (`qw`, `hqw`, `r`, `Eqw`, `dr`, ...).
    pub fn from_code(code: &str) -> Self {
        if code.starts_with('E') {
            SgeState::Failed
        } else if code.starts_with('d') {
            SgeState::Deleted
        } else if code.contains(['s', 'S', 'T']) {
            SgeState::Suspended
        } else if code.starts_with('h') {
            SgeState::Held
        } else if code == "qw" {
            SgeState::Pending
        } else if code.starts_with(['r', 't', 'R']) {
            SgeState::Running
        } else {
            SgeState::Undetermined
        }
    }

    /// Resolves a job `qstat` no longer lists.
    pub fn from_markers(probe: &Probe) -> Self {
        match probe.exit_code {
            Some(0) => SgeState::Done,
            Some(_) => SgeState::Failed,
            None if probe.cancelled => SgeState::Deleted,
            None => SgeState::Undetermined,
        }
    }
}

impl RemoteState for SgeState {
    fn job_status(&self) -> JobStatus {
        match self {
            SgeState::Pending | SgeState::Held => JobStatus::Queued,
            SgeState::Running => JobStatus::Running,
            SgeState::Suspended => JobStatus::Suspended,
            SgeState::Failed => JobStatus::Error,
            SgeState::Deleted => JobStatus::Cancelled,
            SgeState::Done => JobStatus::Completed,
            SgeState::Undetermined => JobStatus::Undefined,
        }
    }
}

/// Extracts the state column of `job_id` from plain `qstat` output.
pub fn parse_qstat(output: &str, job_id: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [id, _prior, _name, _user, state, ..] if *id == job_id => Some(state.to_string()),
            _ => None,
        }
    })
}

/// Job id printed by `qsub -terse`; array jobs print `id.first-last:step`.
pub fn parse_qsub(output: &str) -> Option<String> {
    let first = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = first.split('.').next()?;
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// Submits the wrapper script to an SGE queue, locally or over SSH.
#[derive(Debug)]
pub struct SgeAdaptor {
    kind: &'static str,
    command: String,
    queue: Option<String>,
    transport: Box<dyn Transport>,
    connected: bool,
}

impl SgeAdaptor {
    pub fn local(mut params: InitParams) -> Result<Self, AdaptorError> {
        let command = params.required("command")?;
        let queue = params.optional("queue");
        params.finish()?;
        Ok(Self {
            kind: "sge",
            command,
            queue,
            transport: Box::new(LocalTransport),
            connected: false,
        })
    }

    pub fn ssh(mut params: InitParams) -> Result<Self, AdaptorError> {
        let command = params.required("command")?;
        let queue = params.optional("queue");
        let transport = SshTransport::from_params(&mut params)?;
        params.finish()?;
        Ok(Self {
            kind: "ssh-sge",
            command,
            queue,
            transport: Box::new(transport),
            connected: false,
        })
    }

    fn submit_script(&self, job: &Job) -> String {
        let dir = self.transport.job_dir(&job.slug, &job.working_dir);
        let name = format!("waves_{}", &job.slug[..job.slug.len().min(8)]);
        let mut cmd = format!(
            "cd {} || exit 1\nrm -f {CANCELLED_MARKER}\nqsub -terse -cwd -N {name} -o /dev/null -e /dev/null",
            script::quote(&dir_arg(&dir))
        );
        if let Some(queue) = &self.queue {
            cmd.push_str(" -q ");
            cmd.push_str(&script::quote(queue));
        }
        cmd.push(' ');
        cmd.push_str(SCRIPT_FILE);
        cmd.push('\n');
        cmd
    }

    fn remote_id<'a>(&self, job: &'a Job) -> Result<&'a str, AdaptorError> {
        job.remote_job_id
            .as_deref()
            .ok_or_else(|| AdaptorError::Job(format!("job {} has no SGE job id", job.slug)))
    }
}

#[async_trait]
impl Adaptor for SgeAdaptor {
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
        let out = self
            .transport
            .exec(&self.submit_script(job))
            .await?
            .check("qsub")?;
        let id = parse_qsub(&out)
            .ok_or_else(|| AdaptorError::Exec(format!("unexpected qsub output: {}", out.trim())))?;
        info!(slug = %job.slug, sge_id = %id, "job submitted");
        job.remote_job_id = Some(id);
        Ok(())
    }

    async fn cancel(&self, job: &mut Job) -> Result<(), AdaptorError> {
        let dir = self.transport.job_dir(&job.slug, &job.working_dir);
        self.transport
            .exec(&script::kill_script(&dir_arg(&dir), None))
            .await?
            .check("cancel marker")?;

        let Some(id) = job.remote_job_id.as_deref() else {
            return Ok(());
        };
        let out = self
            .transport
            .exec(&format!("qdel {}\n", script::quote(id)))
            .await?;
        if !out.success() {
            // qdel refuses jobs that already left the queue
            if out.stderr.contains("does not exist") {
                warn!(slug = %job.slug, sge_id = id, "job already gone from the queue");
                return Ok(());
            }
            out.check("qdel")?;
        }
        Ok(())
    }

    async fn status(&self, job: &mut Job) -> Result<JobStatus, AdaptorError> {
        let id = self.remote_id(job)?;
        let listing = self.transport.exec("qstat\n").await?.check("qstat")?;
        let state = match parse_qstat(&listing, id) {
            Some(code) => SgeState::from_code(&code),
            None => SgeState::from_markers(&probe(self.transport.as_ref(), job).await?),
        };
        Ok(state.job_status())
    }

    async fn results(&self, job: &mut Job) -> Result<bool, AdaptorError> {
        collect_results(self.transport.as_ref(), job).await
    }

    async fn run_details(&self, job: &Job) -> Result<RunDetails, AdaptorError> {
        let mut details = marker_details(self.transport.as_ref(), job).await?;
        details.name = format!("waves_{}", &job.slug[..job.slug.len().min(8)]);
        Ok(details)
    }

    fn dump_config(&self) -> String {
        format!(
            "{}: command={} queue={} host={}",
            self.kind,
            self.command,
            self.queue.as_deref().unwrap_or("default"),
            self.transport.describe()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::state_machine::new_slug;

    const QSTAT: &str = "\
job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID
-----------------------------------------------------------------------------------------------------------------
    101 0.55500 waves_a1b2 waves        r     05/01/2024 10:00:00 all.q@node1                        1
    102 0.00000 waves_c3d4 waves        qw    05/01/2024 10:01:00                                    1
    103 0.00000 waves_e5f6 waves        Eqw   05/01/2024 10:02:00                                    1
";

    #[test]
    fn qstat_state_lookup() {
        assert_eq!(parse_qstat(QSTAT, "101").as_deref(), Some("r"));
        assert_eq!(parse_qstat(QSTAT, "102").as_deref(), Some("qw"));
        assert_eq!(parse_qstat(QSTAT, "103").as_deref(), Some("Eqw"));
        assert_eq!(parse_qstat(QSTAT, "10"), None);
        assert_eq!(parse_qstat("", "101"), None);
    }

    #[test]
    fn state_codes() {
        let cases = [
            ("qw", JobStatus::Queued),
            ("hqw", JobStatus::Queued),
            ("hRwq", JobStatus::Queued),
            ("r", JobStatus::Running),
            ("t", JobStatus::Running),
            ("Rr", JobStatus::Running),
            ("s", JobStatus::Suspended),
            ("S", JobStatus::Suspended),
            ("T", JobStatus::Suspended),
            ("Eqw", JobStatus::Error),
            ("dr", JobStatus::Cancelled),
            ("zz", JobStatus::Undefined),
        ];
        for (code, expected) in cases {
            assert_eq!(SgeState::from_code(code).job_status(), expected, "{code}");
        }
    }

    #[test]
    fn finished_jobs_resolve_through_markers() {
        assert_eq!(
            SgeState::from_markers(&Probe::parse("exit_code=0\n")).job_status(),
            JobStatus::Completed
        );
        assert_eq!(
            SgeState::from_markers(&Probe::parse("exit_code=1\n")).job_status(),
            JobStatus::Error
        );
        assert_eq!(
            SgeState::from_markers(&Probe::parse("")).job_status(),
            JobStatus::Undefined
        );
    }

    #[test]
    fn qsub_output() {
        assert_eq!(parse_qsub("4242\n").as_deref(), Some("4242"));
        assert_eq!(parse_qsub("4243.1-10:1\n").as_deref(), Some("4243"));
        assert_eq!(parse_qsub("Unable to run job\n"), None);
        assert_eq!(parse_qsub(""), None);
    }

    #[test]
    fn submit_script_uses_queue() {
        let adaptor = SgeAdaptor::local(InitParams::from_pairs([
            ("command", "muscle"),
            ("queue", "long.q"),
        ]))
        .unwrap();
        let job = Job::new(
            "0123456789abcdef".into(),
            "sge".into(),
            PathBuf::from("/data/jobs/0123456789abcdef"),
        );
        let script = adaptor.submit_script(&job);
        assert!(script.starts_with("cd /data/jobs/0123456789abcdef || exit 1\n"));
        assert!(script.contains("qsub -terse -cwd -N waves_01234567"));
        assert!(script.trim_end().ends_with("-q long.q job.sh"));
    }

    #[tokio::test]
    async fn status_without_remote_id_is_a_job_error() {
        let adaptor = SgeAdaptor::local(InitParams::from_pairs([("command", "x")])).unwrap();
        let mut job = Job::new(new_slug(), "sge".into(), PathBuf::from("/w"));
        let err = adaptor.status(&mut job).await.unwrap_err();
        assert!(matches!(err, AdaptorError::Job(_)));
    }
}
