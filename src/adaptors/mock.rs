use async_trait::async_trait;

use super::{Adaptor, InitParams, RunDetails};
use crate::error::AdaptorError;
use crate::state_machine::{Job, JobStatus};

/// In-process adaptor: every step succeeds and status reports `status`
/// (COMPLETED by default). `fail_on` names a step that always fails with a
/// transient execution error.
#[derive(Debug)]
pub struct MockAdaptor {
    connected: bool,
    status: JobStatus,
    exit_code: i32,
    fail_on: Option<String>,
}

impl MockAdaptor {
    pub fn from_params(mut params: InitParams) -> Result<Self, AdaptorError> {
        let status = params.parse_or("status", JobStatus::Completed)?;
        let exit_code = params.parse_or("exit_code", 0)?;
        let fail_on = params.optional("fail_on");
        params.finish()?;
        Ok(Self {
            connected: false,
            status,
            exit_code,
            fail_on,
        })
    }

    fn step(&self, name: &str) -> Result<(), AdaptorError> {
        if self.fail_on.as_deref() == Some(name) {
            return Err(AdaptorError::Exec(format!("mock failure on {name}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Adaptor for MockAdaptor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), AdaptorError> {
        self.step("connect")?;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AdaptorError> {
        self.connected = false;
        Ok(())
    }

    async fn prepare(&self, _job: &mut Job) -> Result<(), AdaptorError> {
        self.step("prepare")
    }

    async fn run(&self, job: &mut Job) -> Result<(), AdaptorError> {
        self.step("run")?;
        job.remote_job_id = Some(format!("mock-{}", &job.slug[..job.slug.len().min(8)]));
        Ok(())
    }

    async fn cancel(&self, _job: &mut Job) -> Result<(), AdaptorError> {
        self.step("cancel")
    }

    async fn status(&self, _job: &mut Job) -> Result<JobStatus, AdaptorError> {
        self.step("status")?;
        Ok(self.status)
    }

    async fn results(&self, job: &mut Job) -> Result<bool, AdaptorError> {
        self.step("results")?;
        job.exit_code = self.exit_code;
        Ok(true)
    }

    async fn run_details(&self, job: &Job) -> Result<RunDetails, AdaptorError> {
        self.step("run_details")?;
        Ok(RunDetails::defaults(job))
    }

    fn dump_config(&self) -> String {
        format!(
            "mock: status={} exit_code={} fail_on={}",
            self.status,
            self.exit_code,
            self.fail_on.as_deref().unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::state_machine::new_slug;

    #[tokio::test]
    async fn scripted_status_and_exit_code() {
        let mut mock = MockAdaptor::from_params(InitParams::from_pairs([
            ("status", "running"),
            ("exit_code", "2"),
        ]))
        .unwrap();
        let mut job = Job::new(new_slug(), "mock".into(), PathBuf::from("/w"));
        mock.connect().await.unwrap();
        mock.run(&mut job).await.unwrap();
        assert!(job.remote_job_id.as_deref().unwrap().starts_with("mock-"));
        assert_eq!(mock.status(&mut job).await.unwrap(), JobStatus::Running);
        assert!(mock.results(&mut job).await.unwrap());
        assert_eq!(job.exit_code, 2);
    }

    #[test]
    fn bad_status_param() {
        let params = InitParams::from_pairs([("status", "sleeping")]);
        assert!(matches!(
            MockAdaptor::from_params(params),
            Err(AdaptorError::Init(_))
        ));
    }
}
