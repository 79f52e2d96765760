use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use super::client::GalaxyClient;
use super::error::GalaxyError;
use super::types::{GalaxyJobState, ToolRunRequest};
use crate::adaptors::{Adaptor, InitParams, RemoteState, RunDetails, redact};
use crate::error::AdaptorError;
use crate::state_machine::{InputType, Job, JobStatus};

/// Runs one Galaxy tool per job, in a history named after the job slug.
pub struct GalaxyAdaptor {
    host: String,
    port: u16,
    app_key: String,
    remote_tool_id: String,
    library_dir: Option<String>,
    client: Option<GalaxyClient>,
}

impl fmt::Debug for GalaxyAdaptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GalaxyAdaptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("remote_tool_id", &self.remote_tool_id)
            .field("connected", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

/// Lowercase ASCII with dashes, the way output file names are built.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

impl GalaxyAdaptor {
    pub fn from_params(mut params: InitParams) -> Result<Self, AdaptorError> {
        let adaptor = Self {
            host: params.or("host", "http://127.0.0.1"),
            port: params.parse_or("port", 8080)?,
            app_key: params.required("app_key")?,
            remote_tool_id: params.required("remote_tool_id")?,
            library_dir: params.optional("library_dir"),
            client: None,
        };
        params.finish()?;
        Ok(adaptor)
    }

    fn client(&self) -> Result<&GalaxyClient, AdaptorError> {
        self.client
            .as_ref()
            .ok_or_else(|| AdaptorError::NotReady("galaxy adaptor is not connected".into()))
    }

    fn remote_job_id<'a>(&self, job: &'a Job) -> Result<&'a str, AdaptorError> {
        job.remote_job_id
            .as_deref()
            .ok_or_else(|| AdaptorError::Job(format!("job {} has no galaxy job id", job.slug)))
    }
}

#[async_trait]
impl Adaptor for GalaxyAdaptor {
    fn name(&self) -> &'static str {
        "galaxy"
    }

    fn connected(&self) -> bool {
        self.client.is_some()
    }

    async fn connect(&mut self) -> Result<(), AdaptorError> {
        let client = GalaxyClient::new(&self.host, self.port, self.app_key.clone())?;
        let version = client.version().await?;
        debug!(url = %client.base_url(), version = %version.version_major, "connected to galaxy");
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AdaptorError> {
        self.client = None;
        Ok(())
    }

    async fn prepare(&self, job: &mut Job) -> Result<(), AdaptorError> {
        let client = self.client()?;

        let existing = client.histories_named(&job.slug).await?;
        if !existing.is_empty() {
            warn!(slug = %job.slug, count = existing.len(), "replacing existing galaxy histories");
            let purge = client.configuration().await?.allow_user_dataset_purge;
            for history in &existing {
                client.delete_history(&history.id, purge).await?;
            }
        }
        let history = client.create_history(&job.slug).await?;
        debug!(slug = %job.slug, history = %history.id, "galaxy history created");

        let working_dir = job.working_dir.clone();
        for input in job.inputs.iter_mut() {
            if input.input_type != InputType::File {
                continue;
            }
            let Some(path) = input.file_path(&working_dir) else {
                continue;
            };
            let file_name = input.raw_value().unwrap_or(&input.name).to_string();
            let dataset = client.upload_file(&history.id, &path, &file_name).await?;
            debug!(input = %input.name, dataset = %dataset.id, "input uploaded");
            input.remote_input_id = Some(dataset.id);
        }

        job.remote_history_id = Some(history.id);
        job.message = Some(format!("Job prepared with {} args", job.inputs.len()));
        Ok(())
    }

    async fn run(&self, job: &mut Job) -> Result<(), AdaptorError> {
        let client = self.client()?;
        let history_id = job
            .remote_history_id
            .clone()
            .ok_or_else(|| AdaptorError::Job(format!("job {} has no galaxy history", job.slug)))?;

        let mut inputs = BTreeMap::new();
        for input in &job.inputs {
            let Some(value) = input.raw_value() else {
                continue;
            };
            let value = match input.input_type {
                InputType::File => {
                    let id = input.remote_input_id.as_deref().ok_or_else(|| {
                        AdaptorError::Job(format!("input '{}' was not uploaded", input.name))
                    })?;
                    json!({"src": "hda", "id": id})
                }
                _ => json!(value),
            };
            inputs.insert(input.name.clone(), value);
        }

        let request = ToolRunRequest {
            tool_id: self.remote_tool_id.clone(),
            history_id,
            inputs,
        };
        let response = client.run_tool(&request).await?;
        let job_id = response
            .job_id()
            .ok_or_else(|| GalaxyError::Unexpected("tool run returned no job".into()))?
            .to_string();

        for dataset in &response.outputs {
            let Some(output_name) = dataset.output_name.as_deref() else {
                continue;
            };
            match job.outputs.iter_mut().find(|o| o.name == output_name) {
                Some(output) => {
                    let ext = dataset.file_ext.as_deref().unwrap_or(&output.extension);
                    output.value = format!("{}.{ext}", slugify(&dataset.name));
                    output.remote_output_id = Some(dataset.id.clone());
                }
                None => debug!(output = output_name, "remote output not expected by job"),
            }
        }

        info!(slug = %job.slug, galaxy_job = %job_id, "galaxy tool started");
        job.remote_job_id = Some(job_id);
        job.message = Some("Job queued".to_string());
        Ok(())
    }

    async fn cancel(&self, job: &mut Job) -> Result<(), AdaptorError> {
        let client = self.client()?;
        if let Some(id) = job.remote_job_id.as_deref() {
            client.delete_job(id).await?;
        }
        Ok(())
    }

    async fn status(&self, job: &mut Job) -> Result<JobStatus, AdaptorError> {
        let id = self.remote_job_id(job)?;
        let details = self.client()?.job(id).await?;
        Ok(details.state.job_status())
    }

    async fn results(&self, job: &mut Job) -> Result<bool, AdaptorError> {
        let client = self.client()?;
        let id = self.remote_job_id(job)?;
        let details = client.job(id).await?;
        if details.state != GalaxyJobState::Ok {
            return Ok(false);
        }
        let history_id = job
            .remote_history_id
            .as_deref()
            .ok_or_else(|| AdaptorError::Job(format!("job {} has no galaxy history", job.slug)))?;

        tokio::fs::create_dir_all(&job.working_dir).await?;
        for output in &job.outputs {
            let Some(dataset_id) = output.remote_output_id.as_deref() else {
                continue;
            };
            let bytes = client.download_dataset(history_id, dataset_id).await?;
            tokio::fs::write(output.file_path(&job.working_dir), bytes).await?;
        }
        if let Some(stderr) = details.stderr.as_deref() {
            tokio::fs::write(job.stderr_path(), stderr).await?;
        }
        if let Some(stdout) = details.stdout.as_deref() {
            tokio::fs::write(job.stdout_path(), stdout).await?;
        }
        job.exit_code = details.exit_code.unwrap_or(0);
        Ok(true)
    }

    async fn run_details(&self, job: &Job) -> Result<RunDetails, AdaptorError> {
        let id = self.remote_job_id(job)?;
        let details = self.client()?.job(id).await?;
        let mut run = RunDetails::defaults(job);
        run.name = self.remote_tool_id.clone();
        run.created = details.created().or(run.created);
        run.started = details.created();
        run.finished = details.updated().or(run.finished);
        if let Some(code) = details.exit_code {
            run.exit_code = code;
        }
        Ok(run)
    }

    fn dump_config(&self) -> String {
        let mut dump = format!(
            "galaxy: host={}:{} tool={} app_key={}",
            self.host,
            self.port,
            self.remote_tool_id,
            redact("app_key", &self.app_key)
        );
        if let Some(dir) = &self.library_dir {
            dump.push_str(&format!(" library_dir={dir}"));
        }
        if self.connected() {
            dump.push_str(" (connected)");
        }
        dump
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::adaptors::{StepOutput, execute};
    use crate::state_machine::{JobInput, JobOutput, LifecycleAction, ParamType};

    fn adaptor_for(server: &MockServer) -> GalaxyAdaptor {
        GalaxyAdaptor::from_params(InitParams::from_pairs([
            ("host", server.uri().as_str()),
            ("app_key", "secret"),
            ("remote_tool_id", "cat1"),
        ]))
        .unwrap()
    }

    fn galaxy_job(slug: &str, working_dir: PathBuf) -> Job {
        let mut job = Job::new(slug.into(), "galaxy".into(), working_dir);
        job.add_default_outputs();
        job.inputs = vec![
            JobInput {
                name: "input1".into(),
                value: Some("seq.fa".into()),
                input_type: InputType::File,
                param_type: ParamType::Posix,
                remote_input_id: None,
            },
            JobInput {
                name: "lines".into(),
                value: Some("10".into()),
                input_type: InputType::Integer,
                param_type: ParamType::Valuated,
                remote_input_id: None,
            },
        ];
        job.outputs.push(JobOutput {
            name: "out_file1".into(),
            value: "out_file1".into(),
            optional: false,
            extension: "txt".into(),
            remote_output_id: None,
        });
        job
    }

    async fn mount_version(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version_major": "23.1"})))
            .mount(server)
            .await;
    }

    #[test]
    fn slugify_names() {
        assert_eq!(slugify("Concatenate datasets"), "concatenate-datasets");
        assert_eq!(slugify("  out (1).fa "), "out-1-fa");
    }

    #[test]
    fn app_key_is_redacted() {
        let adaptor = GalaxyAdaptor::from_params(InitParams::from_pairs([
            ("app_key", "secret"),
            ("remote_tool_id", "cat1"),
        ]))
        .unwrap();
        let dump = adaptor.dump_config();
        assert!(dump.contains("http://127.0.0.1:8080"));
        assert!(!dump.contains("secret"));
    }

    #[tokio::test]
    async fn connect_failure_is_transient() {
        let mut adaptor = GalaxyAdaptor::from_params(InitParams::from_pairs([
            ("host", "http://127.0.0.1:1"),
            ("app_key", "k"),
            ("remote_tool_id", "cat1"),
        ]))
        .unwrap();
        let err = adaptor.connect().await.unwrap_err();
        assert!(err.is_transient());
        assert!(!adaptor.connected());
    }

    #[tokio::test]
    async fn full_lifecycle_against_mock_server() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let slug = "0f0e0d0c0b0a09080706050403020100";
        let mut job = galaxy_job(slug, tmp.path().to_path_buf());
        std::fs::write(tmp.path().join("seq.fa"), ">s\nACGT\n").unwrap();

        mount_version(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/histories"))
            .and(query_param("qv", slug))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": "old", "name": slug}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/configuration"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"allow_user_dataset_purge": true})),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/histories/old"))
            .and(query_param("purge", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "old"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/histories"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "h1", "name": slug})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/tools"))
            .and(body_string_contains("upload1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "outputs": [{"id": "d1", "name": "seq.fa"}],
                "jobs": [{"id": "up1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/tools"))
            .and(body_partial_json(json!({
                "tool_id": "cat1",
                "history_id": "h1",
                "inputs": {"input1": {"src": "hda", "id": "d1"}, "lines": "10"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "outputs": [{"id": "d2", "name": "Concatenated", "output_name": "out_file1",
                             "file_ext": "fasta"}],
                "jobs": [{"id": "j1", "state": "new"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/jobs/j1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "j1", "state": "ok", "exit_code": 0,
                "create_time": "2024-05-01T10:00:00", "update_time": "2024-05-01T10:01:00",
                "stdout": "", "stderr": ""
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/histories/h1/contents/d2/display"))
            .respond_with(ResponseTemplate::new(200).set_body_string(">s\nACGT\n"))
            .mount(&server)
            .await;

        let mut adaptor = adaptor_for(&server);

        execute(&mut adaptor, &mut job, LifecycleAction::Prepare).await.unwrap();
        assert_eq!(job.remote_history_id.as_deref(), Some("h1"));
        assert_eq!(job.inputs[0].remote_input_id.as_deref(), Some("d1"));

        execute(&mut adaptor, &mut job, LifecycleAction::Run).await.unwrap();
        assert_eq!(job.remote_job_id.as_deref(), Some("j1"));
        let out = job.outputs.iter().find(|o| o.name == "out_file1").unwrap();
        assert_eq!(out.value, "concatenated.fasta");
        assert_eq!(out.remote_output_id.as_deref(), Some("d2"));

        let status = execute(&mut adaptor, &mut job, LifecycleAction::Status).await.unwrap();
        assert_eq!(status, StepOutput::Status(JobStatus::Completed));

        let results = execute(&mut adaptor, &mut job, LifecycleAction::Results).await.unwrap();
        assert_eq!(results, StepOutput::Results(true));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("concatenated.fasta")).unwrap(),
            ">s\nACGT\n"
        );
        assert_eq!(job.exit_code, 0);

        match execute(&mut adaptor, &mut job, LifecycleAction::RunDetails).await.unwrap() {
            StepOutput::Details(details) => {
                assert_eq!(details.name, "cat1");
                assert!(details.finished.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!adaptor.connected());
    }

    #[tokio::test]
    async fn results_wait_for_ok_state() {
        let server = MockServer::start().await;
        mount_version(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/jobs/j2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "j2", "state": "running"})),
            )
            .mount(&server)
            .await;

        let mut adaptor = adaptor_for(&server);
        let mut job = galaxy_job("abc", PathBuf::from("/nonexistent"));
        job.remote_job_id = Some("j2".into());
        job.remote_history_id = Some("h1".into());

        let out = execute(&mut adaptor, &mut job, LifecycleAction::Results).await.unwrap();
        assert_eq!(out, StepOutput::Results(false));
    }

    #[tokio::test]
    async fn cancel_deletes_remote_job() {
        let server = MockServer::start().await;
        mount_version(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/api/jobs/j3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .expect(1)
            .mount(&server)
            .await;

        let mut adaptor = adaptor_for(&server);
        let mut job = galaxy_job("abc", PathBuf::from("/nonexistent"));
        job.remote_job_id = Some("j3".into());
        execute(&mut adaptor, &mut job, LifecycleAction::Cancel).await.unwrap();
    }
}
