//! Request and response bodies of the Galaxy REST API endpoints the adaptor uses.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adaptors::RemoteState;
use crate::state_machine::JobStatus;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerVersion {
    pub version_major: String,
}

/// Subset of `/api/configuration`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub allow_user_dataset_purge: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct History {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateHistory<'a> {
    pub name: &'a str,
}

/// A history dataset as returned by tool runs.
#[derive(Debug, Clone, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    /// Tool output this dataset was created for.
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default)]
    pub file_ext: Option<String>,
    #[serde(default)]
    pub creating_job: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSummary {
    pub id: String,
}

/// Body of `POST /api/tools`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolRunRequest {
    pub tool_id: String,
    pub history_id: String,
    pub inputs: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRunResponse {
    #[serde(default)]
    pub outputs: Vec<Dataset>,
    #[serde(default)]
    pub jobs: Vec<JobSummary>,
}

impl ToolRunResponse {
    /// Id of the job that produces the outputs.
    pub fn job_id(&self) -> Option<&str> {
        self.jobs
            .first()
            .map(|j| j.id.as_str())
            .or_else(|| self.outputs.iter().find_map(|o| o.creating_job.as_deref()))
    }
}

/// `GET /api/jobs/{id}?full=true`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDetails {
    pub state: GalaxyJobState,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub update_time: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

impl JobDetails {
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.create_time.as_deref().and_then(parse_galaxy_time)
    }

    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.update_time.as_deref().and_then(parse_galaxy_time)
    }
}

/// Galaxy timestamps are naive UTC with optional microseconds.
fn parse_galaxy_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|t| t.and_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GalaxyJobState {
    New,
    Upload,
    Waiting,
    Queued,
    Running,
    Paused,
    Ok,
    Error,
    Failed,
    Deleted,
    Deleting,
    #[serde(other)]
    Unknown,
}

impl RemoteState for GalaxyJobState {
    fn job_status(&self) -> JobStatus {
        match self {
            GalaxyJobState::New
            | GalaxyJobState::Upload
            | GalaxyJobState::Waiting
            | GalaxyJobState::Queued => JobStatus::Queued,
            GalaxyJobState::Running => JobStatus::Running,
            GalaxyJobState::Paused => JobStatus::Suspended,
            GalaxyJobState::Ok => JobStatus::Completed,
            GalaxyJobState::Error | GalaxyJobState::Failed => JobStatus::Error,
            GalaxyJobState::Deleted | GalaxyJobState::Deleting => JobStatus::Cancelled,
            GalaxyJobState::Unknown => JobStatus::Undefined,
        }
    }
}
