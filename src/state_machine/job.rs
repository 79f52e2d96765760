use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::JobStatus;
use crate::error::WavesError;

/// File name of the captured standard output, relative to the working dir.
pub const STDOUT_FILE: &str = "job.stdout";
/// File name of the captured standard error, relative to the working dir.
pub const STDERR_FILE: &str = "job.stderr";

/// Distinguishes failures worth retrying from failures that end the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Remote side misbehaved (connection refused, command failed, API down).
    Transient(String),
    /// Nothing a retry can fix (bad configuration, inconsistent state, bad input).
    Fatal(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient(msg) => write!(f, "Transient failure: {msg}"),
            FailureKind::Fatal(msg) => write!(f, "Fatal failure: {msg}"),
        }
    }
}

/// The result of one lifecycle step on an adaptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The step succeeded and the job should now be in this status.
    Success(JobStatus),
    Failure(FailureKind),
}

/// Retry budget and backoff applied when an adaptor step fails transiently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed before the job is forced into ERROR.
    pub max_retry: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 5 * 60 * 1_000,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1), capped at max_delay_ms.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1);
        let factor = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

/// Declared type of a job input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    File,
    Text,
    Boolean,
    Integer,
    Decimal,
    List,
}

/// How an input is rendered on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// `--name=value`
    Valuated,
    /// `-name value`
    Simple,
    /// `-name` when truthy
    Option,
    /// `--name` when truthy
    NamedOption,
    /// bare `value`
    #[default]
    Posix,
    /// never rendered
    None,
}

/// An input value cast to its declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Text(String),
    Bool(bool),
    Integer(i64),
    Decimal(f64),
}

impl InputValue {
    fn is_truthy(&self) -> bool {
        match self {
            InputValue::Text(s) => !s.is_empty(),
            InputValue::Bool(b) => *b,
            InputValue::Integer(i) => *i != 0,
            InputValue::Decimal(d) => *d != 0.0,
        }
    }
}

impl fmt::Display for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputValue::Text(s) => f.write_str(s),
            InputValue::Bool(b) => write!(f, "{b}"),
            InputValue::Integer(i) => write!(f, "{i}"),
            InputValue::Decimal(d) => write!(f, "{d}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(rename = "type")]
    pub input_type: InputType,
    #[serde(default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub remote_input_id: Option<String>,
}

impl JobInput {
    /// Raw value, with the empty string and the literal `None` treated as absent.
    pub fn raw_value(&self) -> Option<&str> {
        self.value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty() && *v != "None")
    }

    pub fn validated_value(&self) -> Result<Option<InputValue>, WavesError> {
        let Some(raw) = self.raw_value() else {
            return Ok(None);
        };
        let invalid = |what: &str| {
            WavesError::InvalidInput(format!("input '{}': '{raw}' is not a valid {what}", self.name))
        };
        let value = match self.input_type {
            InputType::File | InputType::Text | InputType::List => InputValue::Text(raw.to_string()),
            InputType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => InputValue::Bool(true),
                "false" | "0" | "no" | "off" => InputValue::Bool(false),
                _ => return Err(invalid("boolean")),
            },
            InputType::Integer => InputValue::Integer(raw.parse().map_err(|_| invalid("integer"))?),
            InputType::Decimal => InputValue::Decimal(raw.parse().map_err(|_| invalid("decimal"))?),
        };
        Ok(Some(value))
    }

    /// Command line tokens for this input, according to its param type.
    pub fn command_line_element(&self) -> Result<Vec<String>, WavesError> {
        let value = self.validated_value()?;
        let truthy = value.as_ref().is_some_and(InputValue::is_truthy);
        let tokens = match (self.param_type, value) {
            (ParamType::None, _) => vec![],
            (ParamType::Valuated, Some(v)) => vec![format!("--{}={v}", self.name)],
            (ParamType::Simple, Some(v)) if truthy => vec![format!("-{}", self.name), v.to_string()],
            (ParamType::Option, _) if truthy => vec![format!("-{}", self.name)],
            (ParamType::NamedOption, _) if truthy => vec![format!("--{}", self.name)],
            (ParamType::Posix, Some(v)) if truthy => vec![v.to_string()],
            _ => vec![],
        };
        Ok(tokens)
    }

    pub fn file_path(&self, working_dir: &Path) -> Option<PathBuf> {
        match self.input_type {
            InputType::File => self.raw_value().map(|v| working_dir.join(v)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    pub name: String,
    /// File name relative to the job working dir.
    pub value: String,
    /// Whether the output may legitimately be empty or missing.
    #[serde(default = "default_optional")]
    pub optional: bool,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub remote_output_id: Option<String>,
}

fn default_optional() -> bool {
    true
}

fn default_extension() -> String {
    "txt".to_string()
}

impl JobOutput {
    pub fn file_path(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(&self.value)
    }
}

/// One persisted status event of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub status: JobStatus,
    pub message: String,
    /// Retry and error events are only meant for operators.
    #[serde(default)]
    pub is_admin: bool,
}

impl HistoryEntry {
    pub fn new(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            status,
            message: message.into(),
            is_admin: false,
        }
    }

    pub fn admin(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::new(status, message)
        }
    }
}

/// A unit of submitted work bound to one adaptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub slug: String,
    #[serde(default)]
    pub title: Option<String>,
    pub adaptor: String,
    pub status: JobStatus,
    #[serde(default)]
    pub nb_retry: u32,
    #[serde(default)]
    pub remote_job_id: Option<String>,
    #[serde(default)]
    pub remote_history_id: Option<String>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub results_available: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub email_to: Option<String>,
    /// Last status a notification was emitted for.
    #[serde(default)]
    pub status_notified: Option<JobStatus>,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub inputs: Vec<JobInput>,
    #[serde(default)]
    pub outputs: Vec<JobOutput>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Set after a transient failure; the runner leaves the job alone until then.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Generates a new job slug: 32 lowercase hex characters.
pub fn new_slug() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Job {
    pub fn new(slug: String, adaptor: String, working_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            slug,
            title: None,
            adaptor,
            status: JobStatus::Created,
            nb_retry: 0,
            remote_job_id: None,
            remote_history_id: None,
            exit_code: 0,
            results_available: false,
            message: None,
            email_to: None,
            status_notified: None,
            working_dir,
            inputs: Vec::new(),
            outputs: Vec::new(),
            created: now,
            updated: now,
            next_attempt_at: None,
        }
    }

    /// Title if set, slug otherwise.
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.slug)
    }

    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }

    /// Adds the standard output and standard error descriptors.
    pub fn add_default_outputs(&mut self) {
        for (name, file) in [("Standard output", STDOUT_FILE), ("Standard error", STDERR_FILE)] {
            if self.outputs.iter().any(|o| o.value == file) {
                continue;
            }
            self.outputs.push(JobOutput {
                name: name.to_string(),
                value: file.to_string(),
                optional: false,
                extension: "txt".to_string(),
                remote_output_id: None,
            });
        }
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.working_dir.join(STDOUT_FILE)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.working_dir.join(STDERR_FILE)
    }

    pub fn input_files(&self) -> impl Iterator<Item = &JobInput> {
        self.inputs
            .iter()
            .filter(|i| i.input_type == InputType::File && i.raw_value().is_some())
    }

    /// Arguments passed to the adaptor command, in input order.
    pub fn command_args(&self) -> Result<Vec<String>, WavesError> {
        let mut args = Vec::new();
        for input in &self.inputs {
            args.extend(input.command_line_element()?);
        }
        Ok(args)
    }

    /// Whether the runner may pick this job up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Re-running is refused for jobs that never got past creation.
    pub fn allow_rerun(&self) -> bool {
        !matches!(self.status, JobStatus::Created | JobStatus::Undefined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, value: &str, input_type: InputType, param_type: ParamType) -> JobInput {
        JobInput {
            name: name.into(),
            value: Some(value.into()),
            input_type,
            param_type,
            remote_input_id: None,
        }
    }

    #[test]
    fn job_creation_defaults() {
        let job = Job::new(new_slug(), "local".into(), PathBuf::from("/tmp/x"));
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.nb_retry, 0);
        assert_eq!(job.slug.len(), 32);
        assert!(job.slug.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(job.remote_job_id.is_none());
        assert!(job.is_due(Utc::now()));
    }

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_retry: 5,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
        };
        assert_eq!(config.delay_for_attempt(1), 1000);
        assert_eq!(config.delay_for_attempt(2), 2000);
        assert_eq!(config.delay_for_attempt(3), 4000);
        assert_eq!(config.delay_for_attempt(4), 5000);
        assert_eq!(config.delay_for_attempt(200), 5000);
    }

    #[test]
    fn command_line_rendering() {
        assert_eq!(
            input("threads", "4", InputType::Integer, ParamType::Valuated)
                .command_line_element()
                .unwrap(),
            vec!["--threads=4"]
        );
        assert_eq!(
            input("o", "out.txt", InputType::Text, ParamType::Simple)
                .command_line_element()
                .unwrap(),
            vec!["-o", "out.txt"]
        );
        assert_eq!(
            input("v", "true", InputType::Boolean, ParamType::Option)
                .command_line_element()
                .unwrap(),
            vec!["-v"]
        );
        assert!(
            input("v", "false", InputType::Boolean, ParamType::Option)
                .command_line_element()
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            input("quiet", "yes", InputType::Boolean, ParamType::NamedOption)
                .command_line_element()
                .unwrap(),
            vec!["--quiet"]
        );
        assert_eq!(
            input("seq", "seq.fa", InputType::File, ParamType::Posix)
                .command_line_element()
                .unwrap(),
            vec!["seq.fa"]
        );
        assert!(
            input("hidden", "x", InputType::Text, ParamType::None)
                .command_line_element()
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn none_literal_is_absent() {
        let i = input("opt", "None", InputType::List, ParamType::Simple);
        assert!(i.raw_value().is_none());
        assert!(i.command_line_element().unwrap().is_empty());
    }

    #[test]
    fn malformed_values_are_rejected() {
        let bad_int = input("n", "four", InputType::Integer, ParamType::Valuated);
        assert!(matches!(
            bad_int.command_line_element(),
            Err(WavesError::InvalidInput(_))
        ));
        let bad_bool = input("b", "maybe", InputType::Boolean, ParamType::Option);
        assert!(bad_bool.validated_value().is_err());
    }

    #[test]
    fn command_args_follow_input_order() {
        let mut job = Job::new(new_slug(), "local".into(), PathBuf::from("/w"));
        job.inputs = vec![
            input("v", "1", InputType::Boolean, ParamType::Option),
            input("seq", "in.fa", InputType::File, ParamType::Posix),
            input("k", "21", InputType::Integer, ParamType::Simple),
        ];
        assert_eq!(job.command_args().unwrap(), vec!["-v", "in.fa", "-k", "21"]);
        assert_eq!(job.input_files().count(), 1);
        assert_eq!(
            job.inputs[1].file_path(&job.working_dir),
            Some(PathBuf::from("/w/in.fa"))
        );
    }

    #[test]
    fn default_outputs_added_once() {
        let mut job = Job::new(new_slug(), "local".into(), PathBuf::from("/w"));
        job.add_default_outputs();
        job.add_default_outputs();
        assert_eq!(job.outputs.len(), 2);
        assert!(job.outputs.iter().all(|o| !o.optional));
        assert_eq!(job.outputs[0].file_path(&job.working_dir), job.stdout_path());
    }

    #[test]
    fn backoff_delays_dispatch() {
        let mut job = Job::new(new_slug(), "local".into(), PathBuf::from("/w"));
        let now = Utc::now();
        job.next_attempt_at = Some(now + chrono::Duration::seconds(30));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + chrono::Duration::seconds(31)));
        job.status = JobStatus::Error;
        assert!(!job.is_due(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn rerun_rules() {
        let mut job = Job::new(new_slug(), "local".into(), PathBuf::from("/w"));
        assert!(!job.allow_rerun());
        job.status = JobStatus::Error;
        assert!(job.allow_rerun());
        job.status = JobStatus::Undefined;
        assert!(!job.allow_rerun());
    }

    #[test]
    fn failure_kind_display() {
        let t = FailureKind::Transient("connection refused".into());
        assert_eq!(t.to_string(), "Transient failure: connection refused");
        let f = FailureKind::Fatal("missing command".into());
        assert_eq!(f.to_string(), "Fatal failure: missing command");
    }

    #[test]
    fn job_deserializes_with_defaults() {
        let json = r#"{
            "slug": "abc",
            "adaptor": "local",
            "status": "QUEUED",
            "working_dir": "/w",
            "created": "2024-01-01T00:00:00Z",
            "updated": "2024-01-01T00:00:00Z"
        }"#;
        let job: Job = serde_json::from_str(json).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.nb_retry, 0);
        assert!(job.inputs.is_empty());
    }
}
