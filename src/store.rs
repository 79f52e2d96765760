//! File-backed job store.
//!
//! Layout under the data root:
//!
//! ```text
//! jobs/<slug>/job.json                 job record, replaced atomically
//! jobs/<slug>/history.jsonl            one status event per line
//! jobs/<slug>/job_run_details.json     cached run details
//! jobs/<slug>/...                      job working files
//! ```

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::adaptors::RunDetails;
use crate::error::WavesError;
use crate::state_machine::{HistoryEntry, Job};

const JOB_FILE: &str = "job.json";
const HISTORY_FILE: &str = "history.jsonl";
pub const RUN_DETAILS_FILE: &str = "job_run_details.json";

#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

fn check_slug(slug: &str) -> Result<(), WavesError> {
    let valid = !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(WavesError::JobNotFound(slug.to_string()))
    }
}

/// Checks that `name` is a plain file name that can live in a job dir
/// next to the store's own files.
pub fn check_file_name(name: &str) -> Result<(), WavesError> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !Path::new(name).is_absolute();
    if !plain {
        return Err(WavesError::InvalidInput(format!(
            "'{name}' is not a plain file name"
        )));
    }
    let reserved = [JOB_FILE, HISTORY_FILE, RUN_DETAILS_FILE];
    if reserved.contains(&name) || name == format!("{JOB_FILE}.tmp") {
        return Err(WavesError::InvalidInput(format!(
            "'{name}' is reserved for the job record"
        )));
    }
    Ok(())
}

impl JobStore {
    /// Opens the store rooted at `data_root`, made absolute against the current dir.
    pub fn new(data_root: &Path) -> Result<Self, WavesError> {
        Ok(Self {
            root: std::path::absolute(data_root)?,
        })
    }

    fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    /// Directory of one job; also its working dir.
    pub fn job_dir(&self, slug: &str) -> PathBuf {
        self.jobs_dir().join(slug)
    }

    /// Persists a new job. Fails if the slug is already taken.
    pub async fn create(&self, job: &Job) -> Result<(), WavesError> {
        check_slug(&job.slug)?;
        let dir = self.job_dir(&job.slug);
        if fs::try_exists(dir.join(JOB_FILE)).await? {
            return Err(WavesError::Config(format!("job {} already exists", job.slug)));
        }
        fs::create_dir_all(&job.working_dir).await?;
        fs::create_dir_all(&dir).await?;
        self.save(job).await
    }

    pub async fn load(&self, slug: &str) -> Result<Job, WavesError> {
        check_slug(slug)?;
        let path = self.job_dir(slug).join(JOB_FILE);
        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WavesError::JobNotFound(slug.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    /// Writes the record to a temp file and renames it over `job.json`.
    pub async fn save(&self, job: &Job) -> Result<(), WavesError> {
        check_slug(&job.slug)?;
        let dir = self.job_dir(&job.slug);
        let tmp = dir.join(format!("{JOB_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(job)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, dir.join(JOB_FILE)).await?;
        Ok(())
    }

    /// Deletes a job with its history and working files.
    pub async fn remove(&self, slug: &str) -> Result<(), WavesError> {
        check_slug(slug)?;
        match fs::remove_dir_all(self.job_dir(slug)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WavesError::JobNotFound(slug.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable job, oldest first. Unreadable records are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<Job>, WavesError> {
        let mut jobs = Vec::new();
        let mut entries = match fs::read_dir(self.jobs_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(jobs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let slug = entry.file_name().to_string_lossy().into_owned();
            match self.load(&slug).await {
                Ok(job) => jobs.push(job),
                Err(WavesError::JobNotFound(_)) => {}
                Err(e) => warn!(slug = %slug, error = %e, "skipping unreadable job record"),
            }
        }
        jobs.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.slug.cmp(&b.slug)));
        Ok(jobs)
    }

    /// Non-terminal jobs, oldest first.
    pub async fn pending(&self) -> Result<Vec<Job>, WavesError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .collect())
    }

    /// Finds a job by full slug or by a unique slug prefix.
    pub async fn resolve(&self, slug_or_prefix: &str) -> Result<Job, WavesError> {
        match self.load(slug_or_prefix).await {
            Err(WavesError::JobNotFound(_)) => {}
            other => return other,
        }
        let mut matches: Vec<Job> = self
            .list()
            .await?
            .into_iter()
            .filter(|j| j.slug.starts_with(slug_or_prefix))
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(WavesError::JobNotFound(slug_or_prefix.to_string())),
            n => Err(WavesError::Config(format!(
                "slug prefix '{slug_or_prefix}' is ambiguous ({n} jobs)"
            ))),
        }
    }

    pub async fn append_history(&self, slug: &str, entry: &HistoryEntry) -> Result<(), WavesError> {
        check_slug(slug)?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.job_dir(slug).join(HISTORY_FILE))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn history(&self, slug: &str) -> Result<Vec<HistoryEntry>, WavesError> {
        check_slug(slug)?;
        let contents = match fs::read_to_string(self.job_dir(slug).join(HISTORY_FILE)).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }

    pub async fn save_run_details(&self, job: &Job, details: &RunDetails) -> Result<(), WavesError> {
        let json = serde_json::to_vec_pretty(details)?;
        fs::write(job.working_dir.join(RUN_DETAILS_FILE), json).await?;
        Ok(())
    }

    /// Cached run details, if any were stored.
    pub async fn run_details(&self, job: &Job) -> Result<Option<RunDetails>, WavesError> {
        match fs::read_to_string(job.working_dir.join(RUN_DETAILS_FILE)).await {
            Ok(c) => Ok(Some(serde_json::from_str(&c)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
