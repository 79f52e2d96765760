//! Back-ends that run a wrapper shell script, on this host or over SSH,
//! either as a detached process or through an SGE queue.

mod fork;
mod script;
mod sge;
mod transport;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub use fork::ForkAdaptor;
pub use sge::SgeAdaptor;
use transport::Transport;

use crate::adaptors::RunDetails;
use crate::error::AdaptorError;
use crate::state_machine::Job;
use script::{Probe, SCRIPT_FILE};

/// Whether `name` clashes with the wrapper script or its marker files.
pub fn is_reserved_name(name: &str) -> bool {
    name == SCRIPT_FILE || name.starts_with(".waves_")
}

fn dir_arg(dir: &Path) -> String {
    dir.display().to_string()
}

/// Writes the wrapper into the working dir and stages it with the input
/// files in the execution directory.
async fn stage_job(
    transport: &dyn Transport,
    command: &str,
    job: &Job,
) -> Result<PathBuf, AdaptorError> {
    let args = job
        .command_args()
        .map_err(|e| AdaptorError::Input(e.to_string()))?;
    let remote_dir = transport.job_dir(&job.slug, &job.working_dir);

    tokio::fs::create_dir_all(&job.working_dir).await?;
    let local_script = job.working_dir.join(SCRIPT_FILE);
    tokio::fs::write(&local_script, script::job_script(command, &args)).await?;

    transport
        .exec(&format!("mkdir -p {}\n", script::quote(&dir_arg(&remote_dir))))
        .await?
        .check("mkdir")?;
    transport
        .put(&local_script, &remote_dir.join(SCRIPT_FILE))
        .await?;
    for input in job.input_files() {
        if let Some(local) = input.file_path(&job.working_dir) {
            let Some(name) = local.file_name() else {
                continue;
            };
            transport.put(&local, &remote_dir.join(name)).await?;
        }
    }
    debug!(slug = %job.slug, dir = %remote_dir.display(), "job staged");
    Ok(remote_dir)
}

async fn probe(transport: &dyn Transport, job: &Job) -> Result<Probe, AdaptorError> {
    let dir = transport.job_dir(&job.slug, &job.working_dir);
    let out = transport
        .exec(&script::probe_script(&dir_arg(&dir)))
        .await?
        .check("status probe")?;
    Ok(Probe::parse(&out))
}

/// Copies the declared outputs back into the working dir and reads the exit code.
async fn collect_results(transport: &dyn Transport, job: &mut Job) -> Result<bool, AdaptorError> {
    let probe = probe(transport, job).await?;
    let Some(exit_code) = probe.exit_code else {
        return Err(AdaptorError::Job(format!(
            "no exit code recorded for job {}",
            job.slug
        )));
    };
    job.exit_code = exit_code;

    let dir = transport.job_dir(&job.slug, &job.working_dir);
    let names: Vec<&str> = job.outputs.iter().map(|o| o.value.as_str()).collect();
    let listing = transport
        .exec(&script::existing_files_script(&dir_arg(&dir), &names))
        .await?
        .check("output listing")?;
    let present: Vec<&str> = listing.lines().map(str::trim).collect();

    for output in &job.outputs {
        if present.contains(&output.value.as_str()) {
            transport
                .get(&dir.join(&output.value), &output.file_path(&job.working_dir))
                .await?;
        } else if !output.optional {
            warn!(slug = %job.slug, output = %output.value, "expected output is missing");
        }
    }
    Ok(true)
}

async fn marker_details(transport: &dyn Transport, job: &Job) -> Result<RunDetails, AdaptorError> {
    let probe = probe(transport, job).await?;
    let mut details = RunDetails::defaults(job);
    details.started = probe.started;
    details.finished = probe.finished.or(details.finished);
    if let Some(code) = probe.exit_code {
        details.exit_code = code;
    }
    details.hosts = probe.host.into_iter().collect();
    Ok(details)
}
