//! Terminal output: job progress spinner and colored listings.

use std::collections::BTreeMap;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::adaptors::RunDetails;
use crate::state_machine::{HistoryEntry, Job, JobStatus, Transition};

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Terminated => Style::new().green().bold(),
        JobStatus::Error => Style::new().red().bold(),
        JobStatus::Cancelled => Style::new().magenta(),
        JobStatus::Running | JobStatus::Completed => Style::new().cyan(),
        JobStatus::Undefined | JobStatus::Suspended => Style::new().yellow(),
        _ => Style::new(),
    }
}

fn short(slug: &str) -> &str {
    &slug[..slug.len().min(8)]
}

/// Spinner following one job through the queue.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    pub fn start(job: &Job) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{}: {}", job.status, job.display_name()));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Reflects one dispatch: new status on the spinner, retries printed above it.
    pub fn step(&self, job: &Job, transition: &Transition) {
        match transition {
            Transition::Retry { attempt, reason, .. } => {
                self.pb.println(format!(
                    "  {} Retry {attempt}: {reason}",
                    self.yellow.apply_to("↻")
                ));
            }
            Transition::Next(status) => {
                self.pb.println(format!(
                    "  {} {}",
                    status_style(*status).apply_to(status),
                    job.message.as_deref().unwrap_or_default()
                ));
            }
            _ => {}
        }
        self.pb
            .set_message(format!("{}: {}", job.status, job.display_name()));
    }

    /// Stops the spinner when following the job broke off.
    pub fn abort(&self, reason: &str) {
        self.pb.finish_and_clear();
        println!("  {} {reason}", self.red.apply_to("✗"));
    }

    pub fn complete(&self, job: &Job) {
        self.pb.finish_and_clear();
        match job.status {
            JobStatus::Terminated => {
                println!("  {} Job finished", self.green.apply_to("✓"));
            }
            JobStatus::Cancelled => {
                println!("  {} Job cancelled", self.yellow.apply_to("⊘"));
            }
            _ => {
                println!(
                    "  {} Job failed: {}",
                    self.red.apply_to("✗"),
                    job.message.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
}

pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }
    let header = Style::new().bold();
    println!(
        "{}",
        header.apply_to(format!(
            "{:<10} {:<11} {:<12} {:<20} {}",
            "SLUG", "STATUS", "ADAPTOR", "UPDATED", "TITLE"
        ))
    );
    for job in jobs {
        // pad before styling, escape codes would break the alignment
        let status = format!("{:<11}", job.status.to_string());
        println!(
            "{:<10} {} {:<12} {:<20} {}",
            short(&job.slug),
            status_style(job.status).apply_to(status),
            job.adaptor,
            job.updated.format("%Y-%m-%d %H:%M:%S"),
            job.title.as_deref().unwrap_or("-")
        );
    }
}

pub fn print_job(job: &Job, history: &[HistoryEntry], details: Option<&RunDetails>) {
    let label = Style::new().bold();
    println!("{} {}", label.apply_to("Job:"), job.slug);
    if let Some(title) = &job.title {
        println!("{} {title}", label.apply_to("Title:"));
    }
    println!(
        "{} {} ({})",
        label.apply_to("Status:"),
        status_style(job.status).apply_to(job.status),
        job.status.label()
    );
    println!("{} {}", label.apply_to("Adaptor:"), job.adaptor);
    if let Some(id) = &job.remote_job_id {
        println!("{} {id}", label.apply_to("Remote id:"));
    }
    println!("{} {}", label.apply_to("Working dir:"), job.working_dir.display());
    if let Some(message) = &job.message {
        println!("{} {message}", label.apply_to("Message:"));
    }
    if job.nb_retry > 0 {
        println!("{} {}", label.apply_to("Retries:"), job.nb_retry);
    }
    if job.results_available {
        println!("{} {}", label.apply_to("Exit code:"), job.exit_code);
    }

    if let Some(d) = details {
        let fmt = |t: Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        println!();
        println!("{}", label.apply_to("Run details"));
        println!("  name:     {}", d.name);
        println!("  started:  {}", fmt(d.started));
        println!("  finished: {}", fmt(d.finished));
        if !d.hosts.is_empty() {
            println!("  hosts:    {}", d.hosts.join(", "));
        }
    }

    if !job.outputs.is_empty() {
        println!();
        println!("{}", label.apply_to("Outputs"));
        for output in &job.outputs {
            let path = output.file_path(&job.working_dir);
            let present = if path.exists() { "" } else { " (missing)" };
            println!("  {:<20} {}{present}", output.name, output.value);
        }
    }

    if !history.is_empty() {
        let dim = Style::new().dim();
        println!();
        println!("{}", label.apply_to("History"));
        for entry in history {
            let line = format!(
                "  {} {:<11} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.status.to_string(),
                entry.message.replace('\n', " | ")
            );
            if entry.is_admin {
                println!("{}", dim.apply_to(line));
            } else {
                println!("{line}");
            }
        }
    }
}

pub fn print_summary(counts: &BTreeMap<JobStatus, usize>) {
    if counts.is_empty() {
        println!("Queue is empty.");
        return;
    }
    for (status, count) in counts {
        let name = format!("{:<11}", status.to_string());
        println!("{} {count}", status_style(*status).apply_to(name));
    }
}
