mod adaptors;
mod cli;
mod config;
mod error;
mod notify;
mod runner;
mod state_machine;
mod store;
mod ui;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;

use adaptors::{AdaptorRegistry, redact};
use cli::{Cli, Command, QueueAction};
use config::WavesConfig;
use notify::Notifications;
use runner::{JobDefinition, Runner};
use store::JobStore;
use ui::JobProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let mut config = WavesConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(max) = cli.max_retries {
        config.queue.max_retry = max;
    }

    if let Command::Adaptors = cli.command {
        return list_adaptors(&config);
    }

    let store = JobStore::new(&config.data_root)
        .with_context(|| format!("opening data root {}", config.data_root.display()))?;
    let notifications =
        Notifications::from_config(&config.notify).context("configuring notifications")?;
    let registry = AdaptorRegistry::new(config.adaptors.clone());
    let runner = Runner::new(store, Box::new(registry), notifications, &config.queue)
        .with_purge(config.purge.clone());

    match cli.command {
        Command::Queue { action } => match action {
            QueueAction::Run => runner.run_forever().await,
            QueueAction::Once => {
                let n = runner.run_once().await?;
                println!("Processed {n} job(s).");
            }
            QueueAction::Status => ui::print_summary(&runner.summary().await?),
            QueueAction::Purge => {
                let removed = runner.purge(Utc::now()).await?;
                println!("Purged {} job(s).", removed.len());
            }
        },
        Command::Submit { file } => {
            let definition = JobDefinition::from_file(&file)
                .with_context(|| format!("reading job definition {}", file.display()))?;
            let base_dir = file.parent().unwrap_or(Path::new("."));
            let job = runner.submit(definition, base_dir).await?;
            println!("{}", job.slug);
        }
        Command::List { pending } => {
            let jobs = if pending {
                runner.store().pending().await?
            } else {
                runner.store().list().await?
            };
            ui::print_jobs(&jobs);
        }
        Command::Show { slug } => {
            let job = runner.store().resolve(&slug).await?;
            let history = runner.store().history(&job.slug).await?;
            let details = runner.store().run_details(&job).await?;
            ui::print_job(&job, &history, details.as_ref());
        }
        Command::Cancel { slug } => {
            let job = runner.cancel(&slug).await?;
            println!("{} {}", job.slug, job.status);
        }
        Command::Rerun { slug } => {
            let job = runner.rerun(&slug).await?;
            println!("{} {}", job.slug, job.status);
        }
        Command::Follow { slug } => {
            let job = runner.store().resolve(&slug).await?;
            let progress = JobProgress::start(&job);
            let result = runner
                .follow(&job.slug, |job, transition| progress.step(job, transition))
                .await;
            match result {
                Ok(job) => progress.complete(&job),
                Err(e) => {
                    progress.abort(&e.to_string());
                    return Err(e.into());
                }
            }
        }
        Command::Adaptors => {}
    }
    Ok(())
}

fn list_adaptors(config: &WavesConfig) -> Result<()> {
    if config.adaptors.is_empty() {
        println!("No adaptors configured.");
        return Ok(());
    }
    for (name, adaptor_config) in &config.adaptors {
        match adaptor_config.build() {
            Ok(adaptor) => println!("{name:<16} {}", adaptor.dump_config()),
            Err(e) => {
                let params: Vec<String> = adaptor_config
                    .params
                    .iter()
                    .map(|(k, v)| format!("{k}={}", redact(k, &v.to_string())))
                    .collect();
                println!(
                    "{name:<16} {} {} (invalid: {e})",
                    adaptor_config.kind,
                    params.join(" ")
                );
            }
        }
    }
    Ok(())
}

/// Info by default, debug with --verbose; RUST_LOG wins over both.
fn setup_logging(verbose: bool) -> Result<()> {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("setting tracing subscriber")
}
