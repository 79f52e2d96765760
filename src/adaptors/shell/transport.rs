use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::adaptors::{InitParams, redact};
use crate::error::AdaptorError;

/// Exit status and captured streams of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout of a successful command; an execution error otherwise.
    pub fn check(self, what: &str) -> Result<String, AdaptorError> {
        if self.success() {
            Ok(self.stdout)
        } else {
            let code = self.code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            Err(AdaptorError::Exec(format!(
                "{what} failed ({code}): {}",
                self.stderr.trim()
            )))
        }
    }
}

/// Where job scripts run: the runner host or a remote one.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn describe(&self) -> String;

    /// Directory holding the job files on the execution host.
    fn job_dir(&self, slug: &str, working_dir: &Path) -> PathBuf;

    async fn open(&mut self) -> Result<(), AdaptorError>;

    async fn close(&mut self) -> Result<(), AdaptorError>;

    /// Feeds `script` to `sh -s` on the execution host.
    async fn exec(&self, script: &str) -> Result<CommandOutput, AdaptorError>;

    async fn put(&self, local: &Path, remote: &Path) -> Result<(), AdaptorError>;

    async fn get(&self, remote: &Path, local: &Path) -> Result<(), AdaptorError>;
}

async fn run_with_stdin(mut cmd: Command, input: &str) -> Result<CommandOutput, AdaptorError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| AdaptorError::Connect(format!("cannot spawn shell: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).await?;
        stdin.shutdown().await?;
    }
    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs scripts on the runner host; job files stay in the job working dir.
#[derive(Debug, Default)]
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    fn describe(&self) -> String {
        "localhost".to_string()
    }

    fn job_dir(&self, _slug: &str, working_dir: &Path) -> PathBuf {
        working_dir.to_path_buf()
    }

    async fn open(&mut self) -> Result<(), AdaptorError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AdaptorError> {
        Ok(())
    }

    async fn exec(&self, script: &str) -> Result<CommandOutput, AdaptorError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-s");
        run_with_stdin(cmd, script).await
    }

    async fn put(&self, local: &Path, remote: &Path) -> Result<(), AdaptorError> {
        if local != remote {
            tokio::fs::copy(local, remote).await?;
        }
        Ok(())
    }

    async fn get(&self, remote: &Path, local: &Path) -> Result<(), AdaptorError> {
        if local != remote {
            tokio::fs::copy(remote, local).await?;
        }
        Ok(())
    }
}

/// Runs scripts through the OpenSSH client, sharing one control master
/// connection between connect and disconnect.
#[derive(Debug)]
pub struct SshTransport {
    host: String,
    user_id: String,
    port: u16,
    basedir: String,
    private_key: Option<String>,
    user_pass: Option<String>,
    connect_timeout: u64,
    control_dir: Option<tempfile::TempDir>,
}

impl SshTransport {
    pub fn from_params(params: &mut InitParams) -> Result<Self, AdaptorError> {
        Ok(Self {
            host: params.required("host")?,
            user_id: params.required("user_id")?,
            port: params.parse_or("port", 22)?,
            basedir: params.or("basedir", "/tmp"),
            private_key: params.optional("private_key"),
            user_pass: params.optional("user_pass"),
            connect_timeout: params.parse_or("connect_timeout", 10)?,
            control_dir: None,
        })
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user_id, self.host)
    }

    fn common_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(dir) = &self.control_dir {
            opts.push("-o".to_string());
            opts.push(format!("ControlPath={}", dir.path().join("cm").display()));
        }
        match (&self.private_key, &self.user_pass) {
            (Some(key), _) => {
                opts.push("-i".to_string());
                opts.push(key.clone());
                opts.push("-o".to_string());
                opts.push("BatchMode=yes".to_string());
            }
            (None, Some(_)) => {}
            (None, None) => {
                opts.push("-o".to_string());
                opts.push("BatchMode=yes".to_string());
            }
        }
        opts
    }

    /// `ssh` or `scp`, prefixed by `sshpass -e` when a password is configured.
    fn command(&self, program: &str) -> Command {
        match &self.user_pass {
            Some(pass) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(program).env("SSHPASS", pass);
                cmd
            }
            None => Command::new(program),
        }
    }

    fn ssh(&self) -> Command {
        let mut cmd = self.command("ssh");
        cmd.args(self.common_options())
            .arg("-p")
            .arg(self.port.to_string());
        cmd
    }

    async fn scp(&self, from: &str, to: &str) -> Result<(), AdaptorError> {
        let mut cmd = self.command("scp");
        cmd.args(self.common_options())
            .arg("-q")
            .arg("-P")
            .arg(self.port.to_string())
            .arg(from)
            .arg(to)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = cmd
            .output()
            .await
            .map_err(|e| AdaptorError::Connect(format!("cannot spawn scp: {e}")))?;
        CommandOutput {
            code: output.status.code(),
            stdout: String::new(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .check("scp")?;
        Ok(())
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn describe(&self) -> String {
        let auth = match (&self.private_key, &self.user_pass) {
            (Some(key), _) => format!("private_key={key}"),
            (None, Some(pass)) => format!("user_pass={}", redact("user_pass", pass)),
            (None, None) => "agent".to_string(),
        };
        format!(
            "{}:{} basedir={} {auth}",
            self.destination(),
            self.port,
            self.basedir
        )
    }

    fn job_dir(&self, slug: &str, _working_dir: &Path) -> PathBuf {
        Path::new(&self.basedir).join(slug)
    }

    async fn open(&mut self) -> Result<(), AdaptorError> {
        let dir = tempfile::Builder::new().prefix("waves-ssh").tempdir()?;
        self.control_dir = Some(dir);

        let mut cmd = self.ssh();
        cmd.args(["-o", "ControlMaster=auto", "-o", "ControlPersist=60"])
            .arg(self.destination())
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.connect_timeout.saturating_add(5));
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => {
                result.map_err(|e| AdaptorError::Connect(format!("cannot spawn ssh: {e}")))?
            }
            Err(_) => {
                self.control_dir = None;
                return Err(AdaptorError::Connect(format!(
                    "timed out connecting to {}",
                    self.destination()
                )));
            }
        };
        if !output.status.success() {
            self.control_dir = None;
            return Err(AdaptorError::Connect(format!(
                "{}: {}",
                self.destination(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(host = %self.host, "ssh control master opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AdaptorError> {
        if self.control_dir.is_none() {
            return Ok(());
        }
        let mut cmd = self.ssh();
        cmd.args(["-O", "exit"])
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Err(e) = cmd.status().await {
            warn!(host = %self.host, error = %e, "failed to stop ssh control master");
        }
        self.control_dir = None;
        Ok(())
    }

    async fn exec(&self, script: &str) -> Result<CommandOutput, AdaptorError> {
        let mut cmd = self.ssh();
        cmd.arg(self.destination()).arg("sh -s");
        let output = run_with_stdin(cmd, script).await?;
        // ssh reserves 255 for its own failures
        if output.code == Some(255) {
            return Err(AdaptorError::Connect(format!(
                "{}: {}",
                self.destination(),
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn put(&self, local: &Path, remote: &Path) -> Result<(), AdaptorError> {
        let to = format!("{}:{}", self.destination(), remote.display());
        self.scp(&local.display().to_string(), &to).await
    }

    async fn get(&self, remote: &Path, local: &Path) -> Result<(), AdaptorError> {
        let from = format!("{}:{}", self.destination(), remote.display());
        self.scp(&from, &local.display().to_string()).await
    }
}
