//! Job wrapper script and the marker files it leaves behind.
//!
//! The wrapper runs the adaptor command with the job arguments, redirects its
//! streams to `job.stdout`/`job.stderr` and records start time, finish time
//! and exit code in dot-files next to them. Status checks only read those
//! markers, so they work the same for a forked process and a cluster job.

use chrono::{DateTime, Utc};

use crate::state_machine::{STDERR_FILE, STDOUT_FILE};

pub const SCRIPT_FILE: &str = "job.sh";
pub const STARTED_MARKER: &str = ".waves_started";
pub const FINISHED_MARKER: &str = ".waves_finished";
pub const EXIT_CODE_MARKER: &str = ".waves_exit_code";
pub const CANCELLED_MARKER: &str = ".waves_cancelled";
pub const PID_FILE: &str = ".waves_pid";
pub const HOST_MARKER: &str = ".waves_host";

/// Single-quotes `value` for POSIX sh.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The wrapper script. `command` is inserted verbatim, arguments are quoted.
///
/// The script expects to be started from the job directory.
pub fn job_script(command: &str, args: &[String]) -> String {
    let mut line = command.trim().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&quote(arg));
    }
    format!(
        "#!/bin/sh\n\
         hostname > {HOST_MARKER} 2> /dev/null\n\
         date -u +%Y-%m-%dT%H:%M:%SZ > {STARTED_MARKER}\n\
         {line} > {STDOUT_FILE} 2> {STDERR_FILE}\n\
         code=$?\n\
         echo \"$code\" > {EXIT_CODE_MARKER}.tmp && mv {EXIT_CODE_MARKER}.tmp {EXIT_CODE_MARKER}\n\
         date -u +%Y-%m-%dT%H:%M:%SZ > {FINISHED_MARKER}\n\
         exit \"$code\"\n"
    )
}

/// Starts the wrapper detached from the calling shell and prints its PID.
pub fn launch_script(dir: &str) -> String {
    format!(
        "cd {dir} || exit 1\n\
         rm -f {STARTED_MARKER} {FINISHED_MARKER} {EXIT_CODE_MARKER} {CANCELLED_MARKER} {HOST_MARKER}\n\
         nohup sh {SCRIPT_FILE} < /dev/null > /dev/null 2>&1 &\n\
         echo $! > {PID_FILE}\n\
         echo $!\n",
        dir = quote(dir)
    )
}

/// Reports the process state and the markers as `key=value` lines.
///
/// Liveness is checked before any marker is read: a wrapper seen dead has
/// already written its exit code.
pub fn probe_script(dir: &str) -> String {
    format!(
        "cd {dir} 2> /dev/null || {{ echo missing=1; exit 0; }}\n\
         if [ -f {PID_FILE} ]; then\n\
         \x20 echo launched=1\n\
         \x20 pid=$(cat {PID_FILE})\n\
         \x20 if kill -0 \"$pid\" 2> /dev/null; then\n\
         \x20   echo alive=1\n\
         \x20   echo \"stat=$(ps -o stat= -p \"$pid\" 2> /dev/null)\"\n\
         \x20 fi\n\
         fi\n\
         [ -f {HOST_MARKER} ] && echo \"host=$(cat {HOST_MARKER})\"\n\
         [ -f {CANCELLED_MARKER} ] && echo cancelled=1\n\
         [ -f {EXIT_CODE_MARKER} ] && echo \"exit_code=$(cat {EXIT_CODE_MARKER})\"\n\
         [ -f {STARTED_MARKER} ] && echo \"started=$(cat {STARTED_MARKER})\"\n\
         [ -f {FINISHED_MARKER} ] && echo \"finished=$(cat {FINISHED_MARKER})\"\n\
         exit 0\n",
        dir = quote(dir)
    )
}

/// Marks the job cancelled and terminates the wrapper with its children.
pub fn kill_script(dir: &str, pid: Option<&str>) -> String {
    let mut script = format!(
        "cd {dir} 2> /dev/null || exit 0\ntouch {CANCELLED_MARKER}\n",
        dir = quote(dir)
    );
    if let Some(pid) = pid {
        let pid = quote(pid);
        script.push_str(&format!(
            "pkill -TERM -P {pid} 2> /dev/null\nkill -TERM {pid} 2> /dev/null\n"
        ));
    }
    script.push_str("exit 0\n");
    script
}

/// Prints which of `files` exist in `dir`, one per line.
pub fn existing_files_script(dir: &str, files: &[&str]) -> String {
    let list: Vec<String> = files.iter().map(|f| quote(f)).collect();
    format!(
        "cd {dir} 2> /dev/null || exit 0\n\
         for f in {}; do [ -f \"$f\" ] && echo \"$f\"; done\n\
         exit 0\n",
        list.join(" "),
        dir = quote(dir)
    )
}

/// Parsed output of [`probe_script`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Probe {
    pub missing: bool,
    pub host: Option<String>,
    pub cancelled: bool,
    pub launched: bool,
    pub alive: bool,
    pub stat: Option<String>,
    pub exit_code: Option<i32>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

impl Probe {
    pub fn parse(output: &str) -> Self {
        let mut probe = Probe::default();
        for line in output.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "missing" => probe.missing = true,
                "host" if !value.is_empty() => probe.host = Some(value.to_string()),
                "cancelled" => probe.cancelled = true,
                "launched" => probe.launched = true,
                "alive" => probe.alive = true,
                "stat" if !value.is_empty() => probe.stat = Some(value.to_string()),
                "exit_code" => probe.exit_code = value.parse().ok(),
                "started" => probe.started = parse_timestamp(value),
                "finished" => probe.finished = parse_timestamp(value),
                _ => {}
            }
        }
        probe
    }

    /// A stopped process shows `T` in its `ps` state.
    pub fn is_stopped(&self) -> bool {
        self.stat.as_deref().is_some_and(|s| s.starts_with('T'))
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
