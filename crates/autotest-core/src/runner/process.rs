//! Spawning tester subprocesses under a wall-clock timeout.

use super::env::EnvMap;
use super::rlimits::RlimitPlan;
use crate::errors::AutotestError;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;

/// Upper bound on reading leftover output once a timed out process was killed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: EnvMap,
    pub stdin: String,
    pub timeout: Option<Duration>,
    /// Run through `sudo -Eu <user> --` when set
    pub run_as: Option<String>,
    pub rlimits: RlimitPlan,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl Invocation {
    fn command(&self) -> Command {
        let mut cmd = match &self.run_as {
            Some(user) => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-Eu").arg(user).arg("--").arg(&self.program);
                cmd
            }
            None => Command::new(&self.program),
        };
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let rlimits = self.rlimits.clone();
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                rlimits.apply()
            });
        }
        cmd
    }
}

fn read_all<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            log::debug!("Error reading tester output: {}", e);
        }
        buf
    })
}

/// Collect the output of a reader task. Returns `None` when the pipe was
/// still held open at `deadline`.
async fn drain(mut handle: JoinHandle<Vec<u8>>, deadline: Option<TokioInstant>) -> Option<String> {
    let bytes = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                handle.abort();
                return None;
            }
        },
        None => handle.await.unwrap_or_default(),
    };
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Kill every process `user` is allowed to signal.
pub async fn kill_user_processes(user: &str) {
    let status = Command::new("sudo")
        .arg("-u")
        .arg(user)
        .arg("--")
        .arg("bash")
        .arg("-c")
        .arg("kill -KILL -1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        log::warn!("Could not kill processes of {}: {}", user, e);
    }
}

fn kill_group(pid: u32) {
    if unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) } != 0 {
        log::debug!(
            "killpg({}) failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

/// Kill whatever the tester left behind: its session for the current user,
/// every process of the worker user otherwise.
async fn kill_leftovers(invocation: &Invocation, pid: Option<u32>) {
    match (&invocation.run_as, pid) {
        (Some(user), _) => kill_user_processes(user).await,
        (None, Some(pid)) => kill_group(pid),
        (None, None) => {}
    }
}

/// Run the invocation to completion or until its timeout expires. The
/// timeout covers the tester and any process it started that keeps its
/// output open. The exit status is not inspected.
pub async fn run(invocation: &Invocation) -> Result<ProcessOutcome, AutotestError> {
    let start = Instant::now();
    let deadline = invocation.timeout.map(|limit| TokioInstant::now() + limit);
    let mut child = invocation.command().spawn().map_err(|e| {
        AutotestError::TestExecutionError(format!("could not start tester {}: {}", invocation.program, e))
    })?;

    let stdout = child
        .stdout
        .take()
        .map(read_all)
        .ok_or_else(|| AutotestError::InternalError("tester stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .map(read_all)
        .ok_or_else(|| AutotestError::InternalError("tester stderr not captured".to_string()))?;
    if let Some(mut stdin) = child.stdin.take() {
        let input = invocation.stdin.clone().into_bytes();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                log::debug!("Tester closed stdin early: {}", e);
            }
        });
    }

    let pid = child.id();
    let waited = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, child.wait()).await.ok(),
        None => Some(child.wait().await),
    };

    let mut timed_out = false;
    match waited {
        Some(status) => {
            let status = status?;
            log::debug!("Tester exited with {}", status);
        }
        None => {
            timed_out = true;
            if let Err(e) = child.start_kill() {
                log::debug!("Tester already gone: {}", e);
            }
        }
    }
    kill_leftovers(invocation, pid).await;
    if timed_out {
        child.wait().await?;
    }

    let drain_deadline = if timed_out {
        Some(TokioInstant::now() + DRAIN_TIMEOUT)
    } else {
        deadline
    };
    let stdout = drain(stdout, drain_deadline).await;
    let stderr = drain(stderr, drain_deadline).await;
    if stdout.is_none() || stderr.is_none() {
        log::warn!("Tester output was still open when its time ran out");
        kill_leftovers(invocation, pid).await;
        timed_out = true;
    }

    Ok(ProcessOutcome {
        stdout: stdout.unwrap_or_default(),
        stderr: stderr.unwrap_or_default(),
        timed_out,
        elapsed: start.elapsed(),
    })
}
