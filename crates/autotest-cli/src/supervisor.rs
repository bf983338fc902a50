//! supervisord process management for the worker pool.

use autotest_core::{AutotestConfig, AutotestError};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

const SUPERVISORD: &str = "supervisord";
const STOP_WAIT: Duration = Duration::from_secs(10);

pub struct Supervisor {
    pub conf_file: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub worker_bin: PathBuf,
    /// Passed to every worker as `--config` when set
    pub config_path: Option<PathBuf>,
}

impl Supervisor {
    pub fn new(config: &AutotestConfig, worker_bin: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self {
            conf_file: config.workspace.join("supervisord.conf"),
            pid_file: config.workspace.join("supervisord.pid"),
            log_file: config.logs_dir().join("supervisord.log"),
            worker_bin,
            config_path,
        }
    }

    /// The worker binary installed next to the running executable, or the
    /// bare name for a PATH lookup.
    pub fn default_worker_bin() -> PathBuf {
        std::env::current_exe()
            .ok()
            .map(|exe| exe.with_file_name("autotest-worker"))
            .filter(|path| path.is_file())
            .unwrap_or_else(|| PathBuf::from("autotest-worker"))
    }

    pub fn render(&self, config: &AutotestConfig) -> String {
        let mut conf = String::new();
        let _ = write!(
            conf,
            "[supervisord]\npidfile={}\nlogfile={}\n\n\
             [supervisorctl]\n\n\
             [inet_http_server]\nport = {}\n\n\
             [rpcinterface:supervisor]\n\
             supervisor.rpcinterface_factory = supervisor.rpcinterface:make_main_rpcinterface\n\n",
            self.pid_file.display(),
            self.log_file.display(),
            config.supervisor_url
        );

        let config_arg = self
            .config_path
            .as_ref()
            .map(|p| format!(" --config {}", p.display()))
            .unwrap_or_default();
        for worker in &config.workers {
            let _ = write!(
                conf,
                "[program:autotest_worker_{user}]\n\
                 environment=WORKERUSER={user}\n\
                 command={bin}{config_arg} settings {queues}\n\
                 process_name=autotest_worker_{user}\n\
                 numprocs=1\n\
                 directory={dir}\n\
                 stopsignal=TERM\n\
                 autostart=true\n\
                 autorestart=true\n\
                 stopasgroup=true\n\
                 killasgroup=true\n\n",
                user = worker.user,
                bin = self.worker_bin.display(),
                config_arg = config_arg,
                queues = worker.queues.join(" "),
                dir = config.workspace.display(),
            );
        }
        conf
    }

    pub async fn start(&self, config: &AutotestConfig, extra_args: &[String]) -> Result<(), AutotestError> {
        std::fs::create_dir_all(config.logs_dir())?;
        std::fs::write(&self.conf_file, self.render(config))?;
        log::info!("Wrote {}", self.conf_file.display());

        let status = Command::new(SUPERVISORD)
            .arg("-c")
            .arg(&self.conf_file)
            .args(extra_args)
            .current_dir(&config.workspace)
            .status()
            .await
            .map_err(|e| AutotestError::CommandFailed(format!("could not run {}: {}", SUPERVISORD, e)))?;
        if !status.success() {
            return Err(AutotestError::CommandFailed(format!(
                "{} exited with {}",
                SUPERVISORD, status
            )));
        }
        Ok(())
    }

    /// Send SIGTERM to the running supervisord. Returns false when it was
    /// not running.
    pub fn stop(&self) -> Result<bool, AutotestError> {
        let Some(pid) = read_pid(&self.pid_file)? else {
            return Ok(false);
        };
        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                log::warn!("supervisord pid {} is not running", pid);
                return Ok(false);
            }
            return Err(AutotestError::CommandFailed(format!(
                "could not signal supervisord ({}): {}",
                pid, err
            )));
        }
        log::info!("Sent SIGTERM to supervisord ({})", pid);
        Ok(true)
    }

    /// Wait until the supervisord named in the pid file has exited.
    pub async fn wait_stopped(&self) -> Result<(), AutotestError> {
        let Some(pid) = read_pid(&self.pid_file)? else {
            return Ok(());
        };
        let deadline = tokio::time::Instant::now() + STOP_WAIT;
        // SAFETY: signal 0 only checks for existence.
        while unsafe { libc::kill(pid, 0) } == 0 {
            if tokio::time::Instant::now() >= deadline {
                return Err(AutotestError::CommandFailed(format!(
                    "supervisord ({}) did not stop within {:?}",
                    pid, STOP_WAIT
                )));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(())
    }
}

fn read_pid(path: &Path) -> Result<Option<libc::pid_t>, AutotestError> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    raw.trim()
        .parse::<libc::pid_t>()
        .map(Some)
        .map_err(|e| AutotestError::ParsingError(format!("bad pid file {}: {}", path.display(), e)))
}
