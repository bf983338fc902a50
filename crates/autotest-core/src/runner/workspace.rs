//! Worker scratch directory preparation and cleanup.

use super::files::{chown_group, clear_dir, set_mode};
use crate::errors::AutotestError;
use crate::users;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Sticky, group-writable scratch root: `rwxrwx--T`.
pub const SCRATCH_MODE: u32 = 0o1770;

/// Create the scratch directory for `user` if missing and give it the
/// worker's group and the scratch mode.
pub fn prepare_scratch(scratch: &Path, user: &str) -> Result<(), AutotestError> {
    std::fs::create_dir_all(scratch)?;
    if let Some(workers_dir) = scratch.parent() {
        set_mode(workers_dir, 0o755)?;
    }
    match users::group_id(user) {
        Some(gid) => chown_group(scratch, gid)?,
        None => log::warn!("No group named {}, scratch group left unchanged", user),
    }
    set_mode(scratch, SCRATCH_MODE)?;
    if !scratch.is_dir() {
        return Err(AutotestError::ConfigError(format!(
            "No workspace directory for user: {}",
            user
        )));
    }
    Ok(())
}

/// Clears a scratch directory when dropped.
///
/// Cleanup kills the worker user's processes, makes every entry writable,
/// removes the contents (never the root) and sweeps the worker user's
/// leftovers out of the temporary directory.
pub struct ScratchGuard {
    scratch: PathBuf,
    run_as: Option<String>,
    tmp_sweep: Option<(PathBuf, u32)>,
    done: bool,
}

impl ScratchGuard {
    /// `run_as` is the worker user when it differs from the current user.
    pub fn new(scratch: PathBuf, run_as: Option<String>) -> Self {
        let tmp_sweep = run_as
            .as_deref()
            .and_then(users::user_id)
            .map(|uid| (std::env::temp_dir(), uid));
        Self {
            scratch,
            run_as,
            tmp_sweep,
            done: false,
        }
    }

    pub fn with_tmp_sweep(mut self, tmp_dir: PathBuf, uid: u32) -> Self {
        self.tmp_sweep = Some((tmp_dir, uid));
        self
    }

    pub fn path(&self) -> &Path {
        &self.scratch
    }

    pub fn cleanup(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        if let Some(user) = &self.run_as {
            run_quietly(sudo(user).arg("bash").arg("-c").arg("kill -KILL -1"));
        }

        let mut chmod = match &self.run_as {
            Some(user) => sudo(user),
            None => Command::new("chmod"),
        };
        if self.run_as.is_some() {
            chmod.arg("chmod");
        }
        run_quietly(chmod.arg("-Rf").arg("ugo+rwX").arg(&self.scratch));

        if let Err(e) = clear_dir(&self.scratch) {
            log::error!("Failed to clear {}: {}", self.scratch.display(), e);
        }

        if let Some((tmp_dir, uid)) = &self.tmp_sweep {
            // The temporary directory is sticky: only the owner may unlink.
            let swept = match &self.run_as {
                Some(user) => sweep_owned_as(user, tmp_dir, *uid),
                None => sweep_owned(tmp_dir, *uid).map(|_| ()),
            };
            if let Err(e) = swept {
                log::error!("Failed to sweep {}: {}", tmp_dir.display(), e);
            }
        }
        log::debug!("Cleared scratch {}", self.scratch.display());
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn sudo(user: &str) -> Command {
    let mut cmd = Command::new("sudo");
    cmd.arg("-u").arg(user).arg("--");
    cmd
}

fn run_quietly(cmd: &mut Command) {
    let result = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        log::warn!("Cleanup command {:?} failed: {}", cmd, e);
    }
}

/// `find` invocation, run as `user`, removing the top-level entries of `dir`
/// owned by `uid`.
pub fn sweep_command(user: &str, dir: &Path, uid: u32) -> Command {
    let mut cmd = sudo(user);
    cmd.arg("find")
        .arg(dir)
        .args(["-mindepth", "1", "-maxdepth", "1", "-uid"])
        .arg(uid.to_string())
        .args(["-exec", "rm", "-rf", "{}", "+"]);
    cmd
}

fn sweep_owned_as(user: &str, dir: &Path, uid: u32) -> Result<(), AutotestError> {
    let mut cmd = sweep_command(user, dir, uid);
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if !status.success() {
        return Err(AutotestError::CommandFailed(format!(
            "removing files of {} from {} exited with {}",
            user,
            dir.display(),
            status
        )));
    }
    Ok(())
}

/// Remove the top-level entries of `dir` owned by `uid`.
pub fn sweep_owned(dir: &Path, uid: u32) -> Result<usize, AutotestError> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(meta) = entry.path().symlink_metadata() else {
            continue;
        };
        if meta.uid() != uid {
            continue;
        }
        let path = entry.path();
        let result = if meta.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("Could not remove {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}
