//! Resource limits applied to tester processes between fork and exec.
//!
//! Limits are computed in the worker before spawning so the child only has
//! to issue `setrlimit` calls.

use crate::errors::AutotestError;
use std::collections::BTreeMap;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

pub const RLIM_INFINITY: u64 = libc::RLIM_INFINITY as u64;

/// Headroom withheld from the tester's hard limit so cleanup commands run
/// by the worker user can still start.
pub const RLIMIT_ADJUSTMENTS: [(&str, u64); 1] = [("nproc", 10)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub soft: u64,
    pub hard: u64,
}

impl Rlimit {
    /// Convert a configured `(soft, hard)` pair; negative values are unlimited.
    pub fn from_config((soft, hard): (i64, i64)) -> Self {
        let convert = |v: i64| if v < 0 { RLIM_INFINITY } else { v as u64 };
        Self {
            soft: convert(soft),
            hard: convert(hard),
        }
    }
}

/// Merge a configured limit into the current one.
///
/// Limits only ever tighten, an unlimited value never replaces a finite one,
/// the adjustment comes off a finite hard limit when it fits, and the soft
/// limit never exceeds the hard limit.
pub fn merge_limit(current: Rlimit, configured: Option<Rlimit>, adjustment: u64) -> Rlimit {
    let configured = configured.unwrap_or(current);
    let soft = current.soft.min(configured.soft);
    let mut hard = current.hard.min(configured.hard);
    if hard != RLIM_INFINITY && hard >= adjustment {
        hard -= adjustment;
    }
    Rlimit {
        soft: soft.min(hard),
        hard,
    }
}

fn resource(name: &str) -> Option<Resource> {
    let resource = match name {
        "nproc" => libc::RLIMIT_NPROC,
        "cpu" => libc::RLIMIT_CPU,
        "fsize" => libc::RLIMIT_FSIZE,
        "data" => libc::RLIMIT_DATA,
        "stack" => libc::RLIMIT_STACK,
        "core" => libc::RLIMIT_CORE,
        "rss" => libc::RLIMIT_RSS,
        "nofile" => libc::RLIMIT_NOFILE,
        "as" => libc::RLIMIT_AS,
        "memlock" => libc::RLIMIT_MEMLOCK,
        _ => return None,
    };
    Some(resource)
}

fn current_limit(resource: Resource) -> Result<Rlimit, AutotestError> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(resource, &mut lim) } != 0 {
        return Err(AutotestError::ResourceError(format!(
            "getrlimit failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(Rlimit {
        soft: lim.rlim_cur as u64,
        hard: lim.rlim_max as u64,
    })
}

/// Limits to install in the next tester process.
#[derive(Debug, Clone, Default)]
pub struct RlimitPlan {
    limits: Vec<(Resource, Rlimit)>,
}

impl RlimitPlan {
    pub fn from_settings(settings: &BTreeMap<String, (i64, i64)>) -> Result<Self, AutotestError> {
        let mut names: Vec<&str> = settings.keys().map(String::as_str).collect();
        for (name, _) in RLIMIT_ADJUSTMENTS {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let mut limits = Vec::with_capacity(names.len());
        for name in names {
            let resource = resource(name).ok_or_else(|| {
                AutotestError::ConfigError(format!("unknown rlimit '{}'", name))
            })?;
            let adjustment = RLIMIT_ADJUSTMENTS
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, adj)| *adj)
                .unwrap_or(0);
            let configured = settings.get(name).copied().map(Rlimit::from_config);
            let limit = merge_limit(current_limit(resource)?, configured, adjustment);
            log::debug!("rlimit {}: soft={} hard={}", name, limit.soft, limit.hard);
            limits.push((resource, limit));
        }
        Ok(Self { limits })
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Install the limits in the calling process. Only async-signal-safe
    /// calls are made, so this may run in a `pre_exec` hook.
    pub fn apply(&self) -> std::io::Result<()> {
        for (resource, limit) in &self.limits {
            let lim = libc::rlimit {
                rlim_cur: limit.soft as libc::rlim_t,
                rlim_max: limit.hard as libc::rlim_t,
            };
            if unsafe { libc::setrlimit(*resource, &lim) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}
