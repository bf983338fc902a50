//! Lookups against the system user and group databases.

use crate::errors::AutotestError;
use std::ffi::{CStr, CString};

pub fn current_uid() -> u32 {
    unsafe { libc::geteuid() }
}

pub fn current_user() -> Result<String, AutotestError> {
    let uid = current_uid();
    user_name(uid)
        .ok_or_else(|| AutotestError::InternalError(format!("no passwd entry for uid {}", uid)))
}

pub fn user_name(uid: u32) -> Option<String> {
    unsafe {
        let pw = libc::getpwuid(uid);
        if pw.is_null() {
            return None;
        }
        CStr::from_ptr((*pw).pw_name).to_str().ok().map(str::to_string)
    }
}

pub fn user_id(name: &str) -> Option<u32> {
    let name = CString::new(name).ok()?;
    unsafe {
        let pw = libc::getpwnam(name.as_ptr());
        if pw.is_null() {
            None
        } else {
            Some((*pw).pw_uid)
        }
    }
}

/// Primary group of `name`.
pub fn primary_gid(name: &str) -> Option<u32> {
    let name = CString::new(name).ok()?;
    unsafe {
        let pw = libc::getpwnam(name.as_ptr());
        if pw.is_null() {
            None
        } else {
            Some((*pw).pw_gid)
        }
    }
}

pub fn group_id(name: &str) -> Option<u32> {
    let name = CString::new(name).ok()?;
    unsafe {
        let gr = libc::getgrnam(name.as_ptr());
        if gr.is_null() {
            None
        } else {
            Some((*gr).gr_gid)
        }
    }
}

/// Supplementary members listed for group `name`.
pub fn group_members(name: &str) -> Vec<String> {
    let Ok(name) = CString::new(name) else {
        return Vec::new();
    };
    let mut members = Vec::new();
    unsafe {
        let gr = libc::getgrnam(name.as_ptr());
        if gr.is_null() {
            return members;
        }
        let mut member = (*gr).gr_mem;
        while !member.is_null() && !(*member).is_null() {
            if let Ok(m) = CStr::from_ptr(*member).to_str() {
                members.push(m.to_string());
            }
            member = member.add(1);
        }
    }
    members
}

/// Whether `user` belongs to `group`, either as primary or supplementary group.
pub fn user_in_group(user: &str, group: &str) -> bool {
    let Some(gid) = group_id(group) else {
        return false;
    };
    primary_gid(user) == Some(gid) || group_members(group).iter().any(|m| m == user)
}

/// The group id named after a worker user, used for its scratch files.
pub fn worker_gid(user: &str) -> Result<u32, AutotestError> {
    group_id(user).ok_or_else(|| AutotestError::ConfigError(format!("no group named '{}'", user)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_user_roundtrip() {
        let name = current_user().unwrap();
        assert_eq!(user_id(&name), Some(current_uid()));
    }

    #[test]
    fn test_unknown_names() {
        assert_eq!(user_id("no-such-user-autotest"), None);
        assert_eq!(group_id("no-such-group-autotest"), None);
        assert!(group_members("no-such-group-autotest").is_empty());
        assert!(!user_in_group("no-such-user-autotest", "root"));
        assert!(user_id("bad\0name").is_none());
    }

    #[test]
    fn test_root_is_uid_zero() {
        assert_eq!(user_id("root"), Some(0));
        assert_eq!(user_name(0).as_deref(), Some("root"));
    }
}
