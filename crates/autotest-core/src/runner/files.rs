//! Filesystem helpers for materializing submissions and instructor files.

use crate::errors::AutotestError;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{Read, Seek};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

/// Extract a zip archive into `destination`, dropping the first
/// `strip_components` path components of every entry. Entries at or above
/// the stripped depth are skipped, as are entries escaping the destination.
pub fn extract_zip<R: Read + Seek>(
    reader: R,
    destination: &Path,
    strip_components: usize,
) -> Result<usize, AutotestError> {
    let mut archive = ZipArchive::new(reader)?;
    let mut extracted = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(name) = entry.enclosed_name() else {
            log::warn!("Skipping unsafe archive entry '{}'", entry.name());
            continue;
        };
        let relative: PathBuf = name
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .skip(strip_components)
            .collect();
        if relative.as_os_str().is_empty() {
            continue;
        }
        let outpath = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)?;
            std::io::copy(&mut entry, &mut outfile)?;
            extracted += 1;
        }
    }

    Ok(extracted)
}

/// Breadth-first listing of everything below `root`, excluding `root`.
pub fn walk(root: &Path) -> Result<Vec<(EntryKind, PathBuf)>, AutotestError> {
    if !root.is_dir() {
        return Err(AutotestError::IoError(format!(
            "directory does not exist: {}",
            root.display()
        )));
    }
    let mut entries = Vec::new();
    let mut pending = VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = pending.pop_front() {
        let mut children: Vec<_> = fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
        children.sort_by_key(|c| c.file_name());
        for child in children {
            let path = child.path();
            if child.file_type()?.is_dir() {
                entries.push((EntryKind::Dir, path.clone()));
                pending.push_back(path);
            } else {
                entries.push((EntryKind::File, path));
            }
        }
    }
    Ok(entries)
}

/// Recursively copy `src` into `dst`, overwriting existing files. Returns
/// each copied entry's destination path with whether the source was
/// executable.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<Vec<(EntryKind, PathBuf, bool)>, AutotestError> {
    let mut copied = Vec::new();
    for (kind, path) in walk(src)? {
        let relative = path
            .strip_prefix(src)
            .map_err(|e| AutotestError::InternalError(e.to_string()))?;
        let target = dst.join(relative);
        match kind {
            EntryKind::Dir => {
                fs::create_dir_all(&target)?;
                copied.push((kind, target, true));
            }
            EntryKind::File => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&path, &target)?;
                let executable = fs::metadata(&path)?.permissions().mode() & 0o111 != 0;
                copied.push((kind, target, executable));
            }
        }
    }
    Ok(copied)
}

pub fn set_mode(path: &Path, mode: u32) -> Result<(), AutotestError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Change the group of `path`, leaving the owner alone.
pub fn chown_group(path: &Path, gid: u32) -> Result<(), AutotestError> {
    std::os::unix::fs::chown(path, None, Some(gid)).map_err(|e| {
        AutotestError::IoError(format!("chown {} to gid {}: {}", path.display(), gid, e))
    })
}

/// Remove everything inside `dir` but keep `dir` itself.
pub fn clear_dir(dir: &Path) -> Result<(), AutotestError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// A best-effort mime type from the file extension.
pub fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("md") => "text/markdown",
        Some("xml") => "text/xml",
        Some("py") => "text/x-python",
        Some("java") => "text/x-java",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("ipynb") => "application/x-ipynb+json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "text/plain",
    }
}
