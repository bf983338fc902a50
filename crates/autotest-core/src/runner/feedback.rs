use super::files::guess_mime_type;
use crate::errors::AutotestError;
use crate::kv::{keys, KvStore};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub filename: String,
    pub mime_type: String,
    pub compression: String,
    pub id: i64,
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, AutotestError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Resolve a declared feedback file name to a regular file inside `scratch`.
/// Absolute names, `..` segments and symlinks are refused.
pub fn resolve_feedback_path(scratch: &Path, name: &str) -> Result<PathBuf, AutotestError> {
    let relative = Path::new(name);
    if name.is_empty()
        || !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(AutotestError::TestExecutionError(format!(
            "Feedback file name '{}' must be a relative path inside the working directory.",
            name
        )));
    }

    let path = scratch.join(relative);
    let metadata = match std::fs::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(_) => {
            return Err(AutotestError::TestExecutionError(format!(
                "Cannot find feedback file at '{}'.",
                path.display()
            )))
        }
    };
    if metadata.file_type().is_symlink() {
        return Err(AutotestError::TestExecutionError(format!(
            "Feedback file '{}' is a symbolic link.",
            name
        )));
    }
    if !metadata.is_file() {
        return Err(AutotestError::TestExecutionError(format!(
            "Cannot find feedback file at '{}'.",
            path.display()
        )));
    }

    let root = std::fs::canonicalize(scratch)?;
    let resolved = std::fs::canonicalize(&path)?;
    if !resolved.starts_with(&root) {
        return Err(AutotestError::TestExecutionError(format!(
            "Feedback file '{}' is outside the working directory.",
            name
        )));
    }
    Ok(resolved)
}

async fn read_no_follow(path: &Path) -> Result<Vec<u8>, AutotestError> {
    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .await?;
    let mut content = Vec::new();
    file.read_to_end(&mut content).await?;
    Ok(content)
}

/// Store each declared feedback file found in `scratch` as a gzipped blob
/// with a TTL. A declared file missing from the scratch is an error.
pub async fn collect_feedback(
    kv: &dyn KvStore,
    scratch: &Path,
    file_names: &[String],
    test_id: i64,
    ttl: u64,
) -> Result<Vec<FeedbackRecord>, AutotestError> {
    let mut feedback = Vec::with_capacity(file_names.len());
    for name in file_names {
        let path = resolve_feedback_path(scratch, name)?;
        let content = read_no_follow(&path).await?;
        let id = kv.incr(keys::FEEDBACK_FILES_ID).await?;
        kv.set(&keys::feedback_file(test_id, id), &gzip(&content)?, Some(ttl))
            .await?;
        feedback.push(FeedbackRecord {
            filename: name.clone(),
            mime_type: guess_mime_type(&path).to_string(),
            compression: "gzip".to_string(),
            id,
        });
    }
    Ok(feedback)
}
