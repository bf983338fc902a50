//! Authenticated downloads of submission and instructor archives.

use crate::errors::AutotestError;
use crate::kv::{keys, KvStore};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::io::{Seek, SeekFrom};
use tokio::io::AsyncWriteExt;

/// Upstream credentials registered for an api key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub auth_type: String,
    pub credentials: String,
}

impl Credentials {
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.auth_type, self.credentials)
    }
}

pub async fn load_credentials(kv: &dyn KvStore, api_key: &str) -> Result<Credentials, AutotestError> {
    let raw = kv
        .hget(keys::USER_CREDENTIALS, api_key)
        .await?
        .ok_or_else(|| AutotestError::AuthError("no credentials registered".to_string()))?;
    Ok(serde_json::from_str(&raw)?)
}

/// Download `url` into an anonymous temporary file positioned at its start.
pub async fn download(
    client: &reqwest::Client,
    url: &str,
    credentials: &Credentials,
) -> Result<std::fs::File, AutotestError> {
    log::debug!("Downloading {}", url);
    let response = client
        .get(url)
        .header(reqwest::header::AUTHORIZATION, credentials.authorization_header())
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(AutotestError::FetchError(format!(
            "HTTP {} from {}",
            response.status(),
            url
        )));
    }

    let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
    let mut stream = response.bytes_stream();
    let mut size = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size += chunk.len();
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    log::debug!("Downloaded {} bytes from {}", size, url);

    let mut file = file.into_std().await;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}
