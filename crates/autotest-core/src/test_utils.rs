//! Shared fixtures for unit tests.

use crate::config::{AutotestConfig, WorkerConfig};
use crate::kv::{keys, KvStore};
use axum::{routing::get, Router};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;

/// Build a zip archive; entries with no content are directories.
pub fn zip_bytes(entries: &[(&str, Option<&str>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        match content {
            Some(content) => {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            None => writer.add_directory(*name, SimpleFileOptions::default()).unwrap(),
        }
    }
    writer.finish().unwrap().into_inner()
}

/// Serve each `(path, body)` pair from an ephemeral local port and return
/// the base URL.
pub async fn serve_files(files: Vec<(&'static str, Vec<u8>)>) -> String {
    let mut router = Router::new();
    for (path, body) in files {
        router = router.route(
            path,
            get(move || {
                let body = body.clone();
                async move { body }
            }),
        );
    }
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Configuration rooted at `workspace` with the current user as sole worker.
pub fn test_config(workspace: &Path) -> AutotestConfig {
    let user = crate::users::current_user().unwrap();
    AutotestConfig {
        workspace: workspace.join("workspace"),
        testers_dir: workspace.join("testers"),
        rlimit_settings: BTreeMap::new(),
        workers: vec![WorkerConfig {
            user,
            queues: vec!["high".to_string(), "low".to_string(), "batch".to_string()],
            resources: None,
        }],
        ..AutotestConfig::default()
    }
}

pub async fn register(kv: &dyn KvStore, api_key: &str) {
    kv.hset(
        keys::USER_CREDENTIALS,
        api_key,
        r#"{"auth_type":"Bearer","credentials":"token"}"#,
    )
    .await
    .unwrap();
}
