use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, warn, Logger};
use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
};
use tokio::{runtime::Handle, task::JoinHandle};

use crate::{build_client, write_atomic, DataLayout, MirrorFile, Settings, WeatherError};

const GITHUB_API_URL: &str = "https://api.github.com";

#[derive(thiserror::Error, Debug)]
pub enum MirrorError {
    #[error("Failed to access local file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to send request: {0}")]
    Request(#[from] reqwest_middleware::Error),
    #[error("Failed to read response: {0}")]
    Client(#[from] reqwest::Error),
    #[error("Failed to build http client: {0}")]
    Setup(#[from] WeatherError),
    #[error("Failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to decode file content: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("Remote store responded with {code}: {body}")]
    Status { code: u16, body: String },
}

/// A remote content store artifacts are copied to and from.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), MirrorError>;
    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<(), MirrorError>;
}

/// Pushes files somewhere durable without making the caller wait.
pub trait ArtifactMirror: Send + Sync {
    fn mirror(&self, files: Vec<MirrorFile>);
}

/// GitHub contents API backed store.
pub struct GithubStore {
    client: ClientWithMiddleware,
    token: String,
    repo: String,
    logger: Logger,
}

#[derive(Deserialize)]
struct ContentEntry {
    sha: String,
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct ContentUpdate<'a> {
    message: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

impl GithubStore {
    pub fn new(token: String, repo: String, logger: Logger) -> Result<Self, MirrorError> {
        Ok(Self {
            client: build_client("aqi_forecast_app")?,
            token,
            repo,
            logger,
        })
    }

    fn contents_url(&self, remote_path: &str) -> String {
        format!("{}/repos/{}/contents/{}", GITHUB_API_URL, self.repo, remote_path)
    }

    async fn lookup(&self, remote_path: &str) -> Result<Option<ContentEntry>, MirrorError> {
        let response = self
            .client
            .get(self.contents_url(remote_path))
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(MirrorError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(Some(serde_json::from_str(&body)?))
    }
}

#[async_trait]
impl RemoteStore for GithubStore {
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), MirrorError> {
        let bytes = fs::read(local_path)?;
        let existing = self.lookup(remote_path).await?;
        let update = ContentUpdate {
            message: format!("Update {}", remote_path),
            content: STANDARD.encode(bytes),
            sha: existing.as_ref().map(|entry| entry.sha.as_str()),
        };
        let response = self
            .client
            .put(self.contents_url(remote_path))
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("Content-Type", "application/json")
            .body(serde_json::to_vec(&update)?)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(MirrorError::Status {
                code: status.as_u16(),
                body,
            });
        }
        debug!(self.logger, "uploaded {} to {}", local_path.display(), remote_path);
        Ok(())
    }

    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<(), MirrorError> {
        let entry = self
            .lookup(remote_path)
            .await?
            .ok_or_else(|| MirrorError::Status {
                code: 404,
                body: format!("{} not found", remote_path),
            })?;
        let bytes = decode_content(&entry.content)?;
        write_atomic(local_path, &bytes)?;
        debug!(self.logger, "downloaded {} to {}", remote_path, local_path.display());
        Ok(())
    }
}

/// The contents API wraps base64 payloads at 60 columns.
pub fn decode_content(content: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact)
}

/// Fire-and-forget uploads spawned on the tokio runtime the mirror was built in.
pub struct Mirror {
    store: Option<Arc<dyn RemoteStore>>,
    runtime: Option<Handle>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    logger: Logger,
}

impl Mirror {
    pub fn new(store: Option<Arc<dyn RemoteStore>>, logger: Logger) -> Self {
        Self {
            store,
            runtime: Handle::try_current().ok(),
            pending: Mutex::new(vec![]),
            logger,
        }
    }

    /// Mirroring is off unless both a token and a repository are configured.
    pub fn from_settings(settings: &Settings, logger: Logger) -> Self {
        let store = match (&settings.github_token, &settings.github_repo) {
            (Some(token), Some(repo)) => {
                match GithubStore::new(token.clone(), repo.clone(), logger.clone()) {
                    Ok(store) => Some(Arc::new(store) as Arc<dyn RemoteStore>),
                    Err(e) => {
                        error!(logger, "unable to set up remote mirror: {}", e);
                        None
                    }
                }
            }
            _ => {
                info!(logger, "github token or repo not set, remote mirror disabled");
                None
            }
        };
        Mirror::new(store, logger)
    }

    pub fn disabled(logger: Logger) -> Self {
        Mirror::new(None, logger)
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Waits for every upload spawned so far.
    pub async fn flush(&self) {
        let pending: Vec<JoinHandle<()>> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).collect()
        };
        for handle in pending {
            if let Err(e) = handle.await {
                error!(self.logger, "mirror upload task failed: {}", e);
            }
        }
    }

    /// Downloads every mirrored artifact into `layout`, returning how many arrived.
    pub async fn pull(&self, layout: &DataLayout) -> usize {
        let Some(store) = &self.store else {
            warn!(self.logger, "remote mirror disabled, nothing to pull");
            return 0;
        };
        let mut pulled = 0;
        for file in layout.mirrored_files() {
            match store.get(&file.remote, &file.local).await {
                Ok(()) => {
                    info!(self.logger, "pulled {}", file.remote);
                    pulled += 1;
                }
                Err(e) => warn!(self.logger, "unable to pull {}: {}", file.remote, e),
            }
        }
        pulled
    }
}

impl ArtifactMirror for Mirror {
    fn mirror(&self, files: Vec<MirrorFile>) {
        let Some(store) = self.store.clone() else {
            debug!(self.logger, "remote mirror disabled, skipping upload");
            return;
        };
        let Some(runtime) = &self.runtime else {
            warn!(self.logger, "no async runtime available, skipping upload");
            return;
        };
        let logger = self.logger.clone();
        let handle = runtime.spawn(async move {
            for file in files {
                if !file.local.is_file() {
                    debug!(logger, "{} does not exist yet, not mirrored", file.local.display());
                    continue;
                }
                match store.put(&file.local, &file.remote).await {
                    Ok(()) => info!(logger, "mirrored {}", file.remote),
                    Err(e) => error!(logger, "failed to mirror {}: {}", file.remote, e),
                }
            }
        });
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|task| !task.is_finished());
        pending.push(handle);
    }
}
