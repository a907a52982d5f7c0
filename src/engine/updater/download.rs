//! Package Download
//!
//! Fetches update packages with resume support and bounded retries. Bytes
//! land in `<package>.tmp` and the file is renamed to its final name only
//! once the body has been received completely.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::error::{NetworkError, UpdateError};
use super::transport::{HttpRequest, Transport};

const HTTP_OK: u16 = 200;
const HTTP_PARTIAL_CONTENT: u16 = 206;
const HTTP_RANGE_NOT_SATISFIABLE: u16 = 416;

/// Retry budget for transient download failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause between attempts
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_delay_ms() -> u64 {
    250
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Download result with metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub bytes_downloaded: u64,
    /// Number of requests that were made
    pub attempts: u32,
    /// At least one attempt continued from a partial file
    pub resumed: bool,
    /// A complete package from an earlier run was reused
    pub reused: bool,
}

/// Download manager for update packages
pub struct Downloader<T: Transport> {
    transport: Arc<T>,
    policy: RetryPolicy,
}

impl<T: Transport> Downloader<T> {
    pub fn new(transport: Arc<T>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Download `url` to `dest`, calling `on_progress(transferred, total)` as
    /// bytes arrive. `total` is 0 while unknown.
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        mut on_progress: F,
    ) -> Result<DownloadResult, UpdateError>
    where
        F: FnMut(u64, u64) + Send,
    {
        if let Ok(metadata) = fs::metadata(dest).await {
            if metadata.is_file() {
                debug!("Reusing downloaded package {}", dest.display());
                return Ok(DownloadResult {
                    path: dest.to_path_buf(),
                    bytes_downloaded: metadata.len(),
                    attempts: 0,
                    resumed: false,
                    reused: true,
                });
            }
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdateError::io("Failed to create download directory", e))?;
        }
        let partial = partial_path(dest);

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        let mut resumed = false;
        let bytes = loop {
            attempt += 1;
            match self.fetch_to_file(url, &partial, &mut on_progress).await {
                Ok((bytes, did_resume)) => {
                    resumed |= did_resume;
                    break bytes;
                }
                Err(FetchError::Network(e)) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        "Download attempt {}/{} of {} failed, retrying: {}",
                        attempt, max_attempts, url, e
                    );
                    tokio::time::sleep(self.policy.delay()).await;
                }
                Err(FetchError::Network(e)) => return Err(e.into()),
                Err(FetchError::Io(e)) => {
                    return Err(UpdateError::io(
                        format!("Failed to write {}", partial.display()),
                        e,
                    ))
                }
            }
        };

        fs::rename(&partial, dest)
            .await
            .map_err(|e| UpdateError::io("Failed to finalize download", e))?;
        info!("Downloaded {} ({} bytes, {} attempt(s))", url, bytes, attempt);

        Ok(DownloadResult {
            path: dest.to_path_buf(),
            bytes_downloaded: bytes,
            attempts: attempt,
            resumed,
            reused: false,
        })
    }

    /// One attempt: continue from the partial file when possible.
    async fn fetch_to_file<F>(
        &self,
        url: &str,
        partial: &Path,
        on_progress: &mut F,
    ) -> Result<(u64, bool), FetchError>
    where
        F: FnMut(u64, u64) + Send,
    {
        let offset = match fs::metadata(partial).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        let mut response = self
            .transport
            .get(HttpRequest::get(url).range_from(offset))
            .await?;

        let mut start = offset;
        if offset > 0 {
            match response.status {
                HTTP_PARTIAL_CONTENT => {}
                HTTP_OK => {
                    debug!("Server ignored range request, restarting {}", url);
                    start = 0;
                }
                HTTP_RANGE_NOT_SATISFIABLE => {
                    debug!("Unable to resume download of {}, restarting", url);
                    response = self.transport.get(HttpRequest::get(url)).await?;
                    start = 0;
                    if response.status != HTTP_OK {
                        return Err(NetworkError::Status(response.status).into());
                    }
                }
                status => return Err(NetworkError::Status(status).into()),
            }
        } else if response.status != HTTP_OK {
            return Err(NetworkError::Status(response.status).into());
        }

        let mut file = if start > 0 {
            OpenOptions::new().append(true).open(partial).await?
        } else {
            fs::File::create(partial).await?
        };

        let total = response.content_length.map(|len| len + start).unwrap_or(0);
        let mut downloaded = start;
        on_progress(downloaded, total);

        while let Some(chunk) = response.body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    file.flush().await?;
                    return Err(e.into());
                }
            };
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total);
        }
        file.flush().await?;

        if total > 0 && downloaded < total {
            return Err(NetworkError::IncompleteBody(format!(
                "received {} of {} bytes",
                downloaded, total
            ))
            .into());
        }

        Ok((downloaded, offset > 0 && start > 0))
    }
}

enum FetchError {
    Network(NetworkError),
    Io(std::io::Error),
}

impl From<NetworkError> for FetchError {
    fn from(e: NetworkError) -> Self {
        Self::Network(e)
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}
