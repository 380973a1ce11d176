//! Download-and-extract primitive for runtime provisioning.
//!
//! Streams an archive over HTTPS to a temporary file, verifies it, and
//! extracts it with the platform's archive utility. Transient network
//! failures are retried with linear backoff; the temporary file is removed
//! on every path out, success or failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

/// Errors surfaced by [`download_and_extract`].
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request for {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download of {url} failed with status {status}")]
    Status { url: String, status: u16 },
    #[error("download of {url} timed out after {timeout:?}")]
    TimedOut { url: String, timeout: Duration },
    #[error("downloaded file from {url} is empty")]
    EmptyDownload { url: String },
    #[error("unsupported archive format: {file}")]
    UnsupportedArchive { file: String },
    #[error("{tool} failed with exit code {code}: {stderr}")]
    Extract {
        tool: &'static str,
        code: i32,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tuning knobs for a download. Defaults: three attempts, 30s per request,
/// 2s base delay between attempts.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Directory for the in-flight temporary file.
    pub temp_dir: PathBuf,
    /// Per-request timeout; an attempt exceeding it is aborted and retried.
    pub timeout: Duration,
    /// Total number of attempts.
    pub retries: u32,
    /// Base delay between attempts; attempt `n` waits `n * retry_delay`.
    pub retry_delay: Duration,
}

impl DownloadOptions {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            timeout: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Download `url` and extract the archive into `dest_dir`.
///
/// `dest_dir` is created if needed. The temporary download file is deleted
/// regardless of outcome.
pub async fn download_and_extract(
    url: &str,
    dest_dir: &Path,
    options: &DownloadOptions,
) -> Result<(), DownloadError> {
    tokio::fs::create_dir_all(dest_dir).await?;
    tokio::fs::create_dir_all(&options.temp_dir).await?;

    let file_name = url.rsplit('/').next().unwrap_or("archive");
    let temp_path = options
        .temp_dir
        .join(format!("download-{}-{}", Uuid::new_v4(), file_name));

    tracing::info!(url = %url, dest = %dest_dir.display(), "Downloading runtime archive");

    let result = download_then_extract(url, &temp_path, dest_dir, options).await;

    // Guaranteed cleanup: the temp file never outlives the call.
    match tokio::fs::remove_file(&temp_path).await {
        Ok(()) => tracing::debug!(path = %temp_path.display(), "Removed temporary download file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            path = %temp_path.display(),
            error = %e,
            "Failed to remove temporary download file"
        ),
    }

    result
}

/// Download a single non-archive file straight to `dest`, with the same
/// retry policy as [`download_and_extract`]. A partially written `dest` is
/// removed when every attempt fails.
pub async fn download_file(
    url: &str,
    dest: &Path,
    options: &DownloadOptions,
) -> Result<(), DownloadError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let result = download_with_retries(url, dest, options).await;
    if result.is_err() {
        match tokio::fs::remove_file(dest).await {
            Ok(()) => tracing::debug!(path = %dest.display(), "Removed partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %dest.display(),
                error = %e,
                "Failed to remove partial download"
            ),
        }
    }
    result
}

async fn download_then_extract(
    url: &str,
    temp_path: &Path,
    dest_dir: &Path,
    options: &DownloadOptions,
) -> Result<(), DownloadError> {
    download_with_retries(url, temp_path, options).await?;

    let size = tokio::fs::metadata(temp_path).await?.len();
    if size == 0 {
        return Err(DownloadError::EmptyDownload {
            url: url.to_string(),
        });
    }

    tracing::info!(
        url = %url,
        size_mb = format!("{:.2}", size as f64 / 1024.0 / 1024.0),
        "Download complete, extracting"
    );

    extract_archive(temp_path, dest_dir).await
}

async fn download_with_retries(
    url: &str,
    temp_path: &Path,
    options: &DownloadOptions,
) -> Result<(), DownloadError> {
    let attempts = options.retries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match download_once(url, temp_path, options.timeout).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                let delay = options.retry_delay * attempt;
                tracing::warn!(url = %url, attempt, error = %e, delay = ?delay, "Download attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::warn!(url = %url, attempt, error = %e, "Download attempt failed");
                return Err(e);
            }
        }
    }
}

/// One download attempt: stream the body to `temp_path` within the timeout.
/// Redirects are followed by the client.
async fn download_once(
    url: &str,
    temp_path: &Path,
    timeout: Duration,
) -> Result<(), DownloadError> {
    let attempt = async {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|source| DownloadError::Request {
                url: url.to_string(),
                source,
            })?;

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|source| DownloadError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(temp_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| DownloadError::Request {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(DownloadError::TimedOut {
            url: url.to_string(),
            timeout,
        }),
    }
}

/// Extract an archive by type. Zip archives go through the platform unzip
/// utility (PowerShell on Windows); gzipped tarballs through `tar`.
async fn extract_archive(archive: &Path, dest_dir: &Path) -> Result<(), DownloadError> {
    tokio::fs::create_dir_all(dest_dir).await?;

    let name = archive.to_string_lossy().to_string();
    if name.ends_with(".zip") {
        extract_zip(archive, dest_dir).await
    } else if name.ends_with(".gz") || name.ends_with(".tgz") {
        extract_tar_gz(archive, dest_dir).await
    } else {
        Err(DownloadError::UnsupportedArchive { file: name })
    }
}

async fn extract_zip(archive: &Path, dest_dir: &Path) -> Result<(), DownloadError> {
    if cfg!(target_os = "windows") {
        let script = format!(
            "Expand-Archive -Path '{}' -DestinationPath '{}' -Force",
            archive.display(),
            dest_dir.display()
        );
        run_extractor("powershell", &["-command".to_string(), script]).await
    } else {
        // Spawn unzip directly so paths with spaces never hit a shell.
        run_extractor(
            "unzip",
            &[
                "-o".to_string(),
                "-q".to_string(),
                archive.to_string_lossy().to_string(),
                "-d".to_string(),
                dest_dir.to_string_lossy().to_string(),
            ],
        )
        .await
    }
}

async fn extract_tar_gz(archive: &Path, dest_dir: &Path) -> Result<(), DownloadError> {
    run_extractor(
        "tar",
        &[
            "-xzf".to_string(),
            archive.to_string_lossy().to_string(),
            "-C".to_string(),
            dest_dir.to_string_lossy().to_string(),
        ],
    )
    .await
}

async fn run_extractor(tool: &'static str, args: &[String]) -> Result<(), DownloadError> {
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        tracing::debug!(tool = %tool, "Extraction complete");
        Ok(())
    } else {
        Err(DownloadError::Extract {
            tool,
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
