//! Download-and-extract tests against a local HTTP fixture server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use toolhost::runtime::{
    download_and_extract, download_file, execute_command, DownloadError, DownloadOptions,
};

/// Serve canned HTTP responses: the first `failures` requests get a 500,
/// later ones a 200 carrying `body`. Returns the bound address and a counter
/// of requests served.
async fn fixture_server(failures: usize, body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            let body = body.clone();

            tokio::spawn(async move {
                // Read the request head before answering.
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => return,
                        Ok(n) => {
                            seen.extend_from_slice(&buf[..n]);
                            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }

                let response = if attempt < failures {
                    b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
                } else {
                    let mut response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    )
                    .into_bytes();
                    response.extend_from_slice(&body);
                    response
                };
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), hits)
}

/// Serve a 200 that advertises a large body, writes a few bytes and then
/// stalls without closing, so every download attempt dies mid-stream.
async fn stalling_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => return,
                        Ok(n) => {
                            seen.extend_from_slice(&buf[..n]);
                            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let head = b"HTTP/1.1 200 OK\r\nContent-Length: 1048576\r\n\r\npartial bytes";
                let _ = socket.write_all(head).await;
                tokio::time::sleep(Duration::from_secs(600)).await;
            });
        }
    });

    format!("http://{}", addr)
}

/// Build a small gzipped tarball containing `hello.txt`.
async fn tar_gz_fixture(dir: &std::path::Path) -> Vec<u8> {
    let payload_dir = dir.join("payload");
    tokio::fs::create_dir_all(&payload_dir).await.unwrap();
    tokio::fs::write(payload_dir.join("hello.txt"), b"hello\n")
        .await
        .unwrap();

    let archive = dir.join("fixture.tar.gz");
    let out = execute_command(
        "tar",
        &[
            "-czf".to_string(),
            archive.to_string_lossy().to_string(),
            "-C".to_string(),
            payload_dir.to_string_lossy().to_string(),
            "hello.txt".to_string(),
        ],
        None,
        &std::env::vars().collect::<HashMap<_, _>>(),
    )
    .await
    .unwrap();
    assert!(out.success(), "tar failed: {}", out.stderr);

    tokio::fs::read(&archive).await.unwrap()
}

fn options(dir: &std::path::Path) -> DownloadOptions {
    let mut options = DownloadOptions::new(dir.join("tmp"));
    options.retries = 3;
    options.retry_delay = Duration::from_millis(10);
    options.timeout = Duration::from_secs(5);
    options
}

async fn temp_dir_is_empty(dir: &std::path::Path) -> bool {
    let mut entries = tokio::fs::read_dir(dir).await.unwrap();
    entries.next_entry().await.unwrap().is_none()
}

#[tokio::test]
async fn test_transient_failures_then_success_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let body = tar_gz_fixture(dir.path()).await;
    let (base, hits) = fixture_server(2, body).await;

    let dest = dir.path().join("dest");
    download_and_extract(
        &format!("{}/runtime.tar.gz", base),
        &dest,
        &options(dir.path()),
    )
    .await
    .unwrap();

    // Two failed attempts plus the one that succeeded.
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    let extracted = tokio::fs::read_to_string(dest.join("hello.txt")).await.unwrap();
    assert_eq!(extracted, "hello\n");
    assert!(temp_dir_is_empty(&dir.path().join("tmp")).await);
}

#[tokio::test]
async fn test_persistent_failure_surfaces_after_budget() {
    let dir = tempfile::tempdir().unwrap();
    let (base, hits) = fixture_server(usize::MAX, Vec::new()).await;

    let result = download_and_extract(
        &format!("{}/runtime.tar.gz", base),
        &dir.path().join("dest"),
        &options(dir.path()),
    )
    .await;

    assert!(matches!(result, Err(DownloadError::Status { status: 500, .. })));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(temp_dir_is_empty(&dir.path().join("tmp")).await);
}

#[tokio::test]
async fn test_download_file_removes_partial_file_when_all_attempts_stall() {
    let dir = tempfile::tempdir().unwrap();
    let base = stalling_server().await;

    let mut options = options(dir.path());
    options.retries = 2;
    options.timeout = Duration::from_millis(300);

    let dest = dir.path().join("scripts").join("get-pip.py");
    let result = download_file(&format!("{}/get-pip.py", base), &dest, &options).await;

    assert!(matches!(result, Err(DownloadError::TimedOut { .. })));
    // A stalled transfer must not leave the partially written file behind.
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_download_file_writes_dest_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let (base, _) = fixture_server(0, b"print('ok')\n".to_vec()).await;

    let dest = dir.path().join("scripts").join("get-pip.py");
    download_file(&format!("{}/get-pip.py", base), &dest, &options(dir.path()))
        .await
        .unwrap();

    let body = tokio::fs::read_to_string(&dest).await.unwrap();
    assert_eq!(body, "print('ok')\n");
}

#[tokio::test]
async fn test_empty_body_is_rejected_without_residue() {
    let dir = tempfile::tempdir().unwrap();
    let (base, _) = fixture_server(0, Vec::new()).await;

    let result = download_and_extract(
        &format!("{}/runtime.tar.gz", base),
        &dir.path().join("dest"),
        &options(dir.path()),
    )
    .await;

    assert!(matches!(result, Err(DownloadError::EmptyDownload { .. })));
    assert!(temp_dir_is_empty(&dir.path().join("tmp")).await);
}
