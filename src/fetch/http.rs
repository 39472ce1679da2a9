//! HTTP fetcher with Range-based resume

use super::{FetchRequest, Fetcher, ProgressEvent, ProgressSink};
use crate::config::TransferConfig;
use crate::error::TransferError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, HeaderMap, RANGE};
use std::path::Path;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Downloads enclosures over HTTP(S) with reqwest
///
/// A non-zero resume offset is requested with `Range: bytes=N-`. A `206`
/// answer is appended after truncating the partial file to exactly `N`
/// bytes; a plain `200` restarts the file from zero.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    stall_timeout: Duration,
}

impl HttpFetcher {
    /// Build a fetcher from the transfer settings
    pub fn new(config: &TransferConfig) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            stall_timeout: config.stall_timeout,
        })
    }

    async fn send(
        &self,
        url: &str,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, TransferError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            response = request.send() => Ok(response?),
        }
    }

    async fn stream_body(
        &self,
        response: reqwest::Response,
        file: &mut File,
        start: u64,
        bytes_total: Option<u64>,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let mut downloaded = start;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(TransferError::Stalled {
                        secs: self.stall_timeout.as_secs(),
                    });
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress
                .report(ProgressEvent::Progress {
                    bytes_downloaded: downloaded,
                    bytes_total,
                })
                .await;
        }

        Ok(downloaded)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: &ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(), TransferError> {
        let url = request.url.as_str();
        let mut offset = request.resume_offset;
        let mut response = self.send(url, offset, &cancel).await?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            let (_, total) = content_range(response.headers()).unwrap_or((None, None));
            if total == Some(offset) {
                tracing::debug!(item_id = request.id.0, offset, "Partial file already complete");
                progress
                    .report(ProgressEvent::Started {
                        resume_offset: offset,
                        bytes_total: total,
                    })
                    .await;
                return Ok(());
            }
            tracing::info!(
                item_id = request.id.0,
                offset,
                "Server rejected resume range, restarting from zero"
            );
            offset = 0;
            response = self.send(url, offset, &cancel).await?;
        }

        let status = response.status();
        let (mut file, start, bytes_total) = if status == StatusCode::PARTIAL_CONTENT && offset > 0
        {
            let (start, total) = content_range(response.headers()).unwrap_or((None, None));
            if start != Some(offset) {
                return Err(TransferError::InvalidResponse(format!(
                    "expected content range starting at {offset}, got {start:?}"
                )));
            }
            let file = open_for_append(&request.destination, offset).await?;
            let total = total.or_else(|| response.content_length().map(|len| len + offset));
            (file, offset, total)
        } else if status.is_success() {
            if offset > 0 {
                tracing::info!(
                    item_id = request.id.0,
                    offset,
                    "Server ignored range request, restarting from zero"
                );
            }
            let file = create_truncated(&request.destination).await?;
            (file, 0, response.content_length())
        } else {
            return Err(TransferError::Http {
                status: status.as_u16(),
                url: request.url.clone(),
            });
        };

        progress
            .report(ProgressEvent::Started {
                resume_offset: start,
                bytes_total,
            })
            .await;

        let result = self
            .stream_body(response, &mut file, start, bytes_total, progress, &cancel)
            .await;

        // Reported bytes must be on disk even when the transfer stops early
        file.flush().await?;
        let downloaded = result?;
        file.sync_all().await?;

        if let Some(total) = bytes_total
            && downloaded < total
        {
            return Err(TransferError::InvalidResponse(format!(
                "body ended after {downloaded} of {total} bytes"
            )));
        }

        tracing::debug!(item_id = request.id.0, bytes = downloaded, "Fetch complete");
        Ok(())
    }
}

/// Parse `Content-Range: bytes START-END/TOTAL` (or `bytes */TOTAL`)
fn content_range(headers: &HeaderMap) -> Option<(Option<u64>, Option<u64>)> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = spec.split_once('/')?;
    let start = range
        .split_once('-')
        .and_then(|(start, _)| start.trim().parse().ok());
    let total = total.trim().parse().ok();
    Some((start, total))
}

async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}

async fn open_for_append(path: &Path, offset: u64) -> std::io::Result<File> {
    ensure_parent(path).await?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    // Drop anything past the accounted offset
    file.set_len(offset).await?;
    file.seek(std::io::SeekFrom::End(0)).await?;
    Ok(file)
}

async fn create_truncated(path: &Path) -> std::io::Result<File> {
    ensure_parent(path).await?;
    File::create(path).await
}
