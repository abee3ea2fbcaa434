//! Feed fetcher
//!
//! Streams the remote feed to a local staging artifact in fixed-size
//! chunks. The full payload is never buffered in memory; gzipped feeds
//! are decompressed file-to-file after the download completes.

use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::models::FeedArtifact;
use crate::{IngestError, Result};

/// Metrics collected during one fetch attempt
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FetchMetrics {
    /// Bytes downloaded from the network (compressed size for .gz feeds)
    pub bytes_downloaded: u64,
    /// Size of the staged artifact after decompression
    pub artifact_bytes: u64,
    pub duration_secs: f64,
}

/// HTTP client for downloading the vulnerability feed
pub struct FeedFetcher {
    client: Client,
    config: PipelineConfig,
}

impl FeedFetcher {
    /// Create a new fetcher with the given configuration
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.fetch_timeout())
            .user_agent("cvefeed-ingest/1.0")
            .build()?;

        Ok(Self { client, config })
    }

    /// Download the feed to a staging artifact
    ///
    /// Transport failures (timeout, non-2xx, decompression) are transient
    /// and feed the run-level retry policy.
    pub async fn fetch(&self) -> Result<(FeedArtifact, FetchMetrics)> {
        let url = &self.config.feed_url;
        let started = std::time::Instant::now();

        tokio::fs::create_dir_all(&self.config.staging_dir).await?;

        let download_path = self
            .config
            .staging_dir
            .join(format!("feed-{}.download", Uuid::new_v4()));

        info!(url = %url, path = %download_path.display(), "Downloading feed");

        let bytes_downloaded = match self.stream_to_file(url, &download_path).await {
            Ok(n) => n,
            Err(e) => {
                // Do not leave a partial download behind
                let _ = tokio::fs::remove_file(&download_path).await;
                return Err(e);
            },
        };

        let artifact_path = if url.ends_with(".gz") {
            let json_path = download_path.with_extension("json");
            let result = decompress_to_file(download_path.clone(), json_path.clone()).await;
            let _ = tokio::fs::remove_file(&download_path).await;
            if let Err(e) = result {
                let _ = tokio::fs::remove_file(&json_path).await;
                return Err(e);
            }
            json_path
        } else {
            download_path
        };

        let artifact_bytes = tokio::fs::metadata(&artifact_path).await?.len();
        let duration_secs = started.elapsed().as_secs_f64();

        info!(
            bytes_downloaded,
            artifact_bytes, duration_secs, "Feed download complete"
        );

        Ok((
            FeedArtifact {
                path: artifact_path,
                source_url: url.clone(),
                size_bytes: artifact_bytes,
                fetched_at: Utc::now(),
            },
            FetchMetrics {
                bytes_downloaded,
                artifact_bytes,
                duration_secs,
            },
        ))
    }

    /// Stream the response body to `path` chunk by chunk
    async fn stream_to_file(&self, url: &str, path: &PathBuf) -> Result<u64> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(IngestError::Transport(format!(
                "HTTP error fetching feed: {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }

        file.flush().await?;
        Ok(downloaded)
    }
}

/// Decompress a gzipped file to `dest` with constant memory
///
/// Runs on the blocking pool; flate2 works over std IO.
async fn decompress_to_file(src: PathBuf, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let input = std::fs::File::open(&src)?;
        let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(input));
        let output = std::fs::File::create(&dest)?;
        let mut writer = std::io::BufWriter::new(output);
        std::io::copy(&mut decoder, &mut writer)?;
        std::io::Write::flush(&mut writer)?;
        Ok(())
    })
    .await
    .map_err(|e| IngestError::Transport(format!("decompression task failed: {}", e)))?
    .map_err(|e| IngestError::Transport(format!("feed decompression failed: {}", e)))
}

// ============================================================================
// Tests
// ============================================================================
