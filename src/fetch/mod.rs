//! Media fetching: direct HTTP downloads and tool-mediated extraction.
//!
//! The [`Downloader`] executes one attachment fetch at a time inside an
//! exclusively-owned temporary directory, retries transient failures, hands
//! the finished files to the [`ContentStore`](content::ContentStore) for
//! relocation, and reclaims the temp directory on every exit path. Engines
//! talk to it through the [`MediaFetcher`] trait so tests can substitute
//! their own implementation.

use crate::config::{EngineConfig, RetryConfig};
use crate::download::{Download, DownloadResult};
use crate::error::{DownloadError, Error, Result};
use crate::retry::retry_with_backoff;
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use url::Url;

pub mod content;

use content::ContentStore;

/// The external extraction tool searched for on PATH when no explicit path
/// is configured.
pub const DEFAULT_TOOL: &str = "yt-dlp";

/// Executes attachment fetches.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Fetch one attachment. The returned result points at permanent
    /// storage; all temp space used by the fetch is gone by the time this
    /// returns, success or failure.
    async fn fetch(&self, download: &Download) -> Result<DownloadResult>;

    /// Reclaim any leftover temp space from previous sessions or crashed
    /// fetches. Never touches in-flight downloads.
    async fn clean(&self) -> Result<()>;
}

/// The bundled fetcher: streamed HTTP for direct downloads, an external
/// extraction tool for everything else.
pub struct Downloader {
    http: reqwest::Client,
    store: Arc<dyn ContentStore>,
    temp_root: PathBuf,
    tool_path: Option<PathBuf>,
    retry: RetryConfig,
    /// Names of temp directories owned by in-flight fetches.
    active: Mutex<HashSet<String>>,
}

impl Downloader {
    /// Create a downloader from engine configuration.
    ///
    /// The extraction tool is resolved once: an explicit
    /// [`tool_path`](crate::config::ToolsConfig::tool_path) wins, otherwise
    /// PATH is searched unless disabled.
    pub fn new(
        config: &EngineConfig,
        http: reqwest::Client,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        let tool_path = config.tools.tool_path.clone().or_else(|| {
            if config.tools.search_path {
                which::which(DEFAULT_TOOL).ok()
            } else {
                None
            }
        });

        match &tool_path {
            Some(path) => tracing::info!(tool = %path.display(), "Media extraction tool resolved"),
            None => tracing::debug!(
                "No media extraction tool found; tool-mediated downloads will fail"
            ),
        }

        Downloader {
            http,
            store,
            temp_root: config.storage.temp_dir.clone(),
            tool_path,
            retry: config.retry.clone(),
            active: Mutex::new(HashSet::new()),
        }
    }

    async fn fetch_and_store(&self, download: &Download, dir: &Path) -> Result<DownloadResult> {
        let result = retry_with_backoff(&self.retry, None, || async {
            if download.direct {
                self.direct_fetch(&download.url, dir).await
            } else {
                self.tool_fetch(download, dir).await
            }
        })
        .await?;

        // Relocate out of temp space before the directory is reclaimed
        self.store.store(result, dir).await
    }

    /// Stream the target straight to disk, inferring the type from response
    /// headers.
    async fn direct_fetch(&self, target: &str, dir: &Path) -> Result<DownloadResult> {
        tracing::debug!(url = target, "Direct HTTP download");

        let response = self.http.get(target).send().await?.error_for_status()?;

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let header_size = response.content_length();

        let filename = format!(
            "media.{}",
            mime.as_deref().and_then(extension_for_mime).unwrap_or("bin")
        );

        let mut file = tokio::fs::File::create(dir.join(&filename)).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(DownloadResult {
            url: target.to_string(),
            dir: dir.to_path_buf(),
            media: Some(filename),
            image: None,
            metadata: None,
            data: None,
            size: header_size.or(Some(written)),
            mime,
        })
    }

    /// Run the external extraction tool in the temp directory, then scan for
    /// the files it produced.
    async fn tool_fetch(&self, download: &Download, dir: &Path) -> Result<DownloadResult> {
        let tool = self.tool_path.as_ref().ok_or_else(|| DownloadError::ToolMissing {
            url: download.url.clone(),
        })?;

        let mut args: Vec<String> = vec![
            "--restrict-filenames".to_string(),
            "--socket-timeout=10".to_string(),
            "--quiet".to_string(),
        ];
        if download.metadata {
            args.push("--write-info-json".to_string());
        }
        if !download.media {
            args.push("--skip-download".to_string());
        }
        if download.thumbnail {
            args.push("--write-thumbnail".to_string());
        }
        if download.media {
            if download.transcode {
                args.push("--recode-video=mp4".to_string());
            }
            if download.audio {
                args.push("--extract-audio".to_string());
                if download.transcode {
                    args.push("--audio-format=aac".to_string());
                    args.push("--audio-quality=1".to_string());
                }
            }
        }
        args.push(download.url.clone());

        tracing::debug!(url = %download.url, tool = %tool.display(), "Tool-mediated download");

        let output = tokio::process::Command::new(tool)
            .args(&args)
            .current_dir(dir)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::ExternalTool(format!(
                "{} exited with {}: {}",
                tool.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut result = scan_media_dir(dir).await?;
        result.url = download.url.clone();

        if download.media && result.media.is_none() {
            return Err(DownloadError::NoMediaProduced {
                url: download.url.clone(),
                dir: dir.to_path_buf(),
            }
            .into());
        }

        Ok(result)
    }
}

#[async_trait]
impl MediaFetcher for Downloader {
    async fn fetch(&self, download: &Download) -> Result<DownloadResult> {
        Url::parse(&download.url).map_err(|_| DownloadError::InvalidUrl {
            url: download.url.clone(),
        })?;

        let dir_name = temp_name();
        let dir = self.temp_root.join(&dir_name);
        tokio::fs::create_dir_all(&dir).await?;
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dir_name.clone());

        let outcome = self.fetch_and_store(download, &dir).await;

        // The temp directory is reclaimed on every exit path
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove temp download directory");
        }
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&dir_name);

        outcome
    }

    async fn clean(&self) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.temp_root).await {
            Ok(entries) => entries,
            // Nothing downloaded yet
            Err(_) => return Ok(()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let in_flight = self
                .active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&name);
            if in_flight {
                continue;
            }
            tracing::debug!(dir = %entry.path().display(), "Removing stale temp directory");
            if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                tracing::warn!(dir = %entry.path().display(), error = %e, "Failed to remove stale temp directory");
            }
        }

        Ok(())
    }
}

/// Scan a directory for the files a fetch produced: a metadata JSON
/// document, a thumbnail image, and a media file.
pub(crate) async fn scan_media_dir(dir: &Path) -> Result<DownloadResult> {
    let mut result = DownloadResult {
        dir: dir.to_path_buf(),
        ..DownloadResult::default()
    };

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let ext = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            // Partial downloads from an interrupted tool run
            "part" | "ytdl" | "tmp" => continue,
            "json" => result.metadata = Some(name),
            "jpg" | "jpeg" | "png" | "webp" => result.image = Some(name),
            _ => {
                let meta = entry.metadata().await?;
                result.size = Some(meta.len());
                result.mime = mime_for_extension(&ext).map(|m| m.to_string());
                result.media = Some(name);
            }
        }
    }

    if let Some(metadata_file) = &result.metadata {
        let raw = tokio::fs::read_to_string(dir.join(metadata_file)).await?;
        result.data = serde_json::from_str(&raw).ok();
    }

    Ok(result)
}

fn temp_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// File extension for a MIME type, for naming direct downloads.
fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "audio/mpeg" => Some("mp3"),
        "audio/mp4" | "audio/m4a" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "video/mp4" => Some("mp4"),
        "video/webm" => Some("webm"),
        "video/quicktime" => Some("mov"),
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "application/pdf" => Some("pdf"),
        "application/json" => Some("json"),
        "text/html" => Some("html"),
        "text/plain" => Some("txt"),
        _ => None,
    }
}

/// MIME type for a file extension, for classifying tool output.
fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "mp3" => Some("audio/mpeg"),
        "m4a" => Some("audio/mp4"),
        "aac" => Some("audio/aac"),
        "ogg" => Some("audio/ogg"),
        "mp4" => Some("video/mp4"),
        "webm" => Some("video/webm"),
        "mov" => Some("video/quicktime"),
        "mkv" => Some("video/x-matroska"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}
