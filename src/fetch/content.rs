//! Permanent storage for fetched media.
//!
//! The content store owns deduplication: entries are keyed by the canonical
//! (query-stripped) target URL, so a media file fetched once is reused by
//! every later item that references the same target.

use crate::download::{Download, DownloadResult};
use crate::error::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use url::Url;

/// The filesystem-backed store contract the download pipeline requires.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// A prior result for this canonical target, if one exists. A hit means
    /// no network or tool invocation is needed.
    async fn existing(&self, download: &Download) -> Option<DownloadResult>;

    /// Relocate a fetch's files out of `temp_dir` into permanent storage,
    /// returning the result with `dir` pointing at the permanent location.
    async fn store(&self, result: DownloadResult, temp_dir: &Path) -> Result<DownloadResult>;
}

/// Content store backed by a local directory tree.
///
/// Each entry lives in `<root>/<sha256-of-canonical-url>/`.
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsContentStore { root: root.into() }
    }

    fn entry_dir(&self, url: &str) -> PathBuf {
        self.root.join(content_key(url))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn existing(&self, download: &Download) -> Option<DownloadResult> {
        let dir = self.entry_dir(&download.url);
        let metadata = tokio::fs::metadata(&dir).await.ok()?;
        if !metadata.is_dir() {
            return None;
        }

        let mut result = super::scan_media_dir(&dir).await.ok()?;
        if result.media.is_none() && result.image.is_none() && result.metadata.is_none() {
            return None;
        }
        result.url = download.url.clone();
        tracing::debug!(url = %download.url, dir = %dir.display(), "Reusing existing download");
        Some(result)
    }

    async fn store(&self, mut result: DownloadResult, temp_dir: &Path) -> Result<DownloadResult> {
        let dir = self.entry_dir(&result.url);
        tokio::fs::create_dir_all(&dir).await?;

        for name in [&result.media, &result.image, &result.metadata]
            .into_iter()
            .flatten()
        {
            tokio::fs::copy(temp_dir.join(name), dir.join(name)).await?;
        }

        result.dir = dir;
        Ok(result)
    }
}

/// Canonicalize a target URL for dedup purposes: query and fragment are
/// dropped, since signed query parameters change between fetches of the
/// same resource.
pub(crate) fn canonical_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// The storage key for a target URL.
pub(crate) fn content_key(url: &str) -> String {
    let digest = Sha256::digest(canonical_url(url).as_bytes());
    format!("{digest:x}")
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_url_strips_query_and_fragment() {
        assert_eq!(
            canonical_url("https://cdn.example.com/a.mp3?sig=abc123&expires=99#t=10"),
            "https://cdn.example.com/a.mp3"
        );
        assert_eq!(
            canonical_url("https://cdn.example.com/a.mp3"),
            "https://cdn.example.com/a.mp3"
        );
    }

    #[test]
    fn content_key_is_stable_across_query_variants() {
        let a = content_key("https://cdn.example.com/a.mp3?sig=one");
        let b = content_key("https://cdn.example.com/a.mp3?sig=two");
        assert_eq!(a, b, "signed variants of the same target share an entry");

        let c = content_key("https://cdn.example.com/b.mp3");
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn store_then_existing_round_trips() {
        let root = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(root.path().join("files"));

        let temp = tempfile::tempdir().unwrap();
        tokio::fs::write(temp.path().join("media.mp3"), vec![0u8; 64])
            .await
            .unwrap();

        let result = DownloadResult {
            url: "https://cdn.example.com/a.mp3?sig=one".to_string(),
            dir: temp.path().to_path_buf(),
            media: Some("media.mp3".to_string()),
            size: Some(64),
            mime: Some("audio/mpeg".to_string()),
            ..DownloadResult::default()
        };

        let stored = store.store(result, temp.path()).await.unwrap();
        assert!(stored.dir.join("media.mp3").exists());

        // A differently signed URL for the same target hits the cache
        let cached = store
            .existing(&Download::direct("https://cdn.example.com/a.mp3?sig=two"))
            .await
            .expect("entry should exist");
        assert_eq!(cached.media.as_deref(), Some("media.mp3"));
        assert_eq!(cached.size, Some(64));
    }

    #[tokio::test]
    async fn existing_misses_on_unknown_target() {
        let root = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(root.path().join("files"));
        assert!(
            store
                .existing(&Download::direct("https://cdn.example.com/nope.mp3"))
                .await
                .is_none()
        );
    }
}
