//! Attachment fetch descriptors and results.
//!
//! A [`Download`] describes one attachment fetch hanging off an item. The
//! fetch produces a [`DownloadResult`] which the engine merges back into the
//! owning item by index; there are no completion callbacks, so concurrent
//! downloads for different items never alias shared mutable state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Describes one attachment fetch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Download {
    /// The target URL to fetch.
    pub url: String,

    /// Fetch the target as a plain binary over HTTP instead of going through
    /// the external extraction tool.
    pub direct: bool,

    /// Fetch the media file itself. When false in tool mode, only thumbnails
    /// and metadata are extracted.
    pub media: bool,

    /// Extract audio only.
    pub audio: bool,

    /// Transcode the media to a widely playable format.
    pub transcode: bool,

    /// Also fetch a thumbnail image.
    pub thumbnail: bool,

    /// Also fetch the tool's extracted metadata document.
    pub metadata: bool,
}

impl Download {
    /// A direct binary fetch of the target URL.
    pub fn direct(url: impl Into<String>) -> Self {
        Download {
            url: url.into(),
            direct: true,
            media: true,
            audio: false,
            transcode: false,
            thumbnail: false,
            metadata: false,
        }
    }

    /// A tool-mediated media fetch of the target URL.
    pub fn tool(url: impl Into<String>) -> Self {
        Download {
            url: url.into(),
            direct: false,
            media: true,
            audio: false,
            transcode: false,
            thumbnail: false,
            metadata: false,
        }
    }

    /// Extract audio only.
    pub fn audio(mut self, audio: bool) -> Self {
        self.audio = audio;
        self
    }

    /// Transcode the media to a widely playable format.
    pub fn transcode(mut self, transcode: bool) -> Self {
        self.transcode = transcode;
        self
    }

    /// Skip the media file itself, fetching only thumbnails and metadata.
    pub fn skip_media(mut self) -> Self {
        self.media = false;
        self
    }

    /// Also fetch a thumbnail image.
    pub fn thumbnail(mut self, thumbnail: bool) -> Self {
        self.thumbnail = thumbnail;
        self
    }

    /// Also fetch the tool's extracted metadata document.
    pub fn metadata(mut self, metadata: bool) -> Self {
        self.metadata = metadata;
        self
    }
}

/// The outcome of one attachment fetch.
///
/// Filenames are relative to `dir`, which points at permanent storage by the
/// time the result reaches the engine: the fetch relocates files out of its
/// temp directory before returning.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DownloadResult {
    /// The URL that was fetched.
    pub url: String,

    /// Directory holding the fetched files.
    pub dir: PathBuf,

    /// Filename of the media file, if one was produced.
    pub media: Option<String>,

    /// Filename of the thumbnail image, if one was produced.
    pub image: Option<String>,

    /// Filename of the extracted metadata document, if one was produced.
    pub metadata: Option<String>,

    /// Parsed contents of the metadata document.
    pub data: Option<Value>,

    /// Size of the media file in bytes.
    pub size: Option<u64>,

    /// MIME type of the media file.
    pub mime: Option<String>,
}
