//! Destination photo library and transcoder interfaces.
//!
//! The pipeline only talks to these traits. `DirectoryLibrary` and
//! `FfmpegTranscoder` are the implementations the CLI uses.

pub mod directory;
pub mod transcode;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::media::{GeoLocation, MediaItem};

pub use directory::DirectoryLibrary;
pub use transcode::FfmpegTranscoder;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetId(pub String);

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata attached to a created asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMetadata {
    pub taken_at: Option<DateTime<Utc>>,
    pub location: Option<GeoLocation>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub favorite: bool,
    pub albums: Vec<String>,
}

impl From<&MediaItem> for AssetMetadata {
    fn from(item: &MediaItem) -> Self {
        Self {
            taken_at: item.timestamp,
            location: item.geolocation,
            title: item.title.clone(),
            description: item.description.clone(),
            favorite: item.is_favorite,
            albums: item.album_names.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetRequest {
    pub still: PathBuf,
    pub motion: Option<PathBuf>,
    pub metadata: AssetMetadata,
    pub pairing_token: Option<Uuid>,
}

#[async_trait]
pub trait PhotoLibrary: Send + Sync {
    /// Create one asset from a still and, for Live Photos, its motion clip.
    async fn create_asset(&self, request: &AssetRequest) -> Result<AssetId>;

    /// Whether the library treats the asset as a Live Photo.
    async fn verify_is_live_photo(&self, asset_id: &AssetId) -> Result<bool>;

    /// Write a shared pairing token to both components.
    async fn sync_pairing_token(&self, still: &Path, motion: &Path, token: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Convert a proprietary motion container to a standard video file.
    async fn transcode(&self, motion: &Path) -> Result<PathBuf>;
}
