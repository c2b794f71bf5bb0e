pub mod discovery;
pub mod metadata;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use discovery::{discover_media, discover_media_in};
pub use metadata::{ExifSidecarExtractor, MediaMetadata, MetadataExtractor};

pub const DEFAULT_STILL_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "heic", "heif", "png", "webp", "dng"];

pub const DEFAULT_VIDEO_EXTENSIONS: [&str; 6] = ["mov", "mp4", "m4v", "3gp", "avi", "mkv"];

/// Proprietary motion containers that have to be transcoded before pairing.
pub const DEFAULT_MOTION_EXTENSIONS: [&str; 2] = ["mp", "m"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileKind {
    Photo,
    Video,
    LivePhoto,
    MotionPhoto,
    Unknown,
}

impl FileKind {
    /// Classify a path by its (case-insensitive) extension against the default tables.
    ///
    /// The pairing engine reclassifies items with its configured extension lists.
    pub fn from_path(path: &Path) -> Self {
        match lowercase_extension(path).as_deref() {
            Some(ext) if DEFAULT_STILL_EXTENSIONS.contains(&ext) => FileKind::Photo,
            Some(ext) if DEFAULT_VIDEO_EXTENSIONS.contains(&ext) => FileKind::Video,
            Some(ext) if DEFAULT_MOTION_EXTENSIONS.contains(&ext) => FileKind::MotionPhoto,
            _ => FileKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// One file from the export, plus what we know about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub source_location: PathBuf,
    pub file_kind: FileKind,
    pub timestamp: Option<DateTime<Utc>>,
    pub geolocation: Option<GeoLocation>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub album_names: Vec<String>,
    pub is_favorite: bool,
    /// Set once this item is confirmed as the still half of a Live Photo.
    pub paired_motion_location: Option<PathBuf>,
    /// Set once this item is confirmed as the motion half of a Live Photo.
    pub is_motion_component: bool,
    pub raw_metadata: Option<BTreeMap<String, String>>,
}

impl MediaItem {
    pub fn new(id: impl Into<String>, source_location: impl Into<PathBuf>) -> Self {
        let source_location = source_location.into();
        Self {
            id: id.into(),
            file_kind: FileKind::from_path(&source_location),
            source_location,
            timestamp: None,
            geolocation: None,
            title: None,
            description: None,
            album_names: Vec::new(),
            is_favorite: false,
            paired_motion_location: None,
            is_motion_component: false,
            raw_metadata: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_favorite(mut self, favorite: bool) -> Self {
        self.is_favorite = favorite;
        self
    }

    /// Copy extracted metadata onto the item.
    pub fn apply_metadata(&mut self, metadata: MediaMetadata) {
        self.timestamp = metadata.taken_at.or(self.timestamp);
        self.geolocation = metadata.geolocation.or(self.geolocation);
        self.title = metadata.title.or(self.title.take());
        self.description = metadata.description.or(self.description.take());
        self.is_favorite |= metadata.favorite;
        for album in metadata.albums {
            if !self.album_names.contains(&album) {
                self.album_names.push(album);
            }
        }
        if !metadata.raw.is_empty() {
            self.raw_metadata = Some(metadata.raw);
        }
    }

    /// File name without its extension.
    pub fn base_name(&self) -> Option<String> {
        self.source_location
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
    }

    pub fn file_name(&self) -> String {
        self.source_location
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source_location.to_string_lossy().to_string())
    }

    pub fn extension(&self) -> Option<String> {
        lowercase_extension(&self.source_location)
    }

    /// Neither half of a confirmed pair.
    pub fn is_single(&self) -> bool {
        self.paired_motion_location.is_none() && !self.is_motion_component
    }

    /// Undo a pairing, restoring the kind the pairing pass classified this item as.
    pub(crate) fn clear_pairing(&mut self, kind: FileKind) {
        self.paired_motion_location = None;
        self.is_motion_component = false;
        self.file_kind = kind;
    }
}

pub(crate) fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension().map(|ext| ext.to_string_lossy().to_lowercase())
}
