use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::GeoLocation;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaMetadata {
    pub taken_at: Option<DateTime<Utc>>,
    pub geolocation: Option<GeoLocation>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub favorite: bool,
    pub albums: Vec<String>,
    /// Camera fields kept verbatim.
    pub raw: BTreeMap<String, String>,
}

/// Source of per-file metadata.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<MediaMetadata>;
}

/// Reads EXIF from the file itself, then overlays the export's JSON sidecar.
#[derive(Debug, Clone, Default)]
pub struct ExifSidecarExtractor;

impl MetadataExtractor for ExifSidecarExtractor {
    fn extract(&self, path: &Path) -> Result<MediaMetadata> {
        let mut metadata = read_exif(path);

        if let Some(sidecar_path) = find_sidecar(path) {
            let sidecar = read_sidecar(&sidecar_path)?;
            sidecar.overlay(&mut metadata);
        }

        if let Some(album) = album_title(path) {
            metadata.albums.push(album);
        }

        Ok(metadata)
    }
}

fn read_exif(path: &Path) -> MediaMetadata {
    let mut metadata = MediaMetadata::default();

    let Ok(file) = File::open(path) else {
        return metadata;
    };
    let mut bufreader = BufReader::new(file);
    let Ok(exif) = exif::Reader::new().read_from_container(&mut bufreader) else {
        return metadata;
    };

    for (tag, key) in [(exif::Tag::Make, "exif.make"), (exif::Tag::Model, "exif.model")] {
        if let Some(field) = exif.get_field(tag, exif::In::PRIMARY) {
            let value = field.display_value().to_string().trim_matches('"').to_string();
            metadata.raw.insert(key.to_string(), value);
        }
    }

    if let Some(field) = exif.get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY) {
        if let exif::Value::Ascii(ref values) = field.value {
            if let Some(bytes) = values.first() {
                if let Ok(dt) = exif::DateTime::from_ascii(bytes) {
                    metadata.taken_at = NaiveDate::from_ymd_opt(dt.year as i32, dt.month as u32, dt.day as u32)
                        .and_then(|d| d.and_hms_opt(dt.hour as u32, dt.minute as u32, dt.second as u32))
                        .map(|naive| naive.and_utc());
                }
            }
        }
    }

    if let (Some(lat_field), Some(lat_ref), Some(lon_field), Some(lon_ref)) = (
        exif.get_field(exif::Tag::GPSLatitude, exif::In::PRIMARY),
        exif.get_field(exif::Tag::GPSLatitudeRef, exif::In::PRIMARY),
        exif.get_field(exif::Tag::GPSLongitude, exif::In::PRIMARY),
        exif.get_field(exif::Tag::GPSLongitudeRef, exif::In::PRIMARY),
    ) {
        if let (exif::Value::Rational(lat_vals), exif::Value::Rational(lon_vals)) =
            (&lat_field.value, &lon_field.value)
        {
            if lat_vals.len() >= 3 && lon_vals.len() >= 3 {
                let lat = dms_to_decimal(ratio(&lat_vals[0]), ratio(&lat_vals[1]), ratio(&lat_vals[2]));
                let lon = dms_to_decimal(ratio(&lon_vals[0]), ratio(&lon_vals[1]), ratio(&lon_vals[2]));

                let lat_ref_str = lat_ref.display_value().to_string();
                let lon_ref_str = lon_ref.display_value().to_string();

                metadata.geolocation = Some(GeoLocation {
                    latitude: if lat_ref_str.contains('S') { -lat } else { lat },
                    longitude: if lon_ref_str.contains('W') { -lon } else { lon },
                });
            }
        }
    }

    metadata
}

fn ratio(r: &exif::Rational) -> f64 {
    r.num as f64 / r.denom as f64
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    title: Option<String>,
    description: Option<String>,
    photo_taken_time: Option<SidecarTime>,
    geo_data: Option<SidecarGeo>,
    #[serde(default)]
    favorited: bool,
}

#[derive(Debug, Deserialize)]
struct SidecarTime {
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct SidecarGeo {
    latitude: f64,
    longitude: f64,
}

impl Sidecar {
    fn overlay(self, metadata: &mut MediaMetadata) {
        if let Some(taken) = self
            .photo_taken_time
            .and_then(|t| t.timestamp.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        {
            metadata.taken_at = Some(taken);
        }

        // Exports write 0.0/0.0 when the location is unknown.
        if let Some(geo) = self.geo_data {
            if geo.latitude != 0.0 || geo.longitude != 0.0 {
                metadata.geolocation = Some(GeoLocation {
                    latitude: geo.latitude,
                    longitude: geo.longitude,
                });
            }
        }

        metadata.title = self.title.filter(|t| !t.is_empty()).or(metadata.title.take());
        metadata.description = self
            .description
            .filter(|d| !d.is_empty())
            .or(metadata.description.take());
        metadata.favorite |= self.favorited;
    }
}

fn read_sidecar(path: &Path) -> Result<Sidecar> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sidecar {}", path.display()))?;
    let sidecar = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse sidecar {}", path.display()))?;
    Ok(sidecar)
}

/// `<file>.json` or `<file>.supplemental-metadata.json` next to the media file.
pub fn find_sidecar(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?.to_string_lossy().to_string();
    let parent = path.parent()?;

    [
        format!("{}.json", file_name),
        format!("{}.supplemental-metadata.json", file_name),
    ]
    .into_iter()
    .map(|name| parent.join(name))
    .find(|candidate| candidate.is_file())
}

#[derive(Debug, Deserialize)]
struct AlbumMetadata {
    title: Option<String>,
}

fn album_title(path: &Path) -> Option<String> {
    let folder_metadata = path.parent()?.join("metadata.json");
    let content = std::fs::read_to_string(folder_metadata).ok()?;
    let album: AlbumMetadata = serde_json::from_str(&content).ok()?;
    album.title.filter(|t| !t.is_empty())
}
