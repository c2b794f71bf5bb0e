use anyhow::{Context, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{lowercase_extension, MediaItem, MetadataExtractor};

/// Walk an export directory and build one `MediaItem` per media file.
///
/// Only files whose lowercase extension is in `extensions` are kept, so sidecars
/// and unknown types are skipped. Items come back sorted by path, so the same
/// export always produces the same order and the same ids.
pub fn discover_media(
    directory: &Path,
    extensions: &[String],
    extractor: &dyn MetadataExtractor,
) -> Result<Vec<MediaItem>> {
    if !directory.is_dir() {
        anyhow::bail!("{} is not a directory", directory.display());
    }

    let mut paths: Vec<PathBuf> = Vec::new();

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        if !path.is_file() {
            continue;
        }
        let known = lowercase_extension(path).is_some_and(|ext| ext != "json" && extensions.contains(&ext));
        if !known {
            tracing::debug!(path = %path.display(), "Skipping file of unknown type");
            continue;
        }
        paths.push(path.to_path_buf());
    }

    // Sort by path for consistent ordering
    paths.sort();

    // Metadata reads are independent; collect keeps the sorted order.
    let items = paths
        .par_iter()
        .enumerate()
        .map(|(index, path)| {
            let mut item = MediaItem::new(format!("item-{}", index + 1), path.clone());
            match extractor.extract(path) {
                Ok(metadata) => item.apply_metadata(metadata),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Metadata extraction failed");
                }
            }
            item
        })
        .collect::<Vec<_>>();

    tracing::info!(directory = %directory.display(), count = items.len(), "Discovered media");
    Ok(items)
}

/// Like [`discover_media`] but resolves the directory first.
pub fn discover_media_in(
    directory: &str,
    extensions: &[String],
    extractor: &dyn MetadataExtractor,
) -> Result<Vec<MediaItem>> {
    let path = std::fs::canonicalize(directory)
        .with_context(|| format!("Cannot resolve export directory {}", directory))?;
    discover_media(&path, extensions, extractor)
}
