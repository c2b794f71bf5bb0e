//! A photo library that is just a folder tree.
//!
//! Assets land in a Year/Month hierarchy next to a JSON manifest:
//! ```text
//! /Library/
//! ├── 2024/
//! │   └── 03/
//! │       ├── img-0001_001.heic
//! │       ├── img-0001_001.mov
//! │       └── img-0001_001.asset.json
//! └── unknown/
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use super::{AssetId, AssetMetadata, AssetRequest, PhotoLibrary};

const ASSET_NAMESPACE: Uuid = Uuid::from_bytes([
    0x70, 0x68, 0x6f, 0x74, 0x6f, 0x6d, 0x69, 0x67, 0x72, 0x61, 0x74, 0x65, 0x00, 0x00, 0x00, 0x02,
]);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetManifest {
    pub asset_id: AssetId,
    pub still: PathBuf,
    pub motion: Option<PathBuf>,
    pub pairing_token: Option<Uuid>,
    pub metadata: AssetMetadata,
    pub created_at: DateTime<Utc>,
}

/// A Live Photo asset created but not yet verified.
struct PendingAsset {
    /// Only kept in dry-run; otherwise the manifest is re-read from `manifest_path`.
    manifest: Option<AssetManifest>,
    manifest_path: PathBuf,
    sources: Vec<PathBuf>,
}

/// Everything here is released once an asset is verified, except dry-run
/// reservations, which have no file on disk to stand in for them.
#[derive(Default)]
struct LibraryState {
    pending: HashMap<AssetId, PendingAsset>,
    tokens: HashMap<PathBuf, Uuid>,
    reserved: HashSet<PathBuf>,
}

pub struct DirectoryLibrary {
    root: PathBuf,
    dry_run: bool,
    state: Mutex<LibraryState>,
}

impl DirectoryLibrary {
    pub fn new(root: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            root: root.into(),
            dry_run,
            state: Mutex::new(LibraryState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The in-memory manifest of an unverified dry-run asset.
    pub fn manifest(&self, asset_id: &AssetId) -> Option<AssetManifest> {
        self.lock().pending.get(asset_id).and_then(|p| p.manifest.clone())
    }

    /// Assets created but not yet verified.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LibraryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn destination_folder(&self, metadata: &AssetMetadata) -> PathBuf {
        match metadata.taken_at {
            Some(taken) => self
                .root
                .join(format!("{:04}", taken.year()))
                .join(format!("{:02}", taken.month())),
            None => self.root.join("unknown"),
        }
    }

    /// First free `<stem>_NNN` in `folder`, checked against disk and this run's reservations.
    fn reserve_stem(&self, folder: &Path, still: &Path) -> String {
        let original = still
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "asset".to_string());
        let base = sanitize_filename(&original);

        let mut state = self.lock();
        let mut count = 1u32;
        loop {
            let stem = format!("{}_{:03}", base, count);
            let marker = folder.join(format!("{}.asset.json", stem));
            if !marker.exists() && !state.reserved.contains(&marker) {
                state.reserved.insert(marker);
                return stem;
            }
            count += 1;
        }
    }
}

/// Sanitize a string for use in filenames
fn sanitize_filename(s: &str) -> String {
    let cleaned = s
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' => c,
            _ => '-',
        })
        .collect::<String>()
        // Collapse multiple hyphens
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if cleaned.is_empty() {
        "asset".to_string()
    } else {
        cleaned
    }
}

fn target_name(stem: &str, source: &Path) -> String {
    match source.extension() {
        Some(ext) => format!("{}.{}", stem, ext.to_string_lossy().to_lowercase()),
        None => stem.to_string(),
    }
}

#[async_trait]
impl PhotoLibrary for DirectoryLibrary {
    async fn create_asset(&self, request: &AssetRequest) -> Result<AssetId> {
        let folder = self.destination_folder(&request.metadata);
        let stem = self.reserve_stem(&folder, &request.still);
        let asset_id = AssetId(
            Uuid::new_v5(&ASSET_NAMESPACE, folder.join(&stem).to_string_lossy().as_bytes()).to_string(),
        );

        let still_dest = folder.join(target_name(&stem, &request.still));
        let motion_dest = request
            .motion
            .as_ref()
            .map(|motion| folder.join(target_name(&stem, motion)));

        let manifest = AssetManifest {
            asset_id: asset_id.clone(),
            still: still_dest.clone(),
            motion: motion_dest.clone(),
            pairing_token: request.pairing_token,
            metadata: request.metadata.clone(),
            created_at: Utc::now(),
        };
        let manifest_path = folder.join(format!("{}.asset.json", stem));

        if self.dry_run {
            tracing::info!(still = %request.still.display(), dest = %still_dest.display(), "Dry run: would create asset");
        } else {
            tokio::fs::create_dir_all(&folder)
                .await
                .with_context(|| format!("Failed to create {}", folder.display()))?;
            tokio::fs::copy(&request.still, &still_dest)
                .await
                .with_context(|| format!("Failed to copy {}", request.still.display()))?;
            if let (Some(motion), Some(dest)) = (&request.motion, &motion_dest) {
                tokio::fs::copy(motion, dest)
                    .await
                    .with_context(|| format!("Failed to copy {}", motion.display()))?;
            }
            let json = serde_json::to_string_pretty(&manifest)?;
            tokio::fs::write(&manifest_path, json)
                .await
                .with_context(|| format!("Failed to write {}", manifest_path.display()))?;
        }

        let mut state = self.lock();
        if !self.dry_run {
            // The manifest on disk now holds the name.
            state.reserved.remove(&manifest_path);
        }
        // Only Live Photo candidates are ever verified.
        let Some(motion) = request.motion.clone() else {
            return Ok(asset_id);
        };
        let sources = vec![request.still.clone(), motion];
        state.pending.insert(
            asset_id.clone(),
            PendingAsset {
                manifest: self.dry_run.then_some(manifest),
                manifest_path,
                sources,
            },
        );
        Ok(asset_id)
    }

    async fn verify_is_live_photo(&self, asset_id: &AssetId) -> Result<bool> {
        let pending = {
            let mut state = self.lock();
            let pending = state
                .pending
                .remove(asset_id)
                .ok_or_else(|| anyhow!("Unknown asset {}", asset_id))?;
            for source in &pending.sources {
                state.tokens.remove(source);
            }
            pending
        };

        // Re-read what is on disk rather than trusting the in-memory copy.
        let manifest = match pending.manifest {
            Some(manifest) => manifest,
            None => {
                let path = &pending.manifest_path;
                let content = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str::<AssetManifest>(&content)?
            }
        };

        let Some(motion) = manifest.motion.as_ref() else {
            return Ok(false);
        };
        if !self.dry_run && !tokio::fs::try_exists(motion).await.unwrap_or(false) {
            return Ok(false);
        }
        Ok(manifest.pairing_token.is_some())
    }

    async fn sync_pairing_token(&self, still: &Path, motion: &Path, token: Uuid) -> Result<bool> {
        let mut state = self.lock();
        for path in [still, motion] {
            if let Some(existing) = state.tokens.get(path) {
                if *existing != token {
                    tracing::warn!(path = %path.display(), "Component already carries a different pairing token");
                    return Ok(false);
                }
            }
        }
        state.tokens.insert(still.to_path_buf(), token);
        state.tokens.insert(motion.to_path_buf(), token);
        Ok(true)
    }
}
