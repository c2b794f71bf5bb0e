//! Live Photo pairing.
//!
//! Stills and motion clips are matched in two passes:
//! 1. Items sharing a base name (`IMG_0001.HEIC` + `IMG_0001.MOV`). Groups are
//!    visited in first-seen order and the first still pairs with the first
//!    motion clip of its group.
//! 2. Remaining stills, in input order, take the first remaining motion clip
//!    whose timestamp is within the tolerance. This is greedy: a clip taken by
//!    an earlier still is gone even if a later still was closer to it.
//!
//! Proprietary motion containers are transcoded by [`LivePhotoPairingEngine::finalize`];
//! a pair whose conversion fails falls back to two singles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::PipelineError;
use crate::library::Transcoder;
use crate::media::{
    lowercase_extension, FileKind, MediaItem, DEFAULT_MOTION_EXTENSIONS, DEFAULT_STILL_EXTENSIONS,
    DEFAULT_VIDEO_EXTENSIONS,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingConfig {
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: i64,
    #[serde(default = "default_still_extensions")]
    pub still_extensions: Vec<String>,
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
    /// Containers that must be transcoded before they can be a motion component.
    #[serde(default = "default_motion_extensions")]
    pub motion_extensions: Vec<String>,
}

fn default_tolerance_secs() -> i64 {
    60
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn default_still_extensions() -> Vec<String> {
    to_strings(&DEFAULT_STILL_EXTENSIONS)
}

fn default_video_extensions() -> Vec<String> {
    to_strings(&DEFAULT_VIDEO_EXTENSIONS)
}

fn default_motion_extensions() -> Vec<String> {
    to_strings(&DEFAULT_MOTION_EXTENSIONS)
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            tolerance_secs: default_tolerance_secs(),
            still_extensions: default_still_extensions(),
            video_extensions: default_video_extensions(),
            motion_extensions: default_motion_extensions(),
        }
    }
}

impl PairingConfig {
    /// Every extension the engine gives a role to, lowercased.
    pub fn media_extensions(&self) -> Vec<String> {
        self.still_extensions
            .iter()
            .chain(&self.video_extensions)
            .chain(&self.motion_extensions)
            .map(|ext| ext.to_lowercase())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Still,
    Motion { proprietary: bool },
    Other,
}

impl Role {
    fn file_kind(self) -> FileKind {
        match self {
            Role::Still => FileKind::Photo,
            Role::Motion { proprietary: true } => FileKind::MotionPhoto,
            Role::Motion { proprietary: false } => FileKind::Video,
            Role::Other => FileKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PairingMethod {
    BaseName,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePair {
    pub still: MediaItem,
    pub motion: MediaItem,
    pub base_name: String,
    pub representative_timestamp: Option<DateTime<Utc>>,
    /// Set if either component is a favorite.
    pub favorite: bool,
    pub method: PairingMethod,
    /// Motion file to upload; differs from the source after transcoding.
    pub motion_location: PathBuf,
    pub needs_conversion: bool,
    still_position: usize,
    motion_position: usize,
}

impl CandidatePair {
    pub fn still_location(&self) -> &PathBuf {
        &self.still.source_location
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairingFailure {
    pub still_id: String,
    pub motion_id: String,
    pub error: PipelineError,
}

/// One unit of import work, in input order.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportItem {
    LivePhoto(CandidatePair),
    Single(MediaItem),
}

impl ImportItem {
    pub fn id(&self) -> &str {
        match self {
            ImportItem::LivePhoto(pair) => &pair.still.id,
            ImportItem::Single(item) => &item.id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PairingReport {
    pub pairs: Vec<CandidatePair>,
    singles: Vec<(usize, MediaItem)>,
    pub failures: Vec<PairingFailure>,
}

impl PairingReport {
    /// Unpaired items in input order.
    pub fn singles(&self) -> impl Iterator<Item = &MediaItem> {
        self.singles.iter().map(|(_, item)| item)
    }

    pub fn single_count(&self) -> usize {
        self.singles.len()
    }

    pub fn total_items(&self) -> usize {
        self.pairs.len() * 2 + self.singles.len()
    }

    /// Pairs and singles merged back into input order; a pair sits where its still was.
    pub fn into_import_items(self) -> Vec<ImportItem> {
        let mut entries: Vec<(usize, ImportItem)> = self
            .pairs
            .into_iter()
            .map(|pair| (pair.still_position, ImportItem::LivePhoto(pair)))
            .chain(
                self.singles
                    .into_iter()
                    .map(|(position, item)| (position, ImportItem::Single(item))),
            )
            .collect();
        entries.sort_by_key(|(position, _)| *position);
        entries.into_iter().map(|(_, item)| item).collect()
    }

    fn push_single(&mut self, position: usize, item: MediaItem) {
        let index = self.singles.partition_point(|(p, _)| *p < position);
        self.singles.insert(index, (position, item));
    }
}

pub struct LivePhotoPairingEngine {
    config: PairingConfig,
}

impl LivePhotoPairingEngine {
    pub fn new(config: PairingConfig) -> Self {
        let normalize = |values: &[String]| -> Vec<String> { values.iter().map(|v| v.to_lowercase()).collect() };
        Self {
            config: PairingConfig {
                tolerance_secs: config.tolerance_secs.max(0),
                still_extensions: normalize(&config.still_extensions),
                video_extensions: normalize(&config.video_extensions),
                motion_extensions: normalize(&config.motion_extensions),
            },
        }
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    fn role(&self, item: &MediaItem) -> Role {
        let Some(ext) = lowercase_extension(&item.source_location) else {
            return Role::Other;
        };
        if self.config.still_extensions.contains(&ext) {
            Role::Still
        } else if self.config.motion_extensions.contains(&ext) {
            Role::Motion { proprietary: true }
        } else if self.config.video_extensions.contains(&ext) {
            Role::Motion { proprietary: false }
        } else {
            Role::Other
        }
    }

    /// Find Live Photo pairs. Synchronous and deterministic for a given input order.
    pub fn identify_pairs(&self, mut items: Vec<MediaItem>) -> PairingReport {
        let roles: Vec<Role> = items.iter().map(|item| self.role(item)).collect();
        // Kinds follow the configured extension lists, not the built-in defaults.
        for (item, role) in items.iter_mut().zip(&roles) {
            item.file_kind = role.file_kind();
        }

        // Insertion-ordered grouping: `groups` keeps first-seen order, the map only indexes it.
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();
        for (position, item) in items.iter().enumerate() {
            let Some(base) = item.base_name() else {
                tracing::debug!(id = %item.id, "No base name, not grouped");
                continue;
            };
            match group_index.get(&base) {
                Some(&index) => groups[index].1.push(position),
                None => {
                    group_index.insert(base.clone(), groups.len());
                    groups.push((base, vec![position]));
                }
            }
        }

        let mut consumed = vec![false; items.len()];
        let mut matches: Vec<(usize, usize, String, PairingMethod)> = Vec::new();

        for (base, members) in &groups {
            if members.len() < 2 {
                continue;
            }
            let still = members.iter().copied().find(|&p| roles[p] == Role::Still);
            let motion = members
                .iter()
                .copied()
                .find(|&p| matches!(roles[p], Role::Motion { .. }));
            if let (Some(still), Some(motion)) = (still, motion) {
                consumed[still] = true;
                consumed[motion] = true;
                matches.push((still, motion, base.clone(), PairingMethod::BaseName));
            }
        }

        let tolerance = chrono::Duration::seconds(self.config.tolerance_secs);
        for still in 0..items.len() {
            if consumed[still] || roles[still] != Role::Still {
                continue;
            }
            let Some(still_time) = items[still].timestamp else {
                continue;
            };
            let candidate = (0..items.len()).find(|&motion| {
                !consumed[motion]
                    && matches!(roles[motion], Role::Motion { .. })
                    && items[motion]
                        .timestamp
                        .map(|t| {
                            let gap = still_time - t;
                            -tolerance <= gap && gap <= tolerance
                        })
                        .unwrap_or(false)
            });
            if let Some(motion) = candidate {
                consumed[still] = true;
                consumed[motion] = true;
                let base = items[still].base_name().unwrap_or_else(|| items[still].id.clone());
                matches.push((still, motion, base, PairingMethod::Timestamp));
            }
        }

        matches.sort_by_key(|(still, _, _, _)| *still);

        let mut slots: Vec<Option<MediaItem>> = items.into_iter().map(Some).collect();
        let mut report = PairingReport::default();

        for (still_position, motion_position, base_name, method) in matches {
            let (Some(mut still), Some(mut motion)) =
                (slots[still_position].take(), slots[motion_position].take())
            else {
                continue;
            };

            let needs_conversion = roles[motion_position] == Role::Motion { proprietary: true };
            let motion_location = motion.source_location.clone();

            still.paired_motion_location = Some(motion_location.clone());
            still.file_kind = FileKind::LivePhoto;
            motion.is_motion_component = true;

            tracing::debug!(
                still = %still.id,
                motion = %motion.id,
                base = %base_name,
                method = ?method,
                "Paired Live Photo"
            );

            report.pairs.push(CandidatePair {
                representative_timestamp: still.timestamp.or(motion.timestamp),
                favorite: still.is_favorite || motion.is_favorite,
                still,
                motion,
                base_name,
                method,
                motion_location,
                needs_conversion,
                still_position,
                motion_position,
            });
        }

        report.singles = slots
            .into_iter()
            .enumerate()
            .filter_map(|(position, slot)| slot.map(|item| (position, item)))
            .collect();

        tracing::info!(
            pairs = report.pairs.len(),
            singles = report.singles.len(),
            "Pairing pass complete"
        );
        report
    }

    /// Transcode proprietary motion containers. Pairs that fail are demoted to singles.
    pub async fn finalize(&self, report: PairingReport, transcoder: &dyn Transcoder) -> PairingReport {
        let PairingReport {
            pairs,
            singles,
            failures,
        } = report;
        let mut finalized = PairingReport {
            pairs: Vec::with_capacity(pairs.len()),
            singles,
            failures,
        };

        for mut pair in pairs {
            if !pair.needs_conversion {
                finalized.pairs.push(pair);
                continue;
            }

            match transcoder.transcode(&pair.motion.source_location).await {
                Ok(converted) => {
                    pair.still.paired_motion_location = Some(converted.clone());
                    pair.motion_location = converted;
                    pair.needs_conversion = false;
                    finalized.pairs.push(pair);
                }
                Err(e) => {
                    tracing::warn!(
                        still = %pair.still.id,
                        motion = %pair.motion.source_location.display(),
                        error = %e,
                        "Motion conversion failed, keeping components as singles"
                    );
                    finalized.failures.push(PairingFailure {
                        still_id: pair.still.id.clone(),
                        motion_id: pair.motion.id.clone(),
                        error: PipelineError::conversion(&pair.motion.source_location, format!("{:#}", e)),
                    });

                    let CandidatePair {
                        mut still,
                        mut motion,
                        still_position,
                        motion_position,
                        ..
                    } = pair;
                    still.clear_pairing(Role::Still.file_kind());
                    motion.clear_pairing(Role::Motion { proprietary: true }.file_kind());
                    finalized.push_single(still_position, still);
                    finalized.push_single(motion_position, motion);
                }
            }
        }

        finalized
    }

    /// `identify_pairs` followed by `finalize`.
    pub async fn pair_and_convert(&self, items: Vec<MediaItem>, transcoder: &dyn Transcoder) -> PairingReport {
        let report = self.identify_pairs(items);
        self.finalize(report, transcoder).await
    }
}

impl Default for LivePhotoPairingEngine {
    fn default() -> Self {
        Self::new(PairingConfig::default())
    }
}
