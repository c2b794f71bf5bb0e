//! End-to-end migration: pair, convert, merge, then import in batches.

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::batch::{AdaptiveBatchScheduler, RunReport};
use crate::config::Config;
use crate::error::PipelineError;
use crate::events::ProgressEventBus;
use crate::library::{AssetId, AssetMetadata, AssetRequest, PhotoLibrary, Transcoder};
use crate::media::MediaItem;
use crate::memory::MemoryPressureMonitor;
use crate::pairing::{ImportItem, LivePhotoPairingEngine, PairingFailure};
use crate::reconstruct::LivePhotoReconstructor;

/// A successfully imported item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedAsset {
    pub item_id: String,
    pub asset_id: AssetId,
    pub live_photo: bool,
}

#[derive(Debug)]
pub struct MigrationReport {
    pub discovered: usize,
    pub pairs: usize,
    pub singles: usize,
    pub conversion_failures: Vec<PairingFailure>,
    pub run: RunReport<ImportedAsset>,
}

impl MigrationReport {
    pub fn live_photos_imported(&self) -> usize {
        self.run
            .results
            .iter()
            .filter(|r| matches!(r, Ok(asset) if asset.live_photo))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &PipelineError> {
        self.run.results.iter().filter_map(|r| r.as_ref().err())
    }
}

pub struct MigrationPipeline {
    engine: LivePhotoPairingEngine,
    reconstructor: LivePhotoReconstructor,
    transcoder: Arc<dyn Transcoder>,
    scheduler: AdaptiveBatchScheduler,
}

impl MigrationPipeline {
    pub fn new(
        engine: LivePhotoPairingEngine,
        library: Arc<dyn PhotoLibrary>,
        transcoder: Arc<dyn Transcoder>,
        scheduler: AdaptiveBatchScheduler,
    ) -> Self {
        Self {
            engine,
            reconstructor: LivePhotoReconstructor::new(library),
            transcoder,
            scheduler,
        }
    }

    pub fn from_config(
        config: &Config,
        library: Arc<dyn PhotoLibrary>,
        transcoder: Arc<dyn Transcoder>,
        monitor: Arc<MemoryPressureMonitor>,
        bus: Arc<ProgressEventBus>,
        cancel: CancellationToken,
    ) -> Self {
        let engine = LivePhotoPairingEngine::new(config.pairing.clone());
        let scheduler = AdaptiveBatchScheduler::new(config.batch.clone(), monitor, bus, cancel);
        Self::new(engine, library, transcoder, scheduler)
    }

    pub fn scheduler(&self) -> &AdaptiveBatchScheduler {
        &self.scheduler
    }

    /// Pair `items`, then import pairs and singles in their original order.
    pub async fn run(&self, items: Vec<MediaItem>) -> Result<MigrationReport, PipelineError> {
        let discovered = items.len();
        let report = self
            .engine
            .pair_and_convert(items, self.transcoder.as_ref())
            .await;

        let pairs = report.pairs.len();
        let singles = report.single_count();
        let conversion_failures = report.failures.clone();
        tracing::info!(
            discovered,
            pairs,
            singles,
            conversion_failures = conversion_failures.len(),
            "Pairing finished"
        );

        let import_items = report.into_import_items();
        let reconstructor = &self.reconstructor;
        let run = self
            .scheduler
            .run(import_items, |batch| async move {
                Ok(batch
                    .process_items(|item| import_item(reconstructor, item))
                    .await)
            })
            .await?;

        Ok(MigrationReport {
            discovered,
            pairs,
            singles,
            conversion_failures,
            run,
        })
    }
}

async fn import_item(
    reconstructor: &LivePhotoReconstructor,
    item: ImportItem,
) -> Result<ImportedAsset, PipelineError> {
    match item {
        ImportItem::LivePhoto(pair) => {
            let item_id = pair.still.id.clone();
            let asset_id = reconstructor.reconstruct(pair, None).await.into_result()?;
            Ok(ImportedAsset {
                item_id,
                asset_id,
                live_photo: true,
            })
        }
        ImportItem::Single(item) => {
            let request = AssetRequest {
                still: item.source_location.clone(),
                motion: None,
                metadata: AssetMetadata::from(&item),
                pairing_token: None,
            };
            let asset_id = reconstructor
                .library()
                .create_asset(&request)
                .await
                .map_err(|e| {
                    tracing::warn!(id = %item.id, error = %e, "Import failed");
                    PipelineError::import(format!("{:#}", e))
                })?;
            Ok(ImportedAsset {
                item_id: item.id,
                asset_id,
                live_photo: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchSettings;
    use crate::events::ProgressEvent;
    use crate::library::{DirectoryLibrary, FfmpegTranscoder};
    use crate::memory::tests::FakeProbe;
    use crate::memory::MemoryThresholds;
    use crate::pairing::PairingConfig;
    use crate::reconstruct::tests::FakeLibrary;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    struct FailingTranscoder;

    #[async_trait]
    impl Transcoder for FailingTranscoder {
        async fn transcode(&self, _motion: &Path) -> anyhow::Result<PathBuf> {
            Err(anyhow!("ffmpeg missing"))
        }
    }

    fn pipeline(library: Arc<dyn PhotoLibrary>, bus: Arc<ProgressEventBus>, batch_size: usize) -> MigrationPipeline {
        pipeline_with(library, Arc::new(FailingTranscoder), bus, batch_size)
    }

    fn pipeline_with(
        library: Arc<dyn PhotoLibrary>,
        transcoder: Arc<dyn Transcoder>,
        bus: Arc<ProgressEventBus>,
        batch_size: usize,
    ) -> MigrationPipeline {
        let probe = FakeProbe::new(1000, 500);
        let monitor = Arc::new(MemoryPressureMonitor::new(Box::new(probe), MemoryThresholds::default()));
        let settings = BatchSettings {
            batch_size,
            pause_between_batches_ms: 0,
            ..Default::default()
        };
        let scheduler = AdaptiveBatchScheduler::new(settings, monitor, bus, CancellationToken::new());
        MigrationPipeline::new(
            LivePhotoPairingEngine::new(PairingConfig::default()),
            library,
            transcoder,
            scheduler,
        )
    }

    fn write_files(dir: &Path, names: &[&str]) -> Vec<MediaItem> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let path = dir.join(name);
                std::fs::write(&path, name.as_bytes()).unwrap();
                MediaItem::new(format!("item-{}", i), path)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pairs_and_singles_are_imported_in_order() {
        let dir = tempdir().unwrap();
        let items = write_files(
            dir.path(),
            &["a.jpg", "IMG_1.HEIC", "IMG_1.MOV", "b.png", "PXL_2.jpg", "PXL_2.MP"],
        );
        let library = Arc::new(FakeLibrary::default());
        let bus = Arc::new(ProgressEventBus::new());

        let report = pipeline(library.clone(), bus.clone(), 2).run(items).await.unwrap();

        assert_eq!(report.discovered, 6);
        assert_eq!(report.pairs, 1);
        // The PXL pair failed conversion and came back as two singles.
        assert_eq!(report.singles, 4);
        assert_eq!(report.conversion_failures.len(), 1);

        let imported: Vec<String> = report
            .run
            .results
            .iter()
            .map(|r| r.as_ref().unwrap().item_id.clone())
            .collect();
        assert_eq!(imported, vec!["item-0", "item-1", "item-3", "item-4", "item-5"]);
        assert_eq!(report.live_photos_imported(), 1);
        assert_eq!(report.run.success_count + report.run.failure_count, 5);

        let created = library.created.lock().unwrap();
        assert_eq!(created.len(), 5);
        assert!(created[1].motion.is_some());
        assert!(created.iter().filter(|r| r.motion.is_some()).count() == 1);
        drop(created);

        assert_eq!(bus.overall_progress(), 100.0);
    }

    #[tokio::test]
    async fn test_all_failures_still_complete() {
        let dir = tempdir().unwrap();
        let names: Vec<String> = (0..10).map(|i| format!("photo_{}.jpg", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let items = write_files(dir.path(), &refs);
        let library = Arc::new(FakeLibrary {
            fail_create: true,
            ..Default::default()
        });
        let bus = Arc::new(ProgressEventBus::new());

        let report = pipeline(library, bus.clone(), 10).run(items).await.unwrap();

        assert_eq!(report.run.failure_count, 10);
        assert_eq!(report.run.success_count, 0);
        assert!(!report.run.cancelled);
        assert!(report
            .failures()
            .all(|e| matches!(e, PipelineError::ImportFailure { .. })));
        assert!(matches!(
            bus.history().last().unwrap().event,
            ProgressEvent::Completed {
                total: 10,
                success: 0,
                fail: 10
            }
        ));
    }

    #[tokio::test]
    async fn test_directory_library_end_to_end() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let items = write_files(source.path(), &["IMG_7.HEIC", "IMG_7.MOV", "note.jpg"]);
        let library = Arc::new(DirectoryLibrary::new(dest.path(), false));
        let bus = Arc::new(ProgressEventBus::new());

        let report = pipeline(library, bus, 50).run(items).await.unwrap();

        assert_eq!(report.run.success_count, 2);
        assert_eq!(report.live_photos_imported(), 1);
        let unknown = dest.path().join("unknown");
        assert!(unknown.join("img-7_001.heic").is_file());
        assert!(unknown.join("img-7_001.mov").is_file());
        assert!(unknown.join("note_001.jpg").is_file());
    }

    #[tokio::test]
    async fn test_dry_run_writes_no_files() {
        let source = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let dest = scratch.path().join("library");
        let transcode_dir = scratch.path().join("motion");
        let items = write_files(source.path(), &["PXL_3.jpg", "PXL_3.MP", "IMG_8.HEIC", "IMG_8.MOV"]);

        let library = Arc::new(DirectoryLibrary::new(&dest, true));
        let transcoder = Arc::new(
            FfmpegTranscoder::new(&transcode_dir)
                .with_binary(scratch.path().join("no-such-ffmpeg"))
                .with_dry_run(true),
        );
        let bus = Arc::new(ProgressEventBus::new());

        let report = pipeline_with(library, transcoder, bus, 50).run(items).await.unwrap();

        assert_eq!(report.pairs, 2);
        assert!(report.conversion_failures.is_empty());
        assert_eq!(report.live_photos_imported(), 2);
        assert!(!dest.exists());
        assert!(!transcode_dir.exists());
        assert_eq!(std::fs::read_dir(source.path()).unwrap().count(), 4);
    }
}
