//! Turns a confirmed pair into one Live Photo asset in the destination library.

use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::library::{AssetId, AssetMetadata, AssetRequest, PhotoLibrary};
use crate::pairing::CandidatePair;

const PAIRING_NAMESPACE: Uuid = Uuid::from_bytes([
    0x70, 0x68, 0x6f, 0x74, 0x6f, 0x6d, 0x69, 0x67, 0x72, 0x61, 0x74, 0x65, 0x00, 0x00, 0x00, 0x01,
]);

/// Outcome of reconstructing one pair. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct PairProcessingResult {
    pub pair: CandidatePair,
    pub asset_id: Option<AssetId>,
    pub succeeded: bool,
    pub failure: Option<PipelineError>,
}

impl PairProcessingResult {
    fn success(pair: CandidatePair, asset_id: AssetId) -> Self {
        Self {
            pair,
            asset_id: Some(asset_id),
            succeeded: true,
            failure: None,
        }
    }

    fn failed(pair: CandidatePair, asset_id: Option<AssetId>, error: PipelineError) -> Self {
        Self {
            pair,
            asset_id,
            succeeded: false,
            failure: Some(error),
        }
    }

    pub fn into_result(self) -> Result<AssetId, PipelineError> {
        match (self.asset_id, self.failure) {
            (_, Some(error)) => Err(error),
            (Some(id), None) => Ok(id),
            (None, None) => Err(PipelineError::import("no asset id returned")),
        }
    }
}

/// Token shared by both components. Same pair, same token, regardless of argument order.
pub fn pairing_token(still: &Path, motion: &Path) -> Uuid {
    let mut parts = [
        still.to_string_lossy().to_string(),
        motion.to_string_lossy().to_string(),
    ];
    parts.sort();
    Uuid::new_v5(&PAIRING_NAMESPACE, parts.join("\n").as_bytes())
}

async fn ensure_readable(path: &Path) -> Result<(), PipelineError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| PipelineError::file_access(path, e))?;
    if !metadata.is_file() {
        return Err(PipelineError::file_access(path, "not a regular file"));
    }
    tokio::fs::File::open(path)
        .await
        .map_err(|e| PipelineError::file_access(path, e))?;
    Ok(())
}

/// Holds only a shared library handle, so concurrent calls do not interfere.
#[derive(Clone)]
pub struct LivePhotoReconstructor {
    library: Arc<dyn PhotoLibrary>,
}

impl LivePhotoReconstructor {
    pub fn new(library: Arc<dyn PhotoLibrary>) -> Self {
        Self { library }
    }

    pub fn library(&self) -> &Arc<dyn PhotoLibrary> {
        &self.library
    }

    /// Create one Live Photo asset. Failures come back inside the result.
    ///
    /// Without explicit metadata the pair's own fields are used, with the
    /// favorite flag taken from either component.
    pub async fn reconstruct(&self, pair: CandidatePair, metadata: Option<AssetMetadata>) -> PairProcessingResult {
        let still = pair.still.source_location.clone();
        let motion = pair.motion_location.clone();

        for path in [&still, &motion] {
            if let Err(e) = ensure_readable(path).await {
                tracing::warn!(still = %pair.still.id, error = %e, "Live Photo component unreadable");
                return PairProcessingResult::failed(pair, None, e);
            }
        }

        let token = pairing_token(&still, &motion);
        match self.library.sync_pairing_token(&still, &motion, token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(still = %still.display(), "Pairing token not synchronized");
            }
            Err(e) => {
                tracing::warn!(still = %still.display(), error = %e, "Pairing token sync failed");
            }
        }

        let metadata = metadata.unwrap_or_else(|| {
            let mut metadata = AssetMetadata::from(&pair.still);
            metadata.taken_at = pair.representative_timestamp;
            metadata.favorite = pair.favorite;
            metadata
        });
        let request = AssetRequest {
            still,
            motion: Some(motion),
            metadata,
            pairing_token: Some(token),
        };

        let asset_id = match self.library.create_asset(&request).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(still = %pair.still.id, error = %e, "Asset creation failed");
                return PairProcessingResult::failed(pair, None, PipelineError::import(format!("{:#}", e)));
            }
        };

        match self.library.verify_is_live_photo(&asset_id).await {
            Ok(true) => {
                tracing::debug!(still = %pair.still.id, asset = %asset_id, "Live Photo created");
                PairProcessingResult::success(pair, asset_id)
            }
            Ok(false) => {
                tracing::warn!(still = %pair.still.id, asset = %asset_id, "Library did not recognize the pairing");
                let error = PipelineError::PairingVerificationFailure {
                    asset_id: asset_id.to_string(),
                };
                PairProcessingResult::failed(pair, Some(asset_id), error)
            }
            Err(e) => {
                tracing::warn!(asset = %asset_id, error = %e, "Live Photo verification failed");
                let error = PipelineError::PairingVerificationFailure {
                    asset_id: asset_id.to_string(),
                };
                PairProcessingResult::failed(pair, Some(asset_id), error)
            }
        }
    }

    /// Reconstruct many pairs with at most `workers` in flight. Results keep
    /// input order; once `cancel` fires no new pair is started.
    pub async fn reconstruct_many(
        &self,
        pairs: Vec<CandidatePair>,
        workers: usize,
        cancel: &CancellationToken,
    ) -> Vec<PairProcessingResult> {
        stream::iter(pairs)
            .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
            .map(|pair| self.reconstruct(pair, None))
            .buffered(workers.max(1))
            .collect::<Vec<_>>()
            .await
    }
}
