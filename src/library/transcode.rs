use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use uuid::Uuid;

use super::Transcoder;

/// Resolve ffmpeg: `PHOTOMIGRATE_FFMPEG_PATH` if it points at a file, else PATH.
pub fn ffmpeg_path() -> PathBuf {
    if let Ok(v) = std::env::var("PHOTOMIGRATE_FFMPEG_PATH") {
        let p = PathBuf::from(&v);
        if p.exists() {
            return p;
        }
    }
    PathBuf::from("ffmpeg")
}

const OUTPUT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x70, 0x68, 0x6f, 0x74, 0x6f, 0x6d, 0x69, 0x67, 0x72, 0x61, 0x74, 0x65, 0x00, 0x00, 0x00, 0x03,
]);

/// Remuxes motion containers to `.mp4` with ffmpeg.
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    output_dir: PathBuf,
    dry_run: bool,
}

impl FfmpegTranscoder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg_path(),
            output_dir: output_dir.into(),
            dry_run: false,
        }
    }

    pub fn with_binary(mut self, ffmpeg: impl Into<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self
    }

    /// In dry-run mode nothing is written and the source clip stands in for the output.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// `<output_dir>/<stem>-<hash>.mp4`, where the hash is taken over the full
    /// source path so same-named clips from different folders never share a file.
    pub fn output_path(&self, motion: &Path) -> PathBuf {
        let stem = motion
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "motion".to_string());
        let digest = Uuid::new_v5(&OUTPUT_NAMESPACE, motion.to_string_lossy().as_bytes()).simple().to_string();
        self.output_dir.join(format!("{}-{}.mp4", stem, &digest[..12]))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, motion: &Path) -> Result<PathBuf> {
        let output = self.output_path(motion);

        if self.dry_run {
            tracing::info!(input = %motion.display(), output = %output.display(), "Dry run: would transcode");
            return Ok(motion.to_path_buf());
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;

        let result = Command::new(&self.ffmpeg)
            .arg("-y")
            .args(["-v", "error"])
            .arg("-i")
            .arg(motion)
            .args(["-c", "copy"])
            .arg(&output)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.ffmpeg.display()))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            bail!("ffmpeg exited with {}: {}", result.status, stderr.trim());
        }

        tracing::debug!(input = %motion.display(), output = %output.display(), "Transcoded motion container");
        Ok(output)
    }
}
