//! Motion detection, noise detection, and scene analysis.
//!
//! Motion is detected locally by grayscale frame differencing so the vision
//! model is only consulted when something actually changed. Vision calls are
//! additionally rate limited — a busy driveway must not turn into an API bill.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::llm::{LlmProvider, VisionAnalysis};

/// Per-pixel intensity delta (0-255) counted as "changed".
const PIXEL_CHANGE_THRESHOLD: u8 = 25;

/// Minimum seconds between vision calls unless forced.
const VISION_RATE_LIMIT: Duration = Duration::from_secs(30);

/// Snapshot retention bounds.
const MAX_SNAPSHOTS: usize = 100;
const MAX_SNAPSHOT_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const DEFAULT_ANALYSIS_PROMPT: &str =
    "Describe what you see in this image. Focus on any people, animals, or unusual activity. \
     Answer as JSON: {\"description\": \"...\", \"confidence\": 0.0-1.0}";

pub struct Monitoring {
    enabled: AtomicBool,
    last_frame: Mutex<Option<Vec<u8>>>,
    last_vision_call: Mutex<Option<Instant>>,
    /// Fraction of changed pixels above which a frame counts as motion.
    motion_threshold: Mutex<f64>,
    /// RMS amplitude above which an audio frame counts as noise.
    noise_threshold: Mutex<f64>,
    snapshot_dir: PathBuf,
}

impl Monitoring {
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            last_frame: Mutex::new(None),
            last_vision_call: Mutex::new(None),
            motion_threshold: Mutex::new(0.05),
            noise_threshold: Mutex::new(500.0),
            snapshot_dir: snapshot_dir.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        tracing::info!("Monitoring {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_motion_threshold(&self, threshold: f64) {
        *self.motion_threshold.lock().expect("motion threshold lock") =
            threshold.clamp(0.0, 1.0);
    }

    pub fn set_noise_threshold(&self, threshold: f64) {
        *self.noise_threshold.lock().expect("noise threshold lock") = threshold.max(0.0);
    }

    /// Compare the frame against the previous one; true when enough pixels
    /// moved. The first frame only primes the comparison. Undecodable frames
    /// replace the stored frame and report no motion so one corrupt JPEG
    /// cannot wedge the detector.
    pub fn detect_motion(&self, frame: &[u8]) -> bool {
        let mut last = self.last_frame.lock().expect("last frame lock");

        let Some(previous) = last.replace(frame.to_vec()) else {
            return false;
        };

        let ratio = match change_ratio(&previous, frame) {
            Ok(ratio) => ratio,
            Err(e) => {
                tracing::error!("Motion detection error: {e:#}");
                return false;
            }
        };

        let threshold = *self.motion_threshold.lock().expect("motion threshold lock");
        let motion = ratio > threshold;
        if motion {
            tracing::debug!("Motion detected: {:.2}% pixels changed", ratio * 100.0);
        }
        motion
    }

    /// RMS over signed 16-bit little-endian samples.
    pub fn detect_noise(&self, audio: &[u8]) -> bool {
        let Some(rms) = audio_rms(audio) else {
            return false;
        };
        let threshold = *self.noise_threshold.lock().expect("noise threshold lock");
        let noise = rms > threshold;
        if noise {
            tracing::debug!("Noise detected: RMS={rms:.2}");
        }
        noise
    }

    /// Run a vision analysis unless rate limited.
    ///
    /// Returns `Ok(None)` when the call was skipped by the rate limit. A
    /// successful analysis also persists the frame to the snapshot store.
    pub async fn analyze_scene(
        &self,
        llm: &dyn LlmProvider,
        frame: &[u8],
        prompt: &str,
        force: bool,
    ) -> Result<Option<VisionAnalysis>> {
        if !force {
            let last_call = self.last_vision_call.lock().expect("vision call lock");
            if let Some(at) = *last_call {
                if at.elapsed() < VISION_RATE_LIMIT {
                    tracing::debug!("Vision analysis rate limited");
                    return Ok(None);
                }
            }
        }

        let result = llm.vision(frame, prompt).await.context("vision analysis failed")?;
        *self.last_vision_call.lock().expect("vision call lock") = Some(Instant::now());

        if let Err(e) = self.save_snapshot(frame) {
            tracing::error!("Failed to save snapshot: {e:#}");
        }

        tracing::info!("Vision analysis: confidence={:.2}", result.confidence);
        Ok(Some(result))
    }

    /// Write the frame as `{snapshot_dir}/{YYYYMMDD_HHMMSS}.jpg` and prune
    /// old files.
    pub fn save_snapshot(&self, frame: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.snapshot_dir).with_context(|| {
            format!("Failed to create snapshot dir {}", self.snapshot_dir.display())
        })?;

        let filename = format!("{}.jpg", chrono::Local::now().format("%Y%m%d_%H%M%S"));
        let path = self.snapshot_dir.join(filename);
        std::fs::write(&path, frame)
            .with_context(|| format!("Failed to write snapshot {}", path.display()))?;

        tracing::debug!("Saved snapshot: {}", path.display());
        cleanup_snapshots(&self.snapshot_dir);

        Ok(path)
    }
}

/// Fraction of pixels whose grayscale intensity changed by more than
/// [`PIXEL_CHANGE_THRESHOLD`] between two JPEG frames.
fn change_ratio(previous: &[u8], current: &[u8]) -> Result<f64> {
    let current_img = image::load_from_memory(current)
        .context("failed to decode current frame")?
        .to_luma8();
    let mut last_img = image::load_from_memory(previous)
        .context("failed to decode previous frame")?
        .to_luma8();

    if last_img.dimensions() != current_img.dimensions() {
        let (w, h) = current_img.dimensions();
        last_img = image::imageops::resize(&last_img, w, h, FilterType::Triangle);
    }

    let total = current_img.as_raw().len();
    if total == 0 {
        return Ok(0.0);
    }

    let changed = current_img
        .as_raw()
        .iter()
        .zip(last_img.as_raw().iter())
        .filter(|(a, b)| a.abs_diff(**b) > PIXEL_CHANGE_THRESHOLD)
        .count();

    Ok(changed as f64 / total as f64)
}

/// RMS amplitude of i16 little-endian PCM. `None` for frames too short to
/// hold a sample.
fn audio_rms(audio: &[u8]) -> Option<f64> {
    if audio.len() < 2 {
        return None;
    }

    let samples: Vec<f64> = audio
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f64)
        .collect();

    let mean_square = samples.iter().map(|s| s * s).sum::<f64>() / samples.len() as f64;
    Some(mean_square.sqrt())
}

/// Delete snapshots older than [`MAX_SNAPSHOT_AGE`], then the oldest beyond
/// [`MAX_SNAPSHOTS`]. Best-effort: individual failures are logged and skipped.
fn cleanup_snapshots(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("Snapshot cleanup error: {e}");
            return;
        }
    };

    let mut snapshots: Vec<(PathBuf, std::time::SystemTime)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .map(|ext| ext == "jpg")
                .unwrap_or(false)
        })
        .filter_map(|entry| {
            let mtime = entry.metadata().ok()?.modified().ok()?;
            Some((entry.path(), mtime))
        })
        .collect();

    let now = std::time::SystemTime::now();
    snapshots.retain(|(path, mtime)| {
        let expired = now
            .duration_since(*mtime)
            .map(|age| age > MAX_SNAPSHOT_AGE)
            .unwrap_or(false);
        if expired {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Failed to delete {}: {e}", path.display());
                return true; // still present, keep counting it
            }
            tracing::debug!("Deleted old snapshot: {}", path.display());
        }
        !expired
    });

    if snapshots.len() <= MAX_SNAPSHOTS {
        return;
    }

    snapshots.sort_by_key(|(_, mtime)| *mtime);
    let excess = snapshots.len() - MAX_SNAPSHOTS;
    for (path, _) in snapshots.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!("Failed to delete {}: {e}", path.display());
        } else {
            tracing::debug!("Deleted excess snapshot: {}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;

    /// Encode a uniform gray JPEG for frame-diff tests.
    fn jpeg_frame(width: u32, height: u32, luma: u8) -> Vec<u8> {
        let img = image::GrayImage::from_pixel(width, height, image::Luma([luma]));
        let mut out = Vec::new();
        JpegEncoder::new(&mut out).encode_image(&img).unwrap();
        out
    }

    #[test]
    fn test_first_frame_is_not_motion() {
        let monitoring = Monitoring::new("/tmp/unused");
        assert!(!monitoring.detect_motion(&jpeg_frame(32, 32, 128)));
    }

    #[test]
    fn test_identical_frames_are_not_motion() {
        let monitoring = Monitoring::new("/tmp/unused");
        let frame = jpeg_frame(32, 32, 128);
        monitoring.detect_motion(&frame);
        assert!(!monitoring.detect_motion(&frame));
    }

    #[test]
    fn test_large_change_is_motion() {
        let monitoring = Monitoring::new("/tmp/unused");
        monitoring.detect_motion(&jpeg_frame(32, 32, 30));
        assert!(monitoring.detect_motion(&jpeg_frame(32, 32, 220)));
    }

    #[test]
    fn test_mismatched_sizes_are_compared_after_resize() {
        let monitoring = Monitoring::new("/tmp/unused");
        monitoring.detect_motion(&jpeg_frame(64, 64, 30));
        assert!(monitoring.detect_motion(&jpeg_frame(32, 32, 220)));
    }

    #[test]
    fn test_corrupt_frame_is_not_motion() {
        let monitoring = Monitoring::new("/tmp/unused");
        monitoring.detect_motion(&jpeg_frame(32, 32, 128));
        assert!(!monitoring.detect_motion(b"not a jpeg"));
    }

    #[test]
    fn test_noise_detection() {
        let monitoring = Monitoring::new("/tmp/unused");

        let silence = vec![0u8; 256];
        assert!(!monitoring.detect_noise(&silence));

        // Full-scale square wave, RMS far above the 500 default.
        let loud: Vec<u8> = std::iter::repeat(i16::MAX.to_le_bytes())
            .take(128)
            .flatten()
            .collect();
        assert!(monitoring.detect_noise(&loud));

        assert!(!monitoring.detect_noise(&[0u8]));
    }

    #[test]
    fn test_noise_threshold_adjustable() {
        let monitoring = Monitoring::new("/tmp/unused");
        let quiet: Vec<u8> = std::iter::repeat(100i16.to_le_bytes())
            .take(128)
            .flatten()
            .collect();
        assert!(!monitoring.detect_noise(&quiet));
        monitoring.set_noise_threshold(50.0);
        assert!(monitoring.detect_noise(&quiet));
    }

    #[test]
    fn test_audio_rms() {
        let samples: Vec<u8> = [1000i16, -1000, 1000, -1000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let rms = audio_rms(&samples).unwrap();
        assert!((rms - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_snapshot_save_and_count_cleanup() {
        let tmp = tempfile::TempDir::new().unwrap();
        let monitoring = Monitoring::new(tmp.path());

        // Pre-seed beyond the retention cap; cleanup runs on save.
        for i in 0..(MAX_SNAPSHOTS + 5) {
            std::fs::write(tmp.path().join(format!("old_{i:04}.jpg")), b"x").unwrap();
        }

        let path = monitoring.save_snapshot(b"\xff\xd8fake").unwrap();
        assert!(path.exists());

        let count = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "jpg").unwrap_or(false))
            .count();
        assert!(count <= MAX_SNAPSHOTS);
    }

    #[test]
    fn test_cleanup_ignores_other_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"keep me").unwrap();
        cleanup_snapshots(tmp.path());
        assert!(tmp.path().join("notes.txt").exists());
    }
}
