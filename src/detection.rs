/// Star detection: the detector seam, the abort-aware adapter and a
/// built-in blob detector
use bumpalo::Bump;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::cancel::{AbortFlag, StatusSink};
use crate::error::{Result, StarError};
use crate::geometry::Point;
use crate::imaging::Image;
use crate::native_ops::gaussian_blur_plane;
use crate::star::RawStar;

/// Detector parameters; `None` leaves the detector default in place
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionParams {
    pub sensitivity: Option<f64>,
    pub peak_response: Option<f64>,
    pub upper_peak_limit: Option<f64>,
    pub max_distortion: Option<f64>,
    pub structure_layers: Option<u32>,
    pub xy_stretch: Option<f64>,
}

/// External star finder.
///
/// `progress(count, total)` is called periodically; returning `false`
/// asks the detector to stop and return what it has found so far.
pub trait StarDetector {
    fn detect(
        &self,
        luminance: &Image,
        params: &DetectionParams,
        progress: &mut dyn FnMut(usize, usize) -> bool,
    ) -> anyhow::Result<Vec<RawStar>>;
}

/// Wraps a detector with progress reporting and cooperative abort
pub struct DetectionAdapter<'a> {
    detector: &'a dyn StarDetector,
    abort: AbortFlag,
}

impl<'a> DetectionAdapter<'a> {
    pub fn new(detector: &'a dyn StarDetector, abort: AbortFlag) -> Self {
        Self { detector, abort }
    }

    /// Run the detector. An abort never raises: the (possibly partial or
    /// empty) result is returned instead.
    pub fn detect(
        &self,
        luminance: &Image,
        params: &DetectionParams,
        sink: &dyn StatusSink,
    ) -> Result<Vec<RawStar>> {
        let abort = self.abort.clone();
        let mut progress = |count: usize, total: usize| {
            sink.on_progress_update(count, total);
            !abort.is_requested()
        };

        let result = self.detector.detect(luminance, params, &mut progress);
        match result {
            Ok(stars) => {
                if self.abort.is_requested() {
                    tracing::warn!("Detection aborted, keeping {} partial results", stars.len());
                }
                Ok(stars)
            }
            Err(e) if self.abort.is_requested() => {
                tracing::warn!("Detection aborted: {:#}", e);
                Ok(Vec::new())
            }
            Err(e) => Err(StarError::DetectionFailed(format!("{:#}", e))),
        }
    }
}

const DEFAULT_SENSITIVITY: f64 = 0.5;
const DEFAULT_PEAK_RESPONSE: f64 = 0.5;
const DEFAULT_UPPER_PEAK_LIMIT: f64 = 1.0;
const DEFAULT_MAX_DISTORTION: f64 = 0.6;
const DEFAULT_STRUCTURE_LAYERS: u32 = 5;
const DEFAULT_XY_STRETCH: f64 = 2.0;
const MIN_BLOB_PIXELS: usize = 3;
const PROGRESS_ROWS: usize = 16;

/// Connected component above the detection threshold
struct Blob {
    pixels: Vec<(usize, usize)>,
    min_x: usize,
    max_x: usize,
    min_y: usize,
    max_y: usize,
}

impl Blob {
    fn bbox_width(&self) -> usize {
        self.max_x - self.min_x + 1
    }

    fn bbox_height(&self) -> usize {
        self.max_y - self.min_y + 1
    }
}

/// Threshold + flood-fill detector working on the luminance plane.
///
/// Parameter mapping:
/// - `sensitivity` (0..1): threshold = median + (1 + 4 * (1 - s)) * noise
/// - `peakResponse` (0..1): rejects flat blobs whose mean/peak signal
///   exceeds `0.5 + peakResponse / 2`
/// - `upperPeakLimit`: rejects blobs peaking above it (saturated)
/// - `maxDistortion` (0..1): rejects blobs filling less than
///   `maxDistortion * pi / 4` of their bounding box
/// - `structureLayers`: smoothing sigma `0.25 * layers` before thresholding
/// - `xyStretch`: rejects blobs with a bounding box aspect above it
#[derive(Debug, Default, Clone, Copy)]
pub struct BlobDetector;

impl BlobDetector {
    pub fn new() -> Self {
        Self
    }

    /// Background median and MAD-based noise estimate
    fn background_and_noise(data: &[f32]) -> (f64, f64) {
        let arena = Bump::new();
        let step = (data.len() / 500_000).max(1);
        let mut samples = bumpalo::vec![in &arena];
        samples.extend(data.iter().step_by(step).map(|&v| v as f64));
        if samples.is_empty() {
            return (0.0, 0.0);
        }
        samples.sort_by(|a, b| a.total_cmp(b));
        let median = samples[samples.len() / 2];

        let mut deviations = bumpalo::vec![in &arena];
        deviations.extend(samples.iter().map(|v| (v - median).abs()));
        deviations.sort_by(|a, b| a.total_cmp(b));
        let mad = deviations[deviations.len() / 2];

        // Convert MAD to equivalent standard deviation
        (median, mad * 1.4826)
    }

    /// Find connected components using flood fill (8-connected)
    fn find_blobs(
        mask: &[bool],
        width: usize,
        height: usize,
        progress: &mut dyn FnMut(usize, usize) -> bool,
    ) -> Vec<Blob> {
        let mut visited = vec![false; mask.len()];
        let mut blobs = Vec::new();

        for y in 0..height {
            if y % PROGRESS_ROWS == 0 && !progress(y, height) {
                tracing::debug!("Blob search stopped at row {}", y);
                return blobs;
            }
            for x in 0..width {
                let idx = y * width + x;
                if !mask[idx] || visited[idx] {
                    continue;
                }
                let mut blob = Blob {
                    pixels: Vec::new(),
                    min_x: x,
                    max_x: x,
                    min_y: y,
                    max_y: y,
                };
                let mut queue = VecDeque::new();
                queue.push_back((x, y));
                visited[idx] = true;

                while let Some((cx, cy)) = queue.pop_front() {
                    blob.pixels.push((cx, cy));
                    blob.min_x = blob.min_x.min(cx);
                    blob.max_x = blob.max_x.max(cx);
                    blob.min_y = blob.min_y.min(cy);
                    blob.max_y = blob.max_y.max(cy);

                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            if dx == 0 && dy == 0 {
                                continue;
                            }
                            let nx = cx as i64 + dx;
                            let ny = cy as i64 + dy;
                            if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                                continue;
                            }
                            let nidx = ny as usize * width + nx as usize;
                            if mask[nidx] && !visited[nidx] {
                                visited[nidx] = true;
                                queue.push_back((nx as usize, ny as usize));
                            }
                        }
                    }
                }
                blobs.push(blob);
            }
        }
        progress(height, height);
        blobs
    }

    /// Measure a blob; `None` when a rejection rule applies
    fn measure(
        blob: &Blob,
        data: &[f32],
        width: usize,
        background: f64,
        params: &DetectionParams,
    ) -> Option<RawStar> {
        if blob.pixels.len() < MIN_BLOB_PIXELS {
            return None;
        }

        let mut flux = 0.0;
        let mut peak = f64::MIN;
        let mut sx = 0.0;
        let mut sy = 0.0;
        for &(x, y) in &blob.pixels {
            let v = data[y * width + x] as f64;
            let signal = (v - background).max(0.0);
            flux += signal;
            peak = peak.max(v);
            sx += signal * x as f64;
            sy += signal * y as f64;
        }
        if flux <= 0.0 {
            return None;
        }

        let upper_peak_limit = params.upper_peak_limit.unwrap_or(DEFAULT_UPPER_PEAK_LIMIT);
        if peak > upper_peak_limit {
            return None;
        }

        let peak_response = params.peak_response.unwrap_or(DEFAULT_PEAK_RESPONSE);
        let mean_signal = flux / blob.pixels.len() as f64;
        let peak_signal = peak - background;
        if peak_signal <= 0.0 || mean_signal / peak_signal > 0.5 + peak_response / 2.0 {
            return None;
        }

        let (bw, bh) = (blob.bbox_width() as f64, blob.bbox_height() as f64);
        let max_distortion = params.max_distortion.unwrap_or(DEFAULT_MAX_DISTORTION);
        let fill = blob.pixels.len() as f64 / (bw * bh);
        if fill < max_distortion * std::f64::consts::FRAC_PI_4 {
            return None;
        }

        let xy_stretch = params.xy_stretch.unwrap_or(DEFAULT_XY_STRETCH);
        if bw.max(bh) / bw.min(bh) > xy_stretch {
            return None;
        }

        // Pixel centers sit at +0.5
        Some(RawStar {
            pos: Point::new(sx / flux + 0.5, sy / flux + 0.5),
            size: blob.pixels.len() as f64,
            flux,
        })
    }
}

impl StarDetector for BlobDetector {
    fn detect(
        &self,
        luminance: &Image,
        params: &DetectionParams,
        progress: &mut dyn FnMut(usize, usize) -> bool,
    ) -> anyhow::Result<Vec<RawStar>> {
        let (width, height) = (luminance.width(), luminance.height());
        if width == 0 || height == 0 {
            anyhow::bail!("Empty image ({}x{})", width, height);
        }
        let data = luminance.plane(0);

        let layers = params.structure_layers.unwrap_or(DEFAULT_STRUCTURE_LAYERS);
        let smoothed = if layers > 0 {
            gaussian_blur_plane(data, width, height, 0.25 * layers as f32)
        } else {
            data.to_vec()
        };

        let (background, noise) = Self::background_and_noise(&smoothed);
        let sensitivity = params
            .sensitivity
            .unwrap_or(DEFAULT_SENSITIVITY)
            .clamp(0.0, 1.0);
        let k = 1.0 + 4.0 * (1.0 - sensitivity);
        // Keep a floor so that a noiseless frame does not turn into one blob
        let threshold = background + (k * noise).max(1e-4);
        tracing::debug!(
            "Detection threshold {:.5} (background {:.5}, noise {:.5})",
            threshold,
            background,
            noise
        );

        let mask: Vec<bool> = smoothed.iter().map(|&v| v as f64 > threshold).collect();
        let blobs = Self::find_blobs(&mask, width, height, progress);

        let (raw_background, _) = Self::background_and_noise(data);
        let stars: Vec<RawStar> = blobs
            .iter()
            .filter_map(|blob| Self::measure(blob, data, width, raw_background, params))
            .collect();
        tracing::debug!("{} blobs, {} stars accepted", blobs.len(), stars.len());
        Ok(stars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::LogStatusSink;

    /// Gaussian spots on a flat background
    fn star_field(width: usize, height: usize, stars: &[(f64, f64, f64)]) -> Image {
        let mut data = vec![0.1f32; width * height];
        for &(cx, cy, sigma) in stars {
            for y in 0..height {
                for x in 0..width {
                    let dx = x as f64 + 0.5 - cx;
                    let dy = y as f64 + 0.5 - cy;
                    let v = 0.7 * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                    data[y * width + x] += v as f32;
                }
            }
        }
        Image::from_mono(width, height, data).unwrap()
    }

    struct FailingDetector;

    impl StarDetector for FailingDetector {
        fn detect(
            &self,
            _: &Image,
            _: &DetectionParams,
            _: &mut dyn FnMut(usize, usize) -> bool,
        ) -> anyhow::Result<Vec<RawStar>> {
            anyhow::bail!("detector crashed")
        }
    }

    #[test]
    fn test_blob_detector_finds_stars() {
        let img = star_field(64, 64, &[(16.0, 16.0, 1.5), (45.0, 40.0, 2.0)]);
        let adapter_abort = AbortFlag::new();
        let detector = BlobDetector::new();
        let adapter = DetectionAdapter::new(&detector, adapter_abort);
        let mut stars = adapter
            .detect(&img, &DetectionParams::default(), &LogStatusSink)
            .unwrap();
        assert_eq!(stars.len(), 2);
        stars.sort_by(|a, b| a.pos.x.total_cmp(&b.pos.x));
        assert!((stars[0].pos.x - 16.0).abs() < 0.5);
        assert!((stars[0].pos.y - 16.0).abs() < 0.5);
        assert!((stars[1].pos.x - 45.0).abs() < 0.5);
        assert!(stars[1].size > stars[0].size);
        assert!(stars.iter().all(|s| s.flux > 0.0));
    }

    #[test]
    fn test_upper_peak_limit_rejects_bright_stars() {
        let img = star_field(48, 48, &[(24.0, 24.0, 2.0)]);
        let params = DetectionParams {
            upper_peak_limit: Some(0.5),
            ..Default::default()
        };
        let stars = BlobDetector::new()
            .detect(&img, &params, &mut |_, _| true)
            .unwrap();
        assert!(stars.is_empty());
    }

    #[test]
    fn test_failure_maps_to_detection_failed() {
        let detector = FailingDetector;
        let adapter = DetectionAdapter::new(&detector, AbortFlag::new());
        let img = Image::new(4, 4, 1);
        let err = adapter
            .detect(&img, &DetectionParams::default(), &LogStatusSink)
            .unwrap_err();
        assert!(matches!(err, StarError::DetectionFailed(_)));
    }

    #[test]
    fn test_abort_returns_without_error() {
        let abort = AbortFlag::new();
        abort.request();

        let detector = FailingDetector;
        let adapter = DetectionAdapter::new(&detector, abort.clone());
        let img = Image::new(4, 4, 1);
        let stars = adapter
            .detect(&img, &DetectionParams::default(), &LogStatusSink)
            .unwrap();
        assert!(stars.is_empty());

        // The built-in detector stops at the first progress check
        let blob = BlobDetector::new();
        let adapter = DetectionAdapter::new(&blob, abort);
        let field = star_field(64, 64, &[(40.0, 40.0, 2.0)]);
        let stars = adapter
            .detect(&field, &DetectionParams::default(), &LogStatusSink)
            .unwrap();
        assert!(stars.is_empty());
    }
}
