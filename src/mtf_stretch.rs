/// Midtone Transfer Function (MTF) display stretch for normalized images
use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::imaging::Image;

/// Configuration for MTF stretching
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StretchParameters {
    pub factor: f64,         // Target histogram median position
    pub black_clipping: f64, // Shadow clipping in MAD units
}

impl Default for StretchParameters {
    fn default() -> Self {
        Self {
            factor: 0.2,
            black_clipping: -2.8,
        }
    }
}

/// Shadows, midtones and highlights of the stretch
#[derive(Debug, Clone, Copy, PartialEq)]
struct StretchPoints {
    shadows: f64,
    midtones: f64,
    highlights: f64,
}

fn median_and_mad(data: &[f32]) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let bump = Bump::new();
    let mut sorted = BumpVec::from_iter_in(data.iter().copied(), &bump);
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    let median = sorted[sorted.len() / 2] as f64;

    let mut deviations =
        BumpVec::from_iter_in(data.iter().map(|&v| (v as f64 - median).abs()), &bump);
    deviations.sort_unstable_by(|a, b| a.total_cmp(b));
    (median, deviations[deviations.len() / 2])
}

fn stretch_points(median: f64, mad: f64, params: &StretchParameters) -> StretchPoints {
    let scale_factor = 1.4826; // MAD to sigma conversion factor

    if median > 0.5 {
        // Inverted or overexposed
        let highlights = median - params.black_clipping * mad * scale_factor;
        StretchPoints {
            shadows: 0.0,
            midtones: midtones_transfer_function(params.factor, 1.0 - (highlights - median)),
            highlights,
        }
    } else {
        let shadows = median + params.black_clipping * mad * scale_factor;
        StretchPoints {
            shadows,
            midtones: midtones_transfer_function(params.factor, median - shadows),
            highlights: 1.0,
        }
    }
}

/// Stretch one plane of `[0, 1]` samples
pub fn stretch_plane(data: &[f32], params: &StretchParameters) -> Vec<f32> {
    let (median, mad) = median_and_mad(data);
    let points = stretch_points(median, mad, params);
    tracing::debug!(
        "MTF stretch: median={:.4}, mad={:.4}, shadows={:.4}, midtones={:.4}",
        median,
        mad,
        points.shadows,
        points.midtones
    );
    data.iter()
        .map(|&v| {
            let input = (1.0 - points.highlights + v as f64 - points.shadows).clamp(0.0, 1.0);
            midtones_transfer_function(points.midtones, input) as f32
        })
        .collect()
}

/// Stretch every plane of an image independently
pub fn stretch_image(image: &Image, params: &StretchParameters) -> Image {
    let mut out = image.clone();
    for plane in out.planes_mut() {
        *plane = stretch_plane(plane, params);
    }
    out
}

/// Midtones Transfer Function
fn midtones_transfer_function(midtone_balance: f64, x: f64) -> f64 {
    if x > 0.0 {
        if x < 1.0 {
            return (midtone_balance - 1.0) * x
                / ((2.0 * midtone_balance - 1.0) * x - midtone_balance);
        }
        return 1.0;
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midtones_transfer_function() {
        assert_eq!(midtones_transfer_function(0.5, 0.0), 0.0);
        assert_eq!(midtones_transfer_function(0.5, 1.0), 1.0);
        assert_eq!(midtones_transfer_function(0.5, 0.5), 0.5);

        let mtf = midtones_transfer_function(0.5, 0.25);
        assert!(mtf > 0.0 && mtf < 0.5);

        let mtf = midtones_transfer_function(0.5, 0.75);
        assert!(mtf > 0.5 && mtf < 1.0);
    }

    #[test]
    fn test_stretch_brightens_dark_background() {
        // Faint noisy background with one bright star pixel
        let mut data: Vec<f32> = (0..100).map(|i| 0.01 + (i % 5) as f32 * 0.001).collect();
        data[50] = 0.9;
        let out = stretch_plane(&data, &StretchParameters::default());
        assert_eq!(out.len(), data.len());
        // Background median is pushed up towards the target
        let mut sorted = out.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = sorted[50];
        assert!(median > 0.05 && median < 0.5, "median {}", median);
        assert!(out[50] > median);
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_stretch_empty_plane() {
        assert!(stretch_plane(&[], &StretchParameters::default()).is_empty());
    }
}
