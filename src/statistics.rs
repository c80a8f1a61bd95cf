/// Descriptive statistics over per-star feature arrays
use bumpalo::Bump;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{Result, StarError};

/// Statistics of one feature (size, flux, width, psf.*)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub std_dev: f64,
    /// Mean absolute deviation from the median
    pub avg_dev: f64,
    /// Median absolute deviation from the median (not normalized)
    #[serde(rename = "MAD")]
    pub mad: f64,
    /// Sample variance (n - 1)
    pub variance: f64,
    /// `avg / max`, unset when `max == 0`
    pub mean_to_max_ratio: Option<f64>,
}

impl FeatureStats {
    /// `avg / max`; fails when `max == 0`
    pub fn mean_to_max_ratio(&self) -> Result<f64> {
        self.mean_to_max_ratio.ok_or_else(|| {
            StarError::DegenerateDataset("maximum is zero, mean-to-max ratio undefined".to_string())
        })
    }

    /// Look up a statistic by its key, as used in threshold specifications
    pub fn get(&self, key: &str) -> Option<f64> {
        match key {
            "min" => Some(self.min),
            "max" => Some(self.max),
            "avg" | "mean" => Some(self.avg),
            "median" => Some(self.median),
            "stdDev" => Some(self.std_dev),
            "avgDev" => Some(self.avg_dev),
            "MAD" | "mad" => Some(self.mad),
            "variance" => Some(self.variance),
            "meanToMaxRatio" => self.mean_to_max_ratio,
            _ => None,
        }
    }

    /// Value at `fraction` of the [min, max] range
    pub fn value_at_fraction(&self, fraction: f64) -> f64 {
        fraction * (self.max - self.min) + self.min
    }
}

/// Compute statistics for a non-empty sequence of values
pub fn compute_stats(values: &[f64]) -> Result<FeatureStats> {
    if values.is_empty() {
        return Err(StarError::EmptyDataset);
    }

    // Scratch space for the sorted copies lives in an arena
    let arena = Bump::new();
    let mut sorted = bumpalo::vec![in &arena];
    sorted.extend_from_slice(values);
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = values.len() as f64;
    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    let avg = values.iter().sum::<f64>() / n;
    let median = median_of_sorted(&sorted);

    let variance = if values.len() > 1 {
        values.iter().map(|&x| (x - avg).powi(2)).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };

    let avg_dev = values.iter().map(|&x| (x - median).abs()).sum::<f64>() / n;

    let mut deviations = bumpalo::vec![in &arena];
    deviations.extend(values.iter().map(|&x| (x - median).abs()));
    deviations.sort_by(|a, b| a.total_cmp(b));
    let mad = median_of_sorted(&deviations);

    Ok(FeatureStats {
        min,
        max,
        avg,
        median,
        std_dev: variance.sqrt(),
        avg_dev,
        mad,
        variance,
        mean_to_max_ratio: (max != 0.0).then(|| avg / max),
    })
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let len = sorted.len();
    if len % 2 == 0 {
        let mid = len / 2;
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[len / 2]
    }
}

/// Two-sided MAD: (low, high) median absolute deviations of the values
/// below and above the median.
pub fn two_sided_mad(values: &[f64]) -> Result<(f64, f64)> {
    two_sided(values, |devs| {
        let mut sorted = devs.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        median_of_sorted(&sorted)
    })
}

/// Two-sided average deviation: (low, high)
pub fn two_sided_avg_dev(values: &[f64]) -> Result<(f64, f64)> {
    two_sided(values, |devs| devs.iter().sum::<f64>() / devs.len() as f64)
}

fn two_sided<F>(values: &[f64], reduce: F) -> Result<(f64, f64)>
where
    F: Fn(&[f64]) -> f64,
{
    let stats = compute_stats(values)?;
    let median = stats.median;
    let low: Vec<f64> = values
        .iter()
        .filter(|&&x| x <= median)
        .map(|&x| median - x)
        .collect();
    let high: Vec<f64> = values
        .iter()
        .filter(|&&x| x >= median)
        .map(|&x| x - median)
        .collect();
    let low = if low.is_empty() { 0.0 } else { reduce(&low) };
    let high = if high.is_empty() { 0.0 } else { reduce(&high) };
    Ok((low, high))
}

/// Statistics bundle for a catalog
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StarStatistics {
    pub size: FeatureStats,
    pub flux: FeatureStats,
    pub width: FeatureStats,
    /// PSF-derived statistics keyed by PSF field (aspectRatio, sx, ...)
    pub psf: BTreeMap<String, FeatureStats>,
    pub detected_stars: usize,
}

impl StarStatistics {
    /// Statistics for a feature path (`size`, `width`, `psf.aspectRatio`)
    pub fn feature(&self, path: &str) -> Option<&FeatureStats> {
        match path {
            "size" => Some(&self.size),
            "flux" => Some(&self.flux),
            "width" => Some(&self.width),
            _ => path
                .strip_prefix("psf.")
                .and_then(|field| self.psf.get(field)),
        }
    }

    /// Replace the PSF-derived statistics, keeping the detection ones
    pub fn refresh_psf(&mut self, values: &BTreeMap<String, Vec<f64>>) -> Result<()> {
        let mut psf = BTreeMap::new();
        for (field, field_values) in values {
            if field_values.is_empty() {
                continue;
            }
            psf.insert(field.clone(), compute_stats(field_values)?);
        }
        self.psf = psf;
        Ok(())
    }
}
