/// Named star filters: size class and feature ranges, optionally chained
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::catalog::StarCatalog;
use crate::classifier::ThresholdValue;
use crate::error::{Result, StarError};
use crate::statistics::{FeatureStats, StarStatistics};
use crate::star::Star;

/// Inclusive range on one feature. Bounds are numbers, `"NN%"` of the
/// feature's [min, max] range, or statistic names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeSpec {
    /// Defaults to 0
    pub min: Option<ThresholdValue>,
    /// Defaults to the feature maximum
    pub max: Option<ThresholdValue>,
    /// Keep the stars outside the range instead
    pub not: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PsfRangeSpec {
    /// Stars without PSF pass the PSF ranges
    #[serde(rename = "includeMissingPSF")]
    pub include_missing_psf: bool,
    /// Ranges keyed by PSF field (`aspectRatio`, `FWHMx`, ...)
    #[serde(flatten)]
    pub fields: BTreeMap<String, RangeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRanges {
    pub size: Option<RangeSpec>,
    pub width: Option<RangeSpec>,
    pub flux: Option<RangeSpec>,
    pub psf: Option<PsfRangeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StarFilter {
    pub name: Option<String>,
    /// Filter the previous filter's result instead of the whole catalog
    pub chained: bool,
    pub size_class: Option<f64>,
    pub range: Option<FilterRanges>,
}

/// Range with resolved numeric bounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRange {
    pub min: f64,
    pub max: f64,
    pub not: bool,
}

impl ResolvedRange {
    pub fn accepts(&self, value: f64) -> bool {
        let inside = value >= self.min && value <= self.max;
        inside != self.not
    }
}

/// Non-empty filter result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilteredStars {
    pub name: String,
    /// Catalog indexes
    pub stars: Vec<usize>,
}

pub fn resolve_range(key: &str, range: &RangeSpec, stats: Option<&FeatureStats>) -> Result<ResolvedRange> {
    let min = match &range.min {
        Some(v) => v.resolve(key, stats)?,
        None => 0.0,
    };
    let max = match &range.max {
        Some(v) => v.resolve(key, stats)?,
        None => stats
            .map(|s| s.max)
            .ok_or_else(|| StarError::InvalidThreshold {
                key: key.to_string(),
                reason: "no maximum and no statistics available".to_string(),
            })?,
    };
    Ok(ResolvedRange {
        min,
        max,
        not: range.not,
    })
}

/// All ranges of a filter, resolved once before the star loop
struct ResolvedRanges {
    features: Vec<(&'static str, ResolvedRange)>,
    psf: Option<(bool, Vec<(String, ResolvedRange)>)>,
}

impl ResolvedRanges {
    fn new(ranges: &FilterRanges, stats: &StarStatistics) -> Result<Self> {
        let mut features = Vec::new();
        for (key, range) in [("size", &ranges.size), ("width", &ranges.width), ("flux", &ranges.flux)] {
            if let Some(range) = range {
                let resolved = resolve_range(key, range, stats.feature(key))?;
                tracing::info!("{} range: {}-{}", key, resolved.min, resolved.max);
                features.push((key, resolved));
            }
        }

        let psf = match &ranges.psf {
            Some(psf_ranges) => {
                let mut fields = Vec::new();
                for (field, range) in &psf_ranges.fields {
                    let Some(field_stats) = stats.psf.get(field) else {
                        tracing::warn!("No PSF values: {}", field);
                        continue;
                    };
                    let resolved = resolve_range(field, range, Some(field_stats))?;
                    tracing::info!("PSF[{}] range: {}-{}", field, resolved.min, resolved.max);
                    fields.push((field.clone(), resolved));
                }
                Some((psf_ranges.include_missing_psf, fields))
            }
            None => None,
        };
        Ok(Self { features, psf })
    }

    fn accepts(&self, star: &Star) -> bool {
        let features_ok = self.features.iter().all(|(key, range)| {
            star.feature(key).is_some_and(|v| range.accepts(v))
        });
        if !features_ok {
            return false;
        }
        match (&self.psf, &star.psf) {
            (None, _) => true,
            (Some((include_missing, _)), None) => *include_missing,
            (Some((_, fields)), Some(psf)) => fields.iter().all(|(field, range)| {
                // Fields the star does not report do not reject it
                psf.field(field).map_or(true, |v| range.accepts(v))
            }),
        }
    }
}

/// Run `filters` in order over the catalog.
///
/// Filters with an empty result are skipped and produce no entry; a
/// chained filter works on the last non-empty result.
pub fn apply_filters(
    catalog: &StarCatalog,
    stats: &StarStatistics,
    filters: &[StarFilter],
) -> Result<Vec<FilteredStars>> {
    let all: Vec<usize> = (0..catalog.len()).collect();
    let mut results: Vec<FilteredStars> = Vec::new();

    for (i, filter) in filters.iter().enumerate() {
        let mut stars = match (filter.chained, results.last()) {
            (true, Some(previous)) => previous.stars.clone(),
            _ => all.clone(),
        };

        let mut name = filter.name.clone();
        if let Some(class) = filter.size_class {
            name.get_or_insert_with(|| format!("Class_{}", class));
            stars.retain(|&idx| catalog.stars()[idx].size_class() == class);
        }

        if let Some(ranges) = &filter.range {
            if stars.is_empty() {
                continue;
            }
            let resolved = ResolvedRanges::new(ranges, stats)?;
            stars.retain(|&idx| resolved.accepts(&catalog.stars()[idx]));
        }

        let name = name.unwrap_or_else(|| format!("filter_{}", i + 1));
        if stars.is_empty() {
            tracing::warn!("Filter {}: no stars", name);
            continue;
        }
        tracing::info!("Filter {}: {} stars", name, stars.len());
        results.push(FilteredStars { name, stars });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use crate::star::{Psf, PsfFunction, PsfStatus, RawStar};
    use crate::statistics::compute_stats;

    fn psf(aspect_ratio: f64) -> Psf {
        Psf {
            func: PsfFunction::Gaussian,
            circular: false,
            status: PsfStatus::FittedOk,
            b: 0.0,
            a: 1.0,
            cx: 0.0,
            cy: 0.0,
            sx: 2.0,
            sy: 2.0 * aspect_ratio,
            theta: 0.0,
            angle: 0.0,
            beta: 0.0,
            mad: 0.0,
            flux: 1.0,
            mean_signal: 0.1,
            aspect_ratio,
            fwhm_x: 4.7,
            fwhm_y: 4.7 * aspect_ratio,
        }
    }

    /// Widths 1..=10 (sizes are squares), flux = width
    fn setup() -> (StarCatalog, StarStatistics) {
        let raw: Vec<RawStar> = (1..=10)
            .map(|w| RawStar {
                pos: Point::new(w as f64 * 10.0, 10.0),
                size: (w * w) as f64,
                flux: w as f64,
            })
            .collect();
        let mut catalog = StarCatalog::new(5.0);
        catalog.populate(&raw, None);
        for (i, aspect) in [(0usize, 0.5), (1, 0.95), (2, 0.7)] {
            if let Some(star) = catalog.get_mut(i) {
                star.psf = Some(psf(aspect));
            }
        }
        let mut stats = StarStatistics {
            size: compute_stats(&catalog.values("size")).unwrap(),
            flux: compute_stats(&catalog.values("flux")).unwrap(),
            width: compute_stats(&catalog.values("width")).unwrap(),
            psf: BTreeMap::new(),
            detected_stars: 10,
        };
        stats
            .psf
            .insert("aspectRatio".to_string(), compute_stats(&[0.5, 0.95, 0.7]).unwrap());
        (catalog, stats)
    }

    fn ids(catalog: &StarCatalog, result: &FilteredStars) -> Vec<String> {
        result
            .stars
            .iter()
            .map(|&i| catalog.stars()[i].id().to_string())
            .collect()
    }

    #[test]
    fn test_percent_width_range() {
        let (catalog, stats) = setup();
        let filter = StarFilter {
            name: Some("wide".to_string()),
            range: Some(FilterRanges {
                width: Some(RangeSpec {
                    min: Some(ThresholdValue::Percent(0.5)),
                    max: None,
                    not: false,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let results = apply_filters(&catalog, &stats, &[filter]).unwrap();
        // 50% of [1, 10] is 5.5
        assert_eq!(ids(&catalog, &results[0]), vec!["s6", "s7", "s8", "s9", "s10"]);
    }

    #[test]
    fn test_not_inverts_range() {
        let (catalog, stats) = setup();
        let filter = StarFilter {
            range: Some(FilterRanges {
                flux: Some(RangeSpec {
                    min: Some(ThresholdValue::Absolute(3.0)),
                    max: Some(ThresholdValue::Absolute(8.0)),
                    not: true,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let results = apply_filters(&catalog, &stats, &[filter]).unwrap();
        assert_eq!(results[0].name, "filter_1");
        assert_eq!(ids(&catalog, &results[0]), vec!["s1", "s2", "s9", "s10"]);
    }

    #[test]
    fn test_psf_range_and_missing_psf() {
        let (catalog, stats) = setup();
        let mut fields = BTreeMap::new();
        fields.insert(
            "aspectRatio".to_string(),
            RangeSpec {
                min: None,
                max: Some(ThresholdValue::Absolute(0.8)),
                not: false,
            },
        );
        let elongated = StarFilter {
            name: Some("elongated".to_string()),
            range: Some(FilterRanges {
                psf: Some(PsfRangeSpec {
                    include_missing_psf: false,
                    fields: fields.clone(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let results = apply_filters(&catalog, &stats, &[elongated]).unwrap();
        assert_eq!(ids(&catalog, &results[0]), vec!["s1", "s3"]);

        let with_missing = StarFilter {
            range: Some(FilterRanges {
                psf: Some(PsfRangeSpec {
                    include_missing_psf: true,
                    fields,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let results = apply_filters(&catalog, &stats, &[with_missing]).unwrap();
        assert_eq!(results[0].stars.len(), 9);
    }

    #[test]
    fn test_chained_and_size_class() {
        let (catalog, stats) = setup();
        // Interval 5: widths 1-4 -> class 5, 5-9 -> class 10, 10 -> class 15
        let class = StarFilter {
            size_class: Some(10.0),
            ..Default::default()
        };
        let chained = StarFilter {
            name: Some("bright".to_string()),
            chained: true,
            range: Some(FilterRanges {
                flux: Some(RangeSpec {
                    min: Some(ThresholdValue::Absolute(8.0)),
                    max: None,
                    not: false,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let results = apply_filters(&catalog, &stats, &[class, chained]).unwrap();
        assert_eq!(results[0].name, "Class_10");
        assert_eq!(ids(&catalog, &results[0]), vec!["s5", "s6", "s7", "s8", "s9"]);
        assert_eq!(ids(&catalog, &results[1]), vec!["s8", "s9"]);
    }

    #[test]
    fn test_filter_deserializes_from_json() {
        let filter: StarFilter = serde_json::from_str(
            r#"{"name": "big", "range": {"width": {"min": "75%"}, "psf": {"includeMissingPSF": true, "aspectRatio": {"max": 0.8}}}}"#,
        )
        .unwrap();
        let ranges = filter.range.unwrap();
        assert_eq!(
            ranges.width.unwrap().min,
            Some(ThresholdValue::Percent(0.75))
        );
        let psf = ranges.psf.unwrap();
        assert!(psf.include_missing_psf);
        assert_eq!(
            psf.fields["aspectRatio"].max,
            Some(ThresholdValue::Absolute(0.8))
        );
    }
}
