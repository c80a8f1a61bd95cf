//! End-to-end runs of the session with scripted detector and fitter
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;

use crate::cancel::{AbortFlag, RunOutcome, StatusSink};
use crate::classifier::{
    compute_limits, resolve_threshold, should_compute_psf, ThresholdConfig, ThresholdSpec, ThresholdValue,
};
use crate::config::StarUtilsConfig;
use crate::detection::{DetectionParams, StarDetector};
use crate::elongation::SkipReason;
use crate::error::StarError;
use crate::geometry::{Point, Rect};
use crate::imaging::Image;
use crate::native_ops::NativeOperators;
use crate::operators::{
    ConvolutionParams, DeconvolutionParams, DeconvolutionPsf, ImageOperators, MorphologicalOp, StructureSize,
};
use crate::psf::{FitRequest, PsfFitter, PsfRow};
use crate::session::{Session, StarImageOptions};
use crate::star::{PsfFunction, PsfStatus, RawStar, SizeBucket, Star};
use crate::statistics::compute_stats;

struct ScriptedDetector {
    stars: Vec<RawStar>,
}

impl StarDetector for ScriptedDetector {
    fn detect(
        &self,
        _luminance: &Image,
        _params: &DetectionParams,
        progress: &mut dyn FnMut(usize, usize) -> bool,
    ) -> anyhow::Result<Vec<RawStar>> {
        progress(self.stars.len(), self.stars.len());
        Ok(self.stars.clone())
    }
}

/// Fits every star with the same elongation
struct ScriptedFitter {
    aspect_ratio: f64,
}

impl PsfFitter for ScriptedFitter {
    fn fit(&self, _luminance: &Image, request: &FitRequest) -> anyhow::Result<Vec<PsfRow>> {
        let sx = 2.0;
        Ok(vec![PsfRow {
            func: PsfFunction::Gaussian,
            circular: false,
            status: PsfStatus::FittedOk,
            b: 0.01,
            a: 0.8,
            cx: request.centroid.x,
            cy: request.centroid.y,
            sx,
            sy: sx * self.aspect_ratio,
            theta: 30.0,
            beta: 0.0,
            mad: 0.001,
            flux: 10.0,
            mean_signal: 0.2,
        }])
    }
}

/// Native operators that remember what they were asked to do
#[derive(Default)]
struct RecordingOperators {
    calls: RefCell<Vec<String>>,
}

impl ImageOperators for RecordingOperators {
    fn convolve(&self, image: &mut Image, params: &ConvolutionParams) -> anyhow::Result<()> {
        self.calls.borrow_mut().push(format!("convolve {:.2}", params.sigma));
        NativeOperators.convolve(image, params)
    }

    fn deconvolve(&self, image: &mut Image, params: &DeconvolutionParams) -> anyhow::Result<()> {
        let call = match params.psf {
            DeconvolutionPsf::MotionBlur { .. } => "deconvolve motion".to_string(),
            DeconvolutionPsf::Parametric { sigma, .. } => format!("deconvolve {:.2}", sigma),
        };
        self.calls.borrow_mut().push(call);
        NativeOperators.deconvolve(image, params)
    }

    fn morphological_transform(
        &self,
        image: &mut Image,
        op: MorphologicalOp,
        structure: StructureSize,
    ) -> anyhow::Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("morphology {:?} {}", op, structure.size()));
        NativeOperators.morphological_transform(image, op, structure)
    }

    fn binarize(&self, image: &mut Image, threshold: f64) -> anyhow::Result<()> {
        self.calls.borrow_mut().push("binarize".to_string());
        NativeOperators.binarize(image, threshold)
    }
}

/// Shares the recorder with the session
struct SharedOperators(std::rc::Rc<RecordingOperators>);

impl ImageOperators for SharedOperators {
    fn convolve(&self, image: &mut Image, params: &ConvolutionParams) -> anyhow::Result<()> {
        self.0.convolve(image, params)
    }

    fn deconvolve(&self, image: &mut Image, params: &DeconvolutionParams) -> anyhow::Result<()> {
        self.0.deconvolve(image, params)
    }

    fn morphological_transform(
        &self,
        image: &mut Image,
        op: MorphologicalOp,
        structure: StructureSize,
    ) -> anyhow::Result<()> {
        self.0.morphological_transform(image, op, structure)
    }

    fn binarize(&self, image: &mut Image, threshold: f64) -> anyhow::Result<()> {
        self.0.binarize(image, threshold)
    }
}

/// Requests an abort once `after` stars have been processed
struct AbortAt {
    abort: AbortFlag,
    after: usize,
}

impl StatusSink for AbortAt {
    fn on_progress_update(&self, current: usize, _total: usize) {
        if current == self.after {
            self.abort.request();
        }
    }
}

fn grid_stars(count: usize, size: f64) -> Vec<RawStar> {
    (0..count)
        .map(|i| RawStar {
            pos: Point::new(20.0 + (i % 5) as f64 * 40.0, 20.0 + (i / 5) as f64 * 40.0),
            size,
            flux: 1.0 + i as f64,
        })
        .collect()
}

fn field_with(stars: &[RawStar]) -> Image {
    let mut img = Image::new(220, 220, 1);
    for s in stars {
        let r = s.size.sqrt() / 2.0;
        let (cx, cy) = (s.pos.x, s.pos.y);
        for y in (cy - r).floor().max(0.0) as usize..((cy + r).ceil() as usize).min(220) {
            for x in (cx - r).floor().max(0.0) as usize..((cx + r).ceil() as usize).min(220) {
                let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                img.set(x, y, 0, (0.9 * (-d2 / (2.0 * r * r)).exp()) as f32);
            }
        }
    }
    img
}

fn session_with(stars: Vec<RawStar>, config: StarUtilsConfig, aspect_ratio: f64) -> Session {
    let image = field_with(&stars);
    Session::new("main", image, config)
        .with_detector(Box::new(ScriptedDetector { stars }))
        .with_fitter(Box::new(ScriptedFitter { aspect_ratio }))
}

fn all_stars_config() -> StarUtilsConfig {
    StarUtilsConfig {
        detect_psf_threshold: ThresholdConfig::None,
        ..Default::default()
    }
}

#[test]
fn test_random_sizes_classification_is_inclusive() {
    let mut rng = StdRng::seed_from_u64(7);
    let stars: Vec<RawStar> = (0..100)
        .map(|_| RawStar {
            pos: Point::new(rng.gen_range(0.0..220.0), rng.gen_range(0.0..220.0)),
            size: rng.gen_range(10.0..=200.0),
            flux: rng.gen_range(0.1..5.0),
        })
        .collect();
    let mut session = session_with(stars, StarUtilsConfig::default(), 0.9);
    assert_eq!(session.analyze_stars().unwrap(), 100);
    let limits = session.set_limits().unwrap();
    let outcome = session.classify_stars().unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let cohorts = session.cohorts();
    assert_eq!(cohorts.big.len() + cohorts.average.len() + cohorts.small.len(), 100);
    for star in session.catalog().stars() {
        let expected = if star.size() >= limits.size.high {
            SizeBucket::Big
        } else if star.size() <= limits.size.low {
            SizeBucket::Small
        } else {
            SizeBucket::Average
        };
        assert_eq!(star.bucket(), Some(expected), "star {}", star.id());
    }

    let stats = session.stats().unwrap();
    for feature in [&stats.size, &stats.flux, &stats.width] {
        assert!(feature.min <= feature.median && feature.median <= feature.max);
    }
}

#[test]
fn test_limits_are_idempotent() {
    let mut session = session_with(grid_stars(10, 64.0), StarUtilsConfig::default(), 0.9);
    session.analyze_stars().unwrap();
    let stats = session.stats().unwrap().clone();
    let config = session.config().limits;
    assert_eq!(compute_limits(&stats, &config), compute_limits(&stats, &config));
    let first = session.set_limits().unwrap();
    assert_eq!(session.set_limits().unwrap(), first);
}

#[test]
fn test_default_threshold_selects_bright_wide_stars() {
    let mut stars = grid_stars(10, 64.0);
    stars[9].size = 144.0;
    let mut session = session_with(stars, StarUtilsConfig::default(), 0.5);
    session.run_analysis().unwrap();
    // flux >= avg(1..10) = 5.5 and width >= 70% of [8, 12]
    assert_eq!(session.stars_with_psf(), &[9]);
    assert_eq!(session.psf_values().count(), 1);
    assert!(session.stats().unwrap().psf.contains_key("aspectRatio"));
}

#[test]
fn test_predicate_threshold() {
    let mut session = session_with(grid_stars(10, 64.0), StarUtilsConfig::default(), 0.5);
    session.set_psf_threshold(ThresholdSpec::Predicate(Box::new(|s: &Star| s.flux() <= 2.0)));
    session.run_analysis().unwrap();
    assert_eq!(session.stars_with_psf(), &[0, 1]);
}

#[test]
fn test_percent_threshold_resolution() {
    let spec = ThresholdSpec::Keys(vec![("size".to_string(), ThresholdValue::parse("50%"))]);

    let mut stats = crate::statistics::StarStatistics {
        size: compute_stats(&[0.0, 100.0]).unwrap(),
        flux: compute_stats(&[1.0]).unwrap(),
        width: compute_stats(&[1.0]).unwrap(),
        psf: Default::default(),
        detected_stars: 2,
    };
    let resolved = resolve_threshold(&spec, &stats).unwrap();
    assert!(matches!(&resolved, crate::classifier::ResolvedThreshold::Keys(k) if k[0].1 == 50.0));

    stats.size = compute_stats(&[10.0, 30.0]).unwrap();
    let resolved = resolve_threshold(&spec, &stats).unwrap();
    assert!(matches!(&resolved, crate::classifier::ResolvedThreshold::Keys(k) if k[0].1 == 20.0));
}

#[test]
fn test_threshold_first_failing_key_decides() {
    // width 6 and flux 5 against {width: 5, flux: 10}
    let star = Star::new(
        1,
        &RawStar {
            pos: Point::new(10.0, 10.0),
            size: 36.0,
            flux: 5.0,
        },
        10.0,
    );
    let stats = crate::statistics::StarStatistics {
        size: compute_stats(&[36.0]).unwrap(),
        flux: compute_stats(&[5.0]).unwrap(),
        width: compute_stats(&[6.0]).unwrap(),
        psf: Default::default(),
        detected_stars: 1,
    };
    let spec = ThresholdSpec::Keys(vec![
        ("width".to_string(), ThresholdValue::Absolute(5.0)),
        ("flux".to_string(), ThresholdValue::Absolute(10.0)),
    ]);
    let resolved = resolve_threshold(&spec, &stats).unwrap();
    assert!(!should_compute_psf(&star, &resolved));
}

#[test]
fn test_group_by_keeps_every_star() {
    let mut rng = StdRng::seed_from_u64(11);
    let stars: Vec<RawStar> = (0..60)
        .map(|_| RawStar {
            pos: Point::new(rng.gen_range(0.0..220.0), rng.gen_range(0.0..220.0)),
            size: rng.gen_range(4.0..400.0),
            flux: rng.gen_range(0.1..5.0),
        })
        .collect();
    let mut session = session_with(stars, StarUtilsConfig::default(), 0.9);
    session.analyze_stars().unwrap();
    let catalog = session.catalog_mut();
    let sorted_len = catalog.sort_by("width").len();
    let grouped: usize = catalog.group_by("width", 2.0).iter().map(|(_, s)| s.len()).sum();
    assert_eq!(grouped, sorted_len);
    assert_eq!(sorted_len, 60);
}

#[test]
fn test_round_star_is_not_fixed() {
    let mut session = session_with(grid_stars(4, 100.0), all_stars_config(), 0.95);
    session.run_analysis().unwrap();
    assert_eq!(session.stars_with_psf().len(), 4);

    let before = session.view().image().clone();
    let report = session.fix_elongated_stars(None).unwrap();
    assert!(report.entries.is_empty());
    assert_eq!(report.skipped.len(), 4);
    assert!(report
        .skipped
        .iter()
        .all(|(_, r)| matches!(r, SkipReason::AboveThreshold { aspect_ratio } if (*aspect_ratio - 0.95).abs() < 1e-9)));
    assert_eq!(session.view().image(), &before);
}

#[test]
fn test_fix_elongated_stars_records_log() {
    let mut session = session_with(grid_stars(4, 100.0), all_stars_config(), 0.5);
    session.run_analysis().unwrap();
    let before = session.view().image().clone();
    let report = session.fix_elongated_stars(None).unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.entries.len(), 4);
    assert_eq!(session.log().fix_elongated_star.len(), 4);
    assert_ne!(session.view().image(), &before);
    // Only the luminance image stays open
    assert_eq!(session.registry().open_count(), 1);
}

#[test]
fn test_abort_during_fix_keeps_processed_entries() {
    let config = StarUtilsConfig {
        fix: crate::elongation::FixOptions {
            atomic: false,
            ..Default::default()
        },
        ..all_stars_config()
    };
    let mut session = session_with(grid_stars(10, 100.0), config, 0.5);
    session.run_analysis().unwrap();
    assert_eq!(session.stars_with_psf().len(), 10);

    let abort = session.abort_flag();
    let mut session = session.with_sink(Box::new(AbortAt { abort, after: 3 }));
    let report = session.fix_elongated_stars(None).unwrap();
    assert_eq!(report.outcome, RunOutcome::Aborted { processed: 3 });
    assert_eq!(report.entries.len(), 3);
    assert_eq!(session.log().fix_elongated_star.len(), 3);
    // Star masks are closed, only the luminance image is left
    assert_eq!(session.registry().open_count(), 1);
    assert!(session.registry().open_ids()[0].starts_with("luminance"));

    session.close_temporaries();
    assert_eq!(session.registry().open_count(), 0);
}

#[test]
fn test_atomic_abort_leaves_image_untouched() {
    let mut session = session_with(grid_stars(10, 100.0), all_stars_config(), 0.5);
    session.run_analysis().unwrap();
    let before = session.view().image().clone();
    let abort = session.abort_flag();
    let mut session = session.with_sink(Box::new(AbortAt { abort, after: 2 }));
    let report = session.fix_elongated_stars(None).unwrap();
    assert!(report.outcome.is_aborted());
    assert_eq!(report.entries.len(), 2);
    assert_eq!(session.view().image(), &before);
}

#[test]
fn test_abort_during_classification() {
    let mut session = session_with(grid_stars(10, 64.0), all_stars_config(), 0.5);
    session.analyze_stars().unwrap();
    let abort = session.abort_flag();
    let mut session = session.with_sink(Box::new(AbortAt { abort, after: 4 }));
    let outcome = session.classify_stars().unwrap();
    assert_eq!(outcome, RunOutcome::Aborted { processed: 4 });
    assert_eq!(session.stars_with_psf().len(), 4);
    assert_eq!(session.stats().unwrap().psf["aspectRatio"].avg, 0.5);
}

#[test]
fn test_reduce_stars_above_average() {
    let mut stars = grid_stars(6, 49.0);
    stars[0].size = 144.0;
    stars[1].size = 144.0;
    let mut session = session_with(stars, StarUtilsConfig::default(), 0.9);
    session.run_analysis().unwrap();
    let report = session.reduce_stars(None).unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    let total: usize = report.entries.values().map(|e| e.stars).sum();
    assert_eq!(total, 2);
    assert_eq!(session.log().reduce_stars.len(), report.entries.len());
}

#[test]
fn test_star_images_per_cohort() {
    let mut stars = grid_stars(9, 64.0);
    stars[0].size = 400.0;
    stars[8].size = 16.0;
    let mut session = session_with(stars, StarUtilsConfig::default(), 0.9);
    session.run_analysis().unwrap();

    let images = session.create_star_images(&StarImageOptions::default()).unwrap();
    let names: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
    assert!(names.contains(&"BigStars"));
    assert!(names.contains(&"SmallStars"));
    let big = images.iter().find(|i| i.name == "BigStars").unwrap();
    assert_eq!(big.star_ids, vec!["s1".to_string()]);
    assert_eq!(big.image.width(), 220);

    let masks = session
        .create_star_images(&StarImageOptions {
            mask: Some(Default::default()),
            average: false,
            small: false,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(masks.len(), 1);
    assert!(masks[0].image.get(20, 20, 0) > 0.5);
    assert_eq!(session.registry().open_count(), 1);
}

#[test]
fn test_target_area_and_log() {
    let config = StarUtilsConfig {
        target_area: Some(Rect::new(0.0, 0.0, 100.0, 100.0)),
        ..all_stars_config()
    };
    let mut session = session_with(grid_stars(10, 64.0), config, 0.5);
    session.run_analysis().unwrap();
    // x in {20, 60}, y in {20, 60}
    assert_eq!(session.catalog().len(), 4);

    let json: serde_json::Value = serde_json::from_str(&session.log_json().unwrap()).unwrap();
    assert_eq!(json["viewId"], "main");
    assert_eq!(json["targetArea"]["width"], 100.0);
    assert_eq!(json["stats"]["detectedStars"], 4);
    assert_eq!(json["stars"].as_array().unwrap().len(), 4);
    assert!(json["stars"][0]["psf"]["aspectRatio"].is_number());
}

#[test]
fn test_operations_need_analysis() {
    let mut session = session_with(grid_stars(3, 64.0), StarUtilsConfig::default(), 0.9);
    assert_eq!(session.set_limits().unwrap_err(), StarError::NotAnalyzed);
    assert_eq!(session.fix_elongated_stars(None).unwrap_err(), StarError::NotAnalyzed);
    assert!(session.create_star_images(&StarImageOptions::default()).is_err());
}

#[test]
fn test_empty_detection() {
    let mut session = session_with(Vec::new(), StarUtilsConfig::default(), 0.9);
    assert_eq!(session.analyze_stars().unwrap_err(), StarError::EmptyDataset);
}

#[test]
fn test_fix_runs_mask_then_three_operators() {
    let recorder = std::rc::Rc::new(RecordingOperators::default());
    let mut session = session_with(grid_stars(1, 100.0), all_stars_config(), 0.5)
        .with_operators(Box::new(SharedOperators(recorder.clone())));
    session.run_analysis().unwrap();
    let report = session.fix_elongated_stars(None).unwrap();
    let entry = report.entries["s1"];

    let calls = recorder.calls.borrow();
    assert_eq!(calls.len(), 6);
    assert_eq!(calls[0], "binarize");
    assert!(calls[1].starts_with("morphology Dilation"));
    assert!(calls[2].starts_with("convolve"));
    assert_eq!(calls[3], format!("convolve {:.2}", entry.convolution.std_dev));
    assert_eq!(calls[4], "deconvolve motion");
    assert_eq!(calls[5], format!("deconvolve {:.2}", entry.deconvolution.std_dev));
}

#[test]
fn test_abort_before_first_star_is_not_an_error() {
    let session = session_with(Vec::new(), StarUtilsConfig::default(), 0.9);
    let abort = session.abort_flag();
    let mut session = session.with_sink(Box::new(AbortAt { abort, after: 0 }));
    assert_eq!(session.run_analysis().unwrap(), RunOutcome::Aborted { processed: 0 });
    assert!(session.stats().is_none());
    assert!(session.catalog().is_empty());
}

#[test]
fn test_reduce_runs_after_aborted_fix() {
    let mut stars = grid_stars(6, 49.0);
    stars[0].size = 144.0;
    stars[1].size = 144.0;
    let config = StarUtilsConfig {
        fix: crate::elongation::FixOptions {
            atomic: false,
            ..Default::default()
        },
        ..all_stars_config()
    };
    let mut session = session_with(stars, config, 0.5);
    session.run_analysis().unwrap();

    let abort = session.abort_flag();
    let mut session = session.with_sink(Box::new(AbortAt { abort, after: 1 }));
    let fixed = session.fix_elongated_stars(None).unwrap();
    assert_eq!(fixed.outcome, RunOutcome::Aborted { processed: 1 });

    let mut session = session.with_sink(Box::new(crate::cancel::LogStatusSink));
    let reduced = session.reduce_stars(None).unwrap();
    assert_eq!(reduced.outcome, RunOutcome::Completed);
    assert!(!reduced.entries.is_empty());
}

#[test]
fn test_plot_without_values_reports_failure() {
    let mut session = session_with(grid_stars(3, 64.0), StarUtilsConfig::default(), 0.9);
    session.analyze_stars().unwrap();
    let opts = crate::plot::PlotOptions {
        output_dir: std::path::PathBuf::from("plots"),
        ..Default::default()
    };
    let result = session.plot("psf.aspectRatio", None, &opts).unwrap();
    assert!(!result.created);
    assert!(result.error.is_some());
    assert!(result.script.is_none());
    assert_eq!(
        result.image_file,
        std::path::PathBuf::from("plots").join("star_psf_aspectRatio_graph.svg")
    );
}
