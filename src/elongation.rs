/// Elongated star correction: convolution, motion-blur deconvolution and
/// parametric deconvolution under a per-star mask
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cancel::{AbortFlag, RunOutcome, StatusSink};
use crate::error::Result;
use crate::imaging::Image;
use crate::mask::{MaskBuilder, MaskOptions, DEFAULT_BINARIZE_THRESHOLD};
use crate::operators::{ConvolutionParams, DeconvolutionParams, ImageOperators, StructureSize};
use crate::resources::TempRegistry;
use crate::star::{Psf, Star};
use crate::view::{MaskImage, Process, View};

/// Upper bound of the motion-blur length
pub const MAX_MOTION_LENGTH: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FixOptions {
    /// Stars with `aspectRatio >= threshold` are left alone
    pub threshold: f64,
    pub max_std_dev: f64,
    pub deringing: bool,
    pub deringing_scale: f64,
    pub fix_factor: f64,
    /// Work on a copy and commit only when every star was processed
    pub atomic: bool,
    /// Accumulate the per-star masks into one mask for inspection
    pub keep_mask: bool,
}

impl Default for FixOptions {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            max_std_dev: 8.0,
            deringing: true,
            deringing_scale: 1.0,
            fix_factor: 1.0,
            atomic: true,
            keep_mask: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvolutionLog {
    pub std_dev: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotionDeconvolutionLog {
    pub len: f64,
    pub angle: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeconvolutionLog {
    pub std_dev: f64,
    pub deringing: bool,
    pub deringing_dark: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MaskLog {
    pub binarize: bool,
    pub dilation: u32,
    pub convolution: f64,
}

/// Parameters applied to one star
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixLogEntry {
    pub convolution: ConvolutionLog,
    pub motion_deconvolution: MotionDeconvolutionLog,
    pub deconvolution: DeconvolutionLog,
    pub mask: MaskLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "reason")]
pub enum SkipReason {
    MissingPsf,
    /// Already round enough
    AboveThreshold { aspect_ratio: f64 },
    /// Smaller than the average star
    BelowAverageSize { size: f64 },
    /// No mask could be built (star outside the image)
    NoMask,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixOutcome {
    Fixed(FixLogEntry),
    Skipped(SkipReason),
}

/// Result of a batch fix
#[derive(Debug)]
pub struct FixReport {
    pub outcome: RunOutcome,
    pub entries: BTreeMap<String, FixLogEntry>,
    pub skipped: Vec<(String, SkipReason)>,
    /// Union of the star masks when `keep_mask` is set
    pub mask: Option<MaskImage>,
}

/// `sx` corrected for functions that report an inflated sigma: when
/// FWHMx/sx rounds below 2, half the FWHM is used instead
pub fn normalized_sx(psf: &Psf) -> f64 {
    if psf.sx > 0.0 && psf.fwhm_x > 0.0 && (psf.fwhm_x / psf.sx).round() < 2.0 {
        psf.fwhm_x / 2.0
    } else {
        psf.sx
    }
}

/// Operator parameters for one star
pub fn plan_fix(star: &Star, psf: &Psf, opts: &FixOptions) -> FixLogEntry {
    let aspect_ratio = if psf.aspect_ratio > 0.0 {
        psf.aspect_ratio
    } else {
        1.0
    };
    let fix_len = 1.5 * (1.0 / aspect_ratio) * opts.fix_factor;
    let structure = StructureSize::for_width(star.width());
    let mask_convolution = (star.width() / 4.0).max(2.0);

    let sx = normalized_sx(psf);
    let std_dev = sx.min(opts.max_std_dev);
    let motion_length = (sx * fix_len).min(MAX_MOTION_LENGTH);
    let deringing_dark = std_dev * opts.deringing_scale / 1000.0;

    FixLogEntry {
        convolution: ConvolutionLog { std_dev },
        motion_deconvolution: MotionDeconvolutionLog {
            len: motion_length,
            angle: psf.angle,
        },
        deconvolution: DeconvolutionLog {
            std_dev,
            deringing: opts.deringing,
            deringing_dark,
        },
        mask: MaskLog {
            binarize: true,
            dilation: structure.size(),
            convolution: mask_convolution,
        },
    }
}

pub struct ElongationFixer<'a> {
    operators: &'a dyn ImageOperators,
    registry: &'a TempRegistry,
}

impl<'a> ElongationFixer<'a> {
    pub fn new(operators: &'a dyn ImageOperators, registry: &'a TempRegistry) -> Self {
        Self {
            operators,
            registry,
        }
    }

    /// Fix one star inside an open transaction.
    ///
    /// The star mask is built from `luminance`, applied while the three
    /// operators run and closed before returning. With `keep_mask` the
    /// mask is merged (maximum) into it first.
    pub fn fix_star(
        &self,
        star: &Star,
        luminance: &Image,
        process: &mut Process<'_>,
        opts: &FixOptions,
        keep_mask: Option<&mut Option<MaskImage>>,
    ) -> Result<FixOutcome> {
        let Some(psf) = star.psf.as_ref() else {
            tracing::warn!("Cannot fix elongated star {}: Missing PSF", star.id());
            return Ok(FixOutcome::Skipped(SkipReason::MissingPsf));
        };
        let entry = plan_fix(star, psf, opts);

        let mask_opts = MaskOptions {
            binarize: Some(DEFAULT_BINARIZE_THRESHOLD),
            dilation: Some(entry.mask.dilation),
            convolution: Some(entry.mask.convolution),
            enlarged: true,
            min_flux: None,
        };
        let mask_name = format!("{}_mask", star.id());
        let builder = MaskBuilder::new(self.operators, self.registry);
        let Some(mask) = builder.build_mask(luminance, &[star], &mask_opts, &mask_name)? else {
            tracing::warn!("Failed to create mask for star {}", star.id());
            return Ok(FixOutcome::Skipped(SkipReason::NoMask));
        };

        tracing::info!(
            "Fix elongated star {}, StdDev: {:.3}, Angle: {:.1}",
            star.id(),
            entry.convolution.std_dev,
            entry.motion_deconvolution.angle
        );

        // Operators see enough context around the mask for their kernels
        let margin = (3.0 * entry.convolution.std_dev).ceil() as usize
            + (entry.motion_deconvolution.len / 2.0).ceil() as usize
            + 2;
        {
            let mut masked = process.with_mask(&mask, margin);
            let convolution = ConvolutionParams::gaussian(entry.convolution.std_dev);
            masked.apply("Convolution", |img| self.operators.convolve(img, &convolution))?;

            let motion = DeconvolutionParams::motion_blur(
                entry.motion_deconvolution.len,
                entry.motion_deconvolution.angle,
            );
            masked.apply("Deconvolution", |img| self.operators.deconvolve(img, &motion))?;

            let deconvolution = DeconvolutionParams::parametric(
                entry.deconvolution.std_dev,
                entry.deconvolution.deringing,
                entry.deconvolution.deringing_dark,
            );
            masked.apply("Deconvolution", |img| self.operators.deconvolve(img, &deconvolution))?;
        }

        if let Some(kept) = keep_mask {
            match kept {
                Some(acc) => acc.merge_max(&mask),
                None => *kept = Some((*mask).clone()),
            }
        }
        Ok(FixOutcome::Fixed(entry))
    }

    /// Fix every elongated star in `stars`.
    ///
    /// Skips stars without PSF, stars with `aspectRatio >= threshold` and
    /// stars smaller than `avg_size`. The abort flag is checked between
    /// stars; in atomic mode an aborted run leaves `view` untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn fix_all(
        &self,
        stars: &[&Star],
        luminance: &Image,
        view: &mut View,
        avg_size: f64,
        opts: &FixOptions,
        abort: &AbortFlag,
        sink: &dyn StatusSink,
    ) -> Result<FixReport> {
        let mut report = FixReport {
            outcome: RunOutcome::Completed,
            entries: BTreeMap::new(),
            skipped: Vec::new(),
            mask: None,
        };
        if stars.is_empty() {
            return Ok(report);
        }

        sink.on_status_update("Fixing elongated stars");
        sink.on_progress_update(0, 0);

        let mut scratch = if opts.atomic {
            let copy = View::new(format!("{}_atomic", view.id()), view.image().clone());
            Some(self.registry.track(view.id(), copy))
        } else {
            None
        };

        {
            let target: &mut View = match scratch.as_mut() {
                Some(s) => &mut **s,
                None => &mut *view,
            };
            let mut process = target.begin_process();
            let len = stars.len();
            let mut kept = None;

            for (i, star) in stars.iter().enumerate() {
                if abort.is_requested() {
                    tracing::warn!("Elongation fix aborted after {} of {} stars", i, len);
                    report.outcome = RunOutcome::Aborted { processed: i };
                    break;
                }
                let prefix = format!("[{}/{} {}%]", i + 1, len, ((i + 1) * 100) / len);

                let skip = match star.psf.as_ref() {
                    None => Some(SkipReason::MissingPsf),
                    Some(psf) if psf.aspect_ratio >= opts.threshold => {
                        Some(SkipReason::AboveThreshold {
                            aspect_ratio: psf.aspect_ratio,
                        })
                    }
                    Some(_) if star.size() < avg_size => Some(SkipReason::BelowAverageSize {
                        size: star.size(),
                    }),
                    Some(_) => None,
                };

                let outcome = match skip {
                    Some(reason) => FixOutcome::Skipped(reason),
                    None => {
                        tracing::debug!("{} Fixing elongated star {}", prefix, star.id());
                        let keep = if opts.keep_mask { Some(&mut kept) } else { None };
                        self.fix_star(star, luminance, &mut process, opts, keep)?
                    }
                };
                match outcome {
                    FixOutcome::Fixed(entry) => {
                        report.entries.insert(star.id().to_string(), entry);
                    }
                    FixOutcome::Skipped(reason) => {
                        tracing::warn!("{} star {} skipped: {:?}", prefix, star.id(), reason);
                        report.skipped.push((star.id().to_string(), reason));
                    }
                }
                sink.on_progress_update(i + 1, len);
            }
            report.mask = kept;
        }

        if let Some(scratch) = scratch {
            if report.outcome.is_aborted() {
                tracing::warn!("Atomic fix aborted, {} left unchanged", view.id());
            } else {
                let mut process = view.begin_process();
                process.assign(scratch.image());
            }
        }

        sink.on_status_update("Done");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::LogStatusSink;
    use crate::geometry::Point;
    use crate::native_ops::NativeOperators;
    use crate::star::{PsfFunction, PsfStatus, RawStar};

    fn psf(sx: f64, aspect_ratio: f64, func: PsfFunction) -> Psf {
        Psf {
            func,
            circular: false,
            status: PsfStatus::FittedOk,
            b: 0.1,
            a: 0.6,
            cx: 0.0,
            cy: 0.0,
            sx,
            sy: sx * aspect_ratio,
            theta: 30.0,
            angle: 30.0,
            beta: 4.0,
            mad: 0.0,
            flux: 1.0,
            mean_signal: 0.2,
            aspect_ratio,
            fwhm_x: func.fwhm(sx, 4.0),
            fwhm_y: func.fwhm(sx * aspect_ratio, 4.0),
        }
    }

    fn star(n: usize, x: f64, y: f64, size: f64, psf: Option<Psf>) -> Star {
        let mut s = Star::new(
            n,
            &RawStar {
                pos: Point::new(x, y),
                size,
                flux: 1.0,
            },
            10.0,
        );
        s.psf = psf;
        s
    }

    /// Horizontal streaks on a dark background
    fn field() -> Image {
        let mut img = Image::new(64, 64, 1);
        for (cx, cy) in [(16usize, 16usize), (48, 48)] {
            for x in cx - 4..=cx + 4 {
                img.set(x, cy, 0, 0.8);
                img.set(x, cy + 1, 0, 0.4);
            }
        }
        img
    }

    #[test]
    fn test_plan_fix_parameters() {
        let s = star(1, 10.0, 10.0, 100.0, None);
        let p = psf(3.0, 0.5, PsfFunction::Gaussian);
        let entry = plan_fix(&s, &p, &FixOptions::default());
        // fixLen = 1.5 * 2 = 3
        assert!((entry.motion_deconvolution.len - 9.0).abs() < 1e-12);
        assert_eq!(entry.motion_deconvolution.angle, 30.0);
        assert_eq!(entry.convolution.std_dev, 3.0);
        assert!((entry.deconvolution.deringing_dark - 0.003).abs() < 1e-12);
        assert_eq!(entry.mask.dilation, 9);
        assert_eq!(entry.mask.convolution, 2.5);
    }

    #[test]
    fn test_plan_fix_caps() {
        let s = star(1, 10.0, 10.0, 16.0, None);
        let p = psf(20.0, 0.1, PsfFunction::Gaussian);
        let entry = plan_fix(&s, &p, &FixOptions::default());
        assert_eq!(entry.convolution.std_dev, 8.0);
        assert_eq!(entry.motion_deconvolution.len, MAX_MOTION_LENGTH);
        assert_eq!(entry.mask.dilation, 5);
        assert_eq!(entry.mask.convolution, 2.0);
    }

    #[test]
    fn test_sx_normalization() {
        // Moffat4 FWHM / sigma = 0.87: rounds to 1, sigma is rescaled
        let moffat = psf(4.0, 0.5, PsfFunction::Moffat4);
        assert!((normalized_sx(&moffat) - 0.87 * 4.0 / 2.0).abs() < 1e-12);
        let gaussian = psf(4.0, 0.5, PsfFunction::Gaussian);
        assert_eq!(normalized_sx(&gaussian), 4.0);
        let unknown = psf(4.0, 0.5, PsfFunction::Unknown);
        assert_eq!(normalized_sx(&unknown), 4.0);
    }

    #[test]
    fn test_fix_star_without_psf_is_skipped() {
        let registry = TempRegistry::new();
        let fixer = ElongationFixer::new(&NativeOperators, &registry);
        let img = field();
        let mut view = View::new("main", img.clone());
        let mut process = view.begin_process();
        let s = star(1, 16.0, 16.0, 81.0, None);
        let outcome = fixer
            .fix_star(&s, &img, &mut process, &FixOptions::default(), None)
            .unwrap();
        assert_eq!(outcome, FixOutcome::Skipped(SkipReason::MissingPsf));
        assert_eq!(process.operations(), 0);
    }

    #[test]
    fn test_fix_star_changes_only_masked_area() {
        let registry = TempRegistry::new();
        let fixer = ElongationFixer::new(&NativeOperators, &registry);
        let img = field();
        let mut view = View::new("main", img.clone());
        let s = star(1, 16.5, 16.5, 81.0, Some(psf(2.0, 0.5, PsfFunction::Gaussian)));
        {
            let mut process = view.begin_process();
            let outcome = fixer
                .fix_star(&s, &img, &mut process, &FixOptions::default(), None)
                .unwrap();
            assert!(matches!(outcome, FixOutcome::Fixed(_)));
            assert_eq!(process.operations(), 3);
        }
        assert_eq!(registry.open_count(), 0);
        assert_ne!(view.image().get(16, 16, 0), img.get(16, 16, 0));
        // The second streak is outside the mask
        assert_eq!(view.image().get(48, 48, 0), img.get(48, 48, 0));
    }

    #[test]
    fn test_fix_all_skips_round_and_small_stars() {
        let registry = TempRegistry::new();
        let fixer = ElongationFixer::new(&NativeOperators, &registry);
        let img = field();
        let mut view = View::new("main", img.clone());
        let round = star(1, 16.5, 16.5, 81.0, Some(psf(2.0, 0.95, PsfFunction::Gaussian)));
        let small = star(2, 48.5, 48.5, 4.0, Some(psf(2.0, 0.5, PsfFunction::Gaussian)));
        let report = fixer
            .fix_all(
                &[&round, &small],
                &img,
                &mut view,
                50.0,
                &FixOptions::default(),
                &AbortFlag::new(),
                &LogStatusSink,
            )
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.entries.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert!(matches!(report.skipped[0].1, SkipReason::AboveThreshold { .. }));
        assert!(matches!(report.skipped[1].1, SkipReason::BelowAverageSize { .. }));
        assert_eq!(view.image(), &img);
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_keep_mask_accumulates() {
        let registry = TempRegistry::new();
        let fixer = ElongationFixer::new(&NativeOperators, &registry);
        let img = field();
        let mut view = View::new("main", img.clone());
        let a = star(1, 16.5, 16.5, 81.0, Some(psf(2.0, 0.5, PsfFunction::Gaussian)));
        let b = star(2, 48.5, 48.5, 81.0, Some(psf(2.0, 0.5, PsfFunction::Gaussian)));
        let opts = FixOptions {
            keep_mask: true,
            ..Default::default()
        };
        let report = fixer
            .fix_all(&[&a, &b], &img, &mut view, 0.0, &opts, &AbortFlag::new(), &LogStatusSink)
            .unwrap();
        assert_eq!(report.entries.len(), 2);
        let mask = report.mask.unwrap();
        assert!(mask.value_at(16, 16) > 0.5);
        assert!(mask.value_at(48, 48) > 0.5);
        assert_eq!(registry.open_count(), 0);
    }
}
