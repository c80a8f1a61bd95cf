/// Analysis session: owns the image, the catalog and the collaborators,
/// and runs the detect / classify / fix pipeline
use chrono::Local;
use image::RgbImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::annotate::{annotate_stars, undetected_stars, AnnotateOptions, AnnotationStyle};
use crate::cancel::{AbortFlag, LogStatusSink, RunOutcome, StatusSink};
use crate::catalog::StarCatalog;
use crate::classifier::{
    classify, compute_limits, resolve_threshold, should_compute_psf, Limits, ThresholdSpec,
};
use crate::config::StarUtilsConfig;
use crate::detection::{BlobDetector, DetectionAdapter, StarDetector};
use crate::elongation::{ElongationFixer, FixLogEntry, FixReport};
use crate::error::{Result, StarError};
use crate::filters::{apply_filters, StarFilter};
use crate::geometry::Rect;
use crate::imaging::Image;
use crate::mask::{draw_stars, MaskBuilder, MaskOptions};
use crate::native_ops::NativeOperators;
use crate::operators::ImageOperators;
use crate::plot::{GnuplotService, PlotData, PlotOptions, PlotResult, PlottingService};
use crate::psf::{PsfAccumulator, PsfEstimator, PsfFitter};
use crate::psf_fitting::LmPsfFitter;
use crate::reduction::{ReduceReport, ReductionLogEntry, StarReducer};
use crate::resources::{TempRegistry, Temporary};
use crate::star::{SizeBucket, Star};
use crate::statistics::{compute_stats, two_sided_avg_dev, two_sided_mad, StarStatistics};
use crate::view::{MaskImage, View};

/// Catalog indexes per size bucket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cohorts {
    pub big: Vec<usize>,
    pub average: Vec<usize>,
    pub small: Vec<usize>,
}

impl Cohorts {
    pub fn get(&self, bucket: SizeBucket) -> &[usize] {
        match bucket {
            SizeBucket::Big => &self.big,
            SizeBucket::Average => &self.average,
            SizeBucket::Small => &self.small,
        }
    }

    fn clear(&mut self) {
        self.big.clear();
        self.average.clear();
        self.small.clear();
    }
}

/// What `create_star_images` produces
#[derive(Debug, Clone, PartialEq)]
pub struct StarImageOptions {
    pub big: bool,
    pub average: bool,
    pub small: bool,
    /// Build masks instead of star images
    pub mask: Option<MaskOptions>,
    pub filters: Vec<StarFilter>,
    pub enlarged: bool,
}

impl Default for StarImageOptions {
    fn default() -> Self {
        Self {
            big: true,
            average: true,
            small: true,
            mask: None,
            filters: Vec::new(),
            enlarged: true,
        }
    }
}

/// A star image or mask for a named star set
#[derive(Debug, Clone, PartialEq)]
pub struct StarImage {
    pub name: String,
    pub star_ids: Vec<String>,
    pub image: Image,
}

/// Run log entries accumulated by the session
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLog {
    pub view_id: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_area: Option<Rect>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fix_elongated_star: BTreeMap<String, FixLogEntry>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub reduce_stars: BTreeMap<u32, ReductionLogEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogDocument<'a> {
    #[serde(flatten)]
    log: &'a SessionLog,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<&'a StarStatistics>,
    stars: &'a [Star],
}

pub struct Session {
    config: StarUtilsConfig,
    view: View,
    luminance: Option<Temporary<Image>>,
    detector: Box<dyn StarDetector>,
    fitter: Box<dyn PsfFitter>,
    operators: Box<dyn ImageOperators>,
    plotter: Box<dyn PlottingService>,
    sink: Box<dyn StatusSink>,
    abort: AbortFlag,
    registry: TempRegistry,
    psf_threshold: ThresholdSpec,
    catalog: StarCatalog,
    stats: Option<StarStatistics>,
    limits: Option<Limits>,
    min_allowed_flux: Option<f64>,
    cohorts: Cohorts,
    stars_with_psf: Vec<usize>,
    psf_values: PsfAccumulator,
    log: SessionLog,
}

fn print_header(text: &str) {
    tracing::info!("===== {} =====", text);
}

impl Session {
    /// Session on `image` with the built-in collaborators
    pub fn new(view_id: impl Into<String>, image: Image, config: StarUtilsConfig) -> Self {
        let view = View::new(view_id, image);
        let gnuplot = match &config.gnuplot {
            Some(exe) => GnuplotService::new(exe.clone()),
            None => GnuplotService::default(),
        };
        let log = SessionLog {
            view_id: view.id().to_string(),
            created_at: Local::now().to_rfc3339(),
            ..Default::default()
        };
        let session = Self {
            view,
            luminance: None,
            detector: Box::new(BlobDetector::new()),
            fitter: Box::new(LmPsfFitter::new(config.fit_model())),
            operators: Box::new(NativeOperators::new()),
            plotter: Box::new(gnuplot),
            sink: Box::new(LogStatusSink),
            abort: AbortFlag::new(),
            registry: TempRegistry::new(),
            psf_threshold: ThresholdSpec::from(config.detect_psf_threshold.clone()),
            catalog: StarCatalog::new(config.size_class_interval),
            stats: None,
            limits: None,
            min_allowed_flux: None,
            cohorts: Cohorts::default(),
            stars_with_psf: Vec::new(),
            psf_values: PsfAccumulator::new(),
            log,
            config,
        };
        print_header("StarUtils initialized");
        session.sink.on_status_update("Initialized");
        session
    }

    pub fn with_detector(mut self, detector: Box<dyn StarDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_fitter(mut self, fitter: Box<dyn PsfFitter>) -> Self {
        self.fitter = fitter;
        self
    }

    pub fn with_operators(mut self, operators: Box<dyn ImageOperators>) -> Self {
        self.operators = operators;
        self
    }

    pub fn with_plotter(mut self, plotter: Box<dyn PlottingService>) -> Self {
        self.plotter = plotter;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the PSF threshold, e.g. with a predicate
    pub fn set_psf_threshold(&mut self, threshold: ThresholdSpec) {
        self.psf_threshold = threshold;
    }

    pub fn config(&self) -> &StarUtilsConfig {
        &self.config
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn into_image(self) -> Image {
        self.view.into_image()
    }

    pub fn catalog(&self) -> &StarCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut StarCatalog {
        &mut self.catalog
    }

    pub fn stats(&self) -> Option<&StarStatistics> {
        self.stats.as_ref()
    }

    pub fn limits(&self) -> Option<&Limits> {
        self.limits.as_ref()
    }

    pub fn cohorts(&self) -> &Cohorts {
        &self.cohorts
    }

    pub fn stars_with_psf(&self) -> &[usize] {
        &self.stars_with_psf
    }

    pub fn psf_values(&self) -> &PsfAccumulator {
        &self.psf_values
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    pub fn registry(&self) -> &TempRegistry {
        &self.registry
    }

    /// Shared flag; requesting it stops the running loop at its next
    /// yield point
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub fn min_allowed_flux(&self) -> Option<f64> {
        self.min_allowed_flux
    }

    fn stars_at(&self, indexes: &[usize]) -> Vec<&Star> {
        indexes.iter().filter_map(|&i| self.catalog.get(i)).collect()
    }

    fn luminance_image(&self) -> Result<&Image> {
        self.luminance.as_deref().ok_or(StarError::NotAnalyzed)
    }

    /// Detect stars, build the catalog and the detection statistics.
    ///
    /// Returns the number of catalogued stars; an aborted detection keeps
    /// the partial result. An abort before any star was found returns 0
    /// and leaves the statistics unset.
    pub fn analyze_stars(&mut self) -> Result<usize> {
        print_header("Analyzing stars...");
        self.sink.on_status_update("Analyzing stars");
        self.abort.reset();

        let luminance = self.registry.track("luminance", self.view.image().luminance());
        let adapter = DetectionAdapter::new(self.detector.as_ref(), self.abort.clone());
        let raw = adapter.detect(&luminance, &self.config.detection, self.sink.as_ref())?;
        self.luminance = Some(luminance);

        let target_area = self.config.target_area;
        self.log.target_area = target_area;
        self.catalog.populate(&raw, target_area.as_ref());
        tracing::info!("Found {} star(s)", self.catalog.len());

        if self.abort.is_requested() && self.catalog.is_empty() {
            tracing::warn!("Detection aborted before any star was found");
            self.stats = None;
            self.limits = None;
            self.sink.on_status_update("Aborted");
            return Ok(0);
        }

        self.sink.on_status_update("Detecting stars");
        let len = self.catalog.len();
        for (i, star) in self.catalog.stars().iter().enumerate() {
            tracing::debug!(
                "Star {}: pos {:.2},{:.2} size {} flux {:.4} square {:.2}x{:.2}",
                star.id(),
                star.pos().x,
                star.pos().y,
                star.size(),
                star.flux(),
                star.width(),
                star.width()
            );
            self.sink.on_progress_update(i + 1, len);
        }

        self.calculate_stats()?;
        if self.config.verbose {
            self.print_stats()?;
        }
        self.sink.on_status_update("Done");
        Ok(len)
    }

    fn calculate_stats(&mut self) -> Result<()> {
        print_header("Calculating stats...");
        self.sink.on_status_update("Calculating stats");
        let stats = StarStatistics {
            size: compute_stats(&self.catalog.values("size"))?,
            flux: compute_stats(&self.catalog.values("flux"))?,
            width: compute_stats(&self.catalog.values("width"))?,
            psf: BTreeMap::new(),
            detected_stars: self.catalog.len(),
        };
        self.stats = Some(stats);
        self.limits = None;
        Ok(())
    }

    /// Size, width and flux limits from the configured factors
    pub fn set_limits(&mut self) -> Result<Limits> {
        let stats = self.stats.as_ref().ok_or(StarError::NotAnalyzed)?;
        self.min_allowed_flux = Some(self.config.min_allowed_flux.unwrap_or(stats.flux.avg));
        let limits = compute_limits(stats, &self.config.limits);
        tracing::debug!(
            "Size limits {:.2}-{:.2}, width limits {:.2}-{:.2}, flux limits {:.4}-{:.4}",
            limits.size.low,
            limits.size.high,
            limits.width.low,
            limits.width.high,
            limits.flux.low,
            limits.flux.high
        );
        self.limits = Some(limits);
        Ok(limits)
    }

    /// Classify every star into big/average/small and fit PSFs for the
    /// stars passing the PSF threshold.
    ///
    /// The abort flag is cleared on entry and checked between stars. PSF
    /// statistics are refreshed from the fits made so far in both cases.
    pub fn classify_stars(&mut self) -> Result<RunOutcome> {
        self.abort.reset();
        if self.limits.is_none() {
            self.set_limits()?;
        }
        print_header("Classifying stars...");
        let limits = self.limits.ok_or(StarError::NotAnalyzed)?;
        let stats = self.stats.as_ref().ok_or(StarError::NotAnalyzed)?;
        let luminance = self.luminance.as_deref().ok_or(StarError::NotAnalyzed)?;
        let threshold = resolve_threshold(&self.psf_threshold, stats)?;
        let estimator = PsfEstimator::new(self.fitter.as_ref());

        self.cohorts.clear();
        self.stars_with_psf.clear();
        self.psf_values.clear();
        self.sink.on_status_update("Classifying stars");
        self.sink.on_progress_update(0, 0);

        let len = self.catalog.len();
        let mut outcome = RunOutcome::Completed;
        for i in 0..len {
            if self.abort.is_requested() {
                tracing::warn!("Classification aborted after {} of {} stars", i, len);
                outcome = RunOutcome::Aborted { processed: i };
                break;
            }
            let Some(star) = self.catalog.get_mut(i) else {
                break;
            };
            tracing::debug!("[{}/{} {}%] Star {}", i + 1, len, ((i + 1) * 100) / len, star.id());

            let class = classify(star, &limits);
            star.set_classification(class.bucket);
            match class.bucket {
                SizeBucket::Big => self.cohorts.big.push(i),
                SizeBucket::Average => self.cohorts.average.push(i),
                SizeBucket::Small => self.cohorts.small.push(i),
            }

            star.psf = None;
            if should_compute_psf(star, &threshold) {
                if let Some(psf) = estimator.estimate(star, luminance, &self.config.psf)? {
                    tracing::debug!(
                        "PSF center={:.2},{:.2} size={:.2},{:.2} angle={:.1}",
                        psf.cx,
                        psf.cy,
                        psf.sx,
                        psf.sy,
                        psf.angle
                    );
                    self.psf_values.record(&psf);
                    star.psf = Some(psf);
                    self.stars_with_psf.push(i);
                }
            }
            self.sink.on_progress_update(i + 1, len);
        }

        // Enlarged rects and PSFs changed
        self.catalog.clear_cache();
        if let Some(stats) = self.stats.as_mut() {
            stats.refresh_psf(self.psf_values.values())?;
        }
        tracing::info!(
            "Big: {}, average: {}, small: {}, with PSF: {}",
            self.cohorts.big.len(),
            self.cohorts.average.len(),
            self.cohorts.small.len(),
            self.stars_with_psf.len()
        );
        self.sink.on_status_update("Done");
        Ok(outcome)
    }

    /// Detect, set limits and classify
    pub fn run_analysis(&mut self) -> Result<RunOutcome> {
        self.analyze_stars()?;
        if self.abort.is_requested() {
            return Ok(RunOutcome::Aborted { processed: 0 });
        }
        self.set_limits()?;
        self.classify_stars()
    }

    /// Log the detection statistics
    pub fn print_stats(&self) -> Result<()> {
        let stats = self.stats.as_ref().ok_or(StarError::NotAnalyzed)?;
        let sizes = self.catalog.values("size");
        let (mad_low, mad_high) = two_sided_mad(&sizes)?;
        let (dev_low, dev_high) = two_sided_avg_dev(&sizes)?;

        tracing::info!("Avg Size: {} (side: {})", stats.size.avg, stats.size.avg.sqrt());
        tracing::info!("Median Size: {} (side: {})", stats.size.median, stats.size.median.sqrt());
        tracing::info!("Max Size: {} (side: {})", stats.size.max, stats.size.max.sqrt());
        tracing::info!("Size StdDev: {}", stats.size.std_dev);
        tracing::info!("Size AvgDev: {}", stats.size.avg_dev);
        tracing::info!("Size MAD: {}", stats.size.mad);
        tracing::info!("Size 2SIDE MAD: {}-{}", mad_low, mad_high);
        tracing::info!("Size 2SIDE AvgDev: {}-{}", dev_low, dev_high);
        tracing::info!("Size Classes:");
        for (class, stars) in self.catalog.size_classes() {
            tracing::info!("  {}: {}", class, stars.len());
        }
        tracing::info!("Avg Flux: {}", stats.flux.avg);
        tracing::info!("Flux StdDev: {}", stats.flux.std_dev);
        tracing::info!("Flux AvgDev: {}", stats.flux.avg_dev);
        for (field, field_stats) in &stats.psf {
            tracing::debug!("PSF {}: avg {} median {}", field, field_stats.avg, field_stats.median);
        }
        Ok(())
    }

    /// Stars of a cohort; average stars at or below the minimum allowed
    /// flux are left out
    pub fn cohort_stars(&self, bucket: SizeBucket) -> Vec<&Star> {
        let stars = self.stars_at(self.cohorts.get(bucket));
        match (bucket, self.min_allowed_flux) {
            (SizeBucket::Average, Some(min)) => stars.into_iter().filter(|s| s.flux() > min).collect(),
            _ => stars,
        }
    }

    /// Mask for `stars` built from the luminance image
    pub fn build_mask(&self, stars: &[&Star], opts: &MaskOptions, name: &str) -> Result<Option<Temporary<MaskImage>>> {
        let builder = MaskBuilder::new(self.operators.as_ref(), &self.registry);
        builder.build_mask(self.luminance_image()?, stars, opts, name)
    }

    fn star_image(&self, name: &str, stars: &[&Star], opts: &StarImageOptions) -> Result<Option<StarImage>> {
        if stars.is_empty() {
            tracing::warn!("No stars [{}]", name);
            return Ok(None);
        }
        let image = match &opts.mask {
            Some(mask_opts) => match self.build_mask(stars, mask_opts, name)? {
                Some(mask) => mask.to_full_image(),
                None => return Ok(None),
            },
            None => draw_stars(self.view.image(), stars, opts.enlarged, None),
        };
        Ok(Some(StarImage {
            name: name.to_string(),
            star_ids: stars.iter().map(|s| s.id().to_string()).collect(),
            image,
        }))
    }

    /// Star images (or masks) for the cohorts and the named filters
    pub fn create_star_images(&self, opts: &StarImageOptions) -> Result<Vec<StarImage>> {
        if self.limits.is_none() {
            return Err(StarError::NotAnalyzed);
        }
        let mut images = Vec::new();
        for (enabled, bucket, name) in [
            (opts.big, SizeBucket::Big, "BigStars"),
            (opts.average, SizeBucket::Average, "AverageStars"),
            (opts.small, SizeBucket::Small, "SmallStars"),
        ] {
            if !enabled {
                continue;
            }
            tracing::info!("{}:", name);
            images.extend(self.star_image(name, &self.cohort_stars(bucket), opts)?);
        }

        if !opts.filters.is_empty() {
            let stats = self.stats.as_ref().ok_or(StarError::NotAnalyzed)?;
            for filtered in apply_filters(&self.catalog, stats, &opts.filters)? {
                let stars = self.stars_at(&filtered.stars);
                images.extend(self.star_image(&filtered.name, &stars, opts)?);
            }
        }
        Ok(images)
    }

    /// Fix elongated stars; all stars with a PSF when `stars` is `None`
    pub fn fix_elongated_stars(&mut self, stars: Option<&[usize]>) -> Result<FixReport> {
        print_header("Fixing elongated stars...");
        self.abort.reset();
        let stats = self.stats.as_ref().ok_or(StarError::NotAnalyzed)?;
        let luminance = self.luminance.as_deref().ok_or(StarError::NotAnalyzed)?;
        let indexes = stars.unwrap_or(&self.stars_with_psf[..]);
        let selected: Vec<&Star> = indexes.iter().filter_map(|&i| self.catalog.get(i)).collect();

        let fixer = ElongationFixer::new(self.operators.as_ref(), &self.registry);
        let report = fixer.fix_all(
            &selected,
            luminance,
            &mut self.view,
            stats.size.avg,
            &self.config.fix,
            &self.abort,
            self.sink.as_ref(),
        )?;
        self.log
            .fix_elongated_star
            .extend(report.entries.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(report)
    }

    /// Reduce stars; all stars above the average size when `stars` is `None`
    pub fn reduce_stars(&mut self, stars: Option<&[usize]>) -> Result<ReduceReport> {
        print_header("Reducing stars...");
        self.abort.reset();
        let stats = self.stats.as_ref().ok_or(StarError::NotAnalyzed)?;
        let luminance = self.luminance.as_deref().ok_or(StarError::NotAnalyzed)?;
        let selected: Vec<&Star> = match stars {
            Some(indexes) => indexes.iter().filter_map(|&i| self.catalog.get(i)).collect(),
            None => self
                .catalog
                .stars()
                .iter()
                .filter(|s| s.size() > stats.size.avg)
                .collect(),
        };

        let reducer = StarReducer::new(self.operators.as_ref(), &self.registry);
        let report = reducer.reduce(
            &selected,
            luminance,
            &mut self.view,
            &self.config.reduce,
            &self.abort,
            self.sink.as_ref(),
        )?;
        self.log.reduce_stars.extend(report.entries.iter().map(|(k, v)| (*k, *v)));
        Ok(report)
    }

    /// Plot `feature`; a feature without values gives a failed result
    pub fn plot(&mut self, feature: &str, grouped: Option<f64>, opts: &PlotOptions) -> Result<PlotResult> {
        let data = match PlotData::from_catalog(&mut self.catalog, feature, grouped) {
            Ok(data) => data,
            Err(e) => return Ok(PlotResult::failed(opts.image_path(feature), e.to_string())),
        };
        tracing::info!("Feature: {}", feature);
        Ok(self.plotter.plot(&data, opts))
    }

    /// Annotated RGB preview of the working image
    pub fn annotate(
        &self,
        opts: &AnnotateOptions,
        style_fn: Option<&dyn Fn(&Star, &mut AnnotationStyle)>,
    ) -> RgbImage {
        let stars: Vec<&Star> = self.catalog.stars().iter().collect();
        annotate_stars(self.view.image(), &stars, opts, style_fn)
    }

    /// Working image with every detected star removed
    pub fn undetected_stars(&self) -> Image {
        let stars: Vec<&Star> = self.catalog.stars().iter().collect();
        undetected_stars(self.view.image(), &stars, false)
    }

    pub fn log_json(&self) -> Result<String> {
        let doc = LogDocument {
            log: &self.log,
            stats: self.stats.as_ref(),
            stars: self.catalog.stars(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    pub fn save_log(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.log_json()?)?;
        tracing::info!("Log saved to: {}", path.display());
        Ok(())
    }

    /// Close the luminance image and any other open temporaries owned by
    /// the session
    pub fn close_temporaries(&mut self) {
        self.luminance = None;
        let open = self.registry.open_ids();
        if !open.is_empty() {
            tracing::warn!("Temporaries still open: {:?}", open);
        }
    }
}
