use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::classifier::{ThresholdConfig, ThresholdValue};
use crate::config::StarUtilsConfig;
use crate::geometry::Rect;

#[derive(Parser)]
#[command(name = "star-utils")]
#[command(about = "Star detection, PSF analysis and star fixing for astronomical images", long_about = None)]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging and detection statistics
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Detect and classify stars, print statistics
    Analyze {
        /// Image file (FITS, PNG, TIFF, JPEG)
        image: PathBuf,

        #[command(flatten)]
        options: AnalysisOptions,

        /// Write the JSON session log
        #[arg(long)]
        log: Option<PathBuf>,

        /// Write an annotated PNG preview
        #[arg(long)]
        annotate: Option<PathBuf>,

        /// Draw enlarged star rects in the preview
        #[arg(long, requires = "annotate")]
        enlarged: bool,

        /// Write the image with every detected star removed
        #[arg(long)]
        undetected: Option<PathBuf>,
    },

    /// Fix elongated stars and reduce big stars
    Fix {
        /// Image file (FITS, PNG, TIFF, JPEG)
        image: PathBuf,

        /// Output PNG
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        options: AnalysisOptions,

        /// Skip the elongation fix
        #[arg(long)]
        no_elongation: bool,

        /// Skip the star reduction
        #[arg(long)]
        no_reduction: bool,

        /// Aspect ratio below which a star is fixed
        #[arg(long)]
        threshold: Option<f64>,

        /// Morphological selection used to reduce stars (max 0.45)
        #[arg(long)]
        selection: Option<f64>,

        /// Commit the fix star by star instead of all at once
        #[arg(long)]
        no_atomic: bool,

        /// Write the combined mask of the fixed stars
        #[arg(long)]
        keep_mask: Option<PathBuf>,

        /// Write the JSON session log
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// Write star images or star masks per cohort and per filter
    Mask {
        /// Image file (FITS, PNG, TIFF, JPEG)
        image: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        #[command(flatten)]
        options: AnalysisOptions,

        /// Cohorts to write (big, average, small); all when omitted
        #[arg(long, value_delimiter = ',')]
        cohort: Vec<String>,

        /// Also run the filters from the configuration file
        #[arg(long)]
        filters: bool,

        /// Write star images instead of masks
        #[arg(long)]
        stars: bool,

        /// Mask dilation structure size (5, 7 or 9)
        #[arg(long, default_value = "5")]
        dilation: u32,
    },

    /// Plot the distribution of a star feature with gnuplot
    Plot {
        /// Image file (FITS, PNG, TIFF, JPEG)
        image: PathBuf,

        #[command(flatten)]
        options: AnalysisOptions,

        /// Feature to plot (size, flux, width, psf.aspectRatio, ...)
        #[arg(short, long, default_value = "size")]
        feature: String,

        /// Group values by this interval and plot counts
        #[arg(long)]
        grouped: Option<f64>,

        /// Draw a line at this fraction of the range (repeatable)
        #[arg(long)]
        percent: Vec<f64>,

        /// Output directory for data, script and image
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Print the effective configuration as JSON
    Config {
        #[command(flatten)]
        options: AnalysisOptions,
    },
}

/// Overrides of the configuration file shared by all commands
#[derive(Args, Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// Detection sensitivity (0-1)
    #[arg(long)]
    pub sensitivity: Option<f64>,

    /// Detection peak response (0-1)
    #[arg(long)]
    pub peak_response: Option<f64>,

    /// Stars with a peak above this value are ignored
    #[arg(long)]
    pub upper_peak_limit: Option<f64>,

    /// Maximum star distortion (0-1)
    #[arg(long)]
    pub max_distortion: Option<f64>,

    /// Number of detection structure layers
    #[arg(long)]
    pub structure_layers: Option<u32>,

    /// Only keep stars inside "x,y,width,height"
    #[arg(long, value_parser = parse_rect)]
    pub target_area: Option<Rect>,

    /// Which stars get a PSF: "none", a number, or "width=70%,flux=avg"
    #[arg(long, value_parser = parse_threshold)]
    pub psf_threshold: Option<ThresholdConfig>,

    /// PSF model of the built-in fitter (gaussian, moffat4, auto)
    #[arg(long)]
    pub psf_model: Option<String>,
}

impl AnalysisOptions {
    pub fn apply_to(&self, config: &mut StarUtilsConfig) {
        let detection = &mut config.detection;
        detection.sensitivity = self.sensitivity.or(detection.sensitivity);
        detection.peak_response = self.peak_response.or(detection.peak_response);
        detection.upper_peak_limit = self.upper_peak_limit.or(detection.upper_peak_limit);
        detection.max_distortion = self.max_distortion.or(detection.max_distortion);
        detection.structure_layers = self.structure_layers.or(detection.structure_layers);
        if let Some(area) = self.target_area {
            config.target_area = Some(area);
        }
        if let Some(threshold) = &self.psf_threshold {
            config.detect_psf_threshold = threshold.clone();
        }
        if let Some(model) = &self.psf_model {
            config.psf_model = model.clone();
        }
    }
}

fn parse_rect(s: &str) -> Result<Rect, String> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("'{}': {}", p, e)))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [x, y, w, h] if *w > 0.0 && *h > 0.0 => Ok(Rect::new(*x, *y, x + w, y + h)),
        _ => Err(format!("expected x,y,width,height with a positive size, got '{}'", s)),
    }
}

fn parse_threshold(s: &str) -> Result<ThresholdConfig, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("none") {
        return Ok(ThresholdConfig::None);
    }
    if let Ok(v) = s.parse::<f64>() {
        return Ok(ThresholdConfig::Uniform(v));
    }
    let mut keys = Vec::new();
    for pair in s.split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected feature=value, got '{}'", pair))?;
        keys.push((key.trim().to_string(), ThresholdValue::parse(value)));
    }
    Ok(ThresholdConfig::Keys(keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_threshold() {
        assert_eq!(parse_threshold("none").unwrap(), ThresholdConfig::None);
        assert_eq!(parse_threshold("0.4").unwrap(), ThresholdConfig::Uniform(0.4));
        assert_eq!(
            parse_threshold("width=70%, flux=avg").unwrap(),
            ThresholdConfig::Keys(vec![
                ("width".to_string(), ThresholdValue::Percent(0.7)),
                ("flux".to_string(), ThresholdValue::Statistic("avg".to_string())),
            ])
        );
        assert!(parse_threshold("width").is_err());
    }

    #[test]
    fn test_parse_rect() {
        assert_eq!(parse_rect("10,20,100,50").unwrap(), Rect::new(10.0, 20.0, 110.0, 70.0));
        assert!(parse_rect("10,20,0,50").is_err());
        assert!(parse_rect("10,20").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "star-utils",
            "fix",
            "m31.fits",
            "-o",
            "out.png",
            "--sensitivity",
            "0.7",
            "--psf-threshold",
            "none",
            "--no-reduction",
        ])
        .unwrap();
        let Commands::Fix {
            options, no_reduction, ..
        } = cli.command
        else {
            panic!("expected fix command");
        };
        assert!(no_reduction);

        let mut config = StarUtilsConfig::default();
        config.detection.peak_response = Some(0.3);
        options.apply_to(&mut config);
        assert_eq!(config.detection.sensitivity, Some(0.7));
        assert_eq!(config.detection.peak_response, Some(0.3));
        assert_eq!(config.detect_psf_threshold, ThresholdConfig::None);
    }
}
