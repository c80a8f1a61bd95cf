/// Session configuration, loaded from JSON and overridden from the CLI
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::classifier::{LimitConfig, ThresholdConfig};
use crate::detection::DetectionParams;
use crate::elongation::FixOptions;
use crate::error::Result;
use crate::filters::StarFilter;
use crate::geometry::Rect;
use crate::psf::PsfOptions;
use crate::psf_fitting::FitModel;
use crate::reduction::ReduceOptions;
use crate::star::DEFAULT_SIZE_CLASS_INTERVAL;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StarUtilsConfig {
    pub verbose: bool,
    /// Detector parameters, flattened (`sensitivity`, `peakResponse`, ...)
    #[serde(flatten)]
    pub detection: DetectionParams,
    pub size_class_interval: f64,
    /// Stars outside this rect are dropped after detection
    pub target_area: Option<Rect>,
    /// Which stars get a PSF fit
    pub detect_psf_threshold: ThresholdConfig,
    pub limits: LimitConfig,
    /// Flux floor for average-star images; the average flux when unset
    pub min_allowed_flux: Option<f64>,
    pub psf: PsfOptions,
    /// Model of the built-in PSF fitter (`gaussian`, `moffat4`, `auto`)
    pub psf_model: String,
    #[serde(rename = "fixElongation")]
    pub fix: FixOptions,
    #[serde(rename = "reduceStars")]
    pub reduce: ReduceOptions,
    pub filters: Vec<StarFilter>,
    /// gnuplot executable; `gnuplot` from PATH when unset
    pub gnuplot: Option<PathBuf>,
}

impl Default for StarUtilsConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            detection: DetectionParams::default(),
            size_class_interval: DEFAULT_SIZE_CLASS_INTERVAL,
            target_area: None,
            detect_psf_threshold: ThresholdConfig::default(),
            limits: LimitConfig::default(),
            min_allowed_flux: None,
            psf: PsfOptions::default(),
            psf_model: "auto".to_string(),
            fix: FixOptions::default(),
            reduce: ReduceOptions::default(),
            filters: Vec::new(),
            gnuplot: None,
        }
    }
}

impl StarUtilsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Built-in fitter model; unknown names fall back to `auto`
    pub fn fit_model(&self) -> FitModel {
        self.psf_model.parse().unwrap_or_else(|_| {
            tracing::warn!("Unknown PSF model '{}', using auto", self.psf_model);
            FitModel::Auto
        })
    }
}
