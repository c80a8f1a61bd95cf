/// PSF estimation on top of an external PSF fitter
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, StarError};
use crate::geometry::{Point, Rect};
use crate::imaging::Image;
use crate::star::{Psf, PsfFunction, PsfStatus, Star};

/// Hard ceiling of the fitter search radius
pub const MAX_SEARCH_RADIUS: f64 = 127.0;

/// FWHMx / width at which a fit is taken for a double-star misfit
pub const DOUBLE_STAR_RATIO: f64 = 1.75;

/// One row of fitter output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsfRow {
    pub func: PsfFunction,
    pub circular: bool,
    pub status: PsfStatus,
    #[serde(rename = "B")]
    pub b: f64,
    #[serde(rename = "A")]
    pub a: f64,
    pub cx: f64,
    pub cy: f64,
    pub sx: f64,
    pub sy: f64,
    /// Rotation in degrees
    pub theta: f64,
    pub beta: f64,
    pub mad: f64,
    pub flux: f64,
    pub mean_signal: f64,
}

impl PsfRow {
    pub fn fwhm_x(&self) -> f64 {
        self.func.fwhm(self.sx, self.beta)
    }

    /// Complete the row with derived geometry
    pub fn into_psf(self) -> Psf {
        let aspect_ratio = if self.sx > 0.0 { self.sy / self.sx } else { 0.0 };
        Psf {
            func: self.func,
            circular: self.circular,
            status: self.status,
            b: self.b,
            a: self.a,
            cx: self.cx,
            cy: self.cy,
            sx: self.sx,
            sy: self.sy,
            theta: self.theta,
            angle: self.theta.rem_euclid(180.0),
            beta: self.beta,
            mad: self.mad,
            flux: self.flux,
            mean_signal: self.mean_signal,
            aspect_ratio,
            fwhm_x: self.func.fwhm(self.sx, self.beta),
            fwhm_y: self.func.fwhm(self.sy, self.beta),
        }
    }
}

/// Parameters of one fitter invocation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitRequest {
    pub search_rect: Rect,
    pub centroid: Point,
    pub search_radius: f64,
    pub auto_aperture: bool,
}

/// External PSF fitter. An empty result means "no fit found".
pub trait PsfFitter {
    fn fit(&self, luminance: &Image, request: &FitRequest) -> anyhow::Result<Vec<PsfRow>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsfOptions {
    pub auto_aperture: bool,
}

impl Default for PsfOptions {
    fn default() -> Self {
        Self {
            auto_aperture: true,
        }
    }
}

pub struct PsfEstimator<'a> {
    fitter: &'a dyn PsfFitter,
}

impl<'a> PsfEstimator<'a> {
    pub fn new(fitter: &'a dyn PsfFitter) -> Self {
        Self { fitter }
    }

    /// Fitter request for a star: its rect grown by half its width on
    /// each side, radius `min(2 * search width, 127)`
    pub fn request_for(star: &Star, auto_aperture: bool) -> FitRequest {
        let search_rect = star.rect().inflated(star.width() / 2.0);
        FitRequest {
            search_rect,
            centroid: star.pos(),
            search_radius: (2.0 * search_rect.width()).min(MAX_SEARCH_RADIUS),
            auto_aperture,
        }
    }

    /// Fit a PSF for `star`. `Ok(None)` when the fitter finds nothing.
    pub fn estimate(&self, star: &Star, luminance: &Image, opts: &PsfOptions) -> Result<Option<Psf>> {
        let first = self.fit_first(star, luminance, opts.auto_aperture)?;
        let row = match first {
            Some(row) if row.fwhm_x() > 0.0 && row.fwhm_x() / star.width() >= DOUBLE_STAR_RATIO => {
                tracing::debug!(
                    "Star {}: FWHMx {:.2} vs width {:.2}, probable double star, refitting without auto aperture",
                    star.id(),
                    row.fwhm_x(),
                    star.width()
                );
                self.fit_first(star, luminance, false)?
            }
            other => other,
        };

        match row {
            Some(row) => Ok(Some(row.into_psf())),
            None => {
                tracing::warn!("No PSF found for star {}", star.id());
                Ok(None)
            }
        }
    }

    fn fit_first(&self, star: &Star, luminance: &Image, auto_aperture: bool) -> Result<Option<PsfRow>> {
        let request = Self::request_for(star, auto_aperture);
        let rows = self
            .fitter
            .fit(luminance, &request)
            .map_err(|e| StarError::PsfFitFailed {
                star: star.id().to_string(),
                reason: format!("{:#}", e),
            })?;
        Ok(rows.into_iter().next())
    }
}

/// Per-field PSF values collected across stars
#[derive(Debug, Clone, Default)]
pub struct PsfAccumulator {
    values: BTreeMap<String, Vec<f64>>,
    count: usize,
}

impl PsfAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, psf: &Psf) {
        for (field, value) in psf.numeric_fields() {
            if value.is_finite() {
                self.values.entry(field.to_string()).or_default().push(value);
            }
        }
        self.count += 1;
    }

    pub fn values(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.values
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.count = 0;
    }
}
