/// PSF (Point Spread Function) fitting module
/// Implements elliptical Gaussian and Moffat PSF models with Levenberg-Marquardt fitting
use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

use crate::imaging::Image;
use crate::psf::{FitRequest, PsfFitter, PsfRow};
use crate::star::{PsfFunction, PsfStatus};

/// Model selection of the built-in fitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitModel {
    Gaussian,
    /// Moffat PSF with beta=4.0
    Moffat4,
    /// Fit both and keep the better R-squared
    Auto,
}

impl std::str::FromStr for FitModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gaussian" => Ok(FitModel::Gaussian),
            "moffat" | "moffat4" | "moffat_4" => Ok(FitModel::Moffat4),
            "auto" => Ok(FitModel::Auto),
            _ => Err(format!("Unknown PSF model: {}", s)),
        }
    }
}

/// Trait for PSF models
trait PsfModel {
    /// Evaluate PSF at given position with parameters
    /// parameters: [A, B, x0, y0, sigma_x, sigma_y, theta]
    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64;

    /// Calculate gradient (Jacobian) of PSF with respect to parameters
    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]);

    fn function(&self) -> PsfFunction;

    fn beta(&self) -> f64;

    /// Integrated flux of the fitted profile
    fn flux(&self, params: &[f64]) -> f64;
}

/// Rotate an offset into the PSF frame
fn rotated(x: f64, y: f64, params: &[f64]) -> (f64, f64, f64, f64) {
    let theta = params[6];
    let cos_t = theta.cos();
    let sin_t = theta.sin();
    let dx = x - params[2];
    let dy = y - params[3];
    (dx * cos_t + dy * sin_t, -dx * sin_t + dy * cos_t, cos_t, sin_t)
}

struct GaussianPsf;

impl PsfModel for GaussianPsf {
    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        let (xp, yp, _, _) = rotated(x, y, params);
        let (sx, sy) = (params[4], params[5]);
        let arg = -(xp * xp / (2.0 * sx * sx) + yp * yp / (2.0 * sy * sy));
        params[1] + params[0] * arg.exp()
    }

    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]) {
        let a = params[0];
        let sigma_x = params[4];
        let sigma_y = params[5];
        let (xp, yp, cos_t, sin_t) = rotated(x, y, params);

        let sx2 = sigma_x * sigma_x;
        let sy2 = sigma_y * sigma_y;
        let exp_arg = (-(xp * xp / (2.0 * sx2) + yp * yp / (2.0 * sy2))).exp();

        grad[0] = exp_arg;
        grad[1] = 1.0;
        grad[2] = a * exp_arg * (xp * cos_t / sx2 - yp * sin_t / sy2);
        grad[3] = a * exp_arg * (xp * sin_t / sx2 + yp * cos_t / sy2);
        grad[4] = a * exp_arg * xp * xp / (sx2 * sigma_x);
        grad[5] = a * exp_arg * yp * yp / (sy2 * sigma_y);
        grad[6] = -a * exp_arg * xp * yp * (1.0 / sx2 - 1.0 / sy2);
    }

    fn function(&self) -> PsfFunction {
        PsfFunction::Gaussian
    }

    fn beta(&self) -> f64 {
        2.0
    }

    fn flux(&self, params: &[f64]) -> f64 {
        2.0 * PI * params[0] * params[4].abs() * params[5].abs()
    }
}

struct Moffat4Psf;

const MOFFAT_BETA: f64 = 4.0;

impl PsfModel for Moffat4Psf {
    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        let (xp, yp, _, _) = rotated(x, y, params);
        let (u, v) = (params[4], params[5]);
        let d = 1.0 + (xp * xp) / (u * u) + (yp * yp) / (v * v);
        params[1] + params[0] / d.powi(4)
    }

    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]) {
        let a = params[0];
        let u = params[4];
        let v = params[5];
        let (xp, yp, cos_t, sin_t) = rotated(x, y, params);

        let u2 = u * u;
        let v2 = v * v;
        let xp2 = xp * xp;
        let yp2 = yp * yp;
        let d = 1.0 + xp2 / u2 + yp2 / v2;
        let beta = MOFFAT_BETA;

        grad[0] = d.powf(-beta);
        grad[1] = 1.0;

        let factor = -a * beta * d.powf(-beta - 1.0);
        grad[2] = factor * ((2.0 * sin_t * yp / v2) - (2.0 * cos_t * xp / u2));
        grad[3] = factor * ((-2.0 * sin_t * xp / u2) - (2.0 * cos_t * yp / v2));
        grad[4] = (2.0 * a * beta / (u2 * u)) * xp2 * d.powf(-beta - 1.0);
        grad[5] = (2.0 * a * beta / (v2 * v)) * yp2 * d.powf(-beta - 1.0);
        grad[6] = factor * (2.0 * yp * xp * (1.0 / u2 - 1.0 / v2));
    }

    fn function(&self) -> PsfFunction {
        PsfFunction::Moffat4
    }

    fn beta(&self) -> f64 {
        MOFFAT_BETA
    }

    fn flux(&self, params: &[f64]) -> f64 {
        PI * params[0] * params[4].abs() * params[5].abs() / (MOFFAT_BETA - 1.0)
    }
}

/// Simple Levenberg-Marquardt optimizer for PSF fitting
struct LevenbergMarquardt {
    max_iterations: usize,
    tolerance: f64,
    lambda: f64,
    lambda_factor: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-10,
            lambda: 0.01,
            lambda_factor: 10.0,
        }
    }
}

/// Optimizer result
struct Solution {
    params: Vec<f64>,
    converged: bool,
}

impl LevenbergMarquardt {
    fn squared_error(psf: &dyn PsfModel, samples: &Samples, params: &[f64]) -> f64 {
        samples
            .positions
            .iter()
            .zip(samples.values.iter())
            .map(|((x, y), observed)| (observed - psf.value(*x, *y, params)).powi(2))
            .sum()
    }

    fn fit(
        &mut self,
        psf: &dyn PsfModel,
        samples: &Samples,
        initial_params: &[f64],
        lower_bounds: &[f64],
        upper_bounds: &[f64],
    ) -> anyhow::Result<Solution> {
        let n_params = initial_params.len();
        let n_points = samples.positions.len();
        if n_points < n_params {
            anyhow::bail!("Not enough data points for fitting ({} < {})", n_points, n_params);
        }

        let mut params = initial_params.to_vec();
        let mut jacobian = DMatrix::<f64>::zeros(n_points, n_params);
        let mut residuals = DVector::<f64>::zeros(n_points);
        let mut gradient = vec![0.0; n_params];

        for _iter in 0..self.max_iterations {
            let mut current_error = 0.0;
            for (i, ((x, y), observed)) in samples
                .positions
                .iter()
                .zip(samples.values.iter())
                .enumerate()
            {
                let residual = observed - psf.value(*x, *y, &params);
                residuals[i] = residual;
                current_error += residual * residual;

                psf.gradient(*x, *y, &params, &mut gradient);
                for (j, &grad) in gradient.iter().enumerate() {
                    jacobian[(i, j)] = grad;
                }
            }

            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let jtr = &jt * &residuals;

            loop {
                let mut h = jtj.clone();
                for i in 0..n_params {
                    h[(i, i)] += self.lambda * (1.0 + jtj[(i, i)]);
                }

                if let Some(delta) = h.lu().solve(&jtr) {
                    let new_params: Vec<f64> = (0..n_params)
                        .map(|i| (params[i] + delta[i]).clamp(lower_bounds[i], upper_bounds[i]))
                        .collect();
                    let new_error = Self::squared_error(psf, samples, &new_params);

                    if new_error < current_error {
                        let improvement = current_error - new_error;
                        params = new_params;
                        self.lambda /= self.lambda_factor;
                        if improvement < self.tolerance * current_error.max(self.tolerance) {
                            return Ok(Solution {
                                params,
                                converged: true,
                            });
                        }
                        break;
                    }
                }
                // Rejected step or singular matrix: increase damping
                self.lambda *= self.lambda_factor;
                if self.lambda > 1e10 {
                    // No further progress possible from here
                    return Ok(Solution {
                        params,
                        converged: true,
                    });
                }
            }
        }

        Ok(Solution {
            params,
            converged: false,
        })
    }
}

/// Pixel samples relative to the centroid guess
struct Samples {
    positions: Vec<(f64, f64)>,
    values: Vec<f64>,
}

impl Samples {
    /// Pixels of `image` inside the request aperture.
    ///
    /// With `auto_aperture` the whole search rect is used (limited to
    /// the search radius); without it only the inner half, which keeps
    /// a close companion out of the fit.
    fn extract(image: &Image, request: &FitRequest) -> Option<Self> {
        let rect = if request.auto_aperture {
            request.search_rect
        } else {
            request
                .search_rect
                .inflated(-request.search_rect.width() / 4.0)
        };
        let bounds = rect.pixel_bounds(image.width(), image.height())?;
        let radius = request.search_radius;
        let (cx, cy) = (request.centroid.x, request.centroid.y);

        let mut positions = Vec::new();
        let mut values = Vec::new();
        for y in bounds.y0..bounds.y1 {
            for x in bounds.x0..bounds.x1 {
                let dx = x as f64 + 0.5 - cx;
                let dy = y as f64 + 0.5 - cy;
                if dx.abs() > radius || dy.abs() > radius {
                    continue;
                }
                positions.push((dx, dy));
                values.push(image.get(x, y, 0) as f64);
            }
        }
        Some(Self { positions, values })
    }
}

/// Fitted model with its goodness of fit
struct FitResult {
    row: PsfRow,
    r_squared: f64,
}

/// Levenberg-Marquardt fitter working on the luminance plane
#[derive(Debug, Clone, Copy)]
pub struct LmPsfFitter {
    model: FitModel,
    /// Fits below this R-squared are reported as "no fit"
    min_r_squared: f64,
}

impl Default for LmPsfFitter {
    fn default() -> Self {
        Self::new(FitModel::Auto)
    }
}

impl LmPsfFitter {
    pub fn new(model: FitModel) -> Self {
        Self {
            model,
            min_r_squared: 0.3,
        }
    }

    fn fit_model(&self, psf: &dyn PsfModel, samples: &Samples, request: &FitRequest) -> anyhow::Result<Option<FitResult>> {
        if samples.values.len() < 10 {
            return Ok(None);
        }

        let background = samples.values.iter().cloned().fold(f64::MAX, f64::min);
        let peak = samples.values.iter().cloned().fold(f64::MIN, f64::max);
        if peak <= background {
            return Ok(None);
        }

        // The search rect is twice the star width
        let star_width = (request.search_rect.width() / 2.0).max(1.0);
        let offset_limit = star_width / 2.0;
        let sigma_max = request.search_rect.width().max(1.0);

        // Initial parameters: [A, B, x0, y0, sigma_x, sigma_y, theta]
        let initial_params = [
            peak - background,
            background,
            0.0,
            0.0,
            star_width / 3.0,
            star_width / 3.0,
            0.0,
        ];
        let lower_bounds = [0.0, 0.0, -offset_limit, -offset_limit, 0.1, 0.1, -PI];
        let upper_bounds = [
            2.0 * (peak - background),
            peak,
            offset_limit,
            offset_limit,
            sigma_max,
            sigma_max,
            PI,
        ];

        let mut optimizer = LevenbergMarquardt::default();
        let solution = optimizer.fit(psf, samples, &initial_params, &lower_bounds, &upper_bounds)?;
        let p = &solution.params;

        let n = samples.values.len() as f64;
        let mean_value = samples.values.iter().sum::<f64>() / n;
        let mut residuals: Vec<f64> = Vec::with_capacity(samples.values.len());
        let mut sum_squared_total = 0.0;
        for ((x, y), observed) in samples.positions.iter().zip(samples.values.iter()) {
            residuals.push((observed - psf.value(*x, *y, p)).abs());
            sum_squared_total += (observed - mean_value).powi(2);
        }
        let sum_squared_residuals: f64 = residuals.iter().map(|r| r * r).sum();
        let r_squared = if sum_squared_total > 0.0 {
            1.0 - sum_squared_residuals / sum_squared_total
        } else {
            0.0
        };
        if r_squared < self.min_r_squared {
            tracing::debug!("Rejecting {:?} fit with R² {:.3}", psf.function(), r_squared);
            return Ok(None);
        }

        residuals.sort_by(|a, b| a.total_cmp(b));
        let mad = residuals[residuals.len() / 2];

        // Report sx >= sy, with the rotation of the major axis
        let (mut sx, mut sy, mut theta) = (p[4].abs(), p[5].abs(), p[6].to_degrees());
        if sx < sy {
            std::mem::swap(&mut sx, &mut sy);
            theta += 90.0;
        }
        let theta = theta.rem_euclid(180.0);
        let mean_signal = samples
            .values
            .iter()
            .map(|v| (v - p[1]).max(0.0))
            .sum::<f64>()
            / n;

        Ok(Some(FitResult {
            row: PsfRow {
                func: psf.function(),
                circular: false,
                status: if solution.converged {
                    PsfStatus::FittedOk
                } else {
                    PsfStatus::NoConvergence
                },
                b: p[1],
                a: p[0],
                cx: request.centroid.x + p[2],
                cy: request.centroid.y + p[3],
                sx,
                sy,
                theta,
                beta: psf.beta(),
                mad,
                flux: psf.flux(p),
                mean_signal,
            },
            r_squared,
        }))
    }
}

impl PsfFitter for LmPsfFitter {
    fn fit(&self, luminance: &Image, request: &FitRequest) -> anyhow::Result<Vec<PsfRow>> {
        let samples = match Samples::extract(luminance, request) {
            Some(samples) => samples,
            None => return Ok(Vec::new()),
        };

        let mut results = Vec::new();
        if matches!(self.model, FitModel::Gaussian | FitModel::Auto) {
            results.extend(self.fit_model(&GaussianPsf, &samples, request)?);
        }
        if matches!(self.model, FitModel::Moffat4 | FitModel::Auto) {
            results.extend(self.fit_model(&Moffat4Psf, &samples, request)?);
        }
        results.sort_by(|a, b| b.r_squared.total_cmp(&a.r_squared));
        Ok(results.into_iter().map(|r| r.row).collect())
    }
}
