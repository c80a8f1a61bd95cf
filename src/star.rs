/// Star records and their PSF annotations
use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Rect};

/// Enlargement applied to stars that have not been classified yet
pub const UNCLASSIFIED_ENLARGEMENT: f64 = 1.2;

/// Default width interval of size classes
pub const DEFAULT_SIZE_CLASS_INTERVAL: f64 = 10.0;

/// Star candidate as returned by a detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawStar {
    pub pos: Point,
    /// Pixel-area measure
    pub size: f64,
    /// Integrated brightness
    pub flux: f64,
}

/// Size cohort of a classified star
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SizeBucket {
    Big,
    Average,
    Small,
}

impl SizeBucket {
    pub fn enlargement_factor(&self) -> f64 {
        match self {
            SizeBucket::Big => 2.0,
            SizeBucket::Average => 1.5,
            SizeBucket::Small => UNCLASSIFIED_ENLARGEMENT,
        }
    }
}

/// PSF model function reported by a fitter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PsfFunction {
    Gaussian,
    /// Moffat with the fitted beta
    Moffat,
    Moffat10,
    Moffat8,
    Moffat6,
    Moffat4,
    Moffat25,
    Moffat15,
    Lorentzian,
    VariableShape,
    Unknown,
}

/// FWHM / sigma for the fixed-beta Moffat functions: 2 * sqrt(2^(1/beta) - 1)
const MOFFAT_FWHM_FACTORS: [(PsfFunction, f64); 7] = [
    (PsfFunction::Moffat10, 0.5358),
    (PsfFunction::Moffat8, 0.6017),
    (PsfFunction::Moffat6, 0.6999),
    (PsfFunction::Moffat4, 0.8700),
    (PsfFunction::Moffat25, 1.1305),
    (PsfFunction::Moffat15, 1.5328),
    (PsfFunction::Lorentzian, 2.0),
];

const GAUSSIAN_FWHM_FACTOR: f64 = 2.3548;

impl PsfFunction {
    /// Closed-form FWHM for a sigma; 0 for unsupported functions
    pub fn fwhm(&self, sigma: f64, beta: f64) -> f64 {
        match self {
            PsfFunction::Gaussian => GAUSSIAN_FWHM_FACTOR * sigma,
            PsfFunction::Moffat => {
                if beta > 0.0 {
                    2.0 * sigma * (2.0f64.powf(1.0 / beta) - 1.0).sqrt()
                } else {
                    0.0
                }
            }
            PsfFunction::VariableShape => {
                if beta > 0.0 {
                    2.0 * sigma * (beta * std::f64::consts::LN_2).powf(1.0 / beta)
                } else {
                    0.0
                }
            }
            PsfFunction::Unknown => 0.0,
            fixed => MOFFAT_FWHM_FACTORS
                .iter()
                .find(|(f, _)| f == fixed)
                .map(|(_, k)| k * sigma)
                .unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PsfStatus {
    NotFitted,
    FittedOk,
    BadParameters,
    NoConvergence,
    Unknown,
}

/// Fitted PSF attached to a star
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Psf {
    pub func: PsfFunction,
    pub circular: bool,
    pub status: PsfStatus,
    /// Background
    #[serde(rename = "B")]
    pub b: f64,
    /// Amplitude
    #[serde(rename = "A")]
    pub a: f64,
    pub cx: f64,
    pub cy: f64,
    pub sx: f64,
    pub sy: f64,
    pub theta: f64,
    /// Unsigned rotation in degrees, usable as deconvolution angle
    pub angle: f64,
    pub beta: f64,
    #[serde(rename = "MAD")]
    pub mad: f64,
    pub flux: f64,
    pub mean_signal: f64,
    /// sy / sx: 1 for a round star, < 1 when elongated
    pub aspect_ratio: f64,
    #[serde(rename = "FWHMx")]
    pub fwhm_x: f64,
    #[serde(rename = "FWHMy")]
    pub fwhm_y: f64,
}

impl Psf {
    /// Numeric PSF field by name, as used in `psf.<field>` feature paths
    pub fn field(&self, name: &str) -> Option<f64> {
        let v = match name {
            "B" => self.b,
            "A" => self.a,
            "cx" => self.cx,
            "cy" => self.cy,
            "sx" => self.sx,
            "sy" => self.sy,
            "theta" => self.theta,
            "angle" => self.angle,
            "beta" => self.beta,
            "MAD" | "mad" => self.mad,
            "flux" => self.flux,
            "meanSignal" => self.mean_signal,
            "aspectRatio" => self.aspect_ratio,
            "FWHMx" => self.fwhm_x,
            "FWHMy" => self.fwhm_y,
            _ => return None,
        };
        Some(v)
    }

    /// Every numeric field, in a stable order
    pub fn numeric_fields(&self) -> [(&'static str, f64); 15] {
        [
            ("B", self.b),
            ("A", self.a),
            ("cx", self.cx),
            ("cy", self.cy),
            ("sx", self.sx),
            ("sy", self.sy),
            ("theta", self.theta),
            ("angle", self.angle),
            ("beta", self.beta),
            ("MAD", self.mad),
            ("flux", self.flux),
            ("meanSignal", self.mean_signal),
            ("aspectRatio", self.aspect_ratio),
            ("FWHMx", self.fwhm_x),
            ("FWHMy", self.fwhm_y),
        ]
    }
}

/// Detected point source.
///
/// `rect`, `enlarged_rect` and `size_class` are derived from the detector
/// measurements and only change through `set_classification`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Star {
    id: String,
    pos: Point,
    size: f64,
    flux: f64,
    width: f64,
    rect: Rect,
    enlarged_rect: Rect,
    size_class: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket: Option<SizeBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psf: Option<Psf>,
}

impl Star {
    /// Build star number `number` (1-based) from a detector measurement
    pub fn new(number: usize, raw: &RawStar, size_class_interval: f64) -> Self {
        let width = raw.size.max(0.0).sqrt();
        let interval = if size_class_interval > 0.0 {
            size_class_interval
        } else {
            DEFAULT_SIZE_CLASS_INTERVAL
        };
        Self {
            id: format!("s{}", number),
            pos: raw.pos,
            size: raw.size,
            flux: raw.flux,
            width,
            rect: Rect::centered_square(raw.pos, width),
            enlarged_rect: Rect::centered_square(raw.pos, width * UNCLASSIFIED_ENLARGEMENT),
            size_class: (width / interval).floor() * interval + interval,
            bucket: None,
            psf: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pos(&self) -> Point {
        self.pos
    }

    pub fn size(&self) -> f64 {
        self.size
    }

    pub fn flux(&self) -> f64 {
        self.flux
    }

    /// Side of the bounding square, sqrt(size)
    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn enlarged_rect(&self) -> Rect {
        self.enlarged_rect
    }

    pub fn size_class(&self) -> f64 {
        self.size_class
    }

    pub fn bucket(&self) -> Option<SizeBucket> {
        self.bucket
    }

    /// Record the cohort and recompute the enlarged rect
    pub fn set_classification(&mut self, bucket: SizeBucket) {
        self.bucket = Some(bucket);
        self.enlarged_rect =
            Rect::centered_square(self.pos, self.width * bucket.enlargement_factor());
    }

    /// Resolve a possibly dotted feature path (`width`, `psf.aspectRatio`).
    ///
    /// Returns `None` when the path is unknown, the nested object is
    /// missing, or the value is not a number.
    pub fn feature(&self, path: &str) -> Option<f64> {
        let value = match path.split_once('.') {
            None => match path {
                "size" => Some(self.size),
                "flux" => Some(self.flux),
                "width" => Some(self.width),
                "sizeClass" => Some(self.size_class),
                _ => None,
            },
            Some(("pos", axis)) => match axis {
                "x" => Some(self.pos.x),
                "y" => Some(self.pos.y),
                _ => None,
            },
            Some(("psf", field)) => self.psf.as_ref().and_then(|psf| psf.field(field)),
            Some(_) => None,
        };
        value.filter(|v| !v.is_nan())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_psf(sx: f64, sy: f64) -> Psf {
        Psf {
            func: PsfFunction::Gaussian,
            circular: false,
            status: PsfStatus::FittedOk,
            b: 0.01,
            a: 0.8,
            cx: 10.0,
            cy: 10.0,
            sx,
            sy,
            theta: 45.0,
            angle: 45.0,
            beta: 2.0,
            mad: 0.02,
            flux: 50.0,
            mean_signal: 0.4,
            aspect_ratio: sy / sx,
            fwhm_x: PsfFunction::Gaussian.fwhm(sx, 2.0),
            fwhm_y: PsfFunction::Gaussian.fwhm(sy, 2.0),
        }
    }

    fn raw(x: f64, y: f64, size: f64) -> RawStar {
        RawStar {
            pos: Point::new(x, y),
            size,
            flux: 12.0,
        }
    }

    #[test]
    fn test_derived_geometry() {
        let star = Star::new(3, &raw(50.0, 40.0, 36.0), 10.0);
        assert_eq!(star.id(), "s3");
        assert_eq!(star.width(), 6.0);
        assert_eq!(star.rect(), Rect::new(47.0, 37.0, 53.0, 43.0));
        assert!((star.enlarged_rect().width() - 7.2).abs() < 1e-12);
        assert_eq!(star.size_class(), 10.0);

        let big = Star::new(4, &raw(0.0, 0.0, 400.0), 10.0);
        assert_eq!(big.size_class(), 30.0);
    }

    #[test]
    fn test_classification_enlarges() {
        for bucket in [SizeBucket::Big, SizeBucket::Average, SizeBucket::Small] {
            let mut star = Star::new(1, &raw(10.0, 10.0, 25.0), 10.0);
            star.set_classification(bucket);
            assert_eq!(star.bucket(), Some(bucket));
            let expected = 5.0 * bucket.enlargement_factor();
            assert!((star.enlarged_rect().width() - expected).abs() < 1e-12);
            assert!(star.enlarged_rect().width() > star.rect().width());
            assert_eq!(star.enlarged_rect().center(), star.rect().center());
        }
    }

    #[test]
    fn test_feature_paths() {
        let mut star = Star::new(1, &raw(3.0, 4.0, 16.0), 10.0);
        assert_eq!(star.feature("width"), Some(4.0));
        assert_eq!(star.feature("pos.y"), Some(4.0));
        assert_eq!(star.feature("psf.aspectRatio"), None);
        assert_eq!(star.feature("nope"), None);
        assert_eq!(star.feature("pos.z"), None);

        star.psf = Some(sample_psf(4.0, 3.0));
        assert_eq!(star.feature("psf.aspectRatio"), Some(0.75));
        assert_eq!(star.feature("psf.sx"), Some(4.0));
        assert_eq!(star.feature("psf.unknown"), None);
    }

    #[test]
    fn test_fwhm_table() {
        assert!((PsfFunction::Gaussian.fwhm(2.0, 0.0) - 4.7096).abs() < 1e-9);
        assert!((PsfFunction::Moffat4.fwhm(1.0, 0.0) - 0.87).abs() < 1e-9);
        assert_eq!(PsfFunction::Lorentzian.fwhm(3.0, 0.0), 6.0);
        // Generic Moffat with beta 4 matches the tabulated constant
        assert!((PsfFunction::Moffat.fwhm(1.0, 4.0) - 0.87).abs() < 1e-3);
        // Variable shape with beta 2: 2 * sigma * sqrt(2 ln 2)
        let vs = PsfFunction::VariableShape.fwhm(1.0, 2.0);
        assert!((vs - 2.0 * (2.0 * std::f64::consts::LN_2).sqrt()).abs() < 1e-12);
        assert_eq!(PsfFunction::Unknown.fwhm(5.0, 2.0), 0.0);
    }

    #[test]
    fn test_psf_serialization_keys() {
        let json = serde_json::to_value(sample_psf(4.0, 2.0)).unwrap();
        assert_eq!(json["aspectRatio"], 0.5);
        assert!(json.get("FWHMx").is_some());
        assert!(json.get("B").is_some());
        assert_eq!(json["func"], "gaussian");
    }
}
