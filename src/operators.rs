/// Image operator seam: parameter types, structuring elements and the
/// `ImageOperators` trait
use serde::Serialize;

use crate::error::StarError;
use crate::imaging::Image;

/// Parametric convolution (shape 2 is a Gaussian)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvolutionParams {
    pub sigma: f64,
    pub shape: f64,
    pub aspect_ratio: f64,
    pub rotation: f64,
}

impl ConvolutionParams {
    pub fn gaussian(sigma: f64) -> Self {
        Self {
            sigma,
            shape: 2.0,
            aspect_ratio: 1.0,
            rotation: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum DeconvolutionPsf {
    Parametric { sigma: f64, shape: f64, aspect_ratio: f64 },
    MotionBlur { length: f64, angle: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeconvolutionParams {
    pub psf: DeconvolutionPsf,
    pub iterations: u32,
    pub deringing: bool,
    pub deringing_dark: f64,
}

impl DeconvolutionParams {
    pub const DEFAULT_ITERATIONS: u32 = 10;

    pub fn parametric(sigma: f64, deringing: bool, deringing_dark: f64) -> Self {
        Self {
            psf: DeconvolutionPsf::Parametric {
                sigma,
                shape: 2.0,
                aspect_ratio: 1.0,
            },
            iterations: Self::DEFAULT_ITERATIONS,
            deringing,
            deringing_dark,
        }
    }

    pub fn motion_blur(length: f64, angle: f64) -> Self {
        Self {
            psf: DeconvolutionPsf::MotionBlur { length, angle },
            iterations: Self::DEFAULT_ITERATIONS,
            deringing: false,
            deringing_dark: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MorphologicalOp {
    Erosion,
    Dilation,
    /// Rank selection, 0 = erosion, 0.5 = median, 1 = dilation
    Selection(f64),
}

/// Circular structuring element sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum StructureSize {
    Five,
    Seven,
    Nine,
}

const STRUCTURE_5: [&str; 5] = [
    ".###.",
    "#####",
    "#####",
    "#####",
    ".###.",
];

const STRUCTURE_7: [&str; 7] = [
    "..###..",
    ".#####.",
    "#######",
    "#######",
    "#######",
    ".#####.",
    "..###..",
];

const STRUCTURE_9: [&str; 9] = [
    "...###...",
    ".#######.",
    ".#######.",
    "#########",
    "#########",
    "#########",
    ".#######.",
    ".#######.",
    "...###...",
];

impl StructureSize {
    pub const ALL: [StructureSize; 3] = [StructureSize::Five, StructureSize::Seven, StructureSize::Nine];

    pub fn size(&self) -> u32 {
        match self {
            StructureSize::Five => 5,
            StructureSize::Seven => 7,
            StructureSize::Nine => 9,
        }
    }

    pub fn max() -> Self {
        StructureSize::Nine
    }

    /// Bitmask rows of the element
    pub fn rows(&self) -> &'static [&'static str] {
        match self {
            StructureSize::Five => &STRUCTURE_5,
            StructureSize::Seven => &STRUCTURE_7,
            StructureSize::Nine => &STRUCTURE_9,
        }
    }

    /// Offsets `(dx, dy)` of the active cells
    pub fn offsets(&self) -> Vec<(i64, i64)> {
        let half = (self.size() / 2) as i64;
        self.rows()
            .iter()
            .enumerate()
            .flat_map(|(y, row)| {
                row.bytes()
                    .enumerate()
                    .filter(|(_, b)| *b == b'#')
                    .map(move |(x, _)| (x as i64 - half, y as i64 - half))
            })
            .collect()
    }

    /// Element for a star of width `w`: 9 from 9, 7 from 7, else 5
    pub fn for_width(width: f64) -> Self {
        if width >= 9.0 {
            StructureSize::Nine
        } else if width >= 7.0 {
            StructureSize::Seven
        } else {
            StructureSize::Five
        }
    }
}

impl TryFrom<u32> for StructureSize {
    type Error = StarError;

    fn try_from(size: u32) -> Result<Self, Self::Error> {
        match size {
            5 => Ok(StructureSize::Five),
            7 => Ok(StructureSize::Seven),
            9 => Ok(StructureSize::Nine),
            other => Err(StarError::InvalidStructureSize(other)),
        }
    }
}

/// Host image operators, applied in place
pub trait ImageOperators {
    fn convolve(&self, image: &mut Image, params: &ConvolutionParams) -> anyhow::Result<()>;

    fn deconvolve(&self, image: &mut Image, params: &DeconvolutionParams) -> anyhow::Result<()>;

    fn morphological_transform(
        &self,
        image: &mut Image,
        op: MorphologicalOp,
        structure: StructureSize,
    ) -> anyhow::Result<()>;

    /// 1 where the sample is above `threshold`, else 0
    fn binarize(&self, image: &mut Image, threshold: f64) -> anyhow::Result<()>;
}
