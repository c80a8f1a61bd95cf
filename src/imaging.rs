use anyhow::{Context, Result};
use fitrs::{Fits, FitsData, FitsDataArray};
use image::{DynamicImage, ImageBuffer, Luma, Rgb};
use std::path::Path;

use crate::geometry::PixelRect;

/// Floating point image, one plane per channel, samples normalized to [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: usize,
    height: usize,
    planes: Vec<Vec<f32>>,
}

impl Image {
    /// Black image with `channels` planes
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            planes: vec![vec![0.0; width * height]; channels.max(1)],
        }
    }

    pub fn from_mono(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        Self::from_planes(width, height, vec![data])
    }

    pub fn from_planes(width: usize, height: usize, planes: Vec<Vec<f32>>) -> Result<Self> {
        if planes.is_empty() {
            anyhow::bail!("Image needs at least one channel");
        }
        for plane in &planes {
            if plane.len() != width * height {
                anyhow::bail!(
                    "Data size mismatch: expected {} pixels, got {}",
                    width * height,
                    plane.len()
                );
            }
        }
        Ok(Self {
            width,
            height,
            planes,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.planes.len()
    }

    pub fn is_color(&self) -> bool {
        self.planes.len() >= 3
    }

    pub fn plane(&self, channel: usize) -> &[f32] {
        &self.planes[channel]
    }

    pub fn plane_mut(&mut self, channel: usize) -> &mut [f32] {
        &mut self.planes[channel]
    }

    pub fn planes_mut(&mut self) -> impl Iterator<Item = &mut Vec<f32>> {
        self.planes.iter_mut()
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, channel: usize) -> f32 {
        self.planes[channel][y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, channel: usize, value: f32) {
        self.planes[channel][y * self.width + x] = value;
    }

    /// Overwrite all samples with another image of identical geometry
    pub fn assign(&mut self, other: &Image) {
        self.width = other.width;
        self.height = other.height;
        self.planes = other.planes.clone();
    }

    /// Copy of the region `r` (all channels)
    pub fn crop(&self, r: &PixelRect) -> Image {
        let w = r.width();
        let h = r.height();
        let planes = self
            .planes
            .iter()
            .map(|plane| {
                let mut out = Vec::with_capacity(w * h);
                for y in r.y0..r.y1 {
                    let row = y * self.width;
                    out.extend_from_slice(&plane[row + r.x0..row + r.x1]);
                }
                out
            })
            .collect();
        Image {
            width: w,
            height: h,
            planes,
        }
    }

    /// Write `src` back with its top-left corner at (`x0`, `y0`)
    pub fn paste(&mut self, src: &Image, x0: usize, y0: usize) {
        let w = src.width.min(self.width.saturating_sub(x0));
        let h = src.height.min(self.height.saturating_sub(y0));
        for (dst, plane) in self.planes.iter_mut().zip(src.planes.iter()) {
            for y in 0..h {
                let d = (y0 + y) * self.width + x0;
                let s = y * src.width;
                dst[d..d + w].copy_from_slice(&plane[s..s + w]);
            }
        }
    }

    /// CIE L* lightness as a new monochrome image, normalized to [0, 1]
    pub fn luminance(&self) -> Image {
        if !self.is_color() {
            return Image {
                width: self.width,
                height: self.height,
                planes: vec![self.planes[0].clone()],
            };
        }
        let (r, g, b) = (&self.planes[0], &self.planes[1], &self.planes[2]);
        let data = (0..self.width * self.height)
            .map(|i| {
                let y = 0.2126 * r[i] + 0.7152 * g[i] + 0.0722 * b[i];
                cie_lightness(y.clamp(0.0, 1.0))
            })
            .collect();
        Image {
            width: self.width,
            height: self.height,
            planes: vec![data],
        }
    }

    /// Load a FITS, PNG, TIFF, ... image from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "fits" | "fit" | "fts" => Self::from_fits(path),
            _ => {
                let dynamic = image::open(path)
                    .with_context(|| format!("Failed to open image: {}", path.display()))?;
                Ok(Self::from_dynamic(&dynamic))
            }
        }
    }

    pub fn from_dynamic(dynamic: &DynamicImage) -> Self {
        let width = dynamic.width() as usize;
        let height = dynamic.height() as usize;
        if dynamic.color().has_color() {
            let rgb = dynamic.to_rgb32f();
            let mut planes = vec![Vec::with_capacity(width * height); 3];
            for pixel in rgb.pixels() {
                for (c, plane) in planes.iter_mut().enumerate() {
                    plane.push(pixel[c].clamp(0.0, 1.0));
                }
            }
            Image {
                width,
                height,
                planes,
            }
        } else {
            let luma = dynamic.to_luma32f();
            Image {
                width,
                height,
                planes: vec![luma.into_raw()],
            }
        }
    }

    /// Load FITS image data using fitrs (2D mono or 3-plane color cube)
    pub fn from_fits(path: &Path) -> Result<Self> {
        let fits = Fits::open(path)
            .with_context(|| format!("Failed to open FITS file: {}", path.display()))?;

        // Get the primary HDU (index 0)
        let hdu = fits
            .get(0)
            .ok_or_else(|| anyhow::anyhow!("No primary HDU found in FITS file"))?;

        let int_header = |key: &str| -> Result<Option<i64>> {
            match hdu.value(key) {
                Some(fitrs::HeaderValue::IntegerNumber(n)) => Ok(Some(*n as i64)),
                Some(_) => Err(anyhow::anyhow!("{} is not an integer", key)),
                None => Ok(None),
            }
        };

        let naxis = int_header("NAXIS")?.ok_or_else(|| anyhow::anyhow!("Missing NAXIS header"))?;
        if naxis < 2 {
            anyhow::bail!("FITS file does not contain 2D image data (NAXIS={})", naxis);
        }
        let width = int_header("NAXIS1")?
            .ok_or_else(|| anyhow::anyhow!("Missing NAXIS1 header"))? as usize;
        let height = int_header("NAXIS2")?
            .ok_or_else(|| anyhow::anyhow!("Missing NAXIS2 header"))? as usize;
        let depth = if naxis >= 3 {
            int_header("NAXIS3")?.unwrap_or(1).max(1) as usize
        } else {
            1
        };

        let samples: Vec<f32> = match hdu.read_data() {
            FitsData::Characters(_) => {
                anyhow::bail!("FITS file contains character data, not image data");
            }
            FitsData::IntegersI32(FitsDataArray { data, .. }) => data
                .into_iter()
                // Signed 16-bit storage with BZERO=32768
                .map(|x| x.map(|v| (v + 32768).clamp(0, 65535) as f32 / 65535.0).unwrap_or(0.0))
                .collect(),
            FitsData::IntegersU32(FitsDataArray { data, .. }) => data
                .into_iter()
                .map(|x| x.map(|v| v.min(65535) as f32 / 65535.0).unwrap_or(0.0))
                .collect(),
            FitsData::FloatingPoint32(FitsDataArray { data, .. }) => normalize_floats(data),
            FitsData::FloatingPoint64(FitsDataArray { data, .. }) => {
                normalize_floats(data.into_iter().map(|v| v as f32).collect())
            }
        };

        let plane_len = width * height;
        if samples.len() < plane_len * depth {
            anyhow::bail!(
                "Data size mismatch: expected {} pixels, got {}",
                plane_len * depth,
                samples.len()
            );
        }
        let channels = if depth >= 3 { 3 } else { 1 };
        let planes = (0..channels)
            .map(|c| samples[c * plane_len..(c + 1) * plane_len].to_vec())
            .collect();
        Image::from_planes(width, height, planes)
    }

    /// Save as 16-bit PNG (mono or RGB)
    pub fn save_png(&self, path: &Path) -> Result<()> {
        let to_u16 = |v: f32| (v.clamp(0.0, 1.0) * 65535.0).round() as u16;
        let (w, h) = (self.width as u32, self.height as u32);
        let dynamic = if self.is_color() {
            let mut raw = Vec::with_capacity(self.width * self.height * 3);
            for i in 0..self.width * self.height {
                for c in 0..3 {
                    raw.push(to_u16(self.planes[c][i]));
                }
            }
            let buffer = ImageBuffer::<Rgb<u16>, Vec<u16>>::from_raw(w, h, raw)
                .ok_or_else(|| anyhow::anyhow!("Invalid RGB buffer size"))?;
            DynamicImage::ImageRgb16(buffer)
        } else {
            let raw = self.planes[0].iter().map(|&v| to_u16(v)).collect();
            let buffer = ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(w, h, raw)
                .ok_or_else(|| anyhow::anyhow!("Invalid mono buffer size"))?;
            DynamicImage::ImageLuma16(buffer)
        };
        dynamic
            .save(path)
            .with_context(|| format!("Failed to write PNG image to {}", path.display()))
    }
}

/// CIE L* for relative luminance `y`, rescaled from [0, 100] to [0, 1]
fn cie_lightness(y: f32) -> f32 {
    const EPSILON: f32 = 216.0 / 24389.0;
    const KAPPA: f32 = 24389.0 / 27.0;
    let l = if y > EPSILON {
        116.0 * y.cbrt() - 16.0
    } else {
        KAPPA * y
    };
    (l / 100.0).clamp(0.0, 1.0)
}

fn normalize_floats(mut data: Vec<f32>) -> Vec<f32> {
    let max = data.iter().cloned().fold(0.0f32, f32::max);
    // Data already in [0, 1] is kept as is, otherwise assume a 16-bit range
    let scale = if max <= 1.0 { 1.0 } else { 65535.0f32.max(max) };
    for v in data.iter_mut() {
        *v = (*v / scale).clamp(0.0, 1.0);
    }
    data
}
