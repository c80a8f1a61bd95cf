/// Star images and star masks
use serde::Serialize;

use crate::error::Result;
use crate::geometry::PixelRect;
use crate::imaging::Image;
use crate::operators::{ConvolutionParams, ImageOperators, MorphologicalOp, StructureSize};
use crate::resources::{TempRegistry, Temporary};
use crate::star::Star;
use crate::view::{MaskImage, View};

pub const DEFAULT_BINARIZE_THRESHOLD: f64 = 0.1;
pub const DEFAULT_MASK_CONVOLUTION: f64 = 2.0;

/// Mask post-processing
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskOptions {
    /// Binarization threshold
    pub binarize: Option<f64>,
    /// Dilation structuring element size (5, 7 or 9)
    pub dilation: Option<u32>,
    /// Gaussian convolution sigma
    pub convolution: Option<f64>,
    /// Draw enlarged rects instead of plain rects
    pub enlarged: bool,
    /// Skip stars with a lower flux
    pub min_flux: Option<f64>,
}

impl Default for MaskOptions {
    fn default() -> Self {
        Self {
            binarize: Some(DEFAULT_BINARIZE_THRESHOLD),
            dilation: Some(5),
            convolution: Some(DEFAULT_MASK_CONVOLUTION),
            enlarged: true,
            min_flux: None,
        }
    }
}

impl MaskOptions {
    /// Extra pixels around the star rects touched by the post-processing
    fn margin(&self) -> usize {
        let dilation = self.dilation.map_or(0, |d| d as usize / 2);
        let convolution = self
            .convolution
            .map_or(0, |s| (3.0 * s.max(0.0)).ceil() as usize);
        dilation + convolution + 1
    }
}

/// Region covered by the stars' rects, clipped to the image
fn stars_region(stars: &[&Star], enlarged: bool, width: usize, height: usize) -> Option<PixelRect> {
    stars
        .iter()
        .filter_map(|s| {
            let r = if enlarged { s.enlarged_rect() } else { s.rect() };
            r.pixel_bounds(width, height)
        })
        .reduce(|a, b| a.union(&b))
}

/// Add the source pixels under each star rect onto a black image of the
/// same geometry. Overlapping rects accumulate.
pub fn draw_stars(source: &Image, stars: &[&Star], enlarged: bool, min_flux: Option<f64>) -> Image {
    let mut out = Image::new(source.width(), source.height(), source.channels());
    for star in stars {
        if let Some(min) = min_flux {
            if star.flux() < min {
                tracing::warn!("Star {}: flux {:.4} less than {:.4}", star.id(), star.flux(), min);
                continue;
            }
        }
        let r = if enlarged { star.enlarged_rect() } else { star.rect() };
        let Some(b) = r.pixel_bounds(source.width(), source.height()) else {
            continue;
        };
        for c in 0..source.channels() {
            for y in b.y0..b.y1 {
                for x in b.x0..b.x1 {
                    let v = out.get(x, y, c) + source.get(x, y, c);
                    out.set(x, y, c, v);
                }
            }
        }
    }
    out
}

pub struct MaskBuilder<'a> {
    operators: &'a dyn ImageOperators,
    registry: &'a TempRegistry,
}

impl<'a> MaskBuilder<'a> {
    pub fn new(operators: &'a dyn ImageOperators, registry: &'a TempRegistry) -> Self {
        Self {
            operators,
            registry,
        }
    }

    /// Build a mask for `stars` from the luminance image.
    ///
    /// Returns `Ok(None)` with a warning when `stars` is empty. The mask
    /// only stores the region around the stars, everything else is 0.
    pub fn build_mask(
        &self,
        luminance: &Image,
        stars: &[&Star],
        opts: &MaskOptions,
        name: &str,
    ) -> Result<Option<Temporary<MaskImage>>> {
        if stars.is_empty() {
            tracing::warn!("No stars for mask {}", name);
            return Ok(None);
        }
        let dilation = opts.dilation.map(StructureSize::try_from).transpose()?;

        let (w, h) = (luminance.width(), luminance.height());
        let Some(region) = stars_region(stars, opts.enlarged, w, h) else {
            tracing::warn!("Stars for mask {} lie outside the image", name);
            return Ok(None);
        };
        let region = region.expanded(opts.margin(), w, h);

        let mut local = Image::new(region.width(), region.height(), 1);
        for star in stars {
            if let Some(min) = opts.min_flux {
                if star.flux() < min {
                    tracing::warn!("Star {}: flux {:.4} less than {:.4}", star.id(), star.flux(), min);
                    continue;
                }
            }
            let r = if opts.enlarged { star.enlarged_rect() } else { star.rect() };
            let Some(b) = r.pixel_bounds(w, h) else {
                continue;
            };
            for y in b.y0..b.y1 {
                for x in b.x0..b.x1 {
                    let (lx, ly) = (x - region.x0, y - region.y0);
                    let v = local.get(lx, ly, 0) + luminance.get(x, y, 0);
                    local.set(lx, ly, 0, v);
                }
            }
        }

        let mut view = View::new(name, local);
        {
            let mut process = view.begin_process();
            if let Some(threshold) = opts.binarize {
                process.apply("Binarize", |img| self.operators.binarize(img, threshold))?;
            }
            if let Some(structure) = dilation {
                process.apply("MorphologicalTransformation", |img| {
                    self.operators
                        .morphological_transform(img, MorphologicalOp::Dilation, structure)
                })?;
            }
            if let Some(sigma) = opts.convolution {
                let params = ConvolutionParams::gaussian(sigma);
                process.apply("Convolution", |img| self.operators.convolve(img, &params))?;
            }
        }

        let mask = MaskImage::new(w, h, (region.x0, region.y0), view.into_image());
        Ok(Some(self.registry.track(name, mask)))
    }
}
