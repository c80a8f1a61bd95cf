/// Working views and begin/end process transactions
use crate::error::{Result, StarError};
use crate::geometry::PixelRect;
use crate::imaging::Image;

/// Monochrome mask covering a sub-region of a full-size image.
///
/// Pixels outside the stored region are 0 (fully protected).
#[derive(Debug, Clone, PartialEq)]
pub struct MaskImage {
    origin: (usize, usize),
    full_width: usize,
    full_height: usize,
    image: Image,
}

impl MaskImage {
    pub fn new(full_width: usize, full_height: usize, origin: (usize, usize), image: Image) -> Self {
        Self {
            origin,
            full_width,
            full_height,
            image,
        }
    }

    /// Region of the full image the mask data covers
    pub fn bounds(&self) -> PixelRect {
        PixelRect {
            x0: self.origin.0,
            y0: self.origin.1,
            x1: (self.origin.0 + self.image.width()).min(self.full_width),
            y1: (self.origin.1 + self.image.height()).min(self.full_height),
        }
    }

    pub fn full_size(&self) -> (usize, usize) {
        (self.full_width, self.full_height)
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Image {
        &mut self.image
    }

    /// Mask value at full-image coordinates
    pub fn value_at(&self, x: usize, y: usize) -> f32 {
        let (ox, oy) = self.origin;
        if x < ox || y < oy {
            return 0.0;
        }
        let (lx, ly) = (x - ox, y - oy);
        if lx >= self.image.width() || ly >= self.image.height() {
            return 0.0;
        }
        self.image.get(lx, ly, 0)
    }

    /// Pixel-wise maximum with another mask of the same full size
    pub fn merge_max(&mut self, other: &MaskImage) {
        let b = self.bounds().union(&other.bounds());
        let mut merged = Image::new(b.width(), b.height(), 1);
        for y in b.y0..b.y1 {
            for x in b.x0..b.x1 {
                let v = self.value_at(x, y).max(other.value_at(x, y));
                merged.set(x - b.x0, y - b.y0, 0, v);
            }
        }
        self.origin = (b.x0, b.y0);
        self.image = merged;
    }

    /// Expand to a full-size monochrome image
    pub fn to_full_image(&self) -> Image {
        let mut full = Image::new(self.full_width, self.full_height, 1);
        full.paste(&self.image, self.origin.0, self.origin.1);
        full
    }
}

/// A named image that operators modify in place
#[derive(Debug, Clone)]
pub struct View {
    id: String,
    image: Image,
}

impl View {
    pub fn new(id: impl Into<String>, image: Image) -> Self {
        Self {
            id: id.into(),
            image,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn into_image(self) -> Image {
        self.image
    }

    /// Open a transaction; the view can only be modified through the
    /// returned guard, which ends the transaction when dropped.
    pub fn begin_process(&mut self) -> Process<'_> {
        tracing::debug!("Begin process on {}", self.id);
        Process {
            view: self,
            operations: 0,
        }
    }
}

/// Open transaction on a view
pub struct Process<'v> {
    view: &'v mut View,
    operations: usize,
}

impl<'v> Process<'v> {
    pub fn view_id(&self) -> &str {
        &self.view.id
    }

    pub fn image(&self) -> &Image {
        &self.view.image
    }

    /// Number of operators applied within this transaction
    pub fn operations(&self) -> usize {
        self.operations
    }

    pub fn assign(&mut self, image: &Image) {
        self.view.image.assign(image);
        self.operations += 1;
    }

    /// Run an operator on the whole image
    pub fn apply<F>(&mut self, operator: &str, op: F) -> Result<()>
    where
        F: FnOnce(&mut Image) -> anyhow::Result<()>,
    {
        let id = self.view.id.clone();
        op(&mut self.view.image).map_err(|e| operator_failed(operator, &id, e))?;
        self.operations += 1;
        Ok(())
    }

    /// Attach a mask; operators applied through the returned guard only
    /// affect the image where the mask is non-zero.
    pub fn with_mask<'a>(&'a mut self, mask: &'a MaskImage, margin: usize) -> MaskedProcess<'a, 'v> {
        MaskedProcess {
            process: self,
            mask,
            margin,
        }
    }
}

impl Drop for Process<'_> {
    fn drop(&mut self) {
        tracing::debug!(
            "End process on {} ({} operations)",
            self.view.id,
            self.operations
        );
    }
}

/// Transaction with an active mask
pub struct MaskedProcess<'a, 'v> {
    process: &'a mut Process<'v>,
    mask: &'a MaskImage,
    margin: usize,
}

impl MaskedProcess<'_, '_> {
    /// Run an operator on the masked region and blend the result:
    /// `out = orig + mask * (processed - orig)`.
    ///
    /// The operator sees the mask bounds plus `margin` pixels of context.
    pub fn apply<F>(&mut self, operator: &str, op: F) -> Result<()>
    where
        F: FnOnce(&mut Image) -> anyhow::Result<()>,
    {
        let id = self.process.view.id.clone();
        let image = &mut self.process.view.image;
        let region = self
            .mask
            .bounds()
            .expanded(self.margin, image.width(), image.height());
        if region.width() == 0 || region.height() == 0 {
            return Ok(());
        }
        let original = image.crop(&region);
        let mut work = original.clone();
        op(&mut work).map_err(|e| operator_failed(operator, &id, e))?;

        for c in 0..work.channels() {
            for y in 0..region.height() {
                for x in 0..region.width() {
                    let m = self.mask.value_at(region.x0 + x, region.y0 + y);
                    let o = original.get(x, y, c);
                    let p = work.get(x, y, c);
                    work.set(x, y, c, o + m * (p - o));
                }
            }
        }
        image.paste(&work, region.x0, region.y0);
        self.process.operations += 1;
        Ok(())
    }
}

impl Drop for MaskedProcess<'_, '_> {
    fn drop(&mut self) {
        tracing::trace!("Mask removed from {}", self.process.view.id);
    }
}

fn operator_failed(operator: &str, view: &str, e: anyhow::Error) -> StarError {
    StarError::OperatorFailed {
        operator: operator.to_string(),
        view: view.to_string(),
        reason: format!("{:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_view(value: f32) -> View {
        View::new("test", Image::from_mono(6, 6, vec![value; 36]).unwrap())
    }

    #[test]
    fn test_apply_counts_operations() {
        let mut view = constant_view(0.5);
        {
            let mut p = view.begin_process();
            p.apply("double", |img| {
                img.plane_mut(0).iter_mut().for_each(|v| *v *= 2.0);
                Ok(())
            })
            .unwrap();
            assert_eq!(p.operations(), 1);
        }
        assert!(view.image().plane(0).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_operator_failure_is_mapped() {
        let mut view = constant_view(0.5);
        let mut p = view.begin_process();
        let err = p
            .apply("deconvolution", |_| Err(anyhow::anyhow!("boom")))
            .unwrap_err();
        assert!(matches!(err, StarError::OperatorFailed { ref operator, .. } if operator == "deconvolution"));
        drop(p);
        // Transaction closed: the view can be processed again
        let p = view.begin_process();
        assert_eq!(p.operations(), 0);
    }

    #[test]
    fn test_masked_apply_blends() {
        let mut view = constant_view(0.0);
        let mut mask_data = Image::new(2, 1, 1);
        mask_data.set(0, 0, 0, 1.0);
        mask_data.set(1, 0, 0, 0.5);
        let mask = MaskImage::new(6, 6, (2, 3), mask_data);

        let mut p = view.begin_process();
        p.with_mask(&mask, 1)
            .apply("fill", |img| {
                img.plane_mut(0).iter_mut().for_each(|v| *v = 1.0);
                Ok(())
            })
            .unwrap();
        drop(p);

        let img = view.image();
        assert_eq!(img.get(2, 3, 0), 1.0);
        assert_eq!(img.get(3, 3, 0), 0.5);
        assert_eq!(img.get(1, 3, 0), 0.0);
        assert_eq!(img.get(2, 2, 0), 0.0);
    }

    #[test]
    fn test_mask_merge_and_expand() {
        let mut a = MaskImage::new(5, 5, (0, 0), Image::from_mono(1, 1, vec![0.3]).unwrap());
        let b = MaskImage::new(5, 5, (3, 3), Image::from_mono(2, 2, vec![1.0; 4]).unwrap());
        a.merge_max(&b);
        assert_eq!(a.bounds(), PixelRect { x0: 0, y0: 0, x1: 5, y1: 5 });
        assert_eq!(a.value_at(0, 0), 0.3);
        assert_eq!(a.value_at(4, 4), 1.0);
        assert_eq!(a.value_at(2, 2), 0.0);
        let full = a.to_full_image();
        assert_eq!(full.width(), 5);
        assert_eq!(full.get(3, 4, 0), 1.0);
    }
}
