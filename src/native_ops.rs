/// In-process image operators: parametric convolution, Richardson-Lucy
/// deconvolution, rank morphology and binarization
use crate::imaging::Image;
use crate::operators::{
    ConvolutionParams, DeconvolutionParams, DeconvolutionPsf, ImageOperators, MorphologicalOp,
    StructureSize,
};

const RL_EPSILON: f32 = 1e-6;
const MAX_KERNEL_RADIUS: usize = 64;

/// Normalized square kernel of side `2 * radius + 1`
#[derive(Debug, Clone)]
struct Kernel {
    radius: usize,
    weights: Vec<f32>,
}

impl Kernel {
    fn side(&self) -> usize {
        2 * self.radius + 1
    }

    fn identity() -> Self {
        Self {
            radius: 0,
            weights: vec![1.0],
        }
    }

    fn normalized(radius: usize, mut weights: Vec<f32>) -> Self {
        let sum: f32 = weights.iter().sum();
        if sum <= 0.0 {
            return Self::identity();
        }
        for w in weights.iter_mut() {
            *w /= sum;
        }
        Self { radius, weights }
    }

    /// exp(-0.5 * r^shape) over the rotated, aspect-scaled distance
    fn parametric(sigma: f64, shape: f64, aspect_ratio: f64, rotation_deg: f64) -> Self {
        if sigma <= 0.0 {
            return Self::identity();
        }
        let radius = ((3.0 * sigma).ceil() as usize).clamp(1, MAX_KERNEL_RADIUS);
        let side = 2 * radius + 1;
        let sy = sigma * aspect_ratio.clamp(0.05, 1.0);
        let (sin_t, cos_t) = rotation_deg.to_radians().sin_cos();
        let mut weights = vec![0.0f32; side * side];
        for j in 0..side {
            for i in 0..side {
                let dx = i as f64 - radius as f64;
                let dy = j as f64 - radius as f64;
                let xp = dx * cos_t + dy * sin_t;
                let yp = -dx * sin_t + dy * cos_t;
                let r2 = (xp / sigma).powi(2) + (yp / sy).powi(2);
                weights[j * side + i] = (-0.5 * r2.powf(shape / 2.0)).exp() as f32;
            }
        }
        Self::normalized(radius, weights)
    }

    /// Line of `length` pixels through the center at `angle_deg`
    fn motion(length: f64, angle_deg: f64) -> Self {
        if length < 1.0 {
            return Self::identity();
        }
        let radius = ((length / 2.0).ceil() as usize).clamp(1, MAX_KERNEL_RADIUS);
        let side = 2 * radius + 1;
        let (sin_t, cos_t) = angle_deg.to_radians().sin_cos();
        let mut weights = vec![0.0f32; side * side];
        let steps = (length * 2.0).ceil() as usize;
        for s in 0..=steps {
            let t = -length / 2.0 + length * s as f64 / steps as f64;
            // Image rows grow downwards
            let x = (radius as f64 + t * cos_t).round();
            let y = (radius as f64 - t * sin_t).round();
            if x >= 0.0 && y >= 0.0 && (x as usize) < side && (y as usize) < side {
                weights[y as usize * side + x as usize] += 1.0;
            }
        }
        Self::normalized(radius, weights)
    }
}

/// Create a normalized 1D Gaussian kernel
fn create_gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = ((3.0 * sigma).ceil() as usize).clamp(1, MAX_KERNEL_RADIUS);
    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for v in kernel.iter_mut() {
        *v /= sum;
    }
    kernel
}

fn convolve_horizontal(data: &[f32], width: usize, height: usize, kernel: &[f32]) -> Vec<f32> {
    let half = (kernel.len() / 2) as i64;
    let mut result = vec![0.0f32; width * height];
    for y in 0..height {
        let row = &data[y * width..(y + 1) * width];
        for x in 0..width {
            let mut sum = 0.0;
            for (i, &k) in kernel.iter().enumerate() {
                let sx = (x as i64 + i as i64 - half).clamp(0, width as i64 - 1) as usize;
                sum += row[sx] * k;
            }
            result[y * width + x] = sum;
        }
    }
    result
}

fn convolve_vertical(data: &[f32], width: usize, height: usize, kernel: &[f32]) -> Vec<f32> {
    let half = (kernel.len() / 2) as i64;
    let mut result = vec![0.0f32; width * height];
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0;
            for (i, &k) in kernel.iter().enumerate() {
                let sy = (y as i64 + i as i64 - half).clamp(0, height as i64 - 1) as usize;
                sum += data[sy * width + x] * k;
            }
            result[y * width + x] = sum;
        }
    }
    result
}

/// Separable Gaussian blur of one plane, edges replicated
pub fn gaussian_blur_plane(data: &[f32], width: usize, height: usize, sigma: f32) -> Vec<f32> {
    if sigma <= 0.0 || width == 0 || height == 0 {
        return data.to_vec();
    }
    let kernel = create_gaussian_kernel(sigma);
    let temp = convolve_horizontal(data, width, height, &kernel);
    convolve_vertical(&temp, width, height, &kernel)
}

/// 2D convolution with replicated edges; `flipped` correlates with the
/// mirrored kernel (the adjoint used by Richardson-Lucy)
fn convolve_plane(data: &[f32], width: usize, height: usize, kernel: &Kernel, flipped: bool) -> Vec<f32> {
    let r = kernel.radius as i64;
    let side = kernel.side();
    let mut result = vec![0.0f32; width * height];
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0;
            for j in 0..side {
                let sy = (y as i64 + j as i64 - r).clamp(0, height as i64 - 1) as usize;
                for i in 0..side {
                    let w = if flipped {
                        kernel.weights[(side - 1 - j) * side + (side - 1 - i)]
                    } else {
                        kernel.weights[j * side + i]
                    };
                    if w == 0.0 {
                        continue;
                    }
                    let sx = (x as i64 + i as i64 - r).clamp(0, width as i64 - 1) as usize;
                    sum += data[sy * width + sx] * w;
                }
            }
            result[y * width + x] = sum;
        }
    }
    result
}

fn richardson_lucy(
    observed: &[f32],
    width: usize,
    height: usize,
    kernel: &Kernel,
    params: &DeconvolutionParams,
) -> Vec<f32> {
    let mut estimate: Vec<f32> = observed.iter().map(|v| v.max(RL_EPSILON)).collect();
    for _ in 0..params.iterations {
        let blurred = convolve_plane(&estimate, width, height, kernel, false);
        let ratio: Vec<f32> = observed
            .iter()
            .zip(blurred.iter())
            .map(|(o, b)| o.max(0.0) / b.max(RL_EPSILON))
            .collect();
        let correction = convolve_plane(&ratio, width, height, kernel, true);
        for (e, c) in estimate.iter_mut().zip(correction.iter()) {
            *e *= c;
        }
        if params.deringing {
            // Dark deringing: limit how far a sample may drop below the input
            let dark = params.deringing_dark as f32;
            for (e, o) in estimate.iter_mut().zip(observed.iter()) {
                *e = e.max(o - dark);
            }
        }
    }
    for v in estimate.iter_mut() {
        *v = v.clamp(0.0, 1.0);
    }
    estimate
}

/// Built-in `ImageOperators`
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOperators;

impl NativeOperators {
    pub fn new() -> Self {
        Self
    }
}

impl ImageOperators for NativeOperators {
    fn convolve(&self, image: &mut Image, params: &ConvolutionParams) -> anyhow::Result<()> {
        if !(params.sigma.is_finite() && params.shape > 0.0) {
            anyhow::bail!("Invalid convolution parameters: {:?}", params);
        }
        let (w, h) = (image.width(), image.height());
        let separable = params.shape == 2.0 && params.aspect_ratio == 1.0;
        let kernel = if separable {
            None
        } else {
            Some(Kernel::parametric(
                params.sigma,
                params.shape,
                params.aspect_ratio,
                params.rotation,
            ))
        };
        for plane in image.planes_mut() {
            *plane = match &kernel {
                None => gaussian_blur_plane(plane, w, h, params.sigma as f32),
                Some(k) => convolve_plane(plane, w, h, k, false),
            };
        }
        Ok(())
    }

    fn deconvolve(&self, image: &mut Image, params: &DeconvolutionParams) -> anyhow::Result<()> {
        let kernel = match params.psf {
            DeconvolutionPsf::Parametric {
                sigma,
                shape,
                aspect_ratio,
            } => {
                if !(sigma.is_finite() && sigma >= 0.0) {
                    anyhow::bail!("Invalid deconvolution sigma {}", sigma);
                }
                Kernel::parametric(sigma, shape, aspect_ratio, 0.0)
            }
            DeconvolutionPsf::MotionBlur { length, angle } => {
                if !(length.is_finite() && angle.is_finite()) {
                    anyhow::bail!("Invalid motion blur length {} / angle {}", length, angle);
                }
                Kernel::motion(length, angle)
            }
        };
        let (w, h) = (image.width(), image.height());
        for plane in image.planes_mut() {
            *plane = richardson_lucy(plane, w, h, &kernel, params);
        }
        Ok(())
    }

    fn morphological_transform(
        &self,
        image: &mut Image,
        op: MorphologicalOp,
        structure: StructureSize,
    ) -> anyhow::Result<()> {
        let rank = match op {
            MorphologicalOp::Erosion => 0.0,
            MorphologicalOp::Dilation => 1.0,
            MorphologicalOp::Selection(p) => {
                if !(0.0..=1.0).contains(&p) {
                    anyhow::bail!("Selection point {} outside [0, 1]", p);
                }
                p
            }
        };
        let offsets = structure.offsets();
        let (w, h) = (image.width() as i64, image.height() as i64);
        let pick = ((offsets.len() - 1) as f64 * rank).round() as usize;
        let mut window = Vec::with_capacity(offsets.len());

        for plane in image.planes_mut() {
            let source = plane.clone();
            for y in 0..h {
                for x in 0..w {
                    window.clear();
                    for &(dx, dy) in &offsets {
                        let sx = (x + dx).clamp(0, w - 1);
                        let sy = (y + dy).clamp(0, h - 1);
                        window.push(source[(sy * w + sx) as usize]);
                    }
                    window.sort_by(|a, b| a.total_cmp(b));
                    plane[(y * w + x) as usize] = window[pick];
                }
            }
        }
        Ok(())
    }

    fn binarize(&self, image: &mut Image, threshold: f64) -> anyhow::Result<()> {
        let t = threshold as f32;
        for plane in image.planes_mut() {
            for v in plane.iter_mut() {
                *v = if *v > t { 1.0 } else { 0.0 };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_image(size: usize, value: f32) -> Image {
        let mut img = Image::new(size, size, 1);
        img.set(size / 2, size / 2, 0, value);
        img
    }

    #[test]
    fn test_gaussian_blur_preserves_flux() {
        let img = point_image(21, 1.0);
        let blurred = gaussian_blur_plane(img.plane(0), 21, 21, 2.0);
        let total: f32 = blurred.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(blurred[10 * 21 + 10] < 1.0);
        assert!(blurred[10 * 21 + 10] > blurred[10 * 21 + 12]);
    }

    #[test]
    fn test_convolve_non_gaussian_shape() {
        let mut img = point_image(15, 1.0);
        let params = ConvolutionParams {
            sigma: 1.5,
            shape: 1.0,
            aspect_ratio: 0.5,
            rotation: 0.0,
        };
        NativeOperators.convolve(&mut img, &params).unwrap();
        let total: f32 = img.plane(0).iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        // Narrower along y
        assert!(img.get(9, 7, 0) > img.get(7, 9, 0));
    }

    #[test]
    fn test_motion_kernel_is_a_line() {
        let k = Kernel::motion(5.0, 0.0);
        let side = k.side();
        let mid = k.radius;
        for j in 0..side {
            for i in 0..side {
                let w = k.weights[j * side + i];
                if j != mid {
                    assert_eq!(w, 0.0);
                }
            }
        }
        let total: f32 = k.weights.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_deconvolution_sharpens() {
        let mut img = point_image(21, 0.8);
        NativeOperators
            .convolve(&mut img, &ConvolutionParams::gaussian(1.5))
            .unwrap();
        let blurred_peak = img.get(10, 10, 0);
        NativeOperators
            .deconvolve(&mut img, &DeconvolutionParams::parametric(1.5, false, 0.0))
            .unwrap();
        assert!(img.get(10, 10, 0) > blurred_peak);
    }

    #[test]
    fn test_deringing_limits_dark_drop() {
        let mut img = point_image(21, 0.8);
        NativeOperators
            .convolve(&mut img, &ConvolutionParams::gaussian(1.5))
            .unwrap();
        let before = img.clone();
        NativeOperators
            .deconvolve(&mut img, &DeconvolutionParams::parametric(1.5, true, 0.001))
            .unwrap();
        for (a, b) in img.plane(0).iter().zip(before.plane(0).iter()) {
            assert!(*a >= b - 0.001 - 1e-6);
        }
    }

    #[test]
    fn test_morphology() {
        let mut img = point_image(11, 1.0);
        NativeOperators
            .morphological_transform(&mut img, MorphologicalOp::Dilation, StructureSize::Five)
            .unwrap();
        assert_eq!(img.get(5, 5, 0), 1.0);
        assert_eq!(img.get(7, 5, 0), 1.0);
        // Corners of the 5x5 element are inactive
        assert_eq!(img.get(7, 7, 0), 0.0);

        NativeOperators
            .morphological_transform(&mut img, MorphologicalOp::Erosion, StructureSize::Five)
            .unwrap();
        assert_eq!(img.get(5, 5, 0), 1.0);
        assert_eq!(img.get(7, 5, 0), 0.0);

        let err = NativeOperators.morphological_transform(
            &mut img,
            MorphologicalOp::Selection(1.5),
            StructureSize::Seven,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_binarize() {
        let mut img = Image::from_mono(3, 1, vec![0.05, 0.1, 0.5]).unwrap();
        NativeOperators.binarize(&mut img, 0.1).unwrap();
        assert_eq!(img.plane(0), &[0.0, 0.0, 1.0]);
    }
}
