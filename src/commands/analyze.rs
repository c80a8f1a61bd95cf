use anyhow::{Context, Result};
use std::path::Path;

use crate::annotate::{AnnotateOptions, AnnotationStyle};
use crate::config::StarUtilsConfig;
use crate::star::{SizeBucket, Star};

use super::open_session;

const BIG_COLOR: image::Rgb<u8> = image::Rgb([255, 64, 64]);
const SMALL_COLOR: image::Rgb<u8> = image::Rgb([64, 160, 255]);

/// Color stars by cohort and mark the ones with a PSF
fn cohort_style(star: &Star, style: &mut AnnotationStyle) {
    match star.bucket() {
        Some(SizeBucket::Big) => style.color = BIG_COLOR,
        Some(SizeBucket::Small) => style.color = SMALL_COLOR,
        _ => {}
    }
    if let Some(psf) = &star.psf {
        style.text = Some(format!("{} {:.2}", star.id(), psf.aspect_ratio));
    }
}

pub fn analyze(
    image_path: &Path,
    config: StarUtilsConfig,
    log: Option<&Path>,
    annotate: Option<&Path>,
    enlarged: bool,
    undetected: Option<&Path>,
) -> Result<()> {
    let session = open_session(image_path, config)?;
    session.print_stats()?;

    let cohorts = session.cohorts();
    println!("Stars: {}", session.catalog().len());
    println!("  Big: {}", cohorts.big.len());
    println!("  Average: {}", cohorts.average.len());
    println!("  Small: {}", cohorts.small.len());
    println!("  With PSF: {}", session.stars_with_psf().len());
    if let Some(stats) = session.stats() {
        println!("Size: avg {:.2} median {:.2} max {:.2}", stats.size.avg, stats.size.median, stats.size.max);
        println!("Flux: avg {:.4} median {:.4} max {:.4}", stats.flux.avg, stats.flux.median, stats.flux.max);
        if let Some(aspect) = stats.psf.get("aspectRatio") {
            println!("Aspect ratio: avg {:.3} median {:.3} min {:.3}", aspect.avg, aspect.median, aspect.min);
        }
    }

    if let Some(path) = annotate {
        let opts = AnnotateOptions {
            enlarged,
            ..Default::default()
        };
        let style: &dyn Fn(&Star, &mut AnnotationStyle) = &cohort_style;
        let rgb = session.annotate(&opts, Some(style));
        rgb.save(path)
            .with_context(|| format!("Failed to save annotated image: {}", path.display()))?;
        println!("Annotated image saved to: {}", path.display());
    }

    if let Some(path) = undetected {
        session
            .undetected_stars()
            .save_png(path)
            .with_context(|| format!("Failed to save image: {}", path.display()))?;
        println!("Undetected stars image saved to: {}", path.display());
    }

    if let Some(path) = log {
        session
            .save_log(path)
            .with_context(|| format!("Failed to save log: {}", path.display()))?;
    }
    Ok(())
}
