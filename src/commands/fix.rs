use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::StarUtilsConfig;

use super::open_session;

pub struct FixArgs {
    pub image: PathBuf,
    pub output: PathBuf,
    pub no_elongation: bool,
    pub no_reduction: bool,
    pub threshold: Option<f64>,
    pub selection: Option<f64>,
    pub no_atomic: bool,
    pub keep_mask: Option<PathBuf>,
    pub log: Option<PathBuf>,
}

pub fn fix(args: FixArgs, mut config: StarUtilsConfig) -> Result<()> {
    if let Some(threshold) = args.threshold {
        config.fix.threshold = threshold;
    }
    if let Some(selection) = args.selection {
        config.reduce.selection = selection;
    }
    if args.no_atomic {
        config.fix.atomic = false;
    }
    config.fix.keep_mask |= args.keep_mask.is_some();

    let mut session = open_session(&args.image, config)?;

    if !args.no_elongation {
        let report = session.fix_elongated_stars(None)?;
        println!(
            "Elongation fix: {} fixed, {} skipped{}",
            report.entries.len(),
            report.skipped.len(),
            if report.outcome.is_aborted() { " (aborted)" } else { "" }
        );
        if let (Some(path), Some(mask)) = (&args.keep_mask, &report.mask) {
            mask.to_full_image()
                .save_png(path)
                .with_context(|| format!("Failed to save mask: {}", path.display()))?;
            println!("Fix mask saved to: {}", path.display());
        }
    }

    if !args.no_reduction {
        let report = session.reduce_stars(None)?;
        for entry in report.entries.values() {
            println!(
                "Reduced {} stars with structure size {}, selection {:.3}",
                entry.stars, entry.structure_size, entry.selection
            );
        }
    }

    if let Some(path) = &args.log {
        session
            .save_log(path)
            .with_context(|| format!("Failed to save log: {}", path.display()))?;
    }

    session.close_temporaries();
    let output = &args.output;
    session
        .into_image()
        .save_png(output)
        .with_context(|| format!("Failed to save image: {}", output.display()))?;
    println!("Saved to: {}", output.display());
    Ok(())
}
