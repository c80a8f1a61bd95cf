use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::config::StarUtilsConfig;
use crate::plot::{PercentageLine, PlotOptions};

use super::open_session;

pub fn plot(
    image_path: &Path,
    config: StarUtilsConfig,
    feature: &str,
    grouped: Option<f64>,
    percent: &[f64],
    output_dir: Option<PathBuf>,
) -> Result<()> {
    let mut session = open_session(image_path, config)?;

    let mut opts = PlotOptions {
        title: Some(format!("{} - {}", session.view().id(), feature)),
        percentage_lines: percent
            .iter()
            .map(|&fraction| PercentageLine { fraction, color: None })
            .collect(),
        ..Default::default()
    };
    if let Some(dir) = output_dir {
        opts.output_dir = dir;
    }

    let result = session.plot(feature, grouped, &opts)?;
    if !result.created {
        bail!(
            "Plot failed: {}",
            result.error.as_deref().unwrap_or("gnuplot did not create an image")
        );
    }
    println!("Plot saved to: {}", result.image_file.display());
    Ok(())
}
