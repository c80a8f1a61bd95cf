pub mod analyze;
pub mod fix;
pub mod mask;
pub mod plot;

pub use analyze::analyze;
pub use fix::{fix, FixArgs};
pub use mask::{write_masks, MaskArgs};
pub use plot::plot;

use anyhow::{Context, Result};
use std::path::Path;

use crate::cli::AnalysisOptions;
use crate::config::StarUtilsConfig;
use crate::imaging::Image;
use crate::session::Session;

/// Configuration file (or defaults) with the command-line overrides applied
pub fn load_config(path: Option<&Path>, verbose: bool, options: &AnalysisOptions) -> Result<StarUtilsConfig> {
    let mut config = match path {
        Some(path) => StarUtilsConfig::load(path)
            .with_context(|| format!("Failed to load configuration: {}", path.display()))?,
        None => StarUtilsConfig::default(),
    };
    options.apply_to(&mut config);
    config.verbose |= verbose;
    Ok(config)
}

/// Load `image_path` and run detection and classification on it
pub fn open_session(image_path: &Path, config: StarUtilsConfig) -> Result<Session> {
    let image = Image::from_file(image_path)
        .with_context(|| format!("Failed to load image: {}", image_path.display()))?;
    tracing::info!(
        "Loaded {} ({}x{}, {} channel(s))",
        image_path.display(),
        image.width(),
        image.height(),
        image.channels()
    );
    let view_id = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    let mut session = Session::new(view_id, image, config);
    let outcome = session
        .run_analysis()
        .with_context(|| format!("Star analysis failed for {}", image_path.display()))?;
    if outcome.is_aborted() {
        tracing::warn!("Analysis aborted: {:?}", outcome);
    }
    Ok(session)
}
