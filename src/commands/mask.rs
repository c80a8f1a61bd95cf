use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use crate::config::StarUtilsConfig;
use crate::mask::MaskOptions;
use crate::session::StarImageOptions;

use super::open_session;

pub struct MaskArgs {
    pub image: PathBuf,
    pub output_dir: PathBuf,
    pub cohorts: Vec<String>,
    pub filters: bool,
    pub stars: bool,
    pub dilation: u32,
}

pub fn write_masks(args: MaskArgs, config: StarUtilsConfig) -> Result<()> {
    let mut opts = StarImageOptions {
        filters: if args.filters { config.filters.clone() } else { Vec::new() },
        mask: if args.stars {
            None
        } else {
            Some(MaskOptions {
                dilation: Some(args.dilation),
                ..Default::default()
            })
        },
        ..Default::default()
    };
    if !args.cohorts.is_empty() {
        opts.big = false;
        opts.average = false;
        opts.small = false;
        for cohort in &args.cohorts {
            match cohort.to_lowercase().as_str() {
                "big" => opts.big = true,
                "average" => opts.average = true,
                "small" => opts.small = true,
                other => bail!("Invalid cohort: {}. Use big, average or small", other),
            }
        }
    }

    let session = open_session(&args.image, config)?;
    let images = session.create_star_images(&opts)?;
    if images.is_empty() {
        println!("No star images created");
        return Ok(());
    }

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create directory: {}", args.output_dir.display()))?;
    let suffix = if args.stars { "" } else { "_mask" };
    for image in &images {
        let path = args.output_dir.join(format!("{}{}.png", image.name, suffix));
        image
            .image
            .save_png(&path)
            .with_context(|| format!("Failed to save {}", path.display()))?;
        println!("{}: {} stars -> {}", image.name, image.star_ids.len(), path.display());
    }
    Ok(())
}
