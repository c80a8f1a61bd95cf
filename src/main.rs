use clap::Parser;
use tracing_subscriber::EnvFilter;

use star_utils::cli::{Cli, Commands};
use star_utils::commands::{self, load_config, FixArgs, MaskArgs};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "star_utils=debug" } else { "star_utils=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Analyze {
            image,
            options,
            log,
            annotate,
            enlarged,
            undetected,
        } => {
            let config = load_config(config_path, cli.verbose, &options)?;
            commands::analyze(
                &image,
                config,
                log.as_deref(),
                annotate.as_deref(),
                enlarged,
                undetected.as_deref(),
            )?;
        }
        Commands::Fix {
            image,
            output,
            options,
            no_elongation,
            no_reduction,
            threshold,
            selection,
            no_atomic,
            keep_mask,
            log,
        } => {
            let config = load_config(config_path, cli.verbose, &options)?;
            let args = FixArgs {
                image,
                output,
                no_elongation,
                no_reduction,
                threshold,
                selection,
                no_atomic,
                keep_mask,
                log,
            };
            commands::fix(args, config)?;
        }
        Commands::Mask {
            image,
            output_dir,
            options,
            cohort,
            filters,
            stars,
            dilation,
        } => {
            let config = load_config(config_path, cli.verbose, &options)?;
            let args = MaskArgs {
                image,
                output_dir,
                cohorts: cohort,
                filters,
                stars,
                dilation,
            };
            commands::write_masks(args, config)?;
        }
        Commands::Plot {
            image,
            options,
            feature,
            grouped,
            percent,
            output_dir,
        } => {
            let config = load_config(config_path, cli.verbose, &options)?;
            commands::plot(&image, config, &feature, grouped, &percent, output_dir)?;
        }
        Commands::Config { options } => {
            let config = load_config(config_path, cli.verbose, &options)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
