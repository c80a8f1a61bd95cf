/// Feature plots: data points from the catalog and a gnuplot backend
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::catalog::StarCatalog;
use crate::error::{Result, StarError};

/// Points to plot for one feature
#[derive(Debug, Clone, PartialEq)]
pub struct PlotData {
    pub feature: String,
    /// Bucket interval when grouped
    pub grouped: Option<f64>,
    /// `(index, value)` pairs, or `(bucket, count)` pairs when grouped
    pub points: Vec<(f64, f64)>,
    /// Sorted `(index, value)` pairs the statistics lines are computed on
    pub values: Vec<(f64, f64)>,
}

impl PlotData {
    /// Build from `sort_by(feature)`, or from `group_by(feature, interval)`
    /// when `grouped` is set
    pub fn from_catalog(catalog: &mut StarCatalog, feature: &str, grouped: Option<f64>) -> Result<Self> {
        let values: Vec<(f64, f64)> = catalog
            .sorted_stars(feature)
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.feature(feature).map(|v| (i as f64, v)))
            .collect();
        if values.is_empty() {
            return Err(StarError::UnknownFeature(feature.to_string()));
        }
        let points = match grouped {
            Some(interval) => catalog
                .group_by(feature, interval)
                .iter()
                .map(|(key, stars)| (key, stars.len() as f64))
                .collect(),
            None => values.clone(),
        };
        Ok(Self {
            feature: feature.to_string(),
            grouped,
            points,
            values,
        })
    }

    pub fn is_grouped(&self) -> bool {
        self.grouped.is_some()
    }
}

/// Horizontal (or vertical, when grouped) line at a fraction of the
/// value range
#[derive(Debug, Clone, PartialEq)]
pub struct PercentageLine {
    pub fraction: f64,
    pub color: Option<String>,
}

impl PercentageLine {
    fn color(&self) -> &str {
        match &self.color {
            Some(c) => c,
            None if self.fraction == 0.5 => "#00aa00",
            None if self.fraction > 0.5 => "#00aaf0",
            None => "#cc00cc",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlotOptions {
    pub title: Option<String>,
    pub x_label: Option<String>,
    pub y_label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub font_name: String,
    pub font_size: u32,
    pub background: String,
    /// Where data, script, log and image go
    pub output_dir: PathBuf,
    /// Defaults to `<output_dir>/star_<feature>_graph.svg`
    pub image_file: Option<PathBuf>,
    pub draw_std_dev_background: bool,
    pub percentage_lines: Vec<PercentageLine>,
}

impl Default for PlotOptions {
    fn default() -> Self {
        Self {
            title: None,
            x_label: None,
            y_label: None,
            width: 600,
            height: 500,
            font_name: "Helvetica".to_string(),
            font_size: 10,
            background: "white".to_string(),
            output_dir: std::env::temp_dir(),
            image_file: None,
            draw_std_dev_background: true,
            percentage_lines: Vec::new(),
        }
    }
}

impl PlotOptions {
    /// Image file for `feature`
    pub fn image_path(&self, feature: &str) -> PathBuf {
        self.image_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join(format!("star_{}_graph.svg", var_prefix(feature))))
    }
}

/// Outcome of a plot; failures are reported here, never raised
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlotResult {
    pub created: bool,
    pub image_file: PathBuf,
    pub script: Option<PathBuf>,
    pub log: Option<PathBuf>,
    pub error: Option<String>,
}

impl PlotResult {
    pub(crate) fn failed(image_file: PathBuf, error: impl Into<String>) -> Self {
        let error = error.into();
        tracing::error!("Plot failed: {}", error);
        Self {
            created: false,
            image_file,
            script: None,
            log: None,
            error: Some(error),
        }
    }
}

pub trait PlottingService {
    fn plot(&self, data: &PlotData, opts: &PlotOptions) -> PlotResult;
}

/// gnuplot variable prefix for a feature path
fn var_prefix(feature: &str) -> String {
    feature
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn join_points(points: &[(f64, f64)]) -> String {
    points
        .iter()
        .map(|(x, y)| format!("{} {}", x, y))
        .collect::<Vec<_>>()
        .join("\n")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// File names used for one feature
struct PlotFiles {
    data: PathBuf,
    stats: PathBuf,
    script: PathBuf,
    log: PathBuf,
    image: PathBuf,
}

impl PlotFiles {
    fn new(data: &PlotData, opts: &PlotOptions) -> Self {
        let dir = &opts.output_dir;
        let feature = var_prefix(&data.feature);
        let data_file = dir.join(format!("stars_{}.dat", feature));
        Self {
            stats: if data.is_grouped() {
                dir.join(format!("stars_{}.values.dat", feature))
            } else {
                data_file.clone()
            },
            data: data_file,
            script: dir.join(format!("stars_{}.plt", feature)),
            log: dir.join(format!("stars_{}.log", feature)),
            image: opts.image_path(&data.feature),
        }
    }
}

/// gnuplot script: SVG terminal, mean and stddev lines, optional stddev
/// band and percentage lines, smoothed data curve
pub fn build_script(data: &PlotData, opts: &PlotOptions, data_file: &Path, stats_file: &Path, image_file: &Path) -> String {
    let grouped = data.is_grouped();
    let v = var_prefix(&data.feature);
    let (x_label, y_label) = if grouped {
        (
            opts.x_label.clone().unwrap_or_else(|| data.feature.clone()),
            opts.y_label.clone().unwrap_or_else(|| "Count".to_string()),
        )
    } else {
        (
            opts.x_label.clone().unwrap_or_else(|| "Stars".to_string()),
            opts.y_label.clone().unwrap_or_else(|| data.feature.clone()),
        )
    };
    let title = opts.title.clone().unwrap_or_else(|| {
        format!("Star {}{}", data.feature, if grouped { " (Grouped)" } else { "" })
    });

    let mut script = vec![
        format!(
            "set terminal svg size {},{} enhanced background rgb '{}' font \"{},{}\"",
            opts.width, opts.height, opts.background, opts.font_name, opts.font_size
        ),
        format!("set output \"{}\"", image_file.display()),
        format!(
            "set title font \"{},{}\" enhanced \"{}\"",
            opts.font_name,
            opts.font_size * 2,
            title
        ),
        format!("set xlabel \"{}\"", x_label),
        format!("set ylabel \"{}\"", y_label),
    ];
    if let Some(interval) = data.grouped {
        script.push(format!("set xtic {}", interval));
    }
    script.push(format!(
        "stats \"{}\" using 2 output name \"{}\"",
        stats_file.display(),
        v
    ));
    script.push(format!("{v}_stddev_high = {v}_mean + {v}_stddev"));
    script.push(format!("{v}_stddev_low = {v}_mean - {v}_stddev"));

    let mut lines: Vec<(String, String, String)> = vec![
        (format!("{v}_mean"), "Mean".to_string(), "#666666".to_string()),
        (format!("{v}_stddev_high"), String::new(), "#aaaaaa".to_string()),
        (format!("{v}_stddev_low"), String::new(), "#aaaaaa".to_string()),
    ];
    for line in &opts.percentage_lines {
        let pct = (line.fraction * 100.0).round() as i64;
        let var = format!("{v}_{pct}");
        script.push(format!(
            "{var} = (({v}_max - {v}_min) * {}) + {v}_min",
            line.fraction
        ));
        lines.push((var, format!("{}%", pct), line.color().to_string()));
    }

    for (i, (var, label, color)) in lines.iter().enumerate() {
        let n = i + 1;
        let textcolor = if i >= 3 {
            format!(" textcolor '{}'", color)
        } else {
            String::new()
        };
        if grouped {
            script.push(format!(
                "set arrow {n} from {var}, graph 0.0 to {var}, graph 1.0 nohead fill lc '{color}'"
            ));
            script.push(format!(
                "set label {n} at {var}, graph 1.0 \"{label}\" center offset 0,1{textcolor}"
            ));
        } else {
            script.push(format!(
                "set arrow {n} from graph 0.0,first {var} to graph 1.0,first {var} nohead fill lc '{color}'"
            ));
            script.push(format!(
                "set label {n} at graph 1.0,first {var} \"{label}\" right offset -1,-1{textcolor}"
            ));
        }
    }

    if opts.draw_std_dev_background {
        let (low, high) = (format!("{v}_stddev_low"), format!("{v}_stddev_high"));
        if grouped {
            script.push(format!(
                "set obj rect from {low}, graph 0 to {high}, graph 1 lw 0 lc '#000000' fc '#cccccc'"
            ));
        } else {
            script.push(format!(
                "set obj rect from graph 0.0, first {high} to graph 1, first {low} lw 0 lc '#000000' fc '#cccccc'"
            ));
        }
    }

    script.push(format!(
        "plot \"{}\" with lines smooth csplines title \"{}\"",
        data_file.display(),
        capitalize(&data.feature)
    ));
    script.join("\n")
}

/// Runs an external gnuplot executable
#[derive(Debug, Clone)]
pub struct GnuplotService {
    executable: PathBuf,
}

impl Default for GnuplotService {
    fn default() -> Self {
        Self::new("gnuplot")
    }
}

impl GnuplotService {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    fn write_inputs(&self, data: &PlotData, opts: &PlotOptions, files: &PlotFiles) -> std::io::Result<()> {
        std::fs::create_dir_all(&opts.output_dir)?;
        std::fs::write(&files.data, join_points(&data.points))?;
        if data.is_grouped() {
            std::fs::write(&files.stats, join_points(&data.values))?;
        }
        let script = build_script(data, opts, &files.data, &files.stats, &files.image);
        std::fs::write(&files.script, script)?;
        Ok(())
    }
}

impl PlottingService for GnuplotService {
    fn plot(&self, data: &PlotData, opts: &PlotOptions) -> PlotResult {
        let files = PlotFiles::new(data, opts);
        if data.points.is_empty() {
            return PlotResult::failed(files.image, format!("No data for feature {}", data.feature));
        }
        if let Err(e) = self.write_inputs(data, opts, &files) {
            return PlotResult::failed(files.image, format!("Failed to write plot files: {}", e));
        }

        let spawn = || -> std::io::Result<std::process::ExitStatus> {
            Command::new(&self.executable)
                .current_dir(&opts.output_dir)
                .stdin(Stdio::from(File::open(&files.script)?))
                .stdout(Stdio::from(File::create(&files.log)?))
                .stderr(Stdio::inherit())
                .status()
        };
        tracing::info!("Start {}", self.executable.display());
        let status = match spawn() {
            Ok(status) => status,
            Err(e) => {
                let mut result = PlotResult::failed(
                    files.image,
                    format!("Failed to run gnuplot executable {}: {}", self.executable.display(), e),
                );
                result.script = Some(files.script);
                return result;
            }
        };
        tracing::info!("End Exit code {:?}", status.code());

        let created = files.image.exists();
        let error = if !status.success() {
            Some(format!("gnuplot exited with {}", status))
        } else if !created {
            Some("gnuplot did not create the image".to_string())
        } else {
            None
        };
        tracing::info!("Plot image: {}", files.image.display());
        PlotResult {
            created,
            image_file: files.image,
            script: Some(files.script),
            log: Some(files.log),
            error,
        }
    }
}
