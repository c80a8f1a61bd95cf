/// Star reduction: masked morphological selection, one pass per
/// structuring-element group
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cancel::{AbortFlag, RunOutcome, StatusSink};
use crate::error::Result;
use crate::imaging::Image;
use crate::mask::{MaskBuilder, MaskOptions, DEFAULT_BINARIZE_THRESHOLD, DEFAULT_MASK_CONVOLUTION};
use crate::operators::{ImageOperators, MorphologicalOp, StructureSize};
use crate::resources::TempRegistry;
use crate::star::Star;
use crate::view::View;

/// Selection amounts above this would brighten stars
pub const MAX_SELECTION: f64 = 0.45;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReduceOptions {
    /// Morphological selection amount, clamped to `MAX_SELECTION`
    pub selection: f64,
    /// Scale the selection by structure size
    pub selection_scale: bool,
}

impl Default for ReduceOptions {
    fn default() -> Self {
        Self {
            selection: 0.25,
            selection_scale: true,
        }
    }
}

impl ReduceOptions {
    pub fn effective_selection(&self) -> f64 {
        if self.selection > 0.0 {
            self.selection.min(MAX_SELECTION)
        } else {
            0.25
        }
    }
}

/// Parameters applied to one structure-size group
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReductionLogEntry {
    pub structure_size: u32,
    pub stars: usize,
    pub selection: f64,
}

#[derive(Debug)]
pub struct ReduceReport {
    pub outcome: RunOutcome,
    /// Entries keyed by structure size
    pub entries: BTreeMap<u32, ReductionLogEntry>,
}

/// Smallest element whose size times 3 covers the width, else the largest
pub fn structure_for_reduction(width: f64) -> StructureSize {
    StructureSize::ALL
        .into_iter()
        .find(|s| width <= (s.size() * 3) as f64)
        .unwrap_or_else(StructureSize::max)
}

/// `0.5 - (size / max) * (0.5 - selection)`
pub fn scaled_selection(selection: f64, structure: StructureSize) -> f64 {
    let r = structure.size() as f64 / StructureSize::max().size() as f64;
    0.5 - r * (0.5 - selection)
}

/// Stars grouped by structuring element, ascending
pub fn group_by_structure<'s>(stars: &[&'s Star]) -> BTreeMap<StructureSize, Vec<&'s Star>> {
    let mut groups: BTreeMap<StructureSize, Vec<&Star>> = BTreeMap::new();
    for star in stars {
        groups
            .entry(structure_for_reduction(star.width()))
            .or_default()
            .push(star);
    }
    groups
}

pub struct StarReducer<'a> {
    operators: &'a dyn ImageOperators,
    registry: &'a TempRegistry,
}

impl<'a> StarReducer<'a> {
    pub fn new(operators: &'a dyn ImageOperators, registry: &'a TempRegistry) -> Self {
        Self {
            operators,
            registry,
        }
    }

    /// Reduce `stars` in `view`.
    ///
    /// Each group gets its own mask and its own transaction; the abort
    /// flag is checked between groups.
    pub fn reduce(
        &self,
        stars: &[&Star],
        luminance: &Image,
        view: &mut View,
        opts: &ReduceOptions,
        abort: &AbortFlag,
        sink: &dyn StatusSink,
    ) -> Result<ReduceReport> {
        let mut report = ReduceReport {
            outcome: RunOutcome::Completed,
            entries: BTreeMap::new(),
        };
        let base_selection = opts.effective_selection();
        let groups = group_by_structure(stars);
        let len = stars.len();

        sink.on_status_update("Reducing stars");
        sink.on_progress_update(0, 0);

        let builder = MaskBuilder::new(self.operators, self.registry);
        let mut processed = 0;
        for (group_index, (structure, group)) in groups.iter().enumerate() {
            if abort.is_requested() {
                tracing::warn!("Star reduction aborted after {} groups", group_index);
                report.outcome = RunOutcome::Aborted {
                    processed: group_index,
                };
                break;
            }
            processed += group.len();

            let mask_opts = MaskOptions {
                binarize: Some(DEFAULT_BINARIZE_THRESHOLD),
                dilation: Some(structure.size()),
                convolution: Some(DEFAULT_MASK_CONVOLUTION),
                enlarged: true,
                min_flux: None,
            };
            let name = format!("reduce_{}", structure.size());
            let Some(mask) = builder.build_mask(luminance, group, &mask_opts, &name)? else {
                tracing::warn!("Failed to create mask for structure size {}", structure.size());
                continue;
            };

            let selection = if opts.selection_scale {
                scaled_selection(base_selection, *structure)
            } else {
                base_selection
            };
            tracing::info!(
                "Reducing {} stars, structure size {}, selection {:.3}",
                group.len(),
                structure.size(),
                selection
            );

            {
                let mut process = view.begin_process();
                let margin = structure.size() as usize;
                process
                    .with_mask(&mask, margin)
                    .apply("MorphologicalTransformation", |img| {
                        self.operators.morphological_transform(
                            img,
                            MorphologicalOp::Selection(selection),
                            *structure,
                        )
                    })?;
            }
            drop(mask);

            report.entries.insert(
                structure.size(),
                ReductionLogEntry {
                    structure_size: structure.size(),
                    stars: group.len(),
                    selection,
                },
            );
            sink.on_progress_update(processed, len);
        }

        sink.on_status_update("Done");
        Ok(report)
    }
}
