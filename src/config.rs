// SPDX-License-Identifier: MIT OR Apache-2.0

//! Control schedule: which denoising steps and UNet layers are substituted.
//!
//! [`ControlSchedule`] resolves a `(start_step, start_layer)` pair — or
//! explicit index lists — into the step/layer sets a controller consults on
//! every invocation. The raw per-step layer-invocation counter is halved
//! before the lookup because each logical UNet layer fires two attention
//! calls (self then cross).
//!
//! # Usage
//!
//! ```
//! use candle_msa::ControlSchedule;
//!
//! let schedule = ControlSchedule::new(4, 10, 50).unwrap();
//! assert!(schedule.step_active(4));
//! assert!(!schedule.step_active(3));
//! assert!(schedule.layer_active(10));
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MsaError, Result};

/// Number of logical attention layer pairs in the denoising UNet.
///
/// Upper bound of the default `start_layer..` range.
pub const NUM_UNET_LAYER_PAIRS: usize = 16;

/// Attention-layer invocations per denoising step (self + cross per pair).
pub const ATTN_CALLS_PER_STEP: usize = 2 * NUM_UNET_LAYER_PAIRS;

/// Step/layer activation schedule for mutual self-attention control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSchedule {
    /// Total denoising steps in the run.
    total_steps: usize,
    /// Steps at which control is active. Subset of `[0, total_steps)`.
    active_steps: BTreeSet<usize>,
    /// Logical layer pairs at which control is active.
    active_layers: BTreeSet<usize>,
}

impl ControlSchedule {
    /// Build a schedule active from `start_step` to the end of the run and
    /// from `start_layer` to the last UNet layer pair.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Config`] if `start_step` exceeds `total_steps`
    /// or `start_layer` exceeds [`NUM_UNET_LAYER_PAIRS`].
    pub fn new(start_step: usize, start_layer: usize, total_steps: usize) -> Result<Self> {
        if start_step > total_steps {
            return Err(MsaError::Config(format!(
                "start_step {start_step} exceeds total_steps {total_steps}"
            )));
        }
        if start_layer > NUM_UNET_LAYER_PAIRS {
            return Err(MsaError::Config(format!(
                "start_layer {start_layer} exceeds layer count {NUM_UNET_LAYER_PAIRS}"
            )));
        }
        let schedule = Self {
            total_steps,
            active_steps: (start_step..total_steps).collect(),
            active_layers: (start_layer..NUM_UNET_LAYER_PAIRS).collect(),
        };
        schedule.announce();
        Ok(schedule)
    }

    /// Build a schedule from explicit step and layer index lists.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Config`] if any step index falls outside
    /// `[0, total_steps)`.
    pub fn from_indices(
        steps: impl IntoIterator<Item = usize>,
        layers: impl IntoIterator<Item = usize>,
        total_steps: usize,
    ) -> Result<Self> {
        let active_steps: BTreeSet<usize> = steps.into_iter().collect();
        if let Some(&bad) = active_steps.iter().find(|&&s| s >= total_steps) {
            return Err(MsaError::Config(format!(
                "step index {bad} outside [0, {total_steps})"
            )));
        }
        let schedule = Self {
            total_steps,
            active_steps,
            active_layers: layers.into_iter().collect(),
        };
        schedule.announce();
        Ok(schedule)
    }

    /// Parse a schedule from a JSON object.
    ///
    /// Recognised keys: `start_step`, `start_layer`, `total_steps`,
    /// `step_idx` (list), `layer_idx` (list). Explicit index lists override
    /// the corresponding `start_*` range.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Config`] on malformed values or out-of-range
    /// indices.
    pub fn from_json(json: &Value) -> Result<Self> {
        let get_usize = |key: &str, default: usize| -> Result<usize> {
            match json.get(key) {
                None => Ok(default),
                Some(v) => v
                    .as_u64()
                    .map(|n| n as usize)
                    .ok_or_else(|| MsaError::Config(format!("`{key}` must be an integer"))),
            }
        };
        let get_list = |key: &str| -> Result<Option<Vec<usize>>> {
            match json.get(key) {
                None => Ok(None),
                Some(v) => {
                    let arr = v
                        .as_array()
                        .ok_or_else(|| MsaError::Config(format!("`{key}` must be a list")))?;
                    arr.iter()
                        .map(|e| {
                            e.as_u64()
                                .map(|n| n as usize)
                                .ok_or_else(|| MsaError::Config(format!("`{key}` entry not an integer")))
                        })
                        .collect::<Result<Vec<usize>>>()
                        .map(Some)
                }
            }
        };

        let total_steps = get_usize("total_steps", 50)?;
        let start_step = get_usize("start_step", 4)?;
        let start_layer = get_usize("start_layer", 10)?;
        let steps = get_list("step_idx")?
            .unwrap_or_else(|| (start_step.min(total_steps)..total_steps).collect());
        let layers = get_list("layer_idx")?
            .unwrap_or_else(|| (start_layer.min(NUM_UNET_LAYER_PAIRS)..NUM_UNET_LAYER_PAIRS).collect());
        Self::from_indices(steps, layers, total_steps)
    }

    /// Total denoising steps in the run.
    #[must_use]
    pub const fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Whether control is active at the given denoising step.
    #[must_use]
    pub fn step_active(&self, step: usize) -> bool {
        self.active_steps.contains(&step)
    }

    /// Whether control is active at the given logical layer pair.
    #[must_use]
    pub fn layer_active(&self, layer_pair: usize) -> bool {
        self.active_layers.contains(&layer_pair)
    }

    /// Full decision rule for one invocation: self-attention only, step
    /// active, and the halved layer-invocation counter active.
    #[must_use]
    pub fn is_active(&self, step: usize, att_layer: usize, is_cross: bool) -> bool {
        !is_cross && self.step_active(step) && self.layer_active(att_layer / 2)
    }

    fn announce(&self) {
        tracing::info!(
            steps = ?self.active_steps,
            layers = ?self.active_layers,
            "mutual self-attention schedule resolved"
        );
    }
}

impl Default for ControlSchedule {
    /// The original editing recipe: steps `4..50`, layer pairs `10..16`.
    fn default() -> Self {
        Self {
            total_steps: 50,
            active_steps: (4..50).collect(),
            active_layers: (10..NUM_UNET_LAYER_PAIRS).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
