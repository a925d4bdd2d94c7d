// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mutual self-attention control with automatically derived masks.
//!
//! Instead of user-supplied region masks, this controller harvests
//! cross-attention maps (image positions attending to text tokens) at a
//! fixed 16×16 reference resolution during each denoising step, aggregates
//! them per token of interest, and thresholds the aggregate into the
//! foreground/background masks the dual-similarity primitive needs. The
//! history is per-step: the `after_step` hook clears it.

use std::path::PathBuf;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::attn;
use crate::config::ControlSchedule;
use crate::context::AttnContext;
use crate::control::masked::step_mask_path;
use crate::control::mutual::split_guidance;
use crate::control::{AttentionControl, PolicyState};
use crate::error::{MsaError, Result};
use crate::mask::{self, SpatialMask, binarize, normalize_per_sample};

/// Side length of the cross-attention reference grid. Maps are harvested
/// only from layers operating at this resolution.
pub const CROSS_ATTN_RES: usize = 16;

/// Auto-mask parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoMaskConfig {
    /// Binarization threshold for derived masks.
    pub thres: f32,
    /// Text-token positions aggregated for the source-image mask.
    pub ref_token_idx: Vec<usize>,
    /// Text-token positions aggregated for the target-image mask.
    pub cur_token_idx: Vec<usize>,
    /// Directory for per-step diagnostic mask images, if any.
    pub mask_save_dir: Option<PathBuf>,
}

impl Default for AutoMaskConfig {
    fn default() -> Self {
        Self {
            thres: 0.1,
            ref_token_idx: vec![1],
            cur_token_idx: vec![1],
            mask_save_dir: None,
        }
    }
}

/// Mutual self-attention with masks derived from cross-attention maps.
///
/// Shares the masked controller's batch precondition: each guidance half
/// carries exactly `[source, target]` samples on the active path.
#[derive(Debug, Clone)]
pub struct AutoMaskMutualSelfAttention {
    /// Step/layer counters.
    state: PolicyState,
    /// Which (step, layer) pairs substitute.
    schedule: ControlSchedule,
    /// Threshold and token-selection parameters.
    config: AutoMaskConfig,
    /// Head-averaged cross-attention maps harvested this step, each
    /// `[samples, 256, tokens]`.
    cross_attns: Vec<Tensor>,
}

impl AutoMaskMutualSelfAttention {
    /// Controller with auto-derived masks.
    ///
    /// The diagnostic directory in `config`, if any, is created eagerly;
    /// failure to create it only disables the diagnostics.
    #[must_use]
    pub fn new(schedule: ControlSchedule, num_att_layers: usize, config: AutoMaskConfig) -> Self {
        if let Some(dir) = &config.mask_save_dir {
            if let Err(err) = std::fs::create_dir_all(dir) {
                tracing::warn!(dir = %dir.display(), %err, "cannot create mask save dir");
            }
        }
        Self {
            state: PolicyState::new(schedule.total_steps(), num_att_layers),
            schedule,
            config,
            cross_attns: Vec::new(),
        }
    }

    /// Number of cross-attention maps harvested in the current step.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.cross_attns.len()
    }

    /// Whether the current invocation substitutes attention.
    fn active(&self, ctx: &AttnContext) -> bool {
        self.schedule
            .is_active(self.state.cur_step(), self.state.cur_att_layer(), ctx.is_cross)
    }

    /// Harvest a head-averaged cross-attention map when the call operates
    /// at the reference resolution.
    fn harvest(&mut self, ctx: &AttnContext) -> Result<()> {
        let (rows, spatial, tokens) = ctx.attention.dims3()?;
        if spatial != CROSS_ATTN_RES * CROSS_ATTN_RES {
            return Ok(());
        }
        if ctx.num_heads == 0 || rows % ctx.num_heads != 0 {
            return Err(MsaError::ShapeMismatch(format!(
                "attention map batch axis {rows} not divisible by num_heads {}",
                ctx.num_heads
            )));
        }
        let samples = rows / ctx.num_heads;
        let map = ctx
            .attention
            .reshape((samples, ctx.num_heads, spatial, tokens))?
            .mean(1)?;
        self.cross_attns.push(map);
        Ok(())
    }

    /// Aggregate the step's harvested maps over the given token positions.
    ///
    /// Stacks the history, averages it, reshapes to the reference grid,
    /// sums the selected token channels, and min–max normalizes each
    /// sample to `[0, 1]`.
    ///
    /// # Shapes
    /// - returns: `[samples, 16, 16]`
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::ShapeMismatch`] if the history is empty and
    /// [`MsaError::Model`] on tensor operation failures.
    fn aggregate_cross_attn_map(&self, token_idx: &[usize]) -> Result<Tensor> {
        if self.cross_attns.is_empty() {
            return Err(MsaError::ShapeMismatch(
                "no cross-attention maps harvested this step".into(),
            ));
        }
        let stacked = Tensor::stack(&self.cross_attns, 1)?; // [S, L, 256, T]
        let mean = stacked.mean(1)?;
        let (samples, _, tokens) = mean.dims3()?;
        let spatial = mean.reshape((samples, CROSS_ATTN_RES, CROSS_ATTN_RES, tokens))?;

        let idx: Vec<u32> = token_idx.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, token_idx.len(), spatial.device())?;
        let selected = spatial.index_select(&idx, 3)?.sum(3)?;
        normalize_per_sample(&selected)
    }

    /// Derive a resized per-sample mask from an aggregated map.
    ///
    /// `back_offset` counts from the end of the sample axis: 2 selects the
    /// source image's sample, 1 the target's.
    fn derive_mask(&self, token_idx: &[usize], back_offset: usize, res: usize) -> Result<SpatialMask> {
        let maps = self.aggregate_cross_attn_map(token_idx)?;
        let samples = maps.dim(0)?;
        if samples < back_offset {
            return Err(MsaError::ShapeMismatch(format!(
                "aggregated map has {samples} samples, need at least {back_offset}"
            )));
        }
        let map = maps.narrow(0, samples - back_offset, 1)?.squeeze(0)?;
        SpatialMask::new(map)?.resize(res, res)
    }

    /// Save a derived mask keyed by the current step and layer.
    fn save_diagnostic(&self, mask: &SpatialMask, prefix: &str) {
        if let Some(dir) = &self.config.mask_save_dir {
            mask.save_gray(&step_mask_path(
                dir,
                prefix,
                self.state.cur_step(),
                self.state.cur_att_layer(),
            ));
        }
    }

    /// Dual-pass target attention gated by the source-derived mask, then
    /// composited by the target-derived mask.
    fn masked_target(
        &self,
        q_tgt: &Tensor,
        k_src: &Tensor,
        v_src: &Tensor,
        sim_mask: &Tensor,
        mask_col: &Tensor,
        num_heads: usize,
        scale: f64,
    ) -> Result<Tensor> {
        let dual = attn::attn_batch_masked(q_tgt, k_src, v_src, num_heads, scale, Some(sim_mask))?;
        let fg = dual.narrow(0, 0, 1)?;
        let bg = dual.narrow(0, 1, 1)?;
        mask::composite(&fg, &bg, mask_col)
    }
}

impl AttentionControl for AutoMaskMutualSelfAttention {
    fn state(&self) -> &PolicyState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PolicyState {
        &mut self.state
    }

    fn forward(&mut self, ctx: &AttnContext) -> Result<Tensor> {
        if ctx.is_cross {
            self.harvest(ctx)?;
        }
        if !self.active(ctx) {
            return attn::passthrough(ctx);
        }

        let batch = ctx.batch()?;
        if batch != 4 {
            return Err(MsaError::ShapeMismatch(format!(
                "auto-mask control expects [uncond_src, uncond_tgt, cond_src, cond_tgt], got {batch} samples"
            )));
        }
        let res = attn::square_res(ctx.seq_len()?)?;
        let heads = ctx.num_heads;

        let (qu, qc) = split_guidance(&ctx.query)?;
        let (ku, kc) = split_guidance(&ctx.key)?;
        let (vu, vc) = split_guidance(&ctx.value)?;
        let half_rows = qu.dim(0)?;

        let q_u_src = qu.narrow(0, 0, heads)?;
        let q_u_tgt = qu.narrow(0, half_rows - heads, heads)?;
        let k_u_src = ku.narrow(0, 0, heads)?;
        let v_u_src = vu.narrow(0, 0, heads)?;
        let q_c_src = qc.narrow(0, 0, heads)?;
        let q_c_tgt = qc.narrow(0, half_rows - heads, heads)?;
        let k_c_src = kc.narrow(0, 0, heads)?;
        let v_c_src = vc.narrow(0, 0, heads)?;

        let out_u_src = attn::attn_batch(&q_u_src, &k_u_src, &v_u_src, heads, ctx.scale)?;
        let out_c_src = attn::attn_batch(&q_c_src, &k_c_src, &v_c_src, heads, ctx.scale)?;

        let (out_u_tgt, out_c_tgt) = if self.cross_attns.is_empty() {
            // First active call of the step: nothing harvested yet, so this
            // degenerates to plain mutual control.
            (
                attn::attn_batch(&q_u_tgt, &k_u_src, &v_u_src, heads, ctx.scale)?,
                attn::attn_batch(&q_c_tgt, &k_c_src, &v_c_src, heads, ctx.scale)?,
            )
        } else {
            let src_mask = self.derive_mask(&self.config.ref_token_idx, 2, res)?;
            self.save_diagnostic(&src_mask, "mask_s");
            let sim_mask = binarize(&src_mask.flat()?, self.config.thres)?;

            let tgt_mask = self.derive_mask(&self.config.cur_token_idx, 1, res)?;
            self.save_diagnostic(&tgt_mask, "mask_t");
            let mask_col = tgt_mask
                .threshold(self.config.thres)?
                .column()?
                .to_dtype(ctx.query.dtype())?;

            (
                self.masked_target(
                    &q_u_tgt, &k_u_src, &v_u_src, &sim_mask, &mask_col, heads, ctx.scale,
                )?,
                self.masked_target(
                    &q_c_tgt, &k_c_src, &v_c_src, &sim_mask, &mask_col, heads, ctx.scale,
                )?,
            )
        };

        // Downstream consumers rely on this exact batch ordering.
        Ok(Tensor::cat(
            &[&out_u_src, &out_u_tgt, &out_c_src, &out_c_tgt],
            0,
        )?)
    }

    /// Cross-attention history is per-step state.
    fn after_step(&mut self) {
        self.cross_attns.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::UnetPlace;
    use crate::control::MutualSelfAttention;
    use candle_core::{DType, Device};

    fn seeded_tensor(shape: (usize, usize, usize), offset: f32) -> Tensor {
        let len = shape.0 * shape.1 * shape.2;
        let data: Vec<f32> = (0..len)
            .map(|n| ((n as f32) * 0.17 + offset).sin() * 0.5 + 0.5)
            .collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let diff = (a - b).unwrap().abs().unwrap().flatten_all().unwrap();
        diff.max(0).unwrap().to_scalar::<f32>().unwrap()
    }

    /// Self-attention context: 4 samples, 1 head, 2x2 grid.
    fn self_ctx() -> AttnContext {
        let q = seeded_tensor((4, 4, 3), 0.0);
        let k = seeded_tensor((4, 4, 3), 1.0);
        let v = seeded_tensor((4, 4, 3), 2.0);
        let maps = Tensor::zeros((4, 4, 4), DType::F32, &Device::Cpu).unwrap();
        AttnContext::new(q, k, v, maps.clone(), maps, false, UnetPlace::Up, 1, 0.6).unwrap()
    }

    /// Cross-attention context at the 16x16 reference resolution with
    /// `tokens` text tokens.
    fn cross_ctx(tokens: usize, spatial: usize) -> AttnContext {
        let q = seeded_tensor((4, spatial, 3), 0.0);
        let kv = seeded_tensor((4, tokens, 3), 1.0);
        let maps = seeded_tensor((4, spatial, tokens), 2.0);
        AttnContext::new(
            q,
            kv.clone(),
            kv,
            maps.clone(),
            maps,
            true,
            UnetPlace::Mid,
            1,
            0.6,
        )
        .unwrap()
    }

    fn controller(config: AutoMaskConfig) -> AutoMaskMutualSelfAttention {
        let schedule = ControlSchedule::new(0, 0, 50).unwrap();
        AutoMaskMutualSelfAttention::new(schedule, 32, config)
    }

    #[test]
    fn harvests_only_reference_resolution() {
        let mut ctrl = controller(AutoMaskConfig::default());
        ctrl.forward(&cross_ctx(3, 256)).unwrap();
        assert_eq!(ctrl.history_len(), 1);
        ctrl.forward(&cross_ctx(3, 64)).unwrap();
        assert_eq!(ctrl.history_len(), 1);
        ctrl.forward(&cross_ctx(3, 256)).unwrap();
        assert_eq!(ctrl.history_len(), 2);
    }

    #[test]
    fn empty_history_matches_plain_mutual_control() {
        let ctx = self_ctx();
        let mut auto_ctrl = controller(AutoMaskConfig::default());
        let mut mutual = MutualSelfAttention::new(ControlSchedule::new(0, 0, 50).unwrap(), 32);

        let out_auto = auto_ctrl.forward(&ctx).unwrap();
        let out_mutual = mutual.forward(&ctx).unwrap();
        assert_eq!(out_auto.dims(), out_mutual.dims());
        assert!(max_abs_diff(&out_auto, &out_mutual) < 1e-6);
    }

    #[test]
    fn zero_threshold_reduces_to_plain_mutual_control() {
        // With thres = 0 both derived masks binarize to all ones: the
        // foreground pass sees a constant similarity shift and the
        // composite selects it wholesale.
        let ctx = self_ctx();
        let config = AutoMaskConfig {
            thres: 0.0,
            ..AutoMaskConfig::default()
        };
        let mut auto_ctrl = controller(config);
        auto_ctrl.forward(&cross_ctx(3, 256)).unwrap();
        assert_eq!(auto_ctrl.history_len(), 1);

        let mut mutual = MutualSelfAttention::new(ControlSchedule::new(0, 0, 50).unwrap(), 32);
        let out_auto = auto_ctrl.forward(&ctx).unwrap();
        let out_mutual = mutual.forward(&ctx).unwrap();
        assert!(max_abs_diff(&out_auto, &out_mutual) < 1e-5);
    }

    #[test]
    fn masked_step_produces_expected_shape() {
        let mut ctrl = controller(AutoMaskConfig::default());
        ctrl.forward(&cross_ctx(3, 256)).unwrap();
        let out = ctrl.forward(&self_ctx()).unwrap();
        assert_eq!(out.dims(), &[4, 4, 3]);
    }

    #[test]
    fn after_step_clears_history() {
        // One attention call per step: every advance is a step boundary.
        let schedule = ControlSchedule::new(0, 0, 50).unwrap();
        let mut ctrl = AutoMaskMutualSelfAttention::new(schedule, 1, AutoMaskConfig::default());
        ctrl.forward(&cross_ctx(3, 256)).unwrap();
        assert_eq!(ctrl.history_len(), 1);
        ctrl.advance();
        assert_eq!(ctrl.history_len(), 0);
        assert_eq!(ctrl.state().cur_step(), 1);
    }

    #[test]
    fn diagnostic_masks_written_per_step_and_layer() {
        let dir = std::env::temp_dir().join("candle-msa-auto-mask-test");
        let _ = std::fs::remove_dir_all(&dir);
        let config = AutoMaskConfig {
            mask_save_dir: Some(dir.clone()),
            ..AutoMaskConfig::default()
        };
        let mut ctrl = controller(config);
        ctrl.forward(&cross_ctx(3, 256)).unwrap();
        ctrl.advance();
        ctrl.forward(&self_ctx()).unwrap();
        assert!(dir.join("mask_s_0_1.png").exists());
        assert!(dir.join("mask_t_0_1.png").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn wrong_sample_count_is_fatal() {
        let q = seeded_tensor((2, 4, 3), 0.0);
        let maps = Tensor::zeros((2, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let ctx = AttnContext::new(
            q.clone(),
            q.clone(),
            q,
            maps.clone(),
            maps,
            false,
            UnetPlace::Up,
            1,
            0.6,
        )
        .unwrap();
        let mut ctrl = controller(AutoMaskConfig::default());
        assert!(matches!(
            ctrl.forward(&ctx),
            Err(MsaError::ShapeMismatch(_))
        ));
    }
}
