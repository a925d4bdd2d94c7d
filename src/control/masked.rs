// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mask-guided mutual self-attention control.
//!
//! Plain mutual control can confuse foreground and background when the
//! edited object moves. This controller takes user-supplied source and
//! target region masks and computes two attention passes for the target —
//! one restricted to the source foreground, one to its background — then
//! composites the pair by the target mask at each layer's resolution.

use std::path::{Path, PathBuf};

use candle_core::Tensor;

use crate::attn;
use crate::config::ControlSchedule;
use crate::context::AttnContext;
use crate::control::mutual::split_guidance;
use crate::control::{AttentionControl, PolicyState};
use crate::error::{MsaError, Result};
use crate::mask::{self, SpatialMask};

/// Mutual self-attention with static foreground/background masks.
///
/// Precondition on the active path: each guidance half carries exactly two
/// samples — the source image first, the target image second. Other batch
/// layouts are rejected with a shape error.
#[derive(Debug, Clone)]
pub struct MaskedMutualSelfAttention {
    /// Step/layer counters.
    state: PolicyState,
    /// Which (step, layer) pairs substitute.
    schedule: ControlSchedule,
    /// Source-image region mask.
    mask_s: SpatialMask,
    /// Target-image region mask.
    mask_t: SpatialMask,
}

impl MaskedMutualSelfAttention {
    /// Controller with static masks.
    ///
    /// When `mask_save_dir` is given, both masks are written there once as
    /// `mask_s.png` / `mask_t.png` — diagnostic only, best-effort.
    #[must_use]
    pub fn new(
        schedule: ControlSchedule,
        num_att_layers: usize,
        mask_s: SpatialMask,
        mask_t: SpatialMask,
        mask_save_dir: Option<&Path>,
    ) -> Self {
        if let Some(dir) = mask_save_dir {
            save_static_masks(dir, &mask_s, &mask_t);
        }
        Self {
            state: PolicyState::new(schedule.total_steps(), num_att_layers),
            schedule,
            mask_s,
            mask_t,
        }
    }

    /// Whether the current invocation substitutes attention.
    fn active(&self, ctx: &AttnContext) -> bool {
        self.schedule
            .is_active(self.state.cur_step(), self.state.cur_att_layer(), ctx.is_cross)
    }

    /// Substitute one guidance half of `[source, target]` samples.
    ///
    /// The source keeps plain mutual attention; the target gets the dual
    /// foreground/background passes against the source mask, composited by
    /// the target mask.
    fn masked_half(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        num_heads: usize,
        scale: f64,
        res: usize,
    ) -> Result<(Tensor, Tensor)> {
        let rows = q.dim(0)?;
        let k_src = k.narrow(0, 0, num_heads)?;
        let v_src = v.narrow(0, 0, num_heads)?;
        let q_src = q.narrow(0, 0, num_heads)?;
        let q_tgt = q.narrow(0, rows - num_heads, num_heads)?;

        let out_src = attn::attn_batch(&q_src, &k_src, &v_src, num_heads, scale)?;

        let sim_mask = self.mask_s.resize(res, res)?.flat()?;
        let dual = attn::attn_batch_masked(&q_tgt, &k_src, &v_src, num_heads, scale, Some(&sim_mask))?;
        let fg = dual.narrow(0, 0, 1)?;
        let bg = dual.narrow(0, 1, 1)?;

        let mask_col = self
            .mask_t
            .resize(res, res)?
            .column()?
            .to_dtype(fg.dtype())?;
        let out_tgt = mask::composite(&fg, &bg, &mask_col)?;
        Ok((out_src, out_tgt))
    }
}

impl AttentionControl for MaskedMutualSelfAttention {
    fn state(&self) -> &PolicyState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PolicyState {
        &mut self.state
    }

    fn forward(&mut self, ctx: &AttnContext) -> Result<Tensor> {
        if !self.active(ctx) {
            return attn::passthrough(ctx);
        }

        let batch = ctx.batch()?;
        if batch != 4 {
            return Err(MsaError::ShapeMismatch(format!(
                "masked control expects [uncond_src, uncond_tgt, cond_src, cond_tgt], got {batch} samples"
            )));
        }
        let res = attn::square_res(ctx.seq_len()?)?;

        let (qu, qc) = split_guidance(&ctx.query)?;
        let (ku, kc) = split_guidance(&ctx.key)?;
        let (vu, vc) = split_guidance(&ctx.value)?;

        let (out_u_src, out_u_tgt) =
            self.masked_half(&qu, &ku, &vu, ctx.num_heads, ctx.scale, res)?;
        let (out_c_src, out_c_tgt) =
            self.masked_half(&qc, &kc, &vc, ctx.num_heads, ctx.scale, res)?;

        // Downstream consumers rely on this exact batch ordering.
        Ok(Tensor::cat(
            &[&out_u_src, &out_u_tgt, &out_c_src, &out_c_tgt],
            0,
        )?)
    }
}

/// Write both static masks into `dir`, creating it if needed.
/// Best-effort: failures are logged and swallowed.
fn save_static_masks(dir: &Path, mask_s: &SpatialMask, mask_t: &SpatialMask) {
    if let Err(err) = std::fs::create_dir_all(dir) {
        tracing::warn!(dir = %dir.display(), %err, "cannot create mask save dir");
        return;
    }
    mask_s.save_gray(&dir.join("mask_s.png"));
    mask_t.save_gray(&dir.join("mask_t.png"));
}

/// Join helper for per-step diagnostic file names, shared with the
/// auto-mask controller.
pub(crate) fn step_mask_path(dir: &Path, prefix: &str, step: usize, layer: usize) -> PathBuf {
    dir.join(format!("{prefix}_{step}_{layer}.png"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
