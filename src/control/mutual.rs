// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mutual self-attention control.
//!
//! At scheduled (step, layer) pairs the source image's keys and values
//! replace each branch's own: the batch splits into its unconditional and
//! conditional halves, and within each half every sample's queries attend
//! over the source sample's keys/values. Structure from the source
//! generation transfers to the target generation while the target prompt
//! still drives content.

use candle_core::Tensor;

use crate::attn;
use crate::config::ControlSchedule;
use crate::context::AttnContext;
use crate::control::{AttentionControl, PolicyState};
use crate::error::{MsaError, Result};

/// Split the batch axis into its unconditional and conditional halves.
///
/// # Errors
///
/// Returns [`MsaError::ShapeMismatch`] on an odd leading axis — guidance
/// duality requires every sample twice.
pub(crate) fn split_guidance(t: &Tensor) -> Result<(Tensor, Tensor)> {
    let rows = t.dim(0)?;
    if rows % 2 != 0 {
        return Err(MsaError::ShapeMismatch(format!(
            "batch axis {rows} cannot split into guidance halves"
        )));
    }
    let half = rows / 2;
    Ok((t.narrow(0, 0, half)?, t.narrow(0, half, half)?))
}

/// Mutual self-attention controller.
///
/// # Example
///
/// ```
/// use candle_msa::{ATTN_CALLS_PER_STEP, ControlSchedule, MutualSelfAttention};
///
/// let schedule = ControlSchedule::new(4, 10, 50).unwrap();
/// let controller = MutualSelfAttention::new(schedule, ATTN_CALLS_PER_STEP);
/// ```
#[derive(Debug, Clone)]
pub struct MutualSelfAttention {
    /// Step/layer counters.
    state: PolicyState,
    /// Which (step, layer) pairs substitute.
    schedule: ControlSchedule,
}

impl MutualSelfAttention {
    /// Controller with the given activation schedule and `num_att_layers`
    /// attention invocations per denoising step.
    #[must_use]
    pub fn new(schedule: ControlSchedule, num_att_layers: usize) -> Self {
        Self {
            state: PolicyState::new(schedule.total_steps(), num_att_layers),
            schedule,
        }
    }

    /// The activation schedule.
    #[must_use]
    pub const fn schedule(&self) -> &ControlSchedule {
        &self.schedule
    }

    /// Whether the current invocation substitutes attention.
    pub(crate) fn active(&self, ctx: &AttnContext) -> bool {
        self.schedule
            .is_active(self.state.cur_step(), self.state.cur_att_layer(), ctx.is_cross)
    }

    /// Substitute one guidance half: all queries in the half attend over
    /// the source sample's keys/values (its first `num_heads` rows).
    fn mutual_half(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        num_heads: usize,
        scale: f64,
    ) -> Result<Tensor> {
        let rows = k.dim(0)?;
        if rows < num_heads || rows % num_heads != 0 {
            return Err(MsaError::ShapeMismatch(format!(
                "guidance half of {rows} rows cannot carry a {num_heads}-head source sample"
            )));
        }
        let k_src = k.narrow(0, 0, num_heads)?;
        let v_src = v.narrow(0, 0, num_heads)?;
        attn::attn_batch(q, &k_src, &v_src, num_heads, scale)
    }
}

impl AttentionControl for MutualSelfAttention {
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

        let (qu, qc) = split_guidance(&ctx.query)?;
        let (ku, kc) = split_guidance(&ctx.key)?;
        let (vu, vc) = split_guidance(&ctx.value)?;

        let out_u = Self::mutual_half(&qu, &ku, &vu, ctx.num_heads, ctx.scale)?;
        let out_c = Self::mutual_half(&qc, &kc, &vc, ctx.num_heads, ctx.scale)?;
        Ok(Tensor::cat(&[&out_u, &out_c], 0)?)
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
    use candle_core::{DType, Device};

    fn seeded_tensor(shape: (usize, usize, usize), offset: f32) -> Tensor {
        let len = shape.0 * shape.1 * shape.2;
        let data: Vec<f32> = (0..len)
            .map(|n| ((n as f32) * 0.23 + offset).sin())
            .collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let diff = (a - b).unwrap().abs().unwrap().flatten_all().unwrap();
        diff.max(0).unwrap().to_scalar::<f32>().unwrap()
    }

    /// One source+target pair under guidance duality: 2 samples per half,
    /// 8 heads, so 2 · 2 · 8 = 32 rows.
    fn paired_ctx(is_cross: bool) -> AttnContext {
        let q = seeded_tensor((32, 6, 5), 0.0);
        let k = seeded_tensor((32, 6, 5), 1.0);
        let v = seeded_tensor((32, 6, 5), 2.0);
        let maps = Tensor::zeros((32, 6, 6), DType::F32, &Device::Cpu).unwrap();
        AttnContext::new(q, k, v, maps.clone(), maps, is_cross, UnetPlace::Up, 8, 0.4).unwrap()
    }

    fn always_on() -> MutualSelfAttention {
        let schedule = ControlSchedule::new(0, 0, 50).unwrap();
        MutualSelfAttention::new(schedule, 32)
    }

    #[test]
    fn inactive_step_matches_passthrough_exactly() {
        // Step 0 is outside the default 4.. schedule: identical math, no
        // substitution.
        let schedule = ControlSchedule::default();
        let mut controller = MutualSelfAttention::new(schedule, 32);
        let ctx = paired_ctx(false);
        let out = controller.forward(&ctx).unwrap();
        let reference = crate::attn::passthrough(&ctx).unwrap();
        assert_eq!(max_abs_diff(&out, &reference), 0.0);
    }

    #[test]
    fn cross_attention_never_substitutes() {
        let mut controller = always_on();
        let ctx = paired_ctx(true);
        let out = controller.forward(&ctx).unwrap();
        let reference = crate::attn::passthrough(&ctx).unwrap();
        assert_eq!(max_abs_diff(&out, &reference), 0.0);
    }

    #[test]
    fn single_pair_substitution_shape_and_source_kv() {
        // headCount=8, (16, N, D) with one uncond+cond pair.
        let q = seeded_tensor((16, 4, 3), 0.0);
        let k = seeded_tensor((16, 4, 3), 1.0);
        let v = seeded_tensor((16, 4, 3), 2.0);
        let maps = Tensor::zeros((16, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let ctx = AttnContext::new(
            q.clone(),
            k.clone(),
            v.clone(),
            maps.clone(),
            maps,
            false,
            UnetPlace::Up,
            8,
            0.4,
        )
        .unwrap();

        let mut controller = always_on();
        let out = controller.forward(&ctx).unwrap();
        // Per-head axis folds into the feature axis: one sample per half.
        assert_eq!(out.dims(), &[2, 4, 24]);

        // Each half must be computed from only the first 8 rows of its
        // half's key/value.
        let qu = q.narrow(0, 0, 8).unwrap();
        let ku = k.narrow(0, 0, 8).unwrap();
        let vu = v.narrow(0, 0, 8).unwrap();
        let expect_u = crate::attn::attn_batch(&qu, &ku, &vu, 8, 0.4).unwrap();
        assert!(max_abs_diff(&out.narrow(0, 0, 1).unwrap(), &expect_u) < 1e-6);

        let qc = q.narrow(0, 8, 8).unwrap();
        let kc = k.narrow(0, 8, 8).unwrap();
        let vc = v.narrow(0, 8, 8).unwrap();
        let expect_c = crate::attn::attn_batch(&qc, &kc, &vc, 8, 0.4).unwrap();
        assert!(max_abs_diff(&out.narrow(0, 1, 1).unwrap(), &expect_c) < 1e-6);
    }

    #[test]
    fn target_queries_attend_over_source_keys() {
        // Two samples per half: the target sample's output changes when the
        // source keys/values change, proving the substitution.
        let ctx = paired_ctx(false);
        let mut controller = always_on();
        let out = controller.forward(&ctx).unwrap();
        assert_eq!(out.dims(), &[4, 6, 40]);

        // Recompute the uncond half by hand with pooled source kv.
        let qu = ctx.query.narrow(0, 0, 16).unwrap();
        let ku_src = ctx.key.narrow(0, 0, 8).unwrap();
        let vu_src = ctx.value.narrow(0, 0, 8).unwrap();
        let expect = crate::attn::attn_batch(&qu, &ku_src, &vu_src, 8, 0.4).unwrap();
        assert!(max_abs_diff(&out.narrow(0, 0, 2).unwrap(), &expect) < 1e-6);
    }

    #[test]
    fn odd_batch_is_fatal() {
        let q = seeded_tensor((8, 4, 3), 0.0);
        let maps = Tensor::zeros((8, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let ctx = AttnContext::new(
            q.clone(),
            q.clone(),
            q,
            maps.clone(),
            maps,
            false,
            UnetPlace::Down,
            8,
            1.0,
        )
        .unwrap();
        // 8 rows with 8 heads: a single sample, no guidance pair.
        let mut controller = always_on();
        assert!(matches!(
            controller.forward(&ctx),
            Err(MsaError::ShapeMismatch(_))
        ));
    }
}
