// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mutual self-attention control across an extra batch axis.
//!
//! Generalizes the mutual fold to batches of independent sequences — e.g.
//! several videos, each contributing a frame (or view) axis. The leading
//! axis is laid out `(video, frame, head)`; folding moves the video axis
//! into the sequence so one dense attention covers every video and frame
//! while each head group only mixes tokens pooled from its own video slot.
//!
//! The attention itself runs through the [`AttnBackend`] chosen once at
//! startup: dense, or the chunked memory-efficient path.

use candle_core::Tensor;

use crate::attn;
use crate::backend::AttnBackend;
use crate::config::ControlSchedule;
use crate::context::AttnContext;
use crate::control::{AttentionControl, PolicyState};
use crate::error::{MsaError, Result};

/// Fold `[(b · x · h), n, d]` into `[(x · h), (b · n), d]`.
///
/// `x` (frames or views per video) is supplied by the caller; the video
/// count `b` is inferred from the leading axis.
///
/// # Errors
///
/// Returns [`MsaError::ShapeMismatch`] if the leading axis is not
/// divisible by `x · num_heads`.
pub(crate) fn fold_video(t: &Tensor, num_heads: usize, x: usize) -> Result<Tensor> {
    let (rows, n, d) = t.dims3()?;
    let group = x * num_heads;
    if group == 0 || rows % group != 0 {
        return Err(MsaError::ShapeMismatch(format!(
            "cannot fold {rows} rows into {x} frames of {num_heads} heads"
        )));
    }
    let b = rows / group;
    let folded = t
        .reshape((b, x, num_heads, n, d))?
        .permute((1, 2, 0, 3, 4))?
        .contiguous()?
        .reshape((group, b * n, d))?;
    Ok(folded)
}

/// Unfold `[(x · h), (b · n), d]` into `[(b · x), n, (h · d)]`.
///
/// # Errors
///
/// Returns [`MsaError::ShapeMismatch`] on inconsistent axis sizes.
pub(crate) fn unfold_video(t: &Tensor, b: usize, x: usize, num_heads: usize) -> Result<Tensor> {
    let (xh, bn, d) = t.dims3()?;
    if xh != x * num_heads || b == 0 || bn % b != 0 {
        return Err(MsaError::ShapeMismatch(format!(
            "cannot unfold [{xh}, {bn}, {d}] into {b} videos of {x} frames with {num_heads} heads"
        )));
    }
    let n = bn / b;
    let out = t
        .reshape((x, num_heads, b, n, d))?
        .permute((2, 0, 3, 1, 4))?
        .contiguous()?
        .reshape((b * x, n, num_heads * d))?;
    Ok(out)
}

/// Mutual self-attention controller for batches with a frame/view axis.
#[derive(Debug, Clone)]
pub struct VideoSelfAttention {
    /// Step/layer counters.
    state: PolicyState,
    /// Which (step, layer) pairs substitute.
    schedule: ControlSchedule,
    /// Number of independent sequences (videos) in the batch.
    extra_axis: usize,
    /// Attention execution path, resolved once at startup.
    backend: AttnBackend,
}

impl VideoSelfAttention {
    /// Controller for `extra_axis` independent sequences per batch.
    ///
    /// `backend` comes from [`AttnBackend::probe`] (or an explicit choice)
    /// performed once at process start.
    #[must_use]
    pub fn new(
        schedule: ControlSchedule,
        num_att_layers: usize,
        extra_axis: usize,
        backend: AttnBackend,
    ) -> Self {
        Self {
            state: PolicyState::new(schedule.total_steps(), num_att_layers),
            schedule,
            extra_axis,
            backend,
        }
    }

    /// Whether the current invocation substitutes attention.
    fn active(&self, ctx: &AttnContext) -> bool {
        self.schedule
            .is_active(self.state.cur_step(), self.state.cur_att_layer(), ctx.is_cross)
    }
}

impl AttentionControl for VideoSelfAttention {
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

        ctx.check_group_divisibility(self.extra_axis * ctx.num_heads)?;
        let rows = ctx.query.dim(0)?;
        let x = rows / (self.extra_axis * ctx.num_heads);
        // First video slot's rows across all of its frames and heads.
        let slice_len = rows / self.extra_axis;
        let k_src = ctx.key.narrow(0, 0, slice_len)?;
        let v_src = ctx.value.narrow(0, 0, slice_len)?;

        let q = fold_video(&ctx.query, ctx.num_heads, x)?;
        let k = fold_video(&k_src, ctx.num_heads, x)?;
        let v = fold_video(&v_src, ctx.num_heads, x)?;

        let out = self.backend.attention(&q, &k, &v, ctx.scale)?;
        unfold_video(&out, self.extra_axis, x, ctx.num_heads)
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
            .map(|n| ((n as f32) * 0.29 + offset).sin())
            .collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let diff = (a - b).unwrap().abs().unwrap().flatten_all().unwrap();
        diff.max(0).unwrap().to_scalar::<f32>().unwrap()
    }

    /// 2 videos x 2 frames x 2 heads = 8 rows.
    fn video_ctx() -> AttnContext {
        let q = seeded_tensor((8, 3, 2), 0.0);
        let k = seeded_tensor((8, 3, 2), 1.0);
        let v = seeded_tensor((8, 3, 2), 2.0);
        let maps = Tensor::zeros((8, 3, 3), DType::F32, &Device::Cpu).unwrap();
        AttnContext::new(q, k, v, maps.clone(), maps, false, UnetPlace::Down, 2, 0.5).unwrap()
    }

    fn controller(extra_axis: usize, backend: AttnBackend) -> VideoSelfAttention {
        let schedule = ControlSchedule::new(0, 0, 50).unwrap();
        VideoSelfAttention::new(schedule, 32, extra_axis, backend)
    }

    #[test]
    fn fold_roundtrip_is_pure_permutation() {
        let t = seeded_tensor((12, 3, 2), 0.0); // b=2, x=3, h=2
        let folded = fold_video(&t, 2, 3).unwrap();
        assert_eq!(folded.dims(), &[6, 6, 2]);
        // Invert by hand: [(x h), (b n), d] -> [(b x h), n, d]
        let back = folded
            .reshape((3, 2, 2, 3, 2))
            .unwrap()
            .permute((2, 0, 1, 3, 4))
            .unwrap()
            .contiguous()
            .unwrap()
            .reshape((12, 3, 2))
            .unwrap();
        assert_eq!(max_abs_diff(&t, &back), 0.0);
    }

    #[test]
    fn indivisible_rows_are_fatal() {
        let ctx = video_ctx(); // 8 rows, 2 heads
        let mut ctrl = controller(3, AttnBackend::Dense); // 3 * 2 does not divide 8
        assert!(matches!(
            ctrl.forward(&ctx),
            Err(MsaError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn substitution_uses_first_video_kv() {
        let ctx = video_ctx();
        let mut ctrl = controller(2, AttnBackend::Dense);
        let out = ctrl.forward(&ctx).unwrap();
        assert_eq!(out.dims(), &[4, 3, 4]); // (b x, n, h d)

        // Manual: fold q over both videos, kv over video 0 only.
        let k_src = ctx.key.narrow(0, 0, 4).unwrap();
        let v_src = ctx.value.narrow(0, 0, 4).unwrap();
        let qf = fold_video(&ctx.query, 2, 2).unwrap();
        let kf = fold_video(&k_src, 2, 2).unwrap();
        let vf = fold_video(&v_src, 2, 2).unwrap();
        let expect = crate::attn::sdpa(&qf, &kf, &vf, 0.5).unwrap();
        let expect = unfold_video(&expect, 2, 2, 2).unwrap();
        assert!(max_abs_diff(&out, &expect) < 1e-6);
    }

    #[test]
    fn dense_and_streamed_paths_agree() {
        let ctx = video_ctx();
        let mut dense = controller(2, AttnBackend::Dense);
        let mut streamed = controller(2, AttnBackend::MemoryEfficient);
        let a = dense.forward(&ctx).unwrap();
        let b = streamed.forward(&ctx).unwrap();
        assert_eq!(a.dims(), b.dims());
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn inactive_matches_passthrough() {
        let schedule = ControlSchedule::default(); // step 0 inactive
        let mut ctrl = VideoSelfAttention::new(schedule, 32, 2, AttnBackend::Dense);
        let ctx = video_ctx();
        let out = ctrl.forward(&ctx).unwrap();
        let reference = crate::attn::passthrough(&ctx).unwrap();
        assert_eq!(max_abs_diff(&out, &reference), 0.0);
    }
}
