// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention-control policies and their step/layer bookkeeping.
//!
//! Every policy implements [`AttentionControl`]: the denoising loop owns
//! exactly one policy instance per generation run, calls
//! [`forward`](AttentionControl::forward) in place of its default attention
//! at every layer invocation, and calls
//! [`advance`](AttentionControl::advance) immediately after. When the
//! layer counter wraps, the policy's
//! [`after_step`](AttentionControl::after_step) hook runs so per-step
//! caches can be cleared.
//!
//! - [`AttentionPassthrough`] — the null policy (standard attention).
//! - [`MutualSelfAttention`] — source keys/values applied to all queries.
//! - [`MaskedMutualSelfAttention`] — static foreground/background masks.
//! - [`AutoMaskMutualSelfAttention`] — masks derived from cross-attention.
//! - [`VideoSelfAttention`] — extra-axis batching, optional streamed path.

mod auto_mask;
mod masked;
mod mutual;
mod video;

pub use auto_mask::{AutoMaskConfig, AutoMaskMutualSelfAttention, CROSS_ATTN_RES};
pub use masked::MaskedMutualSelfAttention;
pub use mutual::MutualSelfAttention;
pub use video::VideoSelfAttention;

use candle_core::Tensor;

use crate::attn;
use crate::context::AttnContext;
use crate::error::Result;

// ---------------------------------------------------------------------------
// PolicyState
// ---------------------------------------------------------------------------

/// Step and layer counters for one denoising run.
///
/// `cur_att_layer` counts raw attention invocations within the current
/// step and wraps at `num_att_layers`; the wrap increments `cur_step`.
/// Counters are mutated non-atomically — one policy instance must never be
/// shared across concurrent runs.
#[derive(Debug, Clone)]
pub struct PolicyState {
    /// Current denoising step, `[0, total_steps)`.
    cur_step: usize,
    /// Current attention-layer invocation within the step.
    cur_att_layer: usize,
    /// Attention invocations per denoising step.
    num_att_layers: usize,
    /// Total denoising steps in the run.
    total_steps: usize,
}

impl PolicyState {
    /// Fresh counters for a run of `total_steps` steps with
    /// `num_att_layers` attention invocations per step.
    #[must_use]
    pub const fn new(total_steps: usize, num_att_layers: usize) -> Self {
        Self {
            cur_step: 0,
            cur_att_layer: 0,
            num_att_layers,
            total_steps,
        }
    }

    /// Current denoising step.
    #[must_use]
    pub const fn cur_step(&self) -> usize {
        self.cur_step
    }

    /// Current raw attention-layer invocation within the step.
    #[must_use]
    pub const fn cur_att_layer(&self) -> usize {
        self.cur_att_layer
    }

    /// Total denoising steps in the run.
    #[must_use]
    pub const fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Record one completed attention invocation.
    ///
    /// Returns `true` when the layer counter wrapped, i.e. a full
    /// denoising step just finished.
    pub const fn advance(&mut self) -> bool {
        self.cur_att_layer += 1;
        if self.num_att_layers > 0 && self.cur_att_layer == self.num_att_layers {
            self.cur_att_layer = 0;
            self.cur_step += 1;
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// AttentionControl
// ---------------------------------------------------------------------------

/// Interface between the denoising loop and an attention policy.
///
/// The loop calls [`forward`](Self::forward) once per attention-layer
/// invocation and [`advance`](Self::advance) right after; `advance` runs
/// the [`after_step`](Self::after_step) hook at step boundaries. The
/// policies form a closed set selected by explicit construction.
pub trait AttentionControl {
    /// Read access to the step/layer counters.
    fn state(&self) -> &PolicyState;

    /// Mutable access to the step/layer counters.
    fn state_mut(&mut self) -> &mut PolicyState;

    /// Compute the attention output for one invocation.
    ///
    /// Returns `[batch, seq, heads · head_dim]` — either the passthrough
    /// recomputation or the policy's substituted output.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::ShapeMismatch`](crate::MsaError::ShapeMismatch)
    /// on layout violations and
    /// [`MsaError::Model`](crate::MsaError::Model) on tensor failures.
    fn forward(&mut self, ctx: &AttnContext) -> Result<Tensor>;

    /// Hook invoked at the end of each full denoising step.
    fn after_step(&mut self) {}

    /// Notification from the loop that one layer invocation completed.
    fn advance(&mut self) {
        if self.state_mut().advance() {
            self.after_step();
        }
    }
}

// ---------------------------------------------------------------------------
// AttentionPassthrough
// ---------------------------------------------------------------------------

/// The null policy: standard scaled dot-product attention, no substitution.
#[derive(Debug, Clone)]
pub struct AttentionPassthrough {
    /// Step/layer counters.
    state: PolicyState,
}

impl AttentionPassthrough {
    /// Null policy for a run of `total_steps` steps with `num_att_layers`
    /// attention invocations per step.
    #[must_use]
    pub const fn new(total_steps: usize, num_att_layers: usize) -> Self {
        Self {
            state: PolicyState::new(total_steps, num_att_layers),
        }
    }
}

impl AttentionControl for AttentionPassthrough {
    fn state(&self) -> &PolicyState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PolicyState {
        &mut self.state
    }

    fn forward(&mut self, ctx: &AttnContext) -> Result<Tensor> {
        attn::passthrough(ctx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
