// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention math shared by all controllers.
//!
//! The call site hands tensors in head-flattened layout
//! `[(batch · heads), seq, head_dim]`. The mutual-control primitives fold
//! the batch into the sequence axis per head group so one dense attention
//! covers the combined sequence, then unfold back to the caller's
//! `[batch, seq, heads · head_dim]` output layout.

use candle_core::{DType, Tensor};

use crate::context::AttnContext;
use crate::error::{MsaError, Result};

// ---------------------------------------------------------------------------
// Layout folds
// ---------------------------------------------------------------------------

/// Fold `[(b · h), n, d]` into head-major `[h, (b · n), d]`.
///
/// # Errors
///
/// Returns [`MsaError::ShapeMismatch`] if the leading axis is not divisible
/// by `num_heads`.
pub(crate) fn fold_heads(t: &Tensor, num_heads: usize) -> Result<Tensor> {
    let (rows, n, d) = t.dims3()?;
    if num_heads == 0 || rows % num_heads != 0 {
        return Err(MsaError::ShapeMismatch(format!(
            "cannot fold {rows} rows into {num_heads} heads"
        )));
    }
    let b = rows / num_heads;
    let folded = t
        .reshape((b, num_heads, n, d))?
        .permute((1, 0, 2, 3))?
        .contiguous()?
        .reshape((num_heads, b * n, d))?;
    Ok(folded)
}

/// Unfold `[(g · h), (b · n), d]` into `[(g · b), n, (h · d)]`.
///
/// `g` is the number of stacked attention variants (1 for plain attention,
/// 2 when foreground/background similarity variants are stacked).
///
/// # Errors
///
/// Returns [`MsaError::ShapeMismatch`] on inconsistent axis sizes.
pub(crate) fn unfold_heads(t: &Tensor, num_heads: usize, batch: usize) -> Result<Tensor> {
    let (gh, bn, d) = t.dims3()?;
    if num_heads == 0 || gh % num_heads != 0 || batch == 0 || bn % batch != 0 {
        return Err(MsaError::ShapeMismatch(format!(
            "cannot unfold [{gh}, {bn}, {d}] with {num_heads} heads and batch {batch}"
        )));
    }
    let g = gh / num_heads;
    let n = bn / batch;
    let out = t
        .reshape((g, num_heads, batch, n, d))?
        .permute((0, 2, 3, 1, 4))?
        .contiguous()?
        .reshape((g * batch, n, num_heads * d))?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Scaled dot-product attention
// ---------------------------------------------------------------------------

/// Softmax over the last axis, promoted to F32.
///
/// PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32.
pub(crate) fn softmax_f32(scores: &Tensor) -> Result<Tensor> {
    let original_dtype = scores.dtype();
    if original_dtype == DType::F32 {
        return Ok(candle_nn::ops::softmax_last_dim(scores)?);
    }
    let pattern = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?;
    Ok(pattern.to_dtype(original_dtype)?)
}

/// Dense scaled dot-product attention over head-major tensors.
///
/// # Shapes
/// - `q`: `[h, i, d]`, `k`/`v`: `[h, j, d]`
/// - returns: `[h, i, d]`
///
/// # Errors
///
/// Returns [`MsaError::Model`] on tensor operation failures.
pub(crate) fn sdpa(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
    // CONTIGUOUS: transpose produces non-unit strides; matmul requires
    // a contiguous lhs
    let k_t = k.contiguous()?.transpose(1, 2)?;
    let sim = (q.contiguous()?.matmul(&k_t)? * scale)?;
    let pattern = softmax_f32(&sim)?;
    Ok(pattern.matmul(&v.contiguous()?)?)
}

/// Side length of the square spatial grid with `n` tokens.
///
/// # Errors
///
/// Returns [`MsaError::ShapeMismatch`] if `n` is not a perfect square —
/// masks only apply to square attention resolutions.
pub(crate) fn square_res(n: usize) -> Result<usize> {
    let res = (n as f64).sqrt().round() as usize;
    if res * res != n {
        return Err(MsaError::ShapeMismatch(format!(
            "sequence length {n} is not a square spatial grid"
        )));
    }
    Ok(res)
}

/// Most negative finite value representable in `dtype`, used as the
/// additive mask fill (effectively `-inf` after softmax).
pub(crate) fn dtype_min(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

// ---------------------------------------------------------------------------
// Passthrough
// ---------------------------------------------------------------------------

/// Standard attention recomputation: `softmax(q · kᵀ · scale) · v`, folded
/// back to the caller's `[batch, seq, heads · head_dim]` layout.
///
/// This is the null policy every controller falls back to outside its
/// active (step, layer) set.
///
/// # Errors
///
/// Returns [`MsaError::Model`] on tensor operation failures.
pub fn passthrough(ctx: &AttnContext) -> Result<Tensor> {
    let out = sdpa(&ctx.query, &ctx.key, &ctx.value, ctx.scale)?;
    let (rows, n, d) = out.dims3()?;
    let b = rows / ctx.num_heads;
    let out = out
        .reshape((b, ctx.num_heads, n, d))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b, n, ctx.num_heads * d))?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Mutual batch primitive
// ---------------------------------------------------------------------------

/// Mutual-attention batch primitive: fold to head-major with the batch in
/// the sequence axis, attend over the combined sequence, unfold.
///
/// Every sample in `q`'s batch attends over `k`/`v`'s pooled tokens; passing
/// only the source sample's rows as `k`/`v` yields the mutual substitution.
///
/// # Shapes
/// - `q`: `[(b · h), n, d]`, `k`/`v`: `[(b_kv · h), n, d]`
/// - returns: `[b, n, h · d]`
///
/// # Errors
///
/// Returns [`MsaError::ShapeMismatch`] if a leading axis is not divisible
/// by `num_heads`.
pub(crate) fn attn_batch(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    num_heads: usize,
    scale: f64,
) -> Result<Tensor> {
    attn_batch_masked(q, k, v, num_heads, scale, None)
}

/// [`attn_batch`] with an optional flat spatial mask over the key axis.
///
/// With a mask the similarity splits into two variants before softmax: the
/// foreground-focused variant fills `mask == 0` entries with the dtype
/// minimum, the background-focused variant fills `mask == 1` entries.
/// Variants stack on the leading axis, values are duplicated to match, and
/// the result unfolds to `[2 · b, n, h · d]` — foreground rows first.
///
/// # Shapes
/// - `sim_mask`: `[seq_k]`, values in `[0, 1]`
///
/// # Errors
///
/// Returns [`MsaError::ShapeMismatch`] on layout violations and
/// [`MsaError::Model`] on tensor operation failures.
pub(crate) fn attn_batch_masked(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    num_heads: usize,
    scale: f64,
    sim_mask: Option<&Tensor>,
) -> Result<Tensor> {
    let b = q.dim(0)? / num_heads;
    let q = fold_heads(q, num_heads)?;
    let k = fold_heads(k, num_heads)?;
    let mut v = fold_heads(v, num_heads)?;

    let k_t = k.contiguous()?.transpose(1, 2)?;
    let mut sim = (q.contiguous()?.matmul(&k_t)? * scale)?;

    if let Some(mask) = sim_mask {
        let mask = &mask.to_dtype(sim.dtype())?;
        let fill = Tensor::full(dtype_min(sim.dtype()), mask.shape(), mask.device())?
            .to_dtype(sim.dtype())?;
        // Foreground variant: background entries (mask == 0) go to -inf.
        let fg_fill = mask.eq(0.0)?.where_cond(&fill, mask)?;
        // Background variant: foreground entries (mask == 1) go to -inf.
        let bg_fill = mask.eq(1.0)?.where_cond(&fill, mask)?;
        let sim_fg = sim.broadcast_add(&fg_fill)?;
        let sim_bg = sim.broadcast_add(&bg_fill)?;
        sim = Tensor::cat(&[&sim_fg, &sim_bg], 0)?;
    }

    let pattern = softmax_f32(&sim)?;
    if pattern.dim(0)? == 2 * v.dim(0)? {
        v = Tensor::cat(&[&v, &v], 0)?;
    }
    let out = pattern.matmul(&v.contiguous()?)?;
    unfold_heads(&out, num_heads, b)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
