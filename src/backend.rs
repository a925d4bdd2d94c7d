// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention execution backends.
//!
//! The video controller can route its dense attention through a
//! memory-efficient path that never materialises the full similarity
//! matrix: keys are processed in chunks with an online softmax
//! (running row maximum and denominator). Both paths are numerically
//! equivalent within floating-point tolerance.
//!
//! Availability is a capability resolved once at process start via
//! [`AttnBackend::probe`] and injected into the controller's
//! configuration — never probed per call.

use candle_core::{D, DType, Tensor};

use crate::error::Result;

/// Key-axis chunk size for the memory-efficient path.
const KEY_CHUNK: usize = 1024;

/// Which attention implementation the video controller runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttnBackend {
    /// Dense attention: materialise the full similarity matrix.
    #[default]
    Dense,
    /// Chunked online-softmax attention.
    MemoryEfficient,
}

impl AttnBackend {
    /// Resolve the preferred backend once at process start.
    ///
    /// Compiling with the `memeff` feature selects the memory-efficient
    /// path; the dense path is the fallback.
    #[must_use]
    pub fn probe() -> Self {
        if cfg!(feature = "memeff") {
            Self::MemoryEfficient
        } else {
            Self::Dense
        }
    }

    /// Run scaled dot-product attention on head-major tensors through this
    /// backend.
    ///
    /// # Shapes
    /// - `q`: `[h, i, d]`, `k`/`v`: `[h, j, d]`
    /// - returns: `[h, i, d]`
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Model`](crate::MsaError::Model) on tensor
    /// operation failures.
    pub fn attention(self, q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
        match self {
            Self::Dense => crate::attn::sdpa(q, k, v, scale),
            Self::MemoryEfficient => memory_efficient_attention(q, k, v, scale),
        }
    }
}

/// Memory-efficient scaled dot-product attention.
///
/// Streams the key axis in [`KEY_CHUNK`]-sized blocks, maintaining a
/// running row maximum `m`, denominator `l`, and weighted-value
/// accumulator; each new block rescales the previous partial sums by
/// `exp(m_old - m_new)`. Accumulation happens in F32 regardless of the
/// input dtype.
///
/// # Shapes
/// - `q`: `[h, i, d]`, `k`/`v`: `[h, j, d]`
/// - returns: `[h, i, d]`
///
/// # Errors
///
/// Returns [`MsaError::Model`](crate::MsaError::Model) on tensor
/// operation failures.
pub fn memory_efficient_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
) -> Result<Tensor> {
    let original_dtype = q.dtype();
    let q = q.to_dtype(DType::F32)?.contiguous()?;
    let k = k.to_dtype(DType::F32)?.contiguous()?;
    let v = v.to_dtype(DType::F32)?.contiguous()?;

    let (h, i, d) = q.dims3()?;
    let j = k.dim(1)?;
    let device = q.device();

    let mut row_max = Tensor::full(f32::NEG_INFINITY, (h, i, 1), device)?;
    let mut denom = Tensor::zeros((h, i, 1), DType::F32, device)?;
    let mut acc = Tensor::zeros((h, i, d), DType::F32, device)?;

    let mut start = 0;
    while start < j {
        let len = KEY_CHUNK.min(j - start);
        // CONTIGUOUS: narrow produces strided views; matmul wants packed rows
        let k_chunk = k.narrow(1, start, len)?.contiguous()?;
        let v_chunk = v.narrow(1, start, len)?.contiguous()?;

        let scores = (q.matmul(&k_chunk.transpose(1, 2)?)? * scale)?; // [h, i, len]
        let chunk_max = scores.max_keepdim(D::Minus1)?;
        let new_max = row_max.maximum(&chunk_max)?;

        // exp(-inf - finite) = 0 zeroes the empty accumulator on the
        // first chunk.
        let correction = row_max.broadcast_sub(&new_max)?.exp()?;
        let weights = scores.broadcast_sub(&new_max)?.exp()?;

        denom = denom
            .broadcast_mul(&correction)?
            .broadcast_add(&weights.sum_keepdim(D::Minus1)?)?;
        acc = acc
            .broadcast_mul(&correction)?
            .broadcast_add(&weights.matmul(&v_chunk)?)?;
        row_max = new_max;
        start += len;
    }

    let out = acc.broadcast_div(&denom)?;
    Ok(out.to_dtype(original_dtype)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn seeded_tensor(shape: (usize, usize, usize), offset: f32) -> Tensor {
        let len = shape.0 * shape.1 * shape.2;
        let data: Vec<f32> = (0..len)
            .map(|n| ((n as f32) * 0.37 + offset).sin())
            .collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let diff = (a - b).unwrap().abs().unwrap().flatten_all().unwrap();
        diff.max(0).unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn dense_and_memory_efficient_agree() {
        let q = seeded_tensor((2, 5, 4), 0.0);
        let k = seeded_tensor((2, 7, 4), 1.0);
        let v = seeded_tensor((2, 7, 4), 2.0);

        let dense = AttnBackend::Dense.attention(&q, &k, &v, 0.5).unwrap();
        let streamed = memory_efficient_attention(&q, &k, &v, 0.5).unwrap();
        assert_eq!(dense.dims(), streamed.dims());
        assert!(max_abs_diff(&dense, &streamed) < 1e-5);
    }

    #[test]
    fn memory_efficient_attention_rows_sum_weights_to_one() {
        // With constant values every output row equals that constant.
        let q = seeded_tensor((1, 3, 2), 0.0);
        let k = seeded_tensor((1, 4, 2), 1.0);
        let v = Tensor::full(2.5f32, (1, 4, 2), &Device::Cpu).unwrap();
        let out = memory_efficient_attention(&q, &k, &v, 1.0).unwrap();
        let vals = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for val in vals {
            assert!((val - 2.5).abs() < 1e-5);
        }
    }

    #[test]
    fn probe_matches_feature_flag() {
        let expected = if cfg!(feature = "memeff") {
            AttnBackend::MemoryEfficient
        } else {
            AttnBackend::Dense
        };
        assert_eq!(AttnBackend::probe(), expected);
    }
}
