// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-call attention context passed from the denoising loop.
//!
//! [`AttnContext`] bundles everything one attention-layer invocation hands
//! to a policy: query/key/value in the call site's head-flattened layout,
//! the caller's precomputed similarity and attention maps, and layer
//! metadata. Construction validates the batch/head layout before any
//! computation runs.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{MsaError, Result};

// ---------------------------------------------------------------------------
// UnetPlace
// ---------------------------------------------------------------------------

/// Which sub-network of the denoising UNet an attention call belongs to.
///
/// # String conversion
///
/// ```
/// use candle_msa::UnetPlace;
///
/// assert_eq!(UnetPlace::Mid.to_string(), "mid");
/// let parsed: UnetPlace = "up".parse().unwrap();
/// assert_eq!(parsed, UnetPlace::Up);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnetPlace {
    /// Downsampling path.
    Down,
    /// Bottleneck.
    Mid,
    /// Upsampling path.
    Up,
}

impl fmt::Display for UnetPlace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Down => write!(f, "down"),
            Self::Mid => write!(f, "mid"),
            Self::Up => write!(f, "up"),
        }
    }
}

impl FromStr for UnetPlace {
    type Err = MsaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "down" => Ok(Self::Down),
            "mid" => Ok(Self::Mid),
            "up" => Ok(Self::Up),
            other => Err(MsaError::Config(format!("unknown unet place `{other}`"))),
        }
    }
}

// ---------------------------------------------------------------------------
// AttnContext
// ---------------------------------------------------------------------------

/// Inputs of a single attention-layer invocation.
///
/// All tensors use the attention call site's head-flattened layout:
/// `[(batch · heads), seq, head_dim]` for `query`/`key`/`value` and
/// `[(batch · heads), seq_q, seq_k]` for `similarity`/`attention`.
/// Candle tensors are reference-counted, so the struct owns cheap clones
/// for the duration of the call.
///
/// `similarity` and `attention` come precomputed from the caller; policies
/// recompute attention from `query`/`key`/`value` and only read `attention`
/// where cross-attention maps are harvested.
#[derive(Debug, Clone)]
pub struct AttnContext {
    /// Query projection, `[(batch · heads), seq_q, head_dim]`.
    pub query: Tensor,
    /// Key projection, `[(batch · heads), seq_k, head_dim]`.
    pub key: Tensor,
    /// Value projection, `[(batch · heads), seq_k, head_dim]`.
    pub value: Tensor,
    /// Caller's pre-softmax similarity, `[(batch · heads), seq_q, seq_k]`.
    pub similarity: Tensor,
    /// Caller's post-softmax attention weights, `[(batch · heads), seq_q, seq_k]`.
    pub attention: Tensor,
    /// Whether this call is cross-attention (image-to-text) rather than
    /// self-attention.
    pub is_cross: bool,
    /// Sub-network the layer belongs to.
    pub place: UnetPlace,
    /// Number of attention heads folded into the leading axis.
    pub num_heads: usize,
    /// Softmax temperature applied to the similarity.
    pub scale: f64,
}

impl AttnContext {
    /// Bundle one invocation's inputs, validating the head layout.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::ShapeMismatch`] if `num_heads` is zero or the
    /// leading axis of `query` is not divisible by `num_heads`.
    #[allow(clippy::too_many_arguments)] // mirrors the attention call site's argument list
    pub fn new(
        query: Tensor,
        key: Tensor,
        value: Tensor,
        similarity: Tensor,
        attention: Tensor,
        is_cross: bool,
        place: UnetPlace,
        num_heads: usize,
        scale: f64,
    ) -> Result<Self> {
        if num_heads == 0 {
            return Err(MsaError::ShapeMismatch("num_heads must be non-zero".into()));
        }
        let rows = query.dim(0)?;
        if rows % num_heads != 0 {
            return Err(MsaError::ShapeMismatch(format!(
                "query batch axis {rows} not divisible by num_heads {num_heads}"
            )));
        }
        Ok(Self {
            query,
            key,
            value,
            similarity,
            attention,
            is_cross,
            place,
            num_heads,
            scale,
        })
    }

    /// Number of samples in the batch (`rows / num_heads`).
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Model`] if the query tensor has no leading axis.
    pub fn batch(&self) -> Result<usize> {
        Ok(self.query.dim(0)? / self.num_heads)
    }

    /// Query sequence length (the spatial token count at this layer).
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Model`] if the query tensor is not rank 3.
    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.query.dim(1)?)
    }

    /// Validate that the leading axis splits into `groups` equal row groups.
    ///
    /// Used by the video variant with `groups = extra_axis · num_heads`.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::ShapeMismatch`] on non-divisibility.
    pub fn check_group_divisibility(&self, groups: usize) -> Result<()> {
        let rows = self.query.dim(0)?;
        if groups == 0 || rows % groups != 0 {
            return Err(MsaError::ShapeMismatch(format!(
                "query batch axis {rows} not divisible into {groups} row groups"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
