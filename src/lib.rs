// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-msa
//!
//! Mutual self-attention control for diffusion image editing in Rust,
//! built on [candle](https://github.com/huggingface/candle).
//!
//! candle-msa provides the attention-substitution hooks a denoising loop
//! plugs into its attention call sites: at scheduled steps and layers a
//! controller replaces each generation branch's keys/values with the
//! source image's, preserving the source's structure while the target
//! prompt drives content. Variants gate the substitution with static
//! region masks, masks auto-derived from cross-attention maps, or an
//! extra frame/view batch axis with a memory-efficient attention path.
//!
//! ## Controllers
//!
//! - [`AttentionPassthrough`] — standard attention, no substitution.
//! - [`MutualSelfAttention`] — source keys/values for every query.
//! - [`MaskedMutualSelfAttention`] — static foreground/background masks.
//! - [`AutoMaskMutualSelfAttention`] — masks from cross-attention maps.
//! - [`VideoSelfAttention`] — extra-axis batches, optional streamed path.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod attn;
pub mod backend;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod mask;

pub use attn::passthrough;
pub use backend::{AttnBackend, memory_efficient_attention};
pub use config::{ATTN_CALLS_PER_STEP, ControlSchedule, NUM_UNET_LAYER_PAIRS};
pub use context::{AttnContext, UnetPlace};
pub use control::{
    AttentionControl, AttentionPassthrough, AutoMaskConfig, AutoMaskMutualSelfAttention,
    CROSS_ATTN_RES, MaskedMutualSelfAttention, MutualSelfAttention, PolicyState,
    VideoSelfAttention,
};
pub use error::{MsaError, Result};
pub use mask::{SpatialMask, binarize, normalize_per_sample};
