// SPDX-License-Identifier: MIT OR Apache-2.0

//! Spatial masks separating foreground and background regions.
//!
//! [`SpatialMask`] wraps a 2-D tensor of values in `[0, 1]`. Masks are
//! resized bilinearly to the resolution of the current attention layer,
//! binarized through the pure [`binarize`] function (never in place, to
//! avoid aliasing a caller-owned buffer), and optionally exported as
//! grayscale PNGs for diagnostics.

use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::error::{MsaError, Result};

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Binarize a tensor against a threshold: values `>= thres` become `1`,
/// the rest `0`. Returns a new tensor; the input is never mutated.
///
/// Idempotent on already-binary masks for any `thres` in `(0, 1]`.
///
/// # Errors
///
/// Returns [`MsaError::Model`] on tensor operation failures.
pub fn binarize(mask: &Tensor, thres: f32) -> Result<Tensor> {
    Ok(mask.ge(f64::from(thres))?.to_dtype(mask.dtype())?)
}

/// Min–max normalize each sample of a `[samples, h, w]` tensor to `[0, 1]`.
///
/// A constant map has `min == max`; the denominator is clamped away from
/// zero so the result is all zeros instead of a division by zero.
///
/// # Errors
///
/// Returns [`MsaError::Model`] on tensor operation failures.
pub fn normalize_per_sample(maps: &Tensor) -> Result<Tensor> {
    let mins = maps.min_keepdim(2)?.min_keepdim(1)?;
    let maxs = maps.max_keepdim(2)?.max_keepdim(1)?;
    let range = maxs.broadcast_sub(&mins)?.clamp(f64::EPSILON, f64::INFINITY)?;
    Ok(maps.broadcast_sub(&mins)?.broadcast_div(&range)?)
}

/// Alpha-composite foreground and background attention outputs by a
/// `[seq, 1]` mask column: `fg · m + bg · (1 − m)`.
///
/// # Errors
///
/// Returns [`MsaError::Model`] on broadcast failures.
pub(crate) fn composite(fg: &Tensor, bg: &Tensor, mask_col: &Tensor) -> Result<Tensor> {
    let inverse = mask_col.affine(-1.0, 1.0)?;
    Ok(fg
        .broadcast_mul(mask_col)?
        .broadcast_add(&bg.broadcast_mul(&inverse)?)?)
}

// ---------------------------------------------------------------------------
// SpatialMask
// ---------------------------------------------------------------------------

/// A 2-D foreground/background mask with values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct SpatialMask {
    /// Mask values, `[height, width]`.
    data: Tensor,
}

impl SpatialMask {
    /// Wrap an existing 2-D tensor.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::ShapeMismatch`] if the tensor is not rank 2.
    pub fn new(data: Tensor) -> Result<Self> {
        if data.rank() != 2 {
            return Err(MsaError::ShapeMismatch(format!(
                "mask must be rank 2, got {:?}",
                data.dims()
            )));
        }
        Ok(Self { data })
    }

    /// Build a mask from row-major values.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Model`] if `values.len() != height * width`.
    pub fn from_vec(
        values: Vec<f32>,
        height: usize,
        width: usize,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            data: Tensor::from_vec(values, (height, width), device)?,
        })
    }

    /// Mask height.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Model`] if the underlying tensor lost its rank.
    pub fn height(&self) -> Result<usize> {
        Ok(self.data.dim(0)?)
    }

    /// Mask width.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Model`] if the underlying tensor lost its rank.
    pub fn width(&self) -> Result<usize> {
        Ok(self.data.dim(1)?)
    }

    /// The underlying `[height, width]` tensor.
    #[must_use]
    pub const fn tensor(&self) -> &Tensor {
        &self.data
    }

    /// Flatten to `[height · width]` for additive similarity masking.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Model`] on tensor operation failures.
    pub fn flat(&self) -> Result<Tensor> {
        Ok(self.data.flatten_all()?)
    }

    /// Reshape to a `[height · width, 1]` column for output compositing.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Model`] on tensor operation failures.
    pub fn column(&self) -> Result<Tensor> {
        let (h, w) = self.data.dims2()?;
        Ok(self.data.reshape((h * w, 1))?)
    }

    /// Bilinearly resample to `out_height × out_width`.
    ///
    /// Uses half-pixel-centre sampling with edge clamping, so an
    /// identity-size resize reproduces the input exactly.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::ShapeMismatch`] for a zero-sized target and
    /// [`MsaError::Model`] on tensor operation failures.
    pub fn resize(&self, out_height: usize, out_width: usize) -> Result<Self> {
        let (in_h, in_w) = self.data.dims2()?;
        if out_height == 0 || out_width == 0 {
            return Err(MsaError::ShapeMismatch(format!(
                "cannot resize mask to {out_height}x{out_width}"
            )));
        }
        if (in_h, in_w) == (out_height, out_width) {
            return Ok(self.clone());
        }

        let src = self.data.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let scale_h = in_h as f32 / out_height as f32;
        let scale_w = in_w as f32 / out_width as f32;

        let mut out = Vec::with_capacity(out_height * out_width);
        for oy in 0..out_height {
            // Half-pixel centres, clamped at the borders.
            let sy = ((oy as f32 + 0.5) * scale_h - 0.5).clamp(0.0, (in_h - 1) as f32);
            let y0 = sy.floor() as usize;
            let y1 = (y0 + 1).min(in_h - 1);
            let wy = sy - y0 as f32;
            for ox in 0..out_width {
                let sx = ((ox as f32 + 0.5) * scale_w - 0.5).clamp(0.0, (in_w - 1) as f32);
                let x0 = sx.floor() as usize;
                let x1 = (x0 + 1).min(in_w - 1);
                let wx = sx - x0 as f32;

                let top = src[y0][x0] * (1.0 - wx) + src[y0][x1] * wx;
                let bottom = src[y1][x0] * (1.0 - wx) + src[y1][x1] * wx;
                out.push(top * (1.0 - wy) + bottom * wy);
            }
        }

        let data = Tensor::from_vec(out, (out_height, out_width), self.data.device())?
            .to_dtype(self.data.dtype())?;
        Ok(Self { data })
    }

    /// Binarized copy of this mask: values `>= thres` become `1`, else `0`.
    ///
    /// # Errors
    ///
    /// Returns [`MsaError::Model`] on tensor operation failures.
    pub fn threshold(&self, thres: f32) -> Result<Self> {
        Ok(Self {
            data: binarize(&self.data, thres)?,
        })
    }

    /// Write the mask as a grayscale PNG. Best-effort: failures are logged
    /// at `warn` level and swallowed, never interrupting the step.
    pub fn save_gray(&self, path: &Path) {
        if let Err(err) = self.write_gray(path) {
            tracing::warn!(path = %path.display(), %err, "mask image write failed");
        }
    }

    /// Fallible body of [`save_gray`](Self::save_gray).
    fn write_gray(&self, path: &Path) -> Result<()> {
        let (h, w) = self.data.dims2()?;
        let rows = self.data.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut bytes = Vec::with_capacity(h * w);
        for row in &rows {
            for v in row {
                bytes.push((v.clamp(0.0, 1.0) * 255.0) as u8);
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        let img = image::GrayImage::from_raw(w as u32, h as u32, bytes)
            .ok_or_else(|| MsaError::Io(std::io::Error::other("mask buffer size mismatch")))?;
        img.save(path)
            .map_err(|err| MsaError::Io(std::io::Error::other(err)))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
