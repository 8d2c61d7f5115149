//! CPU reference inference. Lanczos resampling stands in for a
//! super-resolution model and a linear cross-fade for a flow-based
//! interpolator; both honour the capability contracts exactly.

use anyhow::{Result, anyhow};
use image::RgbImage;
use image::imageops::{self, FilterType};

use super::{Interpolator, SuperResolver};
use crate::video::{Frame, Resolution};

pub struct LanczosUpscaler {
    filter: FilterType,
}

impl Default for LanczosUpscaler {
    fn default() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }
}

impl SuperResolver for LanczosUpscaler {
    fn name(&self) -> &'static str {
        "lanczos"
    }

    fn super_resolve(&self, frames: &[Frame], target: Resolution) -> Result<Vec<Frame>> {
        frames
            .iter()
            .map(|frame| {
                if frame.resolution() == target {
                    return Ok(frame.clone());
                }
                let source = RgbImage::from_raw(frame.width, frame.height, frame.data.to_vec())
                    .ok_or_else(|| anyhow!("frame {} buffer does not match its size", frame.index))?;
                let resized = imageops::resize(&source, target.width, target.height, self.filter);
                Frame::new(frame.index, target.width, target.height, resized.into_raw())
            })
            .collect()
    }
}

pub struct BlendInterpolator;

impl Interpolator for BlendInterpolator {
    fn name(&self) -> &'static str {
        "blend"
    }

    fn interpolate(&self, frames: &[Frame], positions: &[f64]) -> Result<Vec<Frame>> {
        let last = frames
            .len()
            .checked_sub(1)
            .ok_or_else(|| anyhow!("interpolation needs at least one frame"))?;

        positions
            .iter()
            .enumerate()
            .map(|(slot, &position)| {
                let position = position.max(0.0);
                let base = (position.floor() as usize).min(last);
                let next = (base + 1).min(last);
                let weight = (position - base as f64).clamp(0.0, 1.0);
                let a = &frames[base];
                if next == base || weight < 1e-6 {
                    return Ok(a.clone().with_index(slot as u64));
                }
                let b = &frames[next];
                if a.resolution() != b.resolution() {
                    return Err(anyhow!(
                        "cannot blend frame {} ({}) with frame {} ({})",
                        a.index,
                        a.resolution(),
                        b.index,
                        b.resolution()
                    ));
                }
                let blended = a
                    .data
                    .iter()
                    .zip(b.data.iter())
                    .map(|(&x, &y)| (x as f64 * (1.0 - weight) + y as f64 * weight).round() as u8)
                    .collect();
                Frame::new(slot as u64, a.width, a.height, blended)
            })
            .collect()
    }
}
