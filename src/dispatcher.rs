use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::capabilities::{CapabilitySet, Interpolator, SuperResolver, call_with_timeout};
use crate::error::{CapabilityKind, PipelineError, PipelineResult};
use crate::observability::MetricsCollector;
use crate::video::{Frame, FrameBatch, Resolution};

const MIB: u64 = 1024 * 1024;

/// Device-memory model used to price a request before it is issued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryModel {
    /// Weights and workspace held regardless of batch size.
    pub resident_bytes: u64,
    /// Activation multiplier over input plus output pixels.
    pub super_resolution_factor: f64,
    pub interpolation_factor: f64,
}

impl Default for MemoryModel {
    fn default() -> Self {
        Self {
            resident_bytes: 256 * MIB,
            super_resolution_factor: 4.0,
            interpolation_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum InferenceWork {
    SuperResolve {
        target: Resolution,
    },
    /// `positions` are source positions relative to the first batch frame,
    /// ascending; `lookahead` is the frame following the batch, if any.
    Interpolate {
        lookahead: Option<Frame>,
        positions: Vec<f64>,
        first_output: u64,
    },
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub batch: FrameBatch,
    pub work: InferenceWork,
    /// Ceiling the estimate must stay under, the active preset's budget.
    pub budget: u64,
}

impl InferenceRequest {
    pub fn super_resolve(batch: FrameBatch, target: Resolution, budget: u64) -> Self {
        Self {
            batch,
            work: InferenceWork::SuperResolve { target },
            budget,
        }
    }

    pub fn interpolate(
        batch: FrameBatch,
        lookahead: Option<Frame>,
        positions: Vec<f64>,
        first_output: u64,
        budget: u64,
    ) -> Self {
        Self {
            batch,
            work: InferenceWork::Interpolate {
                lookahead,
                positions,
                first_output,
            },
            budget,
        }
    }

    pub fn kind(&self) -> CapabilityKind {
        match self.work {
            InferenceWork::SuperResolve { .. } => CapabilityKind::SuperResolution,
            InferenceWork::Interpolate { .. } => CapabilityKind::Interpolation,
        }
    }

    /// Sub-request over source frames `range`, carrying the frames and
    /// output positions that fall inside it.
    fn slice(&self, range: Range<usize>) -> InferenceRequest {
        let frames = self.batch.frames[range.clone()].to_vec();
        let batch = FrameBatch::new(self.batch.job_id, self.batch.sequence, frames);
        let work = match &self.work {
            InferenceWork::SuperResolve { target } => InferenceWork::SuperResolve { target: *target },
            InferenceWork::Interpolate {
                lookahead,
                positions,
                first_output,
            } => {
                let lo = range.start as f64;
                let hi = range.end as f64;
                let is_last = range.end >= self.batch.len();
                let skipped = positions.iter().take_while(|p| **p < lo).count();
                let inside = positions
                    .iter()
                    .skip(skipped)
                    .take_while(|p| is_last || **p < hi)
                    .map(|p| p - lo)
                    .collect();
                let next = self
                    .batch
                    .frames
                    .get(range.end)
                    .cloned()
                    .or_else(|| lookahead.clone());
                InferenceWork::Interpolate {
                    lookahead: next,
                    positions: inside,
                    first_output: first_output + skipped as u64,
                }
            }
        };
        InferenceRequest {
            batch,
            work,
            budget: self.budget,
        }
    }
}

/// Exclusive hold on the inference device.
///
/// Leases move into the capability thread, so the device stays busy until
/// the model call returns even after the caller has timed out.
#[derive(Debug, Default)]
struct DeviceLock {
    busy: Mutex<bool>,
    released: Condvar,
}

struct DeviceLease(Arc<DeviceLock>);

impl DeviceLock {
    fn acquire(self: &Arc<Self>) -> DeviceLease {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        while *busy {
            busy = self
                .released
                .wait(busy)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *busy = true;
        DeviceLease(Arc::clone(self))
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut busy = self.0.busy.lock().unwrap_or_else(PoisonError::into_inner);
        *busy = false;
        self.0.released.notify_one();
    }
}

/// Routes inference requests to the model capabilities, one at a time.
///
/// Every dispatcher cloned from the same instance shares one device lock, so
/// concurrent jobs interleave at request granularity but never overlap on
/// the device.
#[derive(Clone)]
pub struct Dispatcher {
    super_resolver: Arc<dyn SuperResolver>,
    interpolator: Arc<dyn Interpolator>,
    memory: MemoryModel,
    timeout: Duration,
    device: Arc<DeviceLock>,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(capabilities: &CapabilitySet, timeout: Duration) -> Self {
        Self {
            super_resolver: capabilities.super_resolver.clone(),
            interpolator: capabilities.interpolator.clone(),
            memory: MemoryModel::default(),
            timeout,
            device: Arc::new(DeviceLock::default()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_memory_model(mut self, memory: MemoryModel) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn estimate(&self, request: &InferenceRequest) -> u64 {
        let input = request.batch.byte_size();
        let (working, factor) = match &request.work {
            InferenceWork::SuperResolve { target } => (
                input + request.batch.len() as u64 * target.frame_bytes(),
                self.memory.super_resolution_factor,
            ),
            InferenceWork::Interpolate {
                lookahead,
                positions,
                ..
            } => {
                let frame_bytes = request
                    .batch
                    .frames
                    .first()
                    .map(Frame::byte_size)
                    .unwrap_or(0);
                let ahead = lookahead.as_ref().map(Frame::byte_size).unwrap_or(0);
                (
                    input + ahead + positions.len() as u64 * frame_bytes,
                    self.memory.interpolation_factor,
                )
            }
        };
        self.memory.resident_bytes + (working as f64 * factor).ceil() as u64
    }

    /// Issues one request as-is. Fails with `BudgetExceeded` without
    /// touching the device when the estimate is over the ceiling.
    #[instrument(skip_all, fields(kind = %request.kind(), frames = request.batch.len(), batch = request.batch.sequence))]
    pub fn run(&self, request: InferenceRequest) -> PipelineResult<FrameBatch> {
        let kind = request.kind();
        let required = self.estimate(&request);
        if required > request.budget {
            return Err(PipelineError::BudgetExceeded {
                required,
                budget: request.budget,
            });
        }

        let InferenceRequest { batch, work, .. } = request;
        if batch.is_empty() {
            return Ok(batch);
        }

        let lease = self.device.acquire();
        debug!(required, "Dispatching inference");
        match work {
            InferenceWork::SuperResolve { target } => {
                let model = self.super_resolver.clone();
                let expected: Vec<u64> = batch.frames.iter().map(|f| f.index).collect();
                let frames = batch.frames;
                let output = call_with_timeout(kind, self.timeout, move || {
                    let _lease = lease;
                    model.super_resolve(&frames, target)
                })?;
                verify_super_resolved(&output, &expected, target)?;
                Ok(FrameBatch::new(batch.job_id, batch.sequence, output))
            }
            InferenceWork::Interpolate {
                lookahead,
                positions,
                first_output,
            } => {
                if positions.is_empty() {
                    return Ok(FrameBatch::new(batch.job_id, batch.sequence, Vec::new()));
                }
                let model = self.interpolator.clone();
                let wanted = positions.len();
                let mut frames = batch.frames;
                frames.extend(lookahead);
                let output = call_with_timeout(kind, self.timeout, move || {
                    let _lease = lease;
                    model.interpolate(&frames, &positions)
                })?;
                if output.len() != wanted {
                    return Err(PipelineError::corruption(format!(
                        "interpolator returned {} frame(s) for {wanted} position(s)",
                        output.len()
                    )));
                }
                let frames = output
                    .into_iter()
                    .enumerate()
                    .map(|(slot, frame)| frame.with_index(first_output + slot as u64))
                    .collect();
                Ok(FrameBatch::new(batch.job_id, batch.sequence, frames))
            }
        }
    }

    /// Issues `request`, halving the chunk size whenever a chunk is priced
    /// over budget. Gives up with `ResourceExhausted` once
    /// `ceil(log2(batch size))` halvings have been spent.
    pub fn run_adaptive(&self, request: InferenceRequest) -> PipelineResult<FrameBatch> {
        let total = request.batch.len();
        let limit = max_halvings(total);
        let mut chunk = total.max(1);
        let mut halvings = 0u32;
        let mut start = 0usize;
        let mut frames = Vec::new();

        if total == 0 {
            return self.run(request);
        }

        while start < total {
            let end = (start + chunk).min(total);
            let sub = if start == 0 && end == total {
                request.clone()
            } else {
                request.slice(start..end)
            };
            match self.run(sub) {
                Ok(done) => {
                    frames.extend(done.frames);
                    start = end;
                }
                Err(PipelineError::BudgetExceeded { required, budget }) => {
                    if halvings >= limit || chunk == 1 {
                        return Err(PipelineError::ResourceExhausted {
                            batch_size: chunk,
                            budget,
                            halvings,
                        });
                    }
                    chunk = chunk.div_ceil(2);
                    halvings += 1;
                    self.metrics.record_budget_split();
                    warn!(
                        kind = %request.kind(),
                        batch = request.batch.sequence,
                        required,
                        budget,
                        chunk,
                        halvings,
                        "Inference over budget, splitting batch"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Ok(FrameBatch::new(
            request.batch.job_id,
            request.batch.sequence,
            frames,
        ))
    }
}

fn verify_super_resolved(
    output: &[Frame],
    expected: &[u64],
    target: Resolution,
) -> PipelineResult<()> {
    if output.len() != expected.len() {
        return Err(PipelineError::corruption(format!(
            "super-resolution returned {} frame(s) for {} input(s)",
            output.len(),
            expected.len()
        )));
    }
    for (frame, want) in output.iter().zip(expected) {
        if frame.index != *want {
            return Err(PipelineError::corruption(format!(
                "super-resolution reordered frames: got {} where {} was expected",
                frame.index, want
            )));
        }
        if frame.resolution() != target {
            return Err(PipelineError::capability(
                CapabilityKind::SuperResolution,
                format!(
                    "frame {} came back at {} instead of {}",
                    frame.index,
                    frame.resolution(),
                    target
                ),
            ));
        }
    }
    Ok(())
}

pub fn max_halvings(batch_size: usize) -> u32 {
    if batch_size <= 1 {
        0
    } else {
        usize::BITS - (batch_size - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::max_halvings;

    #[test]
    fn halvings_follow_log2() {
        assert_eq!(max_halvings(1), 0);
        assert_eq!(max_halvings(2), 1);
        assert_eq!(max_halvings(8), 3);
        assert_eq!(max_halvings(9), 4);
        assert_eq!(max_halvings(64), 6);
    }
}
