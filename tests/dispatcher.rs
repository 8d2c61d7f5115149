mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use common::{
    DroppingUpscaler, FailingUpscaler, MockDecoder, NearestInterpolator, RecordingEncoder, SMALL,
    TagUpscaler, capability_set, frames, tag,
};
use vidlift::capabilities::{Interpolator, SuperResolver};
use vidlift::dispatcher::{Dispatcher, InferenceRequest, MemoryModel};
use vidlift::video::{FrameBatch, FrameRate, Resolution};
use vidlift::{CapabilitySet, ErrorKind, PipelineError};

const TARGET: Resolution = Resolution::new(8, 8);

fn unit_model() -> MemoryModel {
    MemoryModel {
        resident_bytes: 0,
        super_resolution_factor: 1.0,
        interpolation_factor: 1.0,
    }
}

fn set(upscaler: Arc<dyn SuperResolver>, interpolator: Arc<dyn Interpolator>) -> CapabilitySet {
    capability_set(
        MockDecoder::new(0, FrameRate::fps(30)),
        upscaler,
        interpolator,
        RecordingEncoder::default(),
    )
}

fn dispatcher(upscaler: Arc<dyn SuperResolver>) -> Dispatcher {
    Dispatcher::new(
        &set(upscaler, Arc::new(NearestInterpolator::default())),
        Duration::from_secs(5),
    )
    .with_memory_model(unit_model())
}

/// Bytes one frame costs when upscaled from SMALL to TARGET.
fn per_frame() -> u64 {
    SMALL.frame_bytes() + TARGET.frame_bytes()
}

#[test]
fn over_budget_request_is_refused_before_the_model_runs() {
    let upscaler = Arc::new(TagUpscaler::default());
    let dispatcher = dispatcher(upscaler.clone());
    let batch = FrameBatch::new(1, 0, frames(4));
    let request = InferenceRequest::super_resolve(batch, TARGET, per_frame() * 3);

    let err = dispatcher.run(request).unwrap_err();
    assert!(matches!(err, PipelineError::BudgetExceeded { .. }));
    assert!(upscaler.batch_sizes.lock().unwrap().is_empty());
}

#[test]
fn split_retry_keeps_every_request_under_budget() {
    let upscaler = Arc::new(TagUpscaler::default());
    let dispatcher = dispatcher(upscaler.clone());
    let batch = FrameBatch::new(1, 0, frames(8));
    let budget = per_frame() * 3;

    let out = dispatcher
        .run_adaptive(InferenceRequest::super_resolve(batch, TARGET, budget))
        .unwrap();

    let sizes = upscaler.batch_sizes.lock().unwrap().clone();
    assert_eq!(sizes, vec![2, 2, 2, 2]);
    assert!(sizes.iter().all(|n| *n as u64 * per_frame() <= budget));
    let indices: Vec<u64> = out.frames.iter().map(|f| f.index).collect();
    assert_eq!(indices, (0..8).collect::<Vec<_>>());
    assert!(out.frames.iter().all(|f| f.resolution() == TARGET));
}

#[test]
fn split_retry_gives_up_after_log2_halvings() {
    let upscaler = Arc::new(TagUpscaler::default());
    let dispatcher = dispatcher(upscaler.clone());
    let batch = FrameBatch::new(1, 0, frames(8));

    let err = dispatcher
        .run_adaptive(InferenceRequest::super_resolve(batch, TARGET, per_frame() - 1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    match err {
        PipelineError::ResourceExhausted {
            batch_size,
            halvings,
            ..
        } => {
            assert_eq!(halvings, 3);
            assert_eq!(batch_size, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(upscaler.batch_sizes.lock().unwrap().is_empty());
}

#[test]
fn capability_failures_are_not_retried() {
    let upscaler = Arc::new(FailingUpscaler::default());
    let dispatcher = dispatcher(upscaler.clone());
    let batch = FrameBatch::new(1, 0, frames(4));

    let err = dispatcher
        .run_adaptive(InferenceRequest::super_resolve(batch, TARGET, u64::MAX))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(err.to_string().contains("out of memory"));
    assert_eq!(upscaler.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn slow_model_times_out_as_capability_error() {
    let upscaler = Arc::new(TagUpscaler {
        delay: Some(Duration::from_millis(500)),
        ..TagUpscaler::default()
    });
    let dispatcher = Dispatcher::new(
        &set(upscaler, Arc::new(NearestInterpolator::default())),
        Duration::from_millis(50),
    );
    let batch = FrameBatch::new(1, 0, frames(2));

    let err = dispatcher
        .run(InferenceRequest::super_resolve(batch, TARGET, u64::MAX))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(err.to_string().contains("timed out"));
}

#[test]
fn frame_count_mismatch_is_corruption() {
    let dispatcher = dispatcher(Arc::new(DroppingUpscaler));
    let batch = FrameBatch::new(1, 0, frames(3));

    let err = dispatcher
        .run(InferenceRequest::super_resolve(batch, TARGET, u64::MAX))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[test]
fn split_interpolation_matches_a_single_call() {
    // 30 -> 60 fps over eight source frames, output indices 0..16.
    let positions: Vec<f64> = (0..16).map(|k| k as f64 / 2.0).collect();
    let request = |budget| {
        InferenceRequest::interpolate(
            FrameBatch::new(1, 0, frames(8)),
            None,
            positions.clone(),
            0,
            budget,
        )
    };

    let whole = Arc::new(NearestInterpolator::default());
    let single = Dispatcher::new(
        &set(Arc::new(TagUpscaler::default()), whole.clone()),
        Duration::from_secs(5),
    )
    .with_memory_model(unit_model())
    .run_adaptive(request(u64::MAX))
    .unwrap();

    let halves = Arc::new(NearestInterpolator::default());
    // Four source frames, their look-ahead and eight outputs.
    let budget = SMALL.frame_bytes() * 13;
    let split = Dispatcher::new(
        &set(Arc::new(TagUpscaler::default()), halves.clone()),
        Duration::from_secs(5),
    )
    .with_memory_model(unit_model())
    .run_adaptive(request(budget))
    .unwrap();

    assert_eq!(halves.positions.lock().unwrap().len(), 2);
    assert_eq!(whole.positions.lock().unwrap().len(), 1);
    let tags = |b: &FrameBatch| b.frames.iter().map(tag).collect::<Vec<_>>();
    let indices = |b: &FrameBatch| b.frames.iter().map(|f| f.index).collect::<Vec<_>>();
    assert_eq!(tags(&single), tags(&split));
    assert_eq!(indices(&split), (0..16).collect::<Vec<_>>());
}

#[test]
fn device_is_used_by_one_request_at_a_time() {
    let upscaler = Arc::new(TagUpscaler {
        delay: Some(Duration::from_millis(20)),
        ..TagUpscaler::default()
    });
    let dispatcher = dispatcher(upscaler.clone());

    thread::scope(|scope| {
        for job in 0..4 {
            let dispatcher = dispatcher.clone();
            scope.spawn(move || {
                let batch = FrameBatch::new(job, 0, frames(2));
                dispatcher
                    .run(InferenceRequest::super_resolve(batch, TARGET, u64::MAX))
                    .unwrap();
            });
        }
    });

    assert_eq!(upscaler.batch_sizes.lock().unwrap().len(), 4);
    assert_eq!(upscaler.peak.load(Ordering::SeqCst), 1);
}

#[test]
fn timed_out_call_keeps_the_device_until_it_returns() {
    let upscaler = Arc::new(TagUpscaler {
        delay: Some(Duration::from_millis(300)),
        ..TagUpscaler::default()
    });
    let dispatcher = Dispatcher::new(
        &set(upscaler.clone(), Arc::new(NearestInterpolator::default())),
        Duration::from_millis(50),
    );

    for job in 0..2 {
        let batch = FrameBatch::new(job, 0, frames(2));
        let err = dispatcher
            .run(InferenceRequest::super_resolve(batch, TARGET, u64::MAX))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
    // Let the abandoned second call drain.
    thread::sleep(Duration::from_millis(400));

    assert_eq!(upscaler.batch_sizes.lock().unwrap().len(), 2);
    assert_eq!(upscaler.peak.load(Ordering::SeqCst), 1);
    assert_eq!(upscaler.active.load(Ordering::SeqCst), 0);
}
