use std::sync::{Arc, Mutex};

use tempfile::tempdir;
use vidlift::ErrorKind;
use vidlift::pipeline::{JobFailure, JobOutcome, JobReporter, Stage};
use vidlift::presets::{GIB, PresetName};
use vidlift::queue::{JobEventKind, JobQueue, JobRequest, JobStatus, store};
use vidlift::PipelineError;

fn request(path: &str, preset: PresetName) -> JobRequest {
    JobRequest::new(path, format!("out/{path}"), preset)
}

#[test]
fn next_promotes_oldest_first() {
    let queue = JobQueue::new(16 * GIB, 1);
    let a = queue.enqueue(request("a.mp4", PresetName::Standard)).unwrap();
    let b = queue.enqueue(request("b.mp4", PresetName::Standard)).unwrap();

    let running = queue.next().expect("a should start");
    assert_eq!(running.id, a);
    assert_eq!(queue.get(a).unwrap().status, JobStatus::Extracting);
    assert!(queue.next().is_none(), "concurrency bound is one");

    queue.finish(a, JobOutcome::Cancelled).unwrap();
    assert_eq!(queue.next().unwrap().id, b);
}

#[test]
fn duplicate_path_is_rejected_until_cancelled() {
    let queue = JobQueue::new(8 * GIB, 1);
    let id = queue.enqueue(request("a.mp4", PresetName::Fast)).unwrap();

    let err = queue.enqueue(request("a.mp4", PresetName::Standard)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateJob);

    queue.cancel(id).unwrap();
    assert!(queue.get(id).is_none(), "queued job is removed on cancel");
    assert_eq!(queue.ledger().reserved, 0);
    queue.enqueue(request("a.mp4", PresetName::Fast)).unwrap();
}

#[test]
fn finished_paths_can_be_queued_again() {
    let queue = JobQueue::new(8 * GIB, 1);
    let id = queue.enqueue(request("a.mp4", PresetName::Fast)).unwrap();
    queue.next().unwrap();
    queue.finish(id, JobOutcome::Cancelled).unwrap();
    queue.enqueue(request("a.mp4", PresetName::Fast)).unwrap();
}

#[test]
fn cancelling_a_running_job_flags_its_token() {
    let queue = JobQueue::new(8 * GIB, 1);
    let id = queue.enqueue(request("a.mp4", PresetName::Standard)).unwrap();
    let running = queue.next().unwrap();
    assert_eq!(queue.ledger().reserved, 4 * GIB);

    queue.cancel(id).unwrap();
    assert!(running.cancel.is_cancelled());
    assert!(queue.get(id).unwrap().status.is_running());

    queue.finish(id, JobOutcome::Cancelled).unwrap();
    assert_eq!(queue.get(id).unwrap().status, JobStatus::Cancelled);
    assert_eq!(queue.ledger().reserved, 0);
}

#[test]
fn budget_limits_parallel_promotion() {
    let queue = JobQueue::new(8 * GIB, 2);
    let first = queue
        .enqueue(request("a.mp4", PresetName::HighDefinition))
        .unwrap();
    let second = queue
        .enqueue(request("b.mp4", PresetName::HighDefinition))
        .unwrap();

    assert_eq!(queue.next().unwrap().id, first);
    assert!(queue.next().is_none(), "6 GB + 6 GB exceeds 8 GB");
    assert_eq!(queue.get(second).unwrap().status, JobStatus::Queued);

    queue.finish(first, JobOutcome::Cancelled).unwrap();
    assert_eq!(queue.next().unwrap().id, second);
}

#[test]
fn younger_jobs_do_not_overtake_a_blocked_head() {
    let queue = JobQueue::new(8 * GIB, 3);
    queue
        .enqueue(request("a.mp4", PresetName::HighDefinition))
        .unwrap();
    queue
        .enqueue(request("b.mp4", PresetName::HighDefinition))
        .unwrap();
    let small = queue.enqueue(request("c.mp4", PresetName::Fast)).unwrap();

    assert!(queue.next().is_some());
    assert!(queue.next().is_none());
    assert_eq!(queue.get(small).unwrap().status, JobStatus::Queued);
}

#[test]
fn oversized_preset_fails_at_promotion() {
    let queue = JobQueue::new(4 * GIB, 1);
    let big = queue
        .enqueue(request("a.mp4", PresetName::HighDefinition))
        .unwrap();
    let fits = queue.enqueue(request("b.mp4", PresetName::Fast)).unwrap();

    let running = queue.next().expect("the fast job still runs");
    assert_eq!(running.id, fits);

    let failed = queue.get(big).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_kind(), Some(ErrorKind::ResourceExhausted));
    assert_eq!(failed.error.unwrap().stage, Stage::Schedule);
}

#[test]
fn listeners_observe_transitions_in_order() {
    let queue = JobQueue::new(8 * GIB, 1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    queue.subscribe(move |event| {
        sink.lock()
            .unwrap()
            .push((event.kind, event.job.status));
    });

    let id = queue.enqueue(request("a.mp4", PresetName::Fast)).unwrap();
    queue.next().unwrap();
    queue.status(id, JobStatus::Encoding);
    queue.progress(id, 0.5);
    let err = PipelineError::corruption("frame 3 arrived twice");
    queue
        .finish(id, JobOutcome::Failed(JobFailure::new(Stage::Encode, &err, None)))
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            (JobEventKind::Enqueued, JobStatus::Queued),
            (JobEventKind::Started, JobStatus::Extracting),
            (JobEventKind::StatusChanged, JobStatus::Encoding),
            (JobEventKind::Progress, JobStatus::Encoding),
            (JobEventKind::Finished, JobStatus::Failed),
        ]
    );
    assert_eq!(
        queue.get(id).unwrap().error_kind(),
        Some(ErrorKind::Corruption)
    );
}

#[test]
fn cancel_of_unknown_job_is_an_error() {
    let queue = JobQueue::new(8 * GIB, 1);
    let err = queue.cancel(99).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownJob);
}

#[test]
fn wait_next_returns_none_once_drained() {
    let queue = JobQueue::new(8 * GIB, 1);
    assert!(queue.wait_next().is_none());

    let id = queue.enqueue(request("a.mp4", PresetName::Fast)).unwrap();
    assert_eq!(queue.wait_next().unwrap().id, id);
    queue.finish(id, JobOutcome::Cancelled).unwrap();
    assert!(queue.wait_next().is_none());
}

#[test]
fn jobs_survive_restart_under_their_own_ids() {
    let temp = tempdir().unwrap();
    let state = temp.path().join("state/queue.yaml");

    let queue = JobQueue::new(8 * GIB, 1);
    let done = queue.enqueue(request("done.mp4", PresetName::Fast)).unwrap();
    queue.next().unwrap();
    queue.finish(done, JobOutcome::Cancelled).unwrap();
    let interrupted = queue
        .enqueue(request("interrupted.mp4", PresetName::Standard).with_interpolation(false))
        .unwrap();
    queue.next().unwrap();
    let pending = queue
        .enqueue(request("pending.mp4", PresetName::HighDefinition))
        .unwrap();
    assert!(queue.get(interrupted).unwrap().status.is_running());
    let before = queue.records();
    queue.save(&state).unwrap();

    let records = store::load(&state).unwrap();
    assert_eq!(records, before);

    let restored = JobQueue::new(8 * GIB, 1);
    assert_eq!(restored.load(&state).unwrap(), 2);
    assert_eq!(restored.get(done).unwrap().status, JobStatus::Cancelled);
    let resumed = restored.get(interrupted).unwrap();
    assert_eq!(resumed.status, JobStatus::Queued);
    assert_eq!(resumed.preset, PresetName::Standard);
    assert!(!resumed.interpolate);
    assert_eq!(resumed.enqueued_at, before[1].enqueued_at);
    assert!(restored.get(pending).unwrap().input.ends_with("pending.mp4"));

    let fresh = restored.enqueue(request("later.mp4", PresetName::Fast)).unwrap();
    assert_eq!(fresh, pending + 1);
    assert_eq!(restored.next().unwrap().id, interrupted);
}

#[test]
fn missing_state_file_is_an_empty_queue() {
    let temp = tempdir().unwrap();
    let queue = JobQueue::new(8 * GIB, 1);
    assert_eq!(queue.load(&temp.path().join("absent.yaml")).unwrap(), 0);
}

#[test]
fn edits_to_the_state_file_reach_a_synced_queue() {
    let temp = tempdir().unwrap();
    let state = temp.path().join("queue.yaml");

    let queue = JobQueue::new(8 * GIB, 1);
    let running_id = queue.enqueue(request("a.mp4", PresetName::Fast)).unwrap();
    let waiting = queue.enqueue(request("b.mp4", PresetName::Fast)).unwrap();
    let running = queue.next().unwrap();
    queue.sync(&state).unwrap();

    let added = store::edit(&state, |file| {
        file.cancel(running_id)?;
        file.cancel(waiting)?;
        file.add(request("c.mp4", PresetName::Standard))
    })
    .unwrap();
    assert_eq!(added, running_id.max(waiting) + 1);

    queue.sync(&state).unwrap();
    assert!(running.cancel.is_cancelled());
    assert!(queue.get(waiting).is_none());
    let picked_up = queue.get(added).unwrap();
    assert_eq!(picked_up.status, JobStatus::Queued);
    assert_eq!(picked_up.preset, PresetName::Standard);

    queue.finish(running_id, JobOutcome::Cancelled).unwrap();
    queue.sync(&state).unwrap();
    let on_disk: Vec<(u64, JobStatus)> = store::load(&state)
        .unwrap()
        .iter()
        .map(|r| (r.id, r.status))
        .collect();
    assert_eq!(
        on_disk,
        vec![(running_id, JobStatus::Cancelled), (added, JobStatus::Queued)]
    );
}

#[test]
fn failed_jobs_keep_their_error_on_disk() {
    let temp = tempdir().unwrap();
    let state = temp.path().join("queue.yaml");

    let queue = JobQueue::new(8 * GIB, 1);
    let id = queue.enqueue(request("a.mp4", PresetName::Fast)).unwrap();
    queue.next().unwrap();
    let err = PipelineError::corruption("interpolator returned 3 frame(s) for 4 position(s)");
    queue
        .finish(id, JobOutcome::Failed(JobFailure::new(Stage::Interpolate, &err, None)))
        .unwrap();
    queue.sync(&state).unwrap();

    let records = store::load(&state).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, JobStatus::Failed);
    let failure = records[0].error.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Corruption);
    assert_eq!(failure.stage, Stage::Interpolate);

    // A cleared record is forgotten on the next sync.
    store::edit(&state, |file| Ok(file.clear_finished())).unwrap();
    queue.sync(&state).unwrap();
    assert!(queue.get(id).is_none());
    assert!(store::load(&state).unwrap().is_empty());
}
