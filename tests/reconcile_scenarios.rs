//! End-to-end reconciliation scenarios against the in-memory backend
//!
//! All tests run on a paused tokio clock, so the 3000 ms re-check interval
//! and the 2000 ms terminal delay are observed exactly.
//!
//! Run with: `cargo test --test reconcile_scenarios`

mod common;

use common::{ms, pid, EventLog};
use stagegate::{
    Collaborators, InMemoryBackend, Phase, ReconcilerConfig, ReconciliationController, Stage,
    TickOutcome,
};
use std::sync::Arc;
use tokio::time::{sleep_until, Instant};

fn controller_for(backend: &Arc<InMemoryBackend>) -> ReconciliationController {
    ReconciliationController::new(
        Collaborators::from_backend(backend.clone()),
        ReconcilerConfig::default(),
    )
}

// ============================================================================
// Polling only: the pipeline finishes without the feed noticing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn pipeline_completion_is_found_by_polling() {
    let backend = Arc::new(InMemoryBackend::new());
    let project = pid("channel-a");
    backend.set_stage(&project, 0);

    let controller = controller_for(&backend);
    let log = EventLog::attach(&controller);
    let start = Instant::now();
    controller.activate(project.clone()).unwrap();

    sleep_until(start + ms(100)).await;
    assert_eq!(log.phases(), vec![Phase::Verifying, Phase::Processing]);

    // Stage reaches terminal but nothing is derived yet.
    backend.set_stage_silently(&project, 6);
    sleep_until(start + ms(3100)).await;
    assert_eq!(log.phases(), vec![Phase::Verifying, Phase::Processing]);
    let snapshot = controller.snapshot().unwrap();
    assert_eq!(snapshot.phase, Phase::Processing);
    let observed = snapshot.last_observation.unwrap();
    assert_eq!(observed.stage, Some(Stage::new(6)));
    assert_eq!(observed.has_records, Some(false));

    backend.add_derived_record(&project);
    sleep_until(start + ms(6100)).await;
    assert_eq!(
        log.phases(),
        vec![Phase::Verifying, Phase::Processing, Phase::Ready]
    );
    assert_eq!(log.published_at(Phase::Ready, start), Some(ms(6000)));
    assert_eq!(log.terminal_count(), 0);

    sleep_until(start + ms(8100)).await;
    assert_eq!(log.terminal_offsets(start), vec![ms(8000)]);

    // Nothing further is queried or published once ready.
    let queries = backend.status_query_count();
    sleep_until(start + ms(20_000)).await;
    assert_eq!(backend.status_query_count(), queries);
    assert_eq!(log.terminal_count(), 1);
}

// ============================================================================
// Feed event ahead of the scheduled tick
// ============================================================================

#[tokio::test(start_paused = true)]
async fn feed_event_wins_and_scheduled_tick_does_not_requery() {
    let backend = Arc::new(InMemoryBackend::new());
    let project = pid("channel-b");
    backend.set_stage(&project, 3);

    let controller = controller_for(&backend);
    let log = EventLog::attach(&controller);
    let start = Instant::now();
    controller.activate(project.clone()).unwrap();

    sleep_until(start + ms(1500)).await;
    assert_eq!(backend.subscriber_count(&project), 1);
    assert_eq!(backend.status_query_count(), 1);

    // The next scheduled tick is 1500 ms away when the event lands.
    backend.add_derived_record(&project);
    backend.set_stage(&project, 6);

    sleep_until(start + ms(1600)).await;
    assert_eq!(log.published_at(Phase::Ready, start), Some(ms(1500)));
    assert_eq!(backend.status_query_count(), 2);
    assert_eq!(backend.subscriber_count(&project), 0);

    // The scheduled tick at 3000 ms finds the session ready and skips both
    // queries.
    sleep_until(start + ms(3100)).await;
    assert_eq!(backend.status_query_count(), 2);
    assert_eq!(backend.existence_query_count(), 2);
    assert_eq!(log.terminal_count(), 0);

    sleep_until(start + ms(3600)).await;
    assert_eq!(log.terminal_count(), 1);
    assert_eq!(log.terminal_offsets(start), vec![ms(3500)]);

    sleep_until(start + ms(10_000)).await;
    assert_eq!(log.terminal_count(), 1);
    assert_eq!(
        log.phases(),
        vec![Phase::Verifying, Phase::Processing, Phase::Ready]
    );
}

// ============================================================================
// Controller surface
// ============================================================================

#[tokio::test(start_paused = true)]
async fn already_complete_project_is_ready_on_first_tick() {
    let backend = Arc::new(InMemoryBackend::new());
    let project = pid("channel-c");
    backend.set_stage(&project, 9);
    backend.add_derived_record(&project);

    let controller = controller_for(&backend);
    let log = EventLog::attach(&controller);
    let start = Instant::now();
    let session = controller.activate(project.clone()).unwrap();

    sleep_until(start + ms(2100)).await;
    assert_eq!(log.phases(), vec![Phase::Verifying, Phase::Ready]);
    assert_eq!(log.terminal_offsets(start), vec![ms(2000)]);

    let changes = log.changes();
    assert!(changes.iter().all(|c| c.session == session));
    assert_eq!(changes[0].previous, None);
    assert_eq!(changes[1].previous, Some(Phase::Verifying));
    assert_eq!(controller.current(), Some((project, Phase::Ready)));
}

#[tokio::test(start_paused = true)]
async fn manual_recheck_runs_an_extra_tick() {
    let backend = Arc::new(InMemoryBackend::new());
    let project = pid("channel-d");
    backend.set_stage(&project, 2);

    let controller = controller_for(&backend);
    let log = EventLog::attach(&controller);
    let start = Instant::now();
    controller.activate(project.clone()).unwrap();
    sleep_until(start + ms(500)).await;

    backend.set_stage_silently(&project, 6);
    backend.add_derived_record(&project);
    assert_eq!(controller.recheck().await, Some(TickOutcome::Ready));
    assert_eq!(log.published_at(Phase::Ready, start), Some(ms(500)));
    assert_eq!(controller.recheck().await, Some(TickOutcome::AlreadyReady));
}

#[tokio::test(start_paused = true)]
async fn deactivate_silences_the_session() {
    let backend = Arc::new(InMemoryBackend::new());
    let project = pid("channel-e");
    backend.set_stage(&project, 1);

    let controller = controller_for(&backend);
    let log = EventLog::attach(&controller);
    let start = Instant::now();
    controller.activate(project.clone()).unwrap();
    sleep_until(start + ms(100)).await;

    assert!(controller.deactivate());
    assert!(!controller.deactivate());
    assert_eq!(controller.current(), None);
    assert_eq!(controller.recheck().await, None);

    backend.add_derived_record(&project);
    backend.set_stage(&project, 6);
    sleep_until(start + ms(10_000)).await;
    assert_eq!(log.phases(), vec![Phase::Verifying, Phase::Processing]);
    assert_eq!(log.terminal_count(), 0);
    assert_eq!(backend.subscriber_count(&project), 0);
    assert_eq!(backend.status_query_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_controller_tears_down() {
    let backend = Arc::new(InMemoryBackend::new());
    let project = pid("channel-f");
    backend.set_stage(&project, 6);
    backend.add_derived_record(&project);

    let controller = controller_for(&backend);
    let log = EventLog::attach(&controller);
    let start = Instant::now();
    controller.activate(project).unwrap();
    sleep_until(start + ms(1000)).await;
    assert_eq!(log.phases(), vec![Phase::Verifying, Phase::Ready]);

    drop(controller);
    sleep_until(start + ms(5000)).await;
    assert_eq!(log.terminal_count(), 0);
}

// ============================================================================
// Handlers reading controller state
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handlers_can_read_controller_state() {
    let backend = Arc::new(InMemoryBackend::new());
    let first = pid("channel-g");
    let second = pid("channel-h");
    for project in [&first, &second] {
        backend.set_stage(project, 6);
        backend.add_derived_record(project);
    }

    let mut config = ReconcilerConfig::default();
    config.terminal_delay_ms = 50;
    let controller = Arc::new(ReconciliationController::new(
        Collaborators::from_backend(backend.clone()),
        config,
    ));

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let weak = Arc::downgrade(&controller);
        let seen = seen.clone();
        controller.on_phase_change(move |change| {
            if let Some(controller) = weak.upgrade() {
                let current = controller.current();
                let snapshot = controller.snapshot().map(|s| s.phase);
                seen.lock().unwrap().push((change.phase, current.map(|(_, p)| p), snapshot));
            }
        });
    }
    let (terminal_tx, mut terminal_rx) = tokio::sync::mpsc::unbounded_channel();
    {
        let weak = Arc::downgrade(&controller);
        controller.on_terminal(move |signal| {
            let phase = weak
                .upgrade()
                .and_then(|controller| controller.current())
                .map(|(_, phase)| phase);
            let _ = terminal_tx.send((signal.project.clone(), phase));
        });
    }

    let wait = ms(5000);
    let activating = controller.clone();
    let project = first.clone();
    tokio::time::timeout(
        wait,
        tokio::task::spawn_blocking(move || activating.activate(project)),
    )
    .await
    .expect("activate returned")
    .unwrap()
    .unwrap();

    let (ready_project, phase) = tokio::time::timeout(wait, terminal_rx.recv())
        .await
        .expect("terminal signal arrived")
        .unwrap();
    assert_eq!(ready_project, first);
    assert_eq!(phase, Some(Phase::Ready));

    // Switching projects while the new session's handlers read state.
    let activating = controller.clone();
    let project = second.clone();
    tokio::time::timeout(
        wait,
        tokio::task::spawn_blocking(move || activating.activate(project)),
    )
    .await
    .expect("switching projects returned")
    .unwrap()
    .unwrap();
    let (ready_project, _) = tokio::time::timeout(wait, terminal_rx.recv())
        .await
        .expect("terminal signal for second project")
        .unwrap();
    assert_eq!(ready_project, second);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (Phase::Verifying, Some(Phase::Verifying), Some(Phase::Verifying)),
            (Phase::Ready, Some(Phase::Ready), Some(Phase::Ready)),
            (Phase::Verifying, Some(Phase::Verifying), Some(Phase::Verifying)),
            (Phase::Ready, Some(Phase::Ready), Some(Phase::Ready)),
        ]
    );
    assert!(controller.deactivate());
}
