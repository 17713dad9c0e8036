mod fixtures;
mod helpers;

use obstacle_watch::models::analysis::AnalyzeConfig;
use obstacle_watch::services::realtime::{CapturePhase, CaptureSettings, RealtimeCaptureService};
use std::sync::Arc;
use std::time::{Duration, Instant};

use helpers::{wait_until, CountingOpener, Gate, ScriptedDetector};

const PATIENCE: Duration = Duration::from_secs(5);

fn service() -> (Arc<RealtimeCaptureService>, Arc<CountingOpener>) {
    build_service(ScriptedDetector::default(), Duration::from_secs(1))
}

/// A service whose detector blocks until `gate` opens, so a running loop
/// cannot notice a stop request in time.
fn stuck_service(gate: &Gate) -> (Arc<RealtimeCaptureService>, Arc<CountingOpener>) {
    build_service(ScriptedDetector::gated(gate.clone()), Duration::from_millis(200))
}

fn build_service(
    detector: ScriptedDetector,
    join_timeout: Duration,
) -> (Arc<RealtimeCaptureService>, Arc<CountingOpener>) {
    let opener = Arc::new(CountingOpener::default());
    let service = RealtimeCaptureService::new(
        Arc::new(detector),
        opener.clone(),
        CaptureSettings {
            join_timeout,
            retry_delay: Duration::from_millis(20),
        },
    );
    service.configure("cam-a", helpers::test_config());
    (Arc::new(service), opener)
}

#[test]
fn test_balanced_acquire_release_stops_loop() {
    let (service, opener) = service();

    for _ in 0..3 {
        service.acquire();
    }
    assert_eq!(service.viewer_count(), 3);
    assert!(wait_until(PATIENCE, || service.snapshot().frame_id > 0));
    assert_eq!(service.phase(), CapturePhase::Running);

    for _ in 0..3 {
        service.release();
    }
    assert_eq!(service.viewer_count(), 0);
    assert!(wait_until(PATIENCE, || opener.live() == 0));
    assert!(wait_until(PATIENCE, || service.phase() == CapturePhase::Idle));
    assert_eq!(service.active_source(), None);

    // One loop served all three viewers
    assert_eq!(opener.opened(), vec!["cam-a".to_string()]);
    assert_eq!(opener.max_live(), 1);
}

#[test]
fn test_release_without_acquire_is_ignored() {
    let (service, opener) = service();
    service.release();
    assert_eq!(service.viewer_count(), 0);
    assert_eq!(service.phase(), CapturePhase::Idle);
    assert!(opener.opened().is_empty());
}

#[test]
fn test_snapshot_frame_id_never_decreases() {
    let (service, _opener) = service();
    service.acquire();

    let mut last = 0;
    let mut advanced = 0;
    assert!(wait_until(PATIENCE, || {
        let frame_id = service.snapshot().frame_id;
        assert!(frame_id >= last, "frame id went from {last} to {frame_id}");
        if frame_id > last {
            advanced += 1;
        }
        last = frame_id;
        advanced >= 5
    }));

    let state = service.snapshot();
    assert!(state.jpeg.is_some());
    assert_eq!((state.width, state.height), (fixtures::FRAME_WIDTH, fixtures::FRAME_HEIGHT));
    assert_eq!(state.detections.len(), 1);
    service.release();
}

#[test]
fn test_reconfigure_with_viewer_switches_source() {
    let (service, opener) = service();
    service.acquire();
    assert!(wait_until(PATIENCE, || service.snapshot().frame_id > 0));

    service.configure("cam-b", helpers::test_config());

    assert!(wait_until(PATIENCE, || {
        opener.opened().last().map(String::as_str) == Some("cam-b") && opener.live() == 1
    }));
    assert_eq!(service.active_source().as_deref(), Some("cam-b"));
    assert_eq!(opener.max_live(), 1);

    // The new loop keeps publishing past the old frame ids
    let before = service.snapshot().frame_id;
    assert!(wait_until(PATIENCE, || service.snapshot().frame_id > before));

    service.release();
    assert!(wait_until(PATIENCE, || opener.live() == 0));
}

#[test]
fn test_reconfigure_without_viewers_does_not_start() {
    let (service, opener) = service();
    service.configure("cam-b", helpers::test_config());
    std::thread::sleep(Duration::from_millis(50));
    assert!(opener.opened().is_empty());
    assert_eq!(service.phase(), CapturePhase::Idle);

    service.acquire();
    assert!(wait_until(PATIENCE, || opener.live() == 1));
    assert_eq!(opener.opened(), vec!["cam-b".to_string()]);
    service.release();
}

#[test]
fn test_config_change_applies_without_restart() {
    let (service, opener) = service();
    service.acquire();
    assert!(wait_until(PATIENCE, || service.snapshot().detections.len() == 1));

    // Nothing clears a confidence of 1.0
    service.configure(
        "cam-a",
        AnalyzeConfig {
            confidence_threshold: 1.0,
            ..helpers::test_config()
        },
    );
    assert!(wait_until(PATIENCE, || service.snapshot().detections.is_empty()));
    assert_eq!(opener.opened().len(), 1);
    service.release();
}

#[test]
fn test_quick_reacquire_keeps_single_loop() {
    let (service, opener) = service();
    for _ in 0..5 {
        service.acquire();
        service.release();
    }
    service.acquire();

    assert!(wait_until(PATIENCE, || service.phase() == CapturePhase::Running));
    assert!(wait_until(PATIENCE, || opener.live() == 1));
    assert_eq!(opener.max_live(), 1);
    assert_eq!(service.active_source().as_deref(), Some("cam-a"));

    service.release();
    assert!(wait_until(PATIENCE, || opener.live() == 0));
}

#[test]
fn test_unavailable_source_retries_until_stopped() {
    let (service, opener) = service();
    service.configure("missing", helpers::test_config());
    service.acquire();

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(service.phase(), CapturePhase::Starting);
    assert_eq!(service.snapshot().frame_id, 0);

    service.release();
    assert!(wait_until(PATIENCE, || service.phase() == CapturePhase::Idle));
    assert!(opener.opened().is_empty());
}

#[test]
fn test_slow_loop_hands_source_to_successor() {
    let gate = Gate::default();
    let (service, opener) = stuck_service(&gate);
    service.acquire();
    assert!(wait_until(PATIENCE, || opener.live() == 1));

    // Returns after the bounded join even though the old loop is stuck
    service.configure("cam-b", helpers::test_config());
    assert_eq!(service.active_source().as_deref(), Some("cam-b"));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(opener.opened(), vec!["cam-a".to_string()]);
    assert_eq!(opener.live(), 1);

    gate.open();
    assert!(wait_until(PATIENCE, || {
        opener.opened().last().map(String::as_str) == Some("cam-b") && opener.live() == 1
    }));
    assert_eq!(opener.max_live(), 1);

    service.release();
    assert!(wait_until(PATIENCE, || opener.live() == 0));
}

#[test]
fn test_second_reconfigure_during_handoff_keeps_single_loop() {
    let gate = Gate::default();
    let (service, opener) = stuck_service(&gate);
    service.acquire();
    assert!(wait_until(PATIENCE, || opener.live() == 1));

    service.configure("cam-b", helpers::test_config());
    service.configure("cam-c", helpers::test_config());
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(opener.live(), 1);
    assert_eq!(opener.opened(), vec!["cam-a".to_string()]);

    gate.open();
    assert!(wait_until(PATIENCE, || {
        opener.opened().last().map(String::as_str) == Some("cam-c") && opener.live() == 1
    }));
    // The cancelled cam-b loop never opened its source
    assert_eq!(opener.opened(), vec!["cam-a".to_string(), "cam-c".to_string()]);
    assert_eq!(opener.max_live(), 1);
    assert_eq!(service.active_source().as_deref(), Some("cam-c"));

    service.release();
    assert!(wait_until(PATIENCE, || opener.live() == 0));
}

#[test]
fn test_release_does_not_wait_for_restart() {
    let gate = Gate::default();
    let (service, opener) = build_service(
        ScriptedDetector::gated(gate.clone()),
        Duration::from_secs(1),
    );
    service.acquire();
    service.acquire();
    assert!(wait_until(PATIENCE, || opener.live() == 1));

    let restarting = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || service.configure("cam-b", helpers::test_config()))
    };
    std::thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    service.release();
    assert_eq!(service.viewer_count(), 1);
    assert!(
        started.elapsed() < Duration::from_millis(300),
        "release blocked for {:?}",
        started.elapsed()
    );

    gate.open();
    restarting.join().unwrap();
    service.release();
    assert!(wait_until(PATIENCE, || opener.live() == 0));
    assert_eq!(opener.max_live(), 1);
}

#[test]
fn test_concurrent_churn_settles_on_last_source() {
    let (service, opener) = service();

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let service = Arc::clone(&service);
            std::thread::spawn(move || {
                for i in 0..15 {
                    service.acquire();
                    service.configure(&format!("cam-{}", (worker + i) % 3), helpers::test_config());
                    service.release();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(service.viewer_count(), 0);

    service.configure("cam-final", helpers::test_config());
    service.acquire();
    assert!(wait_until(PATIENCE, || {
        opener.opened().last().map(String::as_str) == Some("cam-final") && opener.live() == 1
    }));
    assert_eq!(service.active_source().as_deref(), Some("cam-final"));
    assert_eq!(opener.max_live(), 1);

    service.release();
    assert!(wait_until(PATIENCE, || opener.live() == 0));
    assert_eq!(opener.max_live(), 1);
}

#[tokio::test]
async fn test_viewer_wakes_on_new_frames() {
    let (service, opener) = service();
    {
        let mut viewer = service.viewer();
        assert_eq!(service.viewer_count(), 1);

        let mut last = 0;
        for _ in 0..5 {
            let frame = tokio::time::timeout(PATIENCE, viewer.next_frame())
                .await
                .expect("no frame in time")
                .expect("capture service gone");
            assert!(frame.frame_id > last);
            last = frame.frame_id;
        }
    }

    // Dropping the viewer released it
    assert_eq!(service.viewer_count(), 0);
    assert!(wait_until(PATIENCE, || opener.live() == 0));
}
