mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::{config, manager, recorder, wait_for, FakeBackend};
use framehub::error::{ConsumerError, StreamError};
use framehub::stream::{CallbackConsumer, FrameConsumer};
use framehub::{CaptureConfig, Frame, SourceStatus};

/// Records `(sequence, opens so far)` at the moment each frame is delivered
fn open_tracker(fake: &Arc<FakeBackend>) -> (Arc<dyn FrameConsumer>, Arc<Mutex<Vec<(u64, usize)>>>) {
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deliveries);
    let fake = Arc::clone(fake);
    let consumer = CallbackConsumer::new("tracker", move |frame: &Frame| {
        sink.lock().unwrap().push((frame.sequence(), fake.opens()));
        Ok::<(), ConsumerError>(())
    });
    (Arc::new(consumer), deliveries)
}

#[test]
fn detached_consumer_stops_at_the_detach_point() {
    let fake = FakeBackend::new();
    let manager = manager(&fake, config());
    manager.start_stream("cam", manager.device("/dev/fake0")).unwrap();

    let (a, seen_a) = recorder("a");
    let (b, seen_b) = recorder("b");
    assert_eq!(manager.attach("cam", a).unwrap(), SourceStatus::Running);
    manager.attach("cam", b).unwrap();

    fake.frames(5);
    assert!(wait_for(|| seen_b.lock().unwrap().len() == 5));
    assert!(manager.detach("cam", "a"));
    assert!(!manager.detach("cam", "a"));

    fake.frames(5);
    assert!(wait_for(|| seen_b.lock().unwrap().len() == 10));
    manager.stop_all();

    assert_eq!(*seen_a.lock().unwrap(), (0..5).collect::<Vec<u64>>());
    assert_eq!(*seen_b.lock().unwrap(), (0..10).collect::<Vec<u64>>());
}

#[test]
fn reinitializes_once_when_failures_reach_the_threshold() {
    let fake = FakeBackend::new();
    let manager = manager(
        &fake,
        CaptureConfig {
            reinit_after_failures: 3,
            ..config()
        },
    );

    fake.hold();
    manager.start_stream("cam", manager.device("/dev/fake0")).unwrap();
    let (tracker, deliveries) = open_tracker(&fake);
    manager.attach("cam", tracker).unwrap();

    fake.failures(5);
    fake.frames(3);
    fake.release();

    assert!(wait_for(|| deliveries.lock().unwrap().len() == 3));
    assert!(manager.stats("cam").unwrap().reinitializations >= 1);
    manager.stop_all();

    // Initial open plus exactly one reopen before the first good frame
    assert_eq!(*deliveries.lock().unwrap(), vec![(0, 2), (1, 2), (2, 2)]);
    assert_eq!(fake.opens(), fake.closes());
}

#[test]
fn failures_below_threshold_neither_reopen_nor_advance_the_count() {
    let fake = FakeBackend::new();
    let manager = manager(
        &fake,
        CaptureConfig {
            reinit_after_failures: 3,
            ..config()
        },
    );

    fake.hold();
    manager.start_stream("cam", manager.device("/dev/fake0")).unwrap();
    let (tracker, deliveries) = open_tracker(&fake);
    manager.attach("cam", tracker).unwrap();

    fake.failures(2);
    fake.frames(1);
    fake.failures(2);
    fake.frames(2);
    fake.release();

    assert!(wait_for(|| deliveries.lock().unwrap().len() == 3));
    assert_eq!(manager.stats("cam").unwrap().frame_count, 3);
    manager.stop_all();

    assert_eq!(*deliveries.lock().unwrap(), vec![(0, 1), (1, 1), (2, 1)]);
}

#[test]
fn stop_releases_the_device_and_drops_consumers() {
    let fake = FakeBackend::new();
    let manager = manager(&fake, config());
    manager.start_stream("cam", manager.device("/dev/fake0")).unwrap();

    let (a, seen) = recorder("a");
    manager.attach("cam", a).unwrap();
    fake.frames(2);
    assert!(wait_for(|| seen.lock().unwrap().len() == 2));
    assert_eq!(fake.opens(), 1);

    assert!(manager.stop_stream("cam"));
    assert_eq!(fake.closes(), 1);
    assert!(!manager.is_running("cam"));
    assert!(manager.stats("cam").is_none());
    assert!(!manager.stop_stream("cam"));

    // Restarting opens a fresh handle and starts with no consumers
    manager.start_stream("cam", manager.device("/dev/fake0")).unwrap();
    let stats = manager.stats("cam").unwrap();
    assert_eq!(stats.status, SourceStatus::Running);
    assert_eq!(stats.consumer_count, 0);
    assert_eq!(fake.opens(), 2);

    manager.stop_all();
    manager.stop_all();
    assert_eq!(fake.closes(), 2);
}

#[test]
fn late_joiner_receives_the_latest_frame_immediately() {
    let fake = FakeBackend::new();
    let manager = manager(&fake, config());
    manager.start_stream("cam", manager.device("/dev/fake0")).unwrap();
    assert!(manager.latest_frame("cam").is_none());

    fake.frames(3);
    assert!(wait_for(|| manager
        .latest_frame("cam")
        .map(|f| f.sequence() == 2)
        .unwrap_or(false)));

    let (late, seen) = recorder("late");
    manager.attach("cam", late).unwrap();
    // Delivered during attach, before any further capture
    assert_eq!(*seen.lock().unwrap(), vec![2]);

    fake.frames(1);
    assert!(wait_for(|| seen.lock().unwrap().len() == 2));
    manager.stop_all();

    assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
}

#[test]
fn faulty_consumers_are_pruned_without_affecting_others() {
    let fake = FakeBackend::new();
    let manager = manager(&fake, config());
    manager.start_stream("cam", manager.device("/dev/fake0")).unwrap();

    let failing_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&failing_calls);
    manager
        .attach(
            "cam",
            Arc::new(CallbackConsumer::new("failing", move |_: &Frame| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConsumerError::Failed("boom".into()))
            })),
        )
        .unwrap();
    manager
        .attach(
            "cam",
            Arc::new(CallbackConsumer::new("panicking", |_: &Frame| -> Result<(), ConsumerError> {
                panic!("consumer bug")
            })),
        )
        .unwrap();
    let (healthy, seen) = recorder("healthy");
    manager.attach("cam", healthy).unwrap();

    fake.frames(3);
    assert!(wait_for(|| seen.lock().unwrap().len() == 3));

    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats("cam").unwrap().consumer_count, 1);
    assert!(manager.is_running("cam"));
    manager.stop_all();
}

#[test]
fn attach_reports_unknown_streams_and_duplicate_ids() {
    let fake = FakeBackend::new();
    let manager = manager(&fake, config());

    let (a, _) = recorder("a");
    assert!(matches!(
        manager.attach("nope", Arc::clone(&a)),
        Err(StreamError::NotFound(id)) if id == "nope"
    ));

    manager.start_stream("cam", manager.device("/dev/fake0")).unwrap();
    manager.attach("cam", Arc::clone(&a)).unwrap();
    assert!(matches!(
        manager.attach("cam", a),
        Err(StreamError::DuplicateConsumer { consumer, .. }) if consumer == "a"
    ));
    manager.stop_all();
}

#[test]
fn unopenable_device_leaves_the_stream_in_error() {
    let fake = FakeBackend::new();
    let manager = manager(&fake, config());

    let mut device = manager.device("/dev/fake0");
    device.backends = vec!["v4l2-missing".into()];
    let err = manager.start_stream("cam", device).unwrap_err();
    assert!(matches!(err, StreamError::Start(ref e) if e.attempts.len() == 1));
    assert_eq!(fake.opens(), 0);

    let stats = manager.stats("cam").unwrap();
    assert_eq!(stats.status, SourceStatus::Error);
    assert!(stats.last_error.is_some());

    let (a, _) = recorder("a");
    assert_eq!(manager.attach("cam", a).unwrap(), SourceStatus::Error);

    manager.start_stream("cam", manager.device("/dev/fake0")).unwrap();
    assert!(manager.is_running("cam"));
    manager.stop_all();
}

#[test]
fn consumer_detaching_itself_on_the_catch_up_frame_does_not_stall_the_stream() {
    let fake = FakeBackend::new();
    let manager = Arc::new(manager(&fake, config()));
    manager.start_stream("cam", manager.device("/dev/fake0")).unwrap();

    let (steady, seen) = recorder("steady");
    manager.attach("cam", steady).unwrap();
    fake.frames(1);
    assert!(wait_for(|| seen.lock().unwrap().len() == 1));

    let handle = Arc::clone(&manager);
    let oneshot = CallbackConsumer::new("oneshot", move |_: &Frame| {
        handle.detach("cam", "oneshot");
        Ok::<(), ConsumerError>(())
    });

    let attacher = Arc::clone(&manager);
    let (done_tx, done_rx) = flume::bounded(1);
    std::thread::spawn(move || {
        let status = attacher.attach("cam", Arc::new(oneshot)).map_err(|e| e.to_string());
        let _ = done_tx.send(status);
    });
    let status = done_rx
        .recv_timeout(std::time::Duration::from_secs(3))
        .expect("attach returned");
    assert_eq!(status, Ok(SourceStatus::Running));

    // The capture thread still delivers to everyone else
    fake.frames(2);
    assert!(wait_for(|| seen.lock().unwrap().len() == 3));
    assert_eq!(manager.stats("cam").unwrap().consumer_count, 1);
    manager.stop_all();
}

#[test]
fn concurrent_starts_of_one_stream_open_the_device_once() {
    let fake = FakeBackend::new();
    let manager = Arc::new(manager(&fake, config()));

    for round in 1..=20 {
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let starters: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    manager
                        .start_stream("cam", manager.device("/dev/fake0"))
                        .map_err(|e| e.to_string())
                })
            })
            .collect();
        for starter in starters {
            assert_eq!(starter.join().unwrap(), Ok(()));
        }

        assert_eq!(fake.opens(), round);
        assert!(manager.is_running("cam"));

        // A consumer on the live source survives a later start
        let (steady, _) = recorder("steady");
        manager.attach("cam", steady).unwrap();
        manager.start_stream("cam", manager.device("/dev/fake0")).unwrap();
        assert_eq!(manager.stats("cam").unwrap().consumer_count, 1);

        assert!(manager.stop_stream("cam"));
        assert_eq!(fake.closes(), round);
    }
}
