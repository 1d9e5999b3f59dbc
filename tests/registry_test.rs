use candle_chatbot::state::abort::AbortSignal;
use candle_chatbot::state::request_registry::RequestRegistry;
use candle_chatbot::state::shutdown::ShutdownCoordinator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[test]
fn test_size_tracks_register_and_unregister() {
    let registry = RequestRegistry::new();
    for i in 0..10 {
        registry.register(format!("req-{i}"), Arc::new(AbortSignal::new()));
    }
    assert_eq!(registry.len(), 10);
    for i in 0..10 {
        registry.unregister(&format!("req-{i}"));
    }
    // unknown ids are a no-op
    registry.unregister("req-0");
    assert!(registry.is_empty());
}

#[test]
fn test_signal_all_covers_requests_registered_before_it() {
    let registry = RequestRegistry::new();
    let early: Vec<_> = (0..100)
        .map(|i| {
            let signal = Arc::new(AbortSignal::new());
            registry.register(format!("early-{i}"), signal.clone());
            signal
        })
        .collect();

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let registry = registry.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                registry.register(format!("late-{i}"), Arc::new(AbortSignal::new()));
                i += 1;
            }
        })
    };

    let signalled = registry.signal_all();
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();

    assert!(signalled >= 100);
    assert!(early.iter().all(|s| s.is_set()));
}

#[test]
fn test_concurrent_tracking_drains() {
    let registry = RequestRegistry::new();
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    let guard =
                        registry.track(format!("{t}-{i}"), Arc::new(AbortSignal::new()));
                    guard.finish();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(registry.is_empty());
}

#[test]
fn test_shutdown_signals_tracked_requests() {
    let registry = RequestRegistry::new();
    let coordinator = ShutdownCoordinator::new(registry.clone());
    let signal = Arc::new(AbortSignal::new());
    let guard = registry.track("req".to_string(), signal.clone());

    assert_eq!(coordinator.request_shutdown(), 1);
    assert!(signal.is_set());
    assert!(guard.signal().is_set());
    guard.finish();
    assert!(registry.is_empty());
}
