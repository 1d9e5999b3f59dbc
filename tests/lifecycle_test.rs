mod common;

use candle_chatbot::backend::DeviceBackend;
use candle_chatbot::state::model_manager::{spawn_idle_reaper, ModelLifecycleManager};
use common::{CountingBackend, MockEngine, MockLoader};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

const IDLE: Duration = Duration::from_secs(60);

fn setup(loader: MockLoader) -> (Arc<ModelLifecycleManager>, Arc<CountingBackend>) {
    let backend = Arc::new(CountingBackend::new());
    let manager = ModelLifecycleManager::new(
        Box::new(loader),
        backend.clone() as Arc<dyn DeviceBackend>,
    );
    (Arc::new(manager), backend)
}

#[test]
fn test_concurrent_acquire_loads_once() {
    let loader = MockLoader::new(MockEngine::new("hi")).with_delay(Duration::from_millis(50));
    let (manager, _) = setup(loader.clone());

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let manager = manager.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                manager.acquire().is_some()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
    assert_eq!(loader.load_count(), 1);
    assert!(manager.is_loaded());
}

#[test]
fn test_unload_if_idle_respects_threshold() {
    let (manager, backend) = setup(MockLoader::new(MockEngine::new("hi")));
    assert!(!manager.unload_if_idle(IDLE), "nothing to unload yet");

    assert!(manager.ensure_loaded());
    let loaded_at = Instant::now();
    let releases = backend.release_count();

    assert!(!manager.unload_if_idle_at(loaded_at, IDLE));
    assert!(manager.is_loaded());

    assert!(manager.unload_if_idle_at(loaded_at + Duration::from_secs(61), IDLE));
    assert!(!manager.is_loaded());
    assert!(backend.release_count() > releases);
    assert!(!manager.unload_if_idle_at(loaded_at + Duration::from_secs(120), IDLE));
}

#[test]
fn test_reload_after_unload() {
    let loader = MockLoader::new(MockEngine::new("hi"));
    let (manager, _) = setup(loader.clone());
    assert!(manager.ensure_loaded());
    assert!(manager.unload());
    assert!(manager.ensure_loaded());
    assert_eq!(loader.load_count(), 2);
}

#[test]
fn test_failed_load_is_retried() {
    let loader = MockLoader::new(MockEngine::new("hi"));
    let (manager, backend) = setup(loader.clone());

    loader.set_failing(true);
    assert!(manager.acquire().is_none());
    assert!(!manager.is_loaded());
    assert_eq!(loader.load_count(), 1);
    // stale memory before the attempt, scratch memory after the failure
    assert_eq!(backend.release_count(), 2);

    loader.set_failing(false);
    assert!(manager.acquire().is_some());
    assert_eq!(loader.load_count(), 2);
}

#[test]
fn test_health_does_not_count_as_use() {
    let (manager, _) = setup(MockLoader::new(MockEngine::new("hi")));
    manager.ensure_loaded();
    let after_load = Instant::now();

    std::thread::sleep(Duration::from_millis(20));
    for _ in 0..3 {
        let health = manager.health();
        assert!(health.is_loaded);
        assert_eq!(health.device, "mock:0");
        assert_eq!(health.model_name, "mock/gemma");
        assert!(health.device_available);
        assert_eq!(health.memory.unwrap().allocated_mb, 512.0);
    }

    assert!(manager.unload_if_idle_at(after_load + IDLE + Duration::from_secs(1), IDLE));
}

#[test]
fn test_idle_unload_waits_for_running_generation() {
    let loader = MockLoader::new(MockEngine::new("hi"));
    let (manager, _) = setup(loader.clone());

    let in_use = manager.acquire().unwrap();
    let acquired_at = Instant::now();
    assert!(!manager.unload_if_idle_at(acquired_at + Duration::from_secs(61), IDLE));
    assert!(manager.is_loaded());

    let second = manager.acquire().unwrap();
    assert_eq!(loader.load_count(), 1);
    assert!(Arc::ptr_eq(&in_use, &second));

    drop(in_use);
    drop(second);
    assert!(manager.unload_if_idle_at(Instant::now() + Duration::from_secs(61), IDLE));
    assert!(!manager.is_loaded());
}

#[test]
fn test_missing_accelerator_blocks_load() {
    let loader = MockLoader::new(MockEngine::new("hi"));
    let mut backend = CountingBackend::new();
    backend.available = false;
    let manager = ModelLifecycleManager::new(Box::new(loader.clone()), Arc::new(backend))
        .with_require_accelerator(true);

    assert!(!manager.ensure_loaded());
    assert_eq!(loader.load_count(), 0);
    assert!(!manager.health().device_available);
}

#[tokio::test]
async fn test_idle_reaper_unloads() {
    let (manager, _) = setup(MockLoader::new(MockEngine::new("hi")));
    assert!(manager.ensure_loaded());

    let reaper = spawn_idle_reaper(manager.clone(), Duration::from_millis(10), Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(200)).await;
    reaper.abort();

    assert!(!manager.is_loaded());
}
