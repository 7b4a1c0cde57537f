use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tickbot_cache::{CacheError, CacheNamespace, CacheView, EntityCache, view_as};

static CONSTRUCTIONS: AtomicUsize = AtomicUsize::new(0);

fn build_cache() -> EntityCache {
    CONSTRUCTIONS.fetch_add(1, Ordering::SeqCst);
    EntityCache::builder()
        .namespace(CacheNamespace::from_fn("player", 1, || Ok("Nameless One".to_string())))
        .build()
        .unwrap()
}

// The global can only be connected once per process, so the whole lifecycle
// lives in one test.
#[test]
fn test_global_instance_lifecycle() {
    assert!(!EntityCache::is_host_connected());
    assert!(matches!(EntityCache::get_instance(), Err(CacheError::NotReady)));

    EntityCache::connect_host(build_cache).unwrap();
    assert!(EntityCache::is_host_connected());
    assert_eq!(CONSTRUCTIONS.load(Ordering::SeqCst), 0);

    const CALLERS: usize = 8;
    let barrier = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                EntityCache::get_instance().unwrap()
            })
        })
        .collect();
    let instances: Vec<Arc<EntityCache>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(CONSTRUCTIONS.load(Ordering::SeqCst), 1);
    assert!(instances.iter().all(|c| Arc::ptr_eq(c, &instances[0])));

    instances[0].refresh_if_due(1);
    let view: &dyn CacheView = instances[1].as_ref();
    assert_eq!(*view_as::<String>(view, "player").unwrap(), "Nameless One");
    assert_eq!(view.current_tick(), 1);

    assert!(matches!(
        EntityCache::connect_host(build_cache),
        Err(CacheError::AlreadyConnected)
    ));
}
