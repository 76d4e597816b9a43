use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use drwatch::{Error, Trap};
use lazy_static::lazy_static;

lazy_static! {
    // Trap handlers are process-wide, so tests that arm slots must not overlap.
    static ref SLOTS: Mutex<()> = Mutex::new(());
}

/// Hold for the duration of a test that installs watchpoints.
pub fn serial() -> MutexGuard<'static, ()> {
    SLOTS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Check whether this environment lets a helper attach to our threads.
pub fn can_trace() -> bool {
    match drwatch::inspect() {
        Ok(_) => true,
        Err(err @ Error::AttachDenied { .. }) => {
            eprintln!("skipping: {err}");
            false
        },
        Err(err) => panic!("unexpected handshake failure: {err:?}"),
    }
}

/// A trap handler that counts its invocations.
#[allow(unused)]
pub fn counter() -> (Arc<AtomicUsize>, impl Fn(&Trap) + Send + Sync) {
    let count = Arc::new(AtomicUsize::new(0));
    let handled = Arc::clone(&count);

    let handler = move |_: &Trap| {
        handled.fetch_add(1, Ordering::SeqCst);
    };

    (count, handler)
}

#[allow(unused)]
pub fn hits(count: &AtomicUsize) -> usize {
    count.load(Ordering::SeqCst)
}
