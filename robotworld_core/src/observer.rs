//! World change notification.

use crate::sync::lock;
use crate::trace::Trace;
use crate::world::RobotWorld;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Receives a callback after every notifying world mutation.
///
/// The callback runs synchronously on the mutating thread, after the
/// world's lock has been released, so reading the world is fine. It must
/// not mutate the world directly; use [`RobotWorld::defer`] instead.
/// Observers get no diff and should re-read whatever they display.
pub trait WorldObserver: Send + Sync {
    fn on_world_changed(&self, world: &RobotWorld);
}

impl<F> WorldObserver for F
where
    F: Fn(&RobotWorld) + Send + Sync,
{
    fn on_world_changed(&self, world: &RobotWorld) {
        self(world)
    }
}

/// Token returned by `attach`, used to detach again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

/// Attached observers plus the global on/off switch.
pub(crate) struct ObserverRegistry {
    observers: Mutex<Vec<(ObserverHandle, Arc<dyn WorldObserver>)>>,
    next_handle: AtomicU64,
    enabled: AtomicBool,
}

impl ObserverRegistry {
    pub(crate) fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            enabled: AtomicBool::new(true),
        }
    }

    pub(crate) fn attach(&self, observer: Arc<dyn WorldObserver>) -> ObserverHandle {
        let handle = ObserverHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        lock(&self.observers).push((handle, observer));
        handle
    }

    pub(crate) fn detach(&self, handle: ObserverHandle) -> bool {
        let mut observers = lock(&self.observers);
        let before = observers.len();
        observers.retain(|(h, _)| *h != handle);
        observers.len() != before
    }

    pub(crate) fn clear(&self) {
        lock(&self.observers).clear();
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.observers).len()
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Copy of the observer list, so callbacks run without the list locked.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn WorldObserver>> {
        lock(&self.observers)
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect()
    }
}

/// Logs the full world dump to the trace sink on every change.
pub struct WorldTracer {
    trace: Arc<Trace>,
}

impl WorldTracer {
    pub fn new(trace: Arc<Trace>) -> Self {
        Self { trace }
    }
}

impl WorldObserver for WorldTracer {
    fn on_world_changed(&self, world: &RobotWorld) {
        self.trace.trace(&world.as_debug_string());
    }
}
