//! Subscriber registry shared by connection-state changes and telemetry.
//!
//! Each subscriber gets a `Subscription` token back; handing it to
//! `unsubscribe` removes exactly that subscriber. A listener that panics is
//! logged and skipped, and the remaining listeners still see the event.

use crate::sensor::BleEvent;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type Listener = Arc<dyn Fn(&BleEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(Subscription, Listener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&BleEvent) + Send + Sync + 'static,
    {
        let token = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener: Listener = Arc::new(listener);
        self.lock().push((token, listener));
        token
    }

    /// Returns false if the token was already removed.
    pub fn unsubscribe(&self, token: Subscription) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(t, _)| *t != token);
        listeners.len() != before
    }

    /// Delivers `event` to every listener and returns how many returned normally.
    pub fn emit(&self, event: &BleEvent) -> usize {
        // Snapshot so listeners can (un)subscribe from inside a callback
        let snapshot: Vec<(Subscription, Listener)> = self.lock().clone();

        let mut delivered = 0;
        for (token, listener) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => log::error!("listener {:?} panicked while handling {:?}", token, event),
            }
        }
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(Subscription, Listener)>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
