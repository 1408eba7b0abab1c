// SPDX-License-Identifier: MIT OR Apache-2.0

//! Observer lists backing the transport event surface.
//!
//! Each event kind owns an explicit list of subscribed callbacks.
//! Unsubscribing removes the handler before the next dispatch: `emit`
//! snapshots the list, then re-checks membership immediately before each
//! invocation, so a handler never fires after its own unsubscribe returned.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Token returned by handler registrations, unique per transport instance
/// across all event kinds.
pub type HandlerId = u64;

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

pub struct Handlers<A> {
    entries: Mutex<Vec<(HandlerId, Callback<A>)>>,
}

impl<A> Handlers<A> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, id: HandlerId, callback: impl Fn(&A) + Send + Sync + 'static) {
        self.entries.lock().push((id, Arc::new(callback)));
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Invoke every currently subscribed handler with `arg`.
    ///
    /// Panics are caught and returned as messages so the dispatching task
    /// survives a misbehaving handler. The lock is not held while a handler
    /// runs, so handlers may subscribe and unsubscribe freely.
    pub fn emit(&self, arg: &A) -> Vec<String> {
        let snapshot: Vec<(HandlerId, Callback<A>)> = self.entries.lock().clone();
        let mut panics = Vec::new();
        for (id, callback) in snapshot {
            let still_subscribed = self
                .entries
                .lock()
                .iter()
                .any(|(entry_id, _)| *entry_id == id);
            if !still_subscribed {
                continue;
            }
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(arg))) {
                panics.push(panic_message(panic));
            }
        }
        panics
    }
}

impl<A> Default for Handlers<A> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Allocates handler ids shared across the event kinds of one transport,
/// so a single `unsubscribe(id)` entry point can serve them all.
pub struct HandlerIds {
    next: AtomicU64,
}

impl HandlerIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> HandlerId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for HandlerIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_every_handler() {
        let handlers: Handlers<u32> = Handlers::new();
        let count = Arc::new(AtomicUsize::new(0));

        for id in 1..=3 {
            let count = count.clone();
            handlers.insert(id, move |value: &u32| {
                count.fetch_add(*value as usize, Ordering::SeqCst);
            });
        }

        let panics = handlers.emit(&2);
        assert!(panics.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn removed_handler_does_not_fire() {
        let handlers: Handlers<()> = Handlers::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_a = count.clone();
        handlers.insert(1, move |_: &()| {
            count_a.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handlers.remove(1));
        assert!(!handlers.remove(1));
        handlers.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_unsubscribed_during_dispatch_is_skipped() {
        // Handler 1 removes handler 2 while the emit is in flight; the
        // membership re-check must keep handler 2 from firing.
        let handlers: Arc<Handlers<()>> = Arc::new(Handlers::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let handlers_inner = handlers.clone();
        handlers.insert(1, move |_: &()| {
            handlers_inner.remove(2);
        });
        let fired_inner = fired.clone();
        handlers.insert(2, move |_: &()| {
            fired_inner.fetch_add(1, Ordering::SeqCst);
        });

        handlers.emit(&());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_panic_is_contained() {
        let handlers: Handlers<()> = Handlers::new();
        let reached = Arc::new(AtomicUsize::new(0));

        handlers.insert(1, |_: &()| panic!("boom"));
        let reached_inner = reached.clone();
        handlers.insert(2, move |_: &()| {
            reached_inner.fetch_add(1, Ordering::SeqCst);
        });

        let panics = handlers.emit(&());
        assert_eq!(panics, vec!["boom".to_string()]);
        // The panic in handler 1 must not starve handler 2.
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ids_are_monotonic_and_nonzero() {
        let ids = HandlerIds::new();
        let first = ids.next_id();
        let second = ids.next_id();
        assert!(first >= 1);
        assert!(second > first);
    }
}
