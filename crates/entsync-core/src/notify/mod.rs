//! Change-aware listener notification.
//!
//! [`ListenerNotifier`] holds at most one active subscriber and the last
//! snapshot delivered to it. Notification is suppressed when the new
//! snapshot is business-equal to the last delivered one (same entitlement
//! state, even if fetched at a different time), and `last_delivered` is
//! updated *before* dispatch so a re-entrant notification from inside a
//! callback cannot double-deliver.
//!
//! Delivery is marshaled onto a single injected execution context: the
//! production [`SerialDispatcher`] drains a channel on one dedicated
//! worker thread (running tasks inline when already called from that
//! thread), so subscribers never observe callbacks from two contexts at
//! once. Tests use the synchronous [`InlineDispatcher`].

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::snapshot::EntitlementSnapshot;

// =============================================================================
// Subscriber and dispatch abstractions
// =============================================================================

/// Subscriber receiving entitlement snapshot updates.
pub trait SnapshotListener: Send + Sync {
    /// Called with each snapshot whose state differs from the previously
    /// delivered one. Always invoked on the notifier's dispatch context.
    fn snapshot_changed(&self, snapshot: EntitlementSnapshot);
}

/// Single-consumer execution context that listener callbacks are marshaled
/// onto.
pub trait Dispatcher: Send + Sync {
    /// Runs `task` on the dispatch context. Implementations invoke the task
    /// synchronously when the caller is already on that context.
    fn dispatch(&self, task: Box<dyn FnOnce() + Send>);
}

/// Dispatcher that runs tasks immediately on the calling thread. Test
/// double for the serial worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

type Task = Box<dyn FnOnce() + Send>;

/// Production dispatcher: one dedicated worker thread draining a channel.
///
/// Calls from the worker thread itself run inline (the notifier may be
/// re-entered from inside a callback); calls from any other thread are
/// queued and run in submission order.
pub struct SerialDispatcher {
    sender: mpsc::UnboundedSender<Task>,
    worker: thread::Thread,
}

impl SerialDispatcher {
    /// Spawns the worker thread.
    #[must_use]
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let handle = thread::Builder::new()
            .name("entsync-notify".to_string())
            .spawn(move || {
                while let Some(task) = receiver.blocking_recv() {
                    task();
                }
            })
            .expect("spawn notifier worker thread");
        Self {
            worker: handle.thread().clone(),
            sender,
        }
    }
}

impl Default for SerialDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for SerialDispatcher {
    fn dispatch(&self, task: Box<dyn FnOnce() + Send>) {
        if thread::current().id() == self.worker.id() {
            task();
            return;
        }
        if self.sender.send(task).is_err() {
            warn!("notifier worker gone, dropping listener callback");
        }
    }
}

// =============================================================================
// ListenerNotifier
// =============================================================================

struct NotifierState {
    listener: Option<Arc<dyn SnapshotListener>>,
    last_delivered: Option<EntitlementSnapshot>,
}

/// Holds the single subscriber and suppresses redundant notifications.
pub struct ListenerNotifier {
    dispatcher: Arc<dyn Dispatcher>,
    state: Mutex<NotifierState>,
}

impl ListenerNotifier {
    /// Creates a notifier targeting the given dispatch context.
    #[must_use]
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher,
            state: Mutex::new(NotifierState {
                listener: None,
                last_delivered: None,
            }),
        }
    }

    /// Installs the subscriber, replacing any existing one. Returns `true`
    /// when the slot was previously empty, in which case the caller should
    /// replay the current cached snapshot through [`Self::notify`].
    pub fn set_listener(&self, listener: Arc<dyn SnapshotListener>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let was_empty = state.listener.is_none();
        state.listener = Some(listener);
        debug!(replaced = !was_empty, "snapshot listener installed");
        was_empty
    }

    /// Removes the subscriber, if any.
    pub fn clear_listener(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.listener = None;
    }

    /// Forgets the last delivered snapshot. Used on identity switches so
    /// the next snapshot for the new user is never suppressed against the
    /// previous user's state.
    pub fn reset_last_delivered(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_delivered = None;
    }

    /// Returns `true` when a subscriber is installed.
    pub fn has_listener(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listener
            .is_some()
    }

    /// Delivers `snapshot` to the subscriber unless it is business-equal to
    /// the last delivered snapshot. No-op without a subscriber.
    pub fn notify(&self, snapshot: EntitlementSnapshot) {
        let listener = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(listener) = state.listener.clone() else {
                trace!("no snapshot listener installed, skipping notification");
                return;
            };
            if state
                .last_delivered
                .as_ref()
                .is_some_and(|last| last.same_state(&snapshot))
            {
                debug!("suppressing notification for unchanged entitlement state");
                return;
            }
            // Updated before dispatch: a re-entrant notify with the same
            // state must see it as already delivered.
            state.last_delivered = Some(snapshot.clone());
            listener
        };

        self.dispatcher
            .dispatch(Box::new(move || listener.snapshot_changed(snapshot)));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::snapshot::EntitlementRecord;

    struct CountingListener {
        deliveries: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                deliveries: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.deliveries.load(Ordering::SeqCst)
        }
    }

    impl SnapshotListener for CountingListener {
        fn snapshot_changed(&self, _snapshot: EntitlementSnapshot) {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn snapshot(active: bool, at_hour: u32) -> EntitlementSnapshot {
        let requested_at = chrono::Utc
            .with_ymd_and_hms(2026, 3, 1, at_hour, 0, 0)
            .unwrap();
        let mut snapshot = EntitlementSnapshot::empty(requested_at);
        snapshot.entitlements.insert(
            "premium".to_string(),
            EntitlementRecord {
                is_active: active,
                expires_at: None,
                purchased_at: None,
                product_id: "monthly".to_string(),
            },
        );
        snapshot
    }

    #[test]
    fn business_equal_snapshots_deliver_once() {
        let notifier = ListenerNotifier::new(Arc::new(InlineDispatcher));
        let listener = CountingListener::new();
        notifier.set_listener(listener.clone());

        // Same state, different request timestamps.
        notifier.notify(snapshot(true, 10));
        notifier.notify(snapshot(true, 11));
        assert_eq!(listener.count(), 1);
    }

    #[test]
    fn changed_state_delivers_again() {
        let notifier = ListenerNotifier::new(Arc::new(InlineDispatcher));
        let listener = CountingListener::new();
        notifier.set_listener(listener.clone());

        notifier.notify(snapshot(true, 10));
        notifier.notify(snapshot(false, 10));
        assert_eq!(listener.count(), 2);
    }

    #[test]
    fn no_listener_means_no_tracking() {
        let notifier = ListenerNotifier::new(Arc::new(InlineDispatcher));
        notifier.notify(snapshot(true, 10));

        // The snapshot was not delivered to anyone, so a subscriber that
        // arrives later still receives it.
        let listener = CountingListener::new();
        assert!(notifier.set_listener(listener.clone()));
        notifier.notify(snapshot(true, 11));
        assert_eq!(listener.count(), 1);
    }

    #[test]
    fn set_listener_reports_replacements() {
        let notifier = ListenerNotifier::new(Arc::new(InlineDispatcher));
        assert!(notifier.set_listener(CountingListener::new()));
        assert!(!notifier.set_listener(CountingListener::new()));

        notifier.clear_listener();
        assert!(!notifier.has_listener());
        assert!(notifier.set_listener(CountingListener::new()));
    }

    #[test]
    fn serial_dispatcher_delivers_from_worker_thread() {
        struct ThreadRecorder {
            seen: Mutex<Option<thread::ThreadId>>,
            count: AtomicUsize,
        }
        impl SnapshotListener for ThreadRecorder {
            fn snapshot_changed(&self, _snapshot: EntitlementSnapshot) {
                let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
                *seen = Some(thread::current().id());
                self.count.fetch_add(1, Ordering::SeqCst);
            }
        }

        let recorder = Arc::new(ThreadRecorder {
            seen: Mutex::new(None),
            count: AtomicUsize::new(0),
        });
        let notifier = ListenerNotifier::new(Arc::new(SerialDispatcher::new()));
        notifier.set_listener(recorder.clone());
        notifier.notify(snapshot(true, 10));

        let mut waited = Duration::ZERO;
        while recorder.count.load(Ordering::SeqCst) == 0 && waited < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
        let seen = recorder
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .expect("callback ran");
        assert_ne!(seen, thread::current().id());
    }
}
