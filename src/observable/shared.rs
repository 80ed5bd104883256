//! SharedObservable<T> — multicast/replay wrapper over a single producer.
//!
//! The first subscriber starts the source; every emission is buffered and
//! replayed to late subscribers, so concurrent holders of one in-flight
//! request all observe the same result regardless of subscription order.
//! When the last subscriber detaches before the source settles, the source
//! subscription is cancelled and the `on_idle` hook runs — the dedup layer
//! uses it to prune its registry entry. Settling (error or complete) also
//! fires `on_idle`, after the terminal signal has been fanned out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ClientError;

use super::{Closable, Observable, Observer, Subscription, Teardown};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
enum Terminal {
    Error(ClientError),
    Complete,
}

struct ShareState<T> {
    subscribers: Vec<(u64, Arc<Observer<T>>)>,
    next_id: u64,
    replay: Vec<T>,
    terminal: Option<Terminal>,
    source_sub: Option<Subscription>,
    started: bool,
    on_idle: Option<Teardown>,
}

struct SharedInner<T> {
    source: Observable<T>,
    state: Mutex<ShareState<T>>,
}

impl<T: Clone + Send + Sync + 'static> SharedInner<T> {
    /// Remove one subscriber; cancel the source and fire `on_idle` if that
    /// was the last one and the stream has not settled.
    fn remove_subscriber(&self, id: u64) {
        let (source_sub, on_idle) = {
            let mut st = self.state.lock();
            st.subscribers.retain(|(sid, _)| *sid != id);
            if st.subscribers.is_empty() && st.terminal.is_none() && st.started {
                // Reset so a post-prune subscriber restarts the producer
                // instead of waiting on a cancelled one.
                st.started = false;
                st.replay.clear();
                (st.source_sub.take(), st.on_idle.take())
            } else {
                (None, None)
            }
        };
        if let Some(sub) = source_sub {
            sub.unsubscribe();
        }
        if let Some(idle) = on_idle {
            idle();
        }
    }

    fn forward_next(self: &Arc<Self>, value: T) {
        let subscribers = {
            let mut st = self.state.lock();
            if st.terminal.is_some() {
                return;
            }
            st.replay.push(value.clone());
            st.subscribers.clone()
        };
        for (_, observer) in subscribers {
            observer.notify_next(value.clone());
        }
    }

    fn forward_terminal(self: &Arc<Self>, terminal: Terminal) {
        let (subscribers, on_idle) = {
            let mut st = self.state.lock();
            if st.terminal.is_some() {
                return;
            }
            st.terminal = Some(terminal.clone());
            let subs = std::mem::take(&mut st.subscribers);
            (subs, st.on_idle.take())
        };
        for (_, observer) in &subscribers {
            match &terminal {
                Terminal::Error(err) => observer.notify_error(err.clone()),
                Terminal::Complete => observer.notify_complete(),
            }
        }
        if let Some(idle) = on_idle {
            idle();
        }
    }
}

// ============================================================================
// Per-subscriber handle
// ============================================================================

struct SharedSubscription<T> {
    inner: Arc<SharedInner<T>>,
    id: u64,
    closed: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> Closable for SharedSubscription<T> {
    fn close_silent(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.remove_subscriber(self.id);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SharedObservable
// ============================================================================

/// Multicast wrapper sharing one lazily-started source among subscribers.
pub struct SharedObservable<T> {
    inner: Arc<SharedInner<T>>,
}

impl<T> Clone for SharedObservable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SharedObservable<T> {
    /// Wrap `source`. `on_idle` runs once: when the last subscriber detaches
    /// early, or after the source settles.
    pub fn new(source: Observable<T>, on_idle: Option<Teardown>) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                source,
                state: Mutex::new(ShareState {
                    subscribers: Vec::new(),
                    next_id: 1,
                    replay: Vec::new(),
                    terminal: None,
                    source_sub: None,
                    started: false,
                    on_idle,
                }),
            }),
        }
    }

    pub fn subscribe(&self, observer: Observer<T>) -> Subscription {
        let observer = Arc::new(observer);

        // Register (or replay-and-settle) under the lock; deliver outside it.
        let (id, replay, terminal, start_source) = {
            let mut st = self.inner.state.lock();
            let replay = st.replay.clone();
            let terminal = st.terminal.clone();
            if terminal.is_some() {
                (0, replay, terminal, false)
            } else {
                let id = st.next_id;
                st.next_id += 1;
                st.subscribers.push((id, Arc::clone(&observer)));
                let start = !st.started;
                if start {
                    st.started = true;
                }
                (id, replay, None, start)
            }
        };

        for value in replay {
            observer.notify_next(value);
        }
        if let Some(terminal) = terminal {
            match terminal {
                Terminal::Error(err) => observer.notify_error(err),
                Terminal::Complete => observer.notify_complete(),
            }
            // Already settled — hand back an inert, closed subscription.
            return Subscription::from_closable(Arc::new(SharedSubscription {
                inner: Arc::clone(&self.inner),
                id: 0,
                closed: AtomicBool::new(true),
            }));
        }

        if start_source {
            let next_inner = Arc::clone(&self.inner);
            let err_inner = Arc::clone(&self.inner);
            let done_inner = Arc::clone(&self.inner);
            let source_sub = self.inner.source.subscribe(
                Observer::new()
                    .on_next(move |value| next_inner.forward_next(value))
                    .on_error(move |err| err_inner.forward_terminal(Terminal::Error(err)))
                    .on_complete(move || done_inner.forward_terminal(Terminal::Complete)),
            );
            let mut st = self.inner.state.lock();
            if st.terminal.is_none() {
                st.source_sub = Some(source_sub);
            }
        }

        Subscription::from_closable(Arc::new(SharedSubscription {
            inner: Arc::clone(&self.inner),
            id,
            closed: AtomicBool::new(false),
        }))
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// View this shared stream as a plain [`Observable`]; each subscription
    /// to the view attaches to (and counts against) the shared stream.
    pub fn observable(&self) -> Observable<T> {
        let shared = self.clone();
        Observable::new(move |emitter| {
            let next = emitter.clone();
            let err = emitter.clone();
            let done = emitter.clone();
            let sub = shared.subscribe(
                Observer::new()
                    .on_next(move |value| next.next(value))
                    .on_error(move |e| err.error(e))
                    .on_complete(move || done.complete()),
            );
            Some(Box::new(move || sub.unsubscribe()))
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
