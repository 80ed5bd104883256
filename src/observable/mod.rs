//! Minimal cold-observable primitive used for network result streams.
//!
//! # Overview
//!
//! [`Observable<T>`] is a lazily-started stream: nothing runs until
//! [`subscribe`](Observable::subscribe) invokes the producer with an
//! [`Emitter`]. The producer may emit synchronously, or hand the emitter to
//! a spawned task and emit later. Cancellation is cooperative: dropping or
//! unsubscribing a [`Subscription`] closes the channel, after which every
//! emission is a no-op, and runs the producer's teardown.
//!
//! # Modules
//!
//! - [`shared`] — [`SharedObservable<T>`], the multicast/replay wrapper with
//!   ref-counted teardown used by the dedup layer.
//!
//! # Threading model
//!
//! Channel state lives behind `parking_lot::Mutex`es that are never held
//! while an observer callback runs. Callbacks fire on whatever task calls
//! the emitter — there is no internal scheduler.

pub mod shared;

pub use shared::SharedObservable;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ClientError;

// ============================================================================
// Observer
// ============================================================================

/// Callback bundle handed to [`Observable::subscribe`]. All callbacks are
/// optional; unset ones drop the signal.
pub struct Observer<T> {
    next: Option<Box<dyn Fn(T) + Send + Sync>>,
    error: Option<Box<dyn Fn(ClientError) + Send + Sync>>,
    complete: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<T> Observer<T> {
    pub fn new() -> Self {
        Self {
            next: None,
            error: None,
            complete: None,
        }
    }

    pub fn on_next(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.next = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(ClientError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    pub(crate) fn notify_next(&self, value: T) {
        if let Some(f) = &self.next {
            f(value);
        }
    }

    pub(crate) fn notify_error(&self, err: ClientError) {
        if let Some(f) = &self.error {
            f(err);
        }
    }

    pub(crate) fn notify_complete(&self) {
        if let Some(f) = &self.complete {
            f();
        }
    }
}

// ============================================================================
// Channel — shared between Emitter and Subscription
// ============================================================================

/// One-shot teardown run when the channel closes, from either side.
pub type Teardown = Box<dyn FnOnce() + Send>;

struct Channel<T> {
    observer: Mutex<Option<Arc<Observer<T>>>>,
    teardown: Mutex<Option<Teardown>>,
    closed: AtomicBool,
}

impl<T> Channel<T> {
    fn new(observer: Observer<T>) -> Self {
        Self {
            observer: Mutex::new(Some(Arc::new(observer))),
            teardown: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Snapshot the observer without holding the lock during callbacks.
    fn observer(&self) -> Option<Arc<Observer<T>>> {
        self.observer.lock().clone()
    }

    /// Transition to closed. Returns the observer exactly once; subsequent
    /// calls (and calls after unsubscribe) return `None`.
    fn close(&self) -> Option<Arc<Observer<T>>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let observer = self.observer.lock().take();
        // Take the teardown out before running it so the lock is not held
        // across a closure that may unsubscribe other channels.
        let teardown = self.teardown.lock().take();
        if let Some(td) = teardown {
            td();
        }
        observer
    }

    /// Attach the producer's teardown. Runs it immediately if the channel
    /// already closed (the producer settled synchronously).
    fn register_teardown(&self, td: Teardown) {
        if self.closed.load(Ordering::SeqCst) {
            td();
        } else {
            *self.teardown.lock() = Some(td);
        }
    }
}

/// Object-safe view of a channel for type-erased [`Subscription`]s.
pub(crate) trait Closable: Send + Sync {
    fn close_silent(&self);
    fn is_closed(&self) -> bool;
}

impl<T: Send + Sync> Closable for Channel<T> {
    fn close_silent(&self) {
        // Unsubscribe drops the observer without a final callback.
        let _ = self.close();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Emitter
// ============================================================================

/// Producer-side handle for pushing values into a subscription. Cloneable so
/// producers can move it into spawned tasks. After `error`/`complete`/
/// unsubscribe, all methods are no-ops.
pub struct Emitter<T> {
    channel: Arc<Channel<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<T: Send + Sync> Emitter<T> {
    pub fn next(&self, value: T) {
        if self.channel.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(observer) = self.channel.observer() {
            observer.notify_next(value);
        }
    }

    pub fn error(&self, err: ClientError) {
        if let Some(observer) = self.channel.close() {
            observer.notify_error(err);
        }
    }

    pub fn complete(&self) {
        if let Some(observer) = self.channel.close() {
            observer.notify_complete();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.channel.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Consumer-side handle. [`unsubscribe`](Subscription::unsubscribe) (or any
/// later duplicate call) is a no-op once the channel has settled. Clones
/// share the underlying channel, so any clone can cancel.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<dyn Closable>,
}

impl Subscription {
    pub(crate) fn from_closable(inner: Arc<dyn Closable>) -> Self {
        Self { inner }
    }

    pub fn unsubscribe(&self) {
        self.inner.close_silent();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

// ============================================================================
// Observable
// ============================================================================

/// A cold, lazily-started stream of `T`.
pub struct Observable<T> {
    #[allow(clippy::type_complexity)]
    producer: Arc<dyn Fn(Emitter<T>) -> Option<Teardown> + Send + Sync>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<T> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable").finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Observable<T> {
    /// Create an observable from a producer. The producer runs once per
    /// subscription and may return a teardown to run on close.
    pub fn new(producer: impl Fn(Emitter<T>) -> Option<Teardown> + Send + Sync + 'static) -> Self {
        Self {
            producer: Arc::new(producer),
        }
    }

    /// A single-emission observable that completes immediately.
    pub fn of(value: T) -> Self
    where
        T: Clone,
    {
        Self::new(move |emitter| {
            emitter.next(value.clone());
            emitter.complete();
            None
        })
    }

    /// An observable that fails immediately.
    pub fn failed(err: ClientError) -> Self {
        Self::new(move |emitter| {
            emitter.error(err.clone());
            None
        })
    }

    pub fn subscribe(&self, observer: Observer<T>) -> Subscription {
        let channel = Arc::new(Channel::new(observer));
        let emitter = Emitter {
            channel: Arc::clone(&channel),
        };
        if let Some(td) = (self.producer)(emitter) {
            channel.register_teardown(td);
        }
        Subscription { inner: channel }
    }
}

// ============================================================================
// Tests
// ============================================================================
