// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed publish/subscribe bus safe under re-entrant use.
//!
//! Listener lists are copy-on-write: emission iterates a snapshot, so
//! listeners registered or cancelled mid-emission never affect the delivery
//! already in flight.  Subscribing to the event currently being emitted is
//! refused; subscriptions to other events, nested emissions of other events,
//! and cancellations are all permitted from inside a listener.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// An event type dispatched through an [`EventBus`].  `name` is the
/// discriminant used for subscription and the re-entrancy guard.
pub trait Event: Clone + Send + Sync + 'static {
    fn name(&self) -> &'static str;
}

type ListenerFn<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

struct Entry<E> {
    done: Arc<AtomicBool>,
    f: ListenerFn<E>,
}

impl<E> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Self { done: Arc::clone(&self.done), f: Arc::clone(&self.f) }
    }
}

struct BusInner<E> {
    listeners: HashMap<&'static str, Vec<Entry<E>>>,
    any: Vec<Entry<E>>,
    /// Stack of event names currently being emitted on any task.
    emitting: Vec<&'static str>,
}

/// Cheaply cloneable; all clones share the same listener lists.
pub struct EventBus<E: Event> {
    inner: Arc<Mutex<BusInner<E>>>,
}

impl<E: Event> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by every subscription.  Cancelling marks the listener
/// inactive immediately; the entry itself is pruned on the next emission.
pub struct Subscription {
    done: Arc<AtomicBool>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

/// Subscription refused by the re-entrancy guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    Reentrant { event: &'static str },
    ReentrantAll { event: &'static str },
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reentrant { event } => {
                write!(f, "cannot subscribe to '{event}' while it is being emitted")
            }
            Self::ReentrantAll { event } => {
                write!(f, "cannot subscribe to all events while '{event}' is being emitted")
            }
        }
    }
}

impl std::error::Error for BusError {}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                listeners: HashMap::new(),
                any: Vec::new(),
                emitting: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(
        &self,
        event: &'static str,
        done: Arc<AtomicBool>,
        f: ListenerFn<E>,
    ) -> Result<Subscription, BusError> {
        let mut inner = self.lock();
        if inner.emitting.contains(&event) {
            return Err(BusError::Reentrant { event });
        }
        inner.listeners.entry(event).or_default().push(Entry { done: Arc::clone(&done), f });
        Ok(Subscription { done })
    }

    /// Register a listener for `event`.  Listeners fire in registration order.
    pub fn on(
        &self,
        event: &'static str,
        listener: impl Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<Subscription, BusError> {
        self.subscribe(event, Arc::new(AtomicBool::new(false)), Arc::new(listener))
    }

    /// Register a listener that fires at most once.
    pub fn once(
        &self,
        event: &'static str,
        listener: impl Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<Subscription, BusError> {
        self.once_when(event, |_| true, listener)
    }

    /// Register a listener that fires at most once, gated by a predicate.
    /// While the predicate returns false the subscription persists.
    pub fn once_when(
        &self,
        event: &'static str,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
        listener: impl Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<Subscription, BusError> {
        let done = Arc::new(AtomicBool::new(false));
        let fired = Arc::clone(&done);
        let wrapped = move |e: &E| {
            if !predicate(e) {
                return Ok(());
            }
            if fired.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            listener(e)
        };
        self.subscribe(event, done, Arc::new(wrapped))
    }

    /// Register a catch-all listener observing every event.  The event's
    /// [`Event::name`] carries the discriminant.
    pub fn all(
        &self,
        listener: impl Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<Subscription, BusError> {
        let mut inner = self.lock();
        if let Some(event) = inner.emitting.last() {
            return Err(BusError::ReentrantAll { event });
        }
        let done = Arc::new(AtomicBool::new(false));
        inner.any.push(Entry { done: Arc::clone(&done), f: Arc::new(listener) });
        Ok(Subscription { done })
    }

    /// Invoke every applicable listener with the event.  Listener failures are
    /// collected and returned; they never abort the fan-out.
    pub fn emit(&self, event: &E) -> Vec<anyhow::Error> {
        let name = event.name();
        let (any_snapshot, snapshot) = {
            let mut inner = self.lock();
            inner.emitting.push(name);
            (inner.any.clone(), inner.listeners.get(name).cloned().unwrap_or_default())
        };

        let mut failures = Vec::new();
        for entry in any_snapshot.iter().chain(snapshot.iter()) {
            if entry.done.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(err) = (entry.f)(event) {
                failures.push(err);
            }
        }

        let mut inner = self.lock();
        if let Some(pos) = inner.emitting.iter().rposition(|n| *n == name) {
            inner.emitting.remove(pos);
        }
        if let Some(list) = inner.listeners.get_mut(name) {
            list.retain(|e| !e.done.load(Ordering::SeqCst));
        }
        inner.any.retain(|e| !e.done.load(Ordering::SeqCst));
        failures
    }

    /// Yield the next `event` satisfying the predicate.  A predicate error is
    /// surfaced to the waiter instead of being swallowed.
    pub async fn wait_for(
        &self,
        event: &'static str,
        predicate: impl Fn(&E) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> anyhow::Result<E> {
        let (tx, rx) = oneshot::channel::<anyhow::Result<E>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let done = Arc::new(AtomicBool::new(false));
        let fired = Arc::clone(&done);
        let f = move |e: &E| {
            let verdict = match predicate(e) {
                Ok(false) => return Ok(()),
                Ok(true) => Ok(e.clone()),
                Err(err) => Err(err),
            };
            if fired.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(verdict);
            }
            Ok(())
        };
        self.subscribe(event, done, Arc::new(f)).map_err(anyhow::Error::new)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("event bus dropped while waiting for '{event}'"),
        }
    }

    /// Derive a bus over a different event type.  Every event on this bus is
    /// mapped through `transform`; `None` drops the event, `Some` forwards it
    /// (identity forwarding is a transform that maps variants across).
    pub fn pipe<T, F>(&self, transform: F) -> Result<EventBus<T>, BusError>
    where
        T: Event,
        F: Fn(&E) -> Option<T> + Send + Sync + 'static,
    {
        let derived = EventBus::new();
        let sink = derived.clone();
        self.all(move |e| {
            let Some(mapped) = transform(e) else {
                return Ok(());
            };
            let failures = sink.emit(&mapped);
            if failures.is_empty() {
                Ok(())
            } else {
                anyhow::bail!("{} piped listener(s) failed for '{}'", failures.len(), mapped.name())
            }
        })?;
        Ok(derived)
    }

    /// Number of active listeners for `event` (catch-all listeners excluded).
    pub fn listener_count(&self, event: &str) -> usize {
        self.lock()
            .listeners
            .get(event)
            .map(|list| list.iter().filter(|e| !e.done.load(Ordering::SeqCst)).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
