//! Event Plumbing
//!
//! Shared observer machinery for characteristics, value parsers, the device
//! watcher and the monitor facade. Callbacks registered with [`EventSource`]
//! are invoked from the transport's callback context, so they must stay
//! cheap; consumers that need to do real work subscribe to a channel-backed
//! [`EventStream`] instead and process events on their own task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

struct Registration<T> {
    id: u64,
    // Flipped on detach so a handler removed mid-dispatch is never invoked
    // again, even from a snapshot taken before the removal.
    detached: AtomicBool,
    callback: Box<dyn Fn(&T) + Send + Sync>,
}

struct SourceInner<T> {
    handlers: Mutex<Vec<Arc<Registration<T>>>>,
    next_id: AtomicU64,
}

impl<T> SourceInner<T> {
    fn detach(&self, id: u64) {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(index) = handlers.iter().position(|h| h.id == id) {
            let handler = handlers.remove(index);
            handler.detached.store(true, Ordering::SeqCst);
        }
    }
}

/// Multi-subscriber event dispatcher. Events are delivered to handlers in
/// registration order, in the order they were emitted.
pub struct EventSource<T> {
    inner: Arc<SourceInner<T>>,
}

impl<T> Clone for EventSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for EventSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventSource<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SourceInner {
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a callback and returns its handle for [`detach`].
    ///
    /// [`detach`]: EventSource::detach
    pub fn attach(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(Registration {
            id,
            detached: AtomicBool::new(false),
            callback: Box::new(callback),
        });
        self.inner.handlers.lock().unwrap().push(registration);
        id
    }

    pub fn detach(&self, id: u64) {
        self.inner.detach(id);
    }

    /// Removes every handler. Pending [`EventStream`]s observe a closed
    /// channel on their next receive.
    pub fn clear(&self) {
        let mut handlers = self.inner.handlers.lock().unwrap();
        for handler in handlers.drain(..) {
            handler.detached.store(true, Ordering::SeqCst);
        }
    }

    /// Dispatches `event` to all currently attached handlers. The handler
    /// list is snapshotted first so a callback may detach itself (or any
    /// other handler) without deadlocking.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Arc<Registration<T>>> =
            self.inner.handlers.lock().unwrap().iter().cloned().collect();
        for handler in snapshot {
            if !handler.detached.load(Ordering::SeqCst) {
                (handler.callback)(event);
            }
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().unwrap().len()
    }
}

impl<T: Clone + Send + 'static> EventSource<T> {
    /// Channel-backed subscription. Events emitted after this call arrive on
    /// the returned stream in emission order; dropping the stream (or calling
    /// [`EventStream::unsubscribe`]) detaches it.
    pub fn subscribe(&self) -> EventStream<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.attach(move |event: &T| {
            let _ = sender.send(event.clone());
        });
        EventStream {
            id,
            receiver,
            source: Arc::downgrade(&self.inner),
        }
    }
}

/// Receiving half of a subscription made with [`EventSource::subscribe`].
pub struct EventStream<T> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<T>,
    source: Weak<SourceInner<T>>,
}

impl<T> EventStream<T> {
    /// Waits for the next event. Returns `None` once unsubscribed or the
    /// source has been cleared.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Non-blocking receive for callers polling from a sync context.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Detaches from the source. No events emitted after this call will be
    /// observed, including events already dispatched but not yet read.
    pub fn unsubscribe(&mut self) {
        if let Some(source) = self.source.upgrade() {
            source.detach(self.id);
        }
        self.receiver.close();
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            source.detach(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_attach_order() {
        let source: EventSource<u32> = EventSource::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        source.attach(move |value| first.lock().unwrap().push(("first", *value)));
        let second = Arc::clone(&seen);
        source.attach(move |value| second.lock().unwrap().push(("second", *value)));

        source.emit(&1);
        source.emit(&2);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]
        );
    }

    #[test]
    fn detach_during_dispatch_suppresses_later_handler() {
        let source: EventSource<u32> = EventSource::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        // The second handler's id is known in advance: ids start at 1.
        let detacher = source.clone();
        source.attach(move |_| detacher.detach(2));
        let recorder = Arc::clone(&seen);
        source.attach(move |value| recorder.lock().unwrap().push(*value));

        source.emit(&7);
        source.emit(&8);

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(source.handler_count(), 1);
    }

    #[test]
    fn stream_receives_until_unsubscribed() {
        let source: EventSource<u32> = EventSource::new();
        let mut stream = source.subscribe();

        source.emit(&5);
        assert_eq!(stream.try_recv(), Some(5));

        stream.unsubscribe();
        source.emit(&6);
        assert_eq!(stream.try_recv(), None);
        assert_eq!(source.handler_count(), 0);
    }

    #[test]
    fn dropping_stream_detaches() {
        let source: EventSource<u32> = EventSource::new();
        {
            let _stream = source.subscribe();
            assert_eq!(source.handler_count(), 1);
        }
        assert_eq!(source.handler_count(), 0);
        source.emit(&1); // must not panic with no subscribers
    }
}
