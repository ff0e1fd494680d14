//! Caller/worker rendezvous for blocking APIs.
//!
//! Public entry points (`ConnectionPool::request`, `S3Client` operations)
//! run their socket I/O on runtime worker threads while the calling thread
//! parks on a condition variable. Parking releases the caller's thread to
//! the host for the duration of the I/O; chunk and progress callbacks are
//! invoked back on the caller thread, one at a time, in arrival order.
//!
//! Workers push events into the shared state and signal the condvar; the
//! caller drains events in a strict order: head first, then body chunks,
//! then the terminal outcome.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;

use crate::error::{Error, Result};

/// Cooperative cancellation flag shared between a caller and its workers.
#[derive(Clone, Default)]
pub(crate) struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// One event observed by the caller side of an exchange.
pub(crate) enum Event<H, T> {
    Head(H),
    Chunk(Bytes),
    Done(Result<T>),
}

struct State<H, T> {
    head: Option<H>,
    chunks: VecDeque<Bytes>,
    outcome: Option<Result<T>>,
}

/// Shared state between one caller thread and the worker driving its I/O.
pub(crate) struct Exchange<H, T> {
    shared: Arc<(Mutex<State<H, T>>, Condvar)>,
    cancel: CancelToken,
}

impl<H, T> Clone for Exchange<H, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.clone(),
        }
    }
}

impl<H, T> Exchange<H, T> {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new((
                Mutex::new(State {
                    head: None,
                    chunks: VecDeque::new(),
                    outcome: None,
                }),
                Condvar::new(),
            )),
            cancel: CancelToken::new(),
        }
    }

    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    // Worker side -----------------------------------------------------------

    /// Deliver the response head. Must be called before any chunk.
    pub(crate) fn set_head(&self, head: H) {
        let (lock, cond) = &*self.shared;
        if let Ok(mut state) = lock.lock() {
            state.head = Some(head);
            cond.notify_one();
        }
    }

    pub(crate) fn push_chunk(&self, chunk: Bytes) {
        let (lock, cond) = &*self.shared;
        if let Ok(mut state) = lock.lock() {
            state.chunks.push_back(chunk);
            cond.notify_one();
        }
    }

    /// Deliver the terminal outcome and wake the caller.
    pub(crate) fn finish(&self, outcome: Result<T>) {
        let (lock, cond) = &*self.shared;
        if let Ok(mut state) = lock.lock() {
            state.outcome = Some(outcome);
            cond.notify_one();
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    // Caller side -----------------------------------------------------------

    /// Park until the next event is available.
    ///
    /// Delivery order: the head (once), every chunk in arrival order, then
    /// the outcome. The outcome is only surfaced after the chunk queue has
    /// drained so that streamed bytes are never lost to an early error
    /// return.
    pub(crate) fn recv(&self) -> Event<H, T> {
        let (lock, cond) = &*self.shared;
        let mut state = match lock.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        loop {
            if let Some(head) = state.head.take() {
                return Event::Head(head);
            }
            if let Some(chunk) = state.chunks.pop_front() {
                return Event::Chunk(chunk);
            }
            if let Some(outcome) = state.outcome.take() {
                return Event::Done(outcome);
            }
            state = match cond.wait(state) {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Park until the terminal outcome arrives, discarding any buffered
    /// chunks. Used by buffered requests where the worker accumulates the
    /// body itself.
    pub(crate) fn wait(&self) -> Result<T> {
        loop {
            match self.recv() {
                Event::Done(outcome) => return outcome,
                Event::Head(_) | Event::Chunk(_) => continue,
            }
        }
    }
}

/// Flips the cancel flag when the caller abandons an in-flight exchange.
pub(crate) struct CancelOnDrop {
    token: CancelToken,
    disarmed: bool,
}

impl CancelOnDrop {
    pub(crate) fn new(token: CancelToken) -> Self {
        Self {
            token,
            disarmed: false,
        }
    }

    /// The exchange ran to completion; leave the flag untouched.
    pub(crate) fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.disarmed {
            self.token.cancel();
        }
    }
}

/// Error used when a worker observes cancellation mid-flight.
pub(crate) fn canceled_error(context: &str) -> Error {
    Error::connection("REQUEST_CANCELED", format!("{context}: canceled"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn events_arrive_in_head_chunk_done_order() {
        let exchange: Exchange<u16, ()> = Exchange::new();
        let worker = exchange.clone();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            worker.set_head(200);
            worker.push_chunk(Bytes::from_static(b"one"));
            worker.push_chunk(Bytes::from_static(b"two"));
            worker.finish(Ok(()));
        });

        assert!(matches!(exchange.recv(), Event::Head(200)));
        let Event::Chunk(first) = exchange.recv() else {
            panic!("expected chunk");
        };
        assert_eq!(&first[..], b"one");
        let Event::Chunk(second) = exchange.recv() else {
            panic!("expected chunk");
        };
        assert_eq!(&second[..], b"two");
        assert!(matches!(exchange.recv(), Event::Done(Ok(()))));
    }

    #[test]
    fn wait_surfaces_worker_error() {
        let exchange: Exchange<(), ()> = Exchange::new();
        let worker = exchange.clone();

        thread::spawn(move || {
            worker.finish(Err(Error::timeout("SOCKET_TIMEOUT", "read body")));
        });

        let err = exchange.wait().unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn dropping_guard_cancels_the_exchange() {
        let exchange: Exchange<(), ()> = Exchange::new();
        let token = exchange.cancel_token();
        {
            let _guard = CancelOnDrop::new(token.clone());
        }
        assert!(token.is_canceled());
        assert!(exchange.is_canceled());

        let exchange2: Exchange<(), ()> = Exchange::new();
        let mut guard = CancelOnDrop::new(exchange2.cancel_token());
        guard.disarm();
        drop(guard);
        assert!(!exchange2.is_canceled());
    }
}
