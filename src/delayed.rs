//! A one-shot completion with an explicit release gate.
//!
//! The value is captured as soon as `complete` is called, but waiters
//! only observe it once `release` has also been called, in either
//! order. Scripts use this to hold `done` back until ambient stdio has
//! had a scheduling quantum to propagate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

struct Inner<T> {
    value: Option<T>,
    released: bool,
    wakers: Vec<Waker>,
}

pub struct DelayedOneShot<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for DelayedOneShot<T> {
    fn clone(&self) -> Self {
        DelayedOneShot {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> DelayedOneShot<T> {
    pub fn new() -> DelayedOneShot<T> {
        DelayedOneShot {
            inner: Arc::new(Mutex::new(Inner {
                value: None,
                released: false,
                wakers: Vec::new(),
            })),
        }
    }

    /// Store the completion value. The first call wins; later calls are
    /// dropped. Fires waiters only if `release` has already happened.
    pub fn complete(&self, value: T) {
        let mut inner = self.inner.lock();
        if inner.value.is_some() {
            return;
        }
        inner.value = Some(value);
        if inner.released {
            for waker in inner.wakers.drain(..) {
                waker.wake();
            }
        }
    }

    /// Open the gate. Idempotent. If a value is already stored the
    /// waiters fire now; otherwise the next `complete` fires them.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.released {
            return;
        }
        inner.released = true;
        if inner.value.is_some() {
            for waker in inner.wakers.drain(..) {
                waker.wake();
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().value.is_some()
    }

    /// The value, if it has both been stored and released.
    pub fn try_value(&self) -> Option<T> {
        let inner = self.inner.lock();
        if inner.released {
            inner.value.clone()
        } else {
            None
        }
    }

    /// A future resolving once the value is stored and released. Any
    /// number of waiters may be created; each observes a clone.
    pub fn wait(&self) -> Delayed<T> {
        Delayed {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub struct Delayed<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone> Future for Delayed<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut inner = self.inner.lock();
        if inner.released {
            if let Some(value) = inner.value.clone() {
                return Poll::Ready(value);
            }
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
