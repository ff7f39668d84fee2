//! Unbounded async FIFO with explicit close.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::WhisperError;

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
}

#[derive(Debug)]
struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Multi-producer multi-consumer unbounded queue.
///
/// `send` never blocks. `recv` waits until an item arrives or the channel is
/// closed; waiters are woken in arrival order and a dropped `recv` future
/// gives up its place. Closing drops every queued item and fails all current
/// and future operations with [`WhisperError::ChannelClosed`].
#[derive(Debug)]
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Channel<T> {
    /// Creates an open, empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueues an item and wakes the oldest waiter.
    ///
    /// # Errors
    ///
    /// Returns [`WhisperError::ChannelClosed`] after [`Channel::close`].
    pub fn send(&self, item: T) -> Result<(), WhisperError> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(WhisperError::ChannelClosed);
            }
            state.queue.push_back(item);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Dequeues the oldest item, waiting if the channel is empty.
    ///
    /// # Errors
    ///
    /// Returns [`WhisperError::ChannelClosed`] if the channel is or becomes closed.
    pub async fn recv(&self) -> Result<T, WhisperError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_recv()? {
                // Another item may be left for the next waiter, which our
                // consumed permit would otherwise have gone to.
                if !self.is_empty() {
                    self.inner.notify.notify_one();
                }
                return Ok(item);
            }

            notified.await;
        }
    }

    /// Dequeues the oldest item without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`WhisperError::ChannelClosed`] after [`Channel::close`].
    pub fn try_recv(&self) -> Result<Option<T>, WhisperError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(WhisperError::ChannelClosed);
        }
        Ok(state.queue.pop_front())
    }

    /// Closes the channel, discarding queued items and waking every waiter.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.inner.notify.notify_waiters();
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
