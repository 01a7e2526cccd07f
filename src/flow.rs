//! Flow-control windows. https://httpwg.org/specs/rfc7540.html#FlowControl
//!
//! A stream's window chains to its connection's window: `consume` only
//! returns once both have credit, and only ever removes as much credit from
//! the parent as it removed from the child.

use crate::error::{ConnectionError, H2Error, StreamError};
use crate::types::{ErrorCode, StreamId, MAX_WINDOW_SIZE};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug, Clone, Copy)]
#[error("stream closed")]
pub struct StreamClosedError;

struct State {
    size: i64,
    closed: bool,
}

/// A single flow-control window, either the connection's (`stream_id: None`)
/// or one belonging to a particular stream.
pub struct Window {
    parent: Option<Arc<Window>>,
    stream_id: Option<StreamId>,
    state: Mutex<State>,
    notify: Notify,
}

impl Window {
    pub fn new(parent: Option<Arc<Window>>, stream_id: Option<StreamId>, initial_window_size: i64) -> Arc<Self> {
        Arc::new(Self {
            parent,
            stream_id,
            state: Mutex::new(State {
                size: initial_window_size,
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub fn size(&self) -> i64 {
        self.state.lock().unwrap().size
    }

    fn raise_error(&self, code: ErrorCode, message: &str) -> H2Error {
        match self.stream_id {
            None => H2Error::Connection(ConnectionError::new(code, message)),
            Some(id) => H2Error::Stream(StreamError::new(id, code)),
        }
    }

    /// Applies a (possibly negative, per SETTINGS_INITIAL_WINDOW_SIZE changes)
    /// adjustment, waking anyone blocked in `consume`.
    pub fn adjust(&self, amount: i64) -> Result<(), H2Error> {
        let mut state = self.state.lock().unwrap();
        state.size += amount;
        let too_large = state.size > i64::from(MAX_WINDOW_SIZE);
        drop(state);
        if too_large {
            return Err(self.raise_error(ErrorCode::FlowControlError, "flow control window too large"));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn apply_window_update(&self, payload: &[u8]) -> Result<(), H2Error> {
        if payload.len() != 4 {
            return Err(H2Error::Connection(ConnectionError::new(
                ErrorCode::FrameSizeError,
                "WINDOW_UPDATE incorrect size",
            )));
        }
        let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let increment = raw & 0x7fff_ffff;
        if increment == 0 {
            return Err(self.raise_error(ErrorCode::ProtocolError, "window update must not be zero"));
        }
        self.adjust(i64::from(increment))
    }

    /// Blocks until the window (and, transitively, its parent's) has credit,
    /// then atomically debits up to `amount` and returns how much was granted.
    pub fn consume<'a>(
        &'a self,
        amount: i64,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StreamClosedError>> + Send + 'a>> {
        Box::pin(async move {
            let granted = loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                {
                    let state = self.state.lock().unwrap();
                    if state.closed {
                        return Err(StreamClosedError);
                    }
                    if state.size > 0 {
                        break std::cmp::min(amount, state.size);
                    }
                }
                notified.await;
            };
            let granted = match &self.parent {
                Some(parent) => parent.consume(granted).await?,
                None => granted,
            };
            self.state.lock().unwrap().size -= granted;
            Ok(granted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consume_debits_and_respects_parent_limit() {
        let conn = Window::new(None, None, 10);
        let stream = Window::new(Some(conn.clone()), Some(1), 100);
        let granted = stream.consume(50).await.unwrap();
        assert_eq!(granted, 10);
        assert_eq!(conn.size(), 0);
        assert_eq!(stream.size(), 90);
    }

    #[tokio::test]
    async fn window_update_unblocks_waiter() {
        let window = Window::new(None, None, 0);
        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.consume(5).await })
        };
        tokio::task::yield_now().await;
        window.apply_window_update(&5u32.to_be_bytes()).unwrap();
        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted, 5);
    }

    #[test]
    fn zero_window_update_is_a_protocol_error() {
        let window = Window::new(None, None, 0);
        let err = window.apply_window_update(&0u32.to_be_bytes());
        assert!(matches!(err, Err(H2Error::Connection(_))));
    }

    #[test]
    fn adjust_above_max_window_size_is_flow_control_error() {
        let window = Window::new(None, Some(1), i64::from(MAX_WINDOW_SIZE));
        let err = window.adjust(1);
        assert!(matches!(err, Err(H2Error::Stream(_))));
    }

    #[tokio::test]
    async fn consume_after_close_fails() {
        let window = Window::new(None, None, 0);
        window.close();
        assert!(window.consume(1).await.is_err());
    }
}
