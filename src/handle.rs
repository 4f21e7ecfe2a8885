//! Single-resolution completion handles for session operations

use crate::error::{OperationFailure, Result, SessionError};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Creates a connected completer/handle pair
pub(crate) fn pair<T>() -> (Completer<T>, OperationHandle<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completer { tx },
        OperationHandle {
            state: HandleState::Waiting(rx),
        },
    )
}

/// Producer side of an [`OperationHandle`]; consumed on resolution
#[derive(Debug)]
pub(crate) struct Completer<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, result: Result<T>) {
        // The caller may have dropped its handle
        let _ = self.tx.send(result);
    }
}

#[derive(Debug)]
enum HandleState<T> {
    Waiting(oneshot::Receiver<Result<T>>),
    Done(Option<Result<T>>),
}

/// Completion handle returned by every connection operation
///
/// Resolves exactly once. The outcome can be awaited, polled with
/// [`try_result`](Self::try_result), or waited for with
/// [`wait_blocking`](Self::wait_blocking) from a non-runtime thread.
///
/// ```rust,no_run
/// # use mqtt_session::{Connection, QoS};
/// # async fn example(connection: &Connection) -> Result<(), Box<dyn std::error::Error>> {
/// let (handle, packet_id) = connection.subscribe("sensors/+/temp", QoS::AtLeastOnce, |msg| {
///     println!("{}: {:?}", msg.topic, msg.payload);
/// })?;
/// let suback = handle.await?;
/// assert_eq!(suback.packet_id, packet_id);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
#[must_use = "operation outcomes are only observable through the handle"]
pub struct OperationHandle<T> {
    state: HandleState<T>,
}

impl<T> OperationHandle<T> {
    /// A handle that is already resolved
    pub(crate) fn ready(result: Result<T>) -> Self {
        Self {
            state: HandleState::Done(Some(result)),
        }
    }

    /// Whether the outcome is available
    pub fn is_resolved(&mut self) -> bool {
        self.poll_ready();
        matches!(self.state, HandleState::Done(Some(_)))
    }

    /// Takes the outcome if the operation has resolved
    ///
    /// Returns `None` while the operation is still pending, and also once
    /// the outcome has been taken.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        self.poll_ready();
        match &mut self.state {
            HandleState::Done(result) => result.take(),
            HandleState::Waiting(_) => None,
        }
    }

    /// Blocks the current thread until the operation resolves
    ///
    /// # Errors
    ///
    /// Returns the operation's error
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context
    pub fn wait_blocking(self) -> Result<T> {
        match self.state {
            HandleState::Waiting(rx) => rx.blocking_recv().unwrap_or_else(|_| Err(abandoned())),
            HandleState::Done(result) => result.unwrap_or_else(|| Err(abandoned())),
        }
    }

    fn poll_ready(&mut self) {
        if let HandleState::Waiting(rx) = &mut self.state {
            match rx.try_recv() {
                Ok(result) => self.state = HandleState::Done(Some(result)),
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.state = HandleState::Done(Some(Err(abandoned())));
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }
    }
}

impl<T> Future for OperationHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => {
                    this.state = HandleState::Done(None);
                    Poll::Ready(result)
                }
                Poll::Ready(Err(_)) => {
                    this.state = HandleState::Done(None);
                    Poll::Ready(Err(abandoned()))
                }
                Poll::Pending => Poll::Pending,
            },
            HandleState::Done(result) => {
                Poll::Ready(result.take().unwrap_or_else(|| Err(abandoned())))
            }
        }
    }
}

// HandleState holds no self-references
impl<T> Unpin for OperationHandle<T> {}

fn abandoned() -> SessionError {
    SessionError::operation(None, OperationFailure::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_await_resolution() {
        let (completer, handle) = pair::<u32>();
        completer.complete(Ok(7));
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[test]
    fn test_polling() {
        let (completer, mut handle) = pair::<u32>();
        assert!(!handle.is_resolved());
        assert!(handle.try_result().is_none());

        completer.complete(Err(SessionError::Timeout));
        assert!(handle.is_resolved());
        assert_eq!(handle.try_result(), Some(Err(SessionError::Timeout)));
        // Single resolution: the outcome is taken once
        assert!(handle.try_result().is_none());
    }

    #[test]
    fn test_dropped_completer_reports_closed() {
        let (completer, mut handle) = pair::<()>();
        drop(completer);
        let result = handle.try_result().unwrap();
        assert!(result.unwrap_err().is_connection_closed());
    }

    #[test]
    fn test_ready_handle() {
        let handle = OperationHandle::ready(Ok("done"));
        assert_eq!(handle.wait_blocking().unwrap(), "done");
    }

    #[test]
    fn test_wait_blocking_from_thread() {
        let (completer, handle) = pair::<u16>();
        let waiter = std::thread::spawn(move || handle.wait_blocking());
        completer.complete(Ok(42));
        assert_eq!(waiter.join().unwrap().unwrap(), 42);
    }
}
