//! Response body relayed from a backend.

use crate::backend::ConnectionGuard;
use crate::proxy::TransportError;
use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep_until};
use tracing::warn;

/// Backend response body that keeps its attempt counted as in flight.
///
/// The connection guard is released when the body ends, errors, or is
/// dropped by the client. If the attempt deadline passes while the backend
/// is still streaming, the body fails with [`TransportError::Timeout`].
pub struct RelayBody<B> {
    inner: B,
    guard: Option<ConnectionGuard>,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
}

impl<B> RelayBody<B> {
    /// Wrap `inner`, holding `guard` until the body completes or `deadline`.
    pub fn new(inner: B, guard: ConnectionGuard, deadline: Instant, timeout: Duration) -> Self {
        Self {
            inner,
            guard: Some(guard),
            deadline: Box::pin(sleep_until(deadline)),
            timeout,
        }
    }
}

impl<B> Body for RelayBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<TransportError>,
{
    type Data = Bytes;
    type Error = TransportError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.guard.is_none() {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if this.inner.is_end_stream() {
                    this.guard = None;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.guard = None;
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.guard = None;
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                if let Some(guard) = this.guard.take() {
                    warn!(
                        backend = %guard.backend(),
                        timeout = ?this.timeout,
                        "response body exceeded attempt deadline"
                    );
                }
                Poll::Ready(Some(Err(TransportError::Timeout(this.timeout))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.guard.is_none() || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
