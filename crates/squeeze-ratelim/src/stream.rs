//! The rate-limited stream wrapper.

use std::future::Future;
use std::io::{Error as IoError, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use pin_project::{pin_project, pinned_drop};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::err::{stream_closed, throttle_timeout};
use crate::limiter::Limiter;

/// A bidirectional stream whose throughput is limited by a shared
/// [`Limiter`].
///
/// Each read or write transfers at most one burst of bytes per call and then
/// reserves tokens for the bytes that actually moved. If the reservation
/// cannot be covered immediately, the owed delay is recorded and paid at the
/// start of the *next* operation on that direction; the transferred bytes
/// themselves are returned right away, as an ordinary partial read or write.
/// Callers that want a full buffer loop externally, exactly as with any
/// other stream.
///
/// Reads and writes throttle independently: each direction keeps its own
/// schedule and its own optional deadline, so a full-duplex relay can drive
/// both at once. The only state they share is the limiter and the one-shot
/// shutdown signal.
///
/// While an operation is waiting, either for its direction's owed delay or
/// for the wrapped transport to become ready, it can be interrupted in two
/// ways:
///
/// * its direction's deadline arrives first: the call fails with
///   [`ErrorKind::TimedOut`](std::io::ErrorKind::TimedOut), keeping any owed
///   delay for the next call. The stream stays usable.
/// * the stream is shut down via a [`ShutdownHandle`]: the call fails
///   promptly with [`ErrorKind::BrokenPipe`](std::io::ErrorKind::BrokenPipe),
///   as does every operation after it.
#[pin_project(PinnedDrop)]
pub struct LimitedStream<T> {
    /// The shared bandwidth budget.
    limiter: Arc<Limiter>,
    /// Throttling schedule for reads. Touched only by read operations.
    read: DirState,
    /// Throttling schedule for writes. Touched only by write operations.
    write: DirState,
    /// One-shot shutdown signal, shared with every [`ShutdownHandle`].
    closed: CancellationToken,
    /// The wrapped connection.
    #[pin]
    inner: T,
}

/// Per-direction throttling state.
struct DirState {
    /// Earliest instant at which the next transfer may happen; the owed
    /// delay left behind by the previous transfer on this direction.
    not_before: Option<Instant>,
    /// Deadline for operations on this direction. `None` means no deadline.
    deadline: Option<Instant>,
    /// In-progress wait, aimed at `not_before`, the deadline, or whichever
    /// comes first. Rebuilt whenever its target no longer matches.
    sleep: Option<Pin<Box<Sleep>>>,
    /// Future that resolves when the shutdown signal fires; polled inside
    /// waits so that shutdown interrupts them promptly. Each direction
    /// holds its own so that waits on a split stream each keep their own
    /// wakeup registered.
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl DirState {
    /// Fresh state for one direction, subscribed to the shutdown signal.
    fn new(closed: &CancellationToken) -> Self {
        Self {
            not_before: None,
            deadline: None,
            sleep: None,
            cancelled: Box::pin(closed.clone().cancelled_owned()),
        }
    }
}

impl<T> LimitedStream<T> {
    /// Wrap `inner` so that its reads and writes draw from `limiter`'s
    /// budget.
    pub fn new(inner: T, limiter: Arc<Limiter>) -> Self {
        let closed = CancellationToken::new();
        Self {
            limiter,
            read: DirState::new(&closed),
            write: DirState::new(&closed),
            closed,
            inner,
        }
    }

    /// A handle that can shut this stream down from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.closed.clone(),
        }
    }

    /// Set the deadline for read operations. `None` removes it.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read.deadline = deadline;
    }

    /// Set the deadline for write operations. `None` removes it.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write.deadline = deadline;
    }

    /// Set the same deadline for both directions. `None` removes it.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// A reference to the wrapped connection.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// A mutable reference to the wrapped connection.
    ///
    /// Bytes transferred directly on the inner connection bypass the
    /// limiter.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// Shuts down an associated [`LimitedStream`], interrupting any throttled
/// operation that is waiting for bandwidth.
///
/// Shutting down is idempotent: every call after the first is a no-op.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    /// The stream's shutdown signal.
    token: CancellationToken,
}

impl ShutdownHandle {
    /// Shut the stream down.
    ///
    /// Any operation currently waiting on a bandwidth reservation wakes and
    /// fails promptly, and every later operation fails the same way.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether the stream has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[pinned_drop]
impl<T> PinnedDrop for LimitedStream<T> {
    fn drop(self: Pin<&mut Self>) {
        // Dropping the stream closes the wrapped connection; fire the
        // signal too so that ShutdownHandle holders observe the closure.
        self.project().closed.cancel();
    }
}

/// Wait out any delay owed on `dir`, racing the sleep against `dir`'s
/// deadline and the shutdown signal.
///
/// `Ok(())` means the direction is clear to transfer. The error cases are
/// the shutdown signal firing (or having already fired), and the deadline
/// arriving while delay is still owed; in the latter case `not_before` is
/// kept, so the next call resumes the wait where this one left off.
///
/// The wait target is recomputed on every poll, so a deadline that was set,
/// moved, or cleared since the last poll (including by a caller that
/// abandoned a parked wait) takes effect here rather than whenever the old
/// target arrives.
fn poll_throttle_wait(
    dir: &mut DirState,
    closed: &CancellationToken,
    cx: &mut Context<'_>,
) -> Poll<IoResult<()>> {
    // Checking the token first keeps `cancelled` from being polled again
    // after it has completed.
    if closed.is_cancelled() {
        dir.sleep = None;
        return Poll::Ready(Err(stream_closed()));
    }
    // Register for a shutdown wakeup before deciding to sleep.
    if dir.cancelled.as_mut().poll(cx).is_ready() {
        dir.sleep = None;
        return Poll::Ready(Err(stream_closed()));
    }

    let Some(not_before) = dir.not_before else {
        return Poll::Ready(Ok(()));
    };
    let now = Instant::now();
    if now >= not_before {
        dir.not_before = None;
        dir.sleep = None;
        return Poll::Ready(Ok(()));
    }

    let mut target = not_before;
    if let Some(deadline) = dir.deadline {
        if now >= deadline {
            dir.sleep = None;
            return Poll::Ready(Err(throttle_timeout()));
        }
        target = target.min(deadline);
    }

    let sleep = match dir.sleep.as_mut() {
        Some(sleep) if sleep.deadline() == target => sleep,
        _ => dir.sleep.insert(Box::pin(sleep_until(target))),
    };
    ready!(sleep.as_mut().poll(cx));
    dir.sleep = None;
    if Instant::now() < not_before {
        // The deadline fired first. Keep `not_before`.
        return Poll::Ready(Err(throttle_timeout()));
    }
    dir.not_before = None;
    Poll::Ready(Ok(()))
}

/// Bound a pending transport operation by `dir`'s deadline.
///
/// Called when the wrapped connection itself returned `Pending`; the
/// throttle wait has already registered the shutdown wakeup for this poll.
/// Resolves to the timeout error when the deadline arrives, and never
/// resolves without a deadline.
fn poll_io_deadline(dir: &mut DirState, cx: &mut Context<'_>) -> Poll<IoError> {
    let Some(deadline) = dir.deadline else {
        return Poll::Pending;
    };
    let sleep = match dir.sleep.as_mut() {
        Some(sleep) if sleep.deadline() == deadline => sleep,
        _ => dir.sleep.insert(Box::pin(sleep_until(deadline))),
    };
    ready!(sleep.as_mut().poll(cx));
    dir.sleep = None;
    Poll::Ready(throttle_timeout())
}

/// Reserve tokens for `n` transferred bytes and record any owed delay as the
/// direction's new `not_before`.
fn throttle_transfer(dir: &mut DirState, limiter: &Limiter, n: usize) {
    let now = Instant::now();
    let delay = limiter.reserve(now, u64::try_from(n).unwrap_or(u64::MAX));
    if !delay.is_zero() {
        dir.not_before = Some(now + delay);
    }
}

impl<T: AsyncRead> AsyncRead for LimitedStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<IoResult<()>> {
        let this = self.project();

        // Zero-length reads are never throttled.
        if buf.remaining() == 0 {
            return this.inner.poll_read(cx, buf);
        }

        ready!(poll_throttle_wait(this.read, this.closed, cx))?;

        let burst = usize::try_from(this.limiter.burst()).unwrap_or(usize::MAX);
        let n = if buf.remaining() <= burst {
            let filled = buf.filled().len();
            match this.inner.poll_read(cx, buf) {
                Poll::Ready(res) => {
                    res?;
                    buf.filled().len() - filled
                }
                Poll::Pending => return poll_io_deadline(this.read, cx).map(Err),
            }
        } else {
            let mut chunk = buf.take(burst);
            match this.inner.poll_read(cx, &mut chunk) {
                Poll::Ready(res) => res?,
                Poll::Pending => return poll_io_deadline(this.read, cx).map(Err),
            }
            let n = chunk.filled().len();
            // The chunk was read into `buf`'s unfilled region; mark those
            // bytes as initialized and filled in the caller's view.
            unsafe {
                buf.assume_init(n);
            }
            buf.advance(n);
            n
        };

        // EOF consumes no tokens.
        if n > 0 {
            throttle_transfer(this.read, this.limiter, n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite> AsyncWrite for LimitedStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        let this = self.project();

        // Zero-length writes are never throttled.
        if buf.is_empty() {
            return this.inner.poll_write(cx, buf);
        }

        ready!(poll_throttle_wait(this.write, this.closed, cx))?;

        let burst = usize::try_from(this.limiter.burst()).unwrap_or(usize::MAX);
        let chunk = &buf[..buf.len().min(burst)];
        let n = match this.inner.poll_write(cx, chunk) {
            Poll::Ready(res) => res?,
            Poll::Pending => return poll_io_deadline(this.write, cx).map(Err),
        };
        if n > 0 {
            throttle_transfer(this.write, this.limiter, n);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        // Graceful shutdown of the write side only; the read direction may
        // still be relaying, so the close signal is not fired here.
        self.project().inner.poll_shutdown(cx)
    }
}
