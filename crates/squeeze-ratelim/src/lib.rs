#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

//! ## Design
//!
//! Three pieces, leaf first:
//!
//! * an internal token bucket: drift-free, and its level may go negative,
//!   so a reservation consumes its tokens unconditionally and reports when
//!   they will have been earned.
//! * [`Limiter`]: one shared, mutex-linearized bucket per enforced limit,
//!   sized by [`good_burst`] so that sustained traffic makes about 20
//!   reservations per second.
//! * [`LimitedStream`]: wraps a connection and interleaves burst-sized I/O
//!   with reservations, deferring each owed delay to the start of the next
//!   operation on the same direction. Per-direction deadlines and a
//!   broadcast shutdown signal bound how long an operation may stay
//!   parked, whether it is waiting out owed delay or waiting for the
//!   transport itself.
//!
//! Off-the-shelf limiter crates let each stream race the others for quota
//! and put backpressure on the *current* operation; here the deadline and
//! cancellation semantics require the debt-carrying schedule above, so the
//! bucket is our own.

mod bucket;
mod err;
mod limiter;
mod stream;

pub use err::{StreamClosed, ThrottleTimedOut};
pub use limiter::{good_burst, Limiter, MAX_BURST, MIN_BURST};
pub use stream::{LimitedStream, ShutdownHandle};
