//! subfork - parallel work-unit dispatch over forked subprocesses.
//!
//! A [`Dispatcher`] submits user work functions to isolated OS
//! subprocesses, collects their return values (or failures) back in the
//! parent over anonymous pipes, and bounds the degree of concurrency with
//! a pending queue. Each child sends exactly one length-prefixed frame
//! and exits; the parent multiplexes readiness across all live children,
//! reaps them, and delivers values either to per-child callbacks or into
//! slots ordered by submission.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use subfork::{Dispatcher, DispatcherConfig};
//!
//! # fn main() -> subfork::Result<()> {
//! let dispatcher = Dispatcher::new(DispatcherConfig::new())?;
//! dispatcher.submit_batch(4, |i| Ok(json!(i * i)))?;
//! let squares = dispatcher.wait_all()?;
//! assert_eq!(squares.len(), 4);
//! # Ok(())
//! # }
//! ```
//!
//! Hosts with their own event loop can attach an adapter
//! ([`PollEventLoop`] or [`TokioEventLoop`]) so completions are driven by
//! readiness watchers instead of the internal multiplexer.

mod child;
mod registry;

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod ipc;
pub mod reap;

pub use codec::{Codec, CodecError, JsonCodec, TaggedCodec, TAG_SEPARATOR};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats, DEFAULT_MAX_CHILDREN};
pub use error::{DispatchError, Result};
pub use event_loop::{Completion, EventLoop, PollEventLoop, ReadyCallback, TokioEventLoop, WatcherId};

// Child identifiers are OS process ids.
pub use nix::unistd::Pid;
