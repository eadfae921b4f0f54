//! The work-unit dispatcher.
//!
//! The dispatcher forks one subprocess per submitted work function,
//! collects each child's single return value (or failure) back over an
//! anonymous pipe, and bounds concurrency with a pending queue.
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────────────┐
//!                     │  Parent process  │
//!                     │   (Dispatcher)   │
//!                     └────────┬─────────┘
//!                              │ fork + pipe per work unit
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │  Child 1  │  │  Child 2  │  │  Child N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         │ one frame │  │ one frame │  │ one frame │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Results are delivered either to a per-child callback or into an
//! ordered slot assigned at submission, so `wait_all` returns values in
//! submission order no matter how completions interleave. An optional
//! event-loop adapter replaces the internal poll(2) multiplexer with
//! readiness watchers on a host loop.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::panic::Location;
use std::rc::Rc;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::{ForkResult, Pid, fork, getpid, pipe};
use tracing::{debug, trace, warn};

use crate::child::{self, Work};
use crate::codec::{Codec, JsonCodec};
use crate::error::{DispatchError, Result};
use crate::event_loop::{Completion, EventLoop, WatcherId};
use crate::ipc::{FrameKind, FrameReader, PipeFd};
use crate::reap;
use crate::registry::{self, InheritedState};

/// Default bound on concurrently promoted children.
pub const DEFAULT_MAX_CHILDREN: usize = 5;

/// Configuration for a [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherConfig {
    /// Bound on live children for queued work; `None` is unbounded.
    /// Direct `submit_async` calls bypass the bound.
    pub max_children: Option<usize>,
    /// Host event loop; readiness-driven mode when set.
    pub event_loop: Option<Rc<dyn EventLoop>>,
}

impl DispatcherConfig {
    /// Default configuration: `max_children = 5`, no event loop.
    pub fn new() -> Self {
        Self {
            max_children: Some(DEFAULT_MAX_CHILDREN),
            event_loop: None,
        }
    }

    pub fn with_max_children(mut self, bound: Option<usize>) -> Self {
        self.max_children = bound;
        self
    }

    pub fn with_event_loop(mut self, adapter: Rc<dyn EventLoop>) -> Self {
        self.event_loop = Some(adapter);
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("max_children", &self.max_children)
            .field("event_loop", &self.event_loop.as_ref().map(|_| "<adapter>"))
            .finish()
    }
}

type Callback<T> = Rc<RefCell<dyn FnMut(T)>>;

/// How a submission's result reaches the parent.
enum Delivery<T> {
    /// Fill the next ordered slot; the index is assigned before fork (or
    /// at promotion time for queued entries).
    OrderedSlot,
    /// Invoke a callback with the decoded value.
    Callback(Callback<T>),
}

impl<T> Clone for Delivery<T> {
    fn clone(&self) -> Self {
        match self {
            Self::OrderedSlot => Self::OrderedSlot,
            Self::Callback(cb) => Self::Callback(Rc::clone(cb)),
        }
    }
}

/// A delivery bound to a concrete destination at fork time.
enum Sink<T> {
    Slot(usize),
    Callback(Callback<T>),
}

/// Parent-side record of one live child.
struct ChildRecord<T> {
    reader: FrameReader,
    sink: Sink<T>,
    origin: &'static Location<'static>,
    watcher: Option<WatcherId>,
}

/// A queued submission awaiting a free slot.
struct PendingUnit<T> {
    work: Work<T>,
    delivery: Delivery<T>,
    origin: &'static Location<'static>,
}

#[derive(Default)]
struct StatCounters {
    spawned: u64,
    completed: u64,
    failed: u64,
}

/// Point-in-time dispatcher statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Children currently registered.
    pub active: usize,
    /// Submissions waiting for a slot.
    pub pending: usize,
    /// Children forked with a result channel, ever.
    pub spawned: u64,
    /// Frames delivered successfully, ever.
    pub completed: u64,
    /// Child failures and transport errors, ever.
    pub failed: u64,
}

struct Inner<C: Codec> {
    codec: Rc<C>,
    max_children: Option<usize>,
    subprocs: HashMap<Pid, ChildRecord<C::Value>>,
    /// Registration order; the multiplexer tie-break and watcher
    /// re-registration both follow it.
    spawn_order: Vec<Pid>,
    pending: VecDeque<PendingUnit<C::Value>>,
    ordered_count: usize,
    ordered_results: Vec<Option<C::Value>>,
    deferred_error: Option<DispatchError>,
    event_loop: Option<Rc<dyn EventLoop>>,
    completion: Option<Completion>,
    owner: Pid,
    stats: StatCounters,
}

impl<C: Codec + 'static> InheritedState for RefCell<Inner<C>> {
    fn reset_inherited(&self) {
        if let Ok(mut inner) = self.try_borrow_mut() {
            // Dropping the records closes the inherited sibling read ends.
            inner.subprocs.clear();
            inner.spawn_order.clear();
            inner.pending.clear();
            inner.ordered_count = 0;
            inner.ordered_results.clear();
            inner.deferred_error = None;
            inner.event_loop = None;
            inner.completion = None;
        }
    }
}

/// Parallel work-unit dispatcher over forked subprocesses.
///
/// Single-threaded by contract: operations may block but are never
/// reentered concurrently. See the module docs for the architecture.
pub struct Dispatcher<C: Codec + 'static = JsonCodec<serde_json::Value>> {
    inner: Rc<RefCell<Inner<C>>>,
}

impl<C: Codec + 'static> std::fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher<JsonCodec<serde_json::Value>> {
    /// Create a dispatcher with the default JSON codec.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        Self::with_codec(JsonCodec::new(), config)
    }
}

impl<C: Codec + 'static> Dispatcher<C> {
    /// Create a dispatcher with an explicit codec.
    pub fn with_codec(codec: C, config: DispatcherConfig) -> Result<Self> {
        validate_bound(config.max_children)?;
        let completion = config
            .event_loop
            .as_ref()
            .map(|adapter| adapter.fresh_completion());
        let inner = Rc::new(RefCell::new(Inner {
            codec: Rc::new(codec),
            max_children: config.max_children,
            subprocs: HashMap::new(),
            spawn_order: Vec::new(),
            pending: VecDeque::new(),
            ordered_count: 0,
            ordered_results: Vec::new(),
            deferred_error: None,
            event_loop: config.event_loop,
            completion,
            owner: getpid(),
            stats: StatCounters::default(),
        }));
        let weak = {
            let as_trait: Rc<dyn InheritedState> = inner.clone() as Rc<dyn InheritedState>;
            Rc::downgrade(&as_trait)
        };
        registry::register(weak);
        Ok(Self { inner })
    }

    /// Fork a child running `work`; its result fills the next ordered
    /// slot, collected by [`wait_all`](Self::wait_all).
    #[track_caller]
    pub fn submit_async<F>(&self, work: F) -> Result<Pid>
    where
        F: FnOnce() -> anyhow::Result<C::Value> + 'static,
    {
        let origin = Location::caller();
        self.take_deferred()?;
        submit(&self.inner, Box::new(work), Delivery::OrderedSlot, origin)
    }

    /// Fork a child running `work`; `callback` receives the decoded value
    /// when the child's frame is consumed.
    #[track_caller]
    pub fn submit_async_with<F, G>(&self, work: F, callback: G) -> Result<Pid>
    where
        F: FnOnce() -> anyhow::Result<C::Value> + 'static,
        G: FnMut(C::Value) + 'static,
    {
        let origin = Location::caller();
        self.take_deferred()?;
        let callback: Callback<C::Value> = Rc::new(RefCell::new(callback));
        submit(
            &self.inner,
            Box::new(work),
            Delivery::Callback(callback),
            origin,
        )
    }

    /// Fork `n` children; the i-th runs `work(i)`. Results fill ordered
    /// slots. Returns `n`.
    #[track_caller]
    pub fn submit_batch<F>(&self, n: usize, work: F) -> Result<usize>
    where
        F: Fn(usize) -> anyhow::Result<C::Value> + 'static,
    {
        let origin = Location::caller();
        self.take_deferred()?;
        validate_batch(n)?;
        let work = Rc::new(work);
        for index in 0..n {
            let work = Rc::clone(&work);
            submit(
                &self.inner,
                Box::new(move || work(index)),
                Delivery::OrderedSlot,
                origin,
            )?;
        }
        Ok(n)
    }

    /// Batch submission with a shared callback.
    #[track_caller]
    pub fn submit_batch_with<F, G>(&self, n: usize, work: F, callback: G) -> Result<usize>
    where
        F: Fn(usize) -> anyhow::Result<C::Value> + 'static,
        G: FnMut(C::Value) + 'static,
    {
        let origin = Location::caller();
        self.take_deferred()?;
        validate_batch(n)?;
        let work = Rc::new(work);
        let callback: Callback<C::Value> = Rc::new(RefCell::new(callback));
        for index in 0..n {
            let work = Rc::clone(&work);
            submit(
                &self.inner,
                Box::new(move || work(index)),
                Delivery::Callback(Rc::clone(&callback)),
                origin,
            )?;
        }
        Ok(n)
    }

    /// Append `work` to the pending queue, then drain. Returns whether at
    /// least one entry was promoted by this call.
    ///
    /// Ordered slots for queued entries are assigned at promotion, not at
    /// queue time, so interleaving `queue` with `submit_async` orders
    /// results by promotion.
    #[track_caller]
    pub fn queue<F>(&self, work: F) -> Result<bool>
    where
        F: FnOnce() -> anyhow::Result<C::Value> + 'static,
    {
        let origin = Location::caller();
        self.take_deferred()?;
        enqueue(&self.inner, Box::new(work), Delivery::OrderedSlot, origin)
    }

    /// Queue variant delivering through `callback`.
    #[track_caller]
    pub fn queue_with<F, G>(&self, work: F, callback: G) -> Result<bool>
    where
        F: FnOnce() -> anyhow::Result<C::Value> + 'static,
        G: FnMut(C::Value) + 'static,
    {
        let origin = Location::caller();
        self.take_deferred()?;
        let callback: Callback<C::Value> = Rc::new(RefCell::new(callback));
        enqueue(
            &self.inner,
            Box::new(work),
            Delivery::Callback(callback),
            origin,
        )
    }

    /// Block until one child delivers a frame, process it, and drain the
    /// queue. Returns `false` when no children exist.
    pub fn wait_one(&self) -> Result<bool> {
        self.take_deferred()?;
        let Some(pid) = self.select_ready()? else {
            return Ok(false);
        };
        consume(&self.inner, pid)?;
        Ok(true)
    }

    /// Wait for every child, then return the ordered results and clear
    /// them. Slots belonging to callback submissions stay `None`.
    ///
    /// With an event-loop adapter attached, control is yielded to the
    /// host loop instead of the internal multiplexer.
    pub fn wait_all(&self) -> Result<Vec<Option<C::Value>>> {
        self.take_deferred()?;
        let adapter = self.inner.borrow().event_loop.clone();
        if let Some(adapter) = adapter {
            while !self.inner.borrow().subprocs.is_empty() {
                let completion = {
                    let mut guard = self.inner.borrow_mut();
                    guard
                        .completion
                        .get_or_insert_with(|| adapter.fresh_completion())
                        .clone()
                };
                adapter.block_on(&completion)?;
                self.take_deferred()?;
            }
        } else {
            while self.wait_one()? {}
        }
        let mut guard = self.inner.borrow_mut();
        guard.ordered_count = 0;
        Ok(std::mem::take(&mut guard.ordered_results))
    }

    /// Process the frame of one specific child. Returns `None` silently
    /// when `pid` is not registered (its completion may already have been
    /// consumed).
    pub fn wait_pid(&self, pid: Pid) -> Result<Option<C::Value>> {
        self.take_deferred()?;
        consume(&self.inner, pid)
    }

    /// Number of currently registered children.
    pub fn count(&self) -> usize {
        self.inner.borrow().subprocs.len()
    }

    /// Number of queued submissions awaiting a slot.
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Fork a child that runs `work` and exits. No pipe, no record, no
    /// reaping; the result is discarded.
    pub fn start_detached<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + 'static,
    {
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                trace!(pid = child.as_raw(), "forked detached child");
                Ok(())
            }
            ForkResult::Child => child::run_detached(Box::new(work)),
        }
    }

    /// Current bound on promoted children.
    pub fn max_children(&self) -> Option<usize> {
        self.inner.borrow().max_children
    }

    /// Change the bound. Raising it promotes queued entries immediately.
    pub fn set_max_children(&self, bound: Option<usize>) -> Result<()> {
        validate_bound(bound)?;
        self.inner.borrow_mut().max_children = bound;
        drain(&self.inner)?;
        Ok(())
    }

    /// The active event-loop adapter, if any.
    pub fn event_loop(&self) -> Option<Rc<dyn EventLoop>> {
        self.inner.borrow().event_loop.clone()
    }

    /// Attach or detach an event-loop adapter. Only one adapter is active
    /// at a time; attaching a new one clears the previous one and moves
    /// the watchers of live children over.
    pub fn set_event_loop(&self, adapter: Option<Rc<dyn EventLoop>>) {
        let detached = {
            let mut guard = self.inner.borrow_mut();
            let old = guard.event_loop.take();
            guard.completion = None;
            let mut watchers = Vec::new();
            if old.is_some() {
                for record in guard.subprocs.values_mut() {
                    if let Some(watcher) = record.watcher.take() {
                        watchers.push(watcher);
                    }
                }
            }
            old.map(|adapter| (adapter, watchers))
        };
        if let Some((old_adapter, watchers)) = detached {
            for watcher in watchers {
                old_adapter.cancel(watcher);
            }
        }

        let Some(adapter) = adapter else {
            return;
        };
        let targets: Vec<(Pid, RawFd)> = {
            let mut guard = self.inner.borrow_mut();
            guard.event_loop = Some(Rc::clone(&adapter));
            guard.completion = Some(adapter.fresh_completion());
            let subprocs = &guard.subprocs;
            guard
                .spawn_order
                .iter()
                .filter_map(|pid| subprocs.get(pid).map(|r| (*pid, r.reader.raw_fd())))
                .collect()
        };
        for (pid, fd) in targets {
            let watcher = register_watcher(&self.inner, pid, fd);
            if let Some(record) = self.inner.borrow_mut().subprocs.get_mut(&pid) {
                record.watcher = watcher;
            }
        }
    }

    /// Snapshot of the dispatcher counters.
    pub fn stats(&self) -> DispatcherStats {
        let guard = self.inner.borrow();
        DispatcherStats {
            active: guard.subprocs.len(),
            pending: guard.pending.len(),
            spawned: guard.stats.spawned,
            completed: guard.stats.completed,
            failed: guard.stats.failed,
        }
    }

    /// Take-and-raise prologue shared by every user-facing entry point.
    fn take_deferred(&self) -> Result<()> {
        match self.inner.borrow_mut().deferred_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Block until at least one registered read end is readable and pick
    /// exactly one child, first-registered order winning ties.
    fn select_ready(&self) -> Result<Option<Pid>> {
        loop {
            let targets: Vec<(Pid, RawFd)> = {
                let guard = self.inner.borrow();
                if guard.spawn_order.is_empty() {
                    return Ok(None);
                }
                guard
                    .spawn_order
                    .iter()
                    .filter_map(|pid| guard.subprocs.get(pid).map(|r| (*pid, r.reader.raw_fd())))
                    .collect()
            };
            let mut fds: Vec<PollFd> = targets
                .iter()
                .map(|(_, fd)| {
                    PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN)
                })
                .collect();
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
            for ((pid, _), pfd) in targets.iter().zip(fds.iter()) {
                if is_readable(pfd) {
                    return Ok(Some(*pid));
                }
            }
        }
    }
}

impl<C: Codec + 'static> Drop for Dispatcher<C> {
    fn drop(&mut self) {
        let Ok(guard) = self.inner.try_borrow() else {
            return;
        };
        if !guard.subprocs.is_empty() && getpid() == guard.owner {
            warn!(
                children = guard.subprocs.len(),
                "dispatcher dropped with live children"
            );
        }
    }
}

fn is_readable(pfd: &PollFd) -> bool {
    pfd.revents().is_some_and(|flags| {
        flags.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
    })
}

fn validate_bound(bound: Option<usize>) -> Result<()> {
    match bound {
        Some(0) => Err(DispatchError::InvalidArgument(
            "max_children must be positive".into(),
        )),
        _ => Ok(()),
    }
}

fn validate_batch(n: usize) -> Result<()> {
    if n == 0 {
        return Err(DispatchError::InvalidArgument(
            "submit_batch requires a positive count".into(),
        ));
    }
    Ok(())
}

/// Fork one child for `work`. The ordered slot, when applicable, is
/// claimed before the fork so completion order cannot affect placement.
fn submit<C: Codec + 'static>(
    inner: &Rc<RefCell<Inner<C>>>,
    work: Work<C::Value>,
    delivery: Delivery<C::Value>,
    origin: &'static Location<'static>,
) -> Result<Pid> {
    let (sink, codec) = {
        let mut guard = inner.borrow_mut();
        let sink = match delivery {
            Delivery::OrderedSlot => {
                let index = guard.ordered_count;
                guard.ordered_count += 1;
                Sink::Slot(index)
            }
            Delivery::Callback(callback) => Sink::Callback(callback),
        };
        (sink, Rc::clone(&guard.codec))
    };

    let (read_end, write_end) = pipe()?;

    // No RefCell borrow may be live across the fork: the child resets
    // every registered dispatcher and needs them borrowable.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(write_end);
            trace!(pid = child.as_raw(), "forked child");
            let reader = FrameReader::new(PipeFd::new(read_end));
            let watcher = register_watcher(inner, child, reader.raw_fd());
            let mut guard = inner.borrow_mut();
            guard.stats.spawned += 1;
            guard.subprocs.insert(
                child,
                ChildRecord {
                    reader,
                    sink,
                    origin,
                    watcher,
                },
            );
            guard.spawn_order.push(child);
            Ok(child)
        }
        ForkResult::Child => {
            drop(read_end);
            child::run(codec.as_ref(), work, PipeFd::new(write_end))
        }
    }
}

/// Attach a one-shot readiness watcher for `pid` when an adapter is
/// active. The callback routes straight into the internal wait-pid path.
fn register_watcher<C: Codec + 'static>(
    inner: &Rc<RefCell<Inner<C>>>,
    pid: Pid,
    fd: RawFd,
) -> Option<WatcherId> {
    let adapter = inner.borrow().event_loop.clone()?;
    let weak = Rc::downgrade(inner);
    let callback = Box::new(move || {
        if let Some(strong) = weak.upgrade() {
            on_ready(&strong, pid);
        }
    });
    Some(adapter.register_readable(fd, callback))
}

/// Watcher entry point. Errors cannot be thrown out of a loop callback;
/// they are latched for the next user-facing entry.
fn on_ready<C: Codec + 'static>(inner: &Rc<RefCell<Inner<C>>>, pid: Pid) {
    if let Err(err) = consume(inner, pid) {
        latch_error(inner, err);
    }
    maybe_signal_done(inner);
}

/// The single completion path: take the child's record, read its frame,
/// reap it, deliver the value, then drain the queue. Used by the internal
/// multiplexer, `wait_pid`, and the loop watchers alike.
fn consume<C: Codec + 'static>(
    inner: &Rc<RefCell<Inner<C>>>,
    pid: Pid,
) -> Result<Option<C::Value>> {
    let (record, adapter) = {
        let mut guard = inner.borrow_mut();
        let Some(record) = guard.subprocs.remove(&pid) else {
            return Ok(None);
        };
        guard.spawn_order.retain(|p| *p != pid);
        (record, guard.event_loop.clone())
    };
    if let (Some(adapter), Some(watcher)) = (adapter.as_ref(), record.watcher) {
        adapter.cancel(watcher);
    }
    let ChildRecord {
        mut reader,
        sink,
        origin,
        ..
    } = record;

    let frame = match reader.read_frame() {
        Ok(frame) => frame,
        Err(err) => {
            drop(reader);
            reap::reap(pid);
            inner.borrow_mut().stats.failed += 1;
            return Err(err);
        }
    };
    drop(reader);
    reap::reap(pid);

    let value = match frame.kind {
        FrameKind::Error => {
            inner.borrow_mut().stats.failed += 1;
            let message = String::from_utf8_lossy(&frame.payload).into_owned();
            return Err(DispatchError::ChildFailure {
                file: origin.file(),
                line: origin.line(),
                message,
            });
        }
        FrameKind::Result => {
            let codec = Rc::clone(&inner.borrow().codec);
            match codec.decode(&frame.payload) {
                Ok(value) => value,
                Err(err) => {
                    inner.borrow_mut().stats.failed += 1;
                    return Err(err.into());
                }
            }
        }
    };

    // Deliver without holding the borrow; callbacks may re-enter the
    // dispatcher.
    match sink {
        Sink::Slot(index) => {
            let mut guard = inner.borrow_mut();
            if guard.ordered_results.len() <= index {
                guard.ordered_results.resize_with(index + 1, || None);
            }
            guard.ordered_results[index] = Some(value.clone());
        }
        Sink::Callback(callback) => {
            (&mut *callback.borrow_mut())(value.clone());
        }
    }
    inner.borrow_mut().stats.completed += 1;
    debug!(pid = pid.as_raw(), "child completed");

    drain(inner)?;
    maybe_signal_done(inner);
    Ok(Some(value))
}

/// Append one unit to the pending queue and drain.
fn enqueue<C: Codec + 'static>(
    inner: &Rc<RefCell<Inner<C>>>,
    work: Work<C::Value>,
    delivery: Delivery<C::Value>,
    origin: &'static Location<'static>,
) -> Result<bool> {
    inner.borrow_mut().pending.push_back(PendingUnit {
        work,
        delivery,
        origin,
    });
    Ok(drain(inner)? > 0)
}

/// Sole promoter of the pending queue: promote entries until the bound is
/// saturated, the queue empties, or an error is latched. Returns how many
/// entries were promoted.
fn drain<C: Codec + 'static>(inner: &Rc<RefCell<Inner<C>>>) -> Result<usize> {
    let mut promoted = 0;
    loop {
        let unit = {
            let mut guard = inner.borrow_mut();
            if guard.pending.is_empty() || guard.deferred_error.is_some() {
                return Ok(promoted);
            }
            if let Some(limit) = guard.max_children {
                if guard.subprocs.len() >= limit {
                    return Ok(promoted);
                }
            }
            guard.pending.pop_front()
        };
        let Some(unit) = unit else {
            return Ok(promoted);
        };
        submit(inner, unit.work, unit.delivery, unit.origin)?;
        promoted += 1;
        trace!(promoted, "promoted queued work");
    }
}

/// First error wins the deferred slot; later ones are logged and dropped.
fn latch_error<C: Codec + 'static>(inner: &Rc<RefCell<Inner<C>>>, err: DispatchError) {
    let mut guard = inner.borrow_mut();
    if guard.deferred_error.is_none() {
        guard.deferred_error = Some(err);
    } else {
        warn!(error = %err, "dropping child failure; an earlier failure is still latched");
    }
}

/// When the last child is gone in adapter mode, replace the completion
/// with a fresh one and signal the old one so a parked `wait_all` wakes.
fn maybe_signal_done<C: Codec + 'static>(inner: &Rc<RefCell<Inner<C>>>) {
    let action = {
        let mut guard = inner.borrow_mut();
        if !guard.subprocs.is_empty() {
            return;
        }
        let Some(adapter) = guard.event_loop.clone() else {
            return;
        };
        let Some(old) = guard.completion.take() else {
            return;
        };
        guard.completion = Some(adapter.fresh_completion());
        (adapter, old)
    };
    let (adapter, old) = action;
    adapter.signal_done(&old);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(DispatcherConfig::new()).unwrap()
    }

    #[test]
    fn test_default_config_values() {
        let config = DispatcherConfig::new();
        assert_eq!(config.max_children, Some(DEFAULT_MAX_CHILDREN));
        assert!(config.event_loop.is_none());
    }

    #[test]
    fn test_zero_max_children_is_rejected() {
        let err = Dispatcher::new(DispatcherConfig::new().with_max_children(Some(0))).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
    }

    #[test]
    fn test_zero_batch_is_rejected() {
        let d = dispatcher();
        let err = d
            .submit_batch(0, |i| Ok(json!(i)))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
    }

    #[test]
    fn test_submit_and_wait_roundtrip() {
        let d = dispatcher();
        d.submit_async(|| Ok(json!("hello"))).unwrap();
        assert_eq!(d.count(), 1);
        let results = d.wait_all().unwrap();
        assert_eq!(results, vec![Some(json!("hello"))]);
        assert_eq!(d.count(), 0);
    }

    #[test]
    fn test_wait_one_returns_false_when_idle() {
        let d = dispatcher();
        assert!(!d.wait_one().unwrap());
    }

    #[test]
    fn test_stats_track_completions() {
        let d = dispatcher();
        d.submit_async(|| Ok(json!(1))).unwrap();
        d.submit_async(|| Ok(json!(2))).unwrap();
        d.wait_all().unwrap();
        let stats = d.stats();
        assert_eq!(stats.spawned, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn test_wait_all_clears_ordered_state() {
        let d = dispatcher();
        d.submit_async(|| Ok(json!(1))).unwrap();
        assert_eq!(d.wait_all().unwrap().len(), 1);
        assert!(d.wait_all().unwrap().is_empty());
    }

    #[test]
    fn test_queued_entries_wait_for_a_slot() {
        let d = Dispatcher::new(DispatcherConfig::new().with_max_children(Some(1))).unwrap();
        let promoted = d
            .queue(|| {
                std::thread::sleep(std::time::Duration::from_millis(30));
                Ok(json!(1))
            })
            .unwrap();
        assert!(promoted);
        let promoted = d.queue(|| Ok(json!(2))).unwrap();
        assert!(!promoted);
        assert_eq!(d.count(), 1);
        assert_eq!(d.pending_count(), 1);

        let results: Vec<Value> = d.wait_all().unwrap().into_iter().flatten().collect();
        assert_eq!(results, vec![json!(1), json!(2)]);
        assert_eq!(d.pending_count(), 0);
    }
}
