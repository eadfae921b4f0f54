//! Host event-loop integration.
//!
//! In adapter-driven mode the dispatcher does not block in its own
//! readiness multiplexer. Instead it registers a one-shot readable
//! watcher per child on a host loop, parks on a [`Completion`] while the
//! loop turns, and is re-entered through the watcher callbacks. The
//! contract is deliberately narrow: watchers, cancellation, and a
//! completion primitive the adapter resolves on request.
//!
//! Two adapters ship with the crate: [`PollEventLoop`], a self-contained
//! cooperative loop over poll(2), and [`TokioEventLoop`], which drives the
//! watchers on a current-thread tokio runtime.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::rc::Rc;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tracing::trace;

use crate::error::{DispatchError, Result};

/// Opaque handle for a registered watcher.
pub type WatcherId = u64;

/// Callback invoked when a watched descriptor becomes readable.
pub type ReadyCallback = Box<dyn FnMut()>;

/// One-shot completion primitive the dispatcher parks on.
///
/// Adapters resolve it from [`EventLoop::signal_done`]; the flag is shared
/// by clone so the parked side observes the resolution.
#[derive(Clone, Default)]
pub struct Completion {
    resolved: Rc<Cell<bool>>,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get()
    }

    pub fn resolve(&self) {
        self.resolved.set(true);
    }
}

/// Capabilities a host event loop exposes to the dispatcher.
///
/// Adapters are single-threaded cooperative: callbacks only run while the
/// dispatcher is parked in [`block_on`](Self::block_on).
pub trait EventLoop {
    /// Register a one-shot readable watcher on `fd`. The callback fires at
    /// most once, the first time the descriptor becomes readable.
    fn register_readable(&self, fd: RawFd, callback: ReadyCallback) -> WatcherId;

    /// Cancel a watcher. Unknown or already-fired ids are a no-op.
    fn cancel(&self, watcher: WatcherId);

    /// Produce a new, unresolved completion.
    fn fresh_completion(&self) -> Completion;

    /// Resolve `completion` and wake a parked [`block_on`](Self::block_on).
    fn signal_done(&self, completion: &Completion);

    /// Turn the loop, firing watcher callbacks, until `completion`
    /// resolves.
    fn block_on(&self, completion: &Completion) -> Result<()>;
}

struct PollWatcher {
    id: WatcherId,
    fd: RawFd,
    callback: ReadyCallback,
}

/// Self-contained cooperative loop over poll(2).
#[derive(Default)]
pub struct PollEventLoop {
    watchers: RefCell<Vec<PollWatcher>>,
    next_id: Cell<WatcherId>,
}

impl PollEventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until at least one watched descriptor is readable and return
    /// the first ready watcher, in registration order.
    fn wait_ready(&self) -> Result<Option<WatcherId>> {
        loop {
            let ready = {
                let watchers = self.watchers.borrow();
                if watchers.is_empty() {
                    return Ok(None);
                }
                let mut fds: Vec<PollFd> = watchers
                    .iter()
                    .map(|w| {
                        PollFd::new(unsafe { BorrowedFd::borrow_raw(w.fd) }, PollFlags::POLLIN)
                    })
                    .collect();
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err.into()),
                }
                watchers
                    .iter()
                    .zip(fds.iter())
                    .find(|(_, pfd)| readable(pfd))
                    .map(|(w, _)| w.id)
            };
            if ready.is_some() {
                return Ok(ready);
            }
        }
    }
}

fn readable(pfd: &PollFd) -> bool {
    pfd.revents().is_some_and(|flags| {
        flags.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
    })
}

impl EventLoop for PollEventLoop {
    fn register_readable(&self, fd: RawFd, callback: ReadyCallback) -> WatcherId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.watchers.borrow_mut().push(PollWatcher { id, fd, callback });
        trace!(fd, watcher = id, "registered poll watcher");
        id
    }

    fn cancel(&self, watcher: WatcherId) {
        self.watchers.borrow_mut().retain(|w| w.id != watcher);
    }

    fn fresh_completion(&self) -> Completion {
        Completion::new()
    }

    fn signal_done(&self, completion: &Completion) {
        completion.resolve();
    }

    fn block_on(&self, completion: &Completion) -> Result<()> {
        loop {
            if completion.is_resolved() {
                return Ok(());
            }
            let Some(id) = self.wait_ready()? else {
                return Err(DispatchError::EventLoop(
                    "no watchers registered and completion unresolved".into(),
                ));
            };
            // One-shot: remove the watcher before it runs so a cancel from
            // inside the callback is a no-op.
            let watcher = {
                let mut watchers = self.watchers.borrow_mut();
                watchers
                    .iter()
                    .position(|w| w.id == id)
                    .map(|at| watchers.remove(at))
            };
            if let Some(mut watcher) = watcher {
                (watcher.callback)();
            }
        }
    }
}

/// Watchers driven by a current-thread tokio runtime.
///
/// Each watcher is a local task awaiting readability through [`AsyncFd`];
/// tasks only make progress while the dispatcher is parked in `block_on`,
/// which turns the runtime through a [`LocalSet`].
pub struct TokioEventLoop {
    runtime: Runtime,
    local: LocalSet,
    tasks: RefCell<HashMap<WatcherId, tokio::task::AbortHandle>>,
    wakeups: Rc<Notify>,
    next_id: Cell<WatcherId>,
}

impl TokioEventLoop {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_io().build()?;
        Ok(Self {
            runtime,
            local: LocalSet::new(),
            tasks: RefCell::new(HashMap::new()),
            wakeups: Rc::new(Notify::new()),
            next_id: Cell::new(0),
        })
    }
}

impl EventLoop for TokioEventLoop {
    fn register_readable(&self, fd: RawFd, mut callback: ReadyCallback) -> WatcherId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let handle = self.local.spawn_local(async move {
            // Registration failures fall through to the callback; the
            // dispatcher's read path blocks until the frame arrives.
            if let Ok(afd) = AsyncFd::with_interest(fd, Interest::READABLE) {
                let _ = afd.readable().await;
            }
            callback();
        });
        self.tasks.borrow_mut().insert(id, handle.abort_handle());
        trace!(fd, watcher = id, "registered tokio watcher");
        id
    }

    fn cancel(&self, watcher: WatcherId) {
        if let Some(handle) = self.tasks.borrow_mut().remove(&watcher) {
            handle.abort();
        }
    }

    fn fresh_completion(&self) -> Completion {
        Completion::new()
    }

    fn signal_done(&self, completion: &Completion) {
        completion.resolve();
        self.wakeups.notify_one();
    }

    fn block_on(&self, completion: &Completion) -> Result<()> {
        let completion = completion.clone();
        let wakeups = Rc::clone(&self.wakeups);
        self.runtime.block_on(self.local.run_until(async move {
            while !completion.is_resolved() {
                wakeups.notified().await;
            }
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::PipeFd;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    fn create_pipe() -> (PipeFd, PipeFd) {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("Failed to create pipe");
        (PipeFd::new(read_fd), PipeFd::new(write_fd))
    }

    #[test]
    fn test_poll_loop_fires_ready_watcher_once() {
        let (reader, mut writer) = create_pipe();
        let ev = PollEventLoop::new();
        let completion = ev.fresh_completion();

        let fired = Rc::new(Cell::new(0));
        let fired_in_cb = Rc::clone(&fired);
        let done = completion.clone();
        ev.register_readable(
            reader.as_raw_fd(),
            Box::new(move || {
                fired_in_cb.set(fired_in_cb.get() + 1);
                done.resolve();
            }),
        );

        writer.write_all(b"x").unwrap();
        ev.block_on(&completion).unwrap();
        assert_eq!(fired.get(), 1);
        // One-shot: the watcher is gone after firing.
        assert!(ev.watchers.borrow().is_empty());
    }

    #[test]
    fn test_poll_loop_without_watchers_errors_instead_of_hanging() {
        let ev = PollEventLoop::new();
        let completion = ev.fresh_completion();
        let err = ev.block_on(&completion).unwrap_err();
        assert!(matches!(err, DispatchError::EventLoop(_)));
    }

    #[test]
    fn test_poll_loop_cancel_removes_watcher() {
        let (reader, _writer) = create_pipe();
        let ev = PollEventLoop::new();
        let watcher = ev.register_readable(reader.as_raw_fd(), Box::new(|| {}));
        ev.cancel(watcher);
        assert!(ev.watchers.borrow().is_empty());
    }

    #[test]
    fn test_resolved_completion_returns_without_polling() {
        let ev = PollEventLoop::new();
        let completion = ev.fresh_completion();
        ev.signal_done(&completion);
        ev.block_on(&completion).unwrap();
    }

    #[test]
    fn test_tokio_loop_fires_ready_watcher() {
        let (reader, mut writer) = create_pipe();
        writer.write_all(b"x").unwrap();

        let ev = Rc::new(TokioEventLoop::new().unwrap());
        let completion = ev.fresh_completion();

        let fired = Rc::new(Cell::new(false));
        let fired_in_cb = Rc::clone(&fired);
        let ev_in_cb = Rc::clone(&ev);
        let done = completion.clone();
        ev.register_readable(
            reader.as_raw_fd(),
            Box::new(move || {
                fired_in_cb.set(true);
                ev_in_cb.signal_done(&done);
            }),
        );

        ev.block_on(&completion).unwrap();
        assert!(fired.get());
    }

    #[test]
    fn test_tokio_loop_cancel_aborts_watcher() {
        let (reader, _writer) = create_pipe();
        let ev = TokioEventLoop::new().unwrap();
        let watcher = ev.register_readable(reader.as_raw_fd(), Box::new(|| {}));
        ev.cancel(watcher);
        assert!(ev.tasks.borrow().is_empty());
    }
}
