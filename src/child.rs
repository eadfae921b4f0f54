//! Child-side runner.
//!
//! After fork the child owns only the write end of its pipe. It resets
//! every dispatcher inherited from the parent, runs the work function
//! once, sends exactly one frame, and exits without returning to the
//! caller. Failures never propagate through the exit status; the frame is
//! the parent's only view.

use std::panic::{self, AssertUnwindSafe};

use nix::libc;
use nix::sys::signal::{SigHandler, Signal, signal};

use crate::codec::Codec;
use crate::ipc::{FrameKind, FrameWriter, PipeFd};
use crate::registry;

/// A unit of work executed in a forked child.
pub type Work<T> = Box<dyn FnOnce() -> anyhow::Result<T>>;

/// Run a work unit in the child and report through `write_end`.
pub(crate) fn run<C: Codec>(codec: &C, work: Work<C::Value>, write_end: PipeFd) -> ! {
    // The parent may be gone by the time the frame is written; SIGPIPE
    // must not kill the child mid-write.
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    prepare_child();

    let (kind, payload) = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => match codec.encode(&value) {
            Ok(bytes) => (FrameKind::Result, bytes),
            Err(err) => (FrameKind::Error, err.to_string().into_bytes()),
        },
        Ok(Err(err)) => (FrameKind::Error, format!("{err:#}").into_bytes()),
        Err(payload) => (FrameKind::Error, panic_text(payload.as_ref()).into_bytes()),
    };

    let mut writer = FrameWriter::new(write_end);
    let _ = writer.write_frame(kind, &payload);
    drop(writer);

    exit_child()
}

/// Run a fire-and-forget work unit. No pipe, no frame.
pub(crate) fn run_detached(work: Box<dyn FnOnce()>) -> ! {
    prepare_child();
    let _ = panic::catch_unwind(AssertUnwindSafe(work));
    exit_child()
}

/// Post-fork hygiene shared by both runners: shed every dispatcher
/// inherited from the parent (closing sibling pipe ends with them) and
/// silence the panic hook, which would otherwise write to the stderr
/// shared with the parent.
fn prepare_child() {
    registry::reset_all();
    panic::set_hook(Box::new(|_| {}));
}

/// Leave without unwinding or flushing stdio inherited from the parent.
fn exit_child() -> ! {
    unsafe { libc::_exit(0) }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "work function panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_text_downcasts_str() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_text(payload.as_ref()), "boom");
    }

    #[test]
    fn test_panic_text_downcasts_string() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("kaput"));
        assert_eq!(panic_text(payload.as_ref()), "kaput");
    }

    #[test]
    fn test_panic_text_fallback() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(17_u32);
        assert_eq!(panic_text(payload.as_ref()), "work function panicked");
    }
}
