//! Process-wide registry of live dispatchers.
//!
//! The sole consumer is the child-side reset: immediately after fork, the
//! child walks the registry and drops every piece of state it inherited
//! from the parent, so nested dispatchers in the child cannot touch the
//! parent's children or pipes. Dead entries are pruned on each
//! registration; iteration never leaves this module.
//!
//! The parent is single-threaded by contract and fork preserves only the
//! calling thread, so a thread-local list is the narrowest correct scope.

use std::cell::RefCell;
use std::rc::Weak;

/// State a dispatcher must be able to shed after fork.
pub(crate) trait InheritedState {
    /// Drop all state inherited from the parent process.
    fn reset_inherited(&self);
}

thread_local! {
    static DISPATCHERS: RefCell<Vec<Weak<dyn InheritedState>>> = const { RefCell::new(Vec::new()) };
}

/// Track a newly constructed dispatcher.
pub(crate) fn register(entry: Weak<dyn InheritedState>) {
    DISPATCHERS.with(|cell| {
        let mut list = cell.borrow_mut();
        list.retain(|weak| weak.strong_count() > 0);
        list.push(entry);
    });
}

/// Reset every live dispatcher. Called in the child, after fork, before
/// the work function runs.
pub(crate) fn reset_all() {
    DISPATCHERS.with(|cell| {
        for entry in cell.borrow().iter() {
            if let Some(state) = entry.upgrade() {
                state.reset_inherited();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Probe {
        resets: Cell<usize>,
    }

    impl InheritedState for Probe {
        fn reset_inherited(&self) {
            self.resets.set(self.resets.get() + 1);
        }
    }

    #[test]
    fn test_reset_reaches_live_entries() {
        let probe = Rc::new(Probe {
            resets: Cell::new(0),
        });
        let weak = {
            let as_trait: Rc<dyn InheritedState> = probe.clone() as Rc<dyn InheritedState>;
            Rc::downgrade(&as_trait)
        };
        register(weak);

        reset_all();
        assert_eq!(probe.resets.get(), 1);
        reset_all();
        assert_eq!(probe.resets.get(), 2);
    }

    #[test]
    fn test_dead_entries_are_skipped() {
        let probe = Rc::new(Probe {
            resets: Cell::new(0),
        });
        let weak = {
            let as_trait: Rc<dyn InheritedState> = probe.clone() as Rc<dyn InheritedState>;
            Rc::downgrade(&as_trait)
        };
        register(weak);
        drop(probe);

        // Upgrading a dead weak must be a no-op, not a panic.
        reset_all();
    }
}
