//! Lock acquisition order
//!
//! The ordered locks of the kernel, outermost first:
//!
//! 1. `Kernel` external mutation lock
//! 2. controlling terminal lock
//! 3. per-thread-group timer lock
//! 4. locks internal to interval timers
//! 5. `TaskSet` lock
//! 6. signal handlers lock
//! 7. per-task lock
//! 8. running-tasks accounting lock
//!
//! Holding several signal handlers locks at once requires the `TaskSet` lock
//! to be held exclusively; holding several task locks at once requires the
//! signal handlers locks of every task involved.
//!
//! Debug builds record the levels held by each thread and panic on an
//! out-of-order acquisition. Release builds compile the checks away.

use std::ops::{Deref, DerefMut};

/// Position of a lock in the global order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Level {
    External,
    Tty,
    ThreadGroupTimers,
    TimerInternal,
    TaskSet,
    SignalHandlers,
    Task,
    RunningTasks,
}

impl Level {
    /// Levels that may be held more than once under the documented rules
    fn nests(self) -> bool {
        matches!(self, Level::SignalHandlers | Level::Task)
    }
}

#[cfg(debug_assertions)]
mod checker {
    use super::Level;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<Level>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn push(level: Level) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&deepest) = held.iter().max() {
                let ok = level > deepest || (level == deepest && level.nests());
                if !ok {
                    panic!(
                        "lock order violation: acquiring {:?} while holding {:?}",
                        level, *held
                    );
                }
            }
            held.push(level);
        });
    }

    pub(super) fn pop(level: Level) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&l| l == level) {
                held.remove(pos);
            }
        });
    }

    pub(super) fn held() -> Vec<Level> {
        HELD.with(|held| held.borrow().clone())
    }
}

/// Records that the current thread holds a lock at `level`
#[derive(Debug)]
pub(crate) struct LevelToken {
    #[cfg(debug_assertions)]
    level: Level,
}

pub(crate) fn enter(level: Level) -> LevelToken {
    #[cfg(debug_assertions)]
    {
        checker::push(level);
        LevelToken { level }
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = level;
        LevelToken {}
    }
}

impl Drop for LevelToken {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        checker::pop(self.level);
    }
}

/// Levels currently held by this thread, outermost first
#[cfg(debug_assertions)]
pub(crate) fn held() -> Vec<Level> {
    checker::held()
}

/// A lock guard tagged with its level
///
/// The guard is released before the level is forgotten.
pub(crate) struct Ordered<G> {
    guard: G,
    _token: LevelToken,
}

impl<G> Ordered<G> {
    /// Acquires a lock with `lock` after checking `level`
    pub(crate) fn acquire(level: Level, lock: impl FnOnce() -> G) -> Self {
        let token = enter(level);
        Self {
            guard: lock(),
            _token: token,
        }
    }

    /// Access to the raw guard, e.g. for condition variable waits
    pub(crate) fn guard_mut(&mut self) -> &mut G {
        &mut self.guard
    }
}

impl<G: Deref> Deref for Ordered<G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for Ordered<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(all(test, debug_assertions))]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_acquisition() {
        let _a = enter(Level::External);
        let _b = enter(Level::TaskSet);
        let _c = enter(Level::SignalHandlers);
        let _d = enter(Level::SignalHandlers);
        assert_eq!(held().len(), 4);
    }

    #[test]
    fn test_release_forgets_level() {
        {
            let _a = enter(Level::Task);
        }
        let _b = enter(Level::TaskSet);
        assert_eq!(held(), vec![Level::TaskSet]);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_out_of_order_acquisition_panics() {
        let _a = enter(Level::SignalHandlers);
        let _b = enter(Level::TaskSet);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_task_set_does_not_nest() {
        let _a = enter(Level::TaskSet);
        let _b = enter(Level::TaskSet);
    }
}
