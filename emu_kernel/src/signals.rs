//! Signal queues and per-thread-group signal state
//!
//! All state in this module is guarded by the signal handlers lock of the
//! owning thread group.

use crate::lock_order::{Level, Ordered};
use crate::task::Task;
use crate::timer::CpuTimer;
use crate::tty::Tty;
use core_types::{Errno, SigAction, SigHandler, Signal, SignalInfo, SignalSet, TaskKey, WaitStatus};
use core_types::{sa_flags, DefaultAction};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Queued instances allowed per real-time signal
pub const MAX_QUEUED_PER_SIGNAL: usize = 32;

/// Signals waiting to be delivered, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSignals {
    queue: Vec<SignalInfo>,
}

impl PendingSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `info`
    ///
    /// A standard signal that is already pending is merged into the pending
    /// instance. Real-time signals queue up to [`MAX_QUEUED_PER_SIGNAL`]
    /// instances each; beyond that the send fails with EAGAIN.
    pub fn enqueue(&mut self, info: SignalInfo) -> Result<bool, Errno> {
        let sig = info.signal();
        if sig.is_standard() {
            if self.contains(sig) {
                return Ok(false);
            }
        } else if self.count(sig) >= MAX_QUEUED_PER_SIGNAL {
            return Err(Errno::EAGAIN);
        }
        self.queue.push(info);
        Ok(true)
    }

    /// Removes the lowest-numbered pending signal not blocked by `mask`
    pub fn dequeue(&mut self, mask: SignalSet) -> Option<SignalInfo> {
        let mask = mask.without_unblockable();
        let (pos, _) = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, info)| !mask.contains(info.signal()))
            .min_by_key(|(pos, info)| (info.signo, *pos))?;
        Some(self.queue.remove(pos))
    }

    pub fn discard(&mut self, sig: Signal) {
        self.queue.retain(|info| info.signal() != sig);
    }

    pub fn contains(&self, sig: Signal) -> bool {
        self.queue.iter().any(|info| info.signal() == sig)
    }

    pub fn count(&self, sig: Signal) -> usize {
        self.queue.iter().filter(|info| info.signal() == sig).count()
    }

    pub fn pending_set(&self) -> SignalSet {
        let mut set = SignalSet::empty();
        for info in &self.queue {
            set.add(info.signal());
        }
        set
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn to_vec(&self) -> Vec<SignalInfo> {
        self.queue.clone()
    }

    pub fn from_vec(queue: Vec<SignalInfo>) -> Self {
        Self { queue }
    }
}

/// Signal state of one task
#[derive(Debug)]
pub(crate) struct TaskSignals {
    pub(crate) task: Weak<Task>,
    pub(crate) pending: PendingSignals,
    pub(crate) mask: SignalSet,
    /// Outstanding external stops
    pub(crate) stop_count: i32,
    /// Set when the task must exit at its next opportunity
    pub(crate) killed: bool,
}

impl TaskSignals {
    pub(crate) fn new(task: &Arc<Task>, mask: SignalSet, stop_count: i32) -> Self {
        Self {
            task: Arc::downgrade(task),
            pending: PendingSignals::new(),
            mask,
            stop_count,
            killed: false,
        }
    }

    pub(crate) fn interrupt(&self) {
        if let Some(task) = self.task.upgrade() {
            task.interrupt();
        }
    }
}

/// What a task must do with a dequeued signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SignalDisposition {
    /// Run the application's handler
    Handler(SignalInfo, SigAction),
    /// The thread group entered a group stop
    Stop(SignalInfo),
    /// The thread group is exiting
    Exit(WaitStatus),
}

/// Signal state shared by the tasks of a thread group
#[derive(Debug)]
pub(crate) struct SignalState {
    pub(crate) actions: Vec<SigAction>,
    pub(crate) group_pending: PendingSignals,
    pub(crate) tasks: BTreeMap<TaskKey, TaskSignals>,
    /// Set once a group exit has begun
    pub(crate) exiting: bool,
    pub(crate) exit_status: WaitStatus,
    pub(crate) group_stopped: bool,
    pub(crate) group_stop_signal: Option<Signal>,
    pub(crate) itimer_virtual: CpuTimer,
    pub(crate) itimer_prof: CpuTimer,
    pub(crate) tty: Option<Arc<Tty>>,
}

impl SignalState {
    pub(crate) fn new(actions: Vec<SigAction>) -> Self {
        Self {
            actions,
            group_pending: PendingSignals::new(),
            tasks: BTreeMap::new(),
            exiting: false,
            exit_status: WaitStatus::default(),
            group_stopped: false,
            group_stop_signal: None,
            itimer_virtual: CpuTimer::default(),
            itimer_prof: CpuTimer::default(),
            tty: None,
        }
    }

    pub(crate) fn action(&self, sig: Signal) -> SigAction {
        self.actions.get(sig.index()).copied().unwrap_or_default()
    }

    pub(crate) fn is_ignored(&self, sig: Signal) -> bool {
        match self.action(sig).handler {
            SigHandler::Ignore => true,
            SigHandler::Default => sig.default_action() == DefaultAction::Ignore,
            SigHandler::User(_) => false,
        }
    }

    fn discard_everywhere(&mut self, sig: Signal) {
        self.group_pending.discard(sig);
        for ts in self.tasks.values_mut() {
            ts.pending.discard(sig);
        }
    }

    pub(crate) fn pending_set(&self) -> SignalSet {
        let mut set = self.group_pending.pending_set();
        for ts in self.tasks.values() {
            set.0 |= ts.pending.pending_set().0;
        }
        set
    }

    pub(crate) fn cpu_timers_armed(&self) -> bool {
        self.itimer_virtual.is_armed() || self.itimer_prof.is_armed()
    }
}

/// The signal handlers lock of a thread group and what it guards
#[derive(Debug)]
pub struct SignalHandlers {
    state: Mutex<SignalState>,
    /// Signalled when a stop of any kind may have ended
    pub(crate) end_stop_cond: Condvar,
}

impl SignalHandlers {
    pub(crate) fn new(actions: Vec<SigAction>) -> Self {
        Self::from_state(SignalState::new(actions))
    }

    pub(crate) fn from_state(state: SignalState) -> Self {
        Self {
            state: Mutex::new(state),
            end_stop_cond: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> Ordered<MutexGuard<'_, SignalState>> {
        Ordered::acquire(Level::SignalHandlers, || self.state.lock())
    }

    /// Delivers `info` to the thread group, or to `target` if given
    pub(crate) fn send_locked(
        &self,
        state: &mut SignalState,
        target: Option<TaskKey>,
        info: SignalInfo,
    ) -> Result<(), Errno> {
        let sig = info.signal();
        if !sig.is_valid() {
            return Err(Errno::EINVAL);
        }
        if state.tasks.is_empty() {
            return Err(Errno::ESRCH);
        }
        if let Some(key) = target {
            if !state.tasks.contains_key(&key) {
                return Err(Errno::ESRCH);
            }
        }
        if state.exiting {
            debug!(signo = sig.0, "thread group exiting, dropping signal");
            return Ok(());
        }

        if sig == Signal::SIGKILL {
            self.begin_group_exit_locked(state, WaitStatus::signaled(Signal::SIGKILL));
            return Ok(());
        }
        if sig == Signal::SIGCONT {
            for stop in [Signal::SIGSTOP, Signal::SIGTSTP, Signal::SIGTTIN, Signal::SIGTTOU] {
                state.discard_everywhere(stop);
            }
            self.end_group_stop_locked(state);
        } else if sig.is_stop() {
            state.discard_everywhere(Signal::SIGCONT);
        }

        if state.is_ignored(sig) {
            debug!(signo = sig.0, "discarding ignored signal");
            return Ok(());
        }

        match target {
            Some(key) => {
                if let Some(ts) = state.tasks.get_mut(&key) {
                    ts.pending.enqueue(info)?;
                    if !ts.mask.contains(sig) {
                        ts.interrupt();
                    }
                }
            }
            None => {
                state.group_pending.enqueue(info)?;
                if let Some(ts) = state.tasks.values().find(|ts| !ts.mask.contains(sig)) {
                    ts.interrupt();
                }
            }
        }
        Ok(())
    }

    /// Starts a group exit with `status` unless one is already underway
    pub(crate) fn begin_group_exit_locked(&self, state: &mut SignalState, status: WaitStatus) {
        if !state.exiting {
            state.exiting = true;
            state.exit_status = status;
        }
        state.group_stopped = false;
        for ts in state.tasks.values_mut() {
            ts.killed = true;
            ts.interrupt();
        }
        self.end_stop_cond.notify_all();
    }

    pub(crate) fn begin_group_stop_locked(&self, state: &mut SignalState, sig: Signal) {
        if state.exiting || state.group_stopped {
            return;
        }
        state.group_stopped = true;
        state.group_stop_signal = Some(sig);
        for ts in state.tasks.values() {
            ts.interrupt();
        }
    }

    pub(crate) fn end_group_stop_locked(&self, state: &mut SignalState) {
        if state.group_stopped {
            state.group_stopped = false;
            state.group_stop_signal = None;
            self.end_stop_cond.notify_all();
        }
    }

    /// Takes the next deliverable signal for `key` and resolves its action
    ///
    /// Signals whose action is to be ignored or to continue are consumed
    /// here. Returns `None` when nothing deliverable is pending.
    pub(crate) fn dequeue_locked(
        &self,
        state: &mut SignalState,
        key: TaskKey,
    ) -> Option<SignalDisposition> {
        loop {
            let ts = state.tasks.get_mut(&key)?;
            let mask = ts.mask;
            let info = match ts.pending.dequeue(mask) {
                Some(info) => info,
                None => state.group_pending.dequeue(mask)?,
            };
            let sig = info.signal();
            let mut action = state.action(sig);
            match action.handler {
                SigHandler::Ignore => continue,
                SigHandler::User(_) => {
                    if action.flags & sa_flags::SA_RESETHAND != 0 {
                        state.actions[sig.index()] = SigAction::default();
                    }
                    if let Some(ts) = state.tasks.get_mut(&key) {
                        ts.mask.0 |= action.mask.0;
                        if action.flags & sa_flags::SA_NODEFER == 0 {
                            ts.mask.add(sig);
                        }
                        ts.mask = ts.mask.without_unblockable();
                    }
                    action.mask = action.mask.without_unblockable();
                    return Some(SignalDisposition::Handler(info, action));
                }
                SigHandler::Default => match sig.default_action() {
                    DefaultAction::Ignore | DefaultAction::Continue => continue,
                    DefaultAction::Stop => {
                        self.begin_group_stop_locked(state, sig);
                        return Some(SignalDisposition::Stop(info));
                    }
                    DefaultAction::Term => {
                        self.begin_group_exit_locked(state, WaitStatus::signaled(sig));
                        return Some(SignalDisposition::Exit(state.exit_status));
                    }
                    DefaultAction::Core => {
                        self.begin_group_exit_locked(state, WaitStatus::core_dumped(sig));
                        return Some(SignalDisposition::Exit(state.exit_status));
                    }
                },
            }
        }
    }

    /// Installs an action for `sig`, returning the previous one
    pub(crate) fn set_action_locked(
        &self,
        state: &mut SignalState,
        sig: Signal,
        action: SigAction,
    ) -> Result<SigAction, Errno> {
        if !sig.is_valid() || sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            return Err(Errno::EINVAL);
        }
        let old = state.action(sig);
        let mut action = action;
        action.mask = action.mask.without_unblockable();
        state.actions[sig.index()] = action;
        if state.is_ignored(sig) {
            state.discard_everywhere(sig);
        }
        Ok(old)
    }
}

/// Default action table
pub(crate) fn default_actions() -> Vec<SigAction> {
    vec![SigAction::default(); Signal::SIGRTMAX.0 as usize]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSignalsSnapshot {
    pub task: TaskKey,
    pub pending: Vec<SignalInfo>,
    pub mask: SignalSet,
    pub killed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalStateSnapshot {
    pub actions: Vec<SigAction>,
    pub group_pending: Vec<SignalInfo>,
    pub tasks: Vec<TaskSignalsSnapshot>,
    pub exiting: bool,
    pub exit_status: WaitStatus,
    pub group_stopped: bool,
    pub group_stop_signal: Option<Signal>,
    pub itimer_virtual: CpuTimer,
    pub itimer_prof: CpuTimer,
    /// Index of the controlling terminal
    pub tty: Option<u32>,
}

impl SignalState {
    pub(crate) fn snapshot(&self) -> SignalStateSnapshot {
        SignalStateSnapshot {
            actions: self.actions.clone(),
            group_pending: self.group_pending.to_vec(),
            tasks: self
                .tasks
                .iter()
                .map(|(key, ts)| TaskSignalsSnapshot {
                    task: *key,
                    pending: ts.pending.to_vec(),
                    mask: ts.mask,
                    killed: ts.killed,
                })
                .collect(),
            exiting: self.exiting,
            exit_status: self.exit_status,
            group_stopped: self.group_stopped,
            group_stop_signal: self.group_stop_signal,
            itimer_virtual: self.itimer_virtual,
            itimer_prof: self.itimer_prof,
            tty: self.tty.as_ref().map(|t| t.index()),
        }
    }

    /// Rebuilds group state; per-task entries are added as tasks are
    /// restored
    pub(crate) fn from_snapshot(snap: &SignalStateSnapshot, tty: Option<Arc<Tty>>) -> Self {
        let mut actions = snap.actions.clone();
        actions.resize(Signal::SIGRTMAX.0 as usize, SigAction::default());
        Self {
            actions,
            group_pending: PendingSignals::from_vec(snap.group_pending.clone()),
            tasks: BTreeMap::new(),
            exiting: snap.exiting,
            exit_status: snap.exit_status,
            group_stopped: snap.group_stopped,
            group_stop_signal: snap.group_stop_signal,
            itimer_virtual: snap.itimer_virtual,
            itimer_prof: snap.itimer_prof,
            tty,
        }
    }
}

impl TaskSignals {
    pub(crate) fn restore(task: &Arc<Task>, snap: &TaskSignalsSnapshot) -> Self {
        Self {
            task: Arc::downgrade(task),
            pending: PendingSignals::from_vec(snap.pending.clone()),
            mask: snap.mask,
            stop_count: 0,
            killed: snap.killed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::code;

    fn info(sig: Signal) -> SignalInfo {
        SignalInfo::kernel(sig)
    }

    #[test]
    fn test_standard_signals_coalesce() {
        let mut pending = PendingSignals::new();
        assert_eq!(pending.enqueue(info(Signal::SIGUSR1)), Ok(true));
        assert_eq!(pending.enqueue(info(Signal::SIGUSR1)), Ok(false));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_realtime_signals_queue_until_full() {
        let mut pending = PendingSignals::new();
        for _ in 0..MAX_QUEUED_PER_SIGNAL {
            pending.enqueue(info(Signal::SIGRTMIN)).unwrap();
        }
        assert_eq!(pending.enqueue(info(Signal::SIGRTMIN)), Err(Errno::EAGAIN));
        assert!(pending.enqueue(info(Signal(Signal::SIGRTMIN.0 + 1))).is_ok());
    }

    #[test]
    fn test_dequeue_lowest_unblocked_first() {
        let mut pending = PendingSignals::new();
        let mut first = info(Signal::SIGRTMIN);
        first.code = code::SI_QUEUE;
        pending.enqueue(first).unwrap();
        pending.enqueue(info(Signal::SIGRTMIN)).unwrap();
        pending.enqueue(info(Signal::SIGUSR2)).unwrap();
        pending.enqueue(info(Signal::SIGKILL)).unwrap();

        let mask = SignalSet::of(&[Signal::SIGKILL, Signal::SIGUSR2]);
        assert_eq!(pending.dequeue(mask).map(|i| i.signal()), Some(Signal::SIGKILL));
        assert_eq!(pending.dequeue(mask).map(|i| i.code), Some(code::SI_QUEUE));
        assert_eq!(pending.dequeue(mask).map(|i| i.signal()), Some(Signal::SIGRTMIN));
        assert_eq!(pending.dequeue(mask), None);
        assert_eq!(pending.dequeue(SignalSet::empty()).map(|i| i.signal()), Some(Signal::SIGUSR2));
    }

    #[test]
    fn test_set_action_rejects_unblockable() {
        let handlers = SignalHandlers::new(default_actions());
        let mut state = handlers.lock();
        let ignore = SigAction {
            handler: SigHandler::Ignore,
            ..SigAction::default()
        };
        assert_eq!(
            handlers.set_action_locked(&mut state, Signal::SIGKILL, ignore),
            Err(Errno::EINVAL)
        );
        assert!(handlers
            .set_action_locked(&mut state, Signal::SIGUSR1, ignore)
            .is_ok());
        assert!(state.is_ignored(Signal::SIGUSR1));
        assert!(state.is_ignored(Signal::SIGCHLD));
        assert!(!state.is_ignored(Signal::SIGTERM));
    }

    #[test]
    fn test_send_to_empty_group() {
        let handlers = SignalHandlers::new(default_actions());
        let mut state = handlers.lock();
        assert_eq!(
            handlers.send_locked(&mut state, None, info(Signal::SIGTERM)),
            Err(Errno::ESRCH)
        );
    }
}
