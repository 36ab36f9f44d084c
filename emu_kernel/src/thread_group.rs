//! Thread groups
//!
//! A thread group is what applications call a process. It owns the signal
//! handlers shared by its tasks, the interval timers, the resource limits
//! and the process group membership. Tasks refer to their thread group
//! strongly; the thread group refers back to its live tasks until they
//! exit.

use crate::lock_order::{Level, Ordered};
use crate::pid_namespace::PidNamespace;
use crate::session::{ProcessGroup, Session};
use crate::signals::{SignalHandlers, SignalState, SignalStateSnapshot};
use crate::task::{CpuStats, Task};
use crate::task_set::TaskSet;
use crate::timer::{CpuTimer, IntervalTimer, IntervalTimerSnapshot, TimerSetting};
use crate::tty::Tty;
use core_types::{code, Capability, Errno, SigAction, Signal, SignalInfo, SignalSet, WaitStatus};
use identity::Credentials;
use lifecycle::Deadline;
use parking_lot::{Condvar, Mutex};
use resources::{Limit, LimitKind, LimitSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// The interval timers of setitimer(2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItimerKind {
    /// Counts host time; delivers SIGALRM
    Real,
    /// Counts user CPU time; delivers SIGVTALRM
    Virtual,
    /// Counts user and system CPU time; delivers SIGPROF
    Prof,
}

#[derive(Default)]
pub(crate) struct GroupLinks {
    /// Live tasks, in creation order
    pub(crate) tasks: Vec<Arc<Task>>,
    pub(crate) leader: Weak<Task>,
    pub(crate) parent: Weak<ThreadGroup>,
    pub(crate) children: Vec<Weak<ThreadGroup>>,
    pub(crate) process_group: Option<Arc<ProcessGroup>>,
    pub(crate) exited: bool,
    pub(crate) exit_status: WaitStatus,
}

pub struct ThreadGroup {
    uid: u64,
    pidns: Arc<PidNamespace>,
    limits: Arc<LimitSet>,
    termination_signal: Option<Signal>,
    pub(crate) signals: SignalHandlers,
    pub(crate) links: Mutex<GroupLinks>,
    /// Signalled when the last task exits
    pub(crate) exit_cond: Condvar,
    timers: Mutex<()>,
    pub(crate) itimer_real: IntervalTimer,
    /// Set while ITIMER_VIRTUAL or ITIMER_PROF is armed
    pub(crate) cpu_timers_enabled: AtomicBool,
    /// CPU time of tasks that have exited
    pub(crate) exited_stats: Mutex<CpuStats>,
}

/// Fields shared by new and restored thread groups
pub(crate) struct ThreadGroupParts {
    pub(crate) uid: u64,
    pub(crate) pidns: Arc<PidNamespace>,
    pub(crate) limits: Arc<LimitSet>,
    pub(crate) termination_signal: Option<Signal>,
    pub(crate) signal_state: SignalState,
    pub(crate) itimer_real: Option<IntervalTimerSnapshot>,
    pub(crate) exited_stats: CpuStats,
}

impl ThreadGroup {
    /// Creates a thread group with no tasks
    pub fn new(
        uid: u64,
        pidns: Arc<PidNamespace>,
        limits: Arc<LimitSet>,
        termination_signal: Option<Signal>,
    ) -> Arc<Self> {
        Self::build(ThreadGroupParts {
            uid,
            pidns,
            limits,
            termination_signal,
            signal_state: SignalState::new(crate::signals::default_actions()),
            itimer_real: None,
            exited_stats: CpuStats::default(),
        })
    }

    pub(crate) fn build(parts: ThreadGroupParts) -> Arc<Self> {
        let cpu_timers = parts.signal_state.cpu_timers_armed();
        Arc::new_cyclic(|weak: &Weak<ThreadGroup>| {
            let weak = weak.clone();
            let listener = Box::new(move |overruns: u64| {
                if let Some(tg) = weak.upgrade() {
                    let mut info = SignalInfo::kernel(Signal::SIGALRM);
                    info.status = i32::try_from(overruns.saturating_sub(1)).unwrap_or(i32::MAX);
                    if let Err(err) = tg.send_signal(info) {
                        debug!(tg = tg.uid, %err, "ITIMER_REAL expiration not delivered");
                    }
                }
            });
            let name = format!("itimer-real-{}", parts.uid);
            let itimer_real = match &parts.itimer_real {
                Some(snapshot) => IntervalTimer::from_snapshot(name, snapshot, listener),
                None => IntervalTimer::new(name, listener),
            };
            ThreadGroup {
                uid: parts.uid,
                pidns: parts.pidns,
                limits: parts.limits,
                termination_signal: parts.termination_signal,
                signals: SignalHandlers::from_state(parts.signal_state),
                links: Mutex::new(GroupLinks::default()),
                exit_cond: Condvar::new(),
                timers: Mutex::new(()),
                itimer_real,
                cpu_timers_enabled: AtomicBool::new(cpu_timers),
                exited_stats: Mutex::new(parts.exited_stats),
            }
        })
    }

    /// Kernel-unique identity, stable across checkpoints
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn pid_namespace(&self) -> &Arc<PidNamespace> {
        &self.pidns
    }

    pub fn limits(&self) -> &Arc<LimitSet> {
        &self.limits
    }

    /// Signal sent to the parent when the group exits, if any
    pub fn termination_signal(&self) -> Option<Signal> {
        self.termination_signal
    }

    pub fn leader(&self) -> Option<Arc<Task>> {
        self.links.lock().leader.upgrade()
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.links.lock().tasks.clone()
    }

    pub fn task_count(&self) -> usize {
        self.links.lock().tasks.len()
    }

    pub fn parent(&self) -> Option<Arc<ThreadGroup>> {
        self.links.lock().parent.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<ThreadGroup>> {
        self.links
            .lock()
            .children
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn process_group(&self) -> Option<Arc<ProcessGroup>> {
        self.links.lock().process_group.clone()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.process_group().map(|pg| Arc::clone(pg.session()))
    }

    pub fn has_exited(&self) -> bool {
        self.links.lock().exited
    }

    /// Exit status once the last task has exited
    pub fn exit_status(&self) -> Option<WaitStatus> {
        let links = self.links.lock();
        links.exited.then_some(links.exit_status)
    }

    /// Reports whether a group exit is underway
    pub fn is_exiting(&self) -> bool {
        self.signals.lock().exiting
    }

    pub fn is_group_stopped(&self) -> bool {
        self.signals.lock().group_stopped
    }

    /// Sends `info` to the thread group
    pub fn send_signal(&self, info: SignalInfo) -> Result<(), Errno> {
        let mut state = self.signals.lock();
        self.signals.send_locked(&mut state, None, info)
    }

    /// Installs `action` for `sig`, as sigaction(2), returning the old one
    pub fn set_signal_action(&self, sig: Signal, action: SigAction) -> Result<SigAction, Errno> {
        let mut state = self.signals.lock();
        self.signals.set_action_locked(&mut state, sig, action)
    }

    /// Signals pending for the group or any of its tasks
    pub fn pending_signals(&self) -> SignalSet {
        self.signals.lock().pending_set()
    }

    /// Starts a group exit; every task exits at its next opportunity
    pub fn group_exit(&self, status: WaitStatus) {
        let mut state = self.signals.lock();
        self.signals.begin_group_exit_locked(&mut state, status);
    }

    /// Blocks until the last task has exited
    pub fn wait_exited(&self) -> WaitStatus {
        let mut links = self.links.lock();
        while !links.exited {
            self.exit_cond.wait(&mut links);
        }
        links.exit_status
    }

    /// Like [`ThreadGroup::wait_exited`], giving up at `deadline`
    pub fn wait_exited_until(&self, deadline: Deadline) -> Option<WaitStatus> {
        let mut links = self.links.lock();
        while !links.exited {
            if self
                .exit_cond
                .wait_until(&mut links, deadline.instant())
                .timed_out()
            {
                break;
            }
        }
        links.exited.then_some(links.exit_status)
    }

    /// CPU time of the live and exited tasks
    pub fn cpu_stats(&self) -> CpuStats {
        let mut total = *self.exited_stats.lock();
        for task in self.tasks() {
            total = total.add(task.cpu_stats());
        }
        total
    }

    pub fn get_itimer(&self, which: ItimerKind) -> TimerSetting {
        let _timers = Ordered::acquire(Level::ThreadGroupTimers, || self.timers.lock());
        match which {
            ItimerKind::Real => self.itimer_real.get(),
            ItimerKind::Virtual => self.signals.lock().itimer_virtual.setting(),
            ItimerKind::Prof => self.signals.lock().itimer_prof.setting(),
        }
    }

    /// Arms or disarms an interval timer, returning the previous setting
    pub fn set_itimer(&self, which: ItimerKind, setting: TimerSetting) -> TimerSetting {
        let _timers = Ordered::acquire(Level::ThreadGroupTimers, || self.timers.lock());
        if which == ItimerKind::Real {
            return self.itimer_real.set(setting);
        }
        let mut state = self.signals.lock();
        let timer = match which {
            ItimerKind::Virtual => &mut state.itimer_virtual,
            _ => &mut state.itimer_prof,
        };
        let old = timer.setting();
        *timer = CpuTimer::from_setting(setting);
        self.cpu_timers_enabled
            .store(state.cpu_timers_armed(), Ordering::SeqCst);
        old
    }

    /// Charges CPU clock ticks to the CPU timers
    ///
    /// `user` ticks were spent in application code and `sys` ticks in the
    /// kernel on behalf of the group.
    pub(crate) fn advance_cpu_timers(&self, user: u64, sys: u64) {
        if !self.cpu_timers_enabled.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.signals.lock();
        let virt = state.itimer_virtual.advance(user);
        let prof = state.itimer_prof.advance(user + sys);
        self.cpu_timers_enabled
            .store(state.cpu_timers_armed(), Ordering::SeqCst);
        for (expirations, sig) in [(virt, Signal::SIGVTALRM), (prof, Signal::SIGPROF)] {
            if expirations == 0 {
                continue;
            }
            let mut info = SignalInfo::kernel(sig);
            info.status = i32::try_from(expirations - 1).unwrap_or(i32::MAX);
            if let Err(err) = self.signals.send_locked(&mut state, None, info) {
                debug!(tg = self.uid, signo = sig.0, %err, "CPU timer expiration not delivered");
            }
        }
    }

    pub fn set_limit(&self, kind: LimitKind, limit: Limit, privileged: bool) -> Result<Limit, Errno> {
        self.limits.set(kind, limit, privileged)
    }

    /// The controlling terminal of the group's session
    pub fn controlling_tty(&self) -> Option<Arc<Tty>> {
        self.signals.lock().tty.clone()
    }

    /// Makes `tty` the controlling terminal of this group's session
    ///
    /// The group must lead its session and have no other controlling
    /// terminal. A terminal controlling another session may be taken over
    /// only with `steal` and CAP_SYS_ADMIN; without CAP_SYS_ADMIN the
    /// terminal must also be readable by the caller.
    pub fn set_controlling_tty(
        self: &Arc<Self>,
        task_set: &TaskSet,
        creds: &Credentials,
        tty: &Arc<Tty>,
        steal: bool,
        is_readable: bool,
    ) -> Result<(), Errno> {
        let mut tty_state = tty.lock();
        let state = task_set.write();

        let session = self.session().ok_or(Errno::EINVAL)?;
        if !session.is_leader(self) {
            return Err(Errno::EINVAL);
        }
        {
            let sig = self.signals.lock();
            if let Some(current) = &sig.tty {
                if Arc::ptr_eq(current, tty) {
                    return Ok(());
                }
                return Err(Errno::EINVAL);
            }
        }

        let root_user_ns = creds.user_namespace.root();
        let has_admin = creds.has_capability_in(Capability::SYS_ADMIN, &root_user_ns);
        let owner = tty_state.tg.as_ref().and_then(Weak::upgrade);
        if let Some(owner) = owner {
            let owner_session = owner.session();
            if owner_session.as_ref().map(|s| s.id()) != Some(session.id()) {
                if !has_admin || !steal {
                    return Err(Errno::EPERM);
                }
                for tg in state.thread_groups.values() {
                    if tg.session().map(|s| s.id()) == owner_session.as_ref().map(|s| s.id()) {
                        tg.signals.lock().tty = None;
                    }
                }
            }
        }
        if !is_readable && !has_admin {
            return Err(Errno::EPERM);
        }

        for tg in state.thread_groups.values() {
            if tg.session().map(|s| s.id()) == Some(session.id()) {
                tg.signals.lock().tty = Some(Arc::clone(tty));
            }
        }
        tty_state.tg = Some(Arc::downgrade(self));
        Ok(())
    }

    /// SIGCHLD-style info describing this group's exit to its parent
    pub(crate) fn exit_notification(&self, pid: i32, status: WaitStatus) -> Option<SignalInfo> {
        let sig = self.termination_signal?;
        let mut info = SignalInfo::kernel(sig);
        info.pid = pid;
        match (status.exit_code(), status.termination_signal()) {
            (Some(exit_code), _) => {
                info.code = code::CLD_EXITED;
                info.status = exit_code;
            }
            (None, Some(term)) => {
                info.code = if status.0 & 0x80 != 0 {
                    code::CLD_DUMPED
                } else {
                    code::CLD_KILLED
                };
                info.status = term.0;
            }
            (None, None) => return None,
        }
        Some(info)
    }

    pub(crate) fn snapshot_signals(&self) -> SignalStateSnapshot {
        self.signals.lock().snapshot()
    }
}

impl fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("uid", &self.uid)
            .field("pidns", &self.pidns.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity::UserNamespace;
    use std::time::Duration;

    fn group() -> Arc<ThreadGroup> {
        let pidns = PidNamespace::new_root(0, UserNamespace::new_root());
        ThreadGroup::new(7, pidns, Arc::new(LimitSet::new()), Some(Signal::SIGCHLD))
    }

    #[test]
    fn test_cpu_timer_settings() {
        let tg = group();
        let setting = TimerSetting::new(Duration::from_millis(30), Duration::from_millis(10));
        let old = tg.set_itimer(ItimerKind::Prof, setting);
        assert!(!old.is_armed());
        assert_eq!(tg.get_itimer(ItimerKind::Prof), setting);
        assert!(tg.cpu_timers_enabled.load(Ordering::SeqCst));

        tg.set_itimer(ItimerKind::Prof, TimerSetting::disarmed());
        assert!(!tg.cpu_timers_enabled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_real_timer_setting() {
        let tg = group();
        let setting = TimerSetting::new(Duration::from_secs(100), Duration::ZERO);
        tg.set_itimer(ItimerKind::Real, setting);
        let current = tg.get_itimer(ItimerKind::Real);
        assert!(current.is_armed());
        assert!(current.value <= Duration::from_secs(100));
        tg.itimer_real.destroy();
    }

    #[test]
    fn test_exit_notification_codes() {
        let tg = group();
        let info = tg.exit_notification(4, WaitStatus::exited(3)).unwrap();
        assert_eq!(info.signal(), Signal::SIGCHLD);
        assert_eq!((info.code, info.status, info.pid), (code::CLD_EXITED, 3, 4));

        let info = tg
            .exit_notification(4, WaitStatus::signaled(Signal::SIGKILL))
            .unwrap();
        assert_eq!((info.code, info.status), (code::CLD_KILLED, 9));

        let info = tg
            .exit_notification(4, WaitStatus::core_dumped(Signal::SIGSEGV))
            .unwrap();
        assert_eq!(info.code, code::CLD_DUMPED);
    }

    #[test]
    fn test_wait_exited_times_out() {
        let tg = group();
        let deadline = Deadline::after(Duration::from_millis(5));
        assert_eq!(tg.wait_exited_until(deadline), None);
    }
}
