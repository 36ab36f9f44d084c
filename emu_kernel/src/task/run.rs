//! The task execution loop and task exit

use super::{ExitState, GoroutineState, RunState, Task};
use crate::signals::SignalDisposition;
use crate::task_set::TaskSet;
use crate::thread_group::ThreadGroup;
use core_types::{code, sa_flags, SigAction, SigHandler, Signal, SignalInfo, ThreadId, WaitStatus};
use kernel_api::{AppContext, AppEvent, KernelError, TaskImage};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// What the loop does after looking at pending signals
enum SignalFlow {
    Proceed,
    Restart,
    Exit(WaitStatus),
}

impl Task {
    /// Starts the task's thread; a no-op for a task that already started
    pub fn start(self: &Arc<Self>, task_set: &Arc<TaskSet>) -> Result<(), KernelError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        task_set.running_goroutines.add(1);
        let task = Arc::clone(self);
        let ts = Arc::clone(task_set);
        let spawned = thread::Builder::new()
            .name(format!("task-{}", self.key.0))
            .spawn(move || task.run(&ts));
        if let Err(err) = spawned {
            task_set.running_goroutines.done();
            self.started.store(false, Ordering::SeqCst);
            return Err(KernelError::Platform(format!(
                "failed to start thread for {}: {}",
                self.key, err
            )));
        }
        Ok(())
    }

    fn run(self: &Arc<Self>, task_set: &Arc<TaskSet>) {
        self.set_goroutine_state(GoroutineState::RunningSys);
        let status = self.run_loop(task_set);
        self.exit(task_set, status);
        self.set_goroutine_state(GoroutineState::Nonexistent);
        task_set.running_goroutines.done();
        task_set.dec_live();
    }

    /// Releases a task that was created but never started
    pub fn discard(self: &Arc<Self>, task_set: &TaskSet) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.exit(task_set, WaitStatus::signaled(Signal::SIGKILL));
        task_set.dec_live();
    }

    fn run_loop(self: &Arc<Self>, task_set: &TaskSet) -> WaitStatus {
        loop {
            self.take_interrupt();
            self.do_stop(task_set);
            if let Some(status) = self.check_killed() {
                return status;
            }
            match self.handle_signals(task_set) {
                SignalFlow::Proceed => {}
                SignalFlow::Restart => continue,
                SignalFlow::Exit(status) => return status,
            }
            if let Some(image) = self.take_exec_image() {
                self.finish_exec(task_set, image);
                continue;
            }

            let (mut arch, mm) = {
                let inner = self.lock();
                match &inner.image {
                    Some(image) => (image.arch.clone(), Arc::clone(&image.memory_manager)),
                    None => {
                        drop(inner);
                        self.block(None);
                        continue;
                    }
                }
            };
            self.set_goroutine_state(GoroutineState::RunningApp);
            let event = self.platform.switch_to_app(AppContext {
                task: self.key,
                tid: self.root_tid,
                arch: &mut arch,
                memory_manager: &*mm,
            });
            self.set_goroutine_state(GoroutineState::RunningSys);
            if let Some(image) = self.lock().image.as_mut() {
                image.arch = arch;
            }

            match event {
                AppEvent::Continue | AppEvent::Interrupted => {}
                AppEvent::Block(timeout) => self.block(timeout),
                AppEvent::ExitThread(exit_code) => return WaitStatus::exited(exit_code),
                AppEvent::ExitGroup(exit_code) => self.tg.group_exit(WaitStatus::exited(exit_code)),
                AppEvent::Signal(info) => {
                    if let Err(err) = self.send_signal(info) {
                        debug!(task = %self.key, signo = info.signo, %err, "synchronous signal dropped");
                    }
                }
            }
        }
    }

    /// Waits out group stops and external stops
    fn do_stop(&self, task_set: &TaskSet) {
        let mut state = self.tg.signals.lock();
        let mut stopped = false;
        loop {
            let hold = match state.tasks.get(&self.key) {
                Some(ts) => {
                    ts.stop_count > 0 || (state.group_stopped && !ts.killed && !state.exiting)
                }
                None => false,
            };
            if !hold {
                break;
            }
            if !stopped {
                stopped = true;
                self.set_goroutine_state(GoroutineState::Stopped);
                task_set.running_goroutines.done();
            }
            self.tg.signals.end_stop_cond.wait(state.guard_mut());
        }
        if stopped {
            // Counted again before the stop state can change under us.
            task_set.running_goroutines.add(1);
        }
        drop(state);
        if stopped {
            self.set_goroutine_state(GoroutineState::RunningSys);
        }
    }

    /// Counts the task as running again after it left the running set
    ///
    /// An external stop that began in the meantime is waited out first, so
    /// a paused kernel never sees the count rise.
    fn rejoin_running(&self, task_set: &TaskSet) {
        let mut state = self.tg.signals.lock();
        while state
            .tasks
            .get(&self.key)
            .is_some_and(|ts| ts.stop_count > 0)
        {
            self.tg.signals.end_stop_cond.wait(state.guard_mut());
        }
        task_set.running_goroutines.add(1);
        drop(state);
        self.set_goroutine_state(GoroutineState::RunningSys);
    }

    fn check_killed(&self) -> Option<WaitStatus> {
        let state = self.tg.signals.lock();
        match state.tasks.get(&self.key) {
            None => Some(state.exit_status),
            Some(_) if state.exiting => Some(state.exit_status),
            Some(ts) if ts.killed => Some(WaitStatus::signaled(Signal::SIGKILL)),
            Some(_) => None,
        }
    }

    fn handle_signals(&self, task_set: &TaskSet) -> SignalFlow {
        let disposition = {
            let mut state = self.tg.signals.lock();
            self.tg.signals.dequeue_locked(&mut state, self.key)
        };
        match disposition {
            None => SignalFlow::Proceed,
            Some(SignalDisposition::Exit(status)) => SignalFlow::Exit(status),
            Some(SignalDisposition::Stop(info)) => {
                self.notify_parent_stopped(task_set, info.signal());
                SignalFlow::Restart
            }
            Some(SignalDisposition::Handler(info, action)) => {
                let delivered = {
                    let mut inner = self.lock();
                    match inner.image.as_mut() {
                        Some(image) => {
                            self.platform
                                .deliver_signal(self.key, &mut image.arch, &info, &action)
                        }
                        None => Ok(()),
                    }
                };
                if let Err(err) = delivered {
                    warn!(task = %self.key, signo = info.signo, %err, "failed to set up signal frame");
                    self.tg
                        .group_exit(WaitStatus::core_dumped(Signal::SIGSEGV));
                }
                SignalFlow::Restart
            }
        }
    }

    fn notify_parent_stopped(&self, task_set: &TaskSet, sig: Signal) {
        let Some(parent) = self.tg.parent() else {
            return;
        };
        let pid = task_set
            .read()
            .id_of_thread_group(&self.tg, parent.pid_namespace())
            .unwrap_or(ThreadId(0));
        let mut info = SignalInfo::kernel(Signal::SIGCHLD);
        info.code = code::CLD_STOPPED;
        info.pid = pid.0;
        info.status = sig.0;

        let mut state = parent.signals.lock();
        if state.action(Signal::SIGCHLD).flags & sa_flags::SA_NOCLDSTOP != 0 {
            return;
        }
        if let Err(err) = parent.signals.send_locked(&mut state, None, info) {
            debug!(tg = parent.uid(), %err, "CLD_STOPPED not delivered");
        }
    }

    fn block(&self, timeout: Option<Duration>) {
        self.set_goroutine_state(GoroutineState::Blocked);
        {
            let mut pending = self.interrupted.lock();
            if !*pending {
                match timeout {
                    Some(timeout) => {
                        self.interrupt_cond.wait_for(&mut pending, timeout);
                    }
                    None => self.interrupt_cond.wait(&mut pending),
                }
            }
        }
        self.set_goroutine_state(GoroutineState::RunningSys);
    }

    /// Holds the task at an exec boundary until `image` replaces its
    /// current image
    pub fn begin_exec(&self, image: TaskImage) {
        self.lock().run_state = RunState::ExecStop(Box::new(image));
        self.interrupt();
    }

    pub fn is_exec_stopped(&self) -> bool {
        matches!(self.lock().run_state, RunState::ExecStop(_))
    }

    fn take_exec_image(&self) -> Option<TaskImage> {
        let mut inner = self.lock();
        match std::mem::replace(&mut inner.run_state, RunState::App) {
            RunState::ExecStop(image) => Some(*image),
            RunState::App => None,
        }
    }

    fn finish_exec(self: &Arc<Self>, task_set: &TaskSet, image: TaskImage) {
        {
            let mut state = self.tg.signals.lock();
            for (key, ts) in state.tasks.iter_mut() {
                if *key != self.key {
                    ts.killed = true;
                    ts.interrupt();
                }
            }
            self.tg.signals.end_stop_cond.notify_all();
        }

        if self.tg.task_count() > 1 {
            self.set_goroutine_state(GoroutineState::Blocked);
            task_set.running_goroutines.done();
            {
                let mut links = self.tg.links.lock();
                while links.tasks.len() > 1 {
                    self.tg.exit_cond.wait(&mut links);
                }
            }
            self.rejoin_running(task_set);
            // Pass through the stop and signal checks before installing.
            self.lock().run_state = RunState::ExecStop(Box::new(image));
            return;
        }

        let creds = self.lock().creds.for_new_task(image.file_caps.as_ref());
        let creds = match creds {
            Ok(creds) => creds,
            Err(err) => {
                warn!(task = %self.key, %err, "exec failed to compute credentials");
                self.tg.group_exit(WaitStatus::signaled(Signal::SIGKILL));
                return;
            }
        };
        {
            let mut state = self.tg.signals.lock();
            for action in state.actions.iter_mut() {
                if matches!(action.handler, SigHandler::User(_)) {
                    *action = SigAction::default();
                }
            }
        }
        {
            let mut inner = self.lock();
            inner.creds = Arc::new(creds);
            inner.name = image.name.clone();
            if let Some(fds) = &inner.fd_table {
                fds.remove_close_on_exec();
            }
            inner.image = Some(image);
        }
        self.tg.links.lock().leader = Arc::downgrade(self);
        debug!(task = %self.key, "exec complete");
    }

    /// Removes the task from the kernel
    ///
    /// The last task of a thread group also retires the group: its IDs are
    /// released, its children are handed to the namespace's init, and its
    /// parent is notified. When a namespace's init exits every other thread
    /// group in the namespace is killed.
    pub(crate) fn exit(self: &Arc<Self>, task_set: &TaskSet, status: WaitStatus) {
        {
            let mut inner = self.lock();
            if inner.exit_state != ExitState::Running {
                return;
            }
            inner.exit_state = ExitState::Exiting;
            inner.exit_status = status;
        }

        let mut kill: Vec<Arc<ThreadGroup>> = Vec::new();
        let mut notify: Option<(Arc<ThreadGroup>, SignalInfo)> = None;
        let last;
        {
            let mut guard = task_set.write();
            let state = &mut *guard;
            let group_status;
            {
                let mut sig = self.tg.signals.lock();
                sig.tasks.remove(&self.key);
                last = sig.tasks.is_empty();
                group_status = if sig.exiting { sig.exit_status } else { status };
            }
            let ancestry = self.tg.pid_namespace().ancestry();
            for ns in &ancestry {
                if let Some(ns_state) = state.namespaces.get_mut(&ns.id()) {
                    ns_state.remove_task(self.key);
                }
            }
            state.tasks.remove(&self.key);

            let (parent, children) = {
                let mut links = self.tg.links.lock();
                links.tasks.retain(|t| t.key != self.key);
                if last {
                    links.exited = true;
                    links.exit_status = group_status;
                }
                let parent = links.parent.upgrade();
                let children = if last {
                    std::mem::take(&mut links.children)
                } else {
                    Vec::new()
                };
                (parent, children)
            };
            self.tg.exit_cond.notify_all();

            if last {
                let pidns = Arc::clone(self.tg.pid_namespace());
                let own_tgid = state.id_of_thread_group(&self.tg, &pidns);
                let was_init = own_tgid == Some(ThreadId::INIT);
                let parent_pid = parent
                    .as_ref()
                    .and_then(|p| state.id_of_thread_group(&self.tg, p.pid_namespace()));

                for ns in &ancestry {
                    if let Some(ns_state) = state.namespaces.get_mut(&ns.id()) {
                        ns_state.remove_thread_group(self.tg.uid());
                    }
                }
                state.thread_groups.remove(&self.tg.uid());
                if let Some(parent) = &parent {
                    parent
                        .links
                        .lock()
                        .children
                        .retain(|c| c.upgrade().is_some_and(|c| c.uid() != self.tg.uid()));
                }

                let reaper = if was_init {
                    None
                } else {
                    state.thread_group_by_id(&pidns, ThreadId::INIT)
                };
                for child in children.iter().filter_map(|c| c.upgrade()) {
                    let reaper_weak = reaper.as_ref().map(Arc::downgrade).unwrap_or_default();
                    child.links.lock().parent = reaper_weak;
                    if let Some(reaper) = &reaper {
                        reaper.links.lock().children.push(Arc::downgrade(&child));
                    }
                }

                state.release_group_membership(&self.tg);

                if let Some(parent) = parent {
                    if let Some(info) = self
                        .tg
                        .exit_notification(parent_pid.map_or(0, |p| p.0), group_status)
                    {
                        notify = Some((parent, info));
                    }
                }

                if was_init {
                    if let Some(ns_state) = state.namespaces.get_mut(&pidns.id()) {
                        ns_state.exiting = true;
                    }
                    kill = state
                        .thread_groups
                        .values()
                        .filter(|tg| pidns.is_ancestor_of(tg.pid_namespace()))
                        .cloned()
                        .collect();
                }
                state.prune_namespace(&pidns);
            }
        }

        for tg in kill {
            tg.group_exit(WaitStatus::signaled(Signal::SIGKILL));
        }
        if let Some((parent, info)) = notify {
            if let Err(err) = parent.send_signal(info) {
                debug!(tg = parent.uid(), %err, "exit notification not delivered");
            }
        }

        let stats = self.cpu_stats();
        let released = {
            let mut inner = self.lock();
            inner.exit_state = ExitState::Dead;
            (
                Arc::clone(&inner.user_counters),
                Arc::clone(&inner.uts),
                Arc::clone(&inner.ipc),
                Arc::clone(&inner.net),
                std::mem::take(&mut inner.cgroups),
                inner.fd_table.take(),
                inner.fs_context.take(),
                inner.image.take(),
            )
        };
        let (user_counters, uts, ipc, net, cgroups, fd_table, fs_context, image) = released;
        user_counters.dec_rlimit_nproc();
        uts.dec_ref();
        ipc.dec_ref();
        net.dec_ref();
        for cgroup in cgroups.values() {
            cgroup.leave(self.key);
        }
        drop((fd_table, fs_context, image));

        {
            let mut exited = self.tg.exited_stats.lock();
            *exited = exited.add(stats);
        }
        if last {
            self.tg.itimer_real.destroy();
        }
        debug!(task = %self.key, %status, last, "task exited");
    }
}
