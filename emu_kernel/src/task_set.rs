//! The task set
//!
//! Registry of every live task and thread group, the IDs each one has in
//! the PID namespaces it is visible from, and the sessions and process
//! groups they belong to. Also counts live tasks for
//! [`TaskSet::wait_exited`] and carries the external stop used by the
//! pause protocol.

use crate::cgroup::CgroupNode;
use crate::cpu::CpuSet;
use crate::fd_table::FdTable;
use crate::fs_context::FsContext;
use crate::ids::UniqueIds;
use crate::kernel::running::RunningTasks;
use crate::lock_order::{Level, Ordered};
use crate::namespaces::{IpcNamespace, NetworkNamespace, UtsNamespace};
use crate::pid_namespace::{PidNamespace, PidNsState};
use crate::session::{ProcessGroup, Session};
use crate::signals::TaskSignals;
use crate::sync::WaitGroup;
use crate::task::{CpuStats, ExitState, RunState, Task, TaskInner, TaskParts};
use crate::thread_group::ThreadGroup;
use crate::user_counters::UserCounters;
use core_types::{Errno, HierarchyId, SignalSet, TaskKey, ThreadId, WaitStatus};
use identity::Credentials;
use kernel_api::{KernelError, MountNamespace, Platform, TaskImage};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct LiveTasks {
    live: u64,
    /// Set once every task has exited after [`TaskSet::wait_exited`]
    no_new_tasks: bool,
}

/// State guarded by the task set lock
#[derive(Default)]
pub(crate) struct TaskSetState {
    pub(crate) tasks: BTreeMap<TaskKey, Arc<Task>>,
    pub(crate) thread_groups: BTreeMap<u64, Arc<ThreadGroup>>,
    /// IDs allocated in each PID namespace, by namespace ID
    pub(crate) namespaces: BTreeMap<u64, PidNsState>,
    pub(crate) pid_namespaces: BTreeMap<u64, Arc<PidNamespace>>,
    pub(crate) sessions: BTreeMap<u64, Arc<Session>>,
    pub(crate) process_groups: BTreeMap<u64, Arc<ProcessGroup>>,
    /// Nesting depth of external stops; new tasks start with this many
    pub(crate) external_stop_count: i32,
}

impl TaskSetState {
    pub(crate) fn id_of_task(&self, key: TaskKey, ns: &PidNamespace) -> Option<ThreadId> {
        self.namespaces.get(&ns.id())?.task_ids.get(&key).copied()
    }

    pub(crate) fn id_of_thread_group(&self, tg: &ThreadGroup, ns: &PidNamespace) -> Option<ThreadId> {
        self.namespaces.get(&ns.id())?.tgids.get(&tg.uid()).copied()
    }

    pub(crate) fn task_by_id(&self, ns: &PidNamespace, tid: ThreadId) -> Option<Arc<Task>> {
        let key = self.namespaces.get(&ns.id())?.tids.get(&tid)?;
        self.tasks.get(key).cloned()
    }

    pub(crate) fn thread_group_by_id(&self, ns: &PidNamespace, id: ThreadId) -> Option<Arc<ThreadGroup>> {
        let uid = self.namespaces.get(&ns.id())?.tg_by_id.get(&id)?;
        self.thread_groups.get(uid).cloned()
    }

    pub(crate) fn process_group_by_id(&self, ns: &PidNamespace, id: ThreadId) -> Option<Arc<ProcessGroup>> {
        let uid = self.namespaces.get(&ns.id())?.pg_by_id.get(&id)?;
        self.process_groups.get(uid).cloned()
    }

    /// Live thread groups in the process group with kernel ID `pg`
    pub(crate) fn members_of_process_group(&self, pg: u64) -> Vec<Arc<ThreadGroup>> {
        self.thread_groups
            .values()
            .filter(|tg| tg.process_group().is_some_and(|p| p.id() == pg))
            .cloned()
            .collect()
    }

    /// Drops the process group and session of an exiting thread group
    /// once no live thread group refers to them
    pub(crate) fn release_group_membership(&mut self, tg: &ThreadGroup) {
        let Some(pg) = tg.process_group() else {
            return;
        };
        self.prune_process_group(&pg);
    }

    fn prune_process_group(&mut self, pg: &Arc<ProcessGroup>) {
        if !self.members_of_process_group(pg.id()).is_empty() {
            return;
        }
        self.process_groups.remove(&pg.id());
        for ns in self.namespaces.values_mut() {
            ns.remove_process_group(pg.id());
        }
        let session = pg.session().id();
        let session_in_use = self
            .process_groups
            .values()
            .any(|p| p.session().id() == session);
        if !session_in_use {
            self.sessions.remove(&session);
            for ns in self.namespaces.values_mut() {
                ns.remove_session(session);
            }
        }
    }

    /// Forgets a non-root namespace nothing is visible in
    pub(crate) fn prune_namespace(&mut self, ns: &PidNamespace) {
        if ns.parent().is_none() {
            return;
        }
        let empty = self
            .namespaces
            .get(&ns.id())
            .is_some_and(|s| s.tids.is_empty() && s.tgids.is_empty());
        let has_children = self
            .pid_namespaces
            .values()
            .any(|other| other.parent().is_some_and(|p| p.id() == ns.id()));
        if empty && !has_children {
            self.namespaces.remove(&ns.id());
            self.pid_namespaces.remove(&ns.id());
        }
    }
}

/// Everything [`TaskSet::new_task`] needs to build a task
///
/// The configuration carries one reference on each of the UTS, IPC and
/// network namespaces; they are released if creation fails.
pub(crate) struct TaskConfig {
    pub(crate) thread_group: Arc<ThreadGroup>,
    /// Parent of a new thread group; ignored when adding a thread
    pub(crate) parent: Option<Arc<ThreadGroup>>,
    pub(crate) name: String,
    pub(crate) image: Option<TaskImage>,
    pub(crate) fd_table: Option<Arc<FdTable>>,
    pub(crate) fs_context: Option<Arc<FsContext>>,
    pub(crate) credentials: Arc<Credentials>,
    pub(crate) uts: Arc<UtsNamespace>,
    pub(crate) ipc: Arc<IpcNamespace>,
    pub(crate) net: Arc<NetworkNamespace>,
    pub(crate) mount_ns: Option<Arc<MountNamespace>>,
    pub(crate) cgroups: BTreeMap<HierarchyId, Arc<CgroupNode>>,
    pub(crate) container_id: String,
    pub(crate) user_counters: Arc<UserCounters>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) running: Arc<RunningTasks>,
    pub(crate) cpu_mask: CpuSet,
    pub(crate) signal_mask: SignalSet,
}

impl TaskConfig {
    fn release_namespaces(&self) {
        self.uts.dec_ref();
        self.ipc.dec_ref();
        self.net.dec_ref();
    }
}

pub struct TaskSet {
    root: Arc<PidNamespace>,
    state: RwLock<TaskSetState>,
    live: Mutex<LiveTasks>,
    /// Signalled when the live task count drops to zero
    zero_live_cond: Condvar,
    /// Task threads that are not stopped
    pub(crate) running_goroutines: WaitGroup,
    /// Asynchronous I/O in flight
    pub(crate) aio_goroutines: WaitGroup,
    ids: Arc<UniqueIds>,
    tid_limit: i32,
}

impl TaskSet {
    pub fn new(root: Arc<PidNamespace>, ids: Arc<UniqueIds>) -> Arc<Self> {
        let mut state = TaskSetState::default();
        state.namespaces.insert(root.id(), PidNsState::default());
        state.pid_namespaces.insert(root.id(), Arc::clone(&root));
        Self::from_state(root, ids, state, 0)
    }

    pub(crate) fn from_state(
        root: Arc<PidNamespace>,
        ids: Arc<UniqueIds>,
        state: TaskSetState,
        live: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            root,
            state: RwLock::new(state),
            live: Mutex::new(LiveTasks {
                live,
                no_new_tasks: false,
            }),
            zero_live_cond: Condvar::new(),
            running_goroutines: WaitGroup::new(),
            aio_goroutines: WaitGroup::new(),
            ids,
            tid_limit: ThreadId::LIMIT,
        })
    }

    pub(crate) fn read(&self) -> Ordered<RwLockReadGuard<'_, TaskSetState>> {
        Ordered::acquire(Level::TaskSet, || self.state.read())
    }

    pub(crate) fn write(&self) -> Ordered<RwLockWriteGuard<'_, TaskSetState>> {
        Ordered::acquire(Level::TaskSet, || self.state.write())
    }

    /// The root PID namespace
    pub fn root(&self) -> &Arc<PidNamespace> {
        &self.root
    }

    pub(crate) fn ids(&self) -> &Arc<UniqueIds> {
        &self.ids
    }

    /// Live tasks, in key order
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.read().tasks.values().cloned().collect()
    }

    /// Live thread groups, in creation order
    pub fn thread_groups(&self) -> Vec<Arc<ThreadGroup>> {
        self.read().thread_groups.values().cloned().collect()
    }

    pub fn task(&self, key: TaskKey) -> Option<Arc<Task>> {
        self.read().tasks.get(&key).cloned()
    }

    pub fn task_with_id(&self, ns: &PidNamespace, tid: ThreadId) -> Option<Arc<Task>> {
        self.read().task_by_id(ns, tid)
    }

    pub fn thread_group_with_id(&self, ns: &PidNamespace, tgid: ThreadId) -> Option<Arc<ThreadGroup>> {
        self.read().thread_group_by_id(ns, tgid)
    }

    pub fn process_group_with_id(&self, ns: &PidNamespace, pgid: ThreadId) -> Option<Arc<ProcessGroup>> {
        self.read().process_group_by_id(ns, pgid)
    }

    /// ID of `task` in `ns`, if it is visible there
    pub fn id_of_task(&self, task: &Task, ns: &PidNamespace) -> Option<ThreadId> {
        self.read().id_of_task(task.key(), ns)
    }

    /// ID of `tg` in `ns`, if it is visible there
    pub fn id_of_thread_group(&self, tg: &ThreadGroup, ns: &PidNamespace) -> Option<ThreadId> {
        self.read().id_of_thread_group(tg, ns)
    }

    pub fn id_of_process_group(&self, pg: &ProcessGroup, ns: &PidNamespace) -> Option<ThreadId> {
        self.read()
            .namespaces
            .get(&ns.id())?
            .pgids
            .get(&pg.id())
            .copied()
    }

    pub fn id_of_session(&self, session: &Session, ns: &PidNamespace) -> Option<ThreadId> {
        self.read()
            .namespaces
            .get(&ns.id())?
            .sids
            .get(&session.id())
            .copied()
    }

    /// Live thread groups in `pg`
    pub fn process_group_members(&self, pg: &ProcessGroup) -> Vec<Arc<ThreadGroup>> {
        self.read().members_of_process_group(pg.id())
    }

    /// Number of tasks that have been created and have not yet exited
    pub fn live_count(&self) -> u64 {
        self.live.lock().live
    }

    /// Blocks until every task has exited
    ///
    /// Once the count has reached zero after this call, no task can be
    /// created.
    pub fn wait_exited(&self) {
        let mut live = self.live.lock();
        live.no_new_tasks = true;
        while live.live != 0 {
            self.zero_live_cond.wait(&mut live);
        }
    }

    pub(crate) fn dec_live(&self) {
        let mut live = self.live.lock();
        if live.live == 0 {
            panic!("live task count went negative");
        }
        live.live -= 1;
        if live.live == 0 {
            self.zero_live_cond.notify_all();
        }
    }

    /// Registers a PID namespace created by clone
    pub(crate) fn register_pid_namespace(&self, ns: &Arc<PidNamespace>) {
        let mut state = self.write();
        state.namespaces.entry(ns.id()).or_default();
        state
            .pid_namespaces
            .entry(ns.id())
            .or_insert_with(|| Arc::clone(ns));
    }

    /// Creates a task from `cfg` and registers it
    ///
    /// The task is not started. The first task of a thread group also
    /// registers the group: a group without a parent gets a new session
    /// and process group, a child joins its parent's process group and
    /// inherits its controlling terminal.
    pub(crate) fn new_task(&self, cfg: TaskConfig) -> Result<Arc<Task>, KernelError> {
        if let Err(errno) = cfg
            .user_counters
            .inc_rlimit_nproc(&cfg.credentials, cfg.thread_group.limits())
        {
            cfg.release_namespaces();
            return Err(errno.into());
        }
        let counters = Arc::clone(&cfg.user_counters);
        let namespaces = (Arc::clone(&cfg.uts), Arc::clone(&cfg.ipc), Arc::clone(&cfg.net));
        match self.register(cfg) {
            Ok(task) => Ok(task),
            Err(err) => {
                counters.dec_rlimit_nproc();
                namespaces.0.dec_ref();
                namespaces.1.dec_ref();
                namespaces.2.dec_ref();
                Err(err)
            }
        }
    }

    fn register(&self, cfg: TaskConfig) -> Result<Arc<Task>, KernelError> {
        let tg = Arc::clone(&cfg.thread_group);
        let key = TaskKey(self.ids.next());
        let mut guard = self.write();
        let state = &mut *guard;
        {
            let live = self.live.lock();
            if live.no_new_tasks && live.live == 0 {
                return Err(KernelError::Exiting);
            }
        }
        {
            let sig = tg.signals.lock();
            if sig.exiting || tg.has_exited() {
                return Err(Errno::EINTR.into());
            }
        }

        let ancestry = tg.pid_namespace().ancestry();
        let mut allocated: Vec<(u64, ThreadId)> = Vec::with_capacity(ancestry.len());
        for ns in &ancestry {
            state
                .pid_namespaces
                .entry(ns.id())
                .or_insert_with(|| Arc::clone(ns));
            let ns_state = state.namespaces.entry(ns.id()).or_default();
            match ns_state.allocate(self.tid_limit) {
                Ok(tid) => {
                    ns_state.insert_task(tid, key);
                    allocated.push((ns.id(), tid));
                }
                Err(errno) => {
                    for (id, _) in &allocated {
                        if let Some(ns_state) = state.namespaces.get_mut(id) {
                            ns_state.remove_task(key);
                        }
                    }
                    return Err(errno.into());
                }
            }
        }
        let root_tid = allocated
            .last()
            .map(|(_, tid)| *tid)
            .ok_or_else(|| KernelError::ProcessCreation("thread group has no PID namespace".into()))?;

        let cgroups = cfg.cgroups.clone();
        let task = Task::from_parts(TaskParts {
            key,
            root_tid,
            tg: Arc::clone(&tg),
            platform: cfg.platform,
            running: cfg.running,
            container_id: cfg.container_id,
            stats: CpuStats::default(),
            inner: TaskInner {
                name: cfg.name,
                image: cfg.image,
                fd_table: cfg.fd_table,
                fs_context: cfg.fs_context,
                creds: cfg.credentials,
                uts: cfg.uts,
                ipc: cfg.ipc,
                net: cfg.net,
                mount_ns: cfg.mount_ns,
                cgroups: cfg.cgroups,
                cpu_mask: cfg.cpu_mask,
                run_state: RunState::App,
                exit_state: ExitState::Running,
                exit_status: WaitStatus::default(),
                user_counters: cfg.user_counters,
            },
        });

        if !state.thread_groups.contains_key(&tg.uid()) {
            state.thread_groups.insert(tg.uid(), Arc::clone(&tg));
            for (ns_id, tid) in &allocated {
                if let Some(ns_state) = state.namespaces.get_mut(ns_id) {
                    ns_state.insert_thread_group(tg.uid(), *tid);
                }
            }
            match &cfg.parent {
                None => {
                    let session = Session::new(self.ids.next(), &tg);
                    let pg = ProcessGroup::new(self.ids.next(), &tg, Arc::clone(&session));
                    for (ns_id, tid) in &allocated {
                        if let Some(ns_state) = state.namespaces.get_mut(ns_id) {
                            ns_state.insert_session(session.id(), *tid);
                            ns_state.insert_process_group(pg.id(), *tid);
                        }
                    }
                    state.sessions.insert(session.id(), session);
                    state.process_groups.insert(pg.id(), Arc::clone(&pg));
                    tg.links.lock().process_group = Some(pg);
                }
                Some(parent) => {
                    let pg = parent.process_group();
                    let tty = parent.controlling_tty();
                    parent.links.lock().children.push(Arc::downgrade(&tg));
                    {
                        let mut links = tg.links.lock();
                        links.parent = Arc::downgrade(parent);
                        links.process_group = pg;
                    }
                    tg.signals.lock().tty = tty;
                }
            }
            tg.links.lock().leader = Arc::downgrade(&task);
        }
        tg.links.lock().tasks.push(Arc::clone(&task));
        state.tasks.insert(key, Arc::clone(&task));
        {
            let mut sig = tg.signals.lock();
            sig.tasks.insert(
                key,
                TaskSignals::new(&task, cfg.signal_mask, state.external_stop_count),
            );
        }
        self.live.lock().live += 1;
        drop(guard);

        for cgroup in cgroups.values() {
            cgroup.enter(key);
        }
        debug!(task = %key, tid = %root_tid, tg = tg.uid(), "task created");
        Ok(task)
    }

    /// Stops every task, present and future, until the matching
    /// [`TaskSet::end_external_stop`]
    pub(crate) fn begin_external_stop(&self) {
        let mut state = self.write();
        state.external_stop_count += 1;
        for tg in state.thread_groups.values() {
            let mut sig = tg.signals.lock();
            for ts in sig.tasks.values_mut() {
                ts.stop_count += 1;
                ts.interrupt();
            }
        }
    }

    /// # Panics
    ///
    /// Panics if there is no external stop to end.
    pub(crate) fn end_external_stop(&self) {
        let mut state = self.write();
        state.external_stop_count -= 1;
        if state.external_stop_count < 0 {
            panic!("external stop count went negative");
        }
        for tg in state.thread_groups.values() {
            let mut sig = tg.signals.lock();
            let mut released = false;
            for ts in sig.tasks.values_mut() {
                ts.stop_count -= 1;
                released |= ts.stop_count == 0;
            }
            if released {
                tg.signals.end_stop_cond.notify_all();
            }
        }
    }

    /// Makes `tg` leader of a new session and process group, as setsid(2)
    ///
    /// Fails with EPERM if `tg` already leads a process group.
    pub fn create_session(&self, tg: &Arc<ThreadGroup>) -> Result<ThreadId, Errno> {
        let mut guard = self.write();
        let state = &mut *guard;
        let leads_group = state
            .process_groups
            .values()
            .any(|pg| pg.originator_uid() == tg.uid());
        if leads_group {
            return Err(Errno::EPERM);
        }
        let own_id = state
            .id_of_thread_group(tg, tg.pid_namespace())
            .ok_or(Errno::ESRCH)?;
        let old = tg.process_group();

        let session = Session::new(self.ids.next(), tg);
        let pg = ProcessGroup::new(self.ids.next(), tg, Arc::clone(&session));
        for ns in tg.pid_namespace().ancestry() {
            let Some(id) = state.id_of_thread_group(tg, &ns) else {
                continue;
            };
            if let Some(ns_state) = state.namespaces.get_mut(&ns.id()) {
                ns_state.insert_session(session.id(), id);
                ns_state.insert_process_group(pg.id(), id);
            }
        }
        state.sessions.insert(session.id(), session);
        state.process_groups.insert(pg.id(), Arc::clone(&pg));
        tg.links.lock().process_group = Some(pg);
        tg.signals.lock().tty = None;
        if let Some(old) = old {
            state.prune_process_group(&old);
        }
        Ok(own_id)
    }

    /// Moves `tg` into the process group `pgid` of its own session, as
    /// setpgid(2)
    ///
    /// `pgid` is interpreted in `tg`'s PID namespace. If it equals the
    /// group's own ID a new process group is created. Session leaders may
    /// not move, and the target must be in the same session.
    pub fn set_process_group(&self, tg: &Arc<ThreadGroup>, pgid: ThreadId) -> Result<(), Errno> {
        let mut guard = self.write();
        let state = &mut *guard;
        let ns = Arc::clone(tg.pid_namespace());
        let own_id = state.id_of_thread_group(tg, &ns).ok_or(Errno::ESRCH)?;
        let current = tg.process_group().ok_or(Errno::ESRCH)?;
        let session = Arc::clone(current.session());
        if session.is_leader(tg) {
            return Err(Errno::EPERM);
        }
        if state
            .namespaces
            .get(&ns.id())
            .and_then(|s| s.pgids.get(&current.id()))
            == Some(&pgid)
        {
            return Ok(());
        }

        let target = match state.process_group_by_id(&ns, pgid) {
            Some(pg) => {
                if pg.session().id() != session.id() {
                    return Err(Errno::EPERM);
                }
                pg
            }
            None if pgid == own_id => {
                let pg = ProcessGroup::new(self.ids.next(), tg, Arc::clone(&session));
                for ancestor in ns.ancestry() {
                    let Some(id) = state.id_of_thread_group(tg, &ancestor) else {
                        continue;
                    };
                    if let Some(ns_state) = state.namespaces.get_mut(&ancestor.id()) {
                        ns_state.insert_process_group(pg.id(), id);
                    }
                }
                state.process_groups.insert(pg.id(), Arc::clone(&pg));
                pg
            }
            None => return Err(Errno::EPERM),
        };
        tg.links.lock().process_group = Some(target);
        state.prune_process_group(&current);
        Ok(())
    }
}

impl fmt::Debug for TaskSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSet")
            .field("root", &self.root.id())
            .field("live", &self.live_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity::UserNamespace;
    use std::thread;
    use std::time::Duration;

    fn task_set() -> Arc<TaskSet> {
        TaskSet::new(
            PidNamespace::new_root(1, UserNamespace::new_root()),
            Arc::new(UniqueIds::new()),
        )
    }

    #[test]
    fn test_wait_exited_with_no_tasks_returns() {
        let ts = task_set();
        ts.wait_exited();
        assert_eq!(ts.live_count(), 0);
    }

    #[test]
    fn test_wait_exited_waits_for_last_task() {
        let ts = task_set();
        ts.live.lock().live = 2;
        let waiter = {
            let ts = Arc::clone(&ts);
            thread::spawn(move || ts.wait_exited())
        };
        thread::sleep(Duration::from_millis(10));
        ts.dec_live();
        assert!(!waiter.is_finished());
        ts.dec_live();
        waiter.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "live task count went negative")]
    fn test_dec_live_below_zero_panics() {
        task_set().dec_live();
    }

    #[test]
    #[should_panic(expected = "external stop count went negative")]
    fn test_unbalanced_external_stop_panics() {
        task_set().end_external_stop();
    }

    #[test]
    fn test_external_stops_nest() {
        let ts = task_set();
        ts.begin_external_stop();
        ts.begin_external_stop();
        assert_eq!(ts.read().external_stop_count, 2);
        ts.end_external_stop();
        ts.end_external_stop();
        assert_eq!(ts.read().external_stop_count, 0);
    }

    #[test]
    fn test_child_namespace_registration_and_pruning() {
        let ts = task_set();
        let child = ts.root().new_child(2, UserNamespace::new_root());
        ts.register_pid_namespace(&child);
        assert!(ts.read().namespaces.contains_key(&2));
        ts.write().prune_namespace(&child);
        assert!(!ts.read().namespaces.contains_key(&2));
        ts.write().prune_namespace(ts.root());
        assert!(ts.read().namespaces.contains_key(&1));
    }
}
