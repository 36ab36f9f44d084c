//! Tasks
//!
//! A task is one application thread. Each started task runs on its own
//! host thread, which loops between application code (through the
//! [`Platform`]) and the kernel: taking stops, delivering signals,
//! finishing exec and finally exiting.

mod clone;
mod run;
mod sched;

pub use clone::CloneOptions;
pub use sched::{CpuStats, GoroutineState};

use crate::cgroup::CgroupNode;
use crate::cpu::CpuSet;
use crate::fd_table::FdTable;
use crate::fs_context::FsContext;
use crate::kernel::running::RunningTasks;
use crate::lock_order::{Level, Ordered};
use crate::namespaces::{IpcNamespace, NetworkNamespace, UtsNamespace};
use crate::thread_group::ThreadGroup;
use crate::user_counters::UserCounters;
use core_types::{Errno, HierarchyId, SignalInfo, SignalSet, TaskKey, ThreadId, WaitStatus};
use identity::{Credentials, CredentialsSnapshot};
use kernel_api::{ArchState, MountNamespace, Platform, TaskImage};
use parking_lot::{Condvar, Mutex, MutexGuard};
use sched::SchedInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where a task is in its lifecycle, as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created but not started
    Created,
    Running,
    Blocked,
    Stopped,
    Exited,
}

#[derive(Debug)]
pub(crate) enum RunState {
    /// Normal execution
    App,
    /// Held at an exec boundary until the new image can be installed
    ExecStop(Box<TaskImage>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitState {
    Running,
    Exiting,
    Dead,
}

/// State guarded by the task lock
pub(crate) struct TaskInner {
    pub(crate) name: String,
    pub(crate) image: Option<TaskImage>,
    pub(crate) fd_table: Option<Arc<FdTable>>,
    pub(crate) fs_context: Option<Arc<FsContext>>,
    pub(crate) creds: Arc<Credentials>,
    pub(crate) uts: Arc<UtsNamespace>,
    pub(crate) ipc: Arc<IpcNamespace>,
    pub(crate) net: Arc<NetworkNamespace>,
    pub(crate) mount_ns: Option<Arc<MountNamespace>>,
    pub(crate) cgroups: BTreeMap<HierarchyId, Arc<CgroupNode>>,
    pub(crate) cpu_mask: CpuSet,
    pub(crate) run_state: RunState,
    pub(crate) exit_state: ExitState,
    pub(crate) exit_status: WaitStatus,
    pub(crate) user_counters: Arc<UserCounters>,
}

pub struct Task {
    key: TaskKey,
    /// Thread ID in the root PID namespace
    root_tid: ThreadId,
    tg: Arc<ThreadGroup>,
    platform: Arc<dyn Platform>,
    running: Arc<RunningTasks>,
    container_id: String,
    started: AtomicBool,
    interrupted: Mutex<bool>,
    interrupt_cond: Condvar,
    sched: Mutex<SchedInfo>,
    inner: Mutex<TaskInner>,
}

/// Everything needed to build a task value
pub(crate) struct TaskParts {
    pub(crate) key: TaskKey,
    pub(crate) root_tid: ThreadId,
    pub(crate) tg: Arc<ThreadGroup>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) running: Arc<RunningTasks>,
    pub(crate) container_id: String,
    pub(crate) stats: CpuStats,
    pub(crate) inner: TaskInner,
}

impl Task {
    pub(crate) fn from_parts(parts: TaskParts) -> Arc<Self> {
        Arc::new(Self {
            key: parts.key,
            root_tid: parts.root_tid,
            tg: parts.tg,
            platform: parts.platform,
            running: parts.running,
            container_id: parts.container_id,
            started: AtomicBool::new(false),
            interrupted: Mutex::new(false),
            interrupt_cond: Condvar::new(),
            sched: Mutex::new(SchedInfo::new(parts.stats)),
            inner: Mutex::new(parts.inner),
        })
    }

    pub(crate) fn lock(&self) -> Ordered<MutexGuard<'_, TaskInner>> {
        Ordered::acquire(Level::Task, || self.inner.lock())
    }

    pub fn key(&self) -> TaskKey {
        self.key
    }

    /// Thread ID in the root PID namespace
    pub fn root_tid(&self) -> ThreadId {
        self.root_tid
    }

    pub fn thread_group(&self) -> &Arc<ThreadGroup> {
        &self.tg
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn credentials(&self) -> Arc<Credentials> {
        Arc::clone(&self.lock().creds)
    }

    pub fn fd_table(&self) -> Option<Arc<FdTable>> {
        self.lock().fd_table.clone()
    }

    pub fn fs_context(&self) -> Option<Arc<FsContext>> {
        self.lock().fs_context.clone()
    }

    pub fn uts_namespace(&self) -> Arc<UtsNamespace> {
        Arc::clone(&self.lock().uts)
    }

    pub fn ipc_namespace(&self) -> Arc<IpcNamespace> {
        Arc::clone(&self.lock().ipc)
    }

    pub fn network_namespace(&self) -> Arc<NetworkNamespace> {
        Arc::clone(&self.lock().net)
    }

    pub fn mount_namespace(&self) -> Option<Arc<MountNamespace>> {
        self.lock().mount_ns.clone()
    }

    pub fn cgroups(&self) -> BTreeMap<HierarchyId, Arc<CgroupNode>> {
        self.lock().cgroups.clone()
    }

    pub fn cpu_mask(&self) -> CpuSet {
        self.lock().cpu_mask.clone()
    }

    /// Register state of the current image
    pub fn arch_state(&self) -> Option<ArchState> {
        self.lock().image.as_ref().map(|image| image.arch.clone())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.lock().exit_state != ExitState::Running
    }

    /// Exit status of a task that has exited
    pub fn exit_status(&self) -> Option<WaitStatus> {
        let inner = self.lock();
        (inner.exit_state != ExitState::Running).then_some(inner.exit_status)
    }

    pub fn status(&self) -> TaskStatus {
        if self.has_exited() {
            return TaskStatus::Exited;
        }
        if !self.is_started() {
            return TaskStatus::Created;
        }
        match self.goroutine_state() {
            GoroutineState::Blocked => TaskStatus::Blocked,
            GoroutineState::Stopped => TaskStatus::Stopped,
            _ => TaskStatus::Running,
        }
    }

    /// Sends `info` to this task specifically
    pub fn send_signal(&self, info: SignalInfo) -> Result<(), Errno> {
        let mut state = self.tg.signals.lock();
        self.tg.signals.send_locked(&mut state, Some(self.key), info)
    }

    pub fn signal_mask(&self) -> SignalSet {
        self.tg
            .signals
            .lock()
            .tasks
            .get(&self.key)
            .map(|ts| ts.mask)
            .unwrap_or_default()
    }

    /// Replaces the signal mask, returning the old one; SIGKILL and SIGSTOP
    /// are never blocked
    pub fn set_signal_mask(&self, mask: SignalSet) -> SignalSet {
        let mut state = self.tg.signals.lock();
        match state.tasks.get_mut(&self.key) {
            Some(ts) => std::mem::replace(&mut ts.mask, mask.without_unblockable()),
            None => SignalSet::empty(),
        }
    }

    /// Signals pending for this task alone
    pub fn pending_signals(&self) -> SignalSet {
        self.tg
            .signals
            .lock()
            .tasks
            .get(&self.key)
            .map(|ts| ts.pending.pending_set())
            .unwrap_or_default()
    }

    /// Forces the task back into the kernel at its next opportunity
    pub fn interrupt(&self) {
        *self.interrupted.lock() = true;
        self.interrupt_cond.notify_all();
        self.platform.interrupt(self.key);
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        std::mem::replace(&mut *self.interrupted.lock(), false)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("key", &self.key)
            .field("tid", &self.root_tid)
            .field("tg", &self.tg.uid())
            .finish()
    }
}

/// Serialized form of a loaded image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskImageSnapshot {
    pub name: String,
    pub arch: ArchState,
    /// ID of the memory manager, resolved through the loader on restore
    pub memory_manager: u64,
    pub file_caps: Option<identity::FileCapabilities>,
}

impl TaskImageSnapshot {
    pub(crate) fn of(image: &TaskImage) -> Self {
        Self {
            name: image.name.clone(),
            arch: image.arch.clone(),
            memory_manager: image.memory_manager.id(),
            file_caps: image.file_caps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub key: TaskKey,
    pub root_tid: ThreadId,
    pub thread_group: u64,
    pub container_id: String,
    pub name: String,
    pub image: Option<TaskImageSnapshot>,
    /// Image waiting at an exec boundary
    pub exec_image: Option<TaskImageSnapshot>,
    pub fd_table: Option<u64>,
    pub fs_context: Option<u64>,
    pub credentials: CredentialsSnapshot,
    pub uts_namespace: u64,
    pub ipc_namespace: u64,
    pub network_namespace: u64,
    pub mount_namespace: Option<MountNamespace>,
    pub cgroups: Vec<(HierarchyId, core_types::CgroupId)>,
    pub cpu_mask: CpuSet,
    pub stats: CpuStats,
}

impl Task {
    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        let stats = self.cpu_stats();
        let inner = self.lock();
        TaskSnapshot {
            key: self.key,
            root_tid: self.root_tid,
            thread_group: self.tg.uid(),
            container_id: self.container_id.clone(),
            name: inner.name.clone(),
            image: inner.image.as_ref().map(TaskImageSnapshot::of),
            exec_image: match &inner.run_state {
                RunState::ExecStop(image) => Some(TaskImageSnapshot::of(image)),
                RunState::App => None,
            },
            fd_table: inner.fd_table.as_ref().map(|t| t.uid()),
            fs_context: inner.fs_context.as_ref().map(|c| c.uid()),
            credentials: inner.creds.snapshot(),
            uts_namespace: inner.uts.id(),
            ipc_namespace: inner.ipc.id(),
            network_namespace: inner.net.id(),
            mount_namespace: inner.mount_ns.as_deref().cloned(),
            cgroups: inner
                .cgroups
                .iter()
                .map(|(h, node)| (*h, node.id()))
                .collect(),
            cpu_mask: inner.cpu_mask.clone(),
            stats,
        }
    }

    /// Images of the task, including one waiting at an exec boundary
    pub(crate) fn images(&self) -> Vec<TaskImage> {
        let inner = self.lock();
        let mut images: Vec<TaskImage> = inner.image.iter().cloned().collect();
        if let RunState::ExecStop(image) = &inner.run_state {
            images.push((**image).clone());
        }
        images
    }
}
