//! The kernel state record
//!
//! The object graph of a kernel has cycles (tasks point at their thread
//! group, which lists its tasks) and shared values (an FD table used by
//! several tasks). [`KernelSnapshot`] flattens it: every shared value is
//! stored once and referred to by its kernel-unique ID, and the graph is
//! rebuilt in dependency order on restore.
//!
//! Capture runs with the kernel paused and the external lock held. It takes
//! the task set lock only for the part of the graph it guards; interval
//! timers and terminals are read after it is released, as their locks rank
//! above it.

use crate::cgroup::{CgroupMount, CgroupNode, CgroupRegistry, CgroupRegistrySnapshot};
use crate::checkpoint::exec::SaveRestoreExecConfig;
use crate::fd_table::{FdTable, FdTableSnapshot};
use crate::fs_context::{FsContext, FsContextSnapshot};
use crate::ids::{UniqueIds, UniqueIdsSnapshot};
use crate::kernel::running::RunningTasks;
use crate::kernel::{Kernel, KernelDeps, KernelInner, KernelParts, SocketRecord};
use crate::namespaces::{
    IpcNamespace, IpcNamespaceSnapshot, NetworkNamespace, NetworkNamespaceSnapshot, UtsNamespace,
    UtsNamespaceSnapshot,
};
use crate::pid_namespace::{PidNamespace, PidNamespaceSnapshot, PidNsState};
use crate::session::{ProcessGroup, Session};
use crate::signals::{SignalState, SignalStateSnapshot, TaskSignals};
use crate::task::{
    CpuStats, ExitState, RunState, Task, TaskImageSnapshot, TaskInner, TaskParts, TaskSnapshot,
};
use crate::task_set::{TaskSet, TaskSetState};
use crate::thread_group::{ThreadGroup, ThreadGroupParts};
use crate::timekeeper::{Timekeeper, TimekeeperSnapshot};
use crate::timer::IntervalTimerSnapshot;
use crate::tty::Tty;
use crate::user_counters::UserCounters;
use core_types::{FileId, Kuid, Signal, TaskKey, WaitStatus};
use identity::{Credentials, UserNamespace, UserNamespaceSnapshot};
use kernel_api::{
    CheckpointStage, Clocks, FeatureSet, FileDescription, KernelError, MemoryManager,
    MountNamespace, SpecialFilesystem, TaskImage, VirtualDentry, CLOCK_TICK,
};
use lifecycle::Timeout;
use resources::{Limit, LimitKind, LimitSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadGroupSnapshot {
    pub uid: u64,
    pub pid_namespace: u64,
    pub limits: Vec<(LimitKind, Limit)>,
    pub termination_signal: Option<Signal>,
    pub signals: SignalStateSnapshot,
    pub itimer_real: IntervalTimerSnapshot,
    pub exited_stats: CpuStats,
    pub parent: Option<u64>,
    pub children: Vec<u64>,
    pub process_group: Option<u64>,
    pub leader: Option<TaskKey>,
    /// Live tasks, in creation order
    pub tasks: Vec<TaskKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub leader: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessGroupSnapshot {
    pub id: u64,
    pub originator: u64,
    pub session: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySnapshot {
    pub index: u32,
    /// Thread group the terminal controls
    pub controller: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketSnapshot {
    pub id: u64,
    pub file: FileId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRestoreExecSnapshot {
    pub argv: Vec<String>,
    pub timeout: Timeout,
    pub leader: Option<TaskKey>,
}

/// Everything the kernel state record holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSnapshot {
    pub feature_set: FeatureSet,
    pub application_cores: u32,
    pub use_host_cores: bool,
    pub max_fd_limit: u32,
    pub cpu_clock: u64,
    pub ids: UniqueIdsSnapshot,
    pub timekeeper: TimekeeperSnapshot,
    pub root_user_namespace: u64,
    /// Parents precede their children
    pub user_namespaces: Vec<UserNamespaceSnapshot>,
    pub root_uts_namespace: u64,
    pub uts_namespaces: Vec<UtsNamespaceSnapshot>,
    pub root_ipc_namespace: u64,
    pub ipc_namespaces: Vec<IpcNamespaceSnapshot>,
    pub root_network_namespace: u64,
    pub network_namespaces: Vec<NetworkNamespaceSnapshot>,
    /// Parents precede their children; the first is the root
    pub pid_namespaces: Vec<PidNamespaceSnapshot>,
    pub thread_groups: Vec<ThreadGroupSnapshot>,
    pub tasks: Vec<TaskSnapshot>,
    pub sessions: Vec<SessionSnapshot>,
    pub process_groups: Vec<ProcessGroupSnapshot>,
    pub fd_tables: Vec<FdTableSnapshot>,
    pub fs_contexts: Vec<FsContextSnapshot>,
    pub ttys: Vec<TtySnapshot>,
    pub cgroups: CgroupRegistrySnapshot,
    pub cgroup_mounts: Vec<(String, CgroupMount)>,
    pub special_mounts: Vec<(SpecialFilesystem, VirtualDentry)>,
    pub user_counters: Vec<(Kuid, u64)>,
    pub container_names: Vec<(String, String)>,
    pub global_init: Option<u64>,
    pub sockets: Vec<SocketSnapshot>,
    pub next_socket_id: u64,
    pub save_restore_exec: Option<SaveRestoreExecSnapshot>,
}

fn state_error(what: &str, id: impl std::fmt::Display) -> KernelError {
    KernelError::checkpoint(
        CheckpointStage::KernelState,
        format!("checkpoint refers to unknown {} {}", what, id),
    )
}

fn lookup<'a, K: Ord + Copy + std::fmt::Display, V>(
    map: &'a BTreeMap<K, V>,
    what: &str,
    key: K,
) -> Result<&'a V, KernelError> {
    map.get(&key).ok_or_else(|| state_error(what, key))
}

/// Adds `ns` and its ancestors to `out`
fn collect_user_namespace(out: &mut BTreeMap<u64, Arc<UserNamespace>>, ns: &Arc<UserNamespace>) {
    let mut cur = Some(ns);
    while let Some(ns) = cur {
        if out.insert(ns.id(), Arc::clone(ns)).is_some() {
            break;
        }
        cur = ns.parent();
    }
}

/// Thread group state collected under the task set lock
struct GroupCapture {
    tg: Arc<ThreadGroup>,
    snapshot: ThreadGroupSnapshot,
}

impl Kernel {
    /// Captures the kernel state record
    ///
    /// Task threads must be stopped and the external lock held.
    pub(crate) fn capture_state(&self) -> Result<KernelSnapshot, KernelError> {
        let mut user_nss: BTreeMap<u64, Arc<UserNamespace>> = BTreeMap::new();
        let mut uts_nss: BTreeMap<u64, Arc<UtsNamespace>> = BTreeMap::new();
        let mut ipc_nss: BTreeMap<u64, Arc<IpcNamespace>> = BTreeMap::new();
        let mut net_nss: BTreeMap<u64, Arc<NetworkNamespace>> = BTreeMap::new();
        let mut fd_tables: BTreeMap<u64, FdTableSnapshot> = BTreeMap::new();
        let mut fs_contexts: BTreeMap<u64, FsContextSnapshot> = BTreeMap::new();
        let mut ttys: BTreeMap<u32, Arc<Tty>> = BTreeMap::new();

        collect_user_namespace(&mut user_nss, self.root_user_namespace());
        uts_nss.insert(self.root_uts_namespace().id(), Arc::clone(self.root_uts_namespace()));
        ipc_nss.insert(self.root_ipc_namespace().id(), Arc::clone(self.root_ipc_namespace()));
        net_nss.insert(
            self.root_network_namespace().id(),
            Arc::clone(self.root_network_namespace()),
        );

        let (tasks, groups, mut pid_namespaces, sessions, process_groups) = {
            let state = self.task_set().read();

            let mut tasks = Vec::with_capacity(state.tasks.len());
            for task in state.tasks.values() {
                let creds = task.credentials();
                collect_user_namespace(&mut user_nss, &creds.user_namespace);
                let uts = task.uts_namespace();
                let ipc = task.ipc_namespace();
                let net = task.network_namespace();
                uts_nss.entry(uts.id()).or_insert(uts);
                ipc_nss.entry(ipc.id()).or_insert(ipc);
                net_nss.entry(net.id()).or_insert(net);
                if let Some(fds) = task.fd_table() {
                    fd_tables.entry(fds.uid()).or_insert_with(|| fds.snapshot());
                }
                if let Some(fs) = task.fs_context() {
                    fs_contexts.entry(fs.uid()).or_insert_with(|| fs.snapshot());
                }
                tasks.push(task.snapshot());
            }

            let mut groups = Vec::with_capacity(state.thread_groups.len());
            for tg in state.thread_groups.values() {
                let signals = tg.snapshot_signals();
                if let Some(tty) = tg.controlling_tty() {
                    ttys.entry(tty.index()).or_insert(tty);
                }
                let links = tg.links.lock();
                let snapshot = ThreadGroupSnapshot {
                    uid: tg.uid(),
                    pid_namespace: tg.pid_namespace().id(),
                    limits: tg.limits().snapshot().into_iter().collect(),
                    termination_signal: tg.termination_signal(),
                    signals,
                    // Read once the task set lock is released.
                    itimer_real: IntervalTimerSnapshot::default(),
                    exited_stats: *tg.exited_stats.lock(),
                    parent: links.parent.upgrade().map(|p| p.uid()),
                    children: links
                        .children
                        .iter()
                        .filter_map(Weak::upgrade)
                        .map(|c| c.uid())
                        .collect(),
                    process_group: links.process_group.as_ref().map(|pg| pg.id()),
                    leader: links.leader.upgrade().map(|t| t.key()),
                    tasks: links.tasks.iter().map(|t| t.key()).collect(),
                };
                drop(links);
                groups.push(GroupCapture {
                    tg: Arc::clone(tg),
                    snapshot,
                });
            }

            let mut pid_namespaces = Vec::with_capacity(state.pid_namespaces.len());
            for (id, ns) in &state.pid_namespaces {
                collect_user_namespace(&mut user_nss, ns.user_namespace());
                let ns_state = lookup(&state.namespaces, "PID namespace state", *id)?;
                pid_namespaces.push((ns.level(), ns_state.snapshot(ns)));
            }

            let sessions: Vec<SessionSnapshot> = state
                .sessions
                .values()
                .map(|s| SessionSnapshot {
                    id: s.id(),
                    leader: s.leader_uid(),
                })
                .collect();
            let process_groups: Vec<ProcessGroupSnapshot> = state
                .process_groups
                .values()
                .map(|pg| ProcessGroupSnapshot {
                    id: pg.id(),
                    originator: pg.originator_uid(),
                    session: pg.session().id(),
                })
                .collect();
            (tasks, groups, pid_namespaces, sessions, process_groups)
        };

        let thread_groups = groups
            .into_iter()
            .map(|mut g| {
                g.snapshot.itimer_real = g.tg.itimer_real.snapshot();
                g.snapshot
            })
            .collect();
        let ttys = ttys
            .values()
            .map(|tty| TtySnapshot {
                index: tty.index(),
                controller: tty.thread_group().map(|tg| tg.uid()),
            })
            .collect();

        for ns in uts_nss.values() {
            collect_user_namespace(&mut user_nss, ns.user_namespace());
        }
        for ns in ipc_nss.values() {
            collect_user_namespace(&mut user_nss, ns.user_namespace());
        }
        for ns in net_nss.values() {
            collect_user_namespace(&mut user_nss, ns.user_namespace());
        }
        let mut user_namespaces: Vec<(usize, UserNamespaceSnapshot)> = user_nss
            .values()
            .map(|ns| (ns.depth(), ns.snapshot()))
            .collect();
        user_namespaces.sort_by_key(|(depth, ns)| (*depth, ns.id));
        pid_namespaces.sort_by_key(|(level, ns)| (*level, ns.id));

        let inner = self.inner();
        let mut sockets: Vec<SocketSnapshot> = inner
            .sockets
            .iter()
            .filter(|(_, record)| record.sock.strong_count() > 0)
            .map(|(file, record)| SocketSnapshot {
                id: record.id,
                file: *file,
            })
            .collect();
        sockets.sort_by_key(|s| s.id);
        let save_restore_exec = self.save_restore_exec_config().map(|config| SaveRestoreExecSnapshot {
            argv: config.argv.clone(),
            timeout: config.timeout,
            leader: config.leader.as_ref().map(|t| t.key()),
        });

        Ok(KernelSnapshot {
            feature_set: self.feature_set().clone(),
            application_cores: self.application_cores(),
            use_host_cores: self.use_host_cores(),
            max_fd_limit: self.max_fd_limit(),
            cpu_clock: self.cpu_clock(),
            ids: self.unique_ids().snapshot(),
            timekeeper: self.timekeeper().snapshot()?,
            root_user_namespace: self.root_user_namespace().id(),
            user_namespaces: user_namespaces.into_iter().map(|(_, ns)| ns).collect(),
            root_uts_namespace: self.root_uts_namespace().id(),
            uts_namespaces: uts_nss.values().map(|ns| ns.snapshot()).collect(),
            root_ipc_namespace: self.root_ipc_namespace().id(),
            ipc_namespaces: ipc_nss.values().map(|ns| ns.snapshot()).collect(),
            root_network_namespace: self.root_network_namespace().id(),
            network_namespaces: net_nss.values().map(|ns| ns.snapshot()).collect(),
            pid_namespaces: pid_namespaces.into_iter().map(|(_, ns)| ns).collect(),
            thread_groups,
            tasks,
            sessions,
            process_groups,
            fd_tables: fd_tables.into_values().collect(),
            fs_contexts: fs_contexts.into_values().collect(),
            ttys,
            cgroups: self.cgroup_registry().snapshot(),
            cgroup_mounts: inner
                .cgroup_mounts
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            special_mounts: inner
                .special_mounts
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            user_counters: inner
                .user_counters
                .iter()
                .map(|(uid, c)| (*uid, c.process_count()))
                .collect(),
            container_names: inner
                .container_names
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            global_init: inner.global_init.as_ref().map(|tg| tg.uid()),
            sockets,
            next_socket_id: inner.next_socket_id,
            save_restore_exec,
        })
    }
}

/// Reopens files through the filesystem, once per file
struct FileCache<'a> {
    deps: &'a KernelDeps,
    files: BTreeMap<FileId, Arc<dyn FileDescription>>,
}

impl FileCache<'_> {
    fn open(&mut self, id: FileId) -> Result<Arc<dyn FileDescription>, KernelError> {
        if let Some(file) = self.files.get(&id) {
            return Ok(Arc::clone(file));
        }
        let file = self.deps.vfs.restore_file(id)?;
        self.files.insert(id, Arc::clone(&file));
        Ok(file)
    }
}

/// Resolves memory managers through the loader, once per address space
struct ImageCache<'a> {
    deps: &'a KernelDeps,
    managers: BTreeMap<u64, Arc<dyn MemoryManager>>,
}

impl ImageCache<'_> {
    fn image(&mut self, snap: &TaskImageSnapshot) -> Result<TaskImage, KernelError> {
        let mm = match self.managers.get(&snap.memory_manager) {
            Some(mm) => Arc::clone(mm),
            None => {
                let mm = self
                    .deps
                    .loader
                    .restore_memory_manager(snap.memory_manager)
                    .map_err(|err| KernelError::checkpoint(CheckpointStage::KernelState, err))?;
                self.managers.insert(snap.memory_manager, Arc::clone(&mm));
                mm
            }
        };
        Ok(TaskImage {
            name: snap.name.clone(),
            arch: snap.arch.clone(),
            memory_manager: mm,
            file_caps: snap.file_caps,
        })
    }
}

/// Rebuilds the parts of a kernel from its state record
///
/// Restored tasks are not started and time stays paused until
/// [`Kernel::start`].
pub(crate) fn rebuild(
    snap: &KernelSnapshot,
    deps: KernelDeps,
    clocks: Arc<dyn Clocks>,
) -> Result<KernelParts, KernelError> {
    let ids = Arc::new(UniqueIds::from_snapshot(&snap.ids));
    let running = RunningTasks::with_tick(CLOCK_TICK, snap.cpu_clock);

    let mut user_nss: BTreeMap<u64, Arc<UserNamespace>> = BTreeMap::new();
    for s in &snap.user_namespaces {
        let parent = match s.parent {
            Some(id) => Some(Arc::clone(lookup(&user_nss, "user namespace", id)?)),
            None => None,
        };
        user_nss.insert(s.id, UserNamespace::from_snapshot(s, parent));
    }
    let user_ns = |id: u64| lookup(&user_nss, "user namespace", id).map(Arc::clone);

    let mut uts_nss = BTreeMap::new();
    for s in &snap.uts_namespaces {
        uts_nss.insert(s.id, UtsNamespace::from_snapshot(s, user_ns(s.user_namespace)?));
    }
    let mut ipc_nss = BTreeMap::new();
    for s in &snap.ipc_namespaces {
        ipc_nss.insert(s.id, IpcNamespace::from_snapshot(s, user_ns(s.user_namespace)?));
    }
    let mut net_nss = BTreeMap::new();
    for s in &snap.network_namespaces {
        net_nss.insert(s.id, NetworkNamespace::from_snapshot(s, user_ns(s.user_namespace)?));
    }

    let mut ts_state = TaskSetState::default();
    let mut root_pidns = None;
    for s in &snap.pid_namespaces {
        let ns = match s.parent {
            None => PidNamespace::new_root(s.id, user_ns(s.user_namespace)?),
            Some(parent) => lookup(&ts_state.pid_namespaces, "PID namespace", parent)?
                .new_child(s.id, user_ns(s.user_namespace)?),
        };
        if s.parent.is_none() {
            root_pidns = Some(Arc::clone(&ns));
        }
        ts_state.namespaces.insert(s.id, PidNsState::from_snapshot(s));
        ts_state.pid_namespaces.insert(s.id, ns);
    }
    let root_pidns = root_pidns.ok_or_else(|| state_error("PID namespace", "root"))?;

    let cgroups = CgroupRegistry::from_snapshot(&snap.cgroups)
        .map_err(|errno| KernelError::checkpoint(CheckpointStage::KernelState, errno))?;
    let ttys: BTreeMap<u32, Arc<Tty>> = snap
        .ttys
        .iter()
        .map(|t| (t.index, Tty::new(t.index)))
        .collect();

    let mut groups: BTreeMap<u64, Arc<ThreadGroup>> = BTreeMap::new();
    for s in &snap.thread_groups {
        let tty = match s.signals.tty {
            Some(index) => Some(Arc::clone(lookup(&ttys, "terminal", index)?)),
            None => None,
        };
        let tg = ThreadGroup::build(ThreadGroupParts {
            uid: s.uid,
            pidns: Arc::clone(lookup(&ts_state.pid_namespaces, "PID namespace", s.pid_namespace)?),
            limits: Arc::new(LimitSet::from_snapshot(s.limits.iter().copied().collect())),
            termination_signal: s.termination_signal,
            signal_state: SignalState::from_snapshot(&s.signals, tty),
            itimer_real: Some(s.itimer_real),
            exited_stats: s.exited_stats,
        });
        ts_state.thread_groups.insert(s.uid, Arc::clone(&tg));
        groups.insert(s.uid, tg);
    }
    let weak_group = |uid: u64| groups.get(&uid).map_or_else(Weak::new, Arc::downgrade);

    for s in &snap.sessions {
        ts_state
            .sessions
            .insert(s.id, Session::restore(s.id, weak_group(s.leader), s.leader));
    }
    for s in &snap.process_groups {
        let session = Arc::clone(lookup(&ts_state.sessions, "session", s.session)?);
        ts_state.process_groups.insert(
            s.id,
            ProcessGroup::restore(s.id, weak_group(s.originator), s.originator, session),
        );
    }

    let mut files = FileCache {
        deps: &deps,
        files: BTreeMap::new(),
    };
    let mut fd_tables: BTreeMap<u64, Arc<FdTable>> = BTreeMap::new();
    for s in &snap.fd_tables {
        fd_tables.insert(s.uid, FdTable::from_snapshot(s, |id| files.open(id))?);
    }
    let fs_contexts: BTreeMap<u64, Arc<FsContext>> = snap
        .fs_contexts
        .iter()
        .map(|s| (s.uid, FsContext::from_snapshot(s)))
        .collect();

    let mut images = ImageCache {
        deps: &deps,
        managers: BTreeMap::new(),
    };
    let mut mount_nss: BTreeMap<u64, Arc<MountNamespace>> = BTreeMap::new();
    let mut counters: BTreeMap<Kuid, Arc<UserCounters>> = BTreeMap::new();
    for s in &snap.tasks {
        let tg = Arc::clone(lookup(&groups, "thread group", s.thread_group)?);
        let creds = Arc::new(Credentials::from_snapshot(
            &s.credentials,
            user_ns(s.credentials.user_namespace)?,
        ));
        let image = s.image.as_ref().map(|i| images.image(i)).transpose()?;
        let run_state = match &s.exec_image {
            Some(i) => RunState::ExecStop(Box::new(images.image(i)?)),
            None => RunState::App,
        };
        let mut task_cgroups = BTreeMap::new();
        for (hierarchy, id) in &s.cgroups {
            let node: Arc<CgroupNode> = cgroups
                .cgroup(*id)
                .ok_or_else(|| state_error("cgroup", id))?;
            node.enter(s.key);
            task_cgroups.insert(*hierarchy, node);
        }
        let mount_ns = s.mount_namespace.as_ref().map(|m| {
            Arc::clone(
                mount_nss
                    .entry(m.id)
                    .or_insert_with(|| Arc::new(m.clone())),
            )
        });
        let user_counters = Arc::clone(
            counters
                .entry(creds.real_kuid)
                .or_insert_with(|| Arc::new(UserCounters::new(creds.real_kuid))),
        );

        let task = Task::from_parts(TaskParts {
            key: s.key,
            root_tid: s.root_tid,
            tg,
            platform: Arc::clone(&deps.platform),
            running: Arc::clone(&running),
            container_id: s.container_id.clone(),
            stats: s.stats,
            inner: TaskInner {
                name: s.name.clone(),
                image,
                fd_table: match s.fd_table {
                    Some(uid) => Some(Arc::clone(lookup(&fd_tables, "FD table", uid)?)),
                    None => None,
                },
                fs_context: match s.fs_context {
                    Some(uid) => Some(Arc::clone(lookup(&fs_contexts, "filesystem context", uid)?)),
                    None => None,
                },
                creds,
                uts: Arc::clone(lookup(&uts_nss, "UTS namespace", s.uts_namespace)?),
                ipc: Arc::clone(lookup(&ipc_nss, "IPC namespace", s.ipc_namespace)?),
                net: Arc::clone(lookup(&net_nss, "network namespace", s.network_namespace)?),
                mount_ns,
                cgroups: task_cgroups,
                cpu_mask: s.cpu_mask.clone(),
                run_state,
                exit_state: ExitState::Running,
                exit_status: WaitStatus::default(),
                user_counters,
            },
        });
        ts_state.tasks.insert(s.key, task);
    }

    for s in &snap.thread_groups {
        let tg = lookup(&groups, "thread group", s.uid)?;
        {
            let mut sig = tg.signals.lock();
            for ts in &s.signals.tasks {
                let task = lookup(&ts_state.tasks, "task", ts.task)?;
                sig.tasks.insert(ts.task, TaskSignals::restore(task, ts));
            }
        }
        let mut links = tg.links.lock();
        for key in &s.tasks {
            links
                .tasks
                .push(Arc::clone(lookup(&ts_state.tasks, "task", *key)?));
        }
        links.leader = match s.leader {
            Some(key) => Arc::downgrade(lookup(&ts_state.tasks, "task", key)?),
            None => Weak::new(),
        };
        links.parent = s.parent.map_or_else(Weak::new, &weak_group);
        links.children = s.children.iter().map(|uid| weak_group(*uid)).collect();
        links.process_group = match s.process_group {
            Some(id) => Some(Arc::clone(lookup(&ts_state.process_groups, "process group", id)?)),
            None => None,
        };
    }
    for t in &snap.ttys {
        if let (Some(tty), Some(uid)) = (ttys.get(&t.index), t.controller) {
            tty.lock().tg = Some(weak_group(uid));
        }
    }

    let live = ts_state.tasks.len() as u64;
    let save_restore_exec = match &snap.save_restore_exec {
        Some(s) => Some(SaveRestoreExecConfig {
            argv: s.argv.clone(),
            timeout: s.timeout,
            leader: match s.leader {
                Some(key) => Some(Arc::clone(lookup(&ts_state.tasks, "task", key)?)),
                None => None,
            },
        }),
        None => None,
    };
    for (uid, count) in &snap.user_counters {
        counters
            .entry(*uid)
            .or_insert_with(|| Arc::new(UserCounters::new(*uid)))
            .set_process_count(*count);
    }

    let mut sockets = BTreeMap::new();
    for s in &snap.sockets {
        let file = files.open(s.file)?;
        sockets.insert(
            s.file,
            SocketRecord {
                id: s.id,
                sock: Arc::downgrade(&file),
            },
        );
    }
    let inner = KernelInner {
        global_init: snap.global_init.and_then(|uid| groups.get(&uid).cloned()),
        special_mounts: snap.special_mounts.iter().cloned().collect(),
        user_counters: counters,
        container_names: snap.container_names.iter().cloned().collect(),
        cgroup_mounts: snap.cgroup_mounts.iter().cloned().collect(),
        save_status: Default::default(),
        sockets,
        next_socket_id: snap.next_socket_id,
    };

    let root_user_ns = user_ns(snap.root_user_namespace)?;
    let root_uts_ns = Arc::clone(lookup(&uts_nss, "UTS namespace", snap.root_uts_namespace)?);
    let root_ipc_ns = Arc::clone(lookup(&ipc_nss, "IPC namespace", snap.root_ipc_namespace)?);
    let root_net_ns = Arc::clone(lookup(
        &net_nss,
        "network namespace",
        snap.root_network_namespace,
    )?);
    let tasks = TaskSet::from_state(root_pidns, Arc::clone(&ids), ts_state, live);

    Ok(KernelParts {
        deps,
        feature_set: snap.feature_set.clone(),
        timekeeper: Timekeeper::from_snapshot(&snap.timekeeper, clocks),
        tasks,
        root_user_ns,
        root_uts_ns,
        root_ipc_ns,
        root_net_ns,
        application_cores: snap.application_cores,
        use_host_cores: snap.use_host_cores,
        max_fd_limit: snap.max_fd_limit,
        running,
        ids,
        cgroups,
        inner,
        save_restore_exec,
    })
}
