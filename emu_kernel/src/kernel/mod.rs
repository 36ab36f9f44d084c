//! The kernel
//!
//! One [`Kernel`] per sandbox. It owns the root namespaces, the task set,
//! the timekeeper, the CPU clock and the collaborators every task uses.
//! It is built by [`Kernel::init`] (or by restoring a checkpoint), mutated
//! until [`Kernel::start`], and torn down by [`Kernel::release`] once every
//! task has exited.
//!
//! ## Operations
//!
//! - Process creation: [`Kernel::create_process`], [`Kernel::start_process`]
//! - Execution control: [`Kernel::start`], [`Kernel::pause`],
//!   [`Kernel::unpause`], [`Kernel::kill`], [`Kernel::wait_exited`]
//! - External signals: [`Kernel::send_external_signal`] and its
//!   thread group, process group and container variants
//! - Checkpoint: [`Kernel::save_to`], [`Kernel::load_from`]

mod cgroups;
mod containers;
mod pause;
mod process;
pub mod running;
mod signals;
mod sockets;

pub use process::CreateProcessArgs;
pub use sockets::SocketRecord;

use crate::cgroup::{CgroupMount, CgroupRegistry};
use crate::checkpoint::exec::SaveRestoreExecConfig;
use crate::checkpoint::generation::CheckpointGeneration;
use crate::checkpoint::SaveStatus;
use crate::ids::UniqueIds;
use crate::lock_order::{Level, Ordered};
use crate::namespaces::{IpcNamespace, NetworkNamespace, UtsNamespace};
use crate::pid_namespace::PidNamespace;
use crate::task::GoroutineState;
use crate::task_set::TaskSet;
use crate::thread_group::ThreadGroup;
use crate::timekeeper::Timekeeper;
use crate::user_counters::UserCounters;
use core_types::Kuid;
use identity::UserNamespace;
use kernel_api::{
    Clocks, FeatureSet, KernelError, Loader, MemoryFile, Platform, SpecialFilesystem,
    VirtualDentry, VirtualFilesystem,
};
use parking_lot::{Mutex, MutexGuard};
use running::RunningTasks;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Default limit on the number of open file descriptors per process
pub const DEFAULT_MAX_FD_LIMIT: u32 = 4096;

/// Services the kernel consumes but does not implement
#[derive(Clone)]
pub struct KernelDeps {
    pub platform: Arc<dyn Platform>,
    pub loader: Arc<dyn Loader>,
    pub vfs: Arc<dyn VirtualFilesystem>,
    pub memory_file: Arc<dyn MemoryFile>,
}

/// Arguments to [`Kernel::init`]
///
/// Namespaces supplied here should take their IDs from
/// [`InitKernelArgs::ids`] so they never collide with IDs the kernel
/// allocates later.
pub struct InitKernelArgs {
    pub feature_set: FeatureSet,
    /// Host clocks; mandatory
    pub clocks: Option<Arc<dyn Clocks>>,
    /// Mandatory
    pub root_user_namespace: Option<Arc<UserNamespace>>,
    pub root_uts_namespace: Option<Arc<UtsNamespace>>,
    pub root_ipc_namespace: Option<Arc<IpcNamespace>>,
    /// Created without a network stack when absent
    pub root_network_namespace: Option<Arc<NetworkNamespace>>,
    pub root_pid_namespace: Option<Arc<PidNamespace>>,
    /// Number of CPUs visible to applications; must not be zero
    pub application_cores: u32,
    /// Expose host CPU numbers to applications
    pub use_host_cores: bool,
    /// Zero selects [`DEFAULT_MAX_FD_LIMIT`]
    pub max_fd_limit: u32,
    pub save_restore_exec: Option<SaveRestoreExecConfig>,
    ids: Arc<UniqueIds>,
}

impl InitKernelArgs {
    pub fn new(application_cores: u32) -> Self {
        Self {
            feature_set: FeatureSet::default(),
            clocks: None,
            root_user_namespace: None,
            root_uts_namespace: None,
            root_ipc_namespace: None,
            root_network_namespace: None,
            root_pid_namespace: None,
            application_cores,
            use_host_cores: false,
            max_fd_limit: 0,
            save_restore_exec: None,
            ids: Arc::new(UniqueIds::new()),
        }
    }

    /// The generator the kernel will keep using after Init
    pub fn ids(&self) -> &Arc<UniqueIds> {
        &self.ids
    }

    pub fn with_feature_set(mut self, feature_set: FeatureSet) -> Self {
        self.feature_set = feature_set;
        self
    }

    pub fn with_clocks(mut self, clocks: Arc<dyn Clocks>) -> Self {
        self.clocks = Some(clocks);
        self
    }

    pub fn with_root_user_namespace(mut self, ns: Arc<UserNamespace>) -> Self {
        self.root_user_namespace = Some(ns);
        self
    }

    pub fn with_root_uts_namespace(mut self, ns: Arc<UtsNamespace>) -> Self {
        self.root_uts_namespace = Some(ns);
        self
    }

    pub fn with_root_ipc_namespace(mut self, ns: Arc<IpcNamespace>) -> Self {
        self.root_ipc_namespace = Some(ns);
        self
    }

    pub fn with_root_network_namespace(mut self, ns: Arc<NetworkNamespace>) -> Self {
        self.root_network_namespace = Some(ns);
        self
    }

    pub fn with_root_pid_namespace(mut self, ns: Arc<PidNamespace>) -> Self {
        self.root_pid_namespace = Some(ns);
        self
    }

    pub fn with_use_host_cores(mut self, use_host_cores: bool) -> Self {
        self.use_host_cores = use_host_cores;
        self
    }

    pub fn with_max_fd_limit(mut self, limit: u32) -> Self {
        self.max_fd_limit = limit;
        self
    }

    pub fn with_save_restore_exec(mut self, config: SaveRestoreExecConfig) -> Self {
        self.save_restore_exec = Some(config);
        self
    }
}

impl Default for InitKernelArgs {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Mutable kernel state that is not on any hot path
#[derive(Default)]
pub(crate) struct KernelInner {
    /// The first thread group created by [`Kernel::create_process`]
    pub(crate) global_init: Option<Arc<ThreadGroup>>,
    pub(crate) special_mounts: BTreeMap<SpecialFilesystem, VirtualDentry>,
    pub(crate) user_counters: BTreeMap<Kuid, Arc<UserCounters>>,
    /// Container ID to container name
    pub(crate) container_names: BTreeMap<String, String>,
    /// Cgroup mounts by controller
    pub(crate) cgroup_mounts: BTreeMap<String, CgroupMount>,
    pub(crate) save_status: SaveStatus,
    pub(crate) sockets: BTreeMap<core_types::FileId, SocketRecord>,
    pub(crate) next_socket_id: u64,
}

/// Everything needed to assemble a kernel, fresh or restored
pub(crate) struct KernelParts {
    pub(crate) deps: KernelDeps,
    pub(crate) feature_set: FeatureSet,
    pub(crate) timekeeper: Arc<Timekeeper>,
    pub(crate) tasks: Arc<TaskSet>,
    pub(crate) root_user_ns: Arc<UserNamespace>,
    pub(crate) root_uts_ns: Arc<UtsNamespace>,
    pub(crate) root_ipc_ns: Arc<IpcNamespace>,
    pub(crate) root_net_ns: Arc<NetworkNamespace>,
    pub(crate) application_cores: u32,
    pub(crate) use_host_cores: bool,
    pub(crate) max_fd_limit: u32,
    pub(crate) running: Arc<RunningTasks>,
    pub(crate) ids: Arc<UniqueIds>,
    pub(crate) cgroups: CgroupRegistry,
    pub(crate) inner: KernelInner,
    pub(crate) save_restore_exec: Option<SaveRestoreExecConfig>,
}

pub struct Kernel {
    feature_set: FeatureSet,
    timekeeper: Arc<Timekeeper>,
    tasks: Arc<TaskSet>,
    root_user_ns: Arc<UserNamespace>,
    root_uts_ns: Arc<UtsNamespace>,
    root_ipc_ns: Arc<IpcNamespace>,
    root_net_ns: Arc<NetworkNamespace>,
    application_cores: u32,
    use_host_cores: bool,
    max_fd_limit: u32,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) loader: Arc<dyn Loader>,
    pub(crate) vfs: Arc<dyn VirtualFilesystem>,
    pub(crate) memory_file: Arc<dyn MemoryFile>,
    running: Arc<RunningTasks>,
    ids: Arc<UniqueIds>,
    cgroups: CgroupRegistry,
    /// Serializes operations that mutate the kernel from outside
    extern_mu: Mutex<()>,
    started: AtomicBool,
    inner: Mutex<KernelInner>,
    checkpoint_gen: CheckpointGeneration,
    save_restore_exec: Mutex<Option<SaveRestoreExecConfig>>,
}

impl Kernel {
    /// Builds a kernel that has no tasks
    ///
    /// Fails with [`KernelError::InvalidConfig`] when clocks or the root
    /// user namespace are missing or when no application core is
    /// configured.
    pub fn init(args: InitKernelArgs, deps: KernelDeps) -> Result<Arc<Kernel>, KernelError> {
        let clocks = args
            .clocks
            .ok_or_else(|| KernelError::InvalidConfig("must set clocks before Init".into()))?;
        let root_user_ns = args.root_user_namespace.ok_or_else(|| {
            KernelError::InvalidConfig("root user namespace is required".into())
        })?;
        if args.application_cores == 0 {
            return Err(KernelError::InvalidConfig(
                "application core count must be positive".into(),
            ));
        }

        let mut application_cores = args.application_cores;
        if args.use_host_cores {
            let max_cpu = deps.platform.max_possible_cpu().map_err(|errno| {
                KernelError::InvalidConfig(format!("failed to get maximum CPU number: {}", errno))
            })?;
            let host_cores = max_cpu + 1;
            if host_cores > application_cores {
                info!(
                    from = application_cores,
                    to = host_cores,
                    "UseHostCores enabled: increasing application cores"
                );
                application_cores = host_cores;
            }
        }
        let max_fd_limit = if args.max_fd_limit == 0 {
            DEFAULT_MAX_FD_LIMIT
        } else {
            args.max_fd_limit
        };

        let ids = args.ids;
        let root_uts_ns = args.root_uts_namespace.unwrap_or_else(|| {
            UtsNamespace::new(ids.next(), "localhost", "", Arc::clone(&root_user_ns))
        });
        let root_ipc_ns = args
            .root_ipc_namespace
            .unwrap_or_else(|| IpcNamespace::new(ids.next(), Arc::clone(&root_user_ns)));
        let root_net_ns = args.root_network_namespace.unwrap_or_else(|| {
            NetworkNamespace::new_root(ids.next(), Arc::clone(&root_user_ns), None)
        });
        let root_pid_ns = args
            .root_pid_namespace
            .unwrap_or_else(|| PidNamespace::new_root(ids.next(), Arc::clone(&root_user_ns)));
        let tasks = TaskSet::new(root_pid_ns, Arc::clone(&ids));

        deps.vfs.init()?;
        let mut inner = KernelInner::default();
        for fs in SpecialFilesystem::ALL {
            let mount = deps.vfs.new_disconnected_mount(fs)?;
            inner.special_mounts.insert(fs, mount);
        }

        let kernel = Kernel::assemble(KernelParts {
            deps,
            feature_set: args.feature_set,
            timekeeper: Timekeeper::new(Some(clocks)),
            tasks,
            root_user_ns,
            root_uts_ns,
            root_ipc_ns,
            root_net_ns,
            application_cores,
            use_host_cores: args.use_host_cores,
            max_fd_limit,
            running: RunningTasks::new(),
            ids,
            cgroups: CgroupRegistry::new(),
            inner,
            save_restore_exec: args.save_restore_exec,
        });
        info!(
            cores = application_cores,
            max_fd_limit, "kernel initialized"
        );
        Ok(kernel)
    }

    pub(crate) fn assemble(parts: KernelParts) -> Arc<Kernel> {
        Arc::new(Kernel {
            feature_set: parts.feature_set,
            timekeeper: parts.timekeeper,
            tasks: parts.tasks,
            root_user_ns: parts.root_user_ns,
            root_uts_ns: parts.root_uts_ns,
            root_ipc_ns: parts.root_ipc_ns,
            root_net_ns: parts.root_net_ns,
            application_cores: parts.application_cores,
            use_host_cores: parts.use_host_cores,
            max_fd_limit: parts.max_fd_limit,
            platform: parts.deps.platform,
            loader: parts.deps.loader,
            vfs: parts.deps.vfs,
            memory_file: parts.deps.memory_file,
            running: parts.running,
            ids: parts.ids,
            cgroups: parts.cgroups,
            extern_mu: Mutex::new(()),
            started: AtomicBool::new(false),
            inner: Mutex::new(parts.inner),
            checkpoint_gen: CheckpointGeneration::new(),
            save_restore_exec: Mutex::new(parts.save_restore_exec),
        })
    }

    pub(crate) fn lock_external(&self) -> Ordered<MutexGuard<'_, ()>> {
        Ordered::acquire(Level::External, || self.extern_mu.lock())
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, KernelInner> {
        self.inner.lock()
    }

    pub(crate) fn deps(&self) -> KernelDeps {
        KernelDeps {
            platform: Arc::clone(&self.platform),
            loader: Arc::clone(&self.loader),
            vfs: Arc::clone(&self.vfs),
            memory_file: Arc::clone(&self.memory_file),
        }
    }

    pub fn feature_set(&self) -> &FeatureSet {
        &self.feature_set
    }

    pub fn timekeeper(&self) -> &Arc<Timekeeper> {
        &self.timekeeper
    }

    pub fn task_set(&self) -> &Arc<TaskSet> {
        &self.tasks
    }

    pub fn root_user_namespace(&self) -> &Arc<UserNamespace> {
        &self.root_user_ns
    }

    pub fn root_uts_namespace(&self) -> &Arc<UtsNamespace> {
        &self.root_uts_ns
    }

    pub fn root_ipc_namespace(&self) -> &Arc<IpcNamespace> {
        &self.root_ipc_ns
    }

    pub fn root_pid_namespace(&self) -> &Arc<PidNamespace> {
        self.tasks.root()
    }

    pub fn root_network_namespace(&self) -> &Arc<NetworkNamespace> {
        &self.root_net_ns
    }

    /// The thread group of the first process created, if any
    pub fn global_init(&self) -> Option<Arc<ThreadGroup>> {
        self.inner.lock().global_init.clone()
    }

    pub fn application_cores(&self) -> u32 {
        self.application_cores
    }

    pub fn use_host_cores(&self) -> bool {
        self.use_host_cores
    }

    pub fn max_fd_limit(&self) -> u32 {
        self.max_fd_limit
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn memory_file(&self) -> &Arc<dyn MemoryFile> {
        &self.memory_file
    }

    pub fn vfs(&self) -> &Arc<dyn VirtualFilesystem> {
        &self.vfs
    }

    pub fn special_mount(&self, fs: SpecialFilesystem) -> Option<VirtualDentry> {
        self.inner.lock().special_mounts.get(&fs).cloned()
    }

    pub fn cgroup_registry(&self) -> &CgroupRegistry {
        &self.cgroups
    }

    pub fn running_tasks(&self) -> &Arc<RunningTasks> {
        &self.running
    }

    /// Current CPU clock value in ticks
    pub fn cpu_clock(&self) -> u64 {
        self.running.cpu_clock()
    }

    pub(crate) fn unique_ids(&self) -> &Arc<UniqueIds> {
        &self.ids
    }

    /// Returns a kernel-unique, never-zero ID
    pub fn unique_id(&self) -> u64 {
        self.ids.next()
    }

    /// Returns a nonzero cookie pairing inotify rename events
    pub fn generate_inotify_cookie(&self) -> u32 {
        self.ids.next_inotify_cookie()
    }

    pub fn checkpoint_generation(&self) -> &CheckpointGeneration {
        &self.checkpoint_gen
    }

    pub fn save_restore_exec_config(&self) -> Option<SaveRestoreExecConfig> {
        self.save_restore_exec.lock().clone()
    }

    pub fn set_save_restore_exec_config(&self, config: Option<SaveRestoreExecConfig>) {
        *self.save_restore_exec.lock() = config;
    }

    /// Counters of user `uid`, created on first use
    pub fn user_counters(&self, uid: Kuid) -> Arc<UserCounters> {
        let mut inner = self.inner.lock();
        Arc::clone(
            inner
                .user_counters
                .entry(uid)
                .or_insert_with(|| Arc::new(UserCounters::new(uid))),
        )
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Starts the CPU clock ticker and every task created so far
    ///
    /// Fails with [`KernelError::AlreadyStarted`] on the second call.
    pub fn start(self: &Arc<Self>) -> Result<(), KernelError> {
        let _extern = self.lock_external();
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(KernelError::AlreadyStarted);
        }

        let weak: Weak<Kernel> = Arc::downgrade(self);
        self.running
            .spawn_ticker(Box::new(move |clock| {
                if let Some(kernel) = weak.upgrade() {
                    kernel.on_cpu_tick(clock);
                }
            }))
            .map_err(|err| KernelError::Platform(format!("failed to start CPU clock ticker: {}", err)))?;

        // Time may have been paused by a save before this kernel was
        // started from a checkpoint.
        self.resume_time();

        let tasks = self.tasks.tasks();
        for task in &tasks {
            task.start(&self.tasks)?;
        }
        info!(tasks = tasks.len(), "kernel started");
        Ok(())
    }

    /// Charges the tick that just elapsed to the CPU timers of every group
    /// with a running task
    fn on_cpu_tick(&self, _clock: u64) {
        for tg in self.tasks.thread_groups() {
            let mut user = 0;
            let mut sys = 0;
            for task in tg.tasks() {
                match task.sample_tick() {
                    Some(GoroutineState::RunningApp) => user += 1,
                    Some(_) => sys += 1,
                    None => {}
                }
            }
            if user + sys > 0 {
                tg.advance_cpu_timers(user, sys);
            }
        }
    }

    /// Tears the kernel down
    ///
    /// Every task must have exited.
    pub fn release(&self) {
        let (cgroup_mounts, special_mounts) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.cgroup_mounts),
                std::mem::take(&mut inner.special_mounts),
            )
        };
        debug!(
            cgroup_mounts = cgroup_mounts.len(),
            special_mounts = special_mounts.len(),
            "releasing kernel mounts"
        );
        drop(cgroup_mounts);
        drop(special_mounts);
        self.vfs.release();
        self.timekeeper.destroy();
        self.root_net_ns.dec_ref();
        self.root_ipc_ns.dec_ref();
        self.root_uts_ns.dec_ref();
        self.memory_file.destroy();
        self.running.shutdown();
        info!("kernel released");
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.running.shutdown();
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("application_cores", &self.application_cores)
            .field("started", &self.is_started())
            .field("cpu_clock", &self.cpu_clock())
            .finish()
    }
}
