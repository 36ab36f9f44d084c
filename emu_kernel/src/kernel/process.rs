//! Process creation and whole-kernel execution control

use super::Kernel;
use crate::cgroup::CgroupNode;
use crate::cpu::CpuSet;
use crate::fd_table::FdTable;
use crate::fs_context::FsContext;
use crate::namespaces::{IpcNamespace, UtsNamespace};
use crate::pid_namespace::PidNamespace;
use crate::task_set::TaskConfig;
use crate::thread_group::ThreadGroup;
use crate::tty::Tty;
use core_types::{HierarchyId, Signal, SignalSet, ThreadId, WaitStatus};
use identity::Credentials;
use kernel_api::{FileDescription, KernelError, LoadArgs, MountNamespace, VirtualDentry};
use resources::LimitSet;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Default bound on symlinks followed while resolving the executable
pub const DEFAULT_MAX_SYMLINK_TRAVERSALS: u32 = 40;

/// Arguments to [`Kernel::create_process`]
///
/// The executable is `filename` when set, else `file` when given, else
/// `argv[0]`, which must then be an absolute path.
#[derive(Clone)]
pub struct CreateProcessArgs {
    pub filename: String,
    pub file: Option<Arc<dyn FileDescription>>,
    pub argv: Vec<String>,
    pub envv: Vec<String>,
    /// Resolved against the mount namespace root; empty means the root
    pub working_directory: String,
    pub credentials: Arc<Credentials>,
    /// A new empty table when absent
    pub fd_table: Option<Arc<FdTable>>,
    pub umask: u32,
    pub limits: Arc<LimitSet>,
    pub max_symlink_traversals: u32,
    /// The root namespaces when absent
    pub uts_namespace: Option<Arc<UtsNamespace>>,
    pub ipc_namespace: Option<Arc<IpcNamespace>>,
    pub pid_namespace: Option<Arc<PidNamespace>>,
    /// Borrowed from global init when absent
    pub mount_namespace: Option<Arc<MountNamespace>>,
    pub container_id: String,
    /// The root of every hierarchy when empty
    pub initial_cgroups: BTreeMap<HierarchyId, Arc<CgroupNode>>,
    pub tty: Option<Arc<Tty>>,
}

impl CreateProcessArgs {
    pub fn new(argv: Vec<String>, credentials: Arc<Credentials>) -> Self {
        Self {
            filename: String::new(),
            file: None,
            argv,
            envv: Vec::new(),
            working_directory: String::new(),
            credentials,
            fd_table: None,
            umask: 0o022,
            limits: Arc::new(LimitSet::linux_defaults()),
            max_symlink_traversals: DEFAULT_MAX_SYMLINK_TRAVERSALS,
            uts_namespace: None,
            ipc_namespace: None,
            pid_namespace: None,
            mount_namespace: None,
            container_id: String::new(),
            initial_cgroups: BTreeMap::new(),
            tty: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn with_file(mut self, file: Arc<dyn FileDescription>) -> Self {
        self.file = Some(file);
        self
    }

    pub fn with_envv(mut self, envv: Vec<String>) -> Self {
        self.envv = envv;
        self
    }

    pub fn with_working_directory(mut self, wd: impl Into<String>) -> Self {
        self.working_directory = wd.into();
        self
    }

    pub fn with_fd_table(mut self, fd_table: Arc<FdTable>) -> Self {
        self.fd_table = Some(fd_table);
        self
    }

    pub fn with_mount_namespace(mut self, mntns: Arc<MountNamespace>) -> Self {
        self.mount_namespace = Some(mntns);
        self
    }

    pub fn with_pid_namespace(mut self, pidns: Arc<PidNamespace>) -> Self {
        self.pid_namespace = Some(pidns);
        self
    }

    pub fn with_container_id(mut self, cid: impl Into<String>) -> Self {
        self.container_id = cid.into();
        self
    }

    pub fn with_limits(mut self, limits: Arc<LimitSet>) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_tty(mut self, tty: Arc<Tty>) -> Self {
        self.tty = Some(tty);
        self
    }

    pub fn with_initial_cgroups(mut self, cgroups: BTreeMap<HierarchyId, Arc<CgroupNode>>) -> Self {
        self.initial_cgroups = cgroups;
        self
    }
}

impl Kernel {
    /// Creates a process with one task that has not been started
    ///
    /// Returns the new thread group and its ID in the root PID namespace.
    /// The first process created becomes global init. Use
    /// [`Kernel::start_process`] to run it once the kernel has started.
    pub fn create_process(
        &self,
        mut args: CreateProcessArgs,
    ) -> Result<(Arc<ThreadGroup>, ThreadId), KernelError> {
        let _extern = self.lock_external();
        info!(argv = ?args.argv, "EXEC");

        let mntns = match args.mount_namespace.take() {
            Some(mntns) => mntns,
            None => self
                .global_init()
                .and_then(|init| init.leader())
                .and_then(|leader| leader.mount_namespace())
                .ok_or_else(|| KernelError::ProcessCreation("mount namespace is nil".into()))?,
        };
        let root = mntns.root.clone();
        let wd = if args.working_directory.is_empty() {
            root.clone()
        } else {
            self.vfs
                .get_dentry_at(&args.credentials, &root, &root, &args.working_directory)
                .map_err(|errno| {
                    KernelError::ProcessCreation(format!(
                        "failed to find initial working directory {:?}: {}",
                        args.working_directory, errno
                    ))
                })?
        };

        let filename = select_executable(&mut args)?;
        let image = self.loader.load_task_image(&LoadArgs {
            root: root.clone(),
            working_dir: wd.clone(),
            filename: filename.clone(),
            file: args.file.clone(),
            argv: args.argv.clone(),
            envv: args.envv.clone(),
            max_symlink_traversals: args.max_symlink_traversals,
            features: self.feature_set().clone(),
        })?;
        let creds = Arc::new(args.credentials.for_new_task(image.file_caps.as_ref())?);

        let pidns = args
            .pid_namespace
            .clone()
            .unwrap_or_else(|| Arc::clone(self.root_pid_namespace()));
        let tg = ThreadGroup::new(
            self.unique_id(),
            pidns,
            Arc::clone(&args.limits),
            Some(Signal::SIGCHLD),
        );
        let fs_context = FsContext::new(self.unique_id(), root, wd, args.umask);
        let fd_table = args
            .fd_table
            .clone()
            .unwrap_or_else(|| FdTable::new(self.unique_id()));
        let uts = args
            .uts_namespace
            .clone()
            .unwrap_or_else(|| Arc::clone(self.root_uts_namespace()));
        let ipc = args
            .ipc_namespace
            .clone()
            .unwrap_or_else(|| Arc::clone(self.root_ipc_namespace()));
        let net = Arc::clone(self.root_network_namespace());
        uts.inc_ref();
        ipc.inc_ref();
        net.inc_ref();
        let cgroups = if args.initial_cgroups.is_empty() {
            self.cgroup_registry().root_cgroups()
        } else {
            args.initial_cgroups.clone()
        };

        let task = self.task_set().new_task(TaskConfig {
            thread_group: Arc::clone(&tg),
            parent: None,
            name: image.name.clone(),
            image: Some(image),
            fd_table: Some(fd_table),
            fs_context: Some(fs_context),
            user_counters: self.user_counters(creds.real_kuid),
            credentials: Arc::clone(&creds),
            uts,
            ipc,
            net,
            mount_ns: Some(mntns),
            cgroups,
            container_id: args.container_id.clone(),
            platform: Arc::clone(&self.platform),
            running: Arc::clone(self.running_tasks()),
            cpu_mask: CpuSet::full(self.application_cores()),
            signal_mask: SignalSet::empty(),
        })?;

        if let Some(tty) = &args.tty {
            if let Err(errno) = tg.set_controlling_tty(self.task_set(), &creds, tty, false, true) {
                task.discard(self.task_set());
                return Err(KernelError::ProcessCreation(format!(
                    "setting controlling tty: {}",
                    errno
                )));
            }
        }

        let tgid = self
            .task_set()
            .id_of_thread_group(&tg, self.root_pid_namespace())
            .ok_or_else(|| KernelError::ProcessCreation("new process has no root ID".into()))?;
        {
            let mut inner = self.inner();
            if inner.global_init.is_none() {
                inner.global_init = Some(Arc::clone(&tg));
            }
        }
        debug!(%tgid, filename = %filename, container = %args.container_id, "process created");
        Ok((tg, tgid))
    }

    /// Starts the leader of a process made by [`Kernel::create_process`]
    pub fn start_process(&self, tg: &ThreadGroup) -> Result<(), KernelError> {
        let leader = tg
            .leader()
            .ok_or_else(|| KernelError::ProcessCreation("process has no leader".into()))?;
        leader.start(self.task_set())
    }

    /// Makes every thread group exit with `status`
    ///
    /// Tasks that were never started are released immediately.
    pub fn kill(&self, status: WaitStatus) {
        let _extern = self.lock_external();
        let unstarted = {
            let mut state = self.task_set().write();
            let root = self.root_pid_namespace().id();
            if let Some(ns_state) = state.namespaces.get_mut(&root) {
                ns_state.exiting = true;
            }
            for tg in state.thread_groups.values() {
                tg.group_exit(status);
            }
            state
                .tasks
                .values()
                .filter(|t| !t.is_started())
                .cloned()
                .collect::<Vec<_>>()
        };
        for task in unstarted {
            task.discard(self.task_set());
        }
        info!(%status, "kernel killed");
    }

    /// Blocks until every task has exited; no task can be created after
    pub fn wait_exited(&self) {
        self.task_set().wait_exited();
    }

    /// Replaces `old_root` by `new_root` in every task's filesystem context
    pub fn replace_fs_context_roots(&self, old_root: &VirtualDentry, new_root: &VirtualDentry) {
        for task in self.task_set().tasks() {
            if let Some(fs) = task.fs_context() {
                fs.replace_root(old_root, new_root);
            }
        }
    }
}

/// Picks the executable path and clears `file` when a filename wins
fn select_executable(args: &mut CreateProcessArgs) -> Result<String, KernelError> {
    if !args.filename.is_empty() {
        args.file = None;
        return Ok(args.filename.clone());
    }
    if let Some(file) = &args.file {
        return Ok(file.mapped_name());
    }
    let first = args
        .argv
        .first()
        .ok_or_else(|| KernelError::ProcessCreation("no filename or command provided".into()))?;
    if !Path::new(first).is_absolute() {
        return Err(KernelError::ProcessCreation(format!(
            "'{}' is not an absolute path",
            first
        )));
    }
    Ok(first.clone())
}
