use super::Task;
use crate::namespaces::IpcNamespace;
use crate::task_set::{TaskConfig, TaskSet};
use crate::thread_group::ThreadGroup;
use core_types::{Capability, Errno, Signal};
use kernel_api::{KernelError, TaskImage};
use std::sync::Arc;
use tracing::debug;

/// How [`Task::clone_task`] relates the new task to its creator
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Create a new process rather than a thread in the creator's group
    pub new_thread_group: bool,
    pub share_fd_table: bool,
    pub share_fs_context: bool,
    pub new_pid_namespace: bool,
    pub new_uts_namespace: bool,
    pub new_ipc_namespace: bool,
    /// Sent to the parent when a new thread group exits
    pub termination_signal: Option<Signal>,
}

impl CloneOptions {
    /// Options for a new thread sharing everything with its creator
    pub fn thread() -> Self {
        Self {
            share_fd_table: true,
            share_fs_context: true,
            ..Self::default()
        }
    }

    /// Options for fork(2)
    pub fn fork() -> Self {
        Self {
            new_thread_group: true,
            termination_signal: Some(Signal::SIGCHLD),
            ..Self::default()
        }
    }

    fn new_namespaces(&self) -> bool {
        self.new_pid_namespace || self.new_uts_namespace || self.new_ipc_namespace
    }
}

impl Task {
    /// Creates a task from this one, as clone(2)
    ///
    /// A new thread shares the thread group, memory and signal handlers. A
    /// new process gets a forked memory manager, copies of the resource
    /// limits and signal actions, and joins its parent's process group.
    /// The returned task has not been started.
    pub fn clone_task(
        self: &Arc<Self>,
        task_set: &Arc<TaskSet>,
        opts: CloneOptions,
    ) -> Result<Arc<Task>, KernelError> {
        if !opts.new_thread_group && opts.new_namespaces() {
            return Err(Errno::EINVAL.into());
        }
        let ids = Arc::clone(task_set.ids());
        let creds = self.credentials();
        if opts.new_namespaces()
            && !creds.has_capability_in(Capability::SYS_ADMIN, &creds.user_namespace)
        {
            return Err(Errno::EPERM.into());
        }

        let (image, fd_table, fs_context, uts, ipc, net, mount_ns, cgroups, cpu_mask, counters, name) = {
            let inner = self.lock();
            (
                inner.image.clone(),
                inner.fd_table.clone(),
                inner.fs_context.clone(),
                Arc::clone(&inner.uts),
                Arc::clone(&inner.ipc),
                Arc::clone(&inner.net),
                inner.mount_ns.clone(),
                inner.cgroups.clone(),
                inner.cpu_mask.clone(),
                Arc::clone(&inner.user_counters),
                inner.name.clone(),
            )
        };

        let image = match image {
            Some(image) if opts.new_thread_group => {
                let memory_manager = image.memory_manager.fork()?;
                Some(TaskImage {
                    memory_manager,
                    ..image
                })
            }
            other => other,
        };
        let fd_table = fd_table.map(|fds| {
            if opts.share_fd_table {
                fds
            } else {
                fds.fork(ids.next())
            }
        });
        let fs_context = fs_context.map(|fs| {
            if opts.share_fs_context {
                fs
            } else {
                fs.fork(ids.next())
            }
        });

        let (thread_group, parent, new_pidns) = if opts.new_thread_group {
            let pidns = if opts.new_pid_namespace {
                let ns = self
                    .tg
                    .pid_namespace()
                    .new_child(ids.next(), Arc::clone(&creds.user_namespace));
                task_set.register_pid_namespace(&ns);
                ns
            } else {
                Arc::clone(self.tg.pid_namespace())
            };
            let tg = ThreadGroup::new(
                ids.next(),
                Arc::clone(&pidns),
                self.tg.limits().copy(),
                opts.termination_signal,
            );
            let actions = self.tg.signals.lock().actions.clone();
            tg.signals.lock().actions = actions;
            let new_pidns = opts.new_pid_namespace.then_some(pidns);
            (tg, Some(Arc::clone(&self.tg)), new_pidns)
        } else {
            (Arc::clone(&self.tg), None, None)
        };

        let uts = if opts.new_uts_namespace {
            uts.copy_into(ids.next(), Arc::clone(&creds.user_namespace))
        } else {
            uts.inc_ref();
            uts
        };
        let ipc = if opts.new_ipc_namespace {
            IpcNamespace::new(ids.next(), Arc::clone(&creds.user_namespace))
        } else {
            ipc.inc_ref();
            ipc
        };
        net.inc_ref();

        let created = task_set.new_task(TaskConfig {
            thread_group: thread_group.clone(),
            parent,
            name,
            image,
            fd_table,
            fs_context,
            credentials: creds,
            uts,
            ipc,
            net,
            mount_ns,
            cgroups,
            container_id: self.container_id.clone(),
            user_counters: counters,
            platform: Arc::clone(&self.platform),
            running: Arc::clone(&self.running),
            cpu_mask,
            signal_mask: self.signal_mask(),
        });
        match created {
            Ok(task) => {
                debug!(parent = %self.key, child = %task.key(), tg = thread_group.uid(), "task cloned");
                Ok(task)
            }
            Err(err) => {
                if let Some(ns) = new_pidns {
                    task_set.write().prune_namespace(&ns);
                }
                Err(err)
            }
        }
    }
}
