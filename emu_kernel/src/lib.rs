//! # Emulated Kernel
//!
//! The process and thread execution core of a user-space kernel. It runs
//! sandboxed applications as tasks on host threads and keeps the state a
//! Linux kernel keeps for them: thread groups, sessions and process groups,
//! PID/UTS/IPC/network namespaces, cgroup membership, signals, interval
//! timers and the CPU clock.
//!
//! ## Philosophy
//!
//! - **The kernel is the root**: one [`Kernel`] owns every task and the
//!   collaborators they use. Collaborators (platform, loader, filesystem,
//!   memory) are traits from `kernel_api` handed in at Init.
//! - **Pause is a protocol**: the kernel is only saved, killed or
//!   inspected after every task thread has reached a stop point.
//! - **Checkpoints are plain data**: the kernel graph is captured as
//!   identifier-linked snapshots and rebuilt on restore.
//!
//! ## Lock order
//!
//! Locks are taken outermost first: external mutation lock, terminal,
//! thread group timers, interval timer internals, task set, signal
//! handlers, task, running-task accounting. Debug builds check the order at
//! runtime.
//!
//! ## Key Types
//!
//! - [`Kernel`]: Init, process creation, pause, kill, signals, checkpoint
//! - [`TaskSet`]: every live task and the IDs it has in each namespace
//! - [`ThreadGroup`] and [`Task`]: processes and their threads
//! - [`PidNamespace`]: thread ID numbering

pub mod cgroup;
pub mod checkpoint;
pub mod cpu;
pub mod fault_injection;
pub mod fd_table;
pub mod fs_context;
pub mod ids;
pub mod kernel;
mod lock_order;
pub mod namespaces;
pub mod pid_namespace;
pub mod session;
pub mod signals;
pub mod sync;
pub mod task;
pub mod task_set;
pub mod test_utils;
pub mod thread_group;
pub mod timekeeper;
pub mod timer;
pub mod tty;
pub mod user_counters;

pub use checkpoint::exec::{ExecMode, SaveRestoreExecConfig};
pub use checkpoint::{CheckpointOptions, PagesInput, PagesOutput, RestoreArgs, SaveStatus};
pub use kernel::{CreateProcessArgs, InitKernelArgs, Kernel, KernelDeps};
pub use pid_namespace::PidNamespace;
pub use session::{ProcessGroup, Session};
pub use task::{CloneOptions, Task};
pub use task_set::TaskSet;
pub use thread_group::ThreadGroup;
pub use tty::Tty;
