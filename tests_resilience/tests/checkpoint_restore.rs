//! Checkpoint and Restore Tests
//!
//! Validates that a saved kernel comes back with the same processes,
//! IDs, pending signals and memory, and that every failure is reported at
//! the stage it happened in.

use core_types::{FileId, Signal, SignalInfo, ThreadId, WaitStatus};
use emu_kernel::fault_injection::{CheckpointFault, FaultPlan};
use emu_kernel::test_utils::{
    process_args, FakeAsyncLoader, FakeFile, FakeMemoryFile, FakeNetworkStack, Fakes,
    ManualClocks,
};
use emu_kernel::{CheckpointOptions, Kernel, PagesInput, PagesOutput, RestoreArgs};
use kernel_api::{CheckpointStage, FeatureSet, FileDescription, KernelError, MemorySaveOpts};
use std::fs::File;
use std::io::{Cursor, Seek, SeekFrom};
use std::sync::Arc;
use tests_resilience::{boot, shutdown};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn restore_args(cores: u32) -> RestoreArgs {
    RestoreArgs::new(cores, ManualClocks::new(5_000_000))
}

/// Starts a kernel with init and one child, both blocked in the app
fn running_kernel(fakes: &Fakes) -> (Arc<Kernel>, ThreadId, ThreadId) {
    let kernel = fakes.kernel().expect("kernel init failed");
    fakes.memory_file.set_contents(b"application pages".to_vec());
    let (_, init_id) = kernel
        .create_process(process_args(&kernel, &["/sbin/init"]))
        .expect("create init failed");
    let (_, app_id) = kernel
        .create_process(process_args(&kernel, &["/usr/bin/app"]))
        .expect("create app failed");
    kernel.start().expect("start failed");
    (kernel, init_id, app_id)
}

/// Test: a checkpoint written to a file restores into a fresh kernel
///
/// This validates that:
/// 1. Thread group IDs survive the round trip
/// 2. A signal pending at save time is still pending after restore
/// 3. Memory file contents and memory managers are restored
/// 4. The filesystem is told the restore is complete
#[test]
fn test_round_trip_through_file() {
    init_logging();
    let fakes = Fakes::new();
    let (kernel, init_id, app_id) = running_kernel(&fakes);
    let dir = tempfile::tempdir().expect("tempdir failed");
    let path = dir.path().join("checkpoint.img");

    kernel.pause();
    let app = kernel
        .task_set()
        .thread_group_with_id(kernel.root_pid_namespace(), app_id)
        .expect("app missing");
    app.send_signal(SignalInfo::kernel(Signal::SIGUSR2))
        .expect("signal failed");
    {
        let mut file = File::create(&path).expect("create failed");
        kernel
            .save_to(&mut file, None, &MemorySaveOpts::default())
            .expect("save failed");
    }
    assert_eq!(fakes.memory_file.saves(), 1);
    kernel.kill(WaitStatus::exited(0));
    kernel.unpause();
    kernel.wait_exited();

    let restored = Fakes::new();
    let mut file = File::open(&path).expect("open failed");
    let kernel = Kernel::load_from(restored.deps(), &mut file, None, restore_args(2))
        .expect("load failed");

    let root = kernel.root_pid_namespace();
    let init = kernel
        .task_set()
        .thread_group_with_id(root, init_id)
        .expect("init missing");
    let app = kernel
        .task_set()
        .thread_group_with_id(root, app_id)
        .expect("app missing");
    assert!(kernel.global_init().is_some_and(|g| g.uid() == init.uid()));
    assert!(app.pending_signals().contains(Signal::SIGUSR2));
    assert!(!init.pending_signals().contains(Signal::SIGUSR2));
    assert_eq!(app.leader().map(|t| t.name()), Some("app".to_string()));

    assert_eq!(restored.memory_file.contents(), b"application pages");
    assert_eq!(restored.loader.restored().len(), 2);
    assert_eq!(restored.vfs.complete_restores().len(), 1);
    assert!(!kernel.is_started());

    shutdown(&kernel);
}

/// Test: the restored kernel runs its tasks and delivers saved signals
#[test]
fn test_restored_kernel_delivers_pending_signal() {
    let fakes = Fakes::new();
    let (kernel, _, app_id) = running_kernel(&fakes);
    kernel.pause();
    kernel
        .task_set()
        .thread_group_with_id(kernel.root_pid_namespace(), app_id)
        .expect("app missing")
        .send_signal(SignalInfo::kernel(Signal::SIGTERM))
        .expect("signal failed");
    let mut image = Vec::new();
    kernel
        .save_to(&mut image, None, &MemorySaveOpts::default())
        .expect("save failed");
    kernel.kill(WaitStatus::exited(0));
    kernel.unpause();
    kernel.wait_exited();

    let restored = Fakes::new();
    let kernel = Kernel::load_from(
        restored.deps(),
        &mut Cursor::new(image),
        None,
        restore_args(2),
    )
    .expect("load failed");
    let app = kernel
        .task_set()
        .thread_group_with_id(kernel.root_pid_namespace(), app_id)
        .expect("app missing");
    kernel.start().expect("start failed");
    kernel.finish_restore().expect("finish_restore failed");

    assert_eq!(app.wait_exited(), WaitStatus::signaled(Signal::SIGTERM));
    shutdown(&kernel);
}

/// Test: memory files can go to a separate pages stream
#[test]
fn test_round_trip_with_pages_stream() {
    let fakes = Fakes::new();
    let tmpfs = FakeMemoryFile::new("tmpfs-1", Arc::clone(&fakes.faults));
    tmpfs.set_contents(b"tmpfs data".to_vec());
    fakes.vfs.add_private_memory_file("tmpfs-1", tmpfs.clone());
    let (kernel, init_id, _) = running_kernel(&fakes);

    let mut state = Vec::new();
    let mut metadata = tempfile::tempfile().expect("tempfile failed");
    let mut pages = Vec::new();
    kernel.pause();
    kernel
        .save_to(
            &mut state,
            Some(PagesOutput {
                metadata: &mut metadata,
                pages: &mut pages,
            }),
            &MemorySaveOpts::default(),
        )
        .expect("save failed");
    shutdown_paused(&kernel);
    assert!(pages.ends_with(b"tmpfs data"));

    let restored = Fakes::new();
    let restored_tmpfs = FakeMemoryFile::new("tmpfs-1", Arc::clone(&restored.faults));
    metadata.seek(SeekFrom::Start(0)).expect("seek failed");
    let mut pages = Cursor::new(pages);
    let kernel = Kernel::load_from(
        restored.deps(),
        &mut Cursor::new(state),
        Some(PagesInput {
            metadata: &mut metadata,
            pages: &mut pages,
        }),
        restore_args(2).with_private_memory_file("tmpfs-1", restored_tmpfs.clone()),
    )
    .expect("load failed");

    assert_eq!(restored.memory_file.contents(), b"application pages");
    assert_eq!(restored_tmpfs.contents(), b"tmpfs data");
    assert!(kernel
        .task_set()
        .thread_group_with_id(kernel.root_pid_namespace(), init_id)
        .is_some());
    shutdown(&kernel);
}

/// Test: the async loader replaces reading memory from the stream
#[test]
fn test_async_loader_skips_memory_records() {
    let fakes = Fakes::new();
    let (kernel, _, _) = running_kernel(&fakes);
    let mut image = Vec::new();
    kernel.pause();
    kernel
        .save_to(&mut image, None, &MemorySaveOpts::default())
        .expect("save failed");
    shutdown_paused(&kernel);

    let restored = Fakes::new();
    let loader = FakeAsyncLoader::new();
    let kernel = Kernel::load_from(
        restored.deps(),
        &mut Cursor::new(image),
        None,
        restore_args(2).with_async_loader(loader.clone()),
    )
    .expect("load failed");
    assert_eq!(loader.waits(), 1);
    assert_eq!(restored.memory_file.loads(), 0);
    shutdown(&kernel);
}

#[test]
fn test_saved_network_is_restored() {
    let fakes = Fakes::new();
    let (kernel, _, _) = running_kernel(&fakes);
    let mut image = Vec::new();
    kernel.pause();
    kernel
        .save_to(&mut image, None, &MemorySaveOpts::default())
        .expect("save failed");
    shutdown_paused(&kernel);

    let stack = FakeNetworkStack::new();
    let config = FakeNetworkStack::new();
    let restored = Fakes::new();
    let kernel = Kernel::load_from(
        restored.deps(),
        &mut Cursor::new(image.clone()),
        None,
        restore_args(2)
            .with_saved_network(stack.clone())
            .with_network_config(config),
    )
    .expect("load failed");
    assert_eq!(stack.restores(), 1);
    assert_eq!(stack.config_replacements(), 1);
    shutdown(&kernel);

    let mut args = restore_args(2);
    args.save_restore_net = true;
    let err = Kernel::load_from(Fakes::new().deps(), &mut Cursor::new(image), None, args)
        .unwrap_err();
    assert!(matches!(
        err,
        KernelError::Checkpoint {
            stage: CheckpointStage::Network,
            ..
        }
    ));
}

/// Test: a fresh stack given at restore is restored but keeps its config
#[test]
fn test_network_stack_restored_without_saved_network() {
    let fakes = Fakes::new();
    let (kernel, _, _) = running_kernel(&fakes);
    let mut image = Vec::new();
    kernel.pause();
    kernel
        .save_to(&mut image, None, &MemorySaveOpts::default())
        .expect("save failed");
    shutdown_paused(&kernel);

    let stack = FakeNetworkStack::new();
    let kernel = Kernel::load_from(
        Fakes::new().deps(),
        &mut Cursor::new(image),
        None,
        restore_args(2)
            .with_network_stack(stack.clone())
            .with_network_config(FakeNetworkStack::new()),
    )
    .expect("load failed");
    assert_eq!(stack.restores(), 1);
    assert_eq!(stack.config_replacements(), 0);
    assert!(kernel.root_network_namespace().stack().is_some());
    shutdown(&kernel);
}

/// Test: restored thread groups are reachable by kernel-wide iteration,
/// not only by ID lookup
#[test]
fn test_restored_thread_groups_are_registered() {
    let fakes = Fakes::new();
    let (kernel, init_id, app_id) = running_kernel(&fakes);
    let saved_groups = kernel.task_set().thread_groups().len();
    let mut image = Vec::new();
    kernel.pause();
    kernel
        .save_to(&mut image, None, &MemorySaveOpts::default())
        .expect("save failed");
    shutdown_paused(&kernel);

    let kernel = Kernel::load_from(
        Fakes::new().deps(),
        &mut Cursor::new(image),
        None,
        restore_args(2),
    )
    .expect("load failed");
    assert_eq!(kernel.task_set().thread_groups().len(), saved_groups);
    let root = kernel.root_pid_namespace();
    for tgid in [init_id, app_id] {
        let tg = kernel
            .task_set()
            .thread_group_with_id(root, tgid)
            .expect("thread group missing");
        assert!(kernel
            .task_set()
            .thread_groups()
            .iter()
            .any(|g| g.uid() == tg.uid()));
    }

    let app = kernel
        .task_set()
        .thread_group_with_id(root, app_id)
        .expect("app missing");
    let pg = app.process_group().expect("no process group");
    kernel
        .send_external_signal_process_group(&pg, SignalInfo::kernel(Signal::SIGUSR1))
        .expect("signal failed");
    assert!(app.pending_signals().contains(Signal::SIGUSR1));
    shutdown(&kernel);
}

/// Test: open files, the socket table and cgroup membership survive a
/// round trip
///
/// This validates that:
/// 1. A descriptor keeps its number and refers to the same file
/// 2. A recorded socket held by a descriptor is listed again, with its
///    table entry number
/// 3. A file shared by a descriptor and the socket table is reopened once
/// 4. A task moved to a child cgroup is still a member of it
#[test]
fn test_round_trip_keeps_files_sockets_and_cgroups() {
    let fakes = Fakes::new();
    let (kernel, init_id, app_id) = running_kernel(&fakes);
    let root = kernel.root_pid_namespace();
    let app = kernel
        .task_set()
        .thread_group_with_id(root, app_id)
        .expect("app missing")
        .leader()
        .expect("no leader");
    let fds = app.fd_table().expect("no FD table");
    let limit = kernel.max_fd_limit() as i32;
    let log: Arc<dyn FileDescription> = FakeFile::new(41, "log");
    let sock: Arc<dyn FileDescription> = FakeFile::socket(42, "listener");
    let log_fd = fds.new_fd(log, 3, false, limit).expect("new_fd failed");
    let sock_fd = fds.new_fd(Arc::clone(&sock), 3, true, limit).expect("new_fd failed");
    kernel.record_socket(&sock);
    drop(sock);

    let hierarchy = kernel
        .register_cgroup_hierarchy("cpu", &["cpu"])
        .expect("register failed");
    let child = kernel
        .cgroup_registry()
        .create_child(hierarchy.root(), "app")
        .expect("create_child failed");
    kernel.migrate_cgroup(&app, &child).expect("migrate failed");

    let mut image = Vec::new();
    kernel.pause();
    kernel
        .save_to(&mut image, None, &MemorySaveOpts::default())
        .expect("save failed");
    shutdown_paused(&kernel);

    let restored = Fakes::new();
    let kernel = Kernel::load_from(
        restored.deps(),
        &mut Cursor::new(image),
        None,
        restore_args(2),
    )
    .expect("load failed");
    let root = kernel.root_pid_namespace();
    let app = kernel
        .task_set()
        .thread_group_with_id(root, app_id)
        .expect("app missing")
        .leader()
        .expect("no leader");
    let init = kernel
        .task_set()
        .thread_group_with_id(root, init_id)
        .expect("init missing")
        .leader()
        .expect("no leader");

    let fds = app.fd_table().expect("no FD table");
    assert_eq!(fds.get(log_fd).map(|f| f.id()), Some(FileId(41)));
    assert_eq!(fds.get(sock_fd).map(|f| f.id()), Some(FileId(42)));
    let reopened = restored.vfs.restored_files();
    assert_eq!(reopened.iter().filter(|id| **id == FileId(42)).count(), 1);

    let sockets = kernel.list_sockets();
    assert_eq!(sockets.len(), 1);
    assert_eq!(sockets[0].id, 0);
    assert_eq!(sockets[0].socket().map(|s| s.id()), Some(FileId(42)));

    let hierarchy = kernel
        .cgroup_registry()
        .hierarchy_for_controller("cpu")
        .expect("hierarchy missing");
    let child = hierarchy.root().child("app").expect("child cgroup missing");
    assert!(child.contains(app.key()));
    assert_eq!(child.member_count(), 1);
    assert!(hierarchy.root().contains(init.key()));
    assert!(!hierarchy.root().contains(app.key()));
    assert!(app
        .cgroups()
        .get(&hierarchy.id())
        .is_some_and(|node| node.id() == child.id()));
    shutdown(&kernel);
}

/// Test: saving a restored kernel reproduces the image it came from
#[test]
fn test_save_of_restored_kernel_is_identical() {
    let fakes = Fakes::new();
    let (kernel, _, app_id) = running_kernel(&fakes);
    let app = kernel
        .task_set()
        .thread_group_with_id(kernel.root_pid_namespace(), app_id)
        .expect("app missing");
    let fds = app.leader().and_then(|t| t.fd_table()).expect("no FD table");
    let sock: Arc<dyn FileDescription> = FakeFile::socket(7, "listener");
    fds.new_fd(Arc::clone(&sock), 0, false, kernel.max_fd_limit() as i32)
        .expect("new_fd failed");
    kernel.record_socket(&sock);
    kernel
        .register_cgroup_hierarchy("memory", &["memory"])
        .expect("register failed");

    let mut first = Vec::new();
    kernel.pause();
    app.send_signal(SignalInfo::kernel(Signal::SIGUSR2))
        .expect("signal failed");
    kernel
        .save_to(&mut first, None, &MemorySaveOpts::default())
        .expect("save failed");
    shutdown_paused(&kernel);

    let kernel = Kernel::load_from(
        Fakes::new().deps(),
        &mut Cursor::new(first.clone()),
        None,
        restore_args(2),
    )
    .expect("load failed");
    let mut second = Vec::new();
    kernel.pause();
    kernel
        .save_to(&mut second, None, &MemorySaveOpts::default())
        .expect("second save failed");
    shutdown_paused(&kernel);

    assert_eq!(first.len(), second.len());
    assert!(first == second, "restored kernel saved a different image");
}

/// Test: a checkpoint from a CPU the host cannot emulate is rejected before
/// any state is rebuilt
#[test]
fn test_cpu_mismatch_is_rejected() {
    let fakes = Fakes::new();
    let (kernel, _, _) = running_kernel(&fakes);
    let mut image = Vec::new();
    kernel.pause();
    kernel
        .save_to(&mut image, None, &MemorySaveOpts::default())
        .expect("save failed");
    shutdown_paused(&kernel);

    let other_host = Fakes::with_faults(FaultPlan::new().with_fault(
        CheckpointFault::HostFeatures(FeatureSet::new("AuthenticAMD", ["sse2"])),
    ));
    let err = Kernel::load_from(
        other_host.deps(),
        &mut Cursor::new(image),
        None,
        restore_args(2),
    )
    .unwrap_err();
    assert!(matches!(err, KernelError::HostIncompatible(_)));
    assert!(other_host.loader.restored().is_empty());
    assert!(other_host.vfs.complete_restores().is_empty());
    assert_eq!(other_host.memory_file.loads(), 0);
}

#[test]
fn test_memory_load_failure_names_stage() {
    let fakes = Fakes::new();
    let (kernel, _, _) = running_kernel(&fakes);
    let mut image = Vec::new();
    kernel.pause();
    kernel
        .save_to(&mut image, None, &MemorySaveOpts::default())
        .expect("save failed");
    shutdown_paused(&kernel);

    let restored = Fakes::with_faults(
        FaultPlan::new().with_fault(CheckpointFault::FailLoads { count: 1 }),
    );
    let err = Kernel::load_from(
        restored.deps(),
        &mut Cursor::new(image),
        None,
        restore_args(2),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        KernelError::Checkpoint {
            stage: CheckpointStage::MemoryFiles,
            ..
        }
    ));
    assert_eq!(restored.faults.injected(), 1);
}

/// Test: with host cores exposed, a restore may not add cores
#[test]
fn test_use_host_cores_blocks_core_increase() {
    let fakes = Fakes::new();
    let kernel = Kernel::init(
        fakes
            .init_args(2, ManualClocks::new(1_000_000))
            .with_use_host_cores(true),
        fakes.deps(),
    )
    .expect("kernel init failed");
    let cores = kernel.application_cores();
    assert!(cores > 2);
    kernel
        .create_process(process_args(&kernel, &["/sbin/init"]))
        .expect("create init failed");
    let mut image = Vec::new();
    kernel.pause();
    kernel
        .save_to(&mut image, None, &MemorySaveOpts::default())
        .expect("save failed");
    shutdown_paused(&kernel);

    let err = Kernel::load_from(
        Fakes::new().deps(),
        &mut Cursor::new(image.clone()),
        None,
        restore_args(cores + 4),
    )
    .unwrap_err();
    assert!(matches!(err, KernelError::HostIncompatible(_)));

    let kernel = Kernel::load_from(
        Fakes::new().deps(),
        &mut Cursor::new(image),
        None,
        restore_args(cores),
    )
    .expect("load failed");
    assert_eq!(kernel.application_cores(), cores);
    shutdown(&kernel);
}

/// Test: checkpoint without resume records success and ends the sandbox
#[test]
fn test_checkpoint_then_exit() {
    let fakes = Fakes::new();
    let (kernel, _, _) = running_kernel(&fakes);
    let init = kernel.global_init().expect("no init");

    let mut image = Vec::new();
    kernel
        .checkpoint(&mut image, None, CheckpointOptions::default())
        .expect("checkpoint failed");
    kernel.wait_exited();

    assert_eq!(kernel.save_status(), (true, false, None));
    assert_eq!(init.exit_status(), Some(WaitStatus::exited(0)));
    assert_eq!(kernel.checkpoint_generation().get(), 1);
    assert!(!kernel.is_paused());
}

/// Test: checkpoint with resume leaves the sandbox running
#[test]
fn test_checkpoint_and_resume() {
    let fakes = Fakes::new();
    let (kernel, _, _) = running_kernel(&fakes);
    let mut image = Vec::new();
    kernel
        .checkpoint(
            &mut image,
            None,
            CheckpointOptions {
                resume: true,
                ..CheckpointOptions::default()
            },
        )
        .expect("checkpoint failed");

    assert!(!kernel.is_paused());
    assert_eq!(kernel.save_status(), (false, false, None));
    assert_eq!(fakes.vfs.before_resumes(), 1);
    assert!(kernel.global_init().is_some_and(|init| !init.has_exited()));
    shutdown(&kernel);
}

/// Test: a failed memory save is recorded and the kernel keeps running
#[test]
fn test_failed_save_is_recorded() {
    let fakes = Fakes::with_faults(
        FaultPlan::new().with_fault(CheckpointFault::FailSaves { count: 1 }),
    );
    let (kernel, _, _) = running_kernel(&fakes);
    let mut image = Vec::new();
    let err = kernel
        .checkpoint(&mut image, None, CheckpointOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        KernelError::Checkpoint {
            stage: CheckpointStage::MemoryFiles,
            ..
        }
    ));

    let (saved, autosaved, recorded) = kernel.save_status();
    assert!(!saved && !autosaved);
    assert_eq!(recorded, Some(err));
    assert!(!kernel.is_paused());
    assert!(kernel.global_init().is_some_and(|init| !init.has_exited()));
    shutdown(&kernel);
}

fn shutdown_paused(kernel: &Kernel) {
    kernel.kill(WaitStatus::exited(0));
    kernel.unpause();
    kernel.wait_exited();
}
