//! Process Lifecycle Tests
//!
//! Validates process creation, starting, exit and the pause protocol with
//! tasks running on real threads.

use core_types::{Errno, Signal, WaitStatus};
use emu_kernel::test_utils::process_args;
use emu_kernel::CloneOptions;
use kernel_api::{AppEvent, KernelError, Loader};
use tests_resilience::{boot, eventually, shutdown, spawn_process};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test: a started process runs until it exits the group
///
/// This validates that:
/// 1. The first process becomes global init with ID 1
/// 2. The loader sees the executable named by argv[0]
/// 3. The exit code reaches the thread group and the kernel drains
#[test]
fn test_process_runs_to_exit() {
    init_logging();
    let (fakes, kernel) = boot();
    fakes.platform.set_default_script(vec![AppEvent::Continue, AppEvent::ExitGroup(7)]);

    let (tg, tgid) = kernel
        .create_process(process_args(&kernel, &["/bin/true", "-v"]))
        .expect("create_process failed");
    assert_eq!(tgid.0, 1);
    assert!(kernel.global_init().is_some_and(|init| init.uid() == tg.uid()));
    assert_eq!(tg.leader().map(|t| t.name()), Some("true".to_string()));

    kernel.start().expect("start failed");
    assert_eq!(tg.wait_exited(), WaitStatus::exited(7));
    kernel.wait_exited();

    let loads = fakes.loader.loads();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].filename, "/bin/true");
    assert_eq!(loads[0].argv, vec!["/bin/true".to_string(), "-v".to_string()]);
    assert!(fakes.platform.switches() >= 2);
    assert_eq!(kernel.task_set().live_count(), 0);
}

#[test]
fn test_relative_argv0_is_rejected() {
    let (fakes, kernel) = boot();
    let err = kernel
        .create_process(process_args(&kernel, &["bin/true"]))
        .unwrap_err();
    assert!(matches!(err, KernelError::ProcessCreation(_)));
    assert!(fakes.loader.loads().is_empty());
    assert!(kernel.global_init().is_none());
}

#[test]
fn test_missing_executable_fails_creation() {
    let (fakes, kernel) = boot();
    fakes.loader.set_missing("/bin/missing");
    let err = kernel
        .create_process(process_args(&kernel, &["/bin/missing"]))
        .unwrap_err();
    match err {
        KernelError::Load(load) => assert_eq!(load.errno, Errno::ENOENT),
        other => panic!("unexpected error: {}", other),
    }
    assert!(kernel.task_set().tasks().is_empty());
}

#[test]
fn test_start_twice_fails() {
    let (_fakes, kernel) = boot();
    kernel.start().expect("first start failed");
    assert!(matches!(kernel.start(), Err(KernelError::AlreadyStarted)));
    shutdown(&kernel);
}

/// Test: pauses nest and tasks stay stopped until the last unpause
#[test]
fn test_nested_pause() {
    init_logging();
    let (fakes, kernel) = boot();
    let (tg, _) = kernel
        .create_process(process_args(&kernel, &["/bin/sleep"]))
        .expect("create_process failed");
    kernel.start().expect("start failed");
    let leader = tg.leader().expect("no leader");
    assert!(eventually(|| fakes.platform.switches() > 0));

    kernel.pause();
    kernel.pause();
    assert!(kernel.is_paused());
    assert!(fakes.platform.interrupts(leader.key()) > 0);

    kernel.unpause();
    assert!(kernel.is_paused());
    kernel.unpause();
    assert!(!kernel.is_paused());

    shutdown(&kernel);
    assert_eq!(tg.exit_status(), Some(WaitStatus::exited(0)));
}

#[test]
#[should_panic]
fn test_unpause_without_pause_panics() {
    let (_fakes, kernel) = boot();
    kernel.unpause();
}

/// Test: kill releases tasks that never started
#[test]
fn test_kill_before_start_discards_tasks() {
    let (_fakes, kernel) = boot();
    let (tg, _) = kernel
        .create_process(process_args(&kernel, &["/bin/init"]))
        .expect("create_process failed");
    assert_eq!(kernel.task_set().live_count(), 1);

    shutdown(&kernel);
    assert_eq!(kernel.task_set().live_count(), 0);
    assert!(tg.has_exited());
    assert!(kernel
        .create_process(process_args(&kernel, &["/bin/late"]))
        .is_err());
}

/// Test: a forked child joins its parent's process group and session
#[test]
fn test_fork_child_shares_process_group() {
    let (_fakes, kernel) = boot();
    let (tg, tgid) = spawn_process(&kernel, &["/bin/sh"]).expect("spawn failed");
    let leader = tg.leader().expect("no leader");

    let child = leader
        .clone_task(kernel.task_set(), CloneOptions::fork())
        .expect("fork failed");
    let child_tg = child.thread_group();
    assert_ne!(child_tg.uid(), tg.uid());
    assert_eq!(child_tg.parent().map(|p| p.uid()), Some(tg.uid()));
    assert_eq!(
        child_tg.process_group().map(|pg| pg.id()),
        tg.process_group().map(|pg| pg.id())
    );
    assert_eq!(
        child_tg.session().map(|s| s.id()),
        tg.session().map(|s| s.id())
    );

    let pgid = tg
        .process_group()
        .and_then(|pg| kernel.task_set().id_of_process_group(&pg, kernel.root_pid_namespace()));
    assert_eq!(pgid, Some(tgid));

    child.start(kernel.task_set()).expect("child start failed");
    shutdown(&kernel);
}

/// Test: a new thread is killed when another thread of its group execs
#[test]
fn test_exec_kills_sibling_threads() {
    let (fakes, kernel) = boot();
    let (tg, _) = spawn_process(&kernel, &["/bin/server"]).expect("spawn failed");
    let leader = tg.leader().expect("no leader");
    let thread = leader
        .clone_task(kernel.task_set(), CloneOptions::thread())
        .expect("clone failed");
    thread.start(kernel.task_set()).expect("thread start failed");
    assert_eq!(tg.task_count(), 2);

    let image = fakes
        .loader
        .load_task_image(&fakes.loader.loads()[0])
        .expect("load failed");
    leader.begin_exec(image);

    assert!(eventually(|| tg.task_count() == 1));
    assert!(eventually(|| !leader.is_exec_stopped()));
    assert!(thread.has_exited());
    assert_eq!(thread.exit_status(), Some(WaitStatus::signaled(Signal::SIGKILL)));
    shutdown(&kernel);
}
