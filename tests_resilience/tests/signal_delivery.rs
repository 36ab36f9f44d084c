//! Signal Delivery Tests
//!
//! Validates the externally injected signal paths and what running tasks do
//! with the signals they receive.

use core_types::{Errno, SigAction, SigHandler, Signal, SignalInfo, WaitStatus};
use emu_kernel::test_utils::process_args;
use emu_kernel::CloneOptions;
use tests_resilience::{boot, eventually, shutdown, spawn_process};

/// Test: SIGTERM to a process group terminates every member
///
/// This validates that:
/// 1. A forked child is a member of its parent's process group
/// 2. Every member takes the signal and exits with its default action
///
/// A separate init runs first so the group under test never holds global
/// init, whose exit would SIGKILL the rest of the namespace.
#[test]
fn test_process_group_sigterm() {
    let (_fakes, kernel) = boot();
    kernel.start().expect("start failed");
    let (init, _) = spawn_process(&kernel, &["/bin/init"]).expect("init spawn failed");
    let (tg, _) = spawn_process(&kernel, &["/bin/sh"]).expect("spawn failed");
    let leader = tg.leader().expect("no leader");
    let child = leader
        .clone_task(kernel.task_set(), CloneOptions::fork())
        .expect("fork failed");
    child.start(kernel.task_set()).expect("child start failed");
    assert!(eventually(|| child.is_started()));
    let child_tg = child.thread_group().clone();

    let pg = tg.process_group().expect("no process group");
    kernel
        .send_external_signal_process_group(&pg, SignalInfo::kernel(Signal::SIGTERM))
        .expect("signal failed");

    assert_eq!(tg.wait_exited(), WaitStatus::signaled(Signal::SIGTERM));
    assert_eq!(child_tg.wait_exited(), WaitStatus::signaled(Signal::SIGTERM));
    assert!(!init.has_exited());
    shutdown(&kernel);
}

/// Test: one member refusing a group signal does not starve the others
///
/// The parent's real-time queue is full, so it refuses SIGRTMIN with
/// EAGAIN. Both forked children still get the signal and the refusal is
/// what the caller sees.
#[test]
fn test_process_group_signal_partial_failure() {
    let (_fakes, kernel) = boot();
    let (_init, _) = kernel
        .create_process(process_args(&kernel, &["/bin/init"]))
        .expect("init create failed");
    let (parent, _) = kernel
        .create_process(process_args(&kernel, &["/bin/sh"]))
        .expect("create_process failed");
    let leader = parent.leader().expect("no leader");
    let children: Vec<_> = (0..2)
        .map(|_| {
            leader
                .clone_task(kernel.task_set(), CloneOptions::fork())
                .expect("fork failed")
                .thread_group()
                .clone()
        })
        .collect();

    let rt = SignalInfo::kernel(Signal::SIGRTMIN);
    while parent.send_signal(rt).is_ok() {}
    for child in &children {
        assert!(!child.pending_signals().contains(Signal::SIGRTMIN));
    }

    let pg = parent.process_group().expect("no process group");
    let err = kernel
        .send_external_signal_process_group(&pg, rt)
        .expect_err("full queue accepted a signal");
    assert_eq!(err, Errno::EAGAIN);
    for child in &children {
        assert!(child.pending_signals().contains(Signal::SIGRTMIN));
    }
    shutdown(&kernel);
}

#[test]
fn test_external_sigurg_is_dropped() {
    let (_fakes, kernel) = boot();
    let (tg, _) = kernel
        .create_process(process_args(&kernel, &["/bin/init"]))
        .expect("create_process failed");

    kernel
        .send_external_signal(SignalInfo::kernel(Signal::SIGURG), "test")
        .expect("SIGURG failed");
    assert!(tg.pending_signals().is_empty());

    kernel
        .send_external_signal(SignalInfo::kernel(Signal::SIGUSR1), "test")
        .expect("SIGUSR1 failed");
    assert!(tg.pending_signals().contains(Signal::SIGUSR1));
    shutdown(&kernel);
}

#[test]
fn test_external_signal_without_init_fails() {
    let (_fakes, kernel) = boot();
    assert!(kernel
        .send_external_signal(SignalInfo::kernel(Signal::SIGTERM), "test")
        .is_err());
}

/// Test: a signal with a user handler goes to the platform instead of
/// ending the process
#[test]
fn test_user_handler_is_delivered() {
    let (fakes, kernel) = boot();
    let (tg, _) = kernel
        .create_process(process_args(&kernel, &["/bin/app"]))
        .expect("create_process failed");
    let leader = tg.leader().expect("no leader");
    tg.set_signal_action(
        Signal::SIGUSR1,
        SigAction {
            handler: SigHandler::User(0x4000),
            ..SigAction::default()
        },
    )
    .expect("sigaction failed");
    kernel.start().expect("start failed");

    kernel
        .send_external_signal_thread_group(&tg, SignalInfo::kernel(Signal::SIGUSR1))
        .expect("signal failed");
    assert!(eventually(|| fakes
        .platform
        .delivered()
        .contains(&(leader.key(), Signal::SIGUSR1.0))));
    assert!(!tg.has_exited());
    shutdown(&kernel);
}

#[test]
fn test_container_signal_reaches_only_its_container() {
    let (_fakes, kernel) = boot();
    let (first, _) = kernel
        .create_process(process_args(&kernel, &["/bin/a"]).with_container_id("alpha"))
        .expect("create alpha failed");
    let (second, _) = kernel
        .create_process(process_args(&kernel, &["/bin/b"]).with_container_id("beta"))
        .expect("create beta failed");

    kernel
        .send_container_signal("beta", SignalInfo::kernel(Signal::SIGUSR2))
        .expect("signal failed");
    assert!(first.pending_signals().is_empty());
    assert!(second.pending_signals().contains(Signal::SIGUSR2));
    shutdown(&kernel);
}

/// Test: a container signal still reaches every member when one refuses it
#[test]
fn test_container_signal_reports_refusal_after_delivering_rest() {
    let (_fakes, kernel) = boot();
    let (full, _) = kernel
        .create_process(process_args(&kernel, &["/bin/a"]).with_container_id("alpha"))
        .expect("create full failed");
    let (open, _) = kernel
        .create_process(process_args(&kernel, &["/bin/b"]).with_container_id("alpha"))
        .expect("create open failed");

    let rt = SignalInfo::kernel(Signal::SIGRTMIN);
    while full.send_signal(rt).is_ok() {}
    assert_eq!(kernel.send_container_signal("alpha", rt), Err(Errno::EAGAIN));
    assert!(open.pending_signals().contains(Signal::SIGRTMIN));
    shutdown(&kernel);
}
