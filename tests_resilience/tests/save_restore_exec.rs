//! Save/Restore Helper Tests
//!
//! Validates that the configured helper binary runs inside the sandbox
//! around each checkpoint phase and that its failures abort the phase.

use emu_kernel::checkpoint::exec::MODE_ENV;
use emu_kernel::test_utils::{process_args, Fakes, ManualClocks};
use emu_kernel::{CheckpointOptions, Kernel, RestoreArgs, SaveRestoreExecConfig};
use kernel_api::{AppEvent, CheckpointStage, KernelError};
use lifecycle::Timeout;
use std::io::Cursor;
use std::sync::Arc;
use tests_resilience::shutdown;

const HELPER: &str = "/usr/bin/checkpoint-helper";

/// Modes the helper was loaded with, in order
fn helper_modes(fakes: &Fakes) -> Vec<String> {
    fakes
        .loader
        .loads()
        .into_iter()
        .filter(|load| load.filename == HELPER)
        .filter_map(|load| {
            load.envv
                .iter()
                .find_map(|env| env.strip_prefix(&format!("{}=", MODE_ENV)).map(String::from))
        })
        .collect()
}

/// A started kernel whose only process stays in the app; every other task
/// runs `helper_script`
fn kernel_with_helper(fakes: &Fakes, helper_script: Vec<AppEvent>, timeout: Timeout) -> Arc<Kernel> {
    let kernel = fakes.kernel().expect("kernel init failed");
    let (tg, _) = kernel
        .create_process(process_args(&kernel, &["/usr/bin/app"]))
        .expect("create app failed");
    let leader = tg.leader().expect("no leader");
    fakes.platform.script(leader.key(), [AppEvent::Continue]);
    fakes.platform.set_default_script(helper_script);
    kernel.set_save_restore_exec_config(Some(SaveRestoreExecConfig::new(
        vec![HELPER.to_string()],
        timeout,
    )));
    kernel.start().expect("start failed");
    kernel
}

/// Test: the helper runs before the save and after the resume
#[test]
fn test_helper_runs_around_resumed_checkpoint() {
    let fakes = Fakes::new();
    let kernel = kernel_with_helper(&fakes, vec![AppEvent::ExitGroup(0)], Timeout::from_secs(10));

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

    assert_eq!(helper_modes(&fakes), vec!["save", "resume"]);
    assert_eq!(kernel.checkpoint_generation().get(), 1);
    assert_eq!(kernel.task_set().thread_groups().len(), 1);
    shutdown(&kernel);
}

/// Test: the helper configuration survives a restore and runs in restore
/// mode once the kernel starts
#[test]
fn test_helper_runs_after_restore() {
    let fakes = Fakes::new();
    let kernel = kernel_with_helper(&fakes, vec![AppEvent::ExitGroup(0)], Timeout::from_secs(10));
    let mut image = Vec::new();
    kernel
        .checkpoint(&mut image, None, CheckpointOptions::default())
        .expect("checkpoint failed");
    kernel.wait_exited();

    let restored = Fakes::new();
    let kernel = Kernel::load_from(
        restored.deps(),
        &mut Cursor::new(image),
        None,
        RestoreArgs::new(2, ManualClocks::new(9_000_000)),
    )
    .expect("load failed");
    let config = kernel.save_restore_exec_config().expect("helper config lost");
    assert_eq!(config.argv, vec![HELPER.to_string()]);
    assert_eq!(config.timeout, Timeout::from_secs(10));

    for task in kernel.task_set().tasks() {
        restored.platform.script(task.key(), [AppEvent::Continue]);
    }
    restored.platform.set_default_script(vec![AppEvent::ExitGroup(0)]);
    kernel.start().expect("start failed");
    kernel.finish_restore().expect("finish_restore failed");

    assert_eq!(helper_modes(&restored), vec!["restore"]);
    shutdown(&kernel);
}

#[test]
fn test_failing_helper_aborts_checkpoint() {
    let fakes = Fakes::new();
    let kernel = kernel_with_helper(&fakes, vec![AppEvent::ExitGroup(3)], Timeout::from_secs(10));
    let mut image = Vec::new();
    let err = kernel
        .checkpoint(&mut image, None, CheckpointOptions::default())
        .unwrap_err();

    assert!(matches!(
        err,
        KernelError::Checkpoint {
            stage: CheckpointStage::SaveRestoreExec,
            ..
        }
    ));
    assert!(image.is_empty());
    assert!(!kernel.is_paused());
    assert_eq!(fakes.memory_file.saves(), 0);
    shutdown(&kernel);
}

#[test]
fn test_hung_helper_times_out() {
    let fakes = Fakes::new();
    let kernel = kernel_with_helper(&fakes, Vec::new(), Timeout::from_millis(50));
    let mut image = Vec::new();
    let err = kernel
        .checkpoint(&mut image, None, CheckpointOptions::default())
        .unwrap_err();

    assert!(matches!(
        err,
        KernelError::Checkpoint {
            stage: CheckpointStage::SaveRestoreExec,
            ..
        }
    ));
    assert!(err.to_string().contains("did not exit"));
    shutdown(&kernel);
}
