//! Integration tests for Unix worker process management
//!
//! These tests verify that the Unix process layer correctly:
//! - Creates workers in their own process groups (via setsid)
//! - Terminates entire process groups with signals
//! - Handles edge cases and race conditions properly

#![cfg(unix)]
#![allow(unsafe_code)] // Required for libc calls in tests

use muster_core::process::{
    OutputFiles, WorkerChild, decode_exit_status, is_pid_alive, signal_group, signal_pid,
    spawn_worker,
};
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::Duration;

fn spawn(program: &str, args: &[&str]) -> muster_core::Result<WorkerChild> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    spawn_worker(
        OsStr::new(program),
        &args,
        &HashMap::new(),
        &OutputFiles::inherit(),
    )
}

/// Test that spawned workers are in their own process group
#[tokio::test]
async fn test_process_group_isolation() {
    let child = spawn("sleep", &["1"]).expect("Failed to spawn sleep");

    // Get parent process group ID (us)
    let parent_pgid = unsafe { libc::getpgrp() };

    // Child PGID should be the same as its PID (since it's the group leader)
    assert_eq!(child.pid(), child.pgid());

    // Child PGID should be different from parent PGID
    assert_ne!(child.pgid() as i32, parent_pgid);

    // Clean up the sleep process
    let _ = signal_group(&child, Signal::SIGKILL);
}

/// Test SIGTERM handling
#[tokio::test]
async fn test_sigterm_termination() {
    let mut child = spawn("sleep", &["10"]).expect("Failed to spawn sleep");

    signal_group(&child, Signal::SIGTERM).expect("Failed to send SIGTERM");

    // sleep has no SIGTERM handler, so it should die to the signal
    let mut attempts = 0;
    loop {
        std::thread::sleep(Duration::from_millis(50));
        match child.try_wait() {
            Ok(Some(status)) => {
                assert_eq!(decode_exit_status(&status), (None, Some(libc::SIGTERM)));
                break;
            }
            Ok(None) => {
                attempts += 1;
                if attempts > 20 {
                    let _ = signal_group(&child, Signal::SIGKILL);
                    panic!("Process {} survived SIGTERM", child.pid());
                }
            }
            Err(e) => panic!("Error waiting for process {}: {}", child.pid(), e),
        }
    }
}

/// Test SIGKILL handling
#[tokio::test]
async fn test_sigkill_termination() {
    let mut child = spawn("sleep", &["10"]).expect("Failed to spawn sleep");
    let pid = child.pid();

    signal_group(&child, Signal::SIGKILL).expect("Failed to send SIGKILL");

    let mut attempts = 0;
    loop {
        std::thread::sleep(Duration::from_millis(50));

        match child.try_wait() {
            Ok(Some(status)) => {
                // Process has exited, killed by signal rather than a clean exit
                assert!(!status.success());
                break;
            }
            Ok(None) => {
                attempts += 1;
                if attempts > 20 {
                    // 1 second total
                    let _ = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
                    panic!("Process {} was not killed after SIGKILL within timeout", pid);
                }
            }
            Err(e) => {
                panic!("Error waiting for process {}: {}", pid, e);
            }
        }
    }
}

/// Test process group termination with child processes
#[tokio::test]
async fn test_process_group_tree_termination() {
    // Create a test shell script that spawns child processes
    let test_script = r#"#!/bin/bash
# Spawn some background processes
sleep 30 &
sleep 30 &
# Wait for signals
sleep 30
"#;

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let script_path = dir.path().join("worker_tree.sh");
    std::fs::write(&script_path, test_script).expect("Failed to write test script");

    // Make script executable
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script_path, perms).expect("Failed to set permissions");

    let child = spawn(script_path.to_str().unwrap(), &[]).expect("Failed to spawn script");
    let pgid = child.pgid();

    // Give it a moment to spawn child processes
    std::thread::sleep(Duration::from_millis(500));

    // Kill the entire process group
    signal_group(&child, Signal::SIGKILL).expect("Failed to kill process group");

    // Wait for the process group to be terminated, checking multiple times
    let mut attempts = 0;
    loop {
        std::thread::sleep(Duration::from_millis(100));
        let result = unsafe { libc::killpg(pgid as i32, 0) };

        if result == -1 {
            // Process group is gone, verify errno
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            // Could be ESRCH (no such process) or EPERM (process changed owner)
            assert!(
                errno == libc::ESRCH || errno == libc::EPERM,
                "Unexpected errno: {}",
                errno
            );
            break;
        }

        attempts += 1;
        if attempts > 10 {
            // Process group still exists, kill it again and accept a
            // successfully-sent signal as a pass
            if signal_group(&child, Signal::SIGKILL).is_ok() {
                break;
            }
            panic!(
                "Process group {} was not killed after multiple attempts",
                pgid
            );
        }
    }
}

/// Test that signals to an already-exited worker are handled gracefully
#[tokio::test]
async fn test_signal_exited_process_group() {
    let mut child = spawn("true", &[]).expect("Failed to spawn true");

    // Wait for it to exit
    let _ = child.wait().await;

    // Try to signal it (should succeed gracefully)
    assert!(signal_group(&child, Signal::SIGTERM).is_ok());
    assert!(signal_group(&child, Signal::SIGKILL).is_ok());
    assert!(signal_pid(child.pid(), Signal::SIGTERM).is_ok());
}

/// Test error handling for invalid commands
#[test]
fn test_spawn_invalid_command() {
    let result = spawn("this_command_definitely_does_not_exist_12345", &[]);
    assert!(result.is_err());

    match result.unwrap_err() {
        muster_core::CoreError::ProcessSpawn(_) => {} // Expected
        e => panic!("Expected ProcessSpawn error, got: {:?}", e),
    }
}

/// Test that liveness probes track a worker's lifetime
#[tokio::test]
async fn test_liveness_probe() {
    let mut child = spawn("sleep", &["5"]).expect("Failed to spawn sleep");
    assert!(is_pid_alive(child.pid()));

    signal_group(&child, Signal::SIGKILL).expect("Failed to kill group");
    let _ = child.wait().await;
    assert!(!is_pid_alive(child.pid()));
}

/// Helper function to verify process group membership
fn get_process_group_id(pid: u32) -> Result<u32, std::io::Error> {
    let pgid = unsafe { libc::getpgid(pid as i32) };
    if pgid == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(pgid as u32)
    }
}

/// Test that we can verify process group membership
#[tokio::test]
async fn test_process_group_verification() {
    let child = spawn("sleep", &["2"]).expect("Failed to spawn sleep");
    let pid = child.pid();

    // Verify the process is in its own group
    let pgid = get_process_group_id(pid).expect("Failed to get process group ID");
    assert_eq!(pgid, pid);

    // Clean up
    let _ = signal_group(&child, Signal::SIGKILL);
}

/// Test spawning multiple workers
#[tokio::test]
async fn test_multiple_processes() {
    let child1 = spawn("sleep", &["2"]).expect("Failed to spawn first sleep");
    let child2 = spawn("sleep", &["2"]).expect("Failed to spawn second sleep");

    // Should have different PIDs
    assert_ne!(child1.pid(), child2.pid());

    // Each should be in its own process group
    assert_eq!(child1.pid(), child1.pgid());
    assert_eq!(child2.pid(), child2.pgid());
    assert_ne!(child1.pgid(), child2.pgid());

    // Clean up both
    let _ = signal_group(&child1, Signal::SIGKILL);
    let _ = signal_group(&child2, Signal::SIGKILL);
}
