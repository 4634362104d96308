// SPDX-License-Identifier: PMPL-1.0-or-later

//! Tests for the disk I/O burn injector

use chaos_agent::error::FaultError;
use chaos_agent::host::{Host, ProcessControl, Signal};
use chaos_agent::injector::diskio::{BurnInjector, BURN_KEY, MAX_BLOCK_KBYTES};
use chaos_agent::injector::{FaultDomain, Info, Injector, Registry};
use chaos_agent::testing::{memory_host, MemoryProcesses, MemoryTc, AGENT, TOOLS_DIR};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    processes: Arc<MemoryProcesses>,
    host: Host,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let processes = Arc::new(MemoryProcesses::new());
        let network = Arc::new(MemoryTc::with_interfaces(&["lo"]));
        let host = memory_host(processes.clone(), network);
        Self {
            processes,
            host,
            dir: TempDir::new().unwrap(),
        }
    }

    fn burn_dir(&self) -> PathBuf {
        let dir = self.dir.path().join("burn");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn injector(&self, info: Info, mode: &str, block: &str, dir: &Path) -> Box<dyn Injector> {
        let mut injector = Registry::builtin()
            .create(FaultDomain::Diskio, "burn", info, self.host.clone())
            .expect("diskio/burn is registered");
        injector
            .load_args(json!({ "mode": mode, "block": block, "dir": dir.display().to_string() }))
            .unwrap();
        injector.set_default();
        injector
    }
}

fn sentinel(dir: &Path, uid: &str) -> PathBuf {
    PathBuf::from(format!("{}/chaosmeta_diskburn_{}", dir.display(), uid))
}

#[test]
fn test_write_burn_launches_helper_and_recovers() {
    let fx = Fixture::new();
    let dir = fx.burn_dir();
    let mut injector = fx.injector(Info::new("u1"), "write", "4MB", &dir);

    injector.validate().expect("arguments are valid");
    injector.inject().expect("helper launches");

    let spawned = fx.processes.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].program, Path::new(TOOLS_DIR).join(BURN_KEY));
    let file = sentinel(&dir, "u1");
    assert_eq!(
        spawned[0].args,
        vec![
            "u1".to_string(),
            file.display().to_string(),
            "write".to_string(),
            "4096K".to_string(),
            "256".to_string(),
            "direct".to_string(),
            "0".to_string(),
        ]
    );
    assert!(fx.processes.exists("chaosmeta_diskburn u1").unwrap());
    assert_eq!(injector.runtime()["pid"], json!(spawned[0].pid));

    // The helper creates its target file once it starts writing.
    fs::write(&file, b"burn").unwrap();

    injector.recover().expect("recover succeeds");
    assert!(!file.exists(), "sentinel file should be removed");
    assert!(fx.processes.running().is_empty());
    assert_eq!(
        fx.processes.kills(),
        vec![("chaosmeta_diskburn u1".to_string(), Signal::Kill)]
    );
}

#[test]
fn test_count_times_block_covers_ceiling() {
    let fx = Fixture::new();
    let dir = fx.burn_dir();
    for block in ["1", "4KB", "512K", "1MB", "4MB", "64M", "1024MB"] {
        let mut injector = BurnInjector::new(Info::new("c"), fx.host.clone());
        injector.args.block = block.to_string();
        injector.args.dir = dir.display().to_string();
        let (kbytes, count) = injector.burn_count().unwrap();
        assert_eq!(kbytes * count, MAX_BLOCK_KBYTES, "block {}", block);
    }
}

#[test]
fn test_block_outside_range_is_rejected() {
    let fx = Fixture::new();
    let dir = fx.burn_dir();
    for block in ["0", "0MB", "2048MB", "1048577", "3KB", "big", "-1"] {
        let injector = fx.injector(Info::new("b"), "read", block, &dir);
        let err = injector.validate().unwrap_err();
        assert!(
            matches!(err, FaultError::Validation { arg: "block", .. }),
            "block {} gave {:?}",
            block,
            err
        );
    }
    assert!(fx.processes.spawned().is_empty());
}

#[test]
fn test_validation_names_offending_argument() {
    let fx = Fixture::new();
    let dir = fx.burn_dir();

    let missing = fx.dir.path().join("missing");
    let err = fx
        .injector(Info::new("v"), "write", "1MB", &missing)
        .validate()
        .unwrap_err();
    assert!(matches!(err, FaultError::Validation { arg: "dir", .. }));

    let file = fx.dir.path().join("plain-file");
    fs::write(&file, b"x").unwrap();
    let err = fx
        .injector(Info::new("v"), "write", "1MB", &file)
        .validate()
        .unwrap_err();
    assert!(err.to_string().contains("not a directory"));

    let err = fx
        .injector(Info::new("v"), "append", "1MB", &dir)
        .validate()
        .unwrap_err();
    assert!(matches!(err, FaultError::Validation { arg: "mode", .. }));

    let err = fx
        .injector(Info::new("v").with_timeout("later"), "write", "1MB", &dir)
        .validate()
        .unwrap_err();
    assert!(matches!(err, FaultError::Validation { arg: "timeout", .. }));

    assert!(fx.processes.spawned().is_empty(), "validation must not mutate");
}

#[test]
fn test_defaults_fill_mode_block_dir_and_uid() {
    let fx = Fixture::new();
    let mut injector = BurnInjector::new(Info::default(), fx.host.clone());
    injector.set_default();
    assert_eq!(injector.args.mode, "read");
    assert_eq!(injector.args.block, "10MB");
    assert_eq!(injector.args.dir, "/tmp");
    assert_eq!(injector.info().uid.len(), 16);
}

#[test]
fn test_failed_launch_cleans_up_and_reports_launch_error() {
    let fx = Fixture::new();
    let dir = fx.burn_dir();
    fx.processes.fail_spawn();
    let mut injector = fx.injector(Info::new("f1"), "write", "1MB", &dir);

    // Leftover from a previous run with the same uid.
    let file = sentinel(&dir, "f1");
    fs::write(&file, b"stale").unwrap();

    let err = injector.inject().unwrap_err();
    assert!(matches!(err, FaultError::Injection(_)));
    assert!(err.to_string().contains(BURN_KEY));
    assert!(!file.exists(), "self-recovery removes the sentinel");

    // Self-recovery counts as the one recovery.
    fs::write(&file, b"again").unwrap();
    injector.recover().unwrap();
    assert!(file.exists());
}

#[test]
fn test_recover_is_idempotent() {
    let fx = Fixture::new();
    let dir = fx.burn_dir();
    let mut injector = fx.injector(Info::new("i1"), "read", "1MB", &dir);
    injector.inject().unwrap();

    injector.recover().unwrap();
    injector.recover().unwrap();
    assert_eq!(fx.processes.kills().len(), 1);
}

#[test]
fn test_recover_without_inject_is_harmless() {
    let fx = Fixture::new();
    let dir = fx.burn_dir();
    let mut injector = fx.injector(Info::new("never"), "read", "1MB", &dir);
    injector.recover().expect("nothing to undo is not an error");
    assert!(fx.processes.kills().is_empty());
}

#[test]
fn test_recover_from_uid_and_args_alone() {
    let fx = Fixture::new();
    let dir = fx.burn_dir();
    let mut first = fx.injector(Info::new("r1"), "write", "2MB", &dir);
    first.inject().unwrap();
    let file = sentinel(&dir, "r1");
    fs::write(&file, b"burn").unwrap();

    // A new process only knows the uid and the serialized arguments.
    let mut second = Registry::builtin()
        .create(FaultDomain::Diskio, "burn", Info::new("r1"), fx.host.clone())
        .unwrap();
    second.load_args(first.args()).unwrap();
    second.set_default();
    second.recover().unwrap();

    assert!(!file.exists());
    assert!(fx.processes.running().is_empty());
}

#[test]
fn test_instances_do_not_collide() {
    let fx = Fixture::new();
    let dir = fx.burn_dir();
    let mut a = fx.injector(Info::new("a1"), "write", "1MB", &dir);
    let mut b = fx.injector(Info::new("b1"), "write", "1MB", &dir);
    a.inject().unwrap();
    b.inject().unwrap();
    fs::write(sentinel(&dir, "a1"), b"a").unwrap();
    fs::write(sentinel(&dir, "b1"), b"b").unwrap();

    a.recover().unwrap();
    assert!(!sentinel(&dir, "a1").exists());
    assert!(sentinel(&dir, "b1").exists());
    assert!(fx.processes.exists("chaosmeta_diskburn b1").unwrap());
}

#[test]
fn test_recover_spares_instance_whose_uid_extends_ours() {
    let fx = Fixture::new();
    let dir = fx.burn_dir();
    let mut short = fx.injector(Info::new("a"), "write", "1MB", &dir);
    let mut long = fx.injector(Info::new("a-1"), "write", "1MB", &dir);
    short.inject().unwrap();
    long.inject().unwrap();

    short.recover().unwrap();
    assert!(!fx.processes.exists("chaosmeta_diskburn a").unwrap());
    assert!(fx.processes.exists("chaosmeta_diskburn a-1").unwrap());
    let running = fx.processes.running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].args[0], "a-1");

    long.recover().unwrap();
    assert!(fx.processes.running().is_empty());
}

#[test]
fn test_timeout_reaches_helper_and_schedules_recovery() {
    let fx = Fixture::new();
    let dir = fx.burn_dir();
    let mut injector = fx.injector(Info::new("t1").with_timeout("90s"), "write", "1MB", &dir);
    injector.validate().unwrap();
    injector.inject().unwrap();
    assert_eq!(fx.processes.spawned()[0].args.last().unwrap(), "90");

    injector.delay_recover(90).unwrap();
    let spawned = fx.processes.spawned();
    let scheduled = &spawned[1];
    assert_eq!(scheduled.program, PathBuf::from(AGENT));
    assert_eq!(&scheduled.args[..5], ["recover", "diskio", "burn", "--uid", "t1"]);
    assert_eq!(scheduled.args[5], "--args");
    let args: serde_json::Value = serde_json::from_str(&scheduled.args[6]).unwrap();
    assert_eq!(args["mode"], "write");
    assert_eq!(&scheduled.args[7..], ["--after", "90"]);
}
