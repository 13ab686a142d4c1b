//! Integration tests for runtrack-core.
//!
//! These run the whole lifecycle against a real recorder executable:
//! gate → run context → finalize → recorder subprocess.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use runtrack_core::config::{RECORDER_NAME, vars};
use runtrack_core::gate::HostFacts;
use runtrack_core::{
    BuildVariant, Collaborators, Config, MemEnv, Recorder, RejectReason, Shim, argv,
};

/// Install a recorder that appends its arguments, one invocation per line,
/// to `<install>/records`.
fn install_recorder() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let libexec = dir.path().join("libexec");
    fs::create_dir(&libexec).unwrap();
    let script = libexec.join(RECORDER_NAME);
    fs::write(
        &script,
        "#!/bin/sh\necho \"$*\" >> \"$(dirname \"$0\")/../records\"\n",
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    dir
}

fn records(install: &Path) -> Vec<String> {
    fs::read_to_string(install.join("records"))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

fn shim_at(install: &Path, env: MemEnv) -> Shim {
    let mut config = Config::for_variant(BuildVariant::Preload).with_install_dir(install);
    config.scalar_tracking = true;
    config.mpi_tracking = true;
    config.gpu_tracking = false;
    let recorder = Recorder::new(config.clone(), Some(Duration::from_secs(30)));
    Shim::new(config, Box::new(env), Collaborators::default(), Box::new(recorder))
}

fn facts() -> HostFacts {
    HostFacts {
        nodename: Some("n001.testcluster.example.org".into()),
        exec_path: PathBuf::from("/home/user/apps/bin/model"),
    }
}

fn tracking() -> MemEnv {
    MemEnv::new()
        .with(vars::EXECUTABLE_TRACKING, "yes")
        .with(vars::PATH, "/usr/bin:/bin")
}

fn flag<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let mut words = line.split(' ');
    words.find(|w| *w == name)?;
    words.next()
}

#[test]
fn scalar_run_writes_a_single_record() {
    let install = install_recorder();
    let mut shim = shim_at(install.path(), tracking());
    let args = ["model", "--steps", "100"];
    shim.init_with(&args, &facts()).unwrap();
    assert!(records(install.path()).is_empty());
    shim.finalize();

    let lines = records(install.path());
    assert_eq!(lines.len(), 1, "{lines:?}");
    let line = &lines[0];
    assert!(line.starts_with("--interfaceV 5 --pid "), "{line}");
    assert_eq!(flag(line, "--kind"), Some("scalar"));
    assert_eq!(flag(line, "--ntasks"), Some("1"));
    assert_eq!(flag(line, "--syshost"), Some("testcluster"));
    assert_eq!(flag(line, "--exec"), Some("/home/user/apps/bin/model"));
    assert_eq!(flag(line, "--path"), Some("/usr/bin:/bin"));
    assert_ne!(flag(line, "--end"), Some("0"));
    let payload = flag(line, "--").unwrap();
    assert_eq!(argv::decode_args(payload).unwrap(), args);
}

#[test]
fn mpi_run_writes_start_and_end_records() {
    let install = install_recorder();
    let env = tracking()
        .with("SLURM_PROCID", "0")
        .with("SLURM_STEP_NUM_TASKS", "128");
    let mut shim = shim_at(install.path(), env);
    shim.init_with(&["model"], &facts()).unwrap();
    assert_eq!(records(install.path()).len(), 1);
    shim.finalize();

    let lines = records(install.path());
    assert_eq!(lines.len(), 2, "{lines:?}");
    assert_eq!(flag(&lines[0], "--end"), Some("0"));
    assert_ne!(flag(&lines[1], "--end"), Some("0"));
    for line in &lines {
        assert_eq!(flag(line, "--kind"), Some("MPI"));
        assert_eq!(flag(line, "--ntasks"), Some("128"));
    }
    assert_eq!(flag(&lines[0], "--uuid"), flag(&lines[1], "--uuid"));
}

#[test]
fn non_root_rank_writes_nothing() {
    let install = install_recorder();
    let env = tracking()
        .with("PMI_RANK", "7")
        .with("PMI_SIZE", "8")
        .with(vars::RUN_UUID, "from-parent");
    let mut shim = shim_at(install.path(), env);
    assert_eq!(shim.init_with(&["model"], &facts()), Err(RejectReason::NonzeroRank));
    assert!(shim.env().get(vars::RUN_UUID).is_none());
    shim.finalize();
    assert!(records(install.path()).is_empty());
}

#[test]
fn missing_recorder_never_fails_the_host() {
    let install = tempfile::tempdir().unwrap();
    let env = tracking().with("OMPI_COMM_WORLD_SIZE", "2");
    let mut shim = shim_at(install.path(), env);
    assert_eq!(
        shim.init_with(&["model"], &facts()),
        Err(RejectReason::RecorderMissing)
    );
    shim.finalize();
    assert_eq!(shim.reject_reason(), Some(RejectReason::RecorderMissing));
}

#[test]
fn hostile_arguments_reach_the_recorder_intact() {
    let install = install_recorder();
    let mut shim = shim_at(install.path(), tracking());
    let args = [
        "model",
        "$(touch /tmp/runtrack-should-not-exist)",
        "quote\" and 'single' and \\ back",
        "tab\there\nnewline",
        "ünïcödé",
    ];
    shim.init_with(&args, &facts()).unwrap();
    shim.finalize();

    assert!(!Path::new("/tmp/runtrack-should-not-exist").exists());
    let lines = records(install.path());
    assert_eq!(lines.len(), 1);
    let decoded = argv::decode_args(flag(&lines[0], "--").unwrap()).unwrap();
    assert_eq!(decoded, args);
}

#[test]
fn disabled_tracking_writes_nothing() {
    let install = install_recorder();
    let mut shim = shim_at(install.path(), MemEnv::new());
    assert_eq!(
        shim.init_with(&["model"], &facts()),
        Err(RejectReason::TrackingDisabled)
    );
    shim.finalize();
    assert!(records(install.path()).is_empty());
}
