//! Hand-off of finished records to the external recorder executable.
//!
//! The recorder is run as an argument vector, never through a shell, with
//! `LD_PRELOAD` removed so it is not instrumented itself. The argv payload and
//! watermark are still base64 encoded on the command line.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::argv;
use crate::config::{Config, vars};
use crate::run::RunContext;

/// Failure to deliver a record.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("cannot find an executable recorder at {}", .0.display())]
    Missing(PathBuf),
    #[error("cannot start {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("waiting for {}: {source}", path.display())]
    Wait {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} did not finish within {timeout:?}; killed", path.display())]
    Timeout { path: PathBuf, timeout: Duration },
}

/// Which record of a run is being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Written at init for MPI runs; end time is the sentinel `0`.
    Start,
    /// Written at exit with start and end times.
    End,
}

/// Destination for run records.
pub trait RecordSink: Send {
    /// Whether records can be delivered at all.
    fn is_available(&mut self) -> bool;

    fn submit(&mut self, run: &RunContext, record: RecordKind) -> Result<(), DeliveryError>;
}

/// Recorder arguments in the order the recorder expects them.
pub fn record_args(config: &Config, run: &RunContext, record: RecordKind) -> Vec<String> {
    let end = match record {
        RecordKind::Start => "0".to_string(),
        RecordKind::End => format!("{:.4}", run.end_time),
    };
    let ngpus = match record {
        RecordKind::Start => 0,
        RecordKind::End => run.gpu_count,
    };
    let mut args = vec![
        "--interfaceV".to_string(),
        config.interface_version.clone(),
        "--pid".to_string(),
        run.pid.to_string(),
        "--ppid".to_string(),
        run.ppid.to_string(),
        "--syshost".to_string(),
        run.syshost.clone(),
        "--start".to_string(),
        format!("{:.4}", run.start_time),
        "--end".to_string(),
        end,
        "--exec".to_string(),
        run.exec_path.to_string_lossy().into_owned(),
        "--ntasks".to_string(),
        run.size.to_string(),
        "--kind".to_string(),
        run.kind.as_str().to_string(),
        "--uuid".to_string(),
        run.run_id.clone(),
        "--prob".to_string(),
        run.probability.to_string(),
        "--ngpus".to_string(),
        ngpus.to_string(),
        "--watermark".to_string(),
        run.watermark_encoded.clone(),
    ];
    if let Some(path) = &run.path_var {
        args.push("--path".to_string());
        args.push(path.clone());
    }
    if let Some(ld) = &run.ld_library_path_var {
        args.push("--ld_libpath".to_string());
        args.push(ld.clone());
    }
    args.push("--".to_string());
    args.push(run.argv.encoded.clone());
    args
}

/// Shell-equivalent rendering of an invocation, for tracing output only.
pub fn display_command(config: &Config, run: &RunContext, record: RecordKind) -> String {
    let mut args = record_args(config, run, record);
    // Show the decoded payload and quoted path instead of the transport forms.
    if let Some(last) = args.last_mut() {
        *last = run.argv.raw.clone();
    }
    let mut line = format!(
        "LD_LIBRARY_PATH=\"{}\" PATH=\"{}\" \"{}\"",
        config.recorder_ld_library_path,
        config.system_path,
        config.recorder.display()
    );
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        line.push(' ');
        match arg.as_str() {
            "--exec" => {
                iter.next();
                line.push_str(&format!("--exec \"{}\"", run.exec_quoted));
            }
            "--watermark" => {
                iter.next();
                line.push_str(&format!("--watermark \"{}\"", run.watermark));
            }
            _ => line.push_str(&arg),
        }
    }
    line
}

/// Runs the recorder executable.
pub struct Recorder {
    config: Config,
    timeout: Option<Duration>,
    available: Option<bool>,
}

impl Recorder {
    pub fn new(config: Config, timeout: Option<Duration>) -> Self {
        Self {
            config,
            timeout,
            available: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.recorder
    }

    fn command(&self, run: &RunContext, record: RecordKind) -> Command {
        let mut cmd = Command::new(&self.config.recorder);
        cmd.args(record_args(&self.config, run, record))
            .env_remove(vars::LD_PRELOAD)
            .env(vars::PATH, &self.config.system_path)
            .stdin(Stdio::null());
        if self.config.recorder_ld_library_path.is_empty() {
            cmd.env_remove(vars::LD_LIBRARY_PATH);
        } else {
            cmd.env(vars::LD_LIBRARY_PATH, &self.config.recorder_ld_library_path);
        }
        cmd
    }

    fn wait(&self, cmd: &mut Command) -> Result<ExitStatus, DeliveryError> {
        let path = &self.config.recorder;
        let mut child = cmd.spawn().map_err(|source| DeliveryError::Spawn {
            path: path.clone(),
            source,
        })?;
        let wait_err = |source| DeliveryError::Wait {
            path: path.clone(),
            source,
        };
        let Some(timeout) = self.timeout else {
            return child.wait().map_err(wait_err);
        };

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start.elapsed() >= timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(DeliveryError::Timeout {
                            path: path.clone(),
                            timeout,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(wait_err(e)),
            }
        }
    }
}

/// `access(path, X_OK)`.
pub fn is_executable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: `c_path` is a valid NUL-terminated string.
    unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 }
}

impl RecordSink for Recorder {
    fn is_available(&mut self) -> bool {
        *self
            .available
            .get_or_insert_with(|| is_executable(&self.config.recorder))
    }

    fn submit(&mut self, run: &RunContext, record: RecordKind) -> Result<(), DeliveryError> {
        if !self.is_available() {
            return Err(DeliveryError::Missing(self.config.recorder.clone()));
        }
        log::info!(
            "  Recording state at {} of {} user program:\n    {}",
            if record == RecordKind::Start { "beginning" } else { "end" },
            run.scale_kind,
            display_command(&self.config, run, record)
        );
        log::debug!("  len: {}, b64_cmd: {}", run.argv.encoded.len(), run.argv.encoded);
        let status = self.wait(&mut self.command(run, record))?;
        if !status.success() {
            log::debug!("  recorder exited with {status}");
        }
        Ok(())
    }
}

/// A sink that keeps every submission in memory. Clones share the same log.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    available: bool,
    records: Arc<Mutex<Vec<(RecordKind, RunContext)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            available: true,
            records: Arc::default(),
        }
    }

    /// A sink that reports the recorder as missing.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn records(&self) -> Vec<(RecordKind, RunContext)> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordSink for RecordingSink {
    fn is_available(&mut self) -> bool {
        self.available
    }

    fn submit(&mut self, run: &RunContext, record: RecordKind) -> Result<(), DeliveryError> {
        if !self.available {
            return Err(DeliveryError::Missing(PathBuf::from("<memory>")));
        }
        if let Ok(mut records) = self.records.lock() {
            records.push((record, run.clone()));
        }
        Ok(())
    }
}

/// Decoded payload of a recorder invocation, for diagnostics.
pub fn decode_payload(args: &[String]) -> Option<Vec<String>> {
    let pos = args.iter().position(|a| a == "--")?;
    argv::decode_args(args.get(pos + 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argv::{JsonQuoter, serialize};
    use crate::config::BuildVariant;
    use crate::run::RunKind;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn sample_run() -> RunContext {
        let args = ["./a.out", "-n", "say \"hi\""];
        RunContext {
            pid: 42,
            ppid: 1,
            run_id: "0b8e6a3e-2a4c-4a57-9c43-6a1bd1d3f9a0".into(),
            rank: 0,
            size: 1,
            kind: RunKind::Scalar,
            scale_kind: RunKind::Scalar,
            exec_path: PathBuf::from("/home/u/a.out"),
            exec_quoted: "/home/u/a.out".into(),
            argv: serialize(&args[..], &JsonQuoter).unwrap(),
            syshost: "frontera".into(),
            start_time: 1_700_000_000.25,
            end_time: 1_700_000_010.5,
            probability: 1.0,
            draw: 0.0,
            gpu_count: 2,
            watermark: "FALSE".into(),
            watermark_encoded: argv::encode(b"FALSE"),
            path_var: Some("/usr/bin".into()),
            ld_library_path_var: None,
            reject: None,
        }
    }

    #[test]
    fn end_record_args_in_contract_order() {
        let config = Config::for_variant(BuildVariant::Preload);
        let run = sample_run();
        let args = record_args(&config, &run, RecordKind::End);
        let flags: Vec<&str> = args
            .iter()
            .filter(|a| a.starts_with("--"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            flags,
            [
                "--interfaceV",
                "--pid",
                "--ppid",
                "--syshost",
                "--start",
                "--end",
                "--exec",
                "--ntasks",
                "--kind",
                "--uuid",
                "--prob",
                "--ngpus",
                "--watermark",
                "--path",
                "--",
            ]
        );
        let value = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].clone()
        };
        assert_eq!(value("--start"), "1700000000.2500");
        assert_eq!(value("--end"), "1700000010.5000");
        assert_eq!(value("--kind"), "scalar");
        assert_eq!(value("--prob"), "1");
        assert_eq!(value("--ngpus"), "2");
        assert_eq!(value("--path"), "/usr/bin");
        assert_eq!(
            decode_payload(&args).unwrap(),
            ["./a.out", "-n", "say \"hi\""]
        );
    }

    #[test]
    fn start_record_uses_zero_sentinel() {
        let config = Config::for_variant(BuildVariant::Preload);
        let args = record_args(&config, &sample_run(), RecordKind::Start);
        let i = args.iter().position(|a| a == "--end").unwrap();
        assert_eq!(args[i + 1], "0");
        let i = args.iter().position(|a| a == "--ngpus").unwrap();
        assert_eq!(args[i + 1], "0");
        assert!(!args.iter().any(|a| a == "--ld_libpath"));
    }

    #[test]
    fn display_command_shows_decoded_payload() {
        let config = Config::for_variant(BuildVariant::Preload);
        let line = display_command(&config, &sample_run(), RecordKind::End);
        assert!(line.starts_with("LD_LIBRARY_PATH=\""));
        assert!(line.contains("--exec \"/home/u/a.out\""));
        assert!(line.contains("--watermark \"FALSE\""));
        assert!(line.ends_with(r#"-- ["./a.out","-n","say \"hi\""]"#));
    }

    #[test]
    fn missing_recorder_is_reported_and_cached() {
        let config =
            Config::for_variant(BuildVariant::Preload).with_install_dir("/nonexistent/runtrack");
        let mut recorder = Recorder::new(config, None);
        assert!(!recorder.is_available());
        assert!(matches!(
            recorder.submit(&sample_run(), RecordKind::End),
            Err(DeliveryError::Missing(_))
        ));
    }

    fn install_script(body: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let libexec = dir.path().join("libexec");
        std::fs::create_dir(&libexec).unwrap();
        let script = libexec.join(crate::config::RECORDER_NAME);
        let mut f = std::fs::File::create(&script).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        drop(f);
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        dir
    }

    #[test]
    fn recorder_receives_arguments_without_preload() {
        let dir =
            install_script(r#"printf '%s\n' "$LD_PRELOAD|$PATH" "$@" > "$(dirname "$0")/out""#);
        let mut config = Config::for_variant(BuildVariant::Preload).with_install_dir(dir.path());
        config.system_path = "/usr/bin:/bin".into();
        let mut recorder = Recorder::new(config, None);
        recorder.submit(&sample_run(), RecordKind::End).unwrap();

        let out = std::fs::read_to_string(dir.path().join("libexec/out")).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "|/usr/bin:/bin");
        assert_eq!(lines[1], "--interfaceV");
        assert_eq!(lines[2], crate::config::INTERFACE_VERSION);
        assert!(lines.contains(&"0b8e6a3e-2a4c-4a57-9c43-6a1bd1d3f9a0"));
    }

    #[test]
    fn failing_recorder_is_not_an_error() {
        let dir = install_script("exit 3");
        let config = Config::for_variant(BuildVariant::Preload).with_install_dir(dir.path());
        let mut recorder = Recorder::new(config, None);
        assert!(recorder.submit(&sample_run(), RecordKind::End).is_ok());
    }

    #[test]
    fn hung_recorder_is_killed_after_timeout() {
        let dir = install_script("exec sleep 30");
        let config = Config::for_variant(BuildVariant::Preload).with_install_dir(dir.path());
        let mut recorder = Recorder::new(config, Some(Duration::from_millis(100)));
        let start = Instant::now();
        let r = recorder.submit(&sample_run(), RecordKind::End);
        assert!(matches!(r, Err(DeliveryError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn recording_sink_keeps_submissions() {
        let sink = RecordingSink::new();
        let mut handle = sink.clone();
        handle.submit(&sample_run(), RecordKind::Start).unwrap();
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].0, RecordKind::Start);

        let mut missing = RecordingSink::unavailable();
        assert!(!missing.is_available());
        assert!(missing.submit(&sample_run(), RecordKind::End).is_err());
    }
}
