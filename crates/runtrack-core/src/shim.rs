//! The process-lifetime context that ties the lifecycle together.
//!
//! A [`Shim`] owns everything one instrumented process needs between its
//! constructor and its destructor: configuration, the environment handle,
//! collaborators, the re-entrancy counters, the current phase, the GPU session
//! and the record sink. [`Shim::init`] runs once at load and
//! [`Shim::finalize`] once at exit or on a fatal signal.

use crate::argv;
use crate::collab::{Classification, Collaborators};
use crate::config::{BuildVariant, Config, Settings, vars};
use crate::env::{Env, ProcessEnv};
use crate::gate::{Gate, HostFacts, ReentrancyCounter};
use crate::gpu::GpuSession;
use crate::recorder::{RecordKind, RecordSink, Recorder};
use crate::reject::RejectReason;
use crate::run::{self, RunContext, RunKind};
use crate::sampling;
use crate::trace::{self, SystemIdentity, TraceMode};

/// Where the process is in its lifecycle.
#[derive(Debug)]
pub enum Phase {
    /// `init` has not run.
    Idle,
    /// Admitted; a record will be produced at exit.
    Active(Box<RunContext>),
    /// Not tracked. `packages_run` names a run whose scratch directory is
    /// removed at exit.
    Rejected {
        reason: RejectReason,
        packages_run: Option<String>,
    },
    /// `finalize` has run.
    Finished,
}

/// Opens the GPU session for a run id once GPU tracking is on.
pub type GpuOpener = Box<dyn Fn(&str) -> GpuSession + Send>;

/// Per-process lifecycle state.
pub struct Shim {
    config: Config,
    settings: Settings,
    env: Box<dyn Env>,
    collab: Collaborators,
    counter: ReentrancyCounter,
    phase: Phase,
    reject: Option<RejectReason>,
    gpu: GpuSession,
    gpu_opener: GpuOpener,
    sink: Box<dyn RecordSink>,
}

impl Shim {
    pub fn new(
        config: Config,
        env: Box<dyn Env>,
        collab: Collaborators,
        sink: Box<dyn RecordSink>,
    ) -> Self {
        let settings = Settings::read(env.as_ref(), &config);
        let backend = config.gpu_backend;
        Self {
            config,
            settings,
            env,
            collab,
            counter: ReentrancyCounter::default(),
            phase: Phase::Idle,
            reject: None,
            gpu: GpuSession::Disabled,
            gpu_opener: Box::new(move |run_id| GpuSession::open(backend, true, run_id)),
            sink,
        }
    }

    /// Replace how GPU sessions are opened.
    pub fn with_gpu_opener(
        mut self,
        opener: impl Fn(&str) -> GpuSession + Send + 'static,
    ) -> Self {
        self.gpu_opener = Box::new(opener);
        self
    }

    /// A shim for the current process with build-time defaults.
    pub fn for_process(variant: BuildVariant) -> Self {
        let config = Config::for_variant(variant);
        let timeout = Settings::read(&ProcessEnv, &config).recorder_timeout;
        let sink = Box::new(Recorder::new(config.clone(), timeout));
        Self::new(config, Box::new(ProcessEnv), Collaborators::default(), sink)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn env(&self) -> &dyn Env {
        self.env.as_ref()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// The first reason this process was not recorded, if any.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        self.reject
    }

    /// The admitted run, while active.
    pub fn run(&self) -> Option<&RunContext> {
        match &self.phase {
            Phase::Active(run) => Some(&**run),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Active(_))
    }

    /// Initialize from the process arguments, observing the real host.
    pub fn init<S: AsRef<str>>(&mut self, args: &[S]) -> Result<(), RejectReason> {
        let facts = HostFacts::detect(args.first().map(AsRef::as_ref));
        self.init_with(args, &facts)
    }

    /// Initialize with already observed host facts.
    pub fn init_with<S: AsRef<str>>(
        &mut self,
        args: &[S],
        facts: &HostFacts,
    ) -> Result<(), RejectReason> {
        self.settings = Settings::read(self.env.as_ref(), &self.config);
        let variant = self.config.variant;
        log::debug!(
            "\nruntrack_initialize({}): {}",
            variant.token(),
            facts.exec_path.display()
        );

        if self.settings.trace == TraceMode::Verbose
            && self.env.get(vars::INITIAL_STATE).is_none()
            && let Ok(id) = SystemIdentity::detect()
        {
            let syshost = self.collab.syshost.syshost(self.env.as_ref(), &id.nodename);
            trace::log_banner(&id, &syshost);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let gate = Gate {
            config: &self.config,
            settings: &self.settings,
            collab: &self.collab,
        };
        let admission = match gate.evaluate(self.env.as_mut(), &mut self.counter, facts) {
            Ok(a) => a,
            Err(reason) => {
                let packages = reason == RejectReason::NoKindOverlap
                    && self.collab.paths.classify(&facts.exec_path) == Classification::Packages;
                return self.reject(reason, packages.then_some(run_id));
            }
        };

        let argv = match argv::serialize(args, self.collab.quoter.as_ref()) {
            Ok(argv) => argv,
            Err(reason) => {
                self.env.remove(vars::RUN_UUID);
                let packages = (admission.kind == RunKind::Packages).then_some(run_id);
                return self.reject(reason, packages);
            }
        };

        let draw = if admission.scale_kind == RunKind::Scalar && self.settings.scalar_sampling {
            sampling::draw()
        } else {
            0.0
        };

        let exec_display = admission.exec_path.to_string_lossy().into_owned();
        let watermark = self.collab.watermark.probe(&admission.exec_path);
        let run = RunContext {
            pid: std::process::id(),
            ppid: std::os::unix::process::parent_id(),
            run_id,
            rank: admission.scale.rank,
            size: admission.scale.size,
            kind: admission.kind,
            scale_kind: admission.scale_kind,
            exec_quoted: argv::quote_string(&exec_display),
            exec_path: admission.exec_path,
            argv,
            syshost: self
                .collab
                .syshost
                .syshost(self.env.as_ref(), &admission.nodename),
            start_time: run::epoch(),
            end_time: 0.0,
            probability: 1.0,
            draw,
            gpu_count: 0,
            watermark_encoded: argv::encode(watermark.as_bytes()),
            watermark,
            path_var: self.env.get(vars::PATH),
            ld_library_path_var: self.env.get(vars::LD_LIBRARY_PATH),
            reject: None,
        };

        self.env.set(vars::RUN_UUID, &run.run_id);
        self.env.set(vars::DATE_TIME, &date_time(run.start_time));
        self.env
            .set(vars::DIR, &self.config.install_dir.to_string_lossy());
        self.env.set(vars::RANDOM_NUMBER, &format!("{draw:10.6}"));

        if run.scale_kind == RunKind::Mpi {
            if !self.sink.is_available() {
                log::debug!(
                    "    -> Quitting => Cannot find {}",
                    self.config.recorder.display()
                );
                self.env.remove(vars::RUN_UUID);
                let packages = (run.kind == RunKind::Packages).then(|| run.run_id.clone());
                return self.reject(RejectReason::RecorderMissing, packages);
            }
            if let Err(e) = self.sink.submit(&run, RecordKind::Start) {
                log::warn!("runtrack: start record not delivered: {e}");
            }
        } else {
            log::debug!(
                "    -> Current run is {}; not producing a start record",
                run.scale_kind
            );
        }

        if self.settings.gpu_tracking {
            self.gpu = (self.gpu_opener)(&run.run_id);
        }
        self.phase = Phase::Active(Box::new(run));
        Ok(())
    }

    fn reject(
        &mut self,
        reason: RejectReason,
        packages_run: Option<String>,
    ) -> Result<(), RejectReason> {
        self.reject.get_or_insert(reason);
        if matches!(self.phase, Phase::Idle) {
            self.phase = Phase::Rejected {
                reason,
                packages_run,
            };
        }
        Err(reason)
    }

    /// Complete the run. Only the first call has an effect.
    pub fn finalize(&mut self) {
        let mut run = match std::mem::replace(&mut self.phase, Phase::Finished) {
            Phase::Active(run) => run,
            Phase::Rejected {
                reason,
                packages_run,
            } => {
                if let Some(id) = packages_run {
                    self.collab.tmpdir.remove_run_tmpdir(&id);
                }
                log::debug!("\nruntrack_finalize: exiting because reject is set to: {reason}");
                return;
            }
            Phase::Idle | Phase::Finished => return,
        };

        run.end_time = run::epoch();
        self.env.remove(vars::LD_PRELOAD);
        run.gpu_count = std::mem::replace(&mut self.gpu, GpuSession::Disabled).close();

        if run.scale_kind == RunKind::Scalar && self.settings.scalar_sampling {
            let runtime = run.runtime();
            let decision = sampling::decide(&self.settings.sampling_table, runtime, run.draw);
            run.probability = decision.probability;
            if !decision.keep {
                log::debug!(
                    "    -> exiting because scalar sampling. run_time: {runtime}, \
                     (draw: {} >= prob: {}) for program: {}",
                    run.draw,
                    decision.probability,
                    run.exec_path.display()
                );
                return;
            }
            log::debug!(
                "    -> Scalar sampling run_time: {runtime}: (draw: {} < prob: {}) for program: {}",
                run.draw,
                decision.probability,
                run.exec_path.display()
            );
        }

        if !self.sink.is_available() {
            log::debug!(
                "    -> Quitting => Cannot find {}",
                self.config.recorder.display()
            );
            run.reject = Some(RejectReason::RecorderMissing);
            self.reject.get_or_insert(RejectReason::RecorderMissing);
            return;
        }
        if let Err(e) = self.sink.submit(&run, RecordKind::End) {
            log::warn!("runtrack: record not delivered: {e}");
        }
    }
}

/// `%Y_%m_%d_%H_%M_%S_<fraction * 10000>` in local time.
pub fn date_time(start: f64) -> String {
    let secs = start.trunc();
    let frac = ((start - secs) * 10000.0) as i64;
    let stamp = chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y_%m_%d_%H_%M_%S")
                .to_string()
        })
        .unwrap_or_default();
    format!("{stamp}_{frac}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{PathClassifier, TmpDirCleaner};
    use crate::env::MemEnv;
    use crate::recorder::RecordingSink;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    fn config() -> Config {
        let mut c = Config::for_variant(BuildVariant::Preload).with_install_dir("/opt/rt");
        c.scalar_tracking = true;
        c.mpi_tracking = true;
        c.gpu_tracking = false;
        c
    }

    fn facts() -> HostFacts {
        HostFacts {
            nodename: Some("c7.cluster.example.org".into()),
            exec_path: PathBuf::from("/home/u/bin/solver"),
        }
    }

    fn shim(env: MemEnv, sink: &RecordingSink) -> Shim {
        Shim::new(config(), Box::new(env), Collaborators::default(), Box::new(sink.clone()))
    }

    fn tracking() -> MemEnv {
        MemEnv::new()
            .with(vars::EXECUTABLE_TRACKING, "yes")
            .with(vars::PATH, "/home/u/bin:/usr/bin")
    }

    const ARGS: [&str; 3] = ["solver", "--input", "a b.dat"];

    #[test]
    fn scalar_run_delivers_one_end_record() {
        let sink = RecordingSink::new();
        let mut s = shim(tracking(), &sink);
        s.init_with(&ARGS, &facts()).unwrap();
        assert!(s.is_active());
        assert!(sink.records().is_empty());

        let env = s.env();
        let id = env.get(vars::RUN_UUID).unwrap();
        assert_eq!(id.len(), 36);
        assert!(env.is(vars::INITIAL_STATE, "LD_PRELOAD"));
        assert!(env.is(vars::DIR, "/opt/rt"));
        assert!(env.is(vars::RANDOM_NUMBER, "  0.000000"));
        assert_eq!(env.get(vars::DATE_TIME).unwrap().split('_').count(), 7);

        s.finalize();
        let records = sink.records();
        assert_eq!(records.len(), 1);
        let (kind, run) = &records[0];
        assert_eq!(*kind, RecordKind::End);
        assert_eq!(run.run_id, id);
        assert_eq!(run.kind, RunKind::Scalar);
        assert_eq!(run.syshost, "cluster");
        assert_eq!(run.path_var.as_deref(), Some("/home/u/bin:/usr/bin"));
        assert!(run.end_time >= run.start_time);
        assert_eq!(argv::decode_args(&run.argv.encoded).unwrap(), ARGS);
    }

    #[test]
    fn mpi_run_delivers_start_and_end_records() {
        let sink = RecordingSink::new();
        let env = tracking().with("OMPI_COMM_WORLD_SIZE", "16").with("OMPI_COMM_WORLD_RANK", "0");
        let mut s = shim(env, &sink);
        s.init_with(&ARGS, &facts()).unwrap();
        assert_eq!(sink.records().len(), 1);
        s.finalize();
        let records = sink.records();
        let kinds: Vec<RecordKind> = records.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, [RecordKind::Start, RecordKind::End]);
        assert_eq!(records[1].1.size, 16);
        assert_eq!(records[1].1.kind, RunKind::Mpi);
    }

    #[test]
    fn mpi_run_without_recorder_is_rejected_at_init() {
        let sink = RecordingSink::unavailable();
        let env = tracking().with("PMI_SIZE", "4");
        let mut s = shim(env, &sink);
        assert_eq!(s.init_with(&ARGS, &facts()), Err(RejectReason::RecorderMissing));
        assert!(s.env().get(vars::RUN_UUID).is_none());
        s.finalize();
        assert_eq!(s.reject_reason(), Some(RejectReason::RecorderMissing));
    }

    #[test]
    fn scalar_run_without_recorder_records_the_reason_at_exit() {
        let sink = RecordingSink::unavailable();
        let mut s = shim(tracking(), &sink);
        s.init_with(&ARGS, &facts()).unwrap();
        s.finalize();
        assert_eq!(s.reject_reason(), Some(RejectReason::RecorderMissing));
    }

    #[test]
    fn finalize_runs_once() {
        let sink = RecordingSink::new();
        let mut s = shim(tracking(), &sink);
        s.init_with(&ARGS, &facts()).unwrap();
        s.finalize();
        s.finalize();
        assert_eq!(sink.records().len(), 1);
        assert!(matches!(s.phase(), Phase::Finished));
    }

    #[test]
    fn finalize_before_init_is_a_no_op() {
        let sink = RecordingSink::new();
        let mut s = shim(tracking(), &sink);
        s.finalize();
        assert!(sink.records().is_empty());
    }

    #[test]
    fn second_init_keeps_the_active_run() {
        let sink = RecordingSink::new();
        let mut s = shim(tracking(), &sink);
        s.init_with(&ARGS, &facts()).unwrap();
        let id = s.run().unwrap().run_id.clone();
        assert_eq!(s.init_with(&ARGS, &facts()), Err(RejectReason::DoubleInit));
        assert_eq!(s.run().unwrap().run_id, id);
        s.finalize();
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn rejected_run_delivers_nothing() {
        let sink = RecordingSink::new();
        let mut s = shim(MemEnv::new(), &sink);
        assert_eq!(s.init_with(&ARGS, &facts()), Err(RejectReason::TrackingDisabled));
        s.finalize();
        assert!(sink.records().is_empty());
        assert_eq!(s.reject_reason(), Some(RejectReason::TrackingDisabled));
    }

    #[test]
    fn sampled_out_scalar_run_is_discarded() {
        let sink = RecordingSink::new();
        let env = tracking()
            .with(vars::SCALAR_SAMPLING, "yes")
            .with(vars::SAMPLING_TABLE, "0:0.0");
        let mut s = shim(env, &sink);
        s.init_with(&ARGS, &facts()).unwrap();
        s.finalize();
        assert!(sink.records().is_empty());
        assert_eq!(s.reject_reason(), None);
    }

    #[test]
    fn sampled_in_scalar_run_reports_probability() {
        let sink = RecordingSink::new();
        let env = tracking()
            .with(vars::SCALAR_SAMPLING, "yes")
            .with(vars::SAMPLING_TABLE, "0:1.0");
        let mut s = shim(env, &sink);
        s.init_with(&ARGS, &facts()).unwrap();
        let draw = s.env().get(vars::RANDOM_NUMBER).unwrap();
        assert_eq!(draw.len(), 10);
        s.finalize();
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.probability, 1.0);
    }

    #[test]
    fn mpi_runs_are_never_sampled() {
        let sink = RecordingSink::new();
        let env = tracking()
            .with("PMI_SIZE", "2")
            .with(vars::SCALAR_SAMPLING, "yes")
            .with(vars::SAMPLING_TABLE, "0:0.0");
        let mut s = shim(env, &sink);
        s.init_with(&ARGS, &facts()).unwrap();
        s.finalize();
        assert_eq!(sink.records().len(), 2);
    }

    #[test]
    fn finalize_clears_preload_variable() {
        let sink = RecordingSink::new();
        let env = tracking().with(vars::LD_PRELOAD, "/opt/rt/lib64/libruntrack.so");
        let mut s = shim(env, &sink);
        s.init_with(&ARGS, &facts()).unwrap();
        assert!(s.env().get(vars::LD_PRELOAD).is_some());
        s.finalize();
        assert!(s.env().get(vars::LD_PRELOAD).is_none());
    }

    struct AlwaysPackages;

    impl PathClassifier for AlwaysPackages {
        fn classify(&self, _exec_path: &Path) -> Classification {
            Classification::Packages
        }
    }

    #[derive(Clone, Default)]
    struct CleanupLog(Arc<Mutex<Vec<String>>>);

    impl TmpDirCleaner for CleanupLog {
        fn remove_run_tmpdir(&self, run_id: &str) {
            self.0.lock().unwrap().push(run_id.to_string());
        }
    }

    #[test]
    fn rejected_packages_run_cleans_its_tmpdir() {
        let sink = RecordingSink::new();
        let cleaned = CleanupLog::default();
        let collab = Collaborators {
            paths: Box::new(AlwaysPackages),
            tmpdir: Box::new(cleaned.clone()),
            ..Collaborators::default()
        };
        let env = tracking().with(vars::SCALAR_TRACKING, "no");
        let mut s = Shim::new(config(), Box::new(env), collab, Box::new(sink.clone()));
        assert_eq!(s.init_with(&ARGS, &facts()), Err(RejectReason::NoKindOverlap));
        s.finalize();
        assert_eq!(cleaned.0.lock().unwrap().len(), 1);
        assert!(sink.records().is_empty());
    }

    #[test]
    fn accepted_packages_run_reports_pkgs_kind() {
        let sink = RecordingSink::new();
        let collab = Collaborators {
            paths: Box::new(AlwaysPackages),
            ..Collaborators::default()
        };
        let mut s = Shim::new(config(), Box::new(tracking()), collab, Box::new(sink.clone()));
        s.init_with(&["python3", "train.py"], &facts()).unwrap();
        s.finalize();
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.kind, RunKind::Packages);
    }

    struct Inflating;

    impl crate::argv::ArgQuoter for Inflating {
        fn quote(&self, arg: &str, out: &mut String) {
            for _ in 0..4 {
                out.push_str(arg);
            }
        }
    }

    #[test]
    fn unencodable_argv_rejects_without_a_record() {
        let sink = RecordingSink::new();
        let collab = Collaborators {
            quoter: Box::new(Inflating),
            ..Collaborators::default()
        };
        let mut s = Shim::new(config(), Box::new(tracking()), collab, Box::new(sink.clone()));
        assert_eq!(s.init_with(&ARGS, &facts()), Err(RejectReason::BadJson));
        assert!(s.env().get(vars::RUN_UUID).is_none());
        s.finalize();
        assert!(sink.records().is_empty());
        assert_eq!(s.reject_reason(), Some(RejectReason::BadJson));
    }

    #[test]
    fn unencodable_packages_argv_still_cleans_its_tmpdir() {
        let sink = RecordingSink::new();
        let cleaned = CleanupLog::default();
        let collab = Collaborators {
            paths: Box::new(AlwaysPackages),
            quoter: Box::new(Inflating),
            tmpdir: Box::new(cleaned.clone()),
            ..Collaborators::default()
        };
        let mut s = Shim::new(config(), Box::new(tracking()), collab, Box::new(sink.clone()));
        assert_eq!(s.init_with(&ARGS, &facts()), Err(RejectReason::BadJson));
        s.finalize();
        assert_eq!(cleaned.0.lock().unwrap().len(), 1);
        assert!(sink.records().is_empty());
    }

    struct FixedJob(Vec<u32>);

    impl crate::gpu::JobStatsApi for FixedJob {
        fn finish(&mut self, _job_id: &str) -> Result<Vec<u32>, crate::gpu::GpuError> {
            Ok(self.0.clone())
        }
    }

    /// A shim whose GPU backend reports `compute_pids` and logs each open.
    fn gpu_shim(
        env: MemEnv,
        sink: &RecordingSink,
        compute_pids: Vec<u32>,
    ) -> (Shim, Arc<Mutex<Vec<String>>>) {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let opens = opened.clone();
        let s = shim(env, sink).with_gpu_opener(move |run_id| {
            opens.lock().unwrap().push(run_id.to_string());
            GpuSession::with_job_stats(Box::new(FixedJob(compute_pids.clone())), run_id, 0)
        });
        (s, opened)
    }

    #[test]
    fn gpu_count_reaches_the_record() {
        let sink = RecordingSink::new();
        let env = tracking().with(vars::GPU_TRACKING, "yes");
        let (mut s, opened) = gpu_shim(env, &sink, vec![2, 0, 1, 0]);
        s.init_with(&ARGS, &facts()).unwrap();
        let id = s.run().unwrap().run_id.clone();
        assert_eq!(*opened.lock().unwrap(), [id]);
        s.finalize();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        let run = &records[0].1;
        assert_eq!(run.gpu_count, 2);
        let args = crate::recorder::record_args(s.config(), run, RecordKind::End);
        let ngpus = args.iter().position(|a| a == "--ngpus").unwrap();
        assert_eq!(args[ngpus + 1], "2");
    }

    #[test]
    fn gpu_tracking_off_never_opens_a_session() {
        let sink = RecordingSink::new();
        let (mut s, opened) = gpu_shim(tracking(), &sink, vec![1]);
        s.init_with(&ARGS, &facts()).unwrap();
        s.finalize();
        assert!(opened.lock().unwrap().is_empty());
        assert_eq!(sink.records()[0].1.gpu_count, 0);
    }

    #[test]
    fn rejected_run_never_opens_a_gpu_session() {
        let sink = RecordingSink::new();
        let env = tracking()
            .with(vars::GPU_TRACKING, "yes")
            .with("PMI_RANK", "3")
            .with("PMI_SIZE", "4");
        let (mut s, opened) = gpu_shim(env, &sink, vec![1]);
        assert_eq!(s.init_with(&ARGS, &facts()), Err(RejectReason::NonzeroRank));
        s.finalize();
        assert!(opened.lock().unwrap().is_empty());
        assert!(sink.records().is_empty());
    }

    #[test]
    fn mpi_run_without_recorder_never_opens_a_gpu_session() {
        let sink = RecordingSink::unavailable();
        let env = tracking().with(vars::GPU_TRACKING, "yes").with("PMI_SIZE", "4");
        let (mut s, opened) = gpu_shim(env, &sink, vec![1]);
        assert_eq!(s.init_with(&ARGS, &facts()), Err(RejectReason::RecorderMissing));
        assert!(opened.lock().unwrap().is_empty());
    }

    #[test]
    fn date_time_has_fraction_suffix() {
        let s = date_time(1_700_000_000.5);
        assert!(s.ends_with("_5000"), "{s}");
        assert!(s.starts_with("2023_11_1"), "{s}");
    }
}
