//! The ordered accept/reject checks run once per process at init.
//!
//! Checks short-circuit: the first failure decides the [`RejectReason`] and
//! nothing after it runs. From the feature toggle onward a rejection also
//! removes `RUNTRACK_RUN_UUID` so children never inherit a stale run id. The
//! build-state and re-entrancy checks leave the environment alone, since in
//! those cases another copy of the shim owns it.

use std::fmt;
use std::path::PathBuf;

use crate::collab::{Classification, Collaborators};
use crate::config::{BuildVariant, Config, Settings, vars};
use crate::env::Env;
use crate::reject::RejectReason;
use crate::run::RunKind;
use crate::scale::Scale;
use crate::trace::{SystemIdentity, TraceMode};

/// Run kinds a build records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSet {
    pub scalar: bool,
    pub mpi: bool,
}

impl KindSet {
    pub fn contains(self, kind: RunKind) -> bool {
        match kind {
            RunKind::Scalar => self.scalar,
            RunKind::Mpi => self.mpi,
            RunKind::Packages => self.scalar || self.mpi,
        }
    }
}

impl fmt::Display for KindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match (self.scalar, self.mpi) {
            (false, false) => "nothing",
            (true, false) => "scalar programs only",
            (false, true) => "MPI programs only",
            (true, true) => "both scalar and MPI programs",
        })
    }
}

/// Number of times init has passed the guard, per build variant.
#[derive(Debug, Default, Clone)]
pub struct ReentrancyCounter {
    counts: [u32; 2],
}

impl ReentrancyCounter {
    pub fn count(&self, variant: BuildVariant) -> u32 {
        self.counts[variant.index()]
    }

    /// Claim `variant`. False if it was already claimed.
    fn enter(&mut self, variant: BuildVariant) -> bool {
        let slot = &mut self.counts[variant.index()];
        if *slot != 0 {
            return false;
        }
        *slot += 1;
        true
    }
}

/// Facts about the host and executable observed before the gate runs.
#[derive(Debug, Clone)]
pub struct HostFacts {
    /// `None` when `uname` failed.
    pub nodename: Option<String>,
    pub exec_path: PathBuf,
}

impl HostFacts {
    pub fn detect(argv0: Option<&str>) -> Self {
        Self {
            nodename: SystemIdentity::detect().ok().map(|id| id.nodename),
            exec_path: crate::run::exec_path(argv0),
        }
    }
}

/// A process that passed every check.
#[derive(Debug, Clone)]
pub struct Admission {
    pub scale: Scale,
    /// Kind reported to the recorder.
    pub kind: RunKind,
    /// Kind implied by the detected scale.
    pub scale_kind: RunKind,
    pub exec_path: PathBuf,
    pub nodename: String,
}

/// Everything the gate reads.
pub struct Gate<'a> {
    pub config: &'a Config,
    pub settings: &'a Settings,
    pub collab: &'a Collaborators,
}

impl Gate<'_> {
    /// Run the checks in order. On success the build-state marker is
    /// published in `env`.
    pub fn evaluate(
        &self,
        env: &mut dyn Env,
        counter: &mut ReentrancyCounter,
        facts: &HostFacts,
    ) -> Result<Admission, RejectReason> {
        let variant = self.config.variant;
        let marker = env.get(vars::INITIAL_STATE);
        log::debug!(
            "  Test for __RUNTRACK_INITIAL_STATE__: \"{}\", State: \"{}\"",
            marker.as_deref().unwrap_or("(NULL)"),
            variant.token()
        );
        if marker.as_deref().is_some_and(|m| m != variant.token()) {
            log::debug!("    -> Quitting => {}", RejectReason::WrongBuildState);
            return Err(RejectReason::WrongBuildState);
        }

        log::debug!(
            "  Test for reentrancy: count = {}",
            counter.count(variant)
        );
        if !counter.enter(variant) {
            log::debug!("    -> Quitting => {}", RejectReason::DoubleInit);
            return Err(RejectReason::DoubleInit);
        }

        match self.admit(&*env, facts) {
            Ok(admission) => {
                env.set(vars::INITIAL_STATE, variant.token());
                Ok(admission)
            }
            Err(reason) => {
                log::debug!("    -> Quitting => {reason}");
                env.remove(vars::RUN_UUID);
                Err(reason)
            }
        }
    }

    fn admit(&self, env: &dyn Env, facts: &HostFacts) -> Result<Admission, RejectReason> {
        log::debug!(
            "  Test for RUNTRACK_EXECUTABLE_TRACKING: {}",
            if self.settings.tracking { "yes" } else { "no" }
        );
        if !self.settings.tracking {
            return Err(RejectReason::TrackingDisabled);
        }

        let scale = Scale::detect(env);
        log::debug!("  Test for rank == 0, rank: {}", scale.rank);
        if scale.rank > 0 {
            return Err(RejectReason::NonzeroRank);
        }

        let nodename = match &facts.nodename {
            Some(name) => name.clone(),
            None if self.settings.trace == TraceMode::Verbose => {
                log::debug!("  Unable to call uname");
                return Err(RejectReason::HostnameRejected);
            }
            None => String::new(),
        };
        let host = self.collab.hosts.classify(&nodename);
        log::debug!(
            "  Hostname: {nodename} is {}",
            if host == Classification::Skip { "rejected" } else { "accepted" }
        );
        if host == Classification::Skip {
            return Err(RejectReason::HostnameRejected);
        }

        let scale_kind = if scale.is_parallel() {
            RunKind::Mpi
        } else {
            RunKind::Scalar
        };
        let mut kind = scale_kind;
        let path = self.collab.paths.classify(&facts.exec_path);
        match path {
            Classification::Skip => {
                log::debug!("  Executable: {} is rejected", facts.exec_path.display());
                return Err(RejectReason::PathRejected);
            }
            Classification::Packages => {
                log::debug!("  Executable: {} is a packages run", facts.exec_path.display());
                kind = RunKind::Packages;
            }
            Classification::Keep => {
                log::debug!("  Executable: {} is accepted", facts.exec_path.display());
            }
        }

        let support = self.settings.support;
        log::debug!(
            "  Test for build and run overlap: this build tracks {support}; \
             this is a {} program (size = {})",
            if scale_kind == RunKind::Mpi { "MPI" } else { "scalar" },
            scale.size
        );
        if !support.contains(scale_kind) {
            return Err(RejectReason::NoKindOverlap);
        }
        log::debug!("    -> Passed all tests");

        Ok(Admission {
            scale,
            kind,
            scale_kind,
            exec_path: facts.exec_path.clone(),
            nodename,
        })
    }
}
