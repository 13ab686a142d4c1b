//! Terminal reasons a run is not recorded.

use std::fmt;

/// Why the shim stopped tracking this process.
///
/// Set at most once per process; the first failing check wins and every later
/// step becomes a no-op apart from cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    TrackingDisabled,
    WrongBuildState,
    DoubleInit,
    NonzeroRank,
    HostnameRejected,
    PathRejected,
    BadJson,
    NoKindOverlap,
    RecorderMissing,
}

impl RejectReason {
    /// Short machine-friendly label.
    pub fn label(self) -> &'static str {
        match self {
            Self::TrackingDisabled => "tracking_disabled",
            Self::WrongBuildState => "wrong_build_state",
            Self::DoubleInit => "double_init",
            Self::NonzeroRank => "nonzero_rank",
            Self::HostnameRejected => "hostname_rejected",
            Self::PathRejected => "path_rejected",
            Self::BadJson => "bad_json",
            Self::NoKindOverlap => "no_kind_overlap",
            Self::RecorderMissing => "recorder_missing",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::TrackingDisabled => "RUNTRACK_EXECUTABLE_TRACKING is off",
            Self::WrongBuildState => {
                "__RUNTRACK_INITIAL_STATE__ is different from this build's state"
            }
            Self::DoubleInit => "runtrack is trying to run twice in the same state",
            Self::NonzeroRank => "runtrack only tracks rank 0 in MPI programs",
            Self::HostnameRejected => "the host does not match the tracked hostname patterns",
            Self::PathRejected => "the executable does not match the tracked path patterns",
            Self::BadJson => "the command line JSON string could not be built",
            Self::NoKindOverlap => "the run kind does not match the kinds this build tracks",
            Self::RecorderMissing => "cannot find an executable runtrack_run_submission",
        };
        f.write_str(text)
    }
}
