//! # runtrack-core
//!
//! **Lifecycle engine for a job instrumentation shim.**
//!
//! `runtrack` is loaded into every program launched on a shared cluster, either
//! through `LD_PRELOAD` or by static linking. At process start it runs a layered
//! gate to decide whether this run is worth recording; at exit (or on a fatal
//! signal) it stamps the run's end, counts the GPUs it used, applies sampling,
//! and hands one record to an external recorder executable.
//!
//! ## Quick Start
//!
//! ```no_run
//! use runtrack_core::{BuildVariant, Shim};
//!
//! let args: Vec<String> = std::env::args().collect();
//! let mut shim = Shim::for_process(BuildVariant::Preload);
//! if shim.init(&args).is_ok() {
//!     // ... the host program runs ...
//!     shim.finalize();
//! }
//! ```
//!
//! ## Architecture
//!
//! gate → run context → (program runs) → GPU tally → sampling → recorder
//!
//! Nothing in here may disturb the host: every failure becomes a
//! [`RejectReason`] or a degraded record, and the host's exit status and
//! signal semantics are never changed.

pub mod argv;
pub mod collab;
pub mod config;
pub mod env;
pub mod gate;
pub mod gpu;
pub mod recorder;
pub mod reject;
pub mod run;
pub mod sampling;
pub mod scale;
pub mod shim;
pub mod signals;
pub mod trace;

pub use argv::{ArgQuoter, ArgvJson, JsonQuoter};
pub use collab::{
    Classification, Collaborators, HostClassifier, PathClassifier, SyshostResolver,
    TmpDirCleaner, WatermarkProbe,
};
pub use config::{BuildVariant, Config, Settings};
pub use env::{Env, MemEnv, ProcessEnv};
pub use gate::{Admission, Gate, HostFacts, KindSet, ReentrancyCounter};
pub use gpu::{GpuBackend, GpuError, GpuSession};
pub use recorder::{DeliveryError, RecordKind, RecordSink, Recorder, RecordingSink};
pub use reject::RejectReason;
pub use run::{RunContext, RunKind};
pub use sampling::{SampleDecision, SamplingTable, TableError};
pub use scale::Scale;
pub use shim::{GpuOpener, Phase, Shim};
pub use trace::TraceMode;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
