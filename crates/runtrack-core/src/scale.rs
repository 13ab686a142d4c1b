//! Parallel rank/size detection from job-launcher environment variables.
//!
//! Each launcher ecosystem (Open MPI, MVAPICH, PMI, Slurm) exports its own
//! variables. Lists are searched in priority order and the first variable that
//! is set wins; values are never summed across ecosystems. The Slurm names are
//! last because some sites set both `PMI_RANK` and `SLURM_PROCID`, and only the
//! PMI value is correct for multi-program launches.

use crate::env::Env;

/// Rank variables, highest priority first.
pub const RANK_VARS: &[&str] = &[
    "OMPI_COMM_WORLD_RANK",
    "MV2_COMM_WORLD_RANK",
    "PMI_RANK",
    "SLURM_PROCID",
];

/// Size variables, highest priority first.
pub const SIZE_VARS: &[&str] = &[
    "OMPI_COMM_WORLD_SIZE",
    "MV2_COMM_WORLD_SIZE",
    "PMI_SIZE",
    "SLURM_STEP_NUM_TASKS",
];

/// Rank and size of this process within its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    pub rank: i64,
    pub size: i64,
}

impl Scale {
    /// Serial defaults: rank 0 of 1.
    pub const SERIAL: Scale = Scale { rank: 0, size: 1 };

    /// Detect rank and size using the standard variable lists.
    pub fn detect(env: &dyn Env) -> Self {
        Self::detect_with(env, RANK_VARS, SIZE_VARS)
    }

    /// Detect rank and size with explicit priority lists.
    pub fn detect_with(env: &dyn Env, rank_vars: &[&str], size_vars: &[&str]) -> Self {
        let rank = first_value(env, rank_vars).unwrap_or(0);
        let size = first_value(env, size_vars).unwrap_or(1).max(1);
        Self { rank, size }
    }

    /// More than one task means an MPI run.
    pub fn is_parallel(&self) -> bool {
        self.size > 1
    }
}

/// Integer value of the first variable in `names` that is set.
pub fn first_value(env: &dyn Env, names: &[&str]) -> Option<i64> {
    names
        .iter()
        .find_map(|name| env.get(name))
        .map(|raw| parse_leading_int(&raw))
}

/// Parse a leading decimal integer the way `strtol` does: leading whitespace
/// and an optional sign are accepted, parsing stops at the first non-digit,
/// and text without digits yields zero.
fn parse_leading_int(raw: &str) -> i64 {
    let s = raw.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        value = value.saturating_mul(10).saturating_add(i64::from(b - b'0'));
    }
    if negative { -value } else { value }
}
