//! Volume reduction for short scalar runs.
//!
//! Scalar programs can launch millions of times per day on a cluster. When
//! sampling is enabled each scalar run draws one number at start; at exit the
//! measured runtime selects a retention probability from a [`SamplingTable`]
//! and the record is kept only if the draw falls below it.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

/// Error building a [`SamplingTable`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TableError {
    #[error("sampling table is empty")]
    Empty,
    #[error("first sampling bound must be 0, got {0}")]
    FirstBoundNotZero(f64),
    #[error("sampling bounds must strictly increase ({prev} then {next})")]
    NotIncreasing { prev: f64, next: f64 },
    #[error("sampling probability {0} is outside [0, 1]")]
    BadProbability(f64),
    #[error("cannot parse sampling entry {0:?}")]
    Parse(String),
}

/// One bucket: runs of at least `lower` seconds (up to the next bucket's
/// bound) are kept with probability `prob`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingEntry {
    pub lower: f64,
    pub prob: f64,
}

/// Runtime buckets with their retention probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingTable {
    entries: Vec<SamplingEntry>,
}

impl SamplingTable {
    /// Validate and build a table from `(lower bound seconds, probability)` pairs.
    pub fn new(pairs: &[(f64, f64)]) -> Result<Self, TableError> {
        let Some(&(first, _)) = pairs.first() else {
            return Err(TableError::Empty);
        };
        if first != 0.0 {
            return Err(TableError::FirstBoundNotZero(first));
        }
        for w in pairs.windows(2) {
            if !(w[1].0 > w[0].0) {
                return Err(TableError::NotIncreasing {
                    prev: w[0].0,
                    next: w[1].0,
                });
            }
        }
        if let Some(&(_, p)) = pairs.iter().find(|(_, p)| !(0.0..=1.0).contains(p)) {
            return Err(TableError::BadProbability(p));
        }
        Ok(Self {
            entries: pairs
                .iter()
                .map(|&(lower, prob)| SamplingEntry { lower, prob })
                .collect(),
        })
    }

    pub fn entries(&self) -> &[SamplingEntry] {
        &self.entries
    }

    /// Retention probability for a run of `runtime` seconds.
    pub fn probability(&self, runtime: f64) -> f64 {
        self.entries
            .iter()
            .rev()
            .find(|e| runtime >= e.lower)
            .or(self.entries.first())
            .map_or(1.0, |e| e.prob)
    }
}

impl Default for SamplingTable {
    fn default() -> Self {
        Self {
            entries: vec![
                SamplingEntry { lower: 0.0, prob: 0.0001 },
                SamplingEntry { lower: 1800.0, prob: 0.01 },
                SamplingEntry { lower: 7200.0, prob: 1.0 },
            ],
        }
    }
}

/// Parses `"0:0.0001,1800:0.01,7200:1.0"`.
impl FromStr for SamplingTable {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pairs = s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                let (lower, prob) = item
                    .split_once(':')
                    .ok_or_else(|| TableError::Parse(item.to_string()))?;
                let lower = lower.trim().parse::<f64>();
                let prob = prob.trim().parse::<f64>();
                match (lower, prob) {
                    (Ok(l), Ok(p)) => Ok((l, p)),
                    _ => Err(TableError::Parse(item.to_string())),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(&pairs)
    }
}

impl fmt::Display for SamplingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", e.lower, e.prob)?;
        }
        Ok(())
    }
}

/// Outcome of applying the policy at exit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleDecision {
    pub probability: f64,
    pub keep: bool,
}

/// Keep iff `draw < probability` for the bucket containing `runtime`.
pub fn decide(table: &SamplingTable, runtime: f64, draw: f64) -> SampleDecision {
    let probability = table.probability(runtime);
    SampleDecision {
        probability,
        keep: draw < probability,
    }
}

/// Bob Jenkins' 96-bit integer mix.
///
/// Siblings launched in the same second share `time()`; mixing in the CPU
/// clock and pid spreads their seeds apart.
#[rustfmt::skip]
pub fn mix(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    a = a.wrapping_sub(b); a = a.wrapping_sub(c); a ^= c >> 13;
    b = b.wrapping_sub(c); b = b.wrapping_sub(a); b ^= a << 8;
    c = c.wrapping_sub(a); c = c.wrapping_sub(b); c ^= b >> 13;
    a = a.wrapping_sub(b); a = a.wrapping_sub(c); a ^= c >> 12;
    b = b.wrapping_sub(c); b = b.wrapping_sub(a); b ^= a << 16;
    c = c.wrapping_sub(a); c = c.wrapping_sub(b); c ^= b >> 5;
    a = a.wrapping_sub(b); a = a.wrapping_sub(c); a ^= c >> 3;
    b = b.wrapping_sub(c); b = b.wrapping_sub(a); b ^= a << 10;
    c = c.wrapping_sub(a); c = c.wrapping_sub(b); c ^= b >> 15;
    c
}

/// Uniform draw in `[0, 1)` from a generator seeded with `seed`.
pub fn draw_with_seed(seed: u32) -> f64 {
    let mut rng = StdRng::seed_from_u64(u64::from(seed));
    rng.random::<f64>()
}

/// Draw once for this process from its clock, wall time and pid.
pub fn draw() -> f64 {
    // SAFETY: a null argument to `time` only returns the value.
    let wall = unsafe { libc::time(std::ptr::null_mut()) };
    draw_with_seed(mix(cpu_clock(), wall as u32, std::process::id()))
}

/// Process CPU time in microseconds, the quantity C `clock()` reports.
pub fn cpu_clock() -> u32 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec.
    if unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64)
        .wrapping_mul(1_000_000)
        .wrapping_add(ts.tv_nsec as u64 / 1_000) as u32
}
