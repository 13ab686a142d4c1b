//! `runtrack sample`: sampling table lookup.

use runtrack_core::config::vars;
use runtrack_core::sampling::{self, SamplingTable};

/// Run the sample command.
pub fn run(runtime: f64, draw: Option<f64>, table: Option<&str>) {
    let text = table
        .map(str::to_string)
        .or_else(|| std::env::var(vars::SAMPLING_TABLE).ok());
    let table = match text {
        Some(t) => match t.parse::<SamplingTable>() {
            Ok(table) => table,
            Err(e) => {
                eprintln!("Invalid sampling table {t:?}: {e}");
                std::process::exit(1);
            }
        },
        None => SamplingTable::default(),
    };
    if let Some(d) = draw
        && !(0.0..1.0).contains(&d)
    {
        eprintln!("--draw must be in [0, 1), got {d}");
        std::process::exit(1);
    }
    let draw = draw.unwrap_or_else(sampling::draw);

    let decision = sampling::decide(&table, runtime, draw);
    println!("table:       {table}");
    println!("runtime:     {runtime}s");
    println!("probability: {}", decision.probability);
    println!("draw:        {draw:.6}");
    println!("decision:    {}", if decision.keep { "keep" } else { "discard" });
}
