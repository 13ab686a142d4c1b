//! `runtrack argv`: build the command-line payload.

use runtrack_core::argv::{self, JsonQuoter};
use serde::Serialize;

#[derive(Serialize)]
struct ArgvReport<'a> {
    args: &'a [String],
    json: &'a str,
    bytes: usize,
    bound: usize,
    payload: &'a str,
}

/// Run the argv command.
pub fn run(args: &[String], json: bool) {
    let built = match argv::serialize(args, &JsonQuoter) {
        Ok(built) => built,
        Err(reason) => {
            eprintln!("Cannot build payload: {reason}");
            std::process::exit(1);
        }
    };
    let report = ArgvReport {
        args,
        json: &built.raw,
        bytes: built.raw.len(),
        bound: argv::size_bound(args),
        payload: &built.encoded,
    };

    if json {
        super::print_json(&report);
        return;
    }
    println!("json:    {}", report.json);
    println!("bytes:   {} (bound {})", report.bytes, report.bound);
    println!("payload: {}", report.payload);
}
