//! `runtrack decode`: inverse of the transport encoding.

use runtrack_core::argv;

/// Run the decode command.
pub fn run(payload: &str) {
    match argv::decode_args(payload) {
        Some(args) => super::print_json(&args),
        None => match argv::decode(payload) {
            // Valid base64 but not an argument list (a watermark, say).
            Some(text) => println!("{text}"),
            None => {
                eprintln!("Not a valid payload: {payload}");
                std::process::exit(1);
            }
        },
    }
}
