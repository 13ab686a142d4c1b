pub mod argv;
pub mod check;
pub mod decode;
pub mod sample;

/// Print `value` as pretty JSON, or exit on a serialization failure.
pub fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => {
            eprintln!("Failed to serialize output: {e}");
            std::process::exit(1);
        }
    }
}
