//! JSON payload of the user's command line.
//!
//! The command line is turned into a JSON array of strings. The raw text is
//! only ever logged; the recorder receives the base64 transport form, so no
//! argument content can reach it unencoded.
//!
//! # Size bound
//!
//! For `N` arguments totalling `C` bytes the finished text never needs more
//! than `3C + 3N + 3` bytes: each input byte expands to at most three output
//! bytes, each argument adds two quotes and a separator, and the brackets plus
//! a terminator add three. The bound is used as the capacity hint and checked
//! after construction; a quoter that breaks it yields
//! [`RejectReason::BadJson`] instead of a record.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::reject::RejectReason;

/// Escapes one argument for placement between JSON double quotes.
pub trait ArgQuoter: Send {
    fn quote(&self, arg: &str, out: &mut String);
}

/// Minimal JSON string escaper that never expands a byte beyond three bytes.
///
/// Quotes, backslashes and the short control escapes (`\b \f \n \r \t`) are
/// escaped; any other ASCII control character is replaced with U+FFFD.
/// C1 controls pass through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonQuoter;

impl ArgQuoter for JsonQuoter {
    fn quote(&self, arg: &str, out: &mut String) {
        for ch in arg.chars() {
            match ch {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                '\u{08}' => out.push_str("\\b"),
                '\u{0c}' => out.push_str("\\f"),
                c if c.is_control() && (c as u32) < 0x80 => out.push(char::REPLACEMENT_CHARACTER),
                c => out.push(c),
            }
        }
    }
}

/// The serialized command line in both of its forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgvJson {
    /// JSON array text. Diagnostics only.
    pub raw: String,
    /// Base64 of `raw`. The only form handed to the recorder.
    pub encoded: String,
}

/// Worst-case length of the JSON array for `args`.
pub fn size_bound<S: AsRef<str>>(args: &[S]) -> usize {
    let chars: usize = args.iter().map(|a| a.as_ref().len()).sum();
    chars * 3 + args.len() * 3 + 3
}

/// Build the JSON array for `args` with `quoter`.
pub fn serialize<S: AsRef<str>>(
    args: &[S],
    quoter: &dyn ArgQuoter,
) -> Result<ArgvJson, RejectReason> {
    let bound = size_bound(args);
    let mut raw = String::with_capacity(bound);
    raw.push('[');
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            raw.push(',');
        }
        raw.push('"');
        quoter.quote(arg.as_ref(), &mut raw);
        raw.push('"');
    }
    raw.push(']');

    // The terminator byte of the bound has no counterpart in a `String`.
    if raw.len() + 1 > bound {
        log::error!(
            "failure building the command line JSON string: {} bytes exceeds bound {bound}",
            raw.len() + 1
        );
        return Err(RejectReason::BadJson);
    }

    let encoded = encode(raw.as_bytes());
    Ok(ArgvJson { raw, encoded })
}

/// Transport encoding used for every free-form value sent to the recorder.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Inverse of [`encode`]; `None` for text that is not valid base64 or UTF-8.
pub fn decode(encoded: &str) -> Option<String> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Decode a transport payload back into the argument list.
pub fn decode_args(encoded: &str) -> Option<Vec<String>> {
    serde_json::from_str(&decode(encoded)?).ok()
}

/// Quote `s` with the default quoter, for display inside double quotes.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    JsonQuoter.quote(s, &mut out);
    out
}
