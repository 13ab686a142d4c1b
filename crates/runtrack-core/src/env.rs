//! Process environment access.
//!
//! Environment variables are the only state the shim shares with the host
//! program and its children. Every read and write goes through [`Env`] so the
//! lifecycle can run against the real process ([`ProcessEnv`]) or against an
//! isolated map ([`MemEnv`]) in tests and dry runs.

use std::collections::HashMap;
use std::ffi::OsString;

/// Read/write view of a process environment.
pub trait Env: Send {
    /// Value of `key`, or `None` when unset or not valid UTF-8.
    fn get(&self, key: &str) -> Option<String>;

    /// Set `key` to `value`, overwriting any previous value.
    fn set(&mut self, key: &str, value: &str);

    /// Remove `key` if present.
    fn remove(&mut self, key: &str);

    /// True if `key` is set to exactly `value`.
    fn is(&self, key: &str, value: &str) -> bool {
        self.get(key).is_some_and(|v| v == value)
    }
}

/// The environment of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl Env for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn set(&mut self, key: &str, value: &str) {
        // SAFETY: the shim mutates the environment only from the process
        // constructor, the destructor, or a fatal-signal handler. Host threads
        // started before the constructor do not exist, and the destructor and
        // handler run while the process is winding down.
        unsafe { std::env::set_var(key, value) }
    }

    fn remove(&mut self, key: &str) {
        // SAFETY: see `set`.
        unsafe { std::env::remove_var(key) }
    }
}

/// An in-memory environment.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemEnv {
    vars: HashMap<String, String>,
}

impl MemEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment (non-UTF-8 entries skipped).
    pub fn snapshot() -> Self {
        Self::from_os_vars(std::env::vars_os())
    }

    /// Build from raw OS pairs, dropping any that are not valid UTF-8.
    pub fn from_os_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        Self {
            vars: vars
                .into_iter()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MemEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Env for MemEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.vars.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_env_set_get_remove() {
        let mut env = MemEnv::new().with("A", "1");
        assert_eq!(env.get("A").as_deref(), Some("1"));
        env.set("A", "2");
        assert!(env.is("A", "2"));
        env.remove("A");
        assert!(env.get("A").is_none());
        assert!(!env.contains("A"));
    }

    #[test]
    fn mem_env_from_pairs() {
        let env: MemEnv = [("X", "y")].into_iter().collect();
        assert!(env.is("X", "y"));
        assert!(!env.is("X", "z"));
    }

    #[test]
    fn non_utf8_entries_are_skipped() {
        use std::os::unix::ffi::OsStringExt;
        let junk = OsString::from_vec(vec![0xff, 0xfe]);
        let env = MemEnv::from_os_vars([
            (OsString::from("JUNK"), junk.clone()),
            (junk, OsString::from("v")),
            (OsString::from("PATH"), OsString::from("/usr/bin")),
        ]);
        assert!(!env.contains("JUNK"));
        assert!(env.is("PATH", "/usr/bin"));
    }

    #[test]
    fn snapshot_of_process_environment_does_not_panic() {
        let env = MemEnv::snapshot();
        if let Ok(path) = std::env::var("PATH") {
            assert!(env.is("PATH", &path));
        }
    }
}
