//! config.rs — runtime configuration for the compiler and VM.
//!
//! clox gates its debug instrumentation behind `#define` compile-time
//! flags (`DEBUG_PRINT_CODE`, `DEBUG_TRACE_EXECUTION`, `DEBUG_STRESS_GC`,
//! `DEBUG_LOG_GC`). A Rust build can't cheaply offer four separate
//! binaries for every toggle combination, so `SPEC_FULL.md` resolves
//! that as an open question by making them runtime [`Config`] fields,
//! readable from `VITTE_DEBUG_*` environment variables the same way the
//! teacher's own `VITTE_CORE_*` knobs were — see `apply_env` below.

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Disassemble every chunk right after it's compiled.
    pub debug_print_code: bool,
    /// Trace each instruction and the stack contents before executing it.
    pub debug_trace_execution: bool,
    /// Run a collection before every allocation, to shake out missing roots.
    pub debug_stress_gc: bool,
    /// Log each collection's before/after heap size.
    pub debug_log_gc: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        c.apply_env();
        c
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = read_env("VITTE_DEBUG_PRINT_CODE") {
            if let Some(b) = parse_bool(&v) {
                self.debug_print_code = b;
            }
        }
        if let Some(v) = read_env("VITTE_DEBUG_TRACE_EXECUTION") {
            if let Some(b) = parse_bool(&v) {
                self.debug_trace_execution = b;
            }
        }
        if let Some(v) = read_env("VITTE_DEBUG_STRESS_GC") {
            if let Some(b) = parse_bool(&v) {
                self.debug_stress_gc = b;
            }
        }
        if let Some(v) = read_env("VITTE_DEBUG_LOG_GC") {
            if let Some(b) = parse_bool(&v) {
                self.debug_log_gc = b;
            }
        }
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_all_off() {
        let c = Config::default();
        assert!(!c.debug_print_code);
        assert!(!c.debug_trace_execution);
        assert!(!c.debug_stress_gc);
        assert!(!c.debug_log_gc);
    }

    #[test]
    fn parses_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
