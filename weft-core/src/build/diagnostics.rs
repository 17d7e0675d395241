//! Structured parsing of compiler output.
//!
//! The external template compiler reports problems as
//! `file:line:col: [severity:] message` lines on stderr. Anything that does
//! not match stays available to callers through the raw output, but only
//! matching lines become [`Diagnostic`] entries.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::component::{Diagnostic, Severity};

static DIAGNOSTIC_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^(?P<file>[^\s:][^:\n]*):(?P<line>\d+):(?P<col>\d+):\s*(?:(?P<sev>error|warning|note):\s*)?(?P<msg>.+?)\s*$",
    )
    .expect("diagnostic regex")
});

/// Extract every structured diagnostic from compiler output.
pub fn parse_diagnostics(output: &str) -> Vec<Diagnostic> {
    DIAGNOSTIC_LINE
        .captures_iter(output)
        .filter_map(|caps| {
            let line = caps["line"].parse().ok()?;
            let column = caps["col"].parse().ok()?;
            let severity = match caps.name("sev").map(|m| m.as_str()) {
                Some("warning") => Severity::Warning,
                Some("note") => Severity::Note,
                _ => Severity::Error,
            };
            Some(Diagnostic {
                file: caps["file"].to_string(),
                line,
                column,
                message: caps["msg"].to_string(),
                severity,
            })
        })
        .collect()
}
