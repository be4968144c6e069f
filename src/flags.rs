//! Runtime configuration.
//!
//! Flags arrive either programmatically or as an environment-style
//! string of colon-separated `key=value` pairs, e.g.
//! `error_exitcode=1:thread_quarantine_size=32`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Engine configuration knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// Process exit code `finalize` returns once any race was reported.
    pub error_exitcode: i32,
    /// Dead thread slots held in quarantine before reuse begins.
    pub thread_quarantine_size: usize,
    /// Write rendered reports to stderr as they are emitted. Reports are
    /// always available from the report sink regardless.
    pub print_reports: bool,
    /// Report threads still alive or unjoined at finalize.
    pub report_thread_leaks: bool,
    /// Capacity of the lock-free report sink; further reports are
    /// dropped (and counted) rather than blocking the hot path.
    pub report_sink_capacity: usize,
    /// Recent-report window used to suppress duplicate reports.
    pub report_dedup_window: usize,
    /// Accumulate and merge statistics counters.
    pub collect_stats: bool,
    /// Write the statistics summary to stderr at finalize.
    pub print_stats: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            error_exitcode: 66,
            thread_quarantine_size: 100,
            print_reports: false,
            report_thread_leaks: true,
            report_sink_capacity: 128,
            report_dedup_window: 64,
            collect_stats: true,
            print_stats: false,
        }
    }
}

impl Flags {
    /// Parse a `key=value:key=value` option string on top of defaults.
    pub fn parse(options: &str) -> Result<Flags> {
        let mut flags = Flags::default();
        for pair in options.split(':') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("malformed option `{pair}`, expected key=value"))?;
            match key {
                "error_exitcode" => flags.error_exitcode = parse_value(key, value)?,
                "thread_quarantine_size" => {
                    flags.thread_quarantine_size = parse_value(key, value)?
                }
                "print_reports" => flags.print_reports = parse_bool(key, value)?,
                "report_thread_leaks" => flags.report_thread_leaks = parse_bool(key, value)?,
                "report_sink_capacity" => flags.report_sink_capacity = parse_value(key, value)?,
                "report_dedup_window" => flags.report_dedup_window = parse_value(key, value)?,
                "collect_stats" => flags.collect_stats = parse_bool(key, value)?,
                "print_stats" => flags.print_stats = parse_bool(key, value)?,
                _ => bail!("unknown option `{key}`"),
            }
        }
        Ok(flags)
    }

    /// Parse the `CENTINELA_OPTIONS` environment variable if present.
    pub fn from_env() -> Result<Flags> {
        match std::env::var("CENTINELA_OPTIONS") {
            Ok(options) => Flags::parse(&options),
            Err(_) => Ok(Flags::default()),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid value `{value}` for option `{key}`"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => bail!("invalid value `{value}` for option `{key}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let f = Flags::default();
        assert_eq!(f.error_exitcode, 66);
        assert_eq!(f.thread_quarantine_size, 100);
        assert!(!f.print_reports);
        assert!(f.report_thread_leaks);
    }

    #[test]
    fn parse_overrides() {
        let f = Flags::parse("error_exitcode=1:thread_quarantine_size=7:print_reports=yes")
            .unwrap();
        assert_eq!(f.error_exitcode, 1);
        assert_eq!(f.thread_quarantine_size, 7);
        assert!(f.print_reports);
        // untouched keys keep defaults
        assert_eq!(f.report_sink_capacity, 128);
    }

    #[test]
    fn parse_rejects_unknown_keys() {
        assert!(Flags::parse("no_such_flag=1").is_err());
    }

    #[test]
    fn parse_rejects_malformed_pairs() {
        assert!(Flags::parse("error_exitcode").is_err());
        assert!(Flags::parse("print_reports=maybe").is_err());
    }

    #[test]
    fn empty_segments_are_skipped() {
        let f = Flags::parse("::error_exitcode=2::").unwrap();
        assert_eq!(f.error_exitcode, 2);
    }
}
