//! Session configuration: a small struct gating I/O paths and operating
//! policy rather than hardcoding them, so tests can point the session at a
//! scratch directory and a real host can point it at the live kernel.

use std::path::PathBuf;
use std::time::Duration;

/// Session-wide configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Root of the tracefs mount, e.g. `/sys/kernel/debug/tracing`.
    /// Overridable so tests point it at a temp directory instead of the
    /// real kernel control files.
    pub tracefs_root: PathBuf,

    /// How often [`crate::session::Session::discover_tick`] should be
    /// driven by a caller running its own loop (the core does not spawn
    /// threads or timers itself; spec §5 is single-threaded cooperative).
    pub discovery_interval: Duration,

    /// Whether destructive actions (writes to instrumented process memory
    /// beyond the is-enabled witness write) are permitted this session.
    /// Gates `ErrorKind::DestructiveDisallowed` (spec §7), mirroring
    /// `add_probe_uprobe`'s `EDT_DESTRUCTIVE` check in the original source.
    pub destructive: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            tracefs_root: PathBuf::from("/sys/kernel/debug/tracing"),
            discovery_interval: Duration::from_millis(100),
            destructive: false,
        }
    }
}

impl SessionConfig {
    pub fn kprobe_events_path(&self) -> PathBuf {
        self.tracefs_root.join("kprobe_events")
    }

    pub fn uprobe_events_path(&self) -> PathBuf {
        self.tracefs_root.join("uprobe_events")
    }

    pub fn events_dir(&self) -> PathBuf {
        self.tracefs_root.join("events")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_point_at_real_tracefs() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.kprobe_events_path(), PathBuf::from("/sys/kernel/debug/tracing/kprobe_events"));
        assert!(!cfg.destructive);
    }
}
