//! OS-facing primitives, isolated behind a small testable surface.
//!
//! Every place the rest of the crate would otherwise reach for a raw
//! syscall (process liveness, a monotonic clock, the kernel's packed
//! pid/tgid word) goes through here instead, so the control plane and the
//! in-VM runtime can both be driven from tests without a real kernel or
//! live processes underneath.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Platform operations trait. Abstracts over the host-specific primitives
/// the real `dtrace` control plane calls through libc/procfs.
pub trait PlatformOps {
    /// Monotonic nanoseconds since an arbitrary epoch (the `TIMESTAMP`
    /// built-in's source, spec §4.E).
    fn time_ns() -> u64;

    /// The CPU this call is currently running on.
    fn cpu_id() -> u32;

    /// Whether a process with this pid is currently live. Backs the
    /// discovery loop's stale-USDT prune (spec §4.F step 1) and the
    /// pid-reconciliation of step 2.
    fn process_exists(pid: u32) -> bool;

    /// The kernel's packed pid/tgid word: pid in the upper 32 bits, tid in
    /// the lower 32 (spec §4.D step (a), §4.E `PID`/`TID`).
    fn pid_tgid() -> u64;
}

// ============================================================================
// Real implementation (std, talks to the actual OS)
// ============================================================================

#[cfg(feature = "real-platform")]
pub struct RealPlatform;

#[cfg(feature = "real-platform")]
impl PlatformOps for RealPlatform {
    fn time_ns() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    fn cpu_id() -> u32 {
        0
    }

    fn process_exists(pid: u32) -> bool {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    fn pid_tgid() -> u64 {
        let pid = std::process::id() as u64;
        (pid << 32) | pid
    }
}

// ============================================================================
// Mock implementation (test environment)
// ============================================================================

static MOCK_TIME_NS: AtomicU64 = AtomicU64::new(1_000_000_000);
static MOCK_CPU_ID: AtomicU32 = AtomicU32::new(0);
static MOCK_PID_TGID: AtomicU64 = AtomicU64::new((1234u64 << 32) | 1234);

static MOCK_LIVE_PIDS: Mutex<Vec<u32>> = Mutex::new(Vec::new());

pub struct MockPlatform;

impl PlatformOps for MockPlatform {
    fn time_ns() -> u64 {
        MOCK_TIME_NS.load(Ordering::Relaxed)
    }

    fn cpu_id() -> u32 {
        MOCK_CPU_ID.load(Ordering::Relaxed)
    }

    fn process_exists(pid: u32) -> bool {
        MOCK_LIVE_PIDS.lock().unwrap().contains(&pid)
    }

    fn pid_tgid() -> u64 {
        MOCK_PID_TGID.load(Ordering::Relaxed)
    }
}

pub fn set_mock_time(ns: u64) {
    MOCK_TIME_NS.store(ns, Ordering::Relaxed);
}

pub fn advance_mock_time(ns: u64) {
    MOCK_TIME_NS.fetch_add(ns, Ordering::Relaxed);
}

pub fn set_mock_cpu_id(id: u32) {
    MOCK_CPU_ID.store(id, Ordering::Relaxed);
}

pub fn set_mock_pid_tgid(pid: u32, tgid: u32) {
    MOCK_PID_TGID.store(((tgid as u64) << 32) | pid as u64, Ordering::Relaxed);
}

/// Mark a pid as live for [`MockPlatform::process_exists`].
pub fn mock_spawn_pid(pid: u32) {
    let mut live = MOCK_LIVE_PIDS.lock().unwrap();
    if !live.contains(&pid) {
        live.push(pid);
    }
}

/// Mark a pid as no longer live.
pub fn mock_kill_pid(pid: u32) {
    MOCK_LIVE_PIDS.lock().unwrap().retain(|&p| p != pid);
}

// Gated on a Cargo feature rather than `cfg(test)`: integration tests under
// `tests/` link this crate as an ordinary dependency, not as its own test
// binary, so `cfg(test)` would not hold there and `mock_spawn_pid`/etc. would
// silently affect nothing. `real-platform` is off by default so every normal
// build, unit test, and integration test gets `MockPlatform`; the real CLI
// host (out of scope here, spec §1) opts in with `--features real-platform`.
#[cfg(feature = "real-platform")]
pub type Platform = RealPlatform;

#[cfg(not(feature = "real-platform"))]
pub type Platform = MockPlatform;

#[inline]
pub fn time_ns() -> u64 {
    Platform::time_ns()
}

#[inline]
pub fn cpu_id() -> u32 {
    Platform::cpu_id()
}

#[inline]
pub fn process_exists(pid: u32) -> bool {
    Platform::process_exists(pid)
}

#[inline]
pub fn pid_tgid() -> u64 {
    Platform::pid_tgid()
}
