//! Kernel map storage used by the data plane.
//!
//! A `HashMap`-backed stand-in for the five named maps (`usdt_prids`,
//! `usdt_names`, `probes`, `state`, `cpuinfo`), typed by key/value shape
//! rather than treated as generic byte blobs, since this crate is std and
//! every map here has a fixed, known shape.

use std::collections::HashMap;

use crate::desc::{Prid, ProbeDesc};

/// Key into `usdt_prids` / `usdt_names`: a `(pid, underlying PRID)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsdtKey {
    pub pid: u32,
    pub underlying_prid: u32,
}

impl UsdtKey {
    pub fn new(pid: u32, underlying_prid: u32) -> Self {
        UsdtKey { pid, underlying_prid }
    }
}

/// Value stored in `usdt_prids`: the overlying probe bound for this
/// `(pid, underlying)` pair, and its clause-selector bitmask.
#[derive(Debug, Clone, Copy)]
pub struct UsdtBinding {
    pub overlying_prid: Prid,
    pub mask: u64,
}

/// `usdt_prids`: written by user space at control time, read by the
/// trampoline on every firing (spec §5 "Shared resources").
#[derive(Debug, Default)]
pub struct UsdtPridsMap {
    entries: HashMap<UsdtKey, UsdtBinding>,
}

impl UsdtPridsMap {
    pub fn new() -> Self {
        UsdtPridsMap::default()
    }

    pub fn insert(&mut self, key: UsdtKey, binding: UsdtBinding) {
        self.entries.insert(key, binding);
    }

    pub fn get(&self, key: &UsdtKey) -> Option<&UsdtBinding> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &UsdtKey) -> Option<UsdtBinding> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collect-then-delete pattern for the discovery loop (spec §4.F step
    /// 1): key iteration must not be disturbed by concurrent deletion, so
    /// callers pass a predicate, get back the matching keys, then call
    /// [`Self::remove`] for each once iteration is done.
    pub fn keys_matching(&self, mut pred: impl FnMut(&UsdtKey) -> bool) -> Vec<UsdtKey> {
        self.entries.keys().copied().filter(|k| pred(k)).collect()
    }
}

/// `usdt_names`: the human-readable probe name paired with each
/// `usdt_prids` entry, keyed identically.
#[derive(Debug, Default)]
pub struct UsdtNamesMap {
    entries: HashMap<UsdtKey, String>,
}

impl UsdtNamesMap {
    pub fn new() -> Self {
        UsdtNamesMap::default()
    }

    pub fn insert(&mut self, key: UsdtKey, name: impl Into<String>) {
        self.entries.insert(key, name.into());
    }

    pub fn get(&self, key: &UsdtKey) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &UsdtKey) -> Option<String> {
        self.entries.remove(key)
    }
}

/// `probes`: a PRID-indexed table of probe identity, read by `bvar.rs`'s
/// `PROBEPROV`/`PROBEMOD`/`PROBEFUNC`/`PROBENAME` built-ins.
#[derive(Debug, Default)]
pub struct ProbesMap {
    entries: HashMap<u32, ProbeDesc>,
}

impl ProbesMap {
    pub fn new() -> Self {
        ProbesMap::default()
    }

    pub fn insert(&mut self, prid: Prid, desc: ProbeDesc) {
        self.entries.insert(prid.get(), desc);
    }

    pub fn get(&self, prid: Prid) -> Option<&ProbeDesc> {
        self.entries.get(&prid.get())
    }

    pub fn remove(&mut self, prid: Prid) {
        self.entries.remove(&prid.get());
    }
}

/// `state`: per-session scalar configuration read by the in-VM runtime,
/// notably the `real_parent`/`tgid` struct offsets the `PPID` built-in
/// needs (spec §4.E, §8 scenario 6). Kernel layouts vary by build; these
/// are supplied by the host at session start rather than hardcoded.
#[derive(Debug, Clone, Copy)]
pub struct StateMap {
    pub real_parent_offset: u64,
    pub tgid_offset: u64,
}

impl Default for StateMap {
    fn default() -> Self {
        // Matches a common x86_64 task_struct layout; also the values used
        // by spec scenario 6. Overridden by the host when the real layout
        // is known.
        StateMap {
            real_parent_offset: 0x908,
            tgid_offset: 0x488,
        }
    }
}

/// `cpuinfo`: one record per CPU, indexed by CPU id, read by the `CURCPU`
/// built-in.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuInfoRecord {
    pub cpu_id: u32,
}

#[derive(Debug, Default)]
pub struct CpuInfoMap {
    entries: HashMap<u32, CpuInfoRecord>,
}

impl CpuInfoMap {
    pub fn new() -> Self {
        CpuInfoMap::default()
    }

    pub fn set(&mut self, cpu_id: u32, record: CpuInfoRecord) {
        self.entries.insert(cpu_id, record);
    }

    pub fn get(&self, cpu_id: u32) -> Option<&CpuInfoRecord> {
        self.entries.get(&cpu_id)
    }
}
