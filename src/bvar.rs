//! In-VM built-in variable runtime (spec §4.E).
//!
//! Ported in semantics from `bpf/get_bvar.c`: a single, non-inlined
//! resolver covering every built-in id, including the `PPID` two-level
//! pointer chase through a `state`-map-supplied struct layout and the
//! string-table offset clamp.

use crate::desc::Prid;
use crate::maps::{CpuInfoMap, ProbesMap, StateMap};
use crate::trampoline::{DispatchContext, FaultKind};

/// Built-in variable identifiers (spec §4.E table). `Unknown` carries the
/// raw id so an out-of-range wire value still dispatches to the
/// `IllegalOp` fault path instead of failing to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BVarId {
    CurThread,
    Timestamp,
    Epid,
    Id,
    Arg(u8),
    Caller,
    ProbeProv,
    ProbeMod,
    ProbeFunc,
    ProbeName,
    Pid,
    Tid,
    Ppid,
    Uid,
    Gid,
    CurCpu,
    Unknown(u32),
}

/// Reads a kernel memory word. The real sandboxed VM does this through an
/// opaque `bpf_probe_read`-style helper that can fail for any address;
/// mocked here so `PPID`'s fault path is testable without a live kernel.
pub trait KernelMemory {
    fn read_u64(&self, addr: u64) -> Option<u64>;
}

/// A simple append-only string table. Built-ins that report probe
/// identity strings return an offset into this table rather than the
/// string itself, matching the wire contract of `PROBEPROV`/`PROBEMOD`/
/// `PROBEFUNC`/`PROBENAME`.
#[derive(Debug, Default)]
pub struct StringTable {
    data: String,
}

impl StringTable {
    pub fn new() -> Self {
        StringTable::default()
    }

    /// Appends `s` (and a terminating nul) and returns its offset.
    pub fn intern(&mut self, s: &str) -> u32 {
        let offset = self.data.len() as u32;
        self.data.push_str(s);
        self.data.push('\0');
        offset
    }

    /// Resolves an offset back to its nul-terminated string. Out-of-range
    /// offsets clamp to the start of the table (spec §4.E) rather than
    /// indexing garbage.
    pub fn str_at(&self, offset: u32) -> &str {
        let start = if (offset as usize) < self.data.len() { offset as usize } else { 0 };
        let rest = &self.data[start..];
        rest.split('\0').next().unwrap_or("")
    }
}

/// Everything `get_bvar` needs beyond the firing's `DispatchContext`:
/// kernel memory access, the per-session struct-offset table, probe
/// identity, per-CPU records, and the ambient pid/tgid/uid/gid/caller the
/// kernel's own helpers would supply.
pub struct BvarEnv<'a> {
    pub mem: &'a dyn KernelMemory,
    pub current_task_ptr: u64,
    pub state: &'a StateMap,
    pub probes: &'a ProbesMap,
    pub string_table: &'a mut StringTable,
    pub cpuinfo: &'a CpuInfoMap,
    pub cpu_id: u32,
    pub pid_tgid: u64,
    pub uid: u32,
    pub gid: u32,
    pub caller: u64,
}

/// Resolves a built-in variable identifier to a 64-bit value, or -1 on
/// fault (spec §4.E). Faults are also recorded on `ctx` via
/// [`DispatchContext::fault`] so the trampoline can halt clause dispatch.
pub fn get_bvar(ctx: &mut DispatchContext<'_>, id: BVarId, env: &mut BvarEnv<'_>) -> i64 {
    match id {
        BVarId::CurThread => env.current_task_ptr as i64,
        BVarId::Timestamp => {
            if ctx.machine.timestamp.is_none() {
                ctx.machine.timestamp = Some(crate::platform::time_ns());
            }
            ctx.machine.timestamp.unwrap() as i64
        }
        BVarId::Epid => ctx.machine.epid as i64,
        BVarId::Id => ctx.machine.prid as i64,
        BVarId::Arg(n) => ctx.machine.args[n as usize],
        BVarId::Caller => env.caller as i64,
        BVarId::ProbeProv | BVarId::ProbeMod | BVarId::ProbeFunc | BVarId::ProbeName => {
            probe_string_offset(ctx, id, env)
        }
        BVarId::Pid => (env.pid_tgid >> 32) as i64,
        BVarId::Tid => (env.pid_tgid & 0xffff_ffff) as i64,
        BVarId::Ppid => resolve_ppid(ctx, env),
        BVarId::Uid => env.uid as i64,
        BVarId::Gid => env.gid as i64,
        BVarId::CurCpu => env
            .cpuinfo
            .get(env.cpu_id)
            .map(|r| r.cpu_id as i64)
            .unwrap_or(-1),
        BVarId::Unknown(raw) => {
            ctx.fault(FaultKind::IllegalOp, raw as u64);
            -1
        }
    }
}

fn probe_string_offset(ctx: &mut DispatchContext<'_>, id: BVarId, env: &mut BvarEnv<'_>) -> i64 {
    // A prid with no `probes` map entry (including one that doesn't even
    // parse as a valid Prid) clamps to the start of the string table
    // rather than faulting, mirroring `key = mst->prid; pinfo =
    // bpf_map_lookup_elem(&probes, &key); if (pinfo == NULL) return
    // (uint64_t)dctx->strtab;`.
    let Some(desc) = Prid::from_raw(ctx.machine.prid).and_then(|prid| env.probes.get(prid)) else {
        return 0;
    };
    let field = match id {
        BVarId::ProbeProv => &desc.provider,
        BVarId::ProbeMod => &desc.module,
        BVarId::ProbeFunc => &desc.function,
        BVarId::ProbeName => &desc.name,
        _ => unreachable!(),
    };
    env.string_table.intern(field) as i64
}

/// `current->real_parent->tgid`: two dependent kernel memory reads
/// through offsets supplied by the host (spec §4.E, §8 scenario 6).
fn resolve_ppid(ctx: &mut DispatchContext<'_>, env: &mut BvarEnv<'_>) -> i64 {
    let real_parent_addr = env.current_task_ptr + env.state.real_parent_offset;
    let Some(real_parent) = env.mem.read_u64(real_parent_addr) else {
        ctx.fault(FaultKind::BadAddress, real_parent_addr);
        return -1;
    };
    let tgid_addr = real_parent + env.state.tgid_offset;
    let Some(tgid) = env.mem.read_u64(tgid_addr) else {
        ctx.fault(FaultKind::BadAddress, tgid_addr);
        return -1;
    };
    tgid as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::{CpuInfoMap, ProbesMap, UsdtPridsMap};
    use crate::trampoline::Activity;
    use std::collections::HashMap;

    struct FakeMemory(HashMap<u64, u64>);

    impl KernelMemory for FakeMemory {
        fn read_u64(&self, addr: u64) -> Option<u64> {
            self.0.get(&addr).copied()
        }
    }

    fn make_ctx<'a>(regs: &'a [i64; 16], usdt: &'a UsdtPridsMap) -> DispatchContext<'a> {
        DispatchContext::new(regs, usdt, Activity::Active, 1234)
    }

    #[test]
    fn ppid_chases_real_parent_then_tgid() {
        let regs = [0i64; 16];
        let usdt = UsdtPridsMap::new();
        let mut ctx = make_ctx(&regs, &usdt);

        let current_task_ptr = 0x1000u64;
        let state = StateMap { real_parent_offset: 0x908, tgid_offset: 0x488 };
        let mem = FakeMemory(HashMap::from([
            (current_task_ptr + state.real_parent_offset, 0x2000u64),
            (0x2000u64 + state.tgid_offset, 42u64),
        ]));
        let probes = ProbesMap::new();
        let mut table = StringTable::new();
        let cpuinfo = CpuInfoMap::new();
        let mut env = BvarEnv {
            mem: &mem,
            current_task_ptr,
            state: &state,
            probes: &probes,
            string_table: &mut table,
            cpuinfo: &cpuinfo,
            cpu_id: 0,
            pid_tgid: 0,
            uid: 0,
            gid: 0,
            caller: 0,
        };

        let result = get_bvar(&mut ctx, BVarId::Ppid, &mut env);
        assert_eq!(result, 42);
        assert!(!ctx.has_faulted());
    }

    #[test]
    fn ppid_faults_on_bad_address() {
        let regs = [0i64; 16];
        let usdt = UsdtPridsMap::new();
        let mut ctx = make_ctx(&regs, &usdt);

        let current_task_ptr = 0x1000u64;
        let state = StateMap { real_parent_offset: 0x908, tgid_offset: 0x488 };
        let mem = FakeMemory(HashMap::new());
        let probes = ProbesMap::new();
        let mut table = StringTable::new();
        let cpuinfo = CpuInfoMap::new();
        let mut env = BvarEnv {
            mem: &mem,
            current_task_ptr,
            state: &state,
            probes: &probes,
            string_table: &mut table,
            cpuinfo: &cpuinfo,
            cpu_id: 0,
            pid_tgid: 0,
            uid: 0,
            gid: 0,
            caller: 0,
        };

        let result = get_bvar(&mut ctx, BVarId::Ppid, &mut env);
        assert_eq!(result, -1);
        assert!(ctx.has_faulted());
    }

    #[test]
    fn unknown_id_raises_illegal_op() {
        let regs = [0i64; 16];
        let usdt = UsdtPridsMap::new();
        let mut ctx = make_ctx(&regs, &usdt);
        let mem = FakeMemory(HashMap::new());
        let state = StateMap::default();
        let probes = ProbesMap::new();
        let mut table = StringTable::new();
        let cpuinfo = CpuInfoMap::new();
        let mut env = BvarEnv {
            mem: &mem,
            current_task_ptr: 0,
            state: &state,
            probes: &probes,
            string_table: &mut table,
            cpuinfo: &cpuinfo,
            cpu_id: 0,
            pid_tgid: 0,
            uid: 0,
            gid: 0,
            caller: 0,
        };
        let result = get_bvar(&mut ctx, BVarId::Unknown(9999), &mut env);
        assert_eq!(result, -1);
        assert!(ctx.has_faulted());
    }

    #[test]
    fn probe_string_with_unknown_prid_clamps_to_table_start_without_faulting() {
        let regs = [0i64; 16];
        let usdt = UsdtPridsMap::new();
        let mut ctx = make_ctx(&regs, &usdt);
        ctx.machine.prid = 777;
        let mem = FakeMemory(HashMap::new());
        let state = StateMap::default();
        let probes = ProbesMap::new();
        let mut table = StringTable::new();
        let cpuinfo = CpuInfoMap::new();
        let mut env = BvarEnv {
            mem: &mem,
            current_task_ptr: 0,
            state: &state,
            probes: &probes,
            string_table: &mut table,
            cpuinfo: &cpuinfo,
            cpu_id: 0,
            pid_tgid: 0,
            uid: 0,
            gid: 0,
            caller: 0,
        };
        let result = get_bvar(&mut ctx, BVarId::ProbeProv, &mut env);
        assert_eq!(result, 0);
        assert!(!ctx.has_faulted());
    }

    #[test]
    fn string_table_clamps_out_of_range_offset() {
        let mut table = StringTable::new();
        table.intern("do_nanosleep");
        assert_eq!(table.str_at(1000), "do_nanosleep");
    }

    #[test]
    fn arg_slots_read_from_machine_state() {
        let regs = [0i64; 16];
        let usdt = UsdtPridsMap::new();
        let mut ctx = make_ctx(&regs, &usdt);
        ctx.machine.args[3] = 77;
        let mem = FakeMemory(HashMap::new());
        let state = StateMap::default();
        let probes = ProbesMap::new();
        let mut table = StringTable::new();
        let cpuinfo = CpuInfoMap::new();
        let mut env = BvarEnv {
            mem: &mem,
            current_task_ptr: 0,
            state: &state,
            probes: &probes,
            string_table: &mut table,
            cpuinfo: &cpuinfo,
            cpu_id: 0,
            pid_tgid: 0,
            uid: 0,
            gid: 0,
            caller: 0,
        };
        assert_eq!(get_bvar(&mut ctx, BVarId::Arg(3), &mut env), 77);
    }
}
