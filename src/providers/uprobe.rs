//! The uprobe-based provider family: `pid`, `usdt`, and their shared
//! underlying uprobe sites.
//!
//! Grounded in `libdtrace/dt_prov_uprobe.c`, which implements all three
//! `dt_provimpl_t`s (`dt_uprobe`, `dt_pid`, `dt_usdt`) in one file because
//! they share the same underlying uprobe sites and most of the trampoline
//! logic; this file follows that precedent.

use std::path::Path;

use crate::backend::{SiteSpec, TracepointBackend};
use crate::desc::{Prid, ProbeDesc};
use crate::error::Result;
use crate::graph::ProbeGraph;
use crate::maps::{UsdtBinding, UsdtKey, UsdtNamesMap, UsdtPridsMap};
use crate::provider::{ProgType, ProviderImpl};
use crate::trampoline::{ignore_clause, uprobe_trampoline, PidDispatch, TrampInsn, MAX_CLAUSES};

/// A compiled clause's own probe description, used only to decide which
/// session-wide clauses a given underlying uprobe site's USDT dispatch
/// should consider (spec §4.D `ignore_clause`).
#[derive(Debug, Clone)]
pub struct Clause {
    pub desc: ProbeDesc,
}

/// The provider backing pid-probes and USDT probes. `populate`/`discover`
/// do nothing on their own: sites are created on demand as the DOF stream
/// (`dof.rs`) or an explicit pid-probe request names them, matching the
/// original's `provide_pid_probe`/`provide_usdt_probe` entry points rather
/// than a static enumeration.
#[derive(Debug, Default)]
pub struct UprobeProvider;

impl UprobeProvider {
    pub fn new() -> Self {
        UprobeProvider
    }
}

impl ProviderImpl for UprobeProvider {
    fn name(&self) -> &str {
        "uprobe"
    }

    fn prog_type(&self) -> ProgType {
        ProgType::Unspecified
    }

    fn attach(&mut self, canonical: &str, graph: &mut ProbeGraph, backend: &mut dyn TracepointBackend) -> Result<()> {
        attach_uprobe_site(canonical, graph, backend)
    }
}

/// The `usdt` provider. Registered under its own name because overlying
/// USDT probes are inserted with provider `"usdt"` (`provide_usdt_probe`,
/// and `ProbeGraph::fanout_add`'s duplicate-USDT check), but it attaches
/// through exactly the same shared underlying uprobe sites as `uprobe`
/// does, following `dt_prov_uprobe.c`'s single implementation file for
/// `dt_uprobe`, `dt_pid`, and `dt_usdt` alike.
#[derive(Debug, Default)]
pub struct UsdtProvider;

impl UsdtProvider {
    pub fn new() -> Self {
        UsdtProvider
    }
}

impl ProviderImpl for UsdtProvider {
    fn name(&self) -> &str {
        "usdt"
    }

    fn prog_type(&self) -> ProgType {
        ProgType::Unspecified
    }

    fn attach(&mut self, canonical: &str, graph: &mut ProbeGraph, backend: &mut dyn TracepointBackend) -> Result<()> {
        attach_uprobe_site(canonical, graph, backend)
    }
}

fn attach_uprobe_site(canonical: &str, graph: &mut ProbeGraph, backend: &mut dyn TracepointBackend) -> Result<()> {
    let Some(under) = graph.underlying(canonical) else {
        return Ok(());
    };
    if under.backend_handle.is_some() {
        return Ok(());
    }
    let Some(site) = under.uprobe.clone() else {
        return Ok(());
    };
    let handle = backend.create(&SiteSpec::User {
        dev: site.device,
        inode: site.inode,
        path: site.mapping_path.clone().into(),
        offset: site.offset,
        is_return: under.flags.is_return,
    })?;
    if let Some(under) = graph.underlying_mut(canonical) {
        under.backend_handle = Some(handle);
    }
    Ok(())
}

/// `provide_pid_probe` (spec §4.B, §8 scenario 2): lookup-or-create the
/// underlying uprobe site, then lookup-or-create the per-process overlying
/// pid probe `pid<pid>:<module>:<function>:{entry,return}` and fan it out.
pub fn provide_pid_probe(
    graph: &mut ProbeGraph,
    pid: u32,
    dev: u64,
    inode: u64,
    mapping_path: &Path,
    function: &str,
    offset: u64,
    is_return: bool,
) -> Result<Prid> {
    let native_argv: Vec<String> = Vec::new();
    let canonical = graph
        .uprobe_underlying_lookup_or_create(dev, inode, function, offset, is_return, &native_argv)
        .canonical
        .clone();
    if let Some(under) = graph.underlying_mut(&canonical) {
        if let Some(site) = under.uprobe.as_mut() {
            site.mapping_path = mapping_path.to_string_lossy().into_owned();
        }
    }

    let module = mapping_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("a.out")
        .to_string();
    let probe_name = if is_return { "return" } else { "entry" };
    let desc = ProbeDesc::new(format!("pid{pid}"), module, function, probe_name);

    let prid = match graph.lookup(&desc) {
        Some(existing) => existing.prid,
        None => graph.insert(desc, "uprobe", Some(pid.to_string()))?,
    };
    graph.fanout_add(prid, &canonical)?;
    Ok(prid)
}

/// `provide_usdt_probe` / `add_probe_usdt` (spec §4.B invariant 5, §4.D
/// step (e)-(g)): lookup-or-create the underlying uprobe site, mark it
/// USDT, and fan out exactly one overlying USDT probe (a second overlying
/// USDT attempt on the same site fails with `DuplicateUsdt`, enforced by
/// `ProbeGraph::fanout_add`).
#[allow(clippy::too_many_arguments)]
pub fn provide_usdt_probe(
    graph: &mut ProbeGraph,
    provider: &str,
    pid: u32,
    dev: u64,
    inode: u64,
    function: &str,
    name: &str,
    offset: u64,
    native_argv: &[String],
) -> Result<Prid> {
    let canonical = graph
        .uprobe_underlying_lookup_or_create(dev, inode, function, offset, false, native_argv)
        .canonical
        .clone();
    let desc = ProbeDesc::new(provider, "a.out", function, name);
    let prid = match graph.lookup(&desc) {
        Some(existing) => existing.prid,
        None => graph.insert(desc, "usdt", Some(pid.to_string()))?,
    };
    graph.fanout_add(prid, &canonical)?;
    Ok(prid)
}

/// Computes the clause-selector bitmask for a firing (spec §3 "Clause
/// selector bitmask", §4.D step (g)): among the session's registered
/// clauses, in registration order and capped at [`MAX_CLAUSES`], a bit is
/// set iff the clause is not excluded by [`ignore_clause`] and its own
/// description matches the bound overlying probe's description.
pub fn compute_usdt_mask(underlying_function: &str, overlying_desc: &ProbeDesc, clauses: &[Clause]) -> u64 {
    let mut mask = 0u64;
    for (i, clause) in clauses.iter().enumerate().take(MAX_CLAUSES as usize) {
        if ignore_clause(underlying_function, &clause.desc) {
            continue;
        }
        if overlying_desc.matches(&clause.desc) {
            mask |= 1 << i;
        }
    }
    mask
}

/// Binds a USDT probe into the kernel-visible maps for a live pid (the
/// `usdt_prids`/`usdt_names` writes in `add_probe_usdt`).
pub fn bind_usdt(
    usdt_prids: &mut UsdtPridsMap,
    usdt_names: &mut UsdtNamesMap,
    pid: u32,
    underlying_prid: u32,
    overlying_prid: Prid,
    mask: u64,
    name: &str,
) {
    let key = UsdtKey::new(pid, underlying_prid);
    usdt_prids.insert(key, UsdtBinding { overlying_prid, mask });
    usdt_names.insert(key, name.to_string());
}

/// Generates the uprobe/USDT trampoline for an underlying site (spec
/// §4.D). `pid_dispatch` enumerates the site's pid-probe overlyings in
/// registration order; the USDT tail is included only for non-return
/// entry sites.
pub fn trampoline_for(
    graph: &ProbeGraph,
    canonical: &str,
    pid_dispatch: &[PidDispatch],
    usdt_clause_count: u32,
) -> Vec<TrampInsn> {
    let Some(under) = graph.underlying(canonical) else {
        return Vec::new();
    };
    let is_enabled = under.flags.is_enabled_query;
    uprobe_trampoline(
        pid_dispatch,
        under.prid.get(),
        under.flags.is_return,
        is_enabled,
        under.flags.has_arg_mapping,
        usdt_clause_count,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn provide_pid_probe_twice_yields_one_underlying_and_one_overlying() {
        let mut graph = ProbeGraph::new();
        let path = PathBuf::from("/bin/x");
        let prid1 = provide_pid_probe(&mut graph, 1234, 0xfe01, 0x77, &path, "main", 0x400100, false).unwrap();
        let prid2 = provide_pid_probe(&mut graph, 1234, 0xfe01, 0x77, &path, "main", 0x400100, false).unwrap();
        assert_eq!(prid1, prid2);

        assert_eq!(graph.underlying_iter().count(), 1);
        let under = graph.underlying_iter().next().unwrap();
        assert_eq!(under.canonical, "uprobe:fe01_77:main:400100");
        assert_eq!(under.overlying.len(), 1);

        let desc = ProbeDesc::new("pid1234", "x", "main", "entry");
        assert!(graph.lookup(&desc).is_some());
    }

    #[test]
    fn second_usdt_overlying_on_same_site_is_rejected() {
        let mut graph = ProbeGraph::new();
        let argv: Vec<String> = Vec::new();
        provide_usdt_probe(&mut graph, "test_prov1234", 1234, 1, 1, "main", "place", 0x10, &argv).unwrap();
        let err = provide_usdt_probe(&mut graph, "test_prov1234", 1234, 1, 1, "main", "place2", 0x10, &argv).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DuplicateUsdt);
    }

    #[test]
    fn usdt_mask_sets_bits_for_matching_non_excluded_clauses() {
        let overlying_desc = ProbeDesc::new("test_prov1234", "a.out", "main", "place");
        let clauses = vec![
            Clause { desc: ProbeDesc::new("test_prov*", "*", "*", "place") },
            Clause { desc: ProbeDesc::new("test_prov*", "*", "*", "place2") },
            Clause { desc: ProbeDesc::new("pid1234", "*", "*", "entry") },
        ];
        let mask = compute_usdt_mask("main", &overlying_desc, &clauses);
        assert_eq!(mask, 0b001);
    }
}
