//! The `rawfbt` (kernel function boundary) provider.
//!
//! Grounded in `libdtrace/dt_prov_rawfbt.c`: `populate()` scans a list of
//! candidate kernel function names (the real source reads
//! `available_filter_functions`), excludes ftrace/probestub/traceiter
//! synthetic entries, truncates compiler-synthesized `name.suffix` symbols
//! at the `.` for module lookup, and destroys a previously-inserted entry
//! probe of the same function before inserting a later duplicate line
//! ("last one wins", since the kernel refuses duplicate kprobe names).

use std::collections::HashMap;
use std::path::PathBuf;

use crate::backend::{SiteSpec, TracepointBackend};
use crate::desc::{Prid, ProbeDesc};
use crate::error::Result;
use crate::graph::ProbeGraph;
use crate::provider::{ProgType, ProviderImpl};
use crate::trampoline::{rawfbt_trampoline, TrampInsn};

/// Prefixes `populate()` must never turn into probes: ftrace's invalid
/// placeholder, stub trampolines, and trace-iterator shims.
const EXCLUDED_PREFIXES: [&str; 3] = ["__ftrace_invalid_address__", "__probestub_", "__traceiter_"];

/// The module rawfbt attributes every kernel function to, absent a real
/// module-resolution table.
const KERNEL_MODULE: &str = "vmlinux";

pub struct RawfbtProvider {
    /// Source of candidate function names, one per line, matching the
    /// shape of `/sys/kernel/debug/tracing/available_filter_functions`.
    /// Overridable so tests supply a fixed list via a temp file.
    pub source_path: PathBuf,
}

impl RawfbtProvider {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        RawfbtProvider { source_path: source_path.into() }
    }
}

/// Strips a compiler-synthesized `.llvm.<hash>`-style suffix for module
/// lookup purposes, as `dt_prov_rawfbt.c`'s `populate()` does; the
/// original (unsuffixed) name is still used as the probe's function field.
fn synthetic_lookup_name(name: &str) -> &str {
    name.split_once('.').map(|(base, _)| base).unwrap_or(name)
}

impl ProviderImpl for RawfbtProvider {
    fn name(&self) -> &str {
        "rawfbt"
    }

    fn prog_type(&self) -> ProgType {
        ProgType::Kprobe
    }

    fn populate(&mut self, graph: &mut ProbeGraph) -> Result<()> {
        let contents = std::fs::read_to_string(&self.source_path).unwrap_or_default();
        let mut entry_prids: HashMap<String, Prid> = HashMap::new();

        for line in contents.lines() {
            let raw_name = line.split_whitespace().next().unwrap_or("");
            if raw_name.is_empty() {
                continue;
            }
            if EXCLUDED_PREFIXES.iter().any(|p| raw_name.starts_with(p)) {
                continue;
            }
            let _module_lookup_name = synthetic_lookup_name(raw_name);
            let function = raw_name.to_string();

            if let Some(prev) = entry_prids.remove(&function) {
                graph.destroy(prev).ok();
            }

            let entry_desc = ProbeDesc::new("rawfbt", KERNEL_MODULE, &function, "entry");
            let entry_prid = graph.insert(entry_desc, "rawfbt", None)?;
            let entry_canonical = graph
                .rawfbt_underlying_lookup_or_create(KERNEL_MODULE, &function, false)
                .canonical
                .clone();
            graph.fanout_add(entry_prid, &entry_canonical)?;
            entry_prids.insert(function.clone(), entry_prid);

            let return_desc = ProbeDesc::new("rawfbt", KERNEL_MODULE, &function, "return");
            if graph.lookup(&return_desc).is_none() {
                let return_prid = graph.insert(return_desc, "rawfbt", None)?;
                let return_canonical = graph
                    .rawfbt_underlying_lookup_or_create(KERNEL_MODULE, &function, true)
                    .canonical
                    .clone();
                graph.fanout_add(return_prid, &return_canonical)?;
            }
        }

        log::info!("rawfbt populated {} entry probes", entry_prids.len());
        Ok(())
    }

    fn trampoline(&self, canonical: &str, graph: &ProbeGraph) -> Vec<TrampInsn> {
        match graph.underlying(canonical) {
            Some(under) => rawfbt_trampoline(under.overlying.len() as u32, under.flags.is_return),
            None => Vec::new(),
        }
    }

    fn attach(&mut self, canonical: &str, graph: &mut ProbeGraph, backend: &mut dyn TracepointBackend) -> Result<()> {
        let Some(under) = graph.underlying(canonical) else {
            return Ok(());
        };
        let function = under
            .canonical
            .split(':')
            .nth(2)
            .unwrap_or_default()
            .to_string();
        let is_return = under.flags.is_return;
        let handle = backend.create(&SiteSpec::Kernel { function, is_return })?;
        if let Some(under) = graph.underlying_mut(canonical) {
            under.backend_handle = Some(handle);
        }
        Ok(())
    }

    fn probe_destroy(&mut self, _prid: Prid) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn source_file(lines: &[&str]) -> PathBuf {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        f.into_temp_path().keep().unwrap()
    }

    #[test]
    fn populate_skips_invalid_address_entries_and_creates_entry_and_return() {
        let path = source_file(&["do_nanosleep", "__ftrace_invalid_address__12"]);
        let mut provider = RawfbtProvider::new(path);
        let mut graph = ProbeGraph::new();
        provider.populate(&mut graph).unwrap();

        assert!(graph.lookup(&ProbeDesc::new("rawfbt", "vmlinux", "do_nanosleep", "entry")).is_some());
        assert!(graph.lookup(&ProbeDesc::new("rawfbt", "vmlinux", "do_nanosleep", "return")).is_some());
        assert!(graph
            .lookup(&ProbeDesc::new("rawfbt", "vmlinux", "__ftrace_invalid_address__12", "entry"))
            .is_none());
    }

    #[test]
    fn duplicate_entry_line_replaces_previous_probe() {
        let path = source_file(&["do_nanosleep", "do_nanosleep"]);
        let mut provider = RawfbtProvider::new(path);
        let mut graph = ProbeGraph::new();
        provider.populate(&mut graph).unwrap();

        let matches = graph
            .overlying_iter()
            .filter(|p| p.desc.function == "do_nanosleep" && p.desc.name == "entry")
            .count();
        assert_eq!(matches, 1);
    }

    #[test]
    fn excludes_all_three_synthetic_prefixes() {
        let path = source_file(&[
            "__ftrace_invalid_address__12",
            "__probestub_sched_switch",
            "__traceiter_sched_switch",
            "real_function",
        ]);
        let mut provider = RawfbtProvider::new(path);
        let mut graph = ProbeGraph::new();
        provider.populate(&mut graph).unwrap();
        assert_eq!(graph.overlying_iter().count(), 2);
    }
}
