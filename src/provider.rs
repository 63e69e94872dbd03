//! Provider registry (spec §4.A).
//!
//! A provider is a tagged capability record (spec §9 "Dynamic dispatch
//! across providers") rather than a class hierarchy: every hook has a
//! default no-op implementation, so a provider with nothing to say for a
//! given callback simply leaves the slot empty.

use std::collections::HashMap;

use crate::backend::TracepointBackend;
use crate::desc::{Prid, ProbeDesc};
use crate::error::{Error, ErrorKind, Result};
use crate::graph::ProbeGraph;
use crate::trampoline::TrampInsn;

/// The kernel program type a provider's underlying sites attach as. Pid
/// and USDT providers never attach directly (their sites are owned by the
/// uprobe provider), so they report `Unspecified` and assert they are
/// never asked to attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgType {
    Kprobe,
    Unspecified,
}

/// Argument descriptor summary returned by `probe_info` (spec §4.A,
/// §8 "Underlying probe with empty argument arena: probe_info returns
/// argc=0").
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeInfo {
    pub argc: u32,
}

/// The callback record every provider implements (spec §4.A table).
pub trait ProviderImpl {
    fn name(&self) -> &str;

    fn prog_type(&self) -> ProgType {
        ProgType::Unspecified
    }

    /// Enumerate all statically-known probes at session start.
    fn populate(&mut self, _graph: &mut ProbeGraph) -> Result<()> {
        Ok(())
    }

    /// Enumerate probes matching a wildcarded description.
    fn provide_probe(&mut self, _pattern: &ProbeDesc, _graph: &mut ProbeGraph) -> Result<()> {
        Ok(())
    }

    /// Periodic reconciliation (spec §4.F).
    fn discover(&mut self, _graph: &mut ProbeGraph) -> Result<()> {
        Ok(())
    }

    /// Emit VM code for an underlying probe (spec §4.D).
    fn trampoline(&self, _canonical: &str, _graph: &ProbeGraph) -> Vec<TrampInsn> {
        Vec::new()
    }

    /// Bind a compiled program to the kernel site.
    fn attach(&mut self, _canonical: &str, _graph: &mut ProbeGraph, _backend: &mut dyn TracepointBackend) -> Result<()> {
        Ok(())
    }

    /// Unbind.
    fn detach(&mut self, _canonical: &str, _graph: &mut ProbeGraph, _backend: &mut dyn TracepointBackend) -> Result<()> {
        Ok(())
    }

    /// Release per-probe storage.
    fn probe_destroy(&mut self, _prid: Prid) {}

    /// Mark an overlying probe active, recursively enabling its underlyings.
    fn enable(&mut self, _prid: Prid, _graph: &mut ProbeGraph) -> Result<()> {
        Ok(())
    }

    /// Report argument descriptors.
    fn probe_info(&self, _prid: Prid, _graph: &ProbeGraph) -> ProbeInfo {
        ProbeInfo::default()
    }

    /// Session-time hook for compiling and loading a newly-discovered probe.
    /// The default attaches every underlying site this overlying probe
    /// currently fans out to, so a provider need only implement `attach`
    /// (compiling and loading the program itself is out of scope here; the
    /// original splits the same work across `dt_enable`'s dif_o compile
    /// step and `dp_os->attach`, and only the latter applies to this crate).
    fn add_probe(&mut self, prid: Prid, graph: &mut ProbeGraph, backend: &mut dyn TracepointBackend) -> Result<()> {
        let Some(over) = graph.lookup_by_prid(prid) else {
            return Ok(());
        };
        for canonical in over.underlying.clone() {
            self.attach(&canonical, graph, backend)?;
        }
        Ok(())
    }

    /// Release whatever provider-global state `populate` acquired. Called
    /// only when session start aborts (spec §4.A "Failure").
    fn release(&mut self) {}
}

/// Providers are registered once at startup in a fixed deterministic
/// order, with "dtrace" enforced first since it owns the always-present
/// BEGIN/END/ERROR probes other components' PRIDs depend on (spec §4.A).
pub struct ProviderRegistry {
    order: Vec<String>,
    providers: HashMap<String, Box<dyn ProviderImpl>>,
}

impl ProviderRegistry {
    /// Starts a registry already seeded with the mandatory `dtrace`
    /// provider as entry zero.
    pub fn new(dtrace_provider: Box<dyn ProviderImpl>) -> Self {
        let name = dtrace_provider.name().to_string();
        debug_assert_eq!(name, "dtrace", "dtrace must be the first registered provider");
        let mut providers = HashMap::new();
        providers.insert(name.clone(), dtrace_provider);
        ProviderRegistry {
            order: vec![name],
            providers,
        }
    }

    /// Registers a non-`dtrace` provider. Fails with `Duplicate` if a
    /// provider of that name is already registered.
    pub fn register(&mut self, provider: Box<dyn ProviderImpl>) -> Result<()> {
        let name = provider.name().to_string();
        if self.providers.contains_key(&name) {
            return Err(Error::with_message(ErrorKind::Duplicate, name));
        }
        self.order.push(name.clone());
        self.providers.insert(name, provider);
        Ok(())
    }

    /// Equality by name, as an open-addressed hash table keyed on the
    /// provider-name string would be (spec §4.A).
    pub fn get(&self, name: &str) -> Option<&(dyn ProviderImpl + 'static)> {
        self.providers.get(name).map(|b| b.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn ProviderImpl + 'static)> {
        self.providers.get_mut(name).map(|b| b.as_mut())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Calls `populate` on every provider in registration order. On the
    /// first failure, releases every provider registered so far (not just
    /// the ones already populated) in reverse order and propagates the
    /// error (spec §4.A "Failure").
    pub fn populate_all(&mut self, graph: &mut ProbeGraph) -> Result<()> {
        for name in self.order.clone() {
            let provider = self.providers.get_mut(&name).expect("order/providers out of sync");
            if let Err(e) = provider.populate(graph) {
                log::error!("provider '{name}' failed to populate: {e}");
                for release_name in self.order.iter().rev() {
                    if let Some(p) = self.providers.get_mut(release_name) {
                        p.release();
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}
