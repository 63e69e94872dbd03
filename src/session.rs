//! Ties provider registry, probe graph, maps, and the activity word into
//! one `Session` (spec §5, §9 "Global state": "the session handle threads
//! everything else").

use crate::backend::{TracefsBackend, TracepointBackend};
use crate::config::SessionConfig;
use crate::desc::{Prid, ProbeDesc};
use crate::error::{Error, ErrorKind, Result};
use crate::graph::{Enablement, ProbeGraph};
use crate::maps::{CpuInfoMap, ProbesMap, StateMap, UsdtNamesMap, UsdtPridsMap};
use crate::provider::ProviderRegistry;
use crate::providers::dtrace::DtraceProvider;
use crate::trampoline::Activity;

/// Everything A-F share: the graph, the provider registry, the kernel-map
/// stand-ins, the tracepoint backend, the activity word, the PRID
/// high-water mark, and the enablings list (spec §3, §5).
pub struct Session {
    pub graph: ProbeGraph,
    pub providers: ProviderRegistry,
    pub backend: Box<dyn TracepointBackend>,
    pub config: SessionConfig,
    pub activity: Activity,
    /// PRIDs of overlying probes currently firing in this session (spec §4.B
    /// `disable`: "removes from the session's enablings list").
    pub enablings: Vec<Prid>,
    pub usdt_prids: UsdtPridsMap,
    pub usdt_names: UsdtNamesMap,
    pub probes_map: ProbesMap,
    pub state: StateMap,
    pub cpuinfo: CpuInfoMap,
    pub(crate) last_high_water: u32,
}

impl Session {
    /// Starts a session with the mandatory `dtrace` provider already
    /// registered (spec §4.A: "'dtrace' must be first").
    pub fn new(config: SessionConfig) -> Self {
        Session {
            graph: ProbeGraph::new(),
            providers: ProviderRegistry::new(Box::new(DtraceProvider::new())),
            backend: Box::new(TracefsBackend::new(config.clone())),
            config,
            activity: Activity::Inactive,
            enablings: Vec::new(),
            usdt_prids: UsdtPridsMap::new(),
            usdt_names: UsdtNamesMap::new(),
            probes_map: ProbesMap::new(),
            state: StateMap::default(),
            cpuinfo: CpuInfoMap::new(),
            last_high_water: 0,
        }
    }

    /// Registers an additional provider (`rawfbt`, `uprobe`, ...) before
    /// `start()`. Rejects a second provider of the same name (spec §4.A).
    pub fn register_provider(&mut self, provider: Box<dyn crate::provider::ProviderImpl>) -> Result<()> {
        self.providers.register(provider)
    }

    /// Session start (spec §4.A): `populate` every provider in order. On
    /// failure the registry has already released every provider registered
    /// so far; the session itself never becomes `Active`.
    pub fn start(&mut self) -> Result<()> {
        self.providers.populate_all(&mut self.graph)?;
        self.last_high_water = self.graph.high_water();
        self.activity = Activity::Active;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.activity = Activity::Stopped;
    }

    /// `lookup(description)` (spec §4.B).
    pub fn lookup(&self, desc: &ProbeDesc) -> Option<&crate::graph::OverlyingProbe> {
        self.graph.lookup(desc)
    }

    /// Enables an overlying probe: records its identity into `probes_map`
    /// (so `bvar.rs`'s `PROBEPROV`/etc. built-ins can resolve it), invokes
    /// the owning provider's `enable` hook, marks it `Enabled`, and adds it
    /// to the enablings list (spec §4.A `enable`, §3 enablement field).
    pub fn enable(&mut self, prid: Prid) -> Result<()> {
        let (provider_name, desc) = {
            let over = self
                .graph
                .lookup_by_prid(prid)
                .ok_or_else(|| Error::new(ErrorKind::NoSuchProbe))?;
            (over.provider.clone(), over.desc.clone())
        };
        self.probes_map.insert(prid, desc);
        if let Some(provider) = self.providers.get_mut(&provider_name) {
            provider.enable(prid, &mut self.graph)?;
        }
        self.graph.set_enablement(prid, Enablement::Enabled)?;
        if !self.enablings.contains(&prid) {
            self.enablings.push(prid);
        }
        Ok(())
    }

    /// `disable(overlying)` (spec §4.B): breaks fan-out, removes from the
    /// enablings list, but keeps the probe record itself looked-up-able.
    pub fn disable(&mut self, prid: Prid) -> Result<()> {
        self.graph.disable(prid)?;
        self.enablings.retain(|&p| p != prid);
        Ok(())
    }

    /// `destroy(overlying)` (spec §4.B): unlinks, calls the owning
    /// provider's `probe_destroy`, and removes the record entirely.
    pub fn destroy(&mut self, prid: Prid) -> Result<()> {
        let provider_name = self
            .graph
            .lookup_by_prid(prid)
            .map(|o| o.provider.clone())
            .ok_or_else(|| Error::new(ErrorKind::NoSuchProbe))?;
        if let Some(provider) = self.providers.get_mut(&provider_name) {
            provider.probe_destroy(prid);
        }
        self.enablings.retain(|&p| p != prid);
        self.probes_map.remove(prid);
        self.graph.destroy(prid)
    }
}
