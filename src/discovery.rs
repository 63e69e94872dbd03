//! The discovery loop (spec §4.F): per-tick reconciliation between probes
//! and live processes.

use crate::desc::Prid;
use crate::error::ErrorKind;
use crate::graph::ProbeGraph;
use crate::maps::UsdtKey;
use crate::platform;
use crate::session::Session;

/// Lets a caller plug in USDT-matching process discovery (the out-of-scope
/// DOF parser + process scanner of spec §1) without the core depending on
/// either. Step 3 of spec §4.F calls this once per tick; the default no-op
/// is enough for providers (like `rawfbt`) that never create USDT probes.
pub trait UsdtDiscoverySource {
    fn discover_usdt(&mut self, _graph: &mut ProbeGraph) {}
}

/// A source that does nothing, for sessions with no USDT provider.
pub struct NoUsdtDiscovery;
impl UsdtDiscoverySource for NoUsdtDiscovery {}

/// Summary of one `discover_tick` call, useful for tests and logging.
#[derive(Debug, Default)]
pub struct DiscoverTick {
    /// `usdt_prids`/`usdt_names` keys removed because their pid died.
    pub pruned_usdt_keys: Vec<UsdtKey>,
    /// Overlying USDT probes disabled because their pid died.
    pub disabled_probes: Vec<Prid>,
    /// Overlying probes newly enabled and successfully added this tick.
    pub newly_enabled: Vec<Prid>,
}

impl Session {
    /// Runs one discovery tick (spec §4.F steps 1-4).
    pub fn discover_tick(&mut self, usdt_source: &mut dyn UsdtDiscoverySource) -> DiscoverTick {
        let mut tick = DiscoverTick::default();

        // Step 1: collect-then-delete stale usdt_prids/usdt_names entries
        // so key iteration is never disturbed by concurrent deletion.
        let stale = self.usdt_prids.keys_matching(|k| !platform::process_exists(k.pid));
        for key in &stale {
            self.usdt_names.remove(key);
            self.usdt_prids.remove(key);
        }
        tick.pruned_usdt_keys = stale;

        // Step 2: disable overlying USDT probes whose pid no longer exists.
        for prid in self.enablings.clone() {
            let Some(over) = self.graph.lookup_by_prid(prid) else { continue };
            if over.provider != "usdt" {
                continue;
            }
            let Some(pid) = over.private_data.as_deref().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if !platform::process_exists(pid) {
                self.disable(prid).ok();
                tick.disabled_probes.push(prid);
            }
        }

        // Step 3: let USDT-capable providers create probes for any newly
        // matching process (spec: "for every registered clause whose
        // description could match USDT...").
        usdt_source.discover_usdt(&mut self.graph);
        for name in self.providers.names().map(str::to_string).collect::<Vec<_>>() {
            if let Some(provider) = self.providers.get_mut(&name) {
                if let Err(e) = provider.discover(&mut self.graph) {
                    log::warn!("provider '{name}' discover failed: {e}");
                }
            }
        }

        // Step 4: enable + add_probe every overlying probe minted since the
        // last tick (PRIDs above the prior high-water mark).
        let new_high_water = self.graph.high_water();
        for raw in (self.last_high_water + 1)..=new_high_water {
            let Some(prid) = Prid::from_raw(raw) else { continue };
            let Some(over) = self.graph.lookup_by_prid(prid) else {
                // Not every minted PRID belongs to an overlying probe: the
                // same allocator also mints underlying-probe PRIDs.
                continue;
            };
            let provider_name = over.provider.clone();
            let Some(provider) = self.providers.get_mut(&provider_name) else { continue };

            if let Err(e) = provider.enable(prid, &mut self.graph) {
                log::warn!("failed to enable probe {prid}: {e}");
                continue;
            }
            match provider.add_probe(prid, &mut self.graph, self.backend.as_mut()) {
                Ok(()) => {
                    self.probes_map.insert(
                        prid,
                        self.graph.lookup_by_prid(prid).expect("just enabled").desc.clone(),
                    );
                    self.graph.set_enablement(prid, crate::graph::Enablement::Enabled).ok();
                    if !self.enablings.contains(&prid) {
                        self.enablings.push(prid);
                    }
                    tick.newly_enabled.push(prid);
                }
                Err(e) if e.kind() == ErrorKind::EnablingFailed => {
                    log::warn!("failed to enable probe {prid}: {e}");
                }
                Err(e) => {
                    log::error!("add_probe for {prid} failed: {e}");
                }
            }
        }
        self.last_high_water = new_high_water;

        tick
    }
}
