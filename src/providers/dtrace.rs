//! The `dtrace` provider: the always-present BEGIN/END/ERROR probes.
//!
//! Grounded in `dt_provider.c`'s `dt_providers[]`, which lists "dtrace"
//! first with a comment that it owns these three probes. Their PRIDs are
//! minted at `populate` time so every other provider's PRIDs come after
//! them, matching the original's registration-order invariant.

use crate::desc::{Prid, ProbeDesc};
use crate::error::Result;
use crate::graph::ProbeGraph;
use crate::provider::ProviderImpl;

/// The provider owning the session-lifecycle probes. These have no
/// underlying kernel site: they fire directly from session transitions
/// (`Session::start`/`stop`/a recorded fault), not from a trampoline.
#[derive(Debug, Default)]
pub struct DtraceProvider {
    pub begin_prid: Option<Prid>,
    pub end_prid: Option<Prid>,
    pub error_prid: Option<Prid>,
}

impl DtraceProvider {
    pub fn new() -> Self {
        DtraceProvider::default()
    }
}

impl ProviderImpl for DtraceProvider {
    fn name(&self) -> &str {
        "dtrace"
    }

    fn populate(&mut self, graph: &mut ProbeGraph) -> Result<()> {
        self.begin_prid = Some(graph.insert(ProbeDesc::new("dtrace", "", "", "BEGIN"), "dtrace", None)?);
        self.end_prid = Some(graph.insert(ProbeDesc::new("dtrace", "", "", "END"), "dtrace", None)?);
        self.error_prid = Some(graph.insert(ProbeDesc::new("dtrace", "", "", "ERROR"), "dtrace", None)?);
        log::info!("dtrace provider populated BEGIN/END/ERROR probes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populate_mints_three_probes_with_dtrace_provider() {
        let mut graph = ProbeGraph::new();
        let mut provider = DtraceProvider::new();
        provider.populate(&mut graph).unwrap();
        assert!(provider.begin_prid.is_some());
        assert!(provider.end_prid.is_some());
        assert!(provider.error_prid.is_some());
        assert_eq!(graph.high_water(), 3);
    }
}
