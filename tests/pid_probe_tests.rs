//! Session-level pid-probe attach scenarios (uprobe provider, spec
//! scenario "pid probe attach").

use std::path::PathBuf;

use dtrace_core::backend::TracepointBackend;
use dtrace_core::config::SessionConfig;
use dtrace_core::desc::ProbeDesc;
use dtrace_core::providers::uprobe::{provide_pid_probe, UprobeProvider};
use dtrace_core::session::Session;

fn session() -> (tempfile::TempDir, Session) {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig { tracefs_root: dir.path().to_path_buf(), ..SessionConfig::default() };
    let mut s = Session::new(config);
    s.register_provider(Box::new(UprobeProvider::new())).unwrap();
    s.start().unwrap();
    (dir, s)
}

#[test]
fn provide_pid_probe_then_enable_adds_it_to_enablings_and_probes_map() {
    let (_dir, mut s) = session();
    let path = PathBuf::from("/bin/traced");
    let prid = provide_pid_probe(&mut s.graph, 9001, 0xfe01, 0x77, &path, "main", 0x400100, false).unwrap();

    s.enable(prid).unwrap();

    assert!(s.enablings.contains(&prid));
    assert_eq!(s.probes_map.get(prid).unwrap().provider, "pid9001");
}

#[test]
fn enabling_a_pid_probe_attaches_its_underlying_uprobe_site() {
    let (_dir, mut s) = session();
    let path = PathBuf::from("/bin/traced");
    let prid = provide_pid_probe(&mut s.graph, 9002, 0xfe01, 0x88, &path, "work", 0x401000, false).unwrap();
    s.enable(prid).unwrap();

    let canonical = s.graph.lookup_by_prid(prid).unwrap().underlying[0].clone();
    let provider = s.providers.get_mut("uprobe").unwrap();
    provider.attach(&canonical, &mut s.graph, s.backend.as_mut()).unwrap();

    assert!(s.graph.underlying(&canonical).unwrap().backend_handle.is_some());
    let contents = std::fs::read_to_string(s.config.uprobe_events_path()).unwrap();
    assert!(contents.contains("/bin/traced"));
}

#[test]
fn two_pids_hitting_the_same_site_each_get_their_own_overlying_probe() {
    let (_dir, mut s) = session();
    let path = PathBuf::from("/bin/traced");
    let prid_a = provide_pid_probe(&mut s.graph, 9101, 1, 1, &path, "main", 0x10, false).unwrap();
    let prid_b = provide_pid_probe(&mut s.graph, 9102, 1, 1, &path, "main", 0x10, false).unwrap();

    assert_ne!(prid_a, prid_b);
    assert!(s.lookup(&ProbeDesc::new("pid9101", "traced", "main", "entry")).is_some());
    assert!(s.lookup(&ProbeDesc::new("pid9102", "traced", "main", "entry")).is_some());

    let canonical = s.graph.lookup_by_prid(prid_a).unwrap().underlying[0].clone();
    assert_eq!(s.graph.underlying(&canonical).unwrap().overlying.len(), 2);
}
