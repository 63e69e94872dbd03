//! Session-level kernel function boundary scenarios (rawfbt provider).

use std::io::Write;

use dtrace_core::backend::TracepointBackend;
use dtrace_core::config::SessionConfig;
use dtrace_core::desc::ProbeDesc;
use dtrace_core::providers::rawfbt::RawfbtProvider;
use dtrace_core::session::Session;

fn source_file(lines: &[&str]) -> std::path::PathBuf {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(f, "{line}").unwrap();
    }
    f.into_temp_path().keep().unwrap()
}

fn tracefs_session() -> (tempfile::TempDir, SessionConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig { tracefs_root: dir.path().to_path_buf(), ..SessionConfig::default() };
    (dir, config)
}

#[test]
fn start_enumerates_entry_and_return_for_every_real_function() {
    let (_dir, config) = tracefs_session();
    let mut session = Session::new(config);
    let path = source_file(&["do_nanosleep", "__ftrace_invalid_address__7", "schedule"]);
    session.register_provider(Box::new(RawfbtProvider::new(path))).unwrap();
    session.start().unwrap();

    assert!(session.lookup(&ProbeDesc::new("rawfbt", "vmlinux", "do_nanosleep", "entry")).is_some());
    assert!(session.lookup(&ProbeDesc::new("rawfbt", "vmlinux", "do_nanosleep", "return")).is_some());
    assert!(session.lookup(&ProbeDesc::new("rawfbt", "vmlinux", "schedule", "entry")).is_some());
    assert!(session
        .lookup(&ProbeDesc::new("rawfbt", "vmlinux", "__ftrace_invalid_address__7", "entry"))
        .is_none());
}

#[test]
fn enabling_a_rawfbt_probe_attaches_a_kprobe_control_record() {
    let (_dir, config) = tracefs_session();
    let mut session = Session::new(config);
    let path = source_file(&["do_nanosleep"]);
    session.register_provider(Box::new(RawfbtProvider::new(path))).unwrap();
    session.start().unwrap();

    let prid = session
        .lookup(&ProbeDesc::new("rawfbt", "vmlinux", "do_nanosleep", "entry"))
        .unwrap()
        .prid;
    session.enable(prid).unwrap();

    let canonical = "rawfbt:vmlinux:do_nanosleep:entry".to_string();
    let provider = session.providers.get_mut("rawfbt").unwrap();
    provider.attach(&canonical, &mut session.graph, session.backend.as_mut()).unwrap();

    let handle = session.graph.underlying(&canonical).unwrap().backend_handle.clone();
    assert!(handle.is_some());
    let contents = std::fs::read_to_string(session.config.kprobe_events_path()).unwrap();
    assert!(contents.contains("do_nanosleep"));
}
