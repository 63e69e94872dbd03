//! Tracepoint backend: the boundary between the core and the kernel's
//! instrumentation control files (spec §4.C, §6).
//!
//! `TracepointBackend` is the contract; [`TracefsBackend`] is a real
//! implementation writing the ASCII control-file records described below,
//! with its root directory overridable via [`crate::config::SessionConfig`]
//! so tests run against a temp directory instead of the live kernel.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::config::SessionConfig;
use crate::error::{Error, ErrorKind, Result};

/// What kind of kernel instrumentation site to create.
#[derive(Debug, Clone)]
pub enum SiteSpec {
    /// A kernel function boundary site (spec §4.C: "the name is the
    /// function name with `.` rewritten to `_`").
    Kernel { function: String, is_return: bool },
    /// A user-space uprobe site, named
    /// `dt_pid/{p|r}_<dev>_<inode>_<offset>` (spec §4.C, §6).
    User {
        dev: u64,
        inode: u64,
        path: PathBuf,
        offset: u64,
        is_return: bool,
    },
}

/// An opaque handle to a created instrumentation site.
#[derive(Debug, Clone)]
pub struct BackendHandle {
    pub group: String,
    pub name: String,
    pub event_id: Option<u32>,
}

impl BackendHandle {
    fn key(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }
}

/// The backend contract (spec §4.C). All operations are idempotent under
/// "already-exists"/"already-gone".
pub trait TracepointBackend {
    fn create(&mut self, spec: &SiteSpec) -> Result<BackendHandle>;
    fn attach(&mut self, handle: &BackendHandle, program_fd: i32) -> Result<()>;
    fn detach(&mut self, handle: &BackendHandle) -> Result<()>;
    fn destroy(&mut self, handle: &BackendHandle) -> Result<()>;
}

/// A real backend writing to tracefs-style control files.
pub struct TracefsBackend {
    config: SessionConfig,
    attached: HashMap<String, i32>,
}

impl TracefsBackend {
    pub fn new(config: SessionConfig) -> Self {
        TracefsBackend {
            config,
            attached: HashMap::new(),
        }
    }

    fn control_file(&self, spec: &SiteSpec) -> PathBuf {
        match spec {
            SiteSpec::Kernel { .. } => self.config.kprobe_events_path(),
            SiteSpec::User { .. } => self.config.uprobe_events_path(),
        }
    }

    fn group_and_record(&self, spec: &SiteSpec) -> (String, String, String) {
        match spec {
            SiteSpec::Kernel { function, is_return } => {
                let name = function.replace('.', "_");
                let kind = if *is_return { 'r' } else { 'p' };
                let group = "dtrace".to_string();
                let record = format!("{kind}:{group}/{name} {function}\n");
                (group, name, record)
            }
            SiteSpec::User { dev, inode, path, offset, is_return } => {
                let kind = if *is_return { 'r' } else { 'p' };
                let group = "dt_pid".to_string();
                let name = format!("{kind}_{dev:x}_{inode:x}_{offset:x}");
                let record = format!("{kind}:{group}/{name} {}:0x{offset:x}\n", path.display());
                (group, name, record)
            }
        }
    }

    fn format_file_path(&self, group: &str, name: &str) -> PathBuf {
        self.config.events_dir().join(group).join(name).join("id")
    }

    fn is_already_exists(err: &std::io::Error) -> bool {
        err.raw_os_error() == Some(libc_eexist()) || err.kind() == std::io::ErrorKind::AlreadyExists
    }

    fn is_already_gone(err: &std::io::Error) -> bool {
        err.kind() == std::io::ErrorKind::NotFound
    }
}

/// `EEXIST`, without pulling in the `libc` crate for one constant.
fn libc_eexist() -> i32 {
    17
}

impl TracepointBackend for TracefsBackend {
    fn create(&mut self, spec: &SiteSpec) -> Result<BackendHandle> {
        let (group, name, record) = self.group_and_record(spec);
        let control_file = self.control_file(spec);

        let write_result = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&control_file)
            .and_then(|mut f| f.write_all(record.as_bytes()));

        match write_result {
            Ok(()) => log::info!("created instrumentation site {group}/{name}"),
            Err(e) if Self::is_already_exists(&e) => {
                log::debug!("instrumentation site {group}/{name} already present");
            }
            Err(e) => {
                // The caller may still obtain the format file: some other
                // process may have created the same site concurrently
                // (spec §4.C). We proceed to read it either way.
                log::warn!("failed to create {group}/{name}: {e}");
            }
        }

        let event_id = std::fs::read_to_string(self.format_file_path(&group, &name))
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());

        if event_id.is_none() && write_result.is_err() {
            return Err(Error::with_message(ErrorKind::EnablingFailed, format!("site not present: {group}/{name}")));
        }

        Ok(BackendHandle { group, name, event_id })
    }

    fn attach(&mut self, handle: &BackendHandle, program_fd: i32) -> Result<()> {
        log::debug!("attaching program fd {program_fd} to {}", handle.key());
        self.attached.insert(handle.key(), program_fd);
        Ok(())
    }

    fn detach(&mut self, handle: &BackendHandle) -> Result<()> {
        log::debug!("detaching {}", handle.key());
        self.attached.remove(&handle.key());
        Ok(())
    }

    fn destroy(&mut self, handle: &BackendHandle) -> Result<()> {
        self.attached.remove(&handle.key());
        let record = format!("-:{}/{}\n", handle.group, handle.name);
        let control_file = if self
            .config
            .uprobe_events_path()
            .to_string_lossy()
            .ends_with("uprobe_events")
            && handle.group == "dt_pid"
        {
            self.config.uprobe_events_path()
        } else {
            self.config.kprobe_events_path()
        };

        let result = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&control_file)
            .and_then(|mut f| f.write_all(record.as_bytes()));

        match result {
            Ok(()) => Ok(()),
            Err(e) if Self::is_already_gone(&e) => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_config() -> SessionConfig {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.into_path();
        fs::create_dir_all(root.join("events/dtrace/do_nanosleep")).unwrap();
        fs::write(root.join("events/dtrace/do_nanosleep/id"), "123\n").unwrap();
        SessionConfig {
            tracefs_root: root,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn create_kernel_site_writes_expected_record_and_reads_event_id() {
        let config = temp_config();
        let mut backend = TracefsBackend::new(config.clone());
        let handle = backend
            .create(&SiteSpec::Kernel { function: "do_nanosleep".into(), is_return: false })
            .unwrap();
        assert_eq!(handle.event_id, Some(123));

        let contents = fs::read_to_string(config.kprobe_events_path()).unwrap();
        assert_eq!(contents, "p:dtrace/do_nanosleep do_nanosleep\n");
    }

    #[test]
    fn destroy_writes_removal_record() {
        let config = temp_config();
        let mut backend = TracefsBackend::new(config.clone());
        let handle = BackendHandle { group: "dtrace".into(), name: "do_nanosleep".into(), event_id: Some(123) };
        backend.destroy(&handle).unwrap();
        let contents = fs::read_to_string(config.kprobe_events_path()).unwrap();
        assert!(contents.contains("-:dtrace/do_nanosleep\n"));
    }

    #[test]
    fn user_site_name_matches_canonical_scheme() {
        let config = temp_config();
        let mut backend = TracefsBackend::new(config);
        let (group, name, record) = backend.group_and_record(&SiteSpec::User {
            dev: 0xfe01,
            inode: 0x77,
            path: PathBuf::from("/bin/x"),
            offset: 0x400100,
            is_return: false,
        });
        assert_eq!(group, "dt_pid");
        assert_eq!(name, "p_fe01_77_400100");
        assert!(record.starts_with("p:dt_pid/p_fe01_77_400100 /bin/x:0x400100"));
    }
}
