//! The overlying/underlying probe graph (spec §3, §4.B).
//!
//! The graph is not a tree: one underlying probe can fan out to many
//! overlying probes and vice versa. Per the design notes (spec §9) this is
//! modelled as two lists of non-owning references rather than real Rust
//! ownership cycles — overlying probes reference underlyings by their
//! canonical description string, underlyings reference overlyings by PRID,
//! and both sides are looked up back through the graph.

use std::collections::HashMap;

use crate::backend::BackendHandle;
use crate::desc::{Prid, PridAllocator, ProbeDesc};
use crate::error::{Error, ErrorKind, Result};
use crate::trampoline::TrampInsn;

/// Enablement state of an overlying probe (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enablement {
    Disabled,
    Enabled,
    FiringInSession,
}

/// A user-visible probe (spec §3 "Overlying probe").
#[derive(Debug, Clone)]
pub struct OverlyingProbe {
    pub prid: Prid,
    pub desc: ProbeDesc,
    pub provider: String,
    /// Canonical descriptions of the underlying probes this one fans out
    /// to. Non-owning: the underlying records live in `ProbeGraph::underlying`.
    pub underlying: Vec<String>,
    /// Opaque provider-private payload (e.g. a literal pid for a pid
    /// probe). Never interpreted by the graph itself.
    pub private_data: Option<String>,
    pub enablement: Enablement,
}

/// Per-underlying-site flags (spec §3 "Underlying probe").
#[derive(Debug, Clone, Copy, Default)]
pub struct UnderlyingFlags {
    pub is_return: bool,
    pub is_funcall: bool,
    pub is_enabled_query: bool,
    pub is_usdt: bool,
    pub has_arg_mapping: bool,
}

/// One argument descriptor into the underlying probe's string arena
/// (spec §3 "Argument descriptor").
#[derive(Debug, Clone, Copy)]
pub struct ArgDesc {
    pub native_offset: usize,
    pub native_len: usize,
    pub xlate_offset: Option<usize>,
    pub xlate_len: Option<usize>,
    pub mapping_index: i8,
}

/// Extra data carried only by uprobe-backed underlying probes (spec §3
/// "Uprobe site record").
#[derive(Debug, Clone)]
pub struct UprobeSite {
    pub device: u64,
    pub inode: u64,
    pub mapping_path: String,
    pub offset: u64,
    pub native_argc: u32,
    /// Concatenated native+xlated argv blobs; `ArgDesc` entries index into
    /// this rather than owning their own strings (spec §3 ownership rules).
    pub arena: String,
    pub argdescs: Vec<ArgDesc>,
}

/// A kernel instrumentation site shared by potentially many overlying
/// probes (spec §3 "Underlying probe").
#[derive(Debug, Clone)]
pub struct UnderlyingProbe {
    /// Canonical description, e.g. `uprobe:fe01_77:main:400100` or
    /// `rawfbt:vmlinux:do_nanosleep:entry`.
    pub canonical: String,
    /// The underlying-PRID half of the `usdt_prids` key `(pid, uprid)`
    /// (spec §3 "USDT per-process key/value"). Minted from the same
    /// session-wide allocator as overlying PRIDs, so the two namespaces
    /// never collide.
    pub prid: Prid,
    pub flags: UnderlyingFlags,
    /// Non-owning: PRIDs of the overlying probes fanning out from here.
    pub overlying: Vec<Prid>,
    pub trampoline: Option<Vec<TrampInsn>>,
    pub backend_handle: Option<BackendHandle>,
    pub uprobe: Option<UprobeSite>,
}

impl UnderlyingProbe {
    fn new(canonical: impl Into<String>, prid: Prid, flags: UnderlyingFlags) -> Self {
        UnderlyingProbe {
            canonical: canonical.into(),
            prid,
            flags,
            overlying: Vec::new(),
            trampoline: None,
            backend_handle: None,
            uprobe: None,
        }
    }
}

/// The probe graph proper.
#[derive(Debug, Default)]
pub struct ProbeGraph {
    overlying: HashMap<u32, OverlyingProbe>,
    desc_index: HashMap<ProbeDesc, Prid>,
    underlying: HashMap<String, UnderlyingProbe>,
    /// `(dev, inode, offset, is_return)` → canonical description, enforcing
    /// invariant 4 (exactly one underlying per uprobe site tuple).
    uprobe_index: HashMap<(u64, u64, u64, bool), String>,
    prids: PridAllocator,
}

impl ProbeGraph {
    pub fn new() -> Self {
        ProbeGraph::default()
    }

    pub fn high_water(&self) -> u32 {
        self.prids.high_water()
    }

    /// Exact-match lookup on all four description fields.
    pub fn lookup(&self, desc: &ProbeDesc) -> Option<&OverlyingProbe> {
        self.desc_index.get(desc).and_then(|p| self.overlying.get(&p.get()))
    }

    pub fn lookup_by_prid(&self, prid: Prid) -> Option<&OverlyingProbe> {
        self.overlying.get(&prid.get())
    }

    /// Sets an overlying probe's enablement state in place (spec §3
    /// "Overlying probe" enablement field), without touching its fan-out
    /// links. Used by `Session::enable`/`discover_tick`.
    pub fn set_enablement(&mut self, prid: Prid, state: Enablement) -> Result<()> {
        let over = self
            .overlying
            .get_mut(&prid.get())
            .ok_or_else(|| Error::new(ErrorKind::NoSuchProbe))?;
        over.enablement = state;
        Ok(())
    }

    pub fn underlying(&self, canonical: &str) -> Option<&UnderlyingProbe> {
        self.underlying.get(canonical)
    }

    pub fn underlying_mut(&mut self, canonical: &str) -> Option<&mut UnderlyingProbe> {
        self.underlying.get_mut(canonical)
    }

    pub fn overlying_iter(&self) -> impl Iterator<Item = &OverlyingProbe> {
        self.overlying.values()
    }

    pub fn underlying_iter(&self) -> impl Iterator<Item = &UnderlyingProbe> {
        self.underlying.values()
    }

    /// `insert(description, provider, private-data)`: mints a fresh PRID
    /// or fails with `Duplicate` (spec §4.B).
    pub fn insert(
        &mut self,
        desc: ProbeDesc,
        provider: impl Into<String>,
        private_data: Option<String>,
    ) -> Result<Prid> {
        if self.desc_index.contains_key(&desc) {
            return Err(Error::with_message(ErrorKind::Duplicate, desc.to_string()));
        }
        let prid = self.prids.alloc();
        self.desc_index.insert(desc.clone(), prid);
        self.overlying.insert(
            prid.get(),
            OverlyingProbe {
                prid,
                desc,
                provider: provider.into(),
                underlying: Vec::new(),
                private_data,
                enablement: Enablement::Disabled,
            },
        );
        Ok(prid)
    }

    /// Lookup-or-create an underlying kernel-function-boundary probe.
    pub fn rawfbt_underlying_lookup_or_create(
        &mut self,
        module: &str,
        function: &str,
        is_return: bool,
    ) -> &mut UnderlyingProbe {
        let canonical = format!("rawfbt:{module}:{function}:{}", if is_return { "return" } else { "entry" });
        if !self.underlying.contains_key(&canonical) {
            let prid = self.prids.alloc();
            let mut flags = UnderlyingFlags::default();
            flags.is_return = is_return;
            flags.is_funcall = true;
            self.underlying.insert(canonical.clone(), UnderlyingProbe::new(canonical.clone(), prid, flags));
        }
        self.underlying.get_mut(&canonical).expect("just ensured present")
    }

    /// Lookup-or-create an underlying uprobe site, keyed on
    /// `(dev, inode, offset, is_return)` (spec §3 invariant 4, §4.B).
    /// Native argument metadata is populated only on first creation.
    pub fn uprobe_underlying_lookup_or_create(
        &mut self,
        dev: u64,
        inode: u64,
        function: &str,
        offset: u64,
        is_return: bool,
        native_argv: &[String],
    ) -> &mut UnderlyingProbe {
        let key = (dev, inode, offset, is_return);
        if let Some(canonical) = self.uprobe_index.get(&key) {
            return self.underlying.get_mut(canonical).expect("uprobe_index out of sync");
        }

        let offset_field = if is_return { "return".to_string() } else { format!("{offset:x}") };
        let canonical = format!("uprobe:{dev:x}_{inode:x}:{function}:{offset_field}");
        self.uprobe_index.insert(key, canonical.clone());

        let (arena, argdescs) = build_native_only_arena(native_argv);
        let mut flags = UnderlyingFlags::default();
        flags.is_return = is_return;
        flags.is_funcall = true;
        let prid = self.prids.alloc();
        let mut underlying = UnderlyingProbe::new(canonical.clone(), prid, flags);
        underlying.uprobe = Some(UprobeSite {
            device: dev,
            inode,
            mapping_path: String::new(),
            offset,
            native_argc: native_argv.len() as u32,
            arena,
            argdescs,
        });
        self.underlying.insert(canonical.clone(), underlying);
        self.underlying.get_mut(&canonical).expect("just inserted")
    }

    /// Idempotently establishes symmetric fan-out links (spec §4.B).
    pub fn fanout_add(&mut self, overlying_prid: Prid, underlying_canonical: &str) -> Result<()> {
        let is_usdt = {
            let over = self
                .overlying
                .get(&overlying_prid.get())
                .ok_or_else(|| Error::new(ErrorKind::NoSuchProbe))?;
            over.provider == "usdt"
        };

        let under = self
            .underlying
            .get_mut(underlying_canonical)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchProbe))?;

        if is_usdt {
            let already_has_usdt = under.overlying.iter().any(|&p| {
                self.overlying
                    .get(&p.get())
                    .map(|o| o.provider == "usdt")
                    .unwrap_or(false)
            }) && under.flags.is_usdt;
            if already_has_usdt && !under.overlying.contains(&overlying_prid) {
                return Err(Error::new(ErrorKind::DuplicateUsdt));
            }
            under.flags.is_usdt = true;
        }

        if !under.overlying.contains(&overlying_prid) {
            under.overlying.push(overlying_prid);
        }

        let over = self.overlying.get_mut(&overlying_prid.get()).expect("checked above");
        if !over.underlying.iter().any(|c| c == underlying_canonical) {
            over.underlying.push(underlying_canonical.to_string());
        }
        Ok(())
    }

    /// Breaks the fan-out links for `overlying` without destroying the
    /// overlying record itself (spec §4.B `disable`).
    pub fn disable(&mut self, overlying_prid: Prid) -> Result<()> {
        let underlying_keys = {
            let over = self
                .overlying
                .get_mut(&overlying_prid.get())
                .ok_or_else(|| Error::new(ErrorKind::NoSuchProbe))?;
            over.enablement = Enablement::Disabled;
            std::mem::take(&mut over.underlying)
        };
        for key in underlying_keys {
            if let Some(under) = self.underlying.get_mut(&key) {
                under.overlying.retain(|&p| p != overlying_prid);
            }
        }
        Ok(())
    }

    /// Unlinks `overlying` from every underlying list, drops underlyings
    /// that become unreferenced, and removes the overlying record. The
    /// caller is responsible for invoking the provider's `probe_destroy`
    /// hook before or after this call.
    pub fn destroy(&mut self, overlying_prid: Prid) -> Result<()> {
        let (desc, underlying_keys) = {
            let over = self
                .overlying
                .remove(&overlying_prid.get())
                .ok_or_else(|| Error::new(ErrorKind::NoSuchProbe))?;
            (over.desc, over.underlying)
        };
        self.desc_index.remove(&desc);
        for key in underlying_keys {
            if let Some(under) = self.underlying.get_mut(&key) {
                under.overlying.retain(|&p| p != overlying_prid);
                if under.overlying.is_empty() {
                    self.underlying.remove(&key);
                    self.uprobe_index.retain(|_, v| v != &key);
                }
            }
        }
        Ok(())
    }
}

/// Build an arena and descriptor array from native arguments only (no
/// translation), used when a uprobe site is first discovered without USDT
/// argument metadata.
fn build_native_only_arena(native_argv: &[String]) -> (String, Vec<ArgDesc>) {
    let mut arena = String::new();
    let mut descs = Vec::with_capacity(native_argv.len());
    for (i, s) in native_argv.iter().enumerate() {
        let start = arena.len();
        arena.push_str(s);
        arena.push('\0');
        descs.push(ArgDesc {
            native_offset: start,
            native_len: s.len(),
            xlate_offset: None,
            xlate_len: None,
            mapping_index: i as i8,
        });
    }
    (arena, descs)
}

/// Argument arena construction algorithm (spec §4.B, last paragraph):
/// concatenate native+xlated argv blobs into one arena, build one
/// descriptor per translated arg, and report whether any mapping index
/// differs from its own slot index (`has-arg-mapping`).
pub fn build_arg_arena(
    native_argv: &[String],
    xlated_argv: &[String],
    arg_map: &[i8],
) -> (String, Vec<ArgDesc>, bool) {
    let mut arena = String::new();
    let mut native_spans = Vec::with_capacity(native_argv.len());
    for s in native_argv {
        let start = arena.len();
        arena.push_str(s);
        arena.push('\0');
        native_spans.push((start, s.len()));
    }

    if xlated_argv.is_empty() {
        let descs = native_spans
            .iter()
            .enumerate()
            .map(|(i, &(off, len))| ArgDesc {
                native_offset: off,
                native_len: len,
                xlate_offset: None,
                xlate_len: None,
                mapping_index: i as i8,
            })
            .collect();
        return (arena, descs, false);
    }

    let mut xlate_spans = Vec::with_capacity(xlated_argv.len());
    for s in xlated_argv {
        let start = arena.len();
        arena.push_str(s);
        arena.push('\0');
        xlate_spans.push((start, s.len()));
    }

    let mut has_mapping = false;
    let mut descs = Vec::with_capacity(xlated_argv.len());
    for (i, &(xoff, xlen)) in xlate_spans.iter().enumerate() {
        let mapping_index = arg_map.get(i).copied().unwrap_or(i as i8);
        if mapping_index as usize != i {
            has_mapping = true;
        }
        let (noff, nlen) = native_spans
            .get(mapping_index as usize)
            .copied()
            .unwrap_or((0, 0));
        descs.push(ArgDesc {
            native_offset: noff,
            native_len: nlen,
            xlate_offset: Some(xoff),
            xlate_len: Some(xlen),
            mapping_index,
        });
    }
    (arena, descs, has_mapping)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str) -> ProbeDesc {
        ProbeDesc::new("rawfbt", "vmlinux", name, "entry")
    }

    #[test]
    fn round_trip_insert_lookup_destroy() {
        let mut g = ProbeGraph::new();
        let d = desc("do_nanosleep");
        let prid = g.insert(d.clone(), "rawfbt", None).unwrap();
        assert_eq!(g.lookup(&d).unwrap().prid, prid);
        g.destroy(prid).unwrap();
        assert!(g.lookup(&d).is_none());
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut g = ProbeGraph::new();
        let d = desc("do_nanosleep");
        g.insert(d.clone(), "rawfbt", None).unwrap();
        let err = g.insert(d, "rawfbt", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
    }

    #[test]
    fn fanout_add_is_idempotent_and_symmetric() {
        let mut g = ProbeGraph::new();
        let prid = g.insert(desc("do_nanosleep"), "rawfbt", None).unwrap();
        let under = g.rawfbt_underlying_lookup_or_create("vmlinux", "do_nanosleep", false);
        let canonical = under.canonical.clone();

        g.fanout_add(prid, &canonical).unwrap();
        g.fanout_add(prid, &canonical).unwrap();

        let over = g.lookup_by_prid(prid).unwrap();
        assert_eq!(over.underlying.len(), 1);
        let under = g.underlying(&canonical).unwrap();
        assert_eq!(under.overlying.len(), 1);
    }

    #[test]
    fn disable_keeps_record_but_breaks_links() {
        let mut g = ProbeGraph::new();
        let d = desc("do_nanosleep");
        let prid = g.insert(d.clone(), "rawfbt", None).unwrap();
        let canonical = g.rawfbt_underlying_lookup_or_create("vmlinux", "do_nanosleep", false).canonical.clone();
        g.fanout_add(prid, &canonical).unwrap();

        g.disable(prid).unwrap();

        assert!(g.lookup(&d).is_some());
        assert!(g.lookup_by_prid(prid).unwrap().underlying.is_empty());
        assert!(g.underlying(&canonical).unwrap().overlying.is_empty());
    }

    #[test]
    fn uprobe_lookup_or_create_is_keyed_on_site_tuple() {
        let mut g = ProbeGraph::new();
        let argv = vec!["int".to_string()];
        let canonical_a = g
            .uprobe_underlying_lookup_or_create(0xfe01, 0x77, "main", 0x400100, false, &argv)
            .canonical
            .clone();
        let canonical_b = g
            .uprobe_underlying_lookup_or_create(0xfe01, 0x77, "main", 0x400100, false, &argv)
            .canonical
            .clone();
        assert_eq!(canonical_a, canonical_b);
        assert_eq!(canonical_a, "uprobe:fe01_77:main:400100");
        assert_eq!(g.underlying_iter().count(), 1);
    }

    #[test]
    fn duplicate_usdt_overlying_is_rejected() {
        let mut g = ProbeGraph::new();
        let argv: Vec<String> = Vec::new();
        let canonical = g
            .uprobe_underlying_lookup_or_create(1, 1, "place", 0x10, false, &argv)
            .canonical
            .clone();

        let usdt1 = g.insert(ProbeDesc::new("usdt", "a.out", "main", "place"), "usdt", None).unwrap();
        g.fanout_add(usdt1, &canonical).unwrap();

        let usdt2 = g.insert(ProbeDesc::new("usdt", "a.out", "main", "place2"), "usdt", None).unwrap();
        let err = g.fanout_add(usdt2, &canonical).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateUsdt);
    }

    #[test]
    fn arg_arena_flags_mapping_when_permuted() {
        let native = vec!["int".to_string(), "char*".to_string()];
        let xlated = vec!["char*".to_string(), "int".to_string()];
        let map = [1i8, 0i8];
        let (_arena, descs, has_mapping) = build_arg_arena(&native, &xlated, &map);
        assert!(has_mapping);
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].mapping_index, 1);
    }

    #[test]
    fn arg_arena_identity_mapping_sets_no_flag() {
        let native = vec!["int".to_string()];
        let xlated = vec!["int".to_string()];
        let map = [0i8];
        let (_arena, _descs, has_mapping) = build_arg_arena(&native, &xlated, &map);
        assert!(!has_mapping);
    }
}
