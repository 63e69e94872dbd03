//! Probe descriptions, glob matching, and probe identifiers.
//!
//! See spec §3 ("Probe description", "Probe identifier (PRID)").

use std::fmt;
use std::num::NonZeroU32;

/// Maximum length of a single probe description field, matching the
/// `DTRACE_PROVNAMELEN`-style bounds referenced in the original source.
pub const MAX_FIELD_LEN: usize = 63;

/// A four-tuple `(provider, module, function, name)` identifying a probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeDesc {
    pub provider: String,
    pub module: String,
    pub function: String,
    pub name: String,
}

impl ProbeDesc {
    pub fn new(
        provider: impl Into<String>,
        module: impl Into<String>,
        function: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        ProbeDesc {
            provider: provider.into(),
            module: module.into(),
            function: function.into(),
            name: name.into(),
        }
    }

    /// Whether every field is within [`MAX_FIELD_LEN`].
    pub fn is_well_formed(&self) -> bool {
        self.provider.len() <= MAX_FIELD_LEN
            && self.module.len() <= MAX_FIELD_LEN
            && self.function.len() <= MAX_FIELD_LEN
            && self.name.len() <= MAX_FIELD_LEN
    }

    /// Glob-match this (fully bound) description against a pattern
    /// description whose fields may contain `*`, `?`, or `-` ("any").
    pub fn matches(&self, pattern: &ProbeDesc) -> bool {
        gmatch(&self.provider, &pattern.provider)
            && gmatch(&self.module, &pattern.module)
            && gmatch(&self.function, &pattern.function)
            && gmatch(&self.name, &pattern.name)
    }
}

impl fmt::Display for ProbeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.provider, self.module, self.function, self.name)
    }
}

/// Glob-match `text` against `pattern`, where `pattern` may use `*`
/// (any run of characters), `?` (any one character), and the literal
/// string `-` meaning "matches anything" (the `dt_gmatch` convention from
/// the original source).
pub fn gmatch(text: &str, pattern: &str) -> bool {
    if pattern == "-" {
        return true;
    }
    glob_match(text.as_bytes(), pattern.as_bytes())
}

fn glob_match(text: &[u8], pattern: &[u8]) -> bool {
    match (text.first(), pattern.first()) {
        (_, Some(b'*')) => {
            // Try consuming zero or more chars of text for this '*'.
            glob_match(text, &pattern[1..]) || (!text.is_empty() && glob_match(&text[1..], pattern))
        }
        (Some(_), Some(b'?')) => glob_match(&text[1..], &pattern[1..]),
        (Some(tc), Some(pc)) if tc == pc => glob_match(&text[1..], &pattern[1..]),
        (None, None) => true,
        _ => false,
    }
}

/// A dense, non-zero, process-wide-unique probe identifier. Zero denotes
/// "no probe" (spec §3); represented here as the absence of a `Prid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Prid(NonZeroU32);

impl Prid {
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Builds a `Prid` from a raw value already known to be non-zero (e.g.
    /// one read back out of `machine-state.prid`). Returns `None` for 0,
    /// which spec §3 reserves for "no probe".
    pub fn from_raw(value: u32) -> Option<Prid> {
        NonZeroU32::new(value).map(Prid)
    }
}

impl fmt::Display for Prid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic dense PRID allocator. PRIDs are never reused within a
/// session (spec §3 invariant 2).
#[derive(Debug, Default)]
pub struct PridAllocator {
    next: u32,
}

impl PridAllocator {
    pub fn new() -> Self {
        PridAllocator { next: 0 }
    }

    /// High-water mark: the largest PRID minted so far (0 if none).
    pub fn high_water(&self) -> u32 {
        self.next
    }

    pub fn alloc(&mut self) -> Prid {
        self.next += 1;
        Prid(NonZeroU32::new(self.next).expect("prid counter overflowed"))
    }
}
