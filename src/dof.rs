//! Reader for the DOF-parsed wire format consumed from the out-of-process
//! DOF parser (spec §1, §6): a length-prefixed stream of self-describing
//! records grouped by the grammar
//!
//! ```text
//! stream := (PROVIDER provider-body
//!             (PROBE probe-body
//!               [ARGS_NATIVE] [ARGS_XLAT] [ARGS_MAP]
//!               TRACEPOINT+)+)+
//!         | ERR
//! ```
//!
//! The core only consumes this already-parsed stream; it never talks to
//! target-process memory or DOF headers itself (spec §1 "deliberately out
//! of scope").

use std::io::{self, Read};

use crate::error::{Error, ErrorKind, Result};

/// One record of the wire format (spec §6).
#[derive(Debug, Clone, PartialEq)]
pub enum DofRecord {
    Provider { nprobes: u32, name: String },
    Probe { ntp: u32, nargc: u32, xargc: u32, module: String, function: String, name: String },
    Tracepoint { addr: u64, is_enabled: bool },
    ArgsNative(Vec<String>),
    ArgsXlat(Vec<String>),
    ArgsMap(Vec<i8>),
    Err { errno: i32, message: String },
}

const T_PROVIDER: u8 = 0;
const T_PROBE: u8 = 1;
const T_TRACEPOINT: u8 = 2;
const T_ARGS_NATIVE: u8 = 3;
const T_ARGS_XLAT: u8 = 4;
const T_ARGS_MAP: u8 = 5;
const T_ERR: u8 = 6;

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Splits a `\0`-separated blob into its component strings, dropping a
/// trailing empty segment left by the final terminator.
fn split_nul(blob: &[u8]) -> Vec<String> {
    let mut parts: Vec<String> = blob
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    if parts.last().map(String::is_empty).unwrap_or(false) {
        parts.pop();
    }
    parts
}

/// Reads one record, or `None` at a clean end-of-stream.
pub fn read_record<R: Read>(r: &mut R) -> Result<Option<DofRecord>> {
    let size = match read_u32(r) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::from(e)),
    };
    let mut rtype_buf = [0u8; 1];
    r.read_exact(&mut rtype_buf).map_err(Error::from)?;
    let rtype = rtype_buf[0];

    let mut payload = vec![0u8; size as usize];
    r.read_exact(&mut payload).map_err(Error::from)?;
    let mut cur = io::Cursor::new(payload);

    let record = match rtype {
        T_PROVIDER => {
            let nprobes = read_u32(&mut cur).map_err(Error::from)?;
            let mut name_bytes = Vec::new();
            cur.read_to_end(&mut name_bytes).map_err(Error::from)?;
            let name = String::from_utf8_lossy(&name_bytes).trim_end_matches('\0').to_string();
            DofRecord::Provider { nprobes, name }
        }
        T_PROBE => {
            let ntp = read_u32(&mut cur).map_err(Error::from)?;
            let nargc = read_u32(&mut cur).map_err(Error::from)?;
            let xargc = read_u32(&mut cur).map_err(Error::from)?;
            let mut rest = Vec::new();
            cur.read_to_end(&mut rest).map_err(Error::from)?;
            let fields = split_nul(&rest);
            if fields.len() != 3 {
                return Err(Error::with_message(ErrorKind::BadDof, "PROBE record missing module/function/name"));
            }
            DofRecord::Probe {
                ntp,
                nargc,
                xargc,
                module: fields[0].clone(),
                function: fields[1].clone(),
                name: fields[2].clone(),
            }
        }
        T_TRACEPOINT => {
            let addr = read_u64(&mut cur).map_err(Error::from)?;
            let mut flag = [0u8; 1];
            cur.read_exact(&mut flag).map_err(Error::from)?;
            DofRecord::Tracepoint { addr, is_enabled: flag[0] != 0 }
        }
        T_ARGS_NATIVE => {
            let mut rest = Vec::new();
            cur.read_to_end(&mut rest).map_err(Error::from)?;
            DofRecord::ArgsNative(split_nul(&rest))
        }
        T_ARGS_XLAT => {
            let mut rest = Vec::new();
            cur.read_to_end(&mut rest).map_err(Error::from)?;
            DofRecord::ArgsXlat(split_nul(&rest))
        }
        T_ARGS_MAP => {
            let mut rest = Vec::new();
            cur.read_to_end(&mut rest).map_err(Error::from)?;
            DofRecord::ArgsMap(rest.into_iter().map(|b| b as i8).collect())
        }
        T_ERR => {
            let errno = read_u32(&mut cur).map_err(Error::from)? as i32;
            let mut rest = Vec::new();
            cur.read_to_end(&mut rest).map_err(Error::from)?;
            DofRecord::Err { errno, message: String::from_utf8_lossy(&rest).into_owned() }
        }
        other => return Err(Error::with_message(ErrorKind::BadDof, format!("unknown record type {other}"))),
    };
    Ok(Some(record))
}

/// Reads records until a clean EOF or an `ERR` record (inclusive), per the
/// stream grammar (spec §6).
pub fn read_stream<R: Read>(r: &mut R) -> Result<Vec<DofRecord>> {
    let mut records = Vec::new();
    while let Some(record) = read_record(r)? {
        let is_err = matches!(record, DofRecord::Err { .. });
        records.push(record);
        if is_err {
            break;
        }
    }
    Ok(records)
}

/// A structured probe parsed out of one `PROBE ... TRACEPOINT+` group,
/// ready to hand to [`crate::providers::uprobe::provide_usdt_probe`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedProbe {
    pub module: String,
    pub function: String,
    pub name: String,
    pub native_argv: Vec<String>,
    pub xlated_argv: Vec<String>,
    pub arg_map: Vec<i8>,
    pub tracepoints: Vec<(u64, bool)>,
}

/// A structured provider: its name and the probes it declared.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedProvider {
    pub name: String,
    pub probes: Vec<ParsedProbe>,
}

/// Groups a flat record list into the `PROVIDER(PROBE(TRACEPOINT+)+)+`
/// shape the grammar describes. Stops (without error) at the first `ERR`
/// record or once records are exhausted.
pub fn group_providers(records: &[DofRecord]) -> Result<Vec<ParsedProvider>> {
    let mut providers = Vec::new();
    let mut iter = records.iter().peekable();

    while let Some(record) = iter.next() {
        let DofRecord::Provider { name, .. } = record else {
            if matches!(record, DofRecord::Err { .. }) {
                break;
            }
            return Err(Error::with_message(ErrorKind::BadDof, "expected PROVIDER record"));
        };
        let mut provider = ParsedProvider { name: name.clone(), probes: Vec::new() };

        while let Some(DofRecord::Probe { module, function, name, .. }) = iter.peek() {
            let (module, function, name) = (module.clone(), function.clone(), name.clone());
            iter.next();

            let mut native_argv = Vec::new();
            let mut xlated_argv = Vec::new();
            let mut arg_map = Vec::new();
            if let Some(DofRecord::ArgsNative(v)) = iter.peek() {
                native_argv = v.clone();
                iter.next();
            }
            if let Some(DofRecord::ArgsXlat(v)) = iter.peek() {
                xlated_argv = v.clone();
                iter.next();
            }
            if let Some(DofRecord::ArgsMap(v)) = iter.peek() {
                arg_map = v.clone();
                iter.next();
            }

            let mut tracepoints = Vec::new();
            while let Some(DofRecord::Tracepoint { addr, is_enabled }) = iter.peek() {
                tracepoints.push((*addr, *is_enabled));
                iter.next();
            }
            if tracepoints.is_empty() {
                return Err(Error::with_message(ErrorKind::BadDof, "PROBE record with no TRACEPOINT"));
            }

            provider.probes.push(ParsedProbe { module, function, name, native_argv, xlated_argv, arg_map, tracepoints });
        }
        providers.push(provider);
    }
    Ok(providers)
}
