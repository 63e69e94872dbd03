//! Concrete provider implementations.
//!
//! One file per family, matching the original source's layout of one
//! `dt_provimpl_t` (or a small cluster of closely related ones) per file.

pub mod dtrace;
pub mod rawfbt;
pub mod uprobe;
