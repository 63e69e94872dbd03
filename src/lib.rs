//! Probe provider and trampoline subsystem for a dynamic tracing toolkit.
//!
//! This crate is the CORE described by the host toolkit's design: the
//! provider registry, the overlying/underlying probe graph, the tracepoint
//! backend, the trampoline generator, the in-VM built-in runtime, and the
//! discovery loop. The script parser/typechecker/codegen, the CLI, and the
//! out-of-process DOF parser are external collaborators this crate only
//! consumes the interfaces of.
//!
//! # Quick start
//!
//! ```no_run
//! use dtrace_core::config::SessionConfig;
//! use dtrace_core::providers::rawfbt::RawfbtProvider;
//! use dtrace_core::session::Session;
//!
//! let mut session = Session::new(SessionConfig::default());
//! session
//!     .register_provider(Box::new(RawfbtProvider::new("/sys/kernel/debug/tracing/available_filter_functions")))
//!     .unwrap();
//! session.start().unwrap();
//! ```

pub mod backend;
pub mod bvar;
pub mod config;
pub mod desc;
pub mod discovery;
pub mod dof;
pub mod error;
pub mod graph;
pub mod maps;
pub mod platform;
pub mod provider;
pub mod providers;
pub mod session;
pub mod trampoline;
pub mod vm;

pub use config::SessionConfig;
pub use desc::{Prid, ProbeDesc};
pub use error::{Error, ErrorKind, Result};
pub use session::Session;
