//! Post-mortem introspection for a tracing JIT runtime.
//!
//! The runtime writes an audit log — a msgpack record stream of JIT
//! decisions alongside raw images of its internal structures and an
//! embedded DWARF blob that gives those images meaning — plus VM-profile
//! counter files. This crate replays an audit log into a queryable model
//! (events, prototypes, traces, decoded bytecode and IR) and aggregates,
//! deltas, and ranks VM profiles.

pub mod auditlog;
pub mod bytecode;
pub mod errors;
pub mod ir;
pub mod msgpack;
pub mod vmprofile;

pub use auditlog::{load_auditlog, AuditModel, Event, EventPayload, LineInfo, Prototype, Snapshot,
    Trace, TraceAbort, TraceView};
pub use errors::{ModelError, MsgpackError, ProfileError, Result};
pub use vmprofile::{HotTrace, VmProfile};
