//! Core domain model and contracts for Scriv.
//!
//! Everything in this crate is pure: message and document types, the
//! pairing-invariant validator, the budgeted history trimmer, and the
//! conflict-guarded merge decision. IO lives in `scriv-adapters`; the
//! repair engine and turn consumer live in `scriv-engine`.

pub mod document;
pub mod error;
pub mod message;
pub mod pairing;
pub mod tools;
pub mod trim;

pub use message::{ArgPayload, InvocationStatus, Message, RepairOutcome, Role, ToolInvocation};
